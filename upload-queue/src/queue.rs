use crate::blob_cache::{self, BlobCache};
use crate::config::QueueConfig;
use crate::connectivity::Connectivity;
use crate::error::{QueueError, QueueResult};
use crate::models::{
    new_upload_id, BatchStatus, BatchUploadStatus, BlobKey, NewPhotoUpload, PendingUploads,
    QueueStatus, RecordTask, SlotCoords, TaskStatus, UploadTask, MAX_PHOTOS_PER_LINE,
};
use crate::status::StatusBroadcaster;
use crate::store::{from_millis, to_millis, DurableStore};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Notify;

const TASK_COLUMNS: &str = "upload_id, batch_local_id, batch_id, parent_doc_id, line_index, photo_index,
    filename, status, retries, last_error, created_at, updated_at, last_retry_at, next_attempt_at,
    completed_at";

const RECORD_COLUMNS: &str = "upload_id, collection, doc_id, payload, status, retries, last_error,
    created_at, updated_at, next_attempt_at";

/// Owner expression matching `UploadTask::blob_key`
const TASK_OWNER: &str = "COALESCE(batch_local_id, batch_id)";

/// Durable queue of photo upload tasks and record upsert tasks.
///
/// Every transition is an `UPDATE` keyed by task id, so a task deleted by a
/// racing drain is never brought back, and every delete of an absent id is
/// a successful no-op.
#[derive(Clone)]
pub struct UploadQueue {
    store: DurableStore,
    blobs: BlobCache,
    config: Arc<QueueConfig>,
    status: StatusBroadcaster,
    connectivity: Connectivity,
    drain_trigger: Arc<Notify>,
}

impl UploadQueue {
    pub fn new(
        blobs: BlobCache,
        config: Arc<QueueConfig>,
        status: StatusBroadcaster,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            store: blobs.store().clone(),
            blobs,
            config,
            status,
            connectivity,
            drain_trigger: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn blobs(&self) -> &BlobCache {
        &self.blobs
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn status(&self) -> &StatusBroadcaster {
        &self.status
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Notified whenever new work is queued while online
    pub fn drain_trigger(&self) -> Arc<Notify> {
        self.drain_trigger.clone()
    }

    fn request_drain(&self) {
        if self.connectivity.is_online() {
            self.drain_trigger.notify_one();
        }
    }

    // ---------------------------------------------------------------------
    // Photo tasks
    // ---------------------------------------------------------------------

    /// Queues one photo for upload and returns the task id.
    ///
    /// The task row and its payload are written in one transaction. Without
    /// a payload in `upload.photo`, the payload must already be cached.
    pub fn enqueue(&self, upload: NewPhotoUpload) -> QueueResult<String> {
        let owner = upload
            .batch_local_id
            .clone()
            .or_else(|| upload.batch_id.clone())
            .filter(|o| !o.is_empty())
            .ok_or_else(|| {
                QueueError::Validation("upload needs a local id or a batch id".to_string())
            })?;
        if upload.slot.photo >= MAX_PHOTOS_PER_LINE {
            return Err(QueueError::Validation(format!(
                "photo index {} exceeds the per-line maximum of {}",
                upload.slot.photo, MAX_PHOTOS_PER_LINE
            )));
        }
        if upload.filename.trim().is_empty() {
            return Err(QueueError::Validation("upload needs a target path".to_string()));
        }

        if upload.photo.is_some() {
            self.blobs.elevate();
        }

        let upload_id = new_upload_id("upload");
        let key = BlobKey::new(owner, upload.slot);
        let now = Utc::now();

        self.store.with_tx(|tx| {
            match &upload.photo {
                Some(data) => blob_cache::save_blob_on(tx, &key, data, now)?,
                None => {
                    if !blob_cache::blob_exists_on(tx, &key)? {
                        return Err(QueueError::NotFound(format!(
                            "no cached photo {}",
                            key.blob_id()
                        )));
                    }
                }
            }
            tx.execute(
                "INSERT INTO upload_queue (upload_id, batch_local_id, batch_id, parent_doc_id,
                    line_index, photo_index, filename, status, retries, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?8, ?8)",
                params![
                    upload_id,
                    upload.batch_local_id,
                    upload.batch_id,
                    upload.parent_doc_id,
                    upload.slot.line as i64,
                    upload.slot.photo as i64,
                    upload.filename,
                    to_millis(now),
                ],
            )?;
            Ok(())
        })?;

        log::info!(
            "Queued photo {} for {} -> {}",
            upload_id,
            key.blob_id(),
            upload.filename
        );
        self.request_drain();
        self.status.refresh();
        Ok(upload_id)
    }

    pub fn get(&self, upload_id: &str) -> QueueResult<Option<UploadTask>> {
        self.store.with_conn(|conn| get_task_on(conn, upload_id))
    }

    pub fn list_by_status(&self, status: TaskStatus) -> QueueResult<Vec<UploadTask>> {
        self.tasks_where("status = ?1", status.as_str())
    }

    /// Tasks whose owner is the given local id or remote batch id
    pub fn list_by_owner(&self, owner: &str) -> QueueResult<Vec<UploadTask>> {
        self.tasks_where("(batch_local_id = ?1 OR batch_id = ?1)", owner)
    }

    pub fn all_tasks(&self) -> QueueResult<Vec<UploadTask>> {
        self.store.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM upload_queue ORDER BY created_at, upload_id",
                TASK_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map([], row_to_task)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    fn tasks_where(&self, clause: &str, value: &str) -> QueueResult<Vec<UploadTask>> {
        self.store.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM upload_queue WHERE {} ORDER BY created_at, upload_id",
                TASK_COLUMNS, clause
            );
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map(params![value], row_to_task)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    /// Claims a pending task for this drain. Returns false when another
    /// drain claimed or removed it first.
    pub fn mark_uploading(&self, upload_id: &str) -> QueueResult<bool> {
        let now = to_millis(Utc::now());
        let claimed = self.store.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE upload_queue SET status = 'uploading', updated_at = ?2
                 WHERE upload_id = ?1 AND status = 'pending'",
                params![upload_id, now],
            )? > 0)
        })?;
        if claimed {
            log::debug!("Task {} uploading", upload_id);
        } else {
            log::debug!("Task {} already claimed or gone", upload_id);
        }
        Ok(claimed)
    }

    /// Marks the task completed, then deletes it together with its payload.
    /// Completing a task that is already gone is a no-op.
    pub fn mark_completed(&self, task: &UploadTask) -> QueueResult<()> {
        let key = task.blob_key();
        let now = to_millis(Utc::now());
        let existed = self.store.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE upload_queue SET status = 'completed', completed_at = ?2, updated_at = ?2,
                    last_error = NULL
                 WHERE upload_id = ?1",
                params![task.upload_id, now],
            )?;
            blob_cache::delete_blob_on(tx, &key)?;
            tx.execute(
                "DELETE FROM upload_queue WHERE upload_id = ?1",
                params![task.upload_id],
            )?;
            Ok(updated > 0)
        })?;
        if existed {
            log::info!("Task {} completed", task.upload_id);
        } else {
            log::debug!("Task {} was already removed by another drain", task.upload_id);
        }
        Ok(())
    }

    /// Records a retryable failure. Below the retry bound the task goes back
    /// to `pending`; at the bound it becomes `failed` and its payload is
    /// purged. Returns the new status, or `None` when the task is gone.
    pub fn mark_failed_retry(
        &self,
        upload_id: &str,
        error: &str,
    ) -> QueueResult<Option<TaskStatus>> {
        let now = Utc::now();
        let max = self.config.max_retries;
        let outcome = self.store.with_tx(|tx| {
            let task = match get_task_on(tx, upload_id)? {
                Some(t) => t,
                None => return Ok(None),
            };
            let retries = (task.retries + 1).min(max.max(1));
            let (status, next_attempt) = if retries >= max {
                blob_cache::delete_blob_on(tx, &task.blob_key())?;
                (TaskStatus::Failed, None)
            } else {
                (
                    TaskStatus::Pending,
                    self.config.backoff_after(retries).map(|d| now + d),
                )
            };
            tx.execute(
                "UPDATE upload_queue SET status = ?2, retries = ?3, last_error = ?4,
                    last_retry_at = ?5, updated_at = ?5, next_attempt_at = ?6
                 WHERE upload_id = ?1",
                params![
                    upload_id,
                    status.as_str(),
                    retries,
                    error,
                    to_millis(now),
                    next_attempt.map(to_millis),
                ],
            )?;
            Ok(Some((status, retries)))
        })?;

        match outcome {
            Some((TaskStatus::Failed, retries)) => {
                log::warn!(
                    "Task {} failed permanently after {} attempts, photo dropped: {}",
                    upload_id,
                    retries,
                    error
                );
            }
            Some((status, retries)) => {
                log::debug!(
                    "Task {} attempt {}/{} failed, back to {}: {}",
                    upload_id,
                    retries,
                    max,
                    status,
                    error
                );
            }
            None => log::debug!("Task {} gone before failure could be recorded", upload_id),
        }
        Ok(outcome.map(|(status, _)| status))
    }

    /// Forces `uploading` tasks older than the staleness window back to
    /// `pending`, for both task kinds. Returns how many were reset.
    pub fn reset_stuck(&self) -> QueueResult<usize> {
        let now = Utc::now();
        let cutoff = to_millis(now - self.config.stale_after());
        let n = self.store.with_conn(|conn| {
            let photos = conn.execute(
                "UPDATE upload_queue SET status = 'pending', updated_at = ?2
                 WHERE status = 'uploading' AND updated_at < ?1",
                params![cutoff, to_millis(now)],
            )?;
            let records = conn.execute(
                "UPDATE record_queue SET status = 'pending', updated_at = ?2
                 WHERE status = 'uploading' AND updated_at < ?1",
                params![cutoff, to_millis(now)],
            )?;
            Ok(photos + records)
        })?;
        if n > 0 {
            log::info!("Reset {} stale uploading task(s) to pending", n);
        }
        Ok(n)
    }

    /// Deletes a task row; absent ids succeed with `false`
    pub fn delete_task(&self, upload_id: &str) -> QueueResult<bool> {
        self.store.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM upload_queue WHERE upload_id = ?1",
                params![upload_id],
            )? > 0)
        })
    }

    /// Deletes a task and its payload
    pub fn purge(&self, task: &UploadTask) -> QueueResult<()> {
        let key = task.blob_key();
        self.store.with_tx(|tx| {
            blob_cache::delete_blob_on(tx, &key)?;
            tx.execute(
                "DELETE FROM upload_queue WHERE upload_id = ?1",
                params![task.upload_id],
            )?;
            Ok(())
        })
    }

    /// Records the resolved parent id so later attempts skip the query
    pub fn set_parent_doc_id(&self, upload_id: &str, parent_doc_id: &str) -> QueueResult<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE upload_queue SET parent_doc_id = ?2 WHERE upload_id = ?1",
                params![upload_id, parent_doc_id],
            )?;
            Ok(())
        })
    }

    /// Gives tasks queued before submission their remote batch id
    pub fn assign_batch_id(&self, local_id: &str, batch_id: &str) -> QueueResult<usize> {
        self.store.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE upload_queue SET batch_id = ?2
                 WHERE batch_local_id = ?1 AND batch_id IS NULL",
                params![local_id, batch_id],
            )?)
        })
    }

    // ---------------------------------------------------------------------
    // Record tasks
    // ---------------------------------------------------------------------

    /// Queues a create-or-merge of a whole record in `collection`
    pub fn enqueue_record(
        &self,
        collection: &str,
        doc_id: Option<&str>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> QueueResult<String> {
        if collection.trim().is_empty() {
            return Err(QueueError::Validation("record needs a collection".to_string()));
        }
        let upload_id = new_upload_id("record");
        let body = serde_json::to_string(&payload)?;
        let now = to_millis(Utc::now());
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO record_queue (upload_id, collection, doc_id, payload, status, retries,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
                params![upload_id, collection, doc_id, body, now],
            )?;
            Ok(())
        })?;
        log::info!("Queued {} record {}", collection, upload_id);
        self.request_drain();
        self.status.refresh();
        Ok(upload_id)
    }

    pub fn get_record(&self, upload_id: &str) -> QueueResult<Option<RecordTask>> {
        self.store.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM record_queue WHERE upload_id = ?1",
                RECORD_COLUMNS
            );
            Ok(conn
                .query_row(&sql, params![upload_id], row_to_record)
                .optional()?)
        })
    }

    pub fn list_records_by_status(&self, status: TaskStatus) -> QueueResult<Vec<RecordTask>> {
        self.store.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM record_queue WHERE status = ?1 ORDER BY created_at, upload_id",
                RECORD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map(params![status.as_str()], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    pub fn mark_record_uploading(&self, upload_id: &str) -> QueueResult<bool> {
        let now = to_millis(Utc::now());
        self.store.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE record_queue SET status = 'uploading', updated_at = ?2
                 WHERE upload_id = ?1 AND status = 'pending'",
                params![upload_id, now],
            )? > 0)
        })
    }

    /// Deletes a finished record task; absent ids are a no-op
    pub fn mark_record_completed(&self, upload_id: &str) -> QueueResult<()> {
        self.delete_record_task(upload_id)?;
        log::info!("Record task {} completed", upload_id);
        Ok(())
    }

    pub fn delete_record_task(&self, upload_id: &str) -> QueueResult<bool> {
        self.store.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM record_queue WHERE upload_id = ?1",
                params![upload_id],
            )? > 0)
        })
    }

    pub fn mark_record_failed_retry(
        &self,
        upload_id: &str,
        error: &str,
    ) -> QueueResult<Option<TaskStatus>> {
        let now = Utc::now();
        let max = self.config.max_retries;
        let outcome = self.store.with_conn(|conn| {
            let retries: Option<u32> = conn
                .query_row(
                    "SELECT retries FROM record_queue WHERE upload_id = ?1",
                    params![upload_id],
                    |row| row.get(0),
                )
                .optional()?;
            let retries = match retries {
                Some(r) => (r + 1).min(max.max(1)),
                None => return Ok(None),
            };
            let (status, next_attempt) = if retries >= max {
                (TaskStatus::Failed, None)
            } else {
                (
                    TaskStatus::Pending,
                    self.config.backoff_after(retries).map(|d| now + d),
                )
            };
            conn.execute(
                "UPDATE record_queue SET status = ?2, retries = ?3, last_error = ?4,
                    updated_at = ?5, next_attempt_at = ?6
                 WHERE upload_id = ?1",
                params![
                    upload_id,
                    status.as_str(),
                    retries,
                    error,
                    to_millis(now),
                    next_attempt.map(to_millis),
                ],
            )?;
            Ok(Some(status))
        })?;
        if outcome == Some(TaskStatus::Failed) {
            log::warn!("Record task {} failed permanently: {}", upload_id, error);
        }
        Ok(outcome)
    }

    // ---------------------------------------------------------------------
    // Aggregates and maintenance
    // ---------------------------------------------------------------------

    pub fn counts(&self) -> QueueResult<QueueStatus> {
        self.store.with_conn(queue_counts_on)
    }

    /// Pending or in-flight photo tasks of a batch (remote id or local id)
    pub fn pending_for_batch(&self, batch: &str) -> QueueResult<PendingUploads> {
        let count: i64 = self.store.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM upload_queue
                 WHERE (batch_id = ?1 OR batch_local_id = ?1)
                   AND status IN ('pending', 'uploading')",
                params![batch],
                |row| row.get(0),
            )?)
        })?;
        Ok(PendingUploads {
            has_pending: count > 0,
            count: count as usize,
        })
    }

    pub fn batch_status(&self, batch: &str) -> QueueResult<BatchUploadStatus> {
        let mut out = BatchUploadStatus::default();
        for task in self.list_by_owner(batch)? {
            match task.status {
                TaskStatus::Pending => out.pending += 1,
                TaskStatus::Uploading => out.uploading += 1,
                TaskStatus::Completed => out.completed += 1,
                TaskStatus::Failed => out.failed += 1,
            }
            out.total += 1;
        }
        Ok(out)
    }

    /// Deletes failed tasks, tasks stuck uploading past the staleness window
    /// and tasks at the retry bound, with their payloads. Returns how many
    /// tasks were removed.
    pub fn clear_stuck(&self) -> QueueResult<usize> {
        let now = Utc::now();
        let stale_after = self.config.stale_after();
        let max = self.config.max_retries;
        let doomed: Vec<UploadTask> = self
            .all_tasks()?
            .into_iter()
            .filter(|t| {
                t.status == TaskStatus::Failed || t.is_stale(now, stale_after) || t.retries >= max
            })
            .collect();
        for task in &doomed {
            self.purge(task)?;
        }
        let records = self.store.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM record_queue
                 WHERE status = 'failed' OR retries >= ?1
                    OR (status = 'uploading' AND updated_at < ?2)",
                params![max, to_millis(now - stale_after)],
            )?)
        })?;
        let total = doomed.len() + records;
        if total > 0 {
            log::info!("Cleared {} stuck task(s)", total);
        }
        self.status.refresh();
        Ok(total)
    }

    /// Forces every `uploading` task back to `pending`, regardless of age
    pub fn reset_all_uploading(&self) -> QueueResult<usize> {
        let now = to_millis(Utc::now());
        let n = self.store.with_conn(|conn| {
            let photos = conn.execute(
                "UPDATE upload_queue SET status = 'pending', updated_at = ?1
                 WHERE status = 'uploading'",
                params![now],
            )?;
            let records = conn.execute(
                "UPDATE record_queue SET status = 'pending', updated_at = ?1
                 WHERE status = 'uploading'",
                params![now],
            )?;
            Ok(photos + records)
        })?;
        log::info!("Reset {} uploading task(s) to pending", n);
        self.status.refresh();
        Ok(n)
    }

    /// Deletes every task of a batch with its payloads
    pub fn cleanup_batch(&self, batch: &str) -> QueueResult<usize> {
        let tasks = self.list_by_owner(batch)?;
        for task in &tasks {
            self.purge(task)?;
        }
        if !tasks.is_empty() {
            log::info!("Removed {} task(s) of batch {}", tasks.len(), batch);
        }
        self.status.refresh();
        Ok(tasks.len())
    }

    /// Deletes every task of both kinds and every payload a task referenced
    pub fn clear_all(&self) -> QueueResult<usize> {
        let tasks = self.all_tasks()?;
        for task in &tasks {
            self.purge(task)?;
        }
        let records = self
            .store
            .with_conn(|conn| Ok(conn.execute("DELETE FROM record_queue", [])?))?;
        log::info!("Cleared {} task(s)", tasks.len() + records);
        self.status.refresh();
        Ok(tasks.len() + records)
    }

    /// Removes payloads no task references and no draft still holds as an
    /// unsynced capture
    pub fn purge_orphan_blobs(&self) -> QueueResult<usize> {
        let mut removed = 0;
        for key in self.blobs.all_keys()? {
            let referenced = self.store.with_conn(|conn| {
                let sql = format!(
                    "SELECT COUNT(*) FROM upload_queue
                     WHERE {} = ?1 AND line_index = ?2 AND photo_index = ?3",
                    TASK_OWNER
                );
                let n: i64 = conn.query_row(
                    &sql,
                    params![key.owner, key.slot.line as i64, key.slot.photo as i64],
                    |row| row.get(0),
                )?;
                Ok(n > 0)
            })?;
            if referenced {
                continue;
            }
            let held_by_draft = self
                .store
                .get_draft(&key.owner)?
                .and_then(|d| {
                    d.lines
                        .get(key.slot.line)
                        .and_then(|l| l.photos.get(key.slot.photo))
                        .map(|p| p.is_unsynced())
                })
                .unwrap_or(false);
            if held_by_draft {
                continue;
            }
            if self.blobs.delete_photo_blob(&key.owner, key.slot)? {
                removed += 1;
            }
        }
        if removed > 0 {
            log::info!("Purged {} orphaned photo payload(s)", removed);
        }
        Ok(removed)
    }

    /// Deletes a submitted draft once none of its photo tasks remain active
    pub fn release_submitted_draft(&self, local_id: &str) -> QueueResult<bool> {
        let draft = match self.store.get_draft(local_id)? {
            Some(d) => d,
            None => return Ok(false),
        };
        if draft.status != BatchStatus::Submitted {
            return Ok(false);
        }
        if self.pending_for_batch(local_id)?.has_pending {
            return Ok(false);
        }
        self.store.delete_draft(local_id)?;
        self.blobs.delete_blobs_for_owner(local_id)?;
        log::info!("Submitted draft {} fully synced, removed", local_id);
        Ok(true)
    }

    /// Removes every task of a draft, used when the draft is discarded
    pub(crate) fn delete_tasks_for_owner(&self, owner: &str) -> QueueResult<usize> {
        self.store.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM upload_queue WHERE batch_local_id = ?1",
                params![owner],
            )?)
        })
    }
}

pub(crate) fn queue_counts_on(conn: &Connection) -> QueueResult<QueueStatus> {
    let mut status = QueueStatus::default();
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM upload_queue GROUP BY status")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (s, n) in rows {
        match s.parse::<TaskStatus>() {
            Ok(TaskStatus::Pending) => status.pending_photos = n as usize,
            Ok(TaskStatus::Uploading) => status.uploading_photos = n as usize,
            Ok(TaskStatus::Failed) => status.failed_photos = n as usize,
            _ => {}
        }
    }
    let records: i64 = conn.query_row(
        "SELECT COUNT(*) FROM record_queue WHERE status IN ('pending', 'uploading')",
        [],
        |row| row.get(0),
    )?;
    status.pending_record_submissions = records as usize;
    Ok(status)
}

fn get_task_on(conn: &Connection, upload_id: &str) -> QueueResult<Option<UploadTask>> {
    let sql = format!("SELECT {} FROM upload_queue WHERE upload_id = ?1", TASK_COLUMNS);
    Ok(conn
        .query_row(&sql, params![upload_id], row_to_task)
        .optional()?)
}

fn parse_status(idx: usize, s: String) -> rusqlite::Result<TaskStatus> {
    s.parse::<TaskStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(QueueError::Other(e)),
        )
    })
}

fn opt_time(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<UploadTask> {
    Ok(UploadTask {
        upload_id: row.get(0)?,
        batch_local_id: row.get(1)?,
        batch_id: row.get(2)?,
        parent_doc_id: row.get(3)?,
        slot: SlotCoords::new(row.get::<_, i64>(4)? as usize, row.get::<_, i64>(5)? as usize),
        filename: row.get(6)?,
        status: parse_status(7, row.get(7)?)?,
        retries: row.get(8)?,
        last_error: row.get(9)?,
        created_at: from_millis(row.get(10)?),
        updated_at: from_millis(row.get(11)?),
        last_retry_at: opt_time(row.get(12)?),
        next_attempt_at: opt_time(row.get(13)?),
        completed_at: opt_time(row.get(14)?),
    })
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<RecordTask> {
    let payload: String = row.get(3)?;
    let payload = serde_json::from_str(&payload).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(RecordTask {
        upload_id: row.get(0)?,
        collection: row.get(1)?,
        doc_id: row.get(2)?,
        payload,
        status: parse_status(4, row.get(4)?)?,
        retries: row.get(5)?,
        last_error: row.get(6)?,
        created_at: from_millis(row.get(7)?),
        updated_at: from_millis(row.get(8)?),
        next_attempt_at: opt_time(row.get(9)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{photo_upload, test_queue};

    #[test]
    fn test_enqueue_persists_task_and_blob() {
        let queue = test_queue(QueueConfig::default());
        let id = queue
            .enqueue(photo_upload("local_a", 2, 0, Some("jpeg")))
            .unwrap();
        assert!(id.starts_with("upload_"));

        let task = queue.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 0);
        assert!(queue
            .blobs()
            .get_photo_blob("local_a", SlotCoords::new(2, 0))
            .unwrap()
            .is_some());
        assert_eq!(queue.status().current().pending_photos, 1);
    }

    #[test]
    fn test_enqueue_without_cached_blob_is_rejected() {
        let queue = test_queue(QueueConfig::default());
        let err = queue.enqueue(photo_upload("local_a", 0, 0, None)).unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
        assert!(queue.all_tasks().unwrap().is_empty());

        queue
            .blobs()
            .save_photo_blob("local_a", SlotCoords::new(0, 0), b"x")
            .unwrap();
        assert!(queue.enqueue(photo_upload("local_a", 0, 0, None)).is_ok());
    }

    #[test]
    fn test_enqueue_validation() {
        let queue = test_queue(QueueConfig::default());
        let mut upload = photo_upload("local_a", 0, MAX_PHOTOS_PER_LINE, Some("x"));
        assert!(queue.enqueue(upload.clone()).is_err());
        upload.slot.photo = 0;
        upload.batch_local_id = None;
        upload.batch_id = None;
        assert!(queue.enqueue(upload).is_err());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let queue = test_queue(QueueConfig::default());
        let id = queue
            .enqueue(photo_upload("local_a", 0, 0, Some("x")))
            .unwrap();
        assert!(queue.mark_uploading(&id).unwrap());
        assert!(!queue.mark_uploading(&id).unwrap());
        assert!(!queue.mark_uploading("upload_missing").unwrap());
    }

    #[test]
    fn test_complete_deletes_task_and_blob_idempotently() {
        let queue = test_queue(QueueConfig::default());
        let id = queue
            .enqueue(photo_upload("local_a", 1, 1, Some("x")))
            .unwrap();
        let task = queue.get(&id).unwrap().unwrap();
        queue.mark_completed(&task).unwrap();
        assert!(queue.get(&id).unwrap().is_none());
        assert!(queue.blobs().all_keys().unwrap().is_empty());

        queue.mark_completed(&task).unwrap();
        assert!(!queue.delete_task(&id).unwrap());
        queue.purge(&task).unwrap();
    }

    #[test]
    fn test_retries_bounded_and_failed_purges_blob() {
        let queue = test_queue(QueueConfig::default());
        let id = queue
            .enqueue(photo_upload("local_a", 0, 0, Some("x")))
            .unwrap();
        for attempt in 1..=4 {
            assert_eq!(
                queue.mark_failed_retry(&id, "timeout").unwrap(),
                Some(TaskStatus::Pending)
            );
            let task = queue.get(&id).unwrap().unwrap();
            assert_eq!(task.retries, attempt);
            assert!(task.retries < queue.config().max_retries);
        }
        assert_eq!(
            queue.mark_failed_retry(&id, "timeout").unwrap(),
            Some(TaskStatus::Failed)
        );
        let task = queue.get(&id).unwrap().unwrap();
        assert_eq!(task.retries, 5);
        assert_eq!(task.last_error.as_deref(), Some("timeout"));
        assert!(queue.blobs().all_keys().unwrap().is_empty());

        // further failures never push the counter past the bound
        queue.mark_failed_retry(&id, "again").unwrap();
        assert_eq!(queue.get(&id).unwrap().unwrap().retries, 5);
        assert_eq!(queue.mark_failed_retry("upload_gone", "x").unwrap(), None);
        assert_eq!(queue.counts().unwrap().failed_photos, 1);
    }

    #[test]
    fn test_reset_stuck_only_touches_stale() {
        let queue = test_queue(QueueConfig::default());
        let stale = queue
            .enqueue(photo_upload("local_a", 0, 0, Some("x")))
            .unwrap();
        let fresh = queue
            .enqueue(photo_upload("local_a", 0, 1, Some("y")))
            .unwrap();
        queue.mark_uploading(&stale).unwrap();
        queue.mark_uploading(&fresh).unwrap();
        let old = to_millis(Utc::now() - chrono::Duration::minutes(6));
        queue
            .store()
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE upload_queue SET updated_at = ?2 WHERE upload_id = ?1",
                    params![stale, old],
                )?;
                Ok(())
            })
            .unwrap();

        assert_eq!(queue.reset_stuck().unwrap(), 1);
        assert_eq!(queue.get(&stale).unwrap().unwrap().status, TaskStatus::Pending);
        assert_eq!(queue.get(&fresh).unwrap().unwrap().status, TaskStatus::Uploading);

        assert_eq!(queue.reset_all_uploading().unwrap(), 1);
        assert_eq!(queue.get(&fresh).unwrap().unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_backoff_schedules_next_attempt() {
        let queue = test_queue(QueueConfig {
            backoff_base_secs: 10,
            ..Default::default()
        });
        let id = queue
            .enqueue(photo_upload("local_a", 0, 0, Some("x")))
            .unwrap();
        queue.mark_failed_retry(&id, "503").unwrap();
        let task = queue.get(&id).unwrap().unwrap();
        assert!(!task.is_due(Utc::now()));
        assert!(task.is_due(Utc::now() + chrono::Duration::seconds(11)));
    }

    #[test]
    fn test_batch_queries_and_cleanup() {
        let queue = test_queue(QueueConfig::default());
        let mut upload = photo_upload("local_a", 0, 0, Some("x"));
        upload.batch_id = Some("B1".to_string());
        let a = queue.enqueue(upload.clone()).unwrap();
        upload.slot.photo = 1;
        queue.enqueue(upload).unwrap();
        queue
            .enqueue(photo_upload("local_b", 0, 0, Some("z")))
            .unwrap();
        queue.mark_uploading(&a).unwrap();

        let pending = queue.pending_for_batch("B1").unwrap();
        assert!(pending.has_pending);
        assert_eq!(pending.count, 2);
        assert_eq!(queue.pending_for_batch("local_a").unwrap().count, 2);

        let status = queue.batch_status("B1").unwrap();
        assert_eq!((status.pending, status.uploading, status.total), (1, 1, 2));

        assert_eq!(queue.cleanup_batch("B1").unwrap(), 2);
        assert!(!queue.pending_for_batch("B1").unwrap().has_pending);
        assert_eq!(queue.blobs().all_keys().unwrap().len(), 1);
    }

    #[test]
    fn test_clear_stuck_and_clear_all() {
        let queue = test_queue(QueueConfig::default());
        let failed = queue
            .enqueue(photo_upload("local_a", 0, 0, Some("x")))
            .unwrap();
        for _ in 0..5 {
            queue.mark_failed_retry(&failed, "boom").unwrap();
        }
        let healthy = queue
            .enqueue(photo_upload("local_a", 1, 0, Some("y")))
            .unwrap();

        assert_eq!(queue.clear_stuck().unwrap(), 1);
        assert!(queue.get(&failed).unwrap().is_none());
        assert!(queue.get(&healthy).unwrap().is_some());

        queue
            .enqueue_record("waitTimes", None, serde_json::Map::new())
            .unwrap();
        assert_eq!(queue.clear_all().unwrap(), 2);
        assert!(queue.blobs().all_keys().unwrap().is_empty());
        assert_eq!(queue.counts().unwrap(), QueueStatus::default());
    }

    #[test]
    fn test_record_tasks_lifecycle() {
        let queue = test_queue(QueueConfig {
            max_retries: 2,
            ..Default::default()
        });
        let mut payload = serde_json::Map::new();
        payload.insert("minutes".to_string(), serde_json::json!(25));
        let id = queue.enqueue_record("waitTimes", Some("w1"), payload).unwrap();
        assert_eq!(queue.counts().unwrap().pending_record_submissions, 1);

        assert!(queue.mark_record_uploading(&id).unwrap());
        assert!(!queue.mark_record_uploading(&id).unwrap());
        queue.mark_record_failed_retry(&id, "offline").unwrap();
        let task = queue.get_record(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.payload["minutes"], 25);

        assert_eq!(
            queue.mark_record_failed_retry(&id, "offline").unwrap(),
            Some(TaskStatus::Failed)
        );
        assert_eq!(queue.counts().unwrap().pending_record_submissions, 0);
        queue.mark_record_completed(&id).unwrap();
        queue.mark_record_completed(&id).unwrap();
        assert!(queue.get_record(&id).unwrap().is_none());
    }

    #[test]
    fn test_purge_orphan_blobs_keeps_referenced_and_draft_held() {
        let queue = test_queue(QueueConfig::default());
        queue
            .enqueue(photo_upload("local_a", 0, 0, Some("queued")))
            .unwrap();

        let mut draft = crate::models::ExpenseBatch::new();
        draft.local_id = "local_d".to_string();
        draft.add_photo(3, crate::models::PhotoRef::Pending).unwrap();
        queue.store().put_draft(&draft).unwrap();
        queue
            .blobs()
            .save_photo_blob("local_d", SlotCoords::new(3, 0), b"held")
            .unwrap();
        queue
            .blobs()
            .save_photo_blob("local_gone", SlotCoords::new(0, 0), b"orphan")
            .unwrap();

        assert_eq!(queue.purge_orphan_blobs().unwrap(), 1);
        assert_eq!(queue.blobs().all_keys().unwrap().len(), 2);
    }

    #[test]
    fn test_release_submitted_draft() {
        let queue = test_queue(QueueConfig::default());
        let mut draft = crate::models::ExpenseBatch::new();
        draft.local_id = "local_s".to_string();
        queue.store().put_draft(&draft).unwrap();
        assert!(!queue.release_submitted_draft("local_s").unwrap());

        draft.status = BatchStatus::Submitted;
        queue.store().put_draft(&draft).unwrap();
        let id = queue
            .enqueue(photo_upload("local_s", 0, 0, Some("x")))
            .unwrap();
        assert!(!queue.release_submitted_draft("local_s").unwrap());

        queue.delete_task(&id).unwrap();
        assert!(queue.release_submitted_draft("local_s").unwrap());
        assert!(queue.store().get_draft("local_s").unwrap().is_none());
        assert!(queue.blobs().all_keys().unwrap().is_empty());
    }
}
