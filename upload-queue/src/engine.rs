use crate::drafts::DraftStore;
use crate::error::{QueueResult, TaskFailure};
use crate::models::{DrainReport, RecordTask, TaskStatus, UploadTask};
use crate::queue::UploadQueue;
use crate::remote::{
    merge_photo_url, AuthToken, PhotoStorage, RecordStore, RemoteRecord, EXPENSES_COLLECTION,
    PHOTOS_FIELD,
};
use crate::working_copy::WorkingCopy;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Result of driving one task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed,
    /// Another drain claimed or removed the task first
    Skipped,
    Failed(TaskFailure),
}

/// Clears the draining flag even if the drain future is dropped
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives queued tasks to a terminal outcome: upload the payload, resolve
/// the parent record, patch its photo list and clean up locally.
pub struct UploadEngine {
    queue: UploadQueue,
    drafts: DraftStore,
    storage: Arc<dyn PhotoStorage>,
    records: Arc<dyn RecordStore>,
    working_copy: Mutex<Option<WorkingCopy>>,
    draining: AtomicBool,
}

impl UploadEngine {
    pub fn new(
        queue: UploadQueue,
        storage: Arc<dyn PhotoStorage>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            drafts: DraftStore::new(queue.clone()),
            queue,
            storage,
            records,
            working_copy: Mutex::new(None),
            draining: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    /// Registers the record a foreground view is editing, so finished
    /// uploads are mirrored into it
    pub fn attach_working_copy(&self, working_copy: WorkingCopy) {
        if let Ok(mut guard) = self.working_copy.lock() {
            *guard = Some(working_copy);
        }
    }

    pub fn detach_working_copy(&self) {
        if let Ok(mut guard) = self.working_copy.lock() {
            *guard = None;
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// One drain cycle over everything pending right now. Never fails:
    /// per-task errors become task state and show up in the report.
    pub async fn drain(self: &Arc<Self>, auth: &AuthToken) -> DrainReport {
        if self.draining.swap(true, Ordering::SeqCst) {
            log::debug!("Drain already in progress, skipping");
            return DrainReport::default();
        }
        let _guard = DrainGuard(&self.draining);

        if let Err(e) = self.queue.reset_stuck() {
            log::error!("Failed to reset stale tasks: {}", e);
        }

        let mut report = self.drain_photos(auth).await;
        report.merge(self.drain_records(auth).await);
        self.queue.status().refresh();

        if report.total > 0 {
            log::info!(
                "Drain finished: {} processed, {} failed, {} total",
                report.processed,
                report.failed,
                report.total
            );
        }
        report
    }

    async fn drain_photos(self: &Arc<Self>, auth: &AuthToken) -> DrainReport {
        let now = Utc::now();
        let tasks: Vec<UploadTask> = match self.queue.list_by_status(TaskStatus::Pending) {
            Ok(tasks) => tasks
                .into_iter()
                .filter(|t| t.is_due(now) && t.has_remote_parent())
                .collect(),
            Err(e) => {
                log::error!("Failed to list pending tasks: {}", e);
                return DrainReport::default();
            }
        };

        let mut report = DrainReport {
            total: tasks.len(),
            ..Default::default()
        };
        if tasks.is_empty() {
            return report;
        }
        log::info!("Draining {} photo task(s)", tasks.len());

        let limit = self.queue.config().concurrent_uploads.max(1);
        let mut join_set = JoinSet::new();

        for task in tasks {
            while join_set.len() >= limit {
                if let Some(result) = join_set.join_next().await {
                    tally(&mut report, result);
                }
            }
            let engine = Arc::clone(self);
            let auth = auth.clone();
            join_set.spawn(async move { engine.process_task(task, &auth).await });
        }

        while let Some(result) = join_set.join_next().await {
            tally(&mut report, result);
        }
        report
    }

    async fn drain_records(&self, auth: &AuthToken) -> DrainReport {
        let now = Utc::now();
        let tasks: Vec<RecordTask> = match self.queue.list_records_by_status(TaskStatus::Pending) {
            Ok(tasks) => tasks.into_iter().filter(|t| t.is_due(now)).collect(),
            Err(e) => {
                log::error!("Failed to list pending records: {}", e);
                return DrainReport::default();
            }
        };
        let mut report = DrainReport {
            total: tasks.len(),
            ..Default::default()
        };
        for task in tasks {
            match self.process_record(task, auth).await {
                TaskOutcome::Completed => report.processed += 1,
                TaskOutcome::Failed(_) => report.failed += 1,
                TaskOutcome::Skipped => {}
            }
        }
        report
    }

    /// Drives one photo task. Steps run strictly in order: upload, resolve,
    /// patch, then local cleanup.
    pub async fn process_task(&self, task: UploadTask, auth: &AuthToken) -> TaskOutcome {
        let max = self.queue.config().max_retries;
        if task.retries >= max {
            log::warn!(
                "Task {} already at retry limit ({}), dropping photo",
                task.upload_id,
                task.retries
            );
            if let Err(e) = self.queue.purge(&task) {
                log::error!("Failed to purge task {}: {}", task.upload_id, e);
            }
            self.queue.status().refresh();
            return TaskOutcome::Failed(TaskFailure::RetriesExhausted);
        }

        match self.queue.mark_uploading(&task.upload_id) {
            Ok(true) => {}
            Ok(false) => return TaskOutcome::Skipped,
            Err(e) => {
                log::error!("Failed to claim task {}: {}", task.upload_id, e);
                return TaskOutcome::Skipped;
            }
        }
        self.queue.status().refresh();

        let outcome = match self.attempt(&task, auth).await {
            Ok(()) => TaskOutcome::Completed,
            Err(failure) => self.record_failure(&task, failure),
        };
        self.queue.status().refresh();
        outcome
    }

    async fn attempt(&self, task: &UploadTask, auth: &AuthToken) -> Result<(), TaskFailure> {
        let key = task.blob_key();
        let blob = self
            .queue
            .blobs()
            .get_photo_blob(&key.owner, key.slot)?
            .ok_or(TaskFailure::PhotoBlobMissing)?;

        let url = self
            .storage
            .upload(&task.filename, blob.data, auth)
            .await?;
        log::debug!("Uploaded {} -> {}", task.filename, url);

        let parent = self.resolve_parent(task, auth).await?;
        if task.parent_doc_id.as_deref() != Some(parent.id.as_str()) {
            self.queue.set_parent_doc_id(&task.upload_id, &parent.id)?;
        }

        let photos = merge_photo_url(&parent.photos(), task.slot.photo, &url);
        let mut fields = Map::new();
        fields.insert(
            PHOTOS_FIELD.to_string(),
            Value::Array(photos.into_iter().map(Value::String).collect()),
        );
        self.records
            .patch(EXPENSES_COLLECTION, &parent.id, fields, auth)
            .await?;

        self.mirror(task, &url);

        self.queue.mark_completed(task)?;
        if let Some(local_id) = &task.batch_local_id {
            self.queue.release_submitted_draft(local_id)?;
        }
        Ok(())
    }

    /// Direct lookup when the parent id is known, otherwise the batch query
    /// indexed by the task's line position
    async fn resolve_parent(
        &self,
        task: &UploadTask,
        auth: &AuthToken,
    ) -> Result<RemoteRecord, TaskFailure> {
        if let Some(id) = &task.parent_doc_id {
            return self
                .records
                .get(EXPENSES_COLLECTION, id, auth)
                .await?
                .ok_or(TaskFailure::ParentMissing);
        }
        let batch_id = task.batch_id.as_deref().ok_or(TaskFailure::ParentMissing)?;
        let mut docs = self
            .records
            .query_by_batch(EXPENSES_COLLECTION, batch_id, auth)
            .await?;
        if task.slot.line < docs.len() {
            Ok(docs.swap_remove(task.slot.line))
        } else {
            Err(TaskFailure::ParentMissing)
        }
    }

    fn mirror(&self, task: &UploadTask, url: &str) {
        let working_copy = self.working_copy.lock().ok().and_then(|g| g.clone());
        if let Some(wc) = working_copy {
            wc.apply_remote_photo(
                task.batch_local_id.as_deref(),
                task.batch_id.as_deref(),
                task.slot,
                url,
            );
        }
        if let Some(local_id) = &task.batch_local_id {
            if let Err(e) = self.drafts.apply_photo_url(local_id, task.slot, url) {
                log::warn!("Could not record uploaded photo on draft {}: {}", local_id, e);
            }
        }
    }

    fn record_failure(&self, task: &UploadTask, failure: TaskFailure) -> TaskOutcome {
        let result: QueueResult<()> = match &failure {
            TaskFailure::PhotoBlobMissing => {
                log::warn!(
                    "[{}] task {}: cached photo {} is gone",
                    failure.code(),
                    task.upload_id,
                    task.blob_key().blob_id()
                );
                self.queue.delete_task(&task.upload_id).map(|_| ())
            }
            TaskFailure::ParentMissing => {
                log::warn!(
                    "[{}] task {}: parent record not found, abandoning upload",
                    failure.code(),
                    task.upload_id
                );
                self.queue.purge(task)
            }
            _ => self
                .queue
                .mark_failed_retry(&task.upload_id, &failure.to_string())
                .map(|_| ()),
        };
        if let Err(e) = result {
            log::error!("Failed to record outcome of task {}: {}", task.upload_id, e);
        }
        TaskOutcome::Failed(failure)
    }

    async fn process_record(&self, task: RecordTask, auth: &AuthToken) -> TaskOutcome {
        if task.retries >= self.queue.config().max_retries {
            log::warn!("Record task {} already at retry limit, dropping", task.upload_id);
            if let Err(e) = self.queue.delete_record_task(&task.upload_id) {
                log::error!("Failed to drop record task {}: {}", task.upload_id, e);
            }
            return TaskOutcome::Failed(TaskFailure::RetriesExhausted);
        }
        match self.queue.mark_record_uploading(&task.upload_id) {
            Ok(true) => {}
            Ok(false) => return TaskOutcome::Skipped,
            Err(e) => {
                log::error!("Failed to claim record task {}: {}", task.upload_id, e);
                return TaskOutcome::Skipped;
            }
        }

        let result = self
            .records
            .upsert(
                &task.collection,
                task.doc_id.as_deref(),
                task.payload.clone(),
                auth,
            )
            .await;
        match result {
            Ok(id) => {
                log::debug!("Upserted {} record {}", task.collection, id);
                match self.queue.mark_record_completed(&task.upload_id) {
                    Ok(()) => TaskOutcome::Completed,
                    Err(e) => TaskOutcome::Failed(e.into()),
                }
            }
            Err(e) => {
                let failure = TaskFailure::from(e);
                if let Err(e) = self
                    .queue
                    .mark_record_failed_retry(&task.upload_id, &failure.to_string())
                {
                    log::error!("Failed to record outcome of {}: {}", task.upload_id, e);
                }
                TaskOutcome::Failed(failure)
            }
        }
    }

    /// Drains every 500 ms until the batch has no pending photo work or
    /// `timeout` elapses. Returns whether the batch finished in time.
    pub async fn wait_for_uploads(
        self: &Arc<Self>,
        batch: &str,
        auth: &AuthToken,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.queue.pending_for_batch(batch) {
                Ok(p) if !p.has_pending => return true,
                Ok(_) => {}
                Err(e) => log::error!("Failed to check batch {}: {}", batch, e),
            }
            if tokio::time::Instant::now() >= deadline {
                log::warn!("Timed out waiting for uploads of batch {}", batch);
                return false;
            }
            self.drain(auth).await;
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

fn tally(report: &mut DrainReport, result: Result<TaskOutcome, tokio::task::JoinError>) {
    match result {
        Ok(TaskOutcome::Completed) => report.processed += 1,
        Ok(TaskOutcome::Failed(_)) => report.failed += 1,
        Ok(TaskOutcome::Skipped) => {}
        Err(e) => {
            log::error!("Upload task panicked: {}", e);
            report.failed += 1;
        }
    }
}
