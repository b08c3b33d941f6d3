use crate::error::{QueueError, QueueResult};
use crate::models::{BatchStatus, ExpenseBatch, PhotoRef};
use crate::schema;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const OPEN_ATTEMPTS: u32 = 3;
const OPEN_RETRY_PAUSE: Duration = Duration::from_millis(400);

/// Crash-consistent local persistence for drafts, photo payloads and tasks.
///
/// Cloning is cheap; every clone talks to the same connection. The lock is
/// only held for the duration of a single statement or transaction and
/// never across an `.await`.
#[derive(Clone)]
pub struct DurableStore {
    conn: Arc<Mutex<Connection>>,
}

impl DurableStore {
    /// Opens (or creates) the database file and applies pending migrations.
    /// Retries when another process holds the file locked.
    pub fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| QueueError::Other(format!("Cannot create {:?}: {}", parent, e)))?;
            }
        }

        let mut attempt = 1;
        loop {
            match Self::try_open(path) {
                Ok(store) => return Ok(store),
                Err(QueueError::Database(e)) if is_busy(&e) && attempt < OPEN_ATTEMPTS => {
                    log::warn!(
                        "Database {:?} busy (attempt {}/{}): {}",
                        path,
                        attempt,
                        OPEN_ATTEMPTS,
                        e
                    );
                    attempt += 1;
                    std::thread::sleep(OPEN_RETRY_PAUSE);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_open(path: &Path) -> QueueResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    /// Isolated store for tests and ephemeral use
    pub fn open_in_memory() -> QueueResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> QueueResult<Self> {
        schema::init_queue_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with exclusive access to the connection
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> QueueResult<T>) -> QueueResult<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| QueueError::Other("store lock poisoned".to_string()))?;
        f(&conn)
    }

    /// Runs `f` inside a transaction, committing only when it succeeds
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> QueueResult<T>,
    ) -> QueueResult<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| QueueError::Other("store lock poisoned".to_string()))?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Upserts a draft by `local_id`. In-memory photo payloads are replaced
    /// by placeholders; they belong in the blob cache.
    pub fn put_draft(&self, batch: &ExpenseBatch) -> QueueResult<()> {
        self.with_conn(|conn| put_draft_on(conn, batch))
    }

    pub fn get_draft(&self, local_id: &str) -> QueueResult<Option<ExpenseBatch>> {
        self.with_conn(|conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM drafts WHERE local_id = ?1",
                    params![local_id],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(QueueError::from))
                .transpose()
        })
    }

    /// Drafts carrying the given remote batch id, most recently saved first
    pub fn drafts_by_batch(&self, batch_id: &str) -> QueueResult<Vec<ExpenseBatch>> {
        self.drafts_where("batch_id = ?1", batch_id)
    }

    pub fn drafts_by_driver(&self, driver_id: &str) -> QueueResult<Vec<ExpenseBatch>> {
        self.drafts_where("driver_id = ?1", driver_id)
    }

    pub fn drafts_by_status(&self, status: BatchStatus) -> QueueResult<Vec<ExpenseBatch>> {
        self.drafts_where("status = ?1", status_str(status))
    }

    fn drafts_where(&self, clause: &str, value: &str) -> QueueResult<Vec<ExpenseBatch>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT body FROM drafts WHERE {} ORDER BY last_saved DESC",
                clause
            );
            let mut stmt = conn.prepare(&sql)?;
            let bodies = stmt
                .query_map(params![value], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            bodies
                .iter()
                .map(|b| serde_json::from_str(b).map_err(QueueError::from))
                .collect()
        })
    }

    /// Deletes a draft row. Deleting an absent id succeeds and returns false.
    pub fn delete_draft(&self, local_id: &str) -> QueueResult<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM drafts WHERE local_id = ?1", params![local_id])?;
            Ok(n > 0)
        })
    }
}

pub(crate) fn put_draft_on(conn: &Connection, batch: &ExpenseBatch) -> QueueResult<()> {
    let body = serde_json::to_string(&strip_payloads(batch))?;
    conn.execute(
        "INSERT INTO drafts (local_id, batch_id, driver_id, status, body, last_saved)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(local_id) DO UPDATE SET
            batch_id = excluded.batch_id,
            driver_id = excluded.driver_id,
            status = excluded.status,
            body = excluded.body,
            last_saved = excluded.last_saved",
        params![
            batch.local_id,
            batch.batch_id,
            batch.driver_id,
            status_str(batch.status),
            body,
            to_millis(batch.last_saved),
        ],
    )?;
    Ok(())
}

fn strip_payloads(batch: &ExpenseBatch) -> ExpenseBatch {
    let mut copy = batch.clone();
    for line in copy.lines.iter_mut() {
        if !line.amount.is_finite() {
            line.amount = 0.0;
        }
        for photo in line.photos.iter_mut() {
            if matches!(photo, PhotoRef::Captured(_)) {
                *photo = PhotoRef::Pending;
            }
        }
    }
    copy
}

fn status_str(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Draft => "draft",
        BatchStatus::Submitted => "submitted",
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(driver: &str, batch_id: Option<&str>) -> ExpenseBatch {
        let mut batch = ExpenseBatch::new();
        batch.driver_id = Some(driver.to_string());
        batch.batch_id = batch_id.map(str::to_string);
        batch
    }

    #[test]
    fn test_put_is_upsert() {
        let store = DurableStore::open_in_memory().unwrap();
        let mut batch = draft("d1", None);
        store.put_draft(&batch).unwrap();
        batch.lines[0].amount = 12.5;
        batch.batch_id = Some("B1".to_string());
        store.put_draft(&batch).unwrap();

        let loaded = store.get_draft(&batch.local_id).unwrap().unwrap();
        assert_eq!(loaded.lines[0].amount, 12.5);
        assert_eq!(store.drafts_by_batch("B1").unwrap().len(), 1);
        assert_eq!(store.drafts_by_driver("d1").unwrap().len(), 1);
    }

    #[test]
    fn test_missing_lookups_are_empty() {
        let store = DurableStore::open_in_memory().unwrap();
        assert!(store.get_draft("local_nope").unwrap().is_none());
        assert!(store.drafts_by_batch("nope").unwrap().is_empty());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = DurableStore::open_in_memory().unwrap();
        let batch = draft("d1", None);
        store.put_draft(&batch).unwrap();
        assert!(store.delete_draft(&batch.local_id).unwrap());
        assert!(!store.delete_draft(&batch.local_id).unwrap());
    }

    #[test]
    fn test_payloads_never_stored_in_document() {
        let store = DurableStore::open_in_memory().unwrap();
        let mut batch = draft("d1", None);
        batch.add_photo(2, PhotoRef::Captured(vec![1, 2, 3])).unwrap();
        batch.add_photo(2, PhotoRef::uploaded("https://x/a.jpg")).unwrap();
        store.put_draft(&batch).unwrap();

        let loaded = store.get_draft(&batch.local_id).unwrap().unwrap();
        assert_eq!(loaded.lines[2].photos[0], PhotoRef::Pending);
        assert_eq!(loaded.lines[2].photos[1].url(), Some("https://x/a.jpg"));
    }

    #[test]
    fn test_non_finite_amount_stays_readable() {
        let store = DurableStore::open_in_memory().unwrap();
        let mut batch = draft("d1", None);
        batch.lines[3].amount = f64::NAN;
        store.put_draft(&batch).unwrap();
        let loaded = store.get_draft(&batch.local_id).unwrap().unwrap();
        assert_eq!(loaded.lines[3].amount, 0.0);
    }

    #[test]
    fn test_timestamps_are_epoch_millis() {
        let store = DurableStore::open_in_memory().unwrap();
        let batch = draft("d1", None);
        store.put_draft(&batch).unwrap();
        let stored: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT last_saved FROM drafts WHERE local_id = ?1",
                    params![batch.local_id],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(stored, batch.last_saved.timestamp_millis());
        assert_eq!(from_millis(stored).timestamp_millis(), stored);
    }

    #[test]
    fn test_open_file_creates_parent_dir() {
        let dir = std::env::temp_dir().join(format!("upload-queue-test-{}", ulid::Ulid::new()));
        let path = dir.join("nested").join("queue.db");
        let store = DurableStore::open(&path).unwrap();
        store.put_draft(&draft("d1", None)).unwrap();
        drop(store);

        let reopened = DurableStore::open(&path).unwrap();
        assert_eq!(reopened.drafts_by_driver("d1").unwrap().len(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }
}
