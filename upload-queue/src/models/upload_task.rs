use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a queued task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Still owes work to the remote side
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Uploading)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "uploading" => Ok(TaskStatus::Uploading),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// Position of a photo inside its parent: line index and photo index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotCoords {
    pub line: usize,
    pub photo: usize,
}

impl SlotCoords {
    pub fn new(line: usize, photo: usize) -> Self {
        Self { line, photo }
    }
}

/// Composite key of a cached photo payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey {
    /// `local_id` of the owning draft (or the remote batch id when the
    /// capture happened without a local draft)
    pub owner: String,
    pub slot: SlotCoords,
}

impl BlobKey {
    pub fn new(owner: impl Into<String>, slot: SlotCoords) -> Self {
        Self {
            owner: owner.into(),
            slot,
        }
    }

    /// Primary key in the blob table
    pub fn blob_id(&self) -> String {
        format!("{}_exp{}_photo{}", self.owner, self.slot.line, self.slot.photo)
    }

    /// Secondary key grouping all photos of one line
    pub fn line_key(&self) -> String {
        format!("{}_exp{}", self.owner, self.slot.line)
    }
}

/// One photo's upload-and-link job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTask {
    pub upload_id: String,
    /// Owning draft, if the capture came from one
    pub batch_local_id: Option<String>,
    /// Remote logical batch id, used for positional parent resolution
    pub batch_id: Option<String>,
    /// Remote parent document id once known
    pub parent_doc_id: Option<String>,
    pub slot: SlotCoords,
    /// Target path in remote storage
    pub filename: String,
    pub status: TaskStatus,
    pub retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadTask {
    /// Key of the companion blob
    pub fn blob_key(&self) -> BlobKey {
        let owner = self
            .batch_local_id
            .clone()
            .or_else(|| self.batch_id.clone())
            .unwrap_or_default();
        BlobKey::new(owner, self.slot)
    }

    /// True when the task sits in `uploading` longer than `stale_after`
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.status == TaskStatus::Uploading && now - self.updated_at > stale_after
    }

    /// Backoff gate: false while a scheduled retry time lies in the future
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map(|t| t <= now).unwrap_or(true)
    }

    /// The parent can be resolved remotely once it has a document id or a
    /// batch id; until then the task waits without spending retries
    pub fn has_remote_parent(&self) -> bool {
        self.parent_doc_id.is_some() || self.batch_id.is_some()
    }
}

/// Input of `UploadQueue::enqueue`
#[derive(Debug, Clone)]
pub struct NewPhotoUpload {
    pub batch_local_id: Option<String>,
    pub batch_id: Option<String>,
    pub parent_doc_id: Option<String>,
    pub slot: SlotCoords,
    pub filename: String,
    /// Payload to cache; `None` when the blob was already cached by a draft save
    pub photo: Option<Vec<u8>>,
}

/// Second task kind: create or merge a whole record remotely
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordTask {
    pub upload_id: String,
    /// Remote collection, e.g. `waitTimes`
    pub collection: String,
    /// Remote document id; `None` creates a new document
    pub doc_id: Option<String>,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub status: TaskStatus,
    pub retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl RecordTask {
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.status == TaskStatus::Uploading && now - self.updated_at > stale_after
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map(|t| t <= now).unwrap_or(true)
    }
}

/// Generates a task id
pub fn new_upload_id(prefix: &str) -> String {
    format!("{}_{}", prefix, ulid::Ulid::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> UploadTask {
        let now = Utc::now();
        UploadTask {
            upload_id: new_upload_id("upload"),
            batch_local_id: Some("local_1".to_string()),
            batch_id: Some("batch_1".to_string()),
            parent_doc_id: None,
            slot: SlotCoords::new(2, 1),
            filename: "expenses/AB12/taxi_1_1.jpg".to_string(),
            status: TaskStatus::Pending,
            retries: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            last_retry_at: None,
            next_attempt_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Uploading,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_blob_key_prefers_local_id() {
        let mut task = sample_task();
        assert_eq!(task.blob_key().blob_id(), "local_1_exp2_photo1");
        assert_eq!(task.blob_key().line_key(), "local_1_exp2");
        task.batch_local_id = None;
        assert_eq!(task.blob_key().blob_id(), "batch_1_exp2_photo1");
    }

    #[test]
    fn test_staleness_window() {
        let mut task = sample_task();
        let now = Utc::now();
        task.status = TaskStatus::Uploading;
        task.updated_at = now - chrono::Duration::minutes(6);
        assert!(task.is_stale(now, chrono::Duration::minutes(5)));
        task.updated_at = now - chrono::Duration::minutes(4);
        assert!(!task.is_stale(now, chrono::Duration::minutes(5)));
        task.status = TaskStatus::Pending;
        task.updated_at = now - chrono::Duration::minutes(60);
        assert!(!task.is_stale(now, chrono::Duration::minutes(5)));
    }

    #[test]
    fn test_due_gate() {
        let mut task = sample_task();
        let now = Utc::now();
        assert!(task.is_due(now));
        task.next_attempt_at = Some(now + chrono::Duration::seconds(30));
        assert!(!task.is_due(now));
        assert!(task.is_due(now + chrono::Duration::seconds(31)));
    }
}
