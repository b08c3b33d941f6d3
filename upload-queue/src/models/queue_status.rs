use serde::{Deserialize, Serialize};

/// Aggregate signal consumed by UI layers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending_photos: usize,
    pub uploading_photos: usize,
    pub failed_photos: usize,
    pub pending_record_submissions: usize,
}

impl QueueStatus {
    /// Photos still owed to remote storage
    pub fn active_photos(&self) -> usize {
        self.pending_photos + self.uploading_photos
    }

    pub fn is_uploading(&self) -> bool {
        self.active_photos() > 0 || self.pending_record_submissions > 0
    }

    /// Banner text; `None` when there is nothing in flight and nothing failed
    pub fn summary(&self) -> Option<String> {
        let records = self.pending_record_submissions;
        let photos = self.active_photos();
        if records > 0 {
            Some(format!("Uploading {} Record{}", records, plural(records)))
        } else if photos > 0 {
            Some(format!("Uploading {} Photo{}", photos, plural(photos)))
        } else if self.failed_photos > 0 {
            Some(format!(
                "{} Photo{} failed to upload",
                self.failed_photos,
                plural(self.failed_photos)
            ))
        } else {
            None
        }
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// Outcome of one drain cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Tasks that reached completion
    pub processed: usize,
    /// Tasks that failed this cycle, retryable or not
    pub failed: usize,
    /// Tasks considered this cycle
    pub total: usize,
}

impl DrainReport {
    pub fn merge(&mut self, other: DrainReport) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.total += other.total;
    }
}

/// Pending work for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingUploads {
    pub has_pending: bool,
    pub count: usize,
}

/// Task counts of one batch by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchUploadStatus {
    pub pending: usize,
    pub uploading: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}
