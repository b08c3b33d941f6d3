pub mod expense_batch;
pub mod queue_status;
pub mod upload_task;

pub use expense_batch::{
    BatchStatus, Category, ExpenseBatch, LineItem, PhotoRef, MAX_PHOTOS_PER_LINE,
};
pub use queue_status::{BatchUploadStatus, DrainReport, PendingUploads, QueueStatus};
pub use upload_task::{
    new_upload_id, BlobKey, NewPhotoUpload, RecordTask, SlotCoords, TaskStatus, UploadTask,
};
