//! # Upload Queue
//!
//! Offline-first, durable photo upload pipeline.
//!
//! Photos captured while editing a parent record (an expense batch) are
//! cached locally and queued as upload tasks. Drain cycles upload each
//! payload, link the returned reference into the parent's remote photo
//! list and clean up locally. Everything survives restarts, and a
//! background runner keeps draining while no view is open.
//!
//! - Durable store (SQLite) for drafts, photo payloads and tasks
//! - Bounded retries, stale in-flight recovery, idempotent transitions
//! - Foreground/background delegation with timeouts
//! - Aggregate status for any UI layer
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use upload_queue::{UploadPipeline, PipelineHandles, DurableStore, QueueConfig};
//!
//! let pipeline = UploadPipeline::init(PipelineHandles {
//!     store: DurableStore::open("data/queue.db")?,
//!     config: QueueConfig::default(),
//!     storage: backend.clone(),
//!     records: backend,
//!     auth,
//!     elevation: Arc::new(AlwaysPersistent),
//!     connectivity: Connectivity::default(),
//! })?;
//! let _foreground = pipeline.connect_foreground();
//! ```

pub mod blob_cache;
pub mod config;
pub mod connectivity;
pub mod delegate;
pub mod drafts;
pub mod engine;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod remote;
pub mod runner;
pub mod schema;
pub mod status;
pub mod store;
pub mod working_copy;

#[cfg(feature = "webdav")]
pub mod webdav;

#[cfg(test)]
pub mod testing;

pub use blob_cache::{AlwaysPersistent, BlobCache, PhotoBlob, StorageElevation};
pub use config::QueueConfig;
pub use connectivity::Connectivity;
pub use delegate::{serve_foreground, DelegateRequest, ForegroundLink};
pub use drafts::DraftStore;
pub use engine::{TaskOutcome, UploadEngine};
pub use error::{QueueError, QueueResult, RemoteError, TaskFailure};
pub use models::{
    BatchStatus, BatchUploadStatus, Category, DrainReport, ExpenseBatch, LineItem,
    NewPhotoUpload, PendingUploads, PhotoRef, QueueStatus, RecordTask, SlotCoords, TaskStatus,
    UploadTask,
};
pub use pipeline::{PipelineHandles, UploadPipeline};
pub use queue::UploadQueue;
pub use remote::{AuthProvider, AuthToken, PhotoStorage, RecordStore, RemoteRecord};
pub use runner::{BackgroundRunner, CycleLogEntry, RunnerHandle};
pub use schema::init_queue_schema;
pub use status::StatusBroadcaster;
pub use store::DurableStore;
pub use working_copy::WorkingCopy;

#[cfg(feature = "webdav")]
pub use webdav::{WebDavBackend, WebDavSettings};
