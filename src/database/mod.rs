use crate::config::AppConfig;
use crate::error::AppError;
use std::sync::Arc;
use upload_queue::{
    AlwaysPersistent, BlobCache, Connectivity, DurableStore, StatusBroadcaster, UploadQueue,
};

/// Opens the queue database named in the configuration, creating it and
/// applying migrations as needed
pub fn open_store(config: &AppConfig) -> Result<DurableStore, AppError> {
    log::debug!("Opening queue database at {:?}", config.database_path);
    Ok(DurableStore::open(&config.database_path)?)
}

/// Queue handle for one-shot maintenance commands, without a runner
pub fn open_queue(config: &AppConfig) -> Result<UploadQueue, AppError> {
    let store = open_store(config)?;
    let blobs = BlobCache::new(store.clone(), Arc::new(AlwaysPersistent));
    let status = StatusBroadcaster::new(store);
    let queue = UploadQueue::new(
        blobs,
        Arc::new(config.queue.clone()),
        status,
        Connectivity::new(false),
    );
    queue.status().refresh();
    Ok(queue)
}
