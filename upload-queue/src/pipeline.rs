use crate::blob_cache::{BlobCache, StorageElevation};
use crate::config::QueueConfig;
use crate::connectivity::Connectivity;
use crate::delegate::{serve_foreground, ForegroundLink};
use crate::drafts::DraftStore;
use crate::engine::UploadEngine;
use crate::error::QueueResult;
use crate::models::{DrainReport, QueueStatus};
use crate::queue::UploadQueue;
use crate::remote::{AuthProvider, PhotoStorage, RecordStore};
use crate::runner::{BackgroundRunner, RunnerHandle};
use crate::status::StatusBroadcaster;
use crate::store::DurableStore;
use crate::working_copy::WorkingCopy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Everything the pipeline needs from its host
pub struct PipelineHandles {
    pub store: DurableStore,
    pub config: QueueConfig,
    /// Storage client usable from the foreground
    pub storage: Arc<dyn PhotoStorage>,
    pub records: Arc<dyn RecordStore>,
    /// Foreground credential source
    pub auth: Arc<dyn AuthProvider>,
    pub elevation: Arc<dyn StorageElevation>,
    pub connectivity: Connectivity,
}

/// The upload pipeline as one service with an explicit lifecycle.
///
/// `init` wires the queue, a foreground engine using the host's storage
/// client directly, and a background runner whose engine delegates uploads
/// and credential lookups over a [`ForegroundLink`]. Each instance is fully
/// isolated; nothing is process-global.
pub struct UploadPipeline {
    queue: UploadQueue,
    drafts: DraftStore,
    foreground: Arc<UploadEngine>,
    background: Arc<UploadEngine>,
    link: ForegroundLink,
    storage: Arc<dyn PhotoStorage>,
    auth: Arc<dyn AuthProvider>,
    runner: Option<RunnerHandle>,
}

impl UploadPipeline {
    /// Builds the pipeline and starts the background runner.
    /// Must be called from within a tokio runtime.
    pub fn init(handles: PipelineHandles) -> QueueResult<Self> {
        let PipelineHandles {
            store,
            config,
            storage,
            records,
            auth,
            elevation,
            connectivity,
        } = handles;

        let blobs = BlobCache::new(store.clone(), elevation);
        let status = StatusBroadcaster::new(store);
        let queue = UploadQueue::new(blobs, Arc::new(config), status, connectivity);

        let recovered = queue.reset_stuck()?;
        if recovered > 0 {
            log::info!("Recovered {} upload(s) abandoned by a previous session", recovered);
        }
        queue.status().refresh();

        let link = ForegroundLink::new(queue.config());
        let foreground = Arc::new(UploadEngine::new(
            queue.clone(),
            Arc::clone(&storage),
            Arc::clone(&records),
        ));
        let background = Arc::new(UploadEngine::new(
            queue.clone(),
            Arc::new(link.clone()),
            records,
        ));
        let runner = BackgroundRunner::start(
            Arc::clone(&background),
            Arc::new(link.clone()) as Arc<dyn AuthProvider>,
        );

        log::info!("Upload pipeline initialized");
        Ok(Self {
            drafts: DraftStore::new(queue.clone()),
            queue,
            foreground,
            background,
            link,
            storage,
            auth,
            runner: Some(runner),
        })
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    pub fn drafts(&self) -> &DraftStore {
        &self.drafts
    }

    pub fn engine(&self) -> &Arc<UploadEngine> {
        &self.foreground
    }

    pub fn runner(&self) -> Option<&RunnerHandle> {
        self.runner.as_ref()
    }

    pub fn status(&self) -> QueueStatus {
        self.queue.status().current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<QueueStatus> {
        self.queue.status().subscribe()
    }

    /// Opens a working copy for a foreground view. Both engines mirror
    /// finished uploads into it.
    pub fn working_copy(&self) -> WorkingCopy {
        let wc = WorkingCopy::new(self.drafts.clone(), self.queue.config().autosave_debounce());
        self.foreground.attach_working_copy(wc.clone());
        self.background.attach_working_copy(wc.clone());
        wc
    }

    /// Attaches a foreground view that answers delegated uploads and
    /// credential requests for the background runner. Aborting the handle
    /// detaches it.
    pub fn connect_foreground(&self) -> JoinHandle<()> {
        let handle = serve_foreground(
            self.link.attach(),
            Arc::clone(&self.storage),
            Arc::clone(&self.auth),
        );
        if let Some(runner) = &self.runner {
            runner.request_drain();
        }
        handle
    }

    /// Drains from the foreground right away. Skipped while offline or
    /// without a credential.
    pub async fn drain_now(&self) -> DrainReport {
        if !self.queue.connectivity().is_online() {
            log::debug!("Offline, not draining");
            return DrainReport::default();
        }
        match self.auth.auth_token().await {
            Some(token) => self.foreground.drain(&token).await,
            None => {
                log::warn!("No credential available, not draining");
                DrainReport::default()
            }
        }
    }

    /// Drains from the foreground until the batch has nothing left to upload
    pub async fn wait_for_uploads(&self, batch: &str, timeout: Duration) -> bool {
        match self.auth.auth_token().await {
            Some(token) => {
                self.foreground
                    .wait_for_uploads(batch, &token, timeout)
                    .await
            }
            None => false,
        }
    }

    /// Stops the background runner and detaches working copies. Queued work
    /// stays in the store for the next `init`.
    pub async fn shutdown(mut self) {
        if let Some(runner) = self.runner.take() {
            runner.shutdown().await;
        }
        self.foreground.detach_working_copy();
        self.background.detach_working_copy();
        log::info!("Upload pipeline shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExpenseBatch, NewPhotoUpload, PhotoRef, SlotCoords};
    use crate::remote::EXPENSES_COLLECTION;
    use crate::testing::{token, CountingElevation, MemoryRemote, StaticAuth};

    fn handles(store: DurableStore, remote: &Arc<MemoryRemote>, online: bool) -> PipelineHandles {
        PipelineHandles {
            store,
            config: QueueConfig::default(),
            storage: remote.clone(),
            records: remote.clone(),
            auth: Arc::new(StaticAuth(Some(token()))),
            elevation: Arc::new(CountingElevation::granting()),
            connectivity: Connectivity::new(online),
        }
    }

    fn upload(batch: &str) -> NewPhotoUpload {
        NewPhotoUpload {
            batch_local_id: None,
            batch_id: Some(batch.to_string()),
            parent_doc_id: None,
            slot: SlotCoords::new(0, 0),
            filename: format!("expenses/{}/0_0.jpg", batch),
            photo: Some(vec![1]),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_runner_delegates_to_foreground() {
        let remote = MemoryRemote::new();
        remote.insert_record(EXPENSES_COLLECTION, "e0", "B1");
        let pipeline =
            UploadPipeline::init(handles(DurableStore::open_in_memory().unwrap(), &remote, true))
                .unwrap();
        pipeline.queue().enqueue(upload("B1")).unwrap();

        // no foreground yet: cycles are skipped
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(remote.uploads().is_empty());

        let server = pipeline.connect_foreground();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(remote.uploads().len(), 1);
        assert_eq!(pipeline.status().active_photos(), 0);

        server.abort();
        pipeline.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_drain_and_working_copy() {
        let remote = MemoryRemote::new();
        remote.insert_record(EXPENSES_COLLECTION, "e0", "B1");
        let pipeline =
            UploadPipeline::init(handles(DurableStore::open_in_memory().unwrap(), &remote, true))
                .unwrap();

        let mut batch = ExpenseBatch::new();
        batch.batch_id = Some("B1".to_string());
        batch.add_photo(0, PhotoRef::Captured(vec![4])).unwrap();
        let wc = pipeline.working_copy();
        wc.open(batch);
        let local_id = wc.save_now().unwrap().unwrap();

        let mut task = upload("B1");
        task.batch_local_id = Some(local_id.clone());
        task.photo = None;
        pipeline.queue().enqueue(task).unwrap();

        let report = pipeline.drain_now().await;
        assert_eq!(report.processed, 1);
        assert!(wc.snapshot().unwrap().lines[0].photos[0].url().is_some());
        pipeline.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_pipeline_keeps_work_for_next_session() {
        let store = DurableStore::open_in_memory().unwrap();
        let remote = MemoryRemote::new();
        let pipeline = UploadPipeline::init(handles(store.clone(), &remote, false)).unwrap();
        pipeline.queue().enqueue(upload("B1")).unwrap();
        assert_eq!(pipeline.drain_now().await, DrainReport::default());
        assert_eq!(pipeline.status().pending_photos, 1);
        pipeline.shutdown().await;

        let again = UploadPipeline::init(handles(store, &remote, false)).unwrap();
        assert_eq!(again.status().pending_photos, 1);
        again.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_instances_are_isolated() {
        let remote = MemoryRemote::new();
        let a = UploadPipeline::init(handles(DurableStore::open_in_memory().unwrap(), &remote, false))
            .unwrap();
        let b = UploadPipeline::init(handles(DurableStore::open_in_memory().unwrap(), &remote, false))
            .unwrap();
        a.queue().enqueue(upload("B1")).unwrap();
        assert_eq!(a.status().pending_photos, 1);
        assert_eq!(b.status().pending_photos, 0);
        a.shutdown().await;
        b.shutdown().await;
    }
}
