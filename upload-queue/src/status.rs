use crate::models::QueueStatus;
use crate::queue::queue_counts_on;
use crate::store::DurableStore;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Depth of an external record-submission queue, added to
/// `pending_record_submissions`
pub type SubmissionProbe = Arc<dyn Fn() -> usize + Send + Sync>;

/// Aggregates queue counts into a single observable status.
///
/// Pure read side: refreshing never mutates the queue.
#[derive(Clone)]
pub struct StatusBroadcaster {
    store: DurableStore,
    tx: Arc<watch::Sender<QueueStatus>>,
    probe: Arc<Mutex<Option<SubmissionProbe>>>,
}

impl StatusBroadcaster {
    pub fn new(store: DurableStore) -> Self {
        let (tx, _rx) = watch::channel(QueueStatus::default());
        Self {
            store,
            tx: Arc::new(tx),
            probe: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_submission_probe(&self, probe: SubmissionProbe) {
        if let Ok(mut guard) = self.probe.lock() {
            *guard = Some(probe);
        }
        self.refresh();
    }

    /// Recomputes counts from the store and publishes them if they changed.
    /// A failing store read keeps the previous value.
    pub fn refresh(&self) -> QueueStatus {
        let mut status = match self.store.with_conn(queue_counts_on) {
            Ok(s) => s,
            Err(e) => {
                log::error!("Failed to read queue status: {}", e);
                return self.current();
            }
        };
        let external = self
            .probe
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|p| p()))
            .unwrap_or(0);
        status.pending_record_submissions += external;

        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        status
    }

    pub fn current(&self) -> QueueStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueStatus> {
        self.tx.subscribe()
    }

    /// Human-readable banner text for the current status
    pub fn summary(&self) -> Option<String> {
        self.current().summary()
    }
}
