use crate::drafts::DraftStore;
use crate::error::QueueResult;
use crate::models::{ExpenseBatch, SlotCoords};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// The record a foreground view is editing.
///
/// Not the source of truth: edits are written back to the draft store by a
/// debounced autosave, and the upload engine mirrors finished uploads into
/// it so the view does not need to reload.
#[derive(Clone)]
pub struct WorkingCopy {
    current: Arc<Mutex<Option<ExpenseBatch>>>,
    drafts: DraftStore,
    debounce: Duration,
    pending_save: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WorkingCopy {
    pub fn new(drafts: DraftStore, debounce: Duration) -> Self {
        Self {
            current: Arc::new(Mutex::new(None)),
            drafts,
            debounce,
            pending_save: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts editing `batch`, replacing whatever was open
    pub fn open(&self, batch: ExpenseBatch) {
        self.cancel_pending_save();
        if let Ok(mut guard) = self.current.lock() {
            *guard = Some(batch);
        }
    }

    /// Opens a stored draft by local id or batch id. Returns false when none exists.
    pub fn load(&self, id: &str) -> QueueResult<bool> {
        match self.drafts.load_draft(id)? {
            Some(batch) => {
                self.open(batch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn snapshot(&self) -> Option<ExpenseBatch> {
        self.current.lock().ok().and_then(|guard| guard.clone())
    }

    /// Applies an edit and schedules an autosave after the debounce period.
    /// Each edit restarts the timer. Must be called inside a tokio runtime.
    pub fn edit<T>(&self, f: impl FnOnce(&mut ExpenseBatch) -> T) -> Option<T> {
        let out = {
            let mut guard = self.current.lock().ok()?;
            let batch = guard.as_mut()?;
            f(batch)
        };
        self.schedule_save();
        Some(out)
    }

    fn schedule_save(&self) {
        let this = self.clone();
        let debounce = self.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Err(e) = this.persist() {
                log::error!("Autosave failed: {}", e);
            }
        });
        if let Ok(mut guard) = self.pending_save.lock() {
            if let Some(previous) = guard.replace(handle) {
                previous.abort();
            }
        }
    }

    fn cancel_pending_save(&self) {
        if let Ok(mut guard) = self.pending_save.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }

    /// Saves immediately, cancelling any scheduled autosave
    pub fn save_now(&self) -> QueueResult<Option<String>> {
        self.cancel_pending_save();
        self.persist()
    }

    fn persist(&self) -> QueueResult<Option<String>> {
        let batch = match self.snapshot() {
            Some(b) => b,
            None => return Ok(None),
        };
        let local_id = self.drafts.save_draft(&batch)?;
        if let Ok(mut guard) = self.current.lock() {
            if let Some(current) = guard.as_mut() {
                if current.local_id.is_empty() {
                    current.local_id = local_id.clone();
                }
            }
        }
        log::debug!("Autosaved draft {}", local_id);
        Ok(Some(local_id))
    }

    /// Stops editing without saving pending edits
    pub fn close(&self) {
        self.cancel_pending_save();
        if let Ok(mut guard) = self.current.lock() {
            *guard = None;
        }
    }

    /// Writes an uploaded reference into the open record when it is the
    /// task's parent. Returns whether anything was updated.
    pub fn apply_remote_photo(
        &self,
        local_id: Option<&str>,
        batch_id: Option<&str>,
        slot: SlotCoords,
        url: &str,
    ) -> bool {
        let mut guard = match self.current.lock() {
            Ok(g) => g,
            Err(_) => return false,
        };
        let batch = match guard.as_mut() {
            Some(b) => b,
            None => return false,
        };
        let same_local = local_id.is_some() && local_id == Some(batch.local_id.as_str());
        let same_batch = batch_id.is_some() && batch_id == batch.batch_id.as_deref();
        if !(same_local || same_batch) {
            return false;
        }
        batch.set_photo_url(slot.line, slot.photo, url);
        log::debug!(
            "Mirrored photo into open record {} at line {} photo {}",
            batch.local_id,
            slot.line,
            slot.photo
        );
        true
    }
}
