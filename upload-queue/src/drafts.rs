use crate::blob_cache;
use crate::error::QueueResult;
use crate::models::{BatchStatus, BlobKey, ExpenseBatch, PhotoRef, SlotCoords};
use crate::queue::UploadQueue;
use crate::remote::is_valid_photo_url;
use crate::store;
use chrono::Utc;

/// Draft persistence: parent records plus their cached captures
#[derive(Clone)]
pub struct DraftStore {
    queue: UploadQueue,
}

impl DraftStore {
    pub fn new(queue: UploadQueue) -> Self {
        Self { queue }
    }

    /// Saves a draft. Assigns a local id when missing, stamps `last_saved`,
    /// moves in-memory captures into the blob cache and stores the record
    /// with placeholders, all in one transaction. Returns the local id.
    pub fn save_draft(&self, batch: &ExpenseBatch) -> QueueResult<String> {
        let mut doc = batch.clone();
        if doc.local_id.trim().is_empty() {
            doc.local_id = crate::models::expense_batch::new_local_id();
        }
        doc.last_saved = Utc::now();
        doc.normalize();
        let captures = doc.detach_captures();
        if !captures.is_empty() {
            self.queue.blobs().elevate();
        }

        let now = doc.last_saved;
        self.queue.store().with_tx(|tx| {
            for (line, photo, bytes) in &captures {
                let key = BlobKey::new(doc.local_id.clone(), SlotCoords::new(*line, *photo));
                blob_cache::save_blob_on(tx, &key, bytes, now)?;
            }
            store::put_draft_on(tx, &doc)
        })?;

        log::debug!(
            "Saved draft {} ({} lines used, {} new captures)",
            doc.local_id,
            doc.used_line_count(),
            captures.len()
        );
        Ok(doc.local_id)
    }

    /// Loads a draft by local id, falling back to the most recent draft
    /// carrying `id` as its remote batch id. Placeholders whose payload is
    /// still cached come back as in-memory captures; only valid remote URLs
    /// are kept as uploaded references.
    pub fn load_draft(&self, id: &str) -> QueueResult<Option<ExpenseBatch>> {
        let store = self.queue.store();
        let mut draft = match store.get_draft(id)? {
            Some(d) => d,
            None => match store.drafts_by_batch(id)?.into_iter().next() {
                Some(d) => d,
                None => return Ok(None),
            },
        };
        self.rehydrate(&mut draft)?;
        Ok(Some(draft))
    }

    /// Photos keep their stored index so blob keys stay stable. An invalid
    /// URL ahead of a placeholder becomes a placeholder itself; trailing
    /// invalid URLs are dropped.
    fn rehydrate(&self, draft: &mut ExpenseBatch) -> QueueResult<()> {
        let blobs = self.queue.blobs().blobs_for_owner(&draft.local_id)?;
        for (line_idx, line) in draft.lines.iter_mut().enumerate() {
            let last_placeholder = line
                .photos
                .iter()
                .rposition(|p| !matches!(p, PhotoRef::Uploaded { .. }));
            let mut photos = Vec::with_capacity(line.photos.len());
            for (photo_idx, photo) in line.photos.drain(..).enumerate() {
                match photo {
                    PhotoRef::Uploaded { url } if is_valid_photo_url(&url) => {
                        photos.push(PhotoRef::Uploaded { url })
                    }
                    PhotoRef::Uploaded { .. } => {
                        if last_placeholder.is_some_and(|last| photo_idx < last) {
                            photos.push(PhotoRef::Pending);
                        }
                    }
                    _ => {
                        let cached = blobs.iter().find(|b| {
                            b.key.slot.line == line_idx && b.key.slot.photo == photo_idx
                        });
                        match cached {
                            Some(blob) => photos.push(PhotoRef::Captured(blob.data.clone())),
                            None => photos.push(PhotoRef::Pending),
                        }
                    }
                }
            }
            line.photos = photos;
        }
        Ok(())
    }

    pub fn drafts_for_driver(&self, driver_id: &str) -> QueueResult<Vec<ExpenseBatch>> {
        self.queue.store().drafts_by_driver(driver_id)
    }

    /// Drops a draft with all its cached payloads and queued photo tasks.
    /// Discarding an unknown id succeeds.
    pub fn discard_draft(&self, local_id: &str) -> QueueResult<()> {
        let tasks = self.queue.delete_tasks_for_owner(local_id)?;
        let blobs = self.queue.blobs().delete_blobs_for_owner(local_id)?;
        let existed = self.queue.store().delete_draft(local_id)?;
        if existed || tasks > 0 || blobs > 0 {
            log::info!(
                "Discarded draft {} ({} tasks, {} photos)",
                local_id,
                tasks,
                blobs
            );
        }
        self.queue.status().refresh();
        Ok(())
    }

    /// Records that a draft was submitted remotely under `batch_id`. The
    /// draft stays until its last photo task finishes.
    pub fn mark_submitted(&self, local_id: &str, batch_id: &str) -> QueueResult<bool> {
        let store = self.queue.store();
        let mut draft = match store.get_draft(local_id)? {
            Some(d) => d,
            None => return Ok(false),
        };
        draft.status = BatchStatus::Submitted;
        draft.batch_id = Some(batch_id.to_string());
        store.put_draft(&draft)?;
        self.queue.assign_batch_id(local_id, batch_id)?;
        self.queue.release_submitted_draft(local_id)?;
        Ok(true)
    }

    /// Writes a remote reference into the stored draft, if there is one
    pub(crate) fn apply_photo_url(
        &self,
        local_id: &str,
        slot: SlotCoords,
        url: &str,
    ) -> QueueResult<bool> {
        let store = self.queue.store();
        let mut draft = match store.get_draft(local_id)? {
            Some(d) => d,
            None => return Ok(false),
        };
        draft.set_photo_url(slot.line, slot.photo, url);
        store.put_draft(&draft)?;
        Ok(true)
    }
}
