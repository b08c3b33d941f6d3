use crate::error::QueueResult;
use crate::models::{BlobKey, SlotCoords};
use crate::store::{from_millis, to_millis, DurableStore};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Host request for durable storage, so cached payloads survive storage
/// pressure eviction. Best-effort: `false` means degraded mode.
pub trait StorageElevation: Send + Sync {
    fn request_persistence(&self) -> bool;
}

/// Elevation for hosts where local storage is always durable
pub struct AlwaysPersistent;

impl StorageElevation for AlwaysPersistent {
    fn request_persistence(&self) -> bool {
        true
    }
}

/// One cached photo payload
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoBlob {
    pub key: BlobKey,
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

/// Binary payload cache on top of the durable store
#[derive(Clone)]
pub struct BlobCache {
    store: DurableStore,
    elevation: Arc<dyn StorageElevation>,
    elevation_requested: Arc<AtomicBool>,
}

impl BlobCache {
    pub fn new(store: DurableStore, elevation: Arc<dyn StorageElevation>) -> Self {
        Self {
            store,
            elevation,
            elevation_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests durable storage the first time anything is cached
    fn ensure_elevated(&self) {
        if self.elevation_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.elevation.request_persistence() {
            log::debug!("Persistent storage granted for photo cache");
        } else {
            log::warn!("Persistent storage denied; cached photos may be evicted under storage pressure");
        }
    }

    /// Stores (or replaces) the payload for a slot
    pub fn save_photo_blob(&self, owner: &str, slot: SlotCoords, data: &[u8]) -> QueueResult<()> {
        self.ensure_elevated();
        let key = BlobKey::new(owner, slot);
        self.store
            .with_conn(|conn| save_blob_on(conn, &key, data, Utc::now()))?;
        log::debug!("Cached photo {} ({} bytes)", key.blob_id(), data.len());
        Ok(())
    }

    /// Returns `None` when nothing is cached for the slot
    pub fn get_photo_blob(&self, owner: &str, slot: SlotCoords) -> QueueResult<Option<PhotoBlob>> {
        let key = BlobKey::new(owner, slot);
        self.store.with_conn(|conn| get_blob_on(conn, &key))
    }

    /// Idempotent; returns whether a payload was actually removed
    pub fn delete_photo_blob(&self, owner: &str, slot: SlotCoords) -> QueueResult<bool> {
        let key = BlobKey::new(owner, slot);
        self.store.with_conn(|conn| delete_blob_on(conn, &key))
    }

    /// All payloads of an owner, ordered by line then photo index
    pub fn blobs_for_owner(&self, owner: &str) -> QueueResult<Vec<PhotoBlob>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT owner, line_index, photo_index, data, captured_at
                 FROM photo_blobs WHERE owner = ?1
                 ORDER BY line_index, photo_index",
            )?;
            let rows = stmt
                .query_map(params![owner], row_to_blob)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Payloads of one line, ordered by photo index
    pub fn blobs_for_line(&self, owner: &str, line: usize) -> QueueResult<Vec<PhotoBlob>> {
        let line_key = BlobKey::new(owner, SlotCoords::new(line, 0)).line_key();
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT owner, line_index, photo_index, data, captured_at
                 FROM photo_blobs WHERE line_key = ?1
                 ORDER BY photo_index",
            )?;
            let rows = stmt
                .query_map(params![line_key], row_to_blob)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn delete_blobs_for_owner(&self, owner: &str) -> QueueResult<usize> {
        self.store.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM photo_blobs WHERE owner = ?1", params![owner])?)
        })
    }

    /// Keys of every cached payload
    pub fn all_keys(&self) -> QueueResult<Vec<BlobKey>> {
        self.store.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT owner, line_index, photo_index FROM photo_blobs")?;
            let keys = stmt
                .query_map([], |row| {
                    Ok(BlobKey::new(
                        row.get::<_, String>(0)?,
                        SlotCoords::new(row.get::<_, i64>(1)? as usize, row.get::<_, i64>(2)? as usize),
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
    }

    pub(crate) fn store(&self) -> &DurableStore {
        &self.store
    }

    pub(crate) fn elevate(&self) {
        self.ensure_elevated();
    }
}

pub(crate) fn save_blob_on(
    conn: &Connection,
    key: &BlobKey,
    data: &[u8],
    captured_at: DateTime<Utc>,
) -> QueueResult<()> {
    conn.execute(
        "INSERT INTO photo_blobs (blob_id, owner, line_key, line_index, photo_index, data, captured_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(blob_id) DO UPDATE SET
            data = excluded.data,
            captured_at = excluded.captured_at",
        params![
            key.blob_id(),
            key.owner,
            key.line_key(),
            key.slot.line as i64,
            key.slot.photo as i64,
            data,
            to_millis(captured_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn get_blob_on(conn: &Connection, key: &BlobKey) -> QueueResult<Option<PhotoBlob>> {
    let blob = conn
        .query_row(
            "SELECT owner, line_index, photo_index, data, captured_at
             FROM photo_blobs WHERE blob_id = ?1",
            params![key.blob_id()],
            row_to_blob,
        )
        .optional()?;
    Ok(blob)
}

pub(crate) fn blob_exists_on(conn: &Connection, key: &BlobKey) -> QueueResult<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM photo_blobs WHERE blob_id = ?1",
        params![key.blob_id()],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

pub(crate) fn delete_blob_on(conn: &Connection, key: &BlobKey) -> QueueResult<bool> {
    let n = conn.execute(
        "DELETE FROM photo_blobs WHERE blob_id = ?1",
        params![key.blob_id()],
    )?;
    Ok(n > 0)
}

fn row_to_blob(row: &rusqlite::Row) -> rusqlite::Result<PhotoBlob> {
    Ok(PhotoBlob {
        key: BlobKey::new(
            row.get::<_, String>(0)?,
            SlotCoords::new(row.get::<_, i64>(1)? as usize, row.get::<_, i64>(2)? as usize),
        ),
        data: row.get(3)?,
        captured_at: from_millis(row.get(4)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingElevation;

    fn cache() -> (BlobCache, Arc<CountingElevation>) {
        let elevation = Arc::new(CountingElevation::denying());
        let store = DurableStore::open_in_memory().unwrap();
        (BlobCache::new(store, elevation.clone()), elevation)
    }

    #[test]
    fn test_save_get_delete() {
        let (cache, _) = cache();
        let slot = SlotCoords::new(3, 1);
        cache.save_photo_blob("local_a", slot, &[0, 159, 146, 150]).unwrap();

        let blob = cache.get_photo_blob("local_a", slot).unwrap().unwrap();
        assert_eq!(blob.data, vec![0, 159, 146, 150]);
        assert_eq!(blob.key.blob_id(), "local_a_exp3_photo1");

        assert!(cache.delete_photo_blob("local_a", slot).unwrap());
        assert!(!cache.delete_photo_blob("local_a", slot).unwrap());
        assert!(cache.get_photo_blob("local_a", slot).unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites_same_slot() {
        let (cache, _) = cache();
        let slot = SlotCoords::new(0, 0);
        cache.save_photo_blob("local_a", slot, b"first").unwrap();
        cache.save_photo_blob("local_a", slot, b"second").unwrap();
        assert_eq!(cache.all_keys().unwrap().len(), 1);
        assert_eq!(
            cache.get_photo_blob("local_a", slot).unwrap().unwrap().data,
            b"second".to_vec()
        );
    }

    #[test]
    fn test_lookup_by_owner_and_line() {
        let (cache, _) = cache();
        cache.save_photo_blob("local_a", SlotCoords::new(1, 2), b"c").unwrap();
        cache.save_photo_blob("local_a", SlotCoords::new(1, 0), b"a").unwrap();
        cache.save_photo_blob("local_a", SlotCoords::new(4, 0), b"d").unwrap();
        cache.save_photo_blob("local_b", SlotCoords::new(1, 0), b"x").unwrap();

        let line = cache.blobs_for_line("local_a", 1).unwrap();
        let photos: Vec<usize> = line.iter().map(|b| b.key.slot.photo).collect();
        assert_eq!(photos, vec![0, 2]);
        assert_eq!(cache.blobs_for_owner("local_a").unwrap().len(), 3);

        assert_eq!(cache.delete_blobs_for_owner("local_a").unwrap(), 3);
        assert_eq!(cache.all_keys().unwrap().len(), 1);
    }

    #[test]
    fn test_elevation_requested_once_and_denial_is_soft() {
        let (cache, elevation) = cache();
        assert_eq!(elevation.calls(), 0);
        cache.save_photo_blob("local_a", SlotCoords::new(0, 0), b"a").unwrap();
        cache.save_photo_blob("local_a", SlotCoords::new(0, 1), b"b").unwrap();
        assert_eq!(elevation.calls(), 1);
        assert_eq!(cache.blobs_for_owner("local_a").unwrap().len(), 2);
    }
}
