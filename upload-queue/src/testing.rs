//! In-memory fakes shared by the unit tests

use crate::blob_cache::{BlobCache, StorageElevation};
use crate::config::QueueConfig;
use crate::connectivity::Connectivity;
use crate::error::RemoteError;
use crate::models::{NewPhotoUpload, SlotCoords};
use crate::queue::UploadQueue;
use crate::remote::{
    AuthProvider, AuthToken, PhotoStorage, RecordStore, RemoteRecord, BATCH_ID_FIELD,
    UPDATED_AT_FIELD,
};
use crate::status::StatusBroadcaster;
use crate::store::DurableStore;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn test_queue(config: QueueConfig) -> UploadQueue {
    test_queue_on(DurableStore::open_in_memory().unwrap(), config)
}

pub fn test_queue_on(store: DurableStore, config: QueueConfig) -> UploadQueue {
    let blobs = BlobCache::new(store.clone(), Arc::new(CountingElevation::granting()));
    UploadQueue::new(
        blobs,
        Arc::new(config),
        StatusBroadcaster::new(store),
        Connectivity::new(true),
    )
}

/// Upload owned by a local draft, payload given as text for brevity
pub fn photo_upload(owner: &str, line: usize, photo: usize, data: Option<&str>) -> NewPhotoUpload {
    NewPhotoUpload {
        batch_local_id: Some(owner.to_string()),
        batch_id: None,
        parent_doc_id: None,
        slot: SlotCoords::new(line, photo),
        filename: format!("expenses/{}/{}_{}.jpg", owner, line, photo),
        photo: data.map(|d| d.as_bytes().to_vec()),
    }
}

pub fn token() -> AuthToken {
    AuthToken::new("test-token")
}

pub struct CountingElevation {
    grant: bool,
    calls: AtomicUsize,
}

impl CountingElevation {
    pub fn granting() -> Self {
        Self {
            grant: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn denying() -> Self {
        Self {
            grant: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StorageElevation for CountingElevation {
    fn request_persistence(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.grant
    }
}

pub struct StaticAuth(pub Option<AuthToken>);

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn auth_token(&self) -> Option<AuthToken> {
        self.0.clone()
    }
}

/// Remote storage and record store kept in memory, with failure injection
#[derive(Default)]
pub struct MemoryRemote {
    records: Mutex<BTreeMap<String, BTreeMap<String, Map<String, Value>>>>,
    uploads: Mutex<Vec<String>>,
    fail_uploads: AtomicU32,
    fail_patches: AtomicU32,
    upload_delay: Mutex<Option<Duration>>,
    next_id: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_record(&self, collection: &str, id: &str, batch_id: &str) {
        let mut fields = Map::new();
        fields.insert(BATCH_ID_FIELD.to_string(), Value::from(batch_id));
        fields.insert("photos".to_string(), Value::Array(Vec::new()));
        self.records
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
    }

    pub fn remove_record(&self, collection: &str, id: &str) {
        if let Some(docs) = self.records.lock().unwrap().get_mut(collection) {
            docs.remove(id);
        }
    }

    pub fn record(&self, collection: &str, id: &str) -> Option<RemoteRecord> {
        self.records
            .lock()
            .unwrap()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| RemoteRecord {
                id: id.to_string(),
                fields: fields.clone(),
            })
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    /// The next `n` uploads fail with a network error
    pub fn fail_next_uploads(&self, n: u32) {
        self.fail_uploads.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_patches(&self, n: u32) {
        self.fail_patches.store(n, Ordering::SeqCst);
    }

    pub fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.lock().unwrap() = Some(delay);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PhotoStorage for MemoryRemote {
    async fn upload(
        &self,
        path: &str,
        _bytes: Vec<u8>,
        _auth: &AuthToken,
    ) -> Result<String, RemoteError> {
        let delay = *self.upload_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.fail_uploads) {
            return Err(RemoteError::Network("connection reset".to_string()));
        }
        self.uploads.lock().unwrap().push(path.to_string());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "https://storage.test/{}?alt=media&token={}",
            path, n
        ))
    }
}

#[async_trait]
impl RecordStore for MemoryRemote {
    async fn get(
        &self,
        collection: &str,
        id: &str,
        _auth: &AuthToken,
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        Ok(self.record(collection, id))
    }

    async fn query_by_batch(
        &self,
        collection: &str,
        batch_id: &str,
        _auth: &AuthToken,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, f)| f.get(BATCH_ID_FIELD).and_then(Value::as_str) == Some(batch_id))
                    .map(|(id, f)| RemoteRecord {
                        id: id.clone(),
                        fields: f.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn patch(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
        _auth: &AuthToken,
    ) -> Result<(), RemoteError> {
        if Self::take_failure(&self.fail_patches) {
            return Err(RemoteError::Status(503, "unavailable".to_string()));
        }
        let mut records = self.records.lock().unwrap();
        let doc = records
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| RemoteError::Status(404, format!("{}/{}", collection, id)))?;
        doc.extend(fields);
        doc.insert(
            UPDATED_AT_FIELD.to_string(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        id: Option<&str>,
        fields: Map<String, Value>,
        _auth: &AuthToken,
    ) -> Result<String, RemoteError> {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| format!("doc{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        let mut records = self.records.lock().unwrap();
        let doc = records
            .entry(collection.to_string())
            .or_default()
            .entry(id.clone())
            .or_default();
        doc.extend(fields);
        doc.insert(
            UPDATED_AT_FIELD.to_string(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );
        Ok(id)
    }
}
