use crate::error::RemoteError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Collection holding one document per expense line
pub const EXPENSES_COLLECTION: &str = "expenses";

/// Collection of wait-time records
pub const WAIT_TIMES_COLLECTION: &str = "waitTimes";

/// Field of a parent document holding its photo references
pub const PHOTOS_FIELD: &str = "photos";

/// Field the record store stamps on every write (epoch millis)
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Field carrying the logical batch id of a parent document
pub const BATCH_ID_FIELD: &str = "batchId";

/// Credential used for remote writes
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// A document of the remote record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl RemoteRecord {
    /// Photo references stored on the document; non-string entries are skipped
    pub fn photos(&self) -> Vec<String> {
        self.fields
            .get(PHOTOS_FIELD)
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Remote binary storage
#[async_trait]
pub trait PhotoStorage: Send + Sync {
    /// Stores `bytes` at `path` and returns a stable retrieval URL
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        auth: &AuthToken,
    ) -> Result<String, RemoteError>;
}

/// Remote parent-record store
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(
        &self,
        collection: &str,
        id: &str,
        auth: &AuthToken,
    ) -> Result<Option<RemoteRecord>, RemoteError>;

    /// Documents whose `batchId` equals `batch_id`, in a stable order
    async fn query_by_batch(
        &self,
        collection: &str,
        batch_id: &str,
        auth: &AuthToken,
    ) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// Merges `fields` into an existing document and stamps `updatedAt`
    async fn patch(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
        auth: &AuthToken,
    ) -> Result<(), RemoteError>;

    /// Creates a document (no id) or merges into one; returns the id
    async fn upsert(
        &self,
        collection: &str,
        id: Option<&str>,
        fields: Map<String, Value>,
        auth: &AuthToken,
    ) -> Result<String, RemoteError>;
}

/// Source of the credential required before any remote write
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// `None` when no credential is available right now
    async fn auth_token(&self) -> Option<AuthToken>;
}

/// Only non-empty http(s) URLs are retrieval references
pub fn is_valid_photo_url(url: &str) -> bool {
    let url = url.trim();
    !url.is_empty() && (url.starts_with("http://") || url.starts_with("https://"))
}

/// Storage path of a URL: the URL without its `&token=` parameter.
/// Retries of the same upload yield the same path with a fresh token.
pub fn storage_path_key(url: &str) -> String {
    let lower = url.to_ascii_lowercase();
    match lower.find("&token=") {
        Some(start) => {
            let rest = &url[start + 1..];
            let end = rest.find('&').map(|i| start + 1 + i).unwrap_or(url.len());
            format!("{}{}", &url[..start], &url[end..]).trim().to_string()
        }
        None => url.trim().to_string(),
    }
}

/// Drops invalid entries and keeps the first URL per storage path
pub fn dedupe_photo_urls(urls: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    urls.iter()
        .filter(|u| is_valid_photo_url(u))
        .filter(|u| seen.insert(storage_path_key(u)))
        .cloned()
        .collect()
}

/// Places `url` at `index`: overwrite when in range, append otherwise, then
/// clean up. Applying the same reference twice yields the same list.
pub fn merge_photo_url(existing: &[String], index: usize, url: &str) -> Vec<String> {
    let mut photos = existing.to_vec();
    if index < photos.len() {
        photos[index] = url.to_string();
    } else {
        photos.push(url.to_string());
    }
    dedupe_photo_urls(&photos)
}
