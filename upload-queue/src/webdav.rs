//! WebDAV backend for photo storage and parent records
//!
//! Photos go to `<remote_path>/<filename>`. Parent records are JSON
//! documents at `<remote_path>/records/<collection>/<id>.json`, which is
//! enough for point lookups, batch queries and partial patches on a plain
//! Nextcloud share.

use crate::error::RemoteError;
use crate::remote::{
    AuthToken, PhotoStorage, RecordStore, RemoteRecord, BATCH_ID_FIELD, UPDATED_AT_FIELD,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

const RECORDS_DIR: &str = "records";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings for a Nextcloud/WebDAV server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebDavSettings {
    pub server_url: String,
    pub username: String,
    /// Used when no credential is supplied by a foreground view
    #[serde(default)]
    pub app_password: String,
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
}

fn default_remote_path() -> String {
    "/ExpenseSync".to_string()
}

/// Storage and record store on one WebDAV share. The credential passed to
/// every call is used as the app password.
pub struct WebDavBackend {
    settings: WebDavSettings,
    http: reqwest::Client,
}

impl WebDavBackend {
    pub fn new(settings: WebDavSettings) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RemoteError::Network(format!("Client build failed: {}", e)))?;
        Ok(Self { settings, http })
    }

    pub fn settings(&self) -> &WebDavSettings {
        &self.settings
    }

    fn host(&self) -> String {
        format!(
            "{}/remote.php/dav/files/{}",
            self.settings.server_url.trim_end_matches('/'),
            self.settings.username
        )
    }

    /// Remote path with exactly one leading and no trailing slash
    fn base(&self) -> String {
        match self.settings.remote_path.trim_matches('/') {
            "" => String::new(),
            path => format!("/{}", path),
        }
    }

    fn create_client(&self, auth: &AuthToken) -> Result<reqwest_dav::Client, RemoteError> {
        reqwest_dav::ClientBuilder::new()
            .set_agent(self.http.clone())
            .set_host(self.host())
            .set_auth(reqwest_dav::Auth::Basic(
                self.settings.username.clone(),
                auth.secret().to_string(),
            ))
            .build()
            .map_err(|e| RemoteError::Network(format!("WebDAV client error: {:?}", e)))
    }

    /// Creates every collection on the way to `path`; existing ones are fine
    async fn ensure_collections(&self, client: &reqwest_dav::Client, path: &str) {
        for dir in parent_collections(path) {
            if let Err(e) = client.mkcol(&dir).await {
                log::debug!("MKCOL {} note: {:?}", dir, e);
            }
        }
    }

    fn collection_path(&self, collection: &str) -> String {
        format!("{}/{}/{}", self.base(), RECORDS_DIR, collection)
    }

    fn record_path(&self, collection: &str, id: &str) -> String {
        format!("{}/{}.json", self.collection_path(collection), id)
    }

    async fn read_record(
        &self,
        collection: &str,
        id: &str,
        auth: &AuthToken,
    ) -> Result<Option<Map<String, Value>>, RemoteError> {
        let client = self.create_client(auth)?;
        let path = self.record_path(collection, id);
        // get() turns a 404 into an error; a missing record is not one
        let response = client
            .get_raw(&path)
            .await
            .map_err(|e| map_dav(e, &path))?;

        match response.status().as_u16() {
            404 => Ok(None),
            401 | 403 => Err(RemoteError::Auth(format!(
                "Server returned status: {}",
                response.status()
            ))),
            code if !response.status().is_success() => {
                let body = response.text().await.unwrap_or_default();
                Err(RemoteError::Status(code, body))
            }
            _ => response
                .json::<Map<String, Value>>()
                .await
                .map(Some)
                .map_err(|e| RemoteError::Decode(format!("{}/{}: {}", collection, id, e))),
        }
    }

    async fn write_record(
        &self,
        collection: &str,
        id: &str,
        fields: &Map<String, Value>,
        auth: &AuthToken,
    ) -> Result<(), RemoteError> {
        let client = self.create_client(auth)?;
        let path = self.record_path(collection, id);
        self.ensure_collections(&client, &path).await;
        let body = serde_json::to_vec(fields).map_err(|e| RemoteError::Decode(e.to_string()))?;
        client
            .put(&path, body)
            .await
            .map_err(|e| RemoteError::Network(format!("PUT {} failed: {:?}", path, e)))
    }
}

#[async_trait]
impl PhotoStorage for WebDavBackend {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        auth: &AuthToken,
    ) -> Result<String, RemoteError> {
        let client = self.create_client(auth)?;
        let remote_path = format!("{}/{}", self.base(), path.trim_start_matches('/'));
        self.ensure_collections(&client, &remote_path).await;

        let size = bytes.len();
        client
            .put(&remote_path, bytes)
            .await
            .map_err(|e| RemoteError::Network(format!("Failed to upload {}: {:?}", path, e)))?;
        log::info!("Uploaded photo {} ({} bytes)", remote_path, size);
        Ok(format!("{}{}", self.host(), remote_path))
    }
}

#[async_trait]
impl RecordStore for WebDavBackend {
    async fn get(
        &self,
        collection: &str,
        id: &str,
        auth: &AuthToken,
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        Ok(self
            .read_record(collection, id, auth)
            .await?
            .map(|fields| RemoteRecord {
                id: id.to_string(),
                fields,
            }))
    }

    async fn query_by_batch(
        &self,
        collection: &str,
        batch_id: &str,
        auth: &AuthToken,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let client = self.create_client(auth)?;
        let dir = self.collection_path(collection);
        self.ensure_collections(&client, &format!("{}/", dir)).await;

        let listing = client
            .list(&dir, reqwest_dav::Depth::Number(1))
            .await
            .map_err(|e| RemoteError::Network(format!("Listing {} failed: {:?}", dir, e)))?;

        let mut ids: Vec<String> = listing
            .into_iter()
            .filter_map(|item| match item {
                reqwest_dav::list_cmd::ListEntity::File(file) => record_id_from_href(&file.href),
                _ => None,
            })
            .collect();
        ids.sort();

        let mut records = Vec::new();
        for id in ids {
            if let Some(fields) = self.read_record(collection, &id, auth).await? {
                if fields.get(BATCH_ID_FIELD).and_then(Value::as_str) == Some(batch_id) {
                    records.push(RemoteRecord { id, fields });
                }
            }
        }
        Ok(records)
    }

    async fn patch(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
        auth: &AuthToken,
    ) -> Result<(), RemoteError> {
        let mut doc = self
            .read_record(collection, id, auth)
            .await?
            .ok_or_else(|| RemoteError::Status(404, format!("{}/{} not found", collection, id)))?;
        doc.extend(fields);
        stamp_updated_at(&mut doc);
        self.write_record(collection, id, &doc, auth).await?;
        log::debug!("Patched {}/{}", collection, id);
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        id: Option<&str>,
        fields: Map<String, Value>,
        auth: &AuthToken,
    ) -> Result<String, RemoteError> {
        let id = match id {
            Some(id) => id.to_string(),
            None => ulid::Ulid::new().to_string(),
        };
        let mut doc = self
            .read_record(collection, &id, auth)
            .await?
            .unwrap_or_default();
        doc.extend(fields);
        stamp_updated_at(&mut doc);
        self.write_record(collection, &id, &doc, auth).await?;
        log::debug!("Upserted {}/{}", collection, id);
        Ok(id)
    }
}

fn map_dav(e: reqwest_dav::Error, path: &str) -> RemoteError {
    match e {
        reqwest_dav::Error::Reqwest(e) if e.is_timeout() => RemoteError::Timeout,
        e => RemoteError::Network(format!("GET {} failed: {:?}", path, e)),
    }
}

fn stamp_updated_at(doc: &mut Map<String, Value>) {
    doc.insert(
        UPDATED_AT_FIELD.to_string(),
        Value::from(chrono::Utc::now().timestamp_millis()),
    );
}

/// `a/b/c.jpg` -> `["a", "a/b"]`, keeping a leading slash if present
fn parent_collections(path: &str) -> Vec<String> {
    let leading = if path.starts_with('/') { "/" } else { "" };
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    let dirs = parts.len().saturating_sub(if path.ends_with('/') { 0 } else { 1 });
    (1..=dirs)
        .map(|n| format!("{}{}", leading, parts[..n].join("/")))
        .collect()
}

/// Record id of a listed `<id>.json` file
fn record_id_from_href(href: &str) -> Option<String> {
    let name = href.trim_end_matches('/').rsplit('/').next()?;
    let id = name.strip_suffix(".json")?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}
