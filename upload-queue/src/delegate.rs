//! Request/response exchange between a background context and a
//! foreground view.
//!
//! The background runner cannot hold a live storage client or a user
//! credential. It sends a [`DelegateRequest`] to whichever foreground view
//! is attached and waits for the reply with a bounded timeout. When no view
//! is attached the call fails with [`RemoteError::Unavailable`] and the
//! drain cycle is retried later.

use crate::config::QueueConfig;
use crate::error::RemoteError;
use crate::remote::{AuthProvider, AuthToken, PhotoStorage};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 16;

/// A call the background context asks a foreground view to perform
#[derive(Debug)]
pub enum DelegateRequest {
    Upload {
        path: String,
        bytes: Vec<u8>,
        auth: AuthToken,
        reply: oneshot::Sender<Result<String, RemoteError>>,
    },
    AuthToken {
        reply: oneshot::Sender<Option<AuthToken>>,
    },
}

/// Background end of the exchange.
///
/// Implements [`PhotoStorage`] and [`AuthProvider`] by forwarding to the
/// first attached foreground view that is still listening.
#[derive(Clone)]
pub struct ForegroundLink {
    clients: Arc<Mutex<Vec<mpsc::Sender<DelegateRequest>>>>,
    upload_timeout: Duration,
    auth_timeout: Duration,
}

impl ForegroundLink {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            clients: Arc::new(Mutex::new(Vec::new())),
            upload_timeout: config.delegate_upload_timeout(),
            auth_timeout: config.delegate_auth_timeout(),
        }
    }

    /// Registers a foreground view. Dropping the receiver detaches it.
    pub fn attach(&self) -> mpsc::Receiver<DelegateRequest> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        if let Ok(mut clients) = self.clients.lock() {
            clients.push(tx);
        }
        rx
    }

    pub fn has_client(&self) -> bool {
        self.client().is_some()
    }

    fn client(&self) -> Option<mpsc::Sender<DelegateRequest>> {
        let mut clients = self.clients.lock().ok()?;
        clients.retain(|c| !c.is_closed());
        clients.first().cloned()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DelegateRequest,
        timeout: Duration,
    ) -> Result<T, RemoteError> {
        let client = self.client().ok_or(RemoteError::Unavailable)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        client
            .send(make(reply_tx))
            .await
            .map_err(|_| RemoteError::Unavailable)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            // view went away without answering
            Ok(Err(_)) => Err(RemoteError::Unavailable),
            Err(_) => Err(RemoteError::Timeout),
        }
    }
}

#[async_trait]
impl PhotoStorage for ForegroundLink {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        auth: &AuthToken,
    ) -> Result<String, RemoteError> {
        let path = path.to_string();
        let auth = auth.clone();
        self.request(
            |reply| DelegateRequest::Upload {
                path,
                bytes,
                auth,
                reply,
            },
            self.upload_timeout,
        )
        .await?
    }
}

#[async_trait]
impl AuthProvider for ForegroundLink {
    async fn auth_token(&self) -> Option<AuthToken> {
        match self
            .request(|reply| DelegateRequest::AuthToken { reply }, self.auth_timeout)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                log::debug!("No credential from foreground: {}", e);
                None
            }
        }
    }
}

/// Foreground end: answers requests with the view's own storage client and
/// credential until the link is dropped. Uploads run concurrently so a slow
/// upload does not hold up credential requests.
pub fn serve_foreground(
    mut requests: mpsc::Receiver<DelegateRequest>,
    storage: Arc<dyn PhotoStorage>,
    auth: Arc<dyn AuthProvider>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            match request {
                DelegateRequest::Upload {
                    path,
                    bytes,
                    auth: token,
                    reply,
                } => {
                    let storage = Arc::clone(&storage);
                    tokio::spawn(async move {
                        let result = storage.upload(&path, bytes, &token).await;
                        if reply.send(result).is_err() {
                            log::debug!("Delegated upload of {} finished after timeout", path);
                        }
                    });
                }
                DelegateRequest::AuthToken { reply } => {
                    let _ = reply.send(auth.auth_token().await);
                }
            }
        }
        log::debug!("Foreground delegate detached");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{token, MemoryRemote, StaticAuth};

    fn link() -> ForegroundLink {
        ForegroundLink::new(&QueueConfig::default())
    }

    #[tokio::test]
    async fn test_without_foreground_everything_is_unavailable() {
        let link = link();
        assert!(!link.has_client());
        assert_eq!(
            link.upload("a.jpg", vec![1], &token()).await,
            Err(RemoteError::Unavailable)
        );
        assert!(link.auth_token().await.is_none());
    }

    #[tokio::test]
    async fn test_requests_are_answered_by_foreground() {
        let link = link();
        let remote = MemoryRemote::new();
        let server = serve_foreground(
            link.attach(),
            remote.clone(),
            Arc::new(StaticAuth(Some(token()))),
        );

        let url = link.upload("expenses/B1/0_0.jpg", vec![1, 2], &token()).await.unwrap();
        assert!(url.starts_with("https://storage.test/expenses/B1/0_0.jpg"));
        assert_eq!(remote.uploads(), vec!["expenses/B1/0_0.jpg".to_string()]);
        assert_eq!(link.auth_token().await, Some(token()));
        server.abort();
    }

    #[tokio::test]
    async fn test_upload_errors_are_passed_through() {
        let link = link();
        let remote = MemoryRemote::new();
        remote.fail_next_uploads(1);
        let _server = serve_foreground(link.attach(), remote, Arc::new(StaticAuth(None)));
        assert!(matches!(
            link.upload("a.jpg", vec![1], &token()).await,
            Err(RemoteError::Network(_))
        ));
        assert!(link.auth_token().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_foreground_times_out() {
        let link = link();
        let _rx = link.attach();
        assert_eq!(
            link.upload("a.jpg", vec![1], &token()).await,
            Err(RemoteError::Timeout)
        );
        assert!(link.auth_token().await.is_none());
    }

    #[tokio::test]
    async fn test_detached_views_are_pruned() {
        let link = link();
        let rx = link.attach();
        assert!(link.has_client());
        drop(rx);
        assert!(!link.has_client());
        assert_eq!(
            link.upload("a.jpg", vec![1], &token()).await,
            Err(RemoteError::Unavailable)
        );
    }
}
