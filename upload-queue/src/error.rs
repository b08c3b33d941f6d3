use std::fmt;

/// Result type for queue and store operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised by the durable store and queue bookkeeping
#[derive(Debug)]
pub enum QueueError {
    /// Database error (rusqlite)
    Database(rusqlite::Error),
    /// A stored document could not be (de)serialized
    Serialization(serde_json::Error),
    /// Remote storage or record store failure
    Remote(RemoteError),
    /// Caller supplied invalid input
    Validation(String),
    /// Resource not found
    NotFound(String),
    /// General error
    Other(String),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueueError::Database(e) => write!(f, "Database error: {}", e),
            QueueError::Serialization(e) => write!(f, "Serialization error: {}", e),
            QueueError::Remote(e) => write!(f, "Remote error: {}", e),
            QueueError::Validation(msg) => write!(f, "Validation error: {}", msg),
            QueueError::NotFound(msg) => write!(f, "Not found: {}", msg),
            QueueError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Database(e)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e)
    }
}

impl From<RemoteError> for QueueError {
    fn from(e: RemoteError) -> Self {
        QueueError::Remote(e)
    }
}

/// Errors reported by remote storage, the remote record store or the
/// foreground delegation channel
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Transport failure (DNS, TLS, connection reset)
    Network(String),
    /// Server answered with a non-success status
    Status(u16, String),
    /// No answer within the allotted time
    Timeout,
    /// No foreground view is available to perform a delegated call
    Unavailable,
    /// Credential missing or rejected
    Auth(String),
    /// Response body could not be decoded
    Decode(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Network(e) => write!(f, "network error: {}", e),
            RemoteError::Status(code, body) => write!(f, "remote answered {}: {}", code, body),
            RemoteError::Timeout => write!(f, "remote call timed out"),
            RemoteError::Unavailable => write!(f, "no foreground context available"),
            RemoteError::Auth(e) => write!(f, "authorization failed: {}", e),
            RemoteError::Decode(e) => write!(f, "could not decode response: {}", e),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Why a single task did not complete
#[derive(Debug, Clone, PartialEq)]
pub enum TaskFailure {
    /// The cached photo payload is gone; nothing left to upload
    PhotoBlobMissing,
    /// The upload succeeded but the parent record cannot be resolved
    ParentMissing,
    /// The task reached the retry bound before this attempt
    RetriesExhausted,
    /// Anything else; the task goes back to pending until the retry bound
    Retryable(String),
}

impl TaskFailure {
    /// Stable code recorded on the task and in logs
    pub fn code(&self) -> &'static str {
        match self {
            TaskFailure::PhotoBlobMissing => "PHOTO_BLOB_MISSING",
            TaskFailure::ParentMissing => "EXPENSE_DOC_MISSING",
            TaskFailure::RetriesExhausted => "RETRIES_EXHAUSTED",
            TaskFailure::Retryable(_) => "RETRYABLE",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskFailure::Retryable(_))
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::PhotoBlobMissing => write!(f, "Missing cached photo for upload task"),
            TaskFailure::ParentMissing => write!(f, "Expense document missing"),
            TaskFailure::RetriesExhausted => write!(f, "Retry limit reached"),
            TaskFailure::Retryable(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<RemoteError> for TaskFailure {
    fn from(e: RemoteError) -> Self {
        TaskFailure::Retryable(e.to_string())
    }
}

impl From<QueueError> for TaskFailure {
    fn from(e: QueueError) -> Self {
        TaskFailure::Retryable(e.to_string())
    }
}
