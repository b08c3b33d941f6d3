use std::fmt;
use upload_queue::{QueueError, RemoteError};

/// Central error types for the expense sync daemon
#[derive(Debug)]
pub enum AppError {
    /// Queue or durable store error
    Queue(QueueError),
    /// Remote backend could not be set up
    Remote(RemoteError),
    /// Filesystem error
    Filesystem(std::io::Error),
    /// Configuration file could not be parsed
    Config(toml::de::Error),
    /// Validation error (e.g. invalid arguments)
    Validation(String),
    /// Resource not found
    NotFound(String),
    /// General error
    Other(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AppError::Queue(e) => write!(f, "Queue error: {}", e),
            AppError::Remote(e) => write!(f, "Remote error: {}", e),
            AppError::Filesystem(e) => write!(f, "Filesystem error: {}", e),
            AppError::Config(e) => write!(f, "Configuration error: {}", e),
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for AppError {}

// Conversions from other error types
impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        AppError::Queue(e)
    }
}

impl From<RemoteError> for AppError {
    fn from(e: RemoteError) -> Self {
        AppError::Remote(e)
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Filesystem(e)
    }
}

impl From<toml::de::Error> for AppError {
    fn from(e: toml::de::Error) -> Self {
        AppError::Config(e)
    }
}

/// Short messages for terminal output
impl AppError {
    pub fn user_message(&self) -> String {
        match self {
            AppError::Queue(_) => {
                "The local upload queue could not be read. Please try again.".to_string()
            }
            AppError::Remote(_) => "The server could not be reached.".to_string(),
            AppError::Filesystem(_) => {
                "Error accessing files. Please check directory permissions.".to_string()
            }
            AppError::Config(e) => format!("The configuration file is invalid: {}", e.message()),
            AppError::Validation(msg) => msg.clone(),
            AppError::NotFound(msg) => format!("{} was not found.", msg),
            AppError::Other(msg) => msg.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_internals() {
        let err = AppError::from(QueueError::Other("lock poisoned".to_string()));
        assert!(!err.user_message().contains("poisoned"));
        assert_eq!(
            AppError::NotFound("webdav settings".to_string()).user_message(),
            "webdav settings was not found."
        );
    }
}
