use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use upload_queue::{QueueConfig, WebDavSettings};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "EXPENSE_SYNC_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "./expense-sync.toml";

/// Daemon configuration, loaded from a TOML file.
///
/// ```toml
/// database_path = "./data/expense-sync.db"
///
/// [queue]
/// max_retries = 5
/// drain_interval_secs = 30
///
/// [webdav]
/// server_url = "https://cloud.example.org"
/// username = "driver"
/// app_password = "xxxxx-xxxxx"
/// remote_path = "/ExpenseSync"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub database_path: PathBuf,
    /// Seconds between reachability checks of the server
    pub probe_interval_secs: u64,
    pub queue: QueueConfig,
    pub webdav: Option<WebDavSettings>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/expense-sync.db"),
            probe_interval_secs: 15,
            queue: QueueConfig::default(),
            webdav: None,
        }
    }
}

impl AppConfig {
    pub fn parse(text: &str) -> Result<Self, AppError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, AppError> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                log::debug!("Loading configuration from {:?}", path);
                Self::parse(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No configuration at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(AppError::Filesystem(e)),
        }
    }

    pub fn webdav(&self) -> Result<&WebDavSettings, AppError> {
        self.webdav
            .as_ref()
            .ok_or_else(|| AppError::NotFound("[webdav] section in the configuration".to_string()))
    }
}

/// Config path from the command line, the environment or the default
pub fn config_path(cli: Option<&str>) -> PathBuf {
    cli.map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}
