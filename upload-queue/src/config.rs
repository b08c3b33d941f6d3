use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for a single backoff delay (one year)
const MAX_BACKOFF_SECS: u64 = 365 * 24 * 60 * 60;

/// Tunables for the queue, the upload engine and the background runner.
///
/// Every recognised field is listed here with its default; unknown keys are
/// rejected when deserializing so a typo in a config file fails loudly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Attempts per task before it is marked failed and its photo purged
    pub max_retries: u32,
    /// Age after which an `uploading` task is presumed abandoned
    pub stale_after_secs: u64,
    /// Periodic drain interval of the background runner
    pub drain_interval_secs: u64,
    /// Bound for a delegated upload answered by a foreground view
    pub delegate_upload_timeout_secs: u64,
    /// Bound for fetching a credential from a foreground view
    pub delegate_auth_timeout_secs: u64,
    /// Photo tasks uploaded in parallel within one drain cycle
    pub concurrent_uploads: usize,
    /// Base delay of the capped exponential backoff, 0 disables it
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    /// Quiet period before a working copy is written back to the store
    pub autosave_debounce_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            stale_after_secs: 5 * 60,
            drain_interval_secs: 30,
            delegate_upload_timeout_secs: 60,
            delegate_auth_timeout_secs: 2,
            concurrent_uploads: 5,
            backoff_base_secs: 0,
            backoff_cap_secs: 300,
            autosave_debounce_ms: 3000,
        }
    }
}

impl QueueConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs.max(1))
    }

    pub fn delegate_upload_timeout(&self) -> Duration {
        Duration::from_secs(self.delegate_upload_timeout_secs)
    }

    pub fn delegate_auth_timeout(&self) -> Duration {
        Duration::from_secs(self.delegate_auth_timeout_secs)
    }

    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }

    /// Delay before the next attempt after `retries` failures, or `None`
    /// when backoff is disabled.
    pub fn backoff_after(&self, retries: u32) -> Option<chrono::Duration> {
        if self.backoff_base_secs == 0 || retries == 0 {
            return None;
        }
        let base = self
            .backoff_base_secs
            .saturating_mul(1 << (retries - 1).min(10));
        let capped = base.min(self.backoff_cap_secs).min(MAX_BACKOFF_SECS);
        // Jitter within the upper half so retries from many devices spread out
        let jitter = rand::random::<u64>() % (capped / 2 + 1);
        Some(chrono::Duration::seconds((capped / 2 + jitter) as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_observed_constants() {
        let config = QueueConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.stale_after(), chrono::Duration::minutes(5));
        assert_eq!(config.drain_interval(), Duration::from_secs(30));
        assert_eq!(config.delegate_upload_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let parsed: Result<QueueConfig, _> =
            serde_json::from_str(r#"{"max_retries": 3, "maxRetry": 9}"#);
        assert!(parsed.is_err());

        let parsed: QueueConfig = serde_json::from_str(r#"{"max_retries": 3}"#).unwrap();
        assert_eq!(parsed.max_retries, 3);
        assert_eq!(parsed.drain_interval_secs, 30);
    }

    #[test]
    fn test_backoff_disabled_by_default() {
        assert!(QueueConfig::default().backoff_after(3).is_none());
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = QueueConfig {
            backoff_base_secs: 60,
            backoff_cap_secs: 300,
            ..Default::default()
        };
        for retries in 1..8 {
            let delay = config.backoff_after(retries).unwrap();
            assert!(delay <= chrono::Duration::seconds(300));
            assert!(delay >= chrono::Duration::seconds(30));
        }
    }

    #[test]
    fn test_backoff_with_huge_base_saturates() {
        let config = QueueConfig {
            backoff_base_secs: u64::MAX / 2,
            backoff_cap_secs: u64::MAX,
            ..Default::default()
        };
        let delay = config.backoff_after(8).unwrap();
        assert!(delay <= chrono::Duration::days(365));
        assert!(delay >= chrono::Duration::days(182));
    }
}
