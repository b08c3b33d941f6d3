use std::time::Duration;
use tokio::task::JoinHandle;
use upload_queue::Connectivity;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Nextcloud answers `status.php` without authentication
pub fn probe_url(server_url: &str) -> String {
    format!("{}/status.php", server_url.trim_end_matches('/'))
}

/// Checks once whether the server answers
pub async fn check_reachable(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(response) => {
            if response.status().is_success() {
                true
            } else {
                log::debug!("Probe {} answered HTTP {}", url, response.status());
                false
            }
        }
        Err(e) => {
            log::debug!("Probe {} failed: {}", url, e);
            false
        }
    }
}

/// Feeds the connectivity signal from periodic reachability checks
pub fn spawn_probe(
    server_url: &str,
    connectivity: Connectivity,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            log::error!("Could not build probe client, assuming online: {}", e);
            connectivity.set_online(true);
            return None;
        }
    };
    let url = probe_url(server_url);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let online = check_reachable(&client, &url).await;
            connectivity.set_online(online);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_url() {
        assert_eq!(
            probe_url("https://cloud.example.org/"),
            "https://cloud.example.org/status.php"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_offline() {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        assert!(!check_reachable(&client, "http://127.0.0.1:9/status.php").await);
    }
}
