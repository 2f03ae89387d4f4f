use reqwest::StatusCode;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info};

/// Polls a node's `/status` endpoint until it answers 200
///
/// Transport errors and non-200 responses both count as "not ready yet".
/// There is no upper bound on the number of polls.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    client: reqwest::Client,
    status_url: String,
    interval: Duration,
}

impl ReadinessProbe {
    pub fn new(cli_addr: SocketAddr, interval: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
            status_url: format!("http://{}/status", cli_addr),
            interval,
        }
    }

    pub fn status_url(&self) -> &str {
        &self.status_url
    }

    /// Poll until ready, then call `on_ready` exactly once
    ///
    /// Returns the number of polls issued, including the successful one.
    pub async fn run<F>(self, on_ready: F) -> u64
    where
        F: FnOnce() + Send,
    {
        let mut polls = 0u64;
        loop {
            tokio::time::sleep(self.interval).await;
            polls += 1;

            match self.client.get(&self.status_url).send().await {
                Ok(response) if response.status() == StatusCode::OK => break,
                Ok(response) => {
                    debug!(url = %self.status_url, "Node not ready: HTTP {}", response.status())
                }
                Err(e) => debug!(url = %self.status_url, "Node not ready: {}", e),
            }
        }

        info!(url = %self.status_url, polls, "✅ Node ready");
        on_ready();
        polls
    }
}
