use alloy_primitives::U256;
use anyhow::{Context, Result};
use std::time::Duration;
use tracing::debug;

use crate::chain::ChainClient;

/// Waits on protocol round progress by polling the chain
///
/// No timeout is applied; wrap calls in `tokio::time::timeout` to bound them.
#[derive(Debug, Clone)]
pub struct RoundSynchronizer {
    interval: Duration,
}

impl RoundSynchronizer {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Block until the chain reports a round strictly greater than `from`
    ///
    /// Returns the observed round. Query errors end the wait immediately.
    pub async fn wait_for_next_round<C>(&self, client: &C, from: U256) -> Result<U256>
    where
        C: ChainClient + ?Sized,
    {
        loop {
            let round = client
                .current_round()
                .await
                .context("Failed to query current round")?;
            if round > from {
                debug!("Round advanced from {} to {}", from, round);
                return Ok(round);
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Block until the current round is initialized
    pub async fn wait_until_round_initialized<C>(&self, client: &C) -> Result<()>
    where
        C: ChainClient + ?Sized,
    {
        loop {
            let initialized = client
                .current_round_initialized()
                .await
                .context("Failed to query round initialization")?;
            if initialized {
                return Ok(());
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
