use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{debug, info};

use crate::chain::{ChainClient, TranscoderInfo, TranscoderStatus};
use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::node::{NodeHandle, NodeState};
use crate::rounds::RoundSynchronizer;

/// Percent to the bonding manager's perc units (1% is 10000)
pub fn from_perc(percent: f64) -> U256 {
    U256::from((percent.max(0.0) * 10_000.0).round() as u64)
}

/// Orchestrator parameters posted to `/activateOrchestrator`
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorRegistration {
    pub price_per_unit: u64,
    pub pixels_per_unit: u64,
    /// Percent of block rewards kept by the orchestrator
    pub block_reward_cut: f64,
    /// Percent of fees shared with delegators
    pub fee_share: f64,
    /// Advertised service URI; `http://{httpAddr}` of the node when unset
    pub service_uri: Option<String>,
    pub stake_amount: U256,
}

impl Default for OrchestratorRegistration {
    fn default() -> Self {
        Self {
            price_per_unit: 1,
            pixels_per_unit: 10,
            block_reward_cut: 30.0,
            fee_share: 50.0,
            service_uri: None,
            stake_amount: U256::from(50u64),
        }
    }
}

impl OrchestratorRegistration {
    /// Form fields for `node`
    pub fn to_form(&self, node: &NodeHandle) -> Vec<(&'static str, String)> {
        let service_uri = self
            .service_uri
            .clone()
            .unwrap_or_else(|| format!("http://{}", node.config().http_addr));

        vec![
            ("pricePerUnit", self.price_per_unit.to_string()),
            ("pixelsPerUnit", self.pixels_per_unit.to_string()),
            ("blockRewardCut", self.block_reward_cut.to_string()),
            ("feeShare", self.fee_share.to_string()),
            ("serviceURI", service_uri),
            ("amount", self.stake_amount.to_string()),
        ]
    }

    /// Check `account`'s on-chain transcoder record against these parameters
    ///
    /// Requires a registered, active transcoder whose reward cut, fee share and
    /// delegated stake all match. Every mismatch is reported in one error.
    pub async fn verify_on_chain<C>(&self, chain: &C, account: Address) -> Result<TranscoderInfo>
    where
        C: ChainClient + ?Sized,
    {
        let info = chain
            .transcoder_info(account)
            .await
            .context("Failed to read transcoder record")?;

        let mut mismatches = Vec::new();
        if info.status != TranscoderStatus::Registered {
            mismatches.push(format!("status {}", info.status));
        }
        if !info.active {
            mismatches.push("not active".to_string());
        }
        let reward_cut = from_perc(self.block_reward_cut);
        if info.reward_cut != reward_cut {
            mismatches.push(format!("reward cut {} != {}", info.reward_cut, reward_cut));
        }
        let fee_share = from_perc(self.fee_share);
        if info.fee_share != fee_share {
            mismatches.push(format!("fee share {} != {}", info.fee_share, fee_share));
        }
        if info.delegated_stake != self.stake_amount {
            mismatches.push(format!(
                "delegated stake {} != {}",
                info.delegated_stake, self.stake_amount
            ));
        }

        if !mismatches.is_empty() {
            anyhow::bail!(
                "Transcoder {} does not match registration: {}",
                account,
                mismatches.join(", ")
            );
        }

        debug!(account = %account, "On-chain transcoder record matches registration");
        Ok(info)
    }
}

/// Outcome of a completed registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationReceipt {
    /// POSTs issued, including the accepted one
    pub attempts: u32,
    /// Round observed right before the accepted POST
    pub registered_round: U256,
    /// First round past `registered_round`; registration is in effect from here
    pub active_round: U256,
}

/// Registers a node as orchestrator and waits for it to take effect
pub struct RegistrationProtocol {
    client: reqwest::Client,
    retry_interval: Duration,
    rounds: RoundSynchronizer,
}

impl RegistrationProtocol {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            retry_interval: config.registration_retry_interval,
            rounds: RoundSynchronizer::new(config.round_poll_interval),
        }
    }

    /// POST the registration until accepted, then wait for the next round
    ///
    /// Rejections and transport errors are retried at a fixed interval with no
    /// cap. Chain query errors are fatal. The node must be `Ready`; it ends up
    /// `Active`.
    pub async fn register<C>(
        &self,
        node: &NodeHandle,
        chain: &C,
        params: &OrchestratorRegistration,
    ) -> Result<RegistrationReceipt>
    where
        C: ChainClient + ?Sized,
    {
        let state = node.state();
        if state != NodeState::Ready {
            return Err(HarnessError::IllegalTransition {
                from: state,
                to: NodeState::Registered,
            }
            .into());
        }

        let url = format!("http://{}/activateOrchestrator", node.cli_addr());
        let form = params.to_form(node);
        info!(url = %url, "📝 Registering orchestrator");

        let mut attempts = 0u32;
        let registered_round = loop {
            let round = chain
                .current_round()
                .await
                .context("Failed to query current round before registration")?;
            attempts += 1;

            match self.client.post(&url).form(&form).send().await {
                Ok(response) if response.status().is_success() => break round,
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    debug!(attempt = attempts, "Registration rejected: HTTP {} {}", status, body)
                }
                Err(e) => debug!(attempt = attempts, "Registration request failed: {}", e),
            }
            tokio::time::sleep(self.retry_interval).await;
        };

        node.transition(NodeState::Registered)?;
        info!(
            attempts,
            round = %registered_round,
            "Registration accepted, waiting for next round"
        );

        let active_round = self
            .rounds
            .wait_for_next_round(chain, registered_round)
            .await?;
        node.transition(NodeState::Active)?;
        info!(round = %active_round, "✅ Orchestrator active");

        Ok(RegistrationReceipt {
            attempts,
            registered_round,
            active_round,
        })
    }
}
