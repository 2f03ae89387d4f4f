use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::chain::rpc::DEFAULT_FUNDING_WEI;
use crate::ports::PortBases;

/// Image embedding a dev chain with the protocol contracts pre-deployed
pub const DEFAULT_CHAIN_IMAGE: &str = "livepeer/geth-with-livepeer-protocol:confluence";

/// Controller contract address baked into the default chain image
pub const DEFAULT_CONTROLLER_ADDRESS: &str = "0x04B9De88c81cda06165CF65a908e5f1EFBB9493B";

/// Harness configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    // Chain fixture
    pub chain_image: String,
    pub controller_address: Address,
    pub chain_startup_timeout: Duration,

    // Node process
    pub node_binary: String,
    pub node_network: String,
    pub block_polling_interval_seconds: u64,

    // Port allocation
    pub port_bases: PortBases,

    // Polling cadence
    pub readiness_poll_interval: Duration,
    pub round_poll_interval: Duration,
    pub registration_retry_interval: Duration,

    // Accounts
    pub funding_amount_wei: U256,
    // Empty by default, matching the dev chain's unlocked accounts
    pub keystore_password: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            chain_image: DEFAULT_CHAIN_IMAGE.to_string(),
            controller_address: Address::from_str(DEFAULT_CONTROLLER_ADDRESS)
                .unwrap_or(Address::ZERO),
            chain_startup_timeout: Duration::from_secs(60),
            node_binary: "livepeer".to_string(),
            node_network: "devnet".to_string(),
            block_polling_interval_seconds: 1,
            port_bases: PortBases::default(),
            readiness_poll_interval: Duration::from_millis(200),
            round_poll_interval: Duration::from_millis(500),
            registration_retry_interval: Duration::from_millis(200),
            funding_amount_wei: DEFAULT_FUNDING_WEI,
            keystore_password: String::new(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from environment variables
    ///
    /// Every variable is optional; unset ones fall back to `HarnessConfig::default()`.
    /// - CHAIN_IMAGE: chain container image
    /// - CHAIN_CONTROLLER_ADDRESS: protocol controller contract (0x...)
    /// - CHAIN_STARTUP_TIMEOUT_SECONDS: how long to wait for the container's RPC (default: 60)
    /// - NODE_BINARY: node executable (default: livepeer)
    /// - NODE_NETWORK: node network flag (default: devnet)
    /// - BLOCK_POLLING_INTERVAL_SECONDS: node block polling interval (default: 1)
    /// - HTTP_PORT_BASE / CLI_PORT_BASE / RTMP_PORT_BASE: first port of each category
    /// - READINESS_POLL_INTERVAL_MS (default: 200)
    /// - ROUND_POLL_INTERVAL_MS (default: 500)
    /// - REGISTRATION_RETRY_INTERVAL_MS (default: 200)
    /// - FUNDING_AMOUNT_WEI: ETH granted to new accounts (default: 100 ETH)
    /// - KEYSTORE_PASSWORD: password for created keystores (default: empty)
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenv::dotenv().ok();

        let defaults = Self::default();

        let chain_image = env::var("CHAIN_IMAGE").unwrap_or(defaults.chain_image);

        let controller_address = match env::var("CHAIN_CONTROLLER_ADDRESS") {
            Ok(raw) => Address::from_str(raw.trim())
                .context("CHAIN_CONTROLLER_ADDRESS must be a 0x-prefixed 20-byte hex address")?,
            Err(_) => defaults.controller_address,
        };

        let chain_startup_timeout = Duration::from_secs(
            env::var("CHAIN_STARTUP_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse::<u64>()
                .context("CHAIN_STARTUP_TIMEOUT_SECONDS must be a valid number")?,
        );

        let node_binary = env::var("NODE_BINARY").unwrap_or(defaults.node_binary);
        let node_network = env::var("NODE_NETWORK").unwrap_or(defaults.node_network);

        let block_polling_interval_seconds = env::var("BLOCK_POLLING_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "1".to_string())
            .parse::<u64>()
            .context("BLOCK_POLLING_INTERVAL_SECONDS must be a valid number")?;

        let port_bases = PortBases {
            http: parse_port("HTTP_PORT_BASE", defaults.port_bases.http)?,
            cli: parse_port("CLI_PORT_BASE", defaults.port_bases.cli)?,
            rtmp: parse_port("RTMP_PORT_BASE", defaults.port_bases.rtmp)?,
        };

        let readiness_poll_interval = parse_millis("READINESS_POLL_INTERVAL_MS", 200)?;
        let round_poll_interval = parse_millis("ROUND_POLL_INTERVAL_MS", 500)?;
        let registration_retry_interval = parse_millis("REGISTRATION_RETRY_INTERVAL_MS", 200)?;

        let funding_amount_wei = match env::var("FUNDING_AMOUNT_WEI") {
            Ok(raw) => U256::from_str(raw.trim())
                .context("FUNDING_AMOUNT_WEI must be a valid number")?,
            Err(_) => defaults.funding_amount_wei,
        };

        let keystore_password = env::var("KEYSTORE_PASSWORD").unwrap_or_default();

        Ok(Self {
            chain_image,
            controller_address,
            chain_startup_timeout,
            node_binary,
            node_network,
            block_polling_interval_seconds,
            port_bases,
            readiness_poll_interval,
            round_poll_interval,
            registration_retry_interval,
            funding_amount_wei,
            keystore_password,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.chain_image.trim().is_empty() {
            anyhow::bail!("Chain image cannot be empty");
        }

        if self.controller_address == Address::ZERO {
            anyhow::bail!("Controller address cannot be the zero address");
        }

        if self.node_binary.trim().is_empty() {
            anyhow::bail!("Node binary cannot be empty");
        }

        if self.readiness_poll_interval.is_zero()
            || self.round_poll_interval.is_zero()
            || self.registration_retry_interval.is_zero()
        {
            anyhow::bail!("Polling intervals must be positive");
        }

        if self.chain_startup_timeout.is_zero() {
            anyhow::bail!("Chain startup timeout must be positive");
        }

        // Ports are handed out upwards from each base
        self.port_bases
            .check()
            .context("Invalid port bases (HTTP_PORT_BASE / CLI_PORT_BASE / RTMP_PORT_BASE)")?;

        Ok(())
    }
}

fn parse_port(var: &str, default: u16) -> Result<u16> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u16>()
            .with_context(|| format!("{} must be a valid port number", var)),
        Err(_) => Ok(default),
    }
}

fn parse_millis(var: &str, default: u64) -> Result<Duration> {
    let millis = env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .parse::<u64>()
        .with_context(|| format!("{} must be a valid number", var))?;
    Ok(Duration::from_millis(millis))
}
