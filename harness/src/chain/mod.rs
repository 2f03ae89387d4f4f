//! Settlement-chain access: the container fixture and the client capability surface

pub mod fixture;
pub mod rpc;

#[cfg(test)]
pub(crate) mod mock;

use alloy_primitives::{Address, U256};
use anyhow::Result;
use async_trait::async_trait;

pub use fixture::ChainFixture;
pub use rpc::RpcChainClient;

/// Registration state of a transcoder in the bonding manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscoderStatus {
    NotRegistered,
    Registered,
}

impl TranscoderStatus {
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::NotRegistered),
            1 => Ok(Self::Registered),
            other => anyhow::bail!("Unknown transcoder status code {}", other),
        }
    }
}

impl std::fmt::Display for TranscoderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRegistered => write!(f, "NotRegistered"),
            Self::Registered => write!(f, "Registered"),
        }
    }
}

/// Snapshot of a transcoder's on-chain record
///
/// `reward_cut` and `fee_share` are in perc units, where 1% is 10000.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscoderInfo {
    pub status: TranscoderStatus,
    pub active: bool,
    pub reward_cut: U256,
    pub fee_share: U256,
    pub delegated_stake: U256,
}

/// Chain operations the harness depends on
///
/// Implementations are expected to surface every query or transaction failure
/// as an error; callers treat those errors as fatal.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current protocol round
    async fn current_round(&self) -> Result<U256>;

    /// Whether the current round has been initialized
    async fn current_round_initialized(&self) -> Result<bool>;

    /// Initialize the current round. A no-op when it already is.
    async fn initialize_round(&self) -> Result<()>;

    /// Grant test currency (ETH and protocol tokens) to `account`
    async fn fund_account(&self, account: Address) -> Result<()>;

    /// ETH balance of `account` in wei
    async fn balance(&self, account: Address) -> Result<U256>;

    /// Whether `account` is in the active transcoder set for the current round
    async fn is_active_transcoder(&self, account: Address) -> Result<bool>;

    /// Total stake delegated to `account` as a transcoder
    async fn transcoder_total_stake(&self, account: Address) -> Result<U256>;

    /// Registration status, activity, commission rates and delegated stake of `account`
    async fn transcoder_info(&self, account: Address) -> Result<TranscoderInfo>;
}
