//! Integration-test harness for chain-backed media nodes
//!
//! Boots a throwaway settlement chain, provisions funded accounts, launches
//! node processes and drives them through on-chain registration.

pub mod accounts;
pub mod chain;
pub mod config;
pub mod error;
pub mod node;
pub mod ports;
pub mod registration;
pub mod rounds;

pub use accounts::{AccountProvisioner, DevAccount, ExistingAccount, ProvisionedAccount};
pub use chain::{ChainClient, ChainFixture, RpcChainClient, TranscoderInfo, TranscoderStatus};
pub use config::HarnessConfig;
pub use error::HarnessError;
pub use node::{NodeConfig, NodeHandle, NodeLauncher, NodeRole, NodeState};
pub use ports::{NodeAddresses, PortAllocator, PortBases, MAX_NODES_PER_RUN};
pub use registration::{from_perc, OrchestratorRegistration, RegistrationProtocol, RegistrationReceipt};
pub use rounds::RoundSynchronizer;
