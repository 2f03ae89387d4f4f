//! Shared environment for end-to-end scenarios

#![allow(dead_code)]

use anyhow::{Context, Result};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing::warn;

use node_harness::{
    AccountProvisioner, ChainClient, ChainFixture, ExistingAccount, HarnessConfig, NodeHandle,
    NodeLauncher, NodeRole,
};

/// Backstop for the unbounded readiness and round barriers
pub const NODE_READY_TIMEOUT: Duration = Duration::from_secs(120);
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(300);

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "node_harness=info".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A chain fixture plus the launcher nodes are started from
pub struct TestEnv {
    pub config: HarnessConfig,
    pub chain: ChainFixture,
    pub launcher: NodeLauncher,
}

/// A ready node together with the chain client acting as its account
pub struct StartedNode {
    pub node: NodeHandle,
    pub chain: Arc<dyn ChainClient>,
}

impl TestEnv {
    pub async fn start() -> Result<Self> {
        init_tracing();

        let config = HarnessConfig::from_env().context("Failed to load configuration")?;
        config.validate().context("Invalid configuration")?;

        let chain = ChainFixture::start(&config).await?;
        let launcher = NodeLauncher::new(&config);

        Ok(Self {
            config,
            chain,
            launcher,
        })
    }

    /// Provision an account and start an orchestrator+transcoder on it
    pub async fn start_orchestrator(&self, existing: Option<&ExistingAccount>) -> Result<StartedNode> {
        let provisioned = AccountProvisioner::new(&self.config)
            .provision(self.chain.rpc_uri(), existing)
            .await?;

        let mut node = self.launcher.launch(
            NodeRole::orchestrator_transcoder(),
            self.chain.rpc_uri(),
            provisioned.account,
        )?;

        let ready = tokio::time::timeout(NODE_READY_TIMEOUT, node.wait_ready()).await;
        match ready {
            Ok(Ok(())) => Ok(StartedNode {
                node,
                chain: provisioned.chain,
            }),
            Ok(Err(e)) => {
                let _ = node.stop().await;
                Err(e)
            }
            Err(_) => {
                let _ = node.stop().await;
                anyhow::bail!("Node at {} not ready within {:?}", node.cli_addr(), NODE_READY_TIMEOUT)
            }
        }
    }

    pub async fn teardown(mut self) -> Result<()> {
        self.chain.terminate().await
    }
}

/// Stop every node, then terminate the chain, reporting the first failure
pub async fn shutdown(env: TestEnv, nodes: Vec<&mut NodeHandle>) -> Result<()> {
    let mut first_error = None;
    for node in nodes {
        if let Err(e) = node.stop().await {
            warn!("Failed to stop node: {:#}", e);
            first_error.get_or_insert(e);
        }
    }
    if let Err(e) = env.teardown().await {
        first_error.get_or_insert(e);
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
