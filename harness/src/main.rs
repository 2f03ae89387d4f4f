use anyhow::{Context, Result};
use tracing::{error, info, warn};

use node_harness::{
    AccountProvisioner, ChainFixture, HarnessConfig, NodeHandle, NodeLauncher, NodeRole,
    OrchestratorRegistration, RegistrationProtocol,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "node_harness=info,node_devnet=info".into()),
        )
        .init();

    info!("Node devnet starting...");

    let config = HarnessConfig::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!("Chain image: {}", config.chain_image);
    info!("Controller: {}", config.controller_address);
    info!("Node binary: {}", config.node_binary);

    let mut chain = ChainFixture::start(&config)
        .await
        .context("Failed to start chain fixture")?;

    let result = run_devnet(&config, &chain).await;

    if let Err(e) = chain.terminate().await {
        warn!("Failed to terminate chain fixture: {:#}", e);
    }

    result
}

async fn run_devnet(config: &HarnessConfig, chain: &ChainFixture) -> Result<()> {
    let provisioned = AccountProvisioner::new(config)
        .provision(chain.rpc_uri(), None)
        .await
        .context("Failed to provision account")?;

    let launcher = NodeLauncher::new(config);
    let mut node = launcher.launch(
        NodeRole::orchestrator_transcoder(),
        chain.rpc_uri(),
        provisioned.account,
    )?;

    let outcome = tokio::select! {
        result = bring_up(config, &node, provisioned.chain.as_ref()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted during startup");
            Ok(false)
        }
    };

    let result = match outcome {
        Ok(true) => {
            info!("Devnet up. Press Ctrl-C to stop.");
            info!("  Chain RPC:  {}", chain.rpc_uri());
            info!("  Chain WS:   {}", chain.ws_uri());
            info!("  Node CLI:   http://{}", node.config().cli_addr);
            info!("  Node HTTP:  http://{}", node.config().http_addr);
            info!("  Node RTMP:  rtmp://{}", node.config().rtmp_addr);
            if let Some(account) = node.account() {
                info!("  Account:    {}", account.address());
                info!("  Datadir:    {}", account.datadir().display());
            }
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Shutting down...");
            Ok(())
        }
        Ok(false) => Ok(()),
        Err(e) => {
            error!("Devnet startup failed: {:#}", e);
            Err(e)
        }
    };

    node.stop().await.context("Failed to stop node")?;
    result
}

/// Wait for readiness and register; `Ok(true)` when the node is active
async fn bring_up(
    config: &HarnessConfig,
    node: &NodeHandle,
    chain: &dyn node_harness::ChainClient,
) -> Result<bool> {
    node.wait_ready().await?;

    let receipt = RegistrationProtocol::new(config)
        .register(node, chain, &OrchestratorRegistration::default())
        .await?;
    info!(
        "Registered after {} attempt(s), active from round {}",
        receipt.attempts, receipt.active_round
    );

    Ok(true)
}
