use alloy_primitives::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::{advance_state, NodeConfig, NodeHandle, NodeRole, NodeState, ReadinessProbe};
use crate::accounts::DevAccount;
use crate::config::HarnessConfig;
use crate::ports::PortAllocator;

/// Runs a node until it exits or `shutdown` fires
#[async_trait]
pub trait NodeRunner: Send + Sync + 'static {
    async fn run(&self, config: NodeConfig, shutdown: oneshot::Receiver<()>) -> Result<()>;
}

/// Runs the node binary as a child process
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    binary: String,
}

impl ProcessRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl NodeRunner for ProcessRunner {
    async fn run(&self, config: NodeConfig, shutdown: oneshot::Receiver<()>) -> Result<()> {
        let tag = config.cli_addr.to_string();
        info!(node = %tag, "Spawning {}", self.binary);

        let mut child = Command::new(&self.binary)
            .args(config.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn node binary '{}'", self.binary))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, tag.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, tag.clone(), "stderr"));
        }

        // None means shutdown was requested (or the handle went away)
        let exit = tokio::select! {
            status = child.wait() => Some(status),
            _ = shutdown => None,
        };

        match exit {
            Some(status) => {
                let status = status.context("Failed to wait on node process")?;
                if status.success() {
                    info!(node = %tag, "Node process exited");
                    Ok(())
                } else {
                    anyhow::bail!("node process exited with {}", status)
                }
            }
            None => {
                debug!(node = %tag, "Killing node process");
                child.kill().await.context("Failed to kill node process")?;
                info!(node = %tag, "Node process stopped");
                Ok(())
            }
        }
    }
}

async fn forward_output<R>(reader: R, node: String, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(node = %node, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(node = %node, stream, "Failed to read node output: {}", e);
                break;
            }
        }
    }
}

/// Starts nodes on freshly allocated addresses
pub struct NodeLauncher {
    ports: PortAllocator,
    runner: Arc<dyn NodeRunner>,
    network: String,
    controller: Address,
    password: String,
    block_polling_interval_seconds: u64,
    readiness_interval: Duration,
}

impl NodeLauncher {
    /// Launcher running `config.node_binary` as a child process
    pub fn new(config: &HarnessConfig) -> Self {
        Self::with_runner(config, Arc::new(ProcessRunner::new(&config.node_binary)))
    }

    pub fn with_runner(config: &HarnessConfig, runner: Arc<dyn NodeRunner>) -> Self {
        Self {
            ports: PortAllocator::new(config.port_bases),
            runner,
            network: config.node_network.clone(),
            controller: config.controller_address,
            password: config.keystore_password.clone(),
            block_polling_interval_seconds: config.block_polling_interval_seconds,
            readiness_interval: config.readiness_poll_interval,
        }
    }

    /// Build a node configuration on the next free address triple
    pub fn node_config(
        &self,
        role: NodeRole,
        eth_url: &str,
        account: &DevAccount,
    ) -> Result<NodeConfig> {
        let addrs = self.ports.allocate_addresses()?;
        Ok(NodeConfig {
            network: self.network.clone(),
            http_addr: addrs.http,
            cli_addr: addrs.cli,
            rtmp_addr: addrs.rtmp,
            role,
            eth_url: eth_url.to_string(),
            eth_controller: self.controller,
            eth_account: account.address(),
            eth_password: self.password.clone(),
            datadir: account.datadir().to_path_buf(),
            block_polling_interval_seconds: self.block_polling_interval_seconds,
            price_per_unit: Some(1),
            pixels_per_unit: None,
            initialize_round: true,
        })
    }

    /// Start the node's run loop and its readiness probe, without blocking
    ///
    /// Startup failures are not returned here; they surface through
    /// `NodeHandle::wait_ready` and the node's forwarded output.
    pub fn start(&self, config: NodeConfig, account: DevAccount) -> NodeHandle {
        let (state_tx, _) = watch::channel(NodeState::Created);
        let state = Arc::new(state_tx);
        let (ready_tx, ready_rx) = watch::channel(false);
        let (exited_tx, exited_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        if let Err(e) = advance_state(&state, NodeState::Launching) {
            warn!("Unexpected state on launch: {}", e);
        }
        info!(
            cli = %config.cli_addr,
            http = %config.http_addr,
            account = %account.address(),
            "🚀 Launching node"
        );

        let runner = self.runner.clone();
        let run_config = config.clone();
        let run_task = tokio::spawn(async move {
            let result = runner.run(run_config, shutdown_rx).await;
            let reason = match &result {
                Ok(()) => "run loop returned".to_string(),
                Err(e) => format!("{:#}", e),
            };
            exited_tx.send_replace(Some(reason));
            result
        });

        let probe = ReadinessProbe::new(config.cli_addr, self.readiness_interval);
        let probe_state = state.clone();
        let probe_task = tokio::spawn(async move {
            probe
                .run(move || {
                    if let Err(e) = advance_state(&probe_state, NodeState::Ready) {
                        debug!("Readiness after state change: {}", e);
                    }
                    ready_tx.send_replace(true);
                })
                .await;
        });

        NodeHandle {
            config,
            account: Some(account),
            state,
            ready: ready_rx,
            exited: exited_rx,
            shutdown: Some(shutdown_tx),
            run_task: Some(run_task),
            probe_task: Some(probe_task),
        }
    }

    /// Allocate addresses for `account` and start a node with `role`
    ///
    /// Only port exhaustion fails here; see `start` for everything else.
    pub fn launch(&self, role: NodeRole, eth_url: &str, account: DevAccount) -> Result<NodeHandle> {
        let config = self.node_config(role, eth_url, &account)?;
        Ok(self.start(config, account))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::accounts::AccountProvisioner;
    use crate::error::HarnessError;
    use crate::ports::PortBases;
    use axum::{routing::get, Router};

    /// Serves `/status` on the node's CLI address until shutdown
    pub(crate) struct StubRunner {
        pub(crate) extra_routes: Option<Router>,
    }

    #[async_trait]
    impl NodeRunner for StubRunner {
        async fn run(&self, config: NodeConfig, shutdown: oneshot::Receiver<()>) -> Result<()> {
            let mut router = Router::new().route("/status", get(|| async { "ok" }));
            if let Some(extra) = &self.extra_routes {
                router = router.merge(extra.clone());
            }
            let listener = tokio::net::TcpListener::bind(config.cli_addr).await?;
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.await;
                })
                .await?;
            Ok(())
        }
    }

    struct FailingRunner;

    #[async_trait]
    impl NodeRunner for FailingRunner {
        async fn run(&self, _config: NodeConfig, _shutdown: oneshot::Receiver<()>) -> Result<()> {
            anyhow::bail!("bad flags")
        }
    }

    pub(crate) fn test_config(base: u16) -> HarnessConfig {
        HarnessConfig {
            port_bases: PortBases {
                http: base,
                cli: base + 100,
                rtmp: base + 200,
            },
            readiness_poll_interval: Duration::from_millis(10),
            ..HarnessConfig::default()
        }
    }

    pub(crate) fn throwaway_account() -> DevAccount {
        AccountProvisioner::new(&HarnessConfig::default())
            .prepare_account(None)
            .unwrap()
    }

    #[tokio::test]
    async fn test_launch_becomes_ready_and_stops() {
        let launcher = NodeLauncher::with_runner(
            &test_config(46100),
            Arc::new(StubRunner { extra_routes: None }),
        );
        let mut node = launcher.launch(
            NodeRole::orchestrator_transcoder(),
            "http://127.0.0.1:8545",
            throwaway_account(),
        ).unwrap();
        let datadir = node.account().unwrap().datadir().to_path_buf();

        node.wait_ready().await.unwrap();
        // A second waiter sees the same firing
        node.wait_ready().await.unwrap();
        assert!(node.is_ready());
        assert_eq!(node.state(), NodeState::Ready);

        node.stop().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(node.account().is_none());
        assert!(!datadir.exists());

        // Stopping again is a no-op
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_retaining_account_keeps_datadir() {
        let launcher = NodeLauncher::with_runner(
            &test_config(46900),
            Arc::new(StubRunner { extra_routes: None }),
        );
        let mut node = launcher.launch(
            NodeRole::orchestrator_transcoder(),
            "http://127.0.0.1:8545",
            throwaway_account(),
        ).unwrap();
        node.wait_ready().await.unwrap();

        let account = node.stop_retaining_account().await.unwrap().unwrap();
        assert!(account.keystore_dir().is_dir());
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(node.stop_retaining_account().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_launches_get_distinct_addresses() {
        let launcher = NodeLauncher::with_runner(
            &test_config(46300),
            Arc::new(StubRunner { extra_routes: None }),
        );
        let mut a = launcher.launch(
            NodeRole::orchestrator_transcoder(),
            "http://127.0.0.1:8545",
            throwaway_account(),
        ).unwrap();
        let mut b = launcher.launch(
            NodeRole::broadcaster(),
            "http://127.0.0.1:8545",
            throwaway_account(),
        ).unwrap();

        let (ready_a, ready_b) = tokio::join!(a.wait_ready(), b.wait_ready());
        ready_a.unwrap();
        ready_b.unwrap();

        let (ca, cb) = (a.config(), b.config());
        assert_ne!(ca.http_addr, cb.http_addr);
        assert_ne!(ca.cli_addr, cb.cli_addr);
        assert_ne!(ca.rtmp_addr, cb.rtmp_addr);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_before_ready_is_reported() {
        let launcher = NodeLauncher::with_runner(&test_config(46500), Arc::new(FailingRunner));
        let mut node = launcher.launch(
            NodeRole::orchestrator_transcoder(),
            "http://127.0.0.1:8545",
            throwaway_account(),
        ).unwrap();

        let err = node.wait_ready().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::NodeExited(_))
        ));
        assert_eq!(node.state(), NodeState::Launching);

        node.stop().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_launch_fails_when_ports_run_out() {
        let config = HarnessConfig {
            port_bases: PortBases {
                http: u16::MAX,
                cli: 47900,
                rtmp: 48000,
            },
            ..test_config(46100)
        };
        let launcher = NodeLauncher::with_runner(&config, Arc::new(FailingRunner));

        let mut first = launcher
            .launch(
                NodeRole::orchestrator_transcoder(),
                "http://127.0.0.1:8545",
                throwaway_account(),
            )
            .unwrap();
        assert_eq!(first.config().http_addr.port(), u16::MAX);

        let err = launcher
            .launch(
                NodeRole::orchestrator_transcoder(),
                "http://127.0.0.1:8545",
                throwaway_account(),
            )
            .err().unwrap();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::PortsExhausted(_))
        ));

        first.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let config = HarnessConfig {
            node_binary: "/nonexistent/node-binary".to_string(),
            ..test_config(46700)
        };
        let launcher = NodeLauncher::new(&config);
        let mut node = launcher.launch(
            NodeRole::orchestrator_transcoder(),
            "http://127.0.0.1:8545",
            throwaway_account(),
        ).unwrap();

        let err = node.wait_ready().await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to spawn node binary"));

        node.stop().await.unwrap();
    }
}
