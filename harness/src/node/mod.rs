//! Node processes under test: configuration, lifecycle and readiness

pub mod launcher;
pub mod readiness;

use alloy_primitives::Address;
use anyhow::{Context, Result};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::accounts::DevAccount;
use crate::error::HarnessError;

pub use launcher::{NodeLauncher, NodeRunner, ProcessRunner};
pub use readiness::ReadinessProbe;

/// Test lifecycle of a node
///
/// Forward-only: `Created → Launching → Ready → Registered → Active`, with
/// `Stopped` reachable from anywhere and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Launching,
    Ready,
    Registered,
    Active,
    Stopped,
}

impl NodeState {
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Created, Launching)
                | (Launching, Ready)
                | (Ready, Registered)
                | (Registered, Active)
                | (Created | Launching | Ready | Registered | Active, Stopped)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Roles a node is launched with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeRole {
    pub orchestrator: bool,
    pub transcoder: bool,
    pub broadcaster: bool,
}

impl NodeRole {
    /// Combined orchestrator and transcoder, as registration tests use
    pub fn orchestrator_transcoder() -> Self {
        Self {
            orchestrator: true,
            transcoder: true,
            broadcaster: false,
        }
    }

    pub fn broadcaster() -> Self {
        Self {
            broadcaster: true,
            ..Default::default()
        }
    }
}

/// Configuration handed to a node process
///
/// Immutable once passed to `NodeLauncher::start`.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub network: String,
    /// Service address, also advertised as `serviceAddr`
    pub http_addr: SocketAddr,
    /// Control-plane API (`/status`, `/activateOrchestrator`)
    pub cli_addr: SocketAddr,
    pub rtmp_addr: SocketAddr,
    pub role: NodeRole,
    pub eth_url: String,
    pub eth_controller: Address,
    pub eth_account: Address,
    pub eth_password: String,
    pub datadir: PathBuf,
    pub block_polling_interval_seconds: u64,
    pub price_per_unit: Option<u64>,
    pub pixels_per_unit: Option<u64>,
    pub initialize_round: bool,
}

impl NodeConfig {
    /// Command-line flags in the node's `-name=value` form
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("-network={}", self.network),
            format!("-httpAddr={}", self.http_addr),
            format!("-serviceAddr={}", self.http_addr),
            format!("-cliAddr={}", self.cli_addr),
            format!("-rtmpAddr={}", self.rtmp_addr),
            format!("-orchestrator={}", self.role.orchestrator),
            format!("-transcoder={}", self.role.transcoder),
            format!("-broadcaster={}", self.role.broadcaster),
            format!("-ethUrl={}", self.eth_url),
            format!("-ethController={}", self.eth_controller),
            format!("-ethAcctAddr={}", self.eth_account),
            format!("-ethPassword={}", self.eth_password),
            format!("-datadir={}", self.datadir.display()),
            format!("-blockPollingInterval={}", self.block_polling_interval_seconds),
        ];
        if let Some(price) = self.price_per_unit {
            args.push(format!("-pricePerUnit={}", price));
        }
        if let Some(pixels) = self.pixels_per_unit {
            args.push(format!("-pixelsPerUnit={}", pixels));
        }
        args.push(format!("-initializeRound={}", self.initialize_round));
        args
    }
}

/// Apply `next` if the transition table allows it
pub(crate) fn advance_state(state: &watch::Sender<NodeState>, next: NodeState) -> Result<()> {
    let mut rejected = None;
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            *current = next;
            true
        } else {
            rejected = Some(*current);
            false
        }
    });

    match rejected {
        None => Ok(()),
        Some(from) => Err(HarnessError::IllegalTransition { from, to: next }.into()),
    }
}

/// A launched node
///
/// Owns the run task, the readiness probe and the account's data directory
/// until `stop`. Dropping the handle signals shutdown without waiting.
pub struct NodeHandle {
    config: NodeConfig,
    account: Option<DevAccount>,
    state: Arc<watch::Sender<NodeState>>,
    ready: watch::Receiver<bool>,
    exited: watch::Receiver<Option<String>>,
    shutdown: Option<oneshot::Sender<()>>,
    run_task: Option<JoinHandle<Result<()>>>,
    probe_task: Option<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Account the node runs as; `None` once stopped
    pub fn account(&self) -> Option<&DevAccount> {
        self.account.as_ref()
    }

    pub fn cli_addr(&self) -> SocketAddr {
        self.config.cli_addr
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Move the lifecycle forward; regressions are rejected
    pub fn transition(&self, next: NodeState) -> Result<()> {
        advance_state(&self.state, next)?;
        info!(cli = %self.config.cli_addr, "Node state -> {}", next);
        Ok(())
    }

    /// Wait for the first successful status probe
    ///
    /// Any number of callers may wait; all observe the same single firing.
    /// Fails with `HarnessError::NodeExited` when the node's run task ends
    /// first. Unbounded otherwise.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut ready = self.ready.clone();
        let mut exited = self.exited.clone();

        tokio::select! {
            biased;
            fired = ready.wait_for(|ready| *ready) => {
                fired.context("Readiness signal dropped before firing")?;
                Ok(())
            }
            reason = exited.wait_for(|reason| reason.is_some()) => {
                let reason = match reason {
                    Ok(reason) => reason.clone().unwrap_or_default(),
                    Err(_) => "run task dropped".to_string(),
                };
                Err(HarnessError::NodeExited(format!("{} ({})", self.config.cli_addr, reason)).into())
            }
        }
    }

    /// Stop the node and release its account resources. Idempotent.
    pub async fn stop(&mut self) -> Result<()> {
        self.stop_retaining_account().await.map(drop)
    }

    /// Stop the node but hand its account back instead of dropping it
    ///
    /// Keeps the data directory alive so a later node can reuse the account.
    /// Returns `None` when already stopped.
    pub async fn stop_retaining_account(&mut self) -> Result<Option<DevAccount>> {
        if self.state() == NodeState::Stopped {
            debug!(cli = %self.config.cli_addr, "Node already stopped");
            return Ok(None);
        }

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(probe) = self.probe_task.take() {
            probe.abort();
        }

        let mut result = Ok(());
        if let Some(run_task) = self.run_task.take() {
            match run_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(cli = %self.config.cli_addr, "Node run task ended with error: {:#}", e)
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => result = Err(anyhow::anyhow!("Node run task panicked: {}", e)),
            }
        }

        let account = self.account.take();
        self.transition(NodeState::Stopped)?;
        result.map(|()| account)
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            warn!(cli = %self.config.cli_addr, "Node handle dropped without stop()");
            let _ = shutdown.send(());
        }
        if let Some(probe) = self.probe_task.take() {
            probe.abort();
        }
    }
}
