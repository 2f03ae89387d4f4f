//! Ephemeral dev-chain container

use anyhow::{Context, Result};
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortMap};
use bollard::Docker;
use futures_util::stream::StreamExt;
use reqwest::Url;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::error::HarnessError;

/// Container port serving chain JSON-RPC
pub const RPC_PORT: &str = "8545/tcp";
/// Container port serving the secondary (WS/web server) endpoint
pub const WS_PORT: &str = "8546/tcp";

const RPC_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// A running chain container with its externally reachable endpoints
///
/// Owns the container exclusively. Call `terminate` at teardown; a live
/// fixture that is dropped instead (a failed or panicking test) removes its
/// container synchronously before the drop returns.
pub struct ChainFixture {
    docker: Docker,
    container_id: Option<String>,
    rpc_uri: String,
    ws_uri: String,
}

impl ChainFixture {
    /// Start the chain image from `config` and wait until its RPC answers
    ///
    /// Every failure here is fatal: it points at the environment, not at a
    /// transient condition.
    pub async fn start(config: &HarnessConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| HarnessError::ContainerStart(format!("cannot reach Docker: {}", e)))?;

        ensure_image(&docker, &config.chain_image).await?;

        let name = format!("chain-fixture-{}", uuid::Uuid::new_v4());
        let container_id = create_and_start(&docker, &name, &config.chain_image).await?;

        // From here on a failure must not leak the container
        match Self::resolve_endpoints(&docker, &container_id, config.chain_startup_timeout).await {
            Ok((rpc_uri, ws_uri)) => {
                info!(
                    container = %container_id,
                    rpc = %rpc_uri,
                    ws = %ws_uri,
                    "Chain fixture ready"
                );
                Ok(Self {
                    docker,
                    container_id: Some(container_id),
                    rpc_uri,
                    ws_uri,
                })
            }
            Err(e) => {
                if let Err(cleanup) = remove_container(&docker, &container_id).await {
                    warn!("Failed to clean up chain container after startup error: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    async fn resolve_endpoints(
        docker: &Docker,
        container_id: &str,
        startup_timeout: Duration,
    ) -> Result<(String, String)> {
        let inspect = docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect chain container")?;

        let ports = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .unwrap_or_default();

        let host = docker_host();
        let rpc_uri = format!("http://{}:{}", host, mapped_port(&ports, RPC_PORT)?);
        let ws_uri = format!("http://{}:{}", host, mapped_port(&ports, WS_PORT)?);

        wait_for_rpc(&rpc_uri, startup_timeout).await?;
        Ok((rpc_uri, ws_uri))
    }

    /// JSON-RPC endpoint, `http://{host}:{mappedPort}`
    pub fn rpc_uri(&self) -> &str {
        &self.rpc_uri
    }

    /// Secondary service endpoint
    pub fn ws_uri(&self) -> &str {
        &self.ws_uri
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    /// Stop and remove the container. Safe to call more than once.
    pub async fn terminate(&mut self) -> Result<()> {
        let Some(container_id) = self.container_id.take() else {
            debug!("Chain fixture already terminated");
            return Ok(());
        };

        remove_container(&self.docker, &container_id).await
    }
}

impl Drop for ChainFixture {
    fn drop(&mut self) {
        if let Some(container_id) = self.container_id.take() {
            warn!(
                container = %container_id,
                "Chain fixture dropped without terminate(); removing container"
            );
            if let Err(e) = reap_container(container_id) {
                error!("Failed to remove chain container on drop: {:#}", e);
            }
        }
    }
}

/// Remove a container from synchronous code
///
/// Runs on its own thread and runtime: the caller's runtime may be shutting
/// down, and tasks spawned onto it would be cancelled before they run.
fn reap_container(container_id: String) -> Result<()> {
    let worker = std::thread::Builder::new()
        .name("chain-fixture-cleanup".to_string())
        .spawn(move || -> Result<()> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to build cleanup runtime")?;
            runtime.block_on(async {
                let docker = Docker::connect_with_local_defaults()
                    .context("Failed to reach Docker for cleanup")?;
                remove_container(&docker, &container_id).await
            })
        })
        .context("Failed to spawn cleanup thread")?;

    worker
        .join()
        .map_err(|_| anyhow::anyhow!("Container cleanup thread panicked"))?
}

/// Ensure Docker image is available (pull if needed)
async fn ensure_image(docker: &Docker, image: &str) -> Result<()> {
    info!("Ensuring Docker image is available: {}", image);

    let mut stream = docker.create_image(
        Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        }),
        None,
        None,
    );

    while let Some(result) = stream.next().await {
        match result {
            Ok(info_msg) => {
                if let Some(status) = info_msg.status {
                    debug!("Docker: {}", status);
                }
            }
            Err(e) => {
                error!("Failed to pull Docker image: {}", e);
                return Err(HarnessError::ContainerStart(format!("pull {}: {}", image, e)).into());
            }
        }
    }

    Ok(())
}

async fn create_and_start(docker: &Docker, name: &str, image: &str) -> Result<String> {
    info!("Creating chain container: {}", name);

    let exposed_ports: HashMap<String, HashMap<(), ()>> = [RPC_PORT, WS_PORT]
        .iter()
        .map(|port| (port.to_string(), HashMap::new()))
        .collect();

    let container_config = ContainerConfig {
        image: Some(image.to_string()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            // Let Docker pick free host ports for every exposed port
            publish_all_ports: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };

    let response = docker
        .create_container(
            Some(CreateContainerOptions {
                name: name.to_string(),
                ..Default::default()
            }),
            container_config,
        )
        .await
        .map_err(|e| HarnessError::ContainerStart(format!("create {}: {}", name, e)))?;

    if let Err(e) = docker.start_container::<String>(&response.id, None).await {
        let _ = remove_container(docker, &response.id).await;
        return Err(HarnessError::ContainerStart(format!("start {}: {}", name, e)).into());
    }

    info!("Container created and started: {}", response.id);
    Ok(response.id)
}

/// Cleanup container (stop and remove)
async fn remove_container(docker: &Docker, container_id: &str) -> Result<()> {
    info!("Cleaning up container: {}", container_id);

    let _ = docker
        .stop_container(container_id, Some(StopContainerOptions { t: 5 }))
        .await;

    docker
        .remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            }),
        )
        .await
        .context("Failed to remove container")?;

    info!("Container removed: {}", container_id);
    Ok(())
}

/// Host port bound to `container_port`
pub(crate) fn mapped_port(ports: &PortMap, container_port: &str) -> Result<u16> {
    let host_port = ports
        .get(container_port)
        .and_then(|bindings| bindings.as_ref())
        .and_then(|bindings| bindings.iter().find_map(|b| b.host_port.clone()))
        .ok_or_else(|| HarnessError::PortMapping(container_port.to_string()))?;

    host_port
        .parse::<u16>()
        .with_context(|| format!("Invalid host port '{}' for {}", host_port, container_port))
}

/// Host on which published container ports are reachable
///
/// Follows `DOCKER_HOST` when it points at a remote TCP daemon.
pub(crate) fn docker_host() -> String {
    std::env::var("DOCKER_HOST")
        .ok()
        .and_then(|raw| host_from_docker_url(&raw))
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

fn host_from_docker_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    match url.scheme() {
        "tcp" | "http" | "https" => url.host_str().map(|h| h.to_string()),
        _ => None,
    }
}

/// Poll the container's RPC until it answers `eth_blockNumber`
async fn wait_for_rpc(rpc_uri: &str, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .context("Failed to build HTTP client")?;
    let body = json!({ "jsonrpc": "2.0", "method": "eth_blockNumber", "params": [], "id": 1 });
    let deadline = Instant::now() + timeout;

    loop {
        match client.post(rpc_uri).json(&body).send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => debug!("Chain RPC not ready: HTTP {}", response.status()),
            Err(e) => debug!("Chain RPC not ready: {}", e),
        }

        if Instant::now() >= deadline {
            return Err(HarnessError::ContainerStart(format!(
                "RPC at {} did not answer within {:?}",
                rpc_uri, timeout
            ))
            .into());
        }
        tokio::time::sleep(RPC_PROBE_INTERVAL).await;
    }
}
