//! Port assignment for concurrently launched nodes

use anyhow::Result;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;

use crate::error::HarnessError;

/// Number of port triples one allocator hands out before refusing
///
/// Each category owns `[base, base + MAX_NODES_PER_RUN)`; validated bases keep
/// those ranges apart and inside the u16 port space.
pub const MAX_NODES_PER_RUN: u16 = 100;

/// First port handed out in each category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBases {
    pub http: u16,
    pub cli: u16,
    pub rtmp: u16,
}

impl Default for PortBases {
    fn default() -> Self {
        Self {
            http: 8935,
            cli: 7935,
            rtmp: 1935,
        }
    }
}

impl PortBases {
    /// Ensure every category has room for `MAX_NODES_PER_RUN` nodes and no
    /// category's range reaches into another's
    pub fn check(&self) -> Result<()> {
        let named = [("http", self.http), ("cli", self.cli), ("rtmp", self.rtmp)];

        for (name, base) in named {
            if base == 0 {
                anyhow::bail!("{} port base cannot be 0", name);
            }
            if base.checked_add(MAX_NODES_PER_RUN - 1).is_none() {
                anyhow::bail!(
                    "{} port base {} leaves no room for {} nodes",
                    name,
                    base,
                    MAX_NODES_PER_RUN
                );
            }
        }

        for (i, (a_name, a)) in named.iter().enumerate() {
            for (b_name, b) in &named[i + 1..] {
                if a.abs_diff(*b) < MAX_NODES_PER_RUN {
                    anyhow::bail!(
                        "{} port base {} and {} port base {} are closer than {} ports",
                        a_name,
                        a,
                        b_name,
                        b,
                        MAX_NODES_PER_RUN
                    );
                }
            }
        }

        Ok(())
    }
}

/// Bind addresses for one node: service/HTTP, control-plane CLI and media ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAddresses {
    pub http: SocketAddr,
    pub cli: SocketAddr,
    pub rtmp: SocketAddr,
}

/// Hands out monotonically increasing loopback ports
///
/// One allocator is scoped to a test run; ports are never reused within its
/// lifetime. OS-level availability is not checked.
#[derive(Debug)]
pub struct PortAllocator {
    bases: PortBases,
    issued: Mutex<u16>,
}

impl PortAllocator {
    pub fn new(bases: PortBases) -> Self {
        Self {
            bases,
            issued: Mutex::new(0),
        }
    }

    /// Reserve the next (http, cli, rtmp) triple
    ///
    /// Fails with `HarnessError::PortsExhausted` once `MAX_NODES_PER_RUN`
    /// triples are out or a category would run past port 65535.
    pub fn allocate_addresses(&self) -> Result<NodeAddresses> {
        let mut issued = self.issued.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let offset = *issued;

        if offset >= MAX_NODES_PER_RUN {
            return Err(HarnessError::PortsExhausted(format!(
                "{} nodes already allocated",
                MAX_NODES_PER_RUN
            ))
            .into());
        }

        let port = |name: &str, base: u16| {
            base.checked_add(offset).ok_or_else(|| {
                HarnessError::PortsExhausted(format!(
                    "{} port base {} + {} overflows",
                    name, base, offset
                ))
            })
        };
        let http = port("http", self.bases.http)?;
        let cli = port("cli", self.bases.cli)?;
        let rtmp = port("rtmp", self.bases.rtmp)?;

        *issued = offset + 1;

        Ok(NodeAddresses {
            http: loopback(http),
            cli: loopback(cli),
            rtmp: loopback(rtmp),
        })
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PortBases::default())
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}
