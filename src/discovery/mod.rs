//! Peer discovery over the local network.
//!
//! Discovery pairs a receiving pipeline's [`Beacon`] with each sending
//! pipeline's [`Finder`]:
//!
//! ```text
//! Beacon (receiver side)                    Finder (sender side)
//!       │                                         │
//!       │── {"Name","ListenerPort"} ── UDP ──────►│  every 250 ms, all
//!       │                            broadcast    │  outbound interfaces
//!       │                                         │
//!       │◄──── TCP connect to ListenerPort ───────│  first matching packet
//!       │◄──── {"Name","Guid"} ───────────────────│
//!       │───── "tcp://ip:port" (data listener) ──►│  single write, ≤ 1 KiB
//!       │                 connection closes       │
//! ```
//!
//! The advertised `ListenerPort` is the beacon's announcement acceptor; the
//! data listener's address only travels in the acknowledgement. Finders are
//! counted by their remote TCP endpoint, so racing duplicate broadcasts are
//! harmless and the handshake alone decides completion.

pub mod beacon;
pub mod finder;

pub use beacon::Beacon;
pub use finder::{DiscoveredTarget, Finder};

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::net::interfaces;

/// Cadence of beacon advertisement broadcasts.
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(250);
/// Upper bound on the handshake acknowledgement payload.
pub const ACK_MAX_LEN: usize = 1024;

/// UDP advertisement a beacon broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Advertisement {
    pub name: String,
    pub listener_port: u16,
}

/// Self-description a finder sends over the TCP handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerDescriptor {
    pub name: String,
    pub guid: Uuid,
}

/// Where a beacon broadcasts from and to.
#[derive(Debug, Clone)]
pub struct BroadcastEndpoint {
    /// Local interface address the UDP sender binds.
    pub local: Ipv4Addr,
    /// Destination, normally the interface's directed broadcast address at
    /// the discovery port.
    pub target: SocketAddrV4,
}

/// Discovery parameters shared by a pipeline's beacon and finder.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub port: u16,
    pub endpoints: Vec<BroadcastEndpoint>,
}

impl DiscoveryConfig {
    /// Computes broadcast endpoints from the named outbound interfaces, or
    /// from every broadcast-capable interface when `names` is empty.
    pub fn from_interfaces(names: &[String], port: u16) -> Result<Self> {
        let selection = if names.is_empty() { None } else { Some(names) };
        let endpoints = interfaces::broadcast_addrs(selection)?
            .into_iter()
            .map(|(local, broadcast)| BroadcastEndpoint {
                local,
                target: SocketAddrV4::new(broadcast, port),
            })
            .collect();
        Ok(Self { port, endpoints })
    }

    /// Uses an explicit endpoint list instead of interface enumeration.
    pub fn with_endpoints(port: u16, endpoints: Vec<BroadcastEndpoint>) -> Self {
        Self { port, endpoints }
    }

    /// Loopback-only discovery on the given port.
    pub fn loopback(port: u16) -> Self {
        Self::with_endpoints(
            port,
            vec![BroadcastEndpoint {
                local: Ipv4Addr::LOCALHOST,
                target: SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
            }],
        )
    }
}

/// Picks a UDP port that was free a moment ago; good enough for loopback
/// discovery tests that need beacon and finder to agree on a port.
#[cfg(test)]
pub(crate) fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
