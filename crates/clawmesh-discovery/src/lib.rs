//! Peer discovery.
//!
//! Discovery surfaces potential peers on the local segment; it does not
//! decide trust and it does not open connections. Two backends share one
//! interface: multicast service advertisement (`_clawmesh._tcp`) and a
//! static list from configuration. Backend errors are non-fatal: a
//! broken multicast socket means no updates until it recovers, never a
//! stopped node.

pub mod multicast;
pub mod static_list;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use multicast::{MulticastConfig, MulticastDiscovery};
pub use static_list::{parse_ws_url, StaticDiscovery};

/// The advertised service type.
pub const SERVICE_TYPE: &str = "_clawmesh._tcp";

/// A peer seen on the network. Carries enough to decide whether and how
/// to connect; trust is checked elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeer {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_fingerprint: Option<String>,
}

/// Discovery signal stream.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// Emitted once per `deviceId` per continuous-presence window.
    PeerDiscovered(DiscoveredPeer),
    /// A formerly seen peer stopped announcing.
    PeerLost(String),
}

/// A discovery backend.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Begin advertising the local node and browsing for others.
    async fn start(&self);

    /// Stop all background work. Idempotent.
    async fn stop(&self);

    /// Subscribe to the event stream. Safe to call before `start`.
    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent>;
}
