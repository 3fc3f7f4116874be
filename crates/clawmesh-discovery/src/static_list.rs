//! Static peer discovery.
//!
//! Turns the configured peer list into the same event stream the
//! multicast backend produces: each entry is announced exactly once at
//! start. Static peers are never reported lost.

use tokio::sync::broadcast;
use tracing::debug;

use crate::{DiscoveredPeer, Discovery, DiscoveryEvent};

/// Parse `ws://host:port` (or `wss://`) into host and port.
pub fn parse_ws_url(url: &str) -> Option<(String, u16)> {
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))?;
    let authority = rest.split('/').next()?;
    let (host, port) = authority.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

/// A fixed set of peers from configuration.
pub struct StaticDiscovery {
    peers: Vec<DiscoveredPeer>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<DiscoveredPeer>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self { peers, events }
    }
}

#[async_trait::async_trait]
impl Discovery for StaticDiscovery {
    async fn start(&self) {
        for peer in &self.peers {
            debug!(device_id = %peer.device_id, "static peer");
            let _ = self
                .events
                .send(DiscoveryEvent::PeerDiscovered(peer.clone()));
        }
    }

    async fn stop(&self) {}

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}
