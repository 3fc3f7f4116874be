//! Multicast service advertisement.
//!
//! Beacons are single JSON datagrams on a fixed LAN multicast group,
//! announced every scan interval. A peer that misses three consecutive
//! windows is reported lost. Socket failures put the backend into a
//! backoff-retry loop; discovery keeps running throughout.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{DiscoveredPeer, Discovery, DiscoveryEvent, SERVICE_TYPE};

/// Fixed multicast group for clawmesh beacons.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 73, 77);
/// Fixed beacon port.
pub const MULTICAST_PORT: u16 = 7475;

/// Missed announce windows before a peer is reported lost.
const LOST_AFTER_MISSED_WINDOWS: u32 = 3;

/// Backoff cap when the socket cannot be opened.
const SOCKET_RETRY_CAP: Duration = Duration::from_secs(60);

/// One beacon datagram.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Beacon {
    service: String,
    device_id: String,
    version: String,
    port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tls_fingerprint: Option<String>,
}

/// Configuration for the multicast backend.
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    pub device_id: String,
    pub display_name: Option<String>,
    /// The WebSocket listener port to advertise.
    pub advertise_port: u16,
    pub scan_interval: Duration,
    pub tls_fingerprint: Option<String>,
}

/// Multicast discovery backend.
pub struct MulticastDiscovery {
    config: MulticastConfig,
    events: broadcast::Sender<DiscoveryEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Presence {
    last_seen: Instant,
}

impl MulticastDiscovery {
    pub fn new(config: MulticastConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            events,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

async fn open_socket() -> std::io::Result<UdpSocket> {
    let std_socket =
        std::net::UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT))?;
    std_socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_socket.set_multicast_loop_v4(true)?;
    std_socket.set_nonblocking(true)?;
    UdpSocket::from_std(std_socket)
}

/// Announce + browse on one socket until it errors. Returns the error so
/// the caller can back off and reopen.
async fn run_socket(
    config: &MulticastConfig,
    events: &broadcast::Sender<DiscoveryEvent>,
    socket: UdpSocket,
) -> std::io::Error {
    let target = SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT);
    let beacon = Beacon {
        service: SERVICE_TYPE.to_string(),
        device_id: config.device_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        port: config.advertise_port,
        display_name: config.display_name.clone(),
        tls_fingerprint: config.tls_fingerprint.clone(),
    };
    let beacon_bytes = match serde_json::to_vec(&beacon) {
        Ok(bytes) => bytes,
        Err(e) => return std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    };

    let mut presence: HashMap<String, Presence> = HashMap::new();
    let mut announce = tokio::time::interval(config.scan_interval);
    let lost_after = config.scan_interval * LOST_AFTER_MISSED_WINDOWS;
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            _ = announce.tick() => {
                if let Err(e) = socket.send_to(&beacon_bytes, target).await {
                    return e;
                }
                // Reap peers that missed their windows.
                let now = Instant::now();
                let lost: Vec<String> = presence
                    .iter()
                    .filter(|(_, p)| now.duration_since(p.last_seen) > lost_after)
                    .map(|(id, _)| id.clone())
                    .collect();
                for device_id in lost {
                    presence.remove(&device_id);
                    debug!(device_id = %device_id, "peer lost");
                    let _ = events.send(DiscoveryEvent::PeerLost(device_id));
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(ok) => ok,
                    Err(e) => return e,
                };
                let Ok(beacon) = serde_json::from_slice::<Beacon>(&buf[..len]) else {
                    debug!(%from, "ignoring malformed beacon");
                    continue;
                };
                if beacon.service != SERVICE_TYPE {
                    continue;
                }
                if beacon.device_id == config.device_id {
                    continue; // our own beacon
                }

                let fresh = presence
                    .insert(beacon.device_id.clone(), Presence { last_seen: Instant::now() })
                    .is_none();
                if fresh {
                    let peer = DiscoveredPeer {
                        device_id: beacon.device_id,
                        display_name: beacon.display_name,
                        host: Some(from.ip().to_string()),
                        port: beacon.port,
                        tls_fingerprint: beacon.tls_fingerprint,
                    };
                    debug!(device_id = %peer.device_id, host = ?peer.host, "peer discovered");
                    let _ = events.send(DiscoveryEvent::PeerDiscovered(peer));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Discovery for MulticastDiscovery {
    async fn start(&self) {
        let config = self.config.clone();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                match open_socket().await {
                    Ok(socket) => {
                        backoff = Duration::from_secs(1);
                        let err = run_socket(&config, &events, socket).await;
                        warn!(error = %err, "multicast socket failed, reopening");
                    }
                    Err(e) => {
                        warn!(error = %e, retry_in = ?backoff, "multicast bind failed");
                    }
                }
                let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                backoff = (backoff * 2).min(SOCKET_RETRY_CAP);
            }
        });
        self.tasks.lock().await.push(handle);
    }

    async fn stop(&self) {
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}
