//! Peer session registry.
//!
//! Live sessions are held under a dual index (`deviceId → session`,
//! `connId → deviceId`) with a per-peer table of pending RPCs. At most
//! one session exists per peer: a reconnect evicts the older session and
//! fails its in-flight RPCs with `PEER_DISCONNECTED`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use clawmesh_types::{ErrorCode, MeshError, MeshResult, WireFrame};

/// Default RPC timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// What travels to a session's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(WireFrame),
    /// Ask the writer to close the socket.
    Shutdown,
}

/// A live, authenticated connection to a peer.
pub struct PeerSession {
    pub device_id: String,
    /// Unique per physical connection.
    pub conn_id: String,
    pub display_name: Option<String>,
    /// Hex-encoded Ed25519 public key presented at handshake.
    pub public_key: String,
    /// Whether we dialed out or they dialed in.
    pub outbound: bool,
    pub connected_at_ms: i64,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl PeerSession {
    pub fn new(
        device_id: impl Into<String>,
        conn_id: impl Into<String>,
        display_name: Option<String>,
        public_key: impl Into<String>,
        outbound: bool,
        connected_at_ms: i64,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Arc<Self> {
        Arc::new(Self {
            device_id: device_id.into(),
            conn_id: conn_id.into(),
            display_name,
            public_key: public_key.into(),
            outbound,
            connected_at_ms,
            sender,
        })
    }

    /// Queue a frame for the writer task.
    pub fn send_frame(&self, frame: WireFrame) -> MeshResult<()> {
        self.sender.send(Outbound::Frame(frame)).map_err(|_| {
            MeshError::new(
                ErrorCode::SendFailed,
                format!("transport for {} rejected the frame", self.device_id),
            )
        })
    }

    /// Ask the writer task to close the socket. Idempotent; the read
    /// side observing the close drives unregistration.
    pub fn shutdown(&self) {
        let _ = self.sender.send(Outbound::Shutdown);
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("device_id", &self.device_id)
            .field("conn_id", &self.conn_id)
            .field("outbound", &self.outbound)
            .finish_non_exhaustive()
    }
}

struct PendingRpc {
    device_id: String,
    method: String,
    tx: oneshot::Sender<MeshResult<Value>>,
}

/// The dual-indexed session table plus pending RPCs.
#[derive(Default)]
pub struct SessionRegistry {
    by_device: DashMap<String, Arc<PeerSession>>,
    conn_index: DashMap<String, String>,
    pending: DashMap<String, PendingRpc>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session. An existing session for the same `deviceId` is
    /// evicted first: its socket is closed and its pending RPCs fail
    /// with `PEER_DISCONNECTED`.
    pub fn register(&self, session: Arc<PeerSession>) {
        if let Some((_, old)) = self.by_device.remove(&session.device_id) {
            debug!(
                device_id = %session.device_id,
                old_conn = %old.conn_id,
                new_conn = %session.conn_id,
                "evicting older session for reconnecting peer"
            );
            self.conn_index.remove(&old.conn_id);
            old.shutdown();
            self.fail_pending_for(&session.device_id, ErrorCode::PeerDisconnected);
        }
        self.conn_index
            .insert(session.conn_id.clone(), session.device_id.clone());
        self.by_device
            .insert(session.device_id.clone(), session);
    }

    /// Tear down the session for a closed connection. Only removes the
    /// device mapping when the stored session still owns this `connId`,
    /// so a reconnect that already installed a fresh session is left
    /// untouched. Returns the `deviceId` whose session ended.
    pub fn unregister(&self, conn_id: &str) -> Option<String> {
        let (_, device_id) = self.conn_index.remove(conn_id)?;
        let removed = self
            .by_device
            .remove_if(&device_id, |_, session| session.conn_id == conn_id);
        if removed.is_some() {
            self.fail_pending_for(&device_id, ErrorCode::PeerDisconnected);
            debug!(device_id = %device_id, conn_id, "session unregistered");
            Some(device_id)
        } else {
            None
        }
    }

    /// Invoke a method on a connected peer and await its response.
    ///
    /// Resolves to the peer's payload, or fails with `NOT_CONNECTED`
    /// (no session), `SEND_FAILED` (transport refused the frame),
    /// `TIMEOUT` (no response in time), or `PEER_DISCONNECTED` (session
    /// torn down mid-flight). The pending entry is always removed before
    /// this returns.
    pub async fn invoke(
        &self,
        device_id: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> MeshResult<Value> {
        let session = self
            .by_device
            .get(device_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                MeshError::new(
                    ErrorCode::NotConnected,
                    format!("no session for {device_id}"),
                )
            })?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.clone(),
            PendingRpc {
                device_id: device_id.to_string(),
                method: method.to_string(),
                tx,
            },
        );

        let frame = WireFrame::Req {
            id: request_id.clone(),
            method: method.to_string(),
            params,
        };
        if let Err(err) = session.send_frame(frame) {
            self.pending.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout.unwrap_or(DEFAULT_RPC_TIMEOUT), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MeshError::new(
                ErrorCode::PeerDisconnected,
                format!("session to {device_id} ended before a response"),
            )),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(MeshError::new(
                    ErrorCode::Timeout,
                    format!("{method} to {device_id} timed out"),
                ))
            }
        }
    }

    /// Match a response frame to its pending request. Returns `false`
    /// for an unknown id (a late response after timeout, ignorable).
    pub fn handle_rpc_result(
        &self,
        id: &str,
        ok: bool,
        payload: Option<Value>,
        error: Option<MeshError>,
    ) -> bool {
        let Some((_, pending)) = self.pending.remove(id) else {
            return false;
        };
        let result = if ok {
            Ok(payload.unwrap_or(Value::Null))
        } else {
            Err(error.unwrap_or_else(|| {
                MeshError::internal(format!("error response without body for {}", pending.method))
            }))
        };
        if pending.tx.send(result).is_err() {
            warn!(id, method = %pending.method, "response arrived after caller gave up");
        }
        true
    }

    /// Fail every pending RPC for a peer with the given code.
    pub fn fail_pending_for(&self, device_id: &str, code: ErrorCode) {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().device_id == device_id)
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(MeshError::new(
                    code,
                    format!("session to {device_id} ended"),
                )));
            }
        }
    }

    /// Best-effort event to one peer; transport errors are swallowed.
    pub fn send_event(&self, device_id: &str, event: &str, payload: Value) {
        if let Some(session) = self.by_device.get(device_id) {
            let _ = session.send_frame(WireFrame::event(event, payload));
        }
    }

    /// Best-effort event to every connected peer.
    pub fn broadcast_event(&self, event: &str, payload: Value) {
        for session in self.by_device.iter() {
            let _ = session.send_frame(WireFrame::event(event, payload.clone()));
        }
    }

    /// Best-effort event to every peer except one (the gossip re-emit
    /// path excludes the peer a frame arrived from).
    pub fn broadcast_event_except(&self, skip_device_id: &str, event: &str, payload: Value) {
        for session in self.by_device.iter() {
            if session.device_id == skip_device_id {
                continue;
            }
            let _ = session.send_frame(WireFrame::event(event, payload.clone()));
        }
    }

    /// Session for a peer, if connected.
    pub fn get(&self, device_id: &str) -> Option<Arc<PeerSession>> {
        self.by_device
            .get(device_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a peer has a live session.
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.by_device.contains_key(device_id)
    }

    /// Snapshot of current sessions.
    pub fn list_connected(&self) -> Vec<Arc<PeerSession>> {
        let mut sessions: Vec<Arc<PeerSession>> = self
            .by_device
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        sessions
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.by_device.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_device.is_empty()
    }

    /// Close every session and fail all pending RPCs; used at shutdown.
    pub fn close_all(&self) {
        for session in self.by_device.iter() {
            session.shutdown();
        }
        let devices: Vec<String> = self
            .by_device
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for device_id in devices {
            self.by_device.remove(&device_id);
            self.fail_pending_for(&device_id, ErrorCode::PeerDisconnected);
        }
        self.conn_index.clear();
    }
}
