//! Node runtime.
//!
//! Owns the listening socket, outbound peer connections, the method
//! table, and the four registries (trust, sessions, capabilities, world
//! model). Frames are routed by type: requests to the handler table,
//! responses to the session registry's pending RPCs, context events to
//! the propagator. State machine:
//! `init → listening → stopping → stopped`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use rand::Rng;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use clawmesh_context::{ContextPropagator, WorldModel, CONTEXT_FRAME_EVENT};
use clawmesh_discovery::{
    parse_ws_url, DiscoveredPeer, Discovery, DiscoveryEvent, MulticastConfig, MulticastDiscovery,
    StaticDiscovery,
};
use clawmesh_identity::{DeviceIdentity, IdentityError, TrustStore};
use clawmesh_types::config::MeshConfig;
use clawmesh_types::{ContextFrame, ErrorCode, MeshError, MeshResult, WireFrame};
use clawmesh_wire::transport;
use clawmesh_wire::{
    build_auth_payload, generate_nonce, nonce_matches, should_initiate, verify_auth_payload,
    AuthPayload, CapabilityRegistry, HandshakeCheck, PeerSession, Route, SessionRegistry,
    CHALLENGE_EVENT,
};

use crate::forward::{
    forward_message_to_peer, ForwardAck, ForwardReceiver, ForwardRequest, ForwardSink,
    FORWARD_METHOD,
};
use crate::methods::{MethodTable, RequestCtx};

/// How long either side of a handshake may stall.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Event a peer pushes to replace its advertised capability set.
pub const CAPABILITIES_EVENT: &str = "mesh.capabilities";

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);
const STATIC_PEER_CHECK: Duration = Duration::from_secs(5);

/// Failures while booting or running the node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("boot failed: {0}")]
    BootFailed(String),
}

/// Runtime lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Init,
    Listening,
    Stopping,
    Stopped,
}

/// Host-supplied options the config file does not cover.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub listen_addr: SocketAddr,
    pub state_dir: PathBuf,
    pub display_name: Option<String>,
    /// Multicast advertisement on/off (static peers work either way).
    pub enable_multicast: bool,
    pub config: MeshConfig,
}

impl NodeOptions {
    pub fn new(listen_addr: SocketAddr, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr,
            state_dir: state_dir.into(),
            display_name: None,
            enable_multicast: true,
            config: MeshConfig::default(),
        }
    }
}

struct NodeInner {
    identity: DeviceIdentity,
    options: NodeOptions,
    trust: TrustStore,
    sessions: Arc<SessionRegistry>,
    capabilities: Arc<CapabilityRegistry>,
    world: Arc<WorldModel>,
    propagator: ContextPropagator,
    methods: MethodTable,
    forwards: ForwardReceiver,
    discovery: Mutex<Option<Arc<MulticastDiscovery>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    state: Mutex<NodeState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

/// A mesh gateway node.
pub struct MeshNode {
    inner: Arc<NodeInner>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl MeshNode {
    /// Build a node: load or create the identity under the state dir,
    /// open the trust store, wire the registries, and install the
    /// standard method set. Does not touch the network until `start`.
    pub fn new(options: NodeOptions, sink: Arc<dyn ForwardSink>) -> Result<Self, NodeError> {
        options.config.validate()?;
        let identity =
            DeviceIdentity::load_or_create(&options.state_dir.join("identity").join("device.json"))?;
        let trust = TrustStore::open(options.state_dir.join("mesh").join("trusted-peers.json"))?;

        let sessions = Arc::new(SessionRegistry::new());
        let capabilities = Arc::new(CapabilityRegistry::new());
        let world = Arc::new(WorldModel::new());
        let propagator = ContextPropagator::new(
            identity.device_id(),
            options.display_name.clone(),
            Arc::clone(&sessions),
            Arc::clone(&world),
        );
        let forwards = ForwardReceiver::new(identity.device_id(), sink);

        let inner = Arc::new(NodeInner {
            identity,
            options,
            trust,
            sessions,
            capabilities,
            world,
            propagator,
            methods: MethodTable::new(),
            forwards,
            discovery: Mutex::new(None),
            local_addr: Mutex::new(None),
            state: Mutex::new(NodeState::Init),
            tasks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        });
        install_standard_methods(&inner);
        Ok(Self { inner })
    }

    /// Bind the listener, connect configured static peers, and begin
    /// discovery. Idempotent calls after the first fail.
    pub async fn start(&self) -> Result<(), NodeError> {
        {
            let state = self.inner.current_state();
            if state != NodeState::Init {
                return Err(NodeError::BootFailed(format!(
                    "start called in state {state:?}"
                )));
            }
        }

        let listener = TcpListener::bind(self.inner.options.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        *self
            .inner
            .local_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(local_addr);
        self.inner.set_state(NodeState::Listening);
        info!(
            device_id = %self.inner.identity.device_id(),
            addr = %local_addr,
            "mesh node listening"
        );

        let accept_inner = Arc::clone(&self.inner);
        self.inner.push_task(tokio::spawn(async move {
            accept_loop(accept_inner, listener).await;
        }));

        // Static peers flow through the static-list discovery backend;
        // each surfaced peer gets a keep-alive dialer.
        let static_peers: Vec<DiscoveredPeer> = self
            .inner
            .options
            .config
            .peers
            .iter()
            .filter_map(|peer| match parse_ws_url(&peer.url) {
                Some((host, port)) => Some(DiscoveredPeer {
                    device_id: peer.device_id.clone(),
                    display_name: None,
                    host: Some(host),
                    port,
                    tls_fingerprint: peer.tls_fingerprint.clone(),
                }),
                None => {
                    warn!(url = %peer.url, "skipping static peer with unparseable url");
                    None
                }
            })
            .collect();
        if !static_peers.is_empty() {
            let statics = StaticDiscovery::new(static_peers);
            let mut events = statics.subscribe();
            statics.start().await;
            let static_inner = Arc::clone(&self.inner);
            self.inner.push_task(tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if let DiscoveryEvent::PeerDiscovered(peer) = event {
                        let dialer_inner = Arc::clone(&static_inner);
                        static_inner
                            .push_task(tokio::spawn(maintain_static_peer(dialer_inner, peer)));
                    }
                }
            }));
        }

        if self.inner.options.config.enabled && self.inner.options.enable_multicast {
            let discovery = Arc::new(MulticastDiscovery::new(MulticastConfig {
                device_id: self.inner.identity.device_id().to_string(),
                display_name: self.inner.options.display_name.clone(),
                advertise_port: local_addr.port(),
                scan_interval: Duration::from_millis(self.inner.options.config.scan_interval_ms),
                tls_fingerprint: None,
            }));
            let events = discovery.subscribe();
            discovery.start().await;
            *self
                .inner
                .discovery
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&discovery));

            let react_inner = Arc::clone(&self.inner);
            self.inner.push_task(tokio::spawn(async move {
                react_to_discovery(react_inner, events).await;
            }));
        }

        Ok(())
    }

    /// Stop discovery, abort background tasks, close every session
    /// (failing their pending RPCs), and await the listener's close.
    /// Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, NodeState::Stopping | NodeState::Stopped) {
                return;
            }
            *state = NodeState::Stopping;
        }

        let discovery = self
            .inner
            .discovery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(discovery) = discovery {
            discovery.stop().await;
        }

        let handles: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }

        self.inner.sessions.close_all();
        self.inner.set_state(NodeState::Stopped);
        info!(device_id = %self.inner.identity.device_id(), "mesh node stopped");
    }

    /// Dial a peer, run the client side of the handshake, and register
    /// the session. Returns the authenticated peer's `deviceId` once the
    /// session is installed, so an `invoke` issued right after this
    /// returns will find it.
    pub async fn connect_to_peer(
        &self,
        url: &str,
        expected_device_id: Option<&str>,
    ) -> MeshResult<String> {
        connect_to_peer(
            Arc::clone(&self.inner),
            url.to_string(),
            expected_device_id.map(String::from),
        )
        .await
    }

    /// Forward a message to a peer under the trust gate.
    pub async fn forward(&self, request: ForwardRequest) -> MeshResult<ForwardAck> {
        forward_message_to_peer(
            &self.inner.sessions,
            self.inner.identity.device_id(),
            request,
        )
        .await
    }

    /// Where to dispatch a named channel: local-first, then peers.
    pub fn resolve_channel(&self, channel: &str) -> Route {
        clawmesh_wire::resolve_route(
            channel,
            &self.inner.capabilities,
            &self.inner.options.config.capabilities,
        )
    }

    /// Install (or override) a method handler.
    pub fn register_method<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(RequestCtx) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = MeshResult<Value>> + Send + 'static,
    {
        self.inner.methods.register(method, handler);
    }

    pub fn device_id(&self) -> &str {
        self.inner.identity.device_id()
    }

    /// Bound address; only set after `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .local_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> NodeState {
        self.inner.current_state()
    }

    pub fn trust(&self) -> &TrustStore {
        &self.inner.trust
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.sessions
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.inner.capabilities
    }

    pub fn world(&self) -> &Arc<WorldModel> {
        &self.inner.world
    }

    pub fn propagator(&self) -> &ContextPropagator {
        &self.inner.propagator
    }
}

impl NodeInner {
    fn current_state(&self) -> NodeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: NodeState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn push_task(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    fn local_capabilities(&self) -> Vec<String> {
        self.options.config.capabilities.clone()
    }

    fn peer_summaries(&self) -> Vec<Value> {
        self.sessions
            .list_connected()
            .into_iter()
            .map(|session| {
                json!({
                    "deviceId": session.device_id,
                    "displayName": session.display_name,
                    "outbound": session.outbound,
                    "capabilities": self.capabilities.capabilities_of(&session.device_id),
                    "connectedAtMs": session.connected_at_ms,
                })
            })
            .collect()
    }
}

/// Wire up the standard `mesh.*` method set.
fn install_standard_methods(inner: &Arc<NodeInner>) {
    // A second mesh.connect on an authenticated session is a protocol
    // violation, not a handshake.
    inner.methods.register("mesh.connect", |_ctx| async move {
        Err::<Value, _>(MeshError::new(
            ErrorCode::AuthFailed,
            "handshake already complete on this connection",
        ))
    });

    let node = Arc::clone(inner);
    inner.methods.register("mesh.peers", move |_ctx| {
        let node = Arc::clone(&node);
        async move { Ok(json!({ "peers": node.peer_summaries() })) }
    });

    let node = Arc::clone(inner);
    inner.methods.register("mesh.status", move |_ctx| {
        let node = Arc::clone(&node);
        async move {
            Ok(json!({
                "localDeviceId": node.identity.device_id(),
                "displayName": node.options.display_name,
                "connectedPeers": node.sessions.len(),
                "peers": node.peer_summaries(),
                "capabilities": node.local_capabilities(),
                "worldModelSize": node.world.size(),
                "uptimeMs": node.started_at.elapsed().as_millis() as u64,
            }))
        }
    });

    let node = Arc::clone(inner);
    inner.methods.register("mesh.trust.list", move |_ctx| {
        let node = Arc::clone(&node);
        async move {
            let peers = serde_json::to_value(node.trust.list())
                .map_err(|e| MeshError::internal(e.to_string()))?;
            Ok(json!({ "peers": peers }))
        }
    });

    let node = Arc::clone(inner);
    inner.methods.register("mesh.trust.add", move |ctx| {
        let node = Arc::clone(&node);
        async move {
            let device_id = required_device_id(&ctx.params)?;
            let display_name = ctx.params["displayName"].as_str().map(String::from);
            let public_key = ctx.params["publicKey"].as_str().map(String::from);
            let added = node
                .trust
                .add(&device_id, display_name, public_key)
                .map_err(|e| MeshError::internal(e.to_string()))?;
            Ok(json!({ "added": added, "deviceId": device_id }))
        }
    });

    let node = Arc::clone(inner);
    inner.methods.register("mesh.trust.remove", move |ctx| {
        let node = Arc::clone(&node);
        async move {
            let device_id = required_device_id(&ctx.params)?;
            let removed = node
                .trust
                .remove(&device_id)
                .map_err(|e| MeshError::internal(e.to_string()))?;
            Ok(json!({ "removed": removed, "deviceId": device_id }))
        }
    });

    let node = Arc::clone(inner);
    inner.methods.register(FORWARD_METHOD, move |ctx| {
        let node = Arc::clone(&node);
        async move { node.forwards.handle(ctx.params).await }
    });
}

fn required_device_id(params: &Value) -> MeshResult<String> {
    match params.get("deviceId").and_then(|v| v.as_str()) {
        Some(device_id) if !device_id.trim().is_empty() => Ok(device_id.to_string()),
        _ => Err(MeshError::invalid_params("deviceId is required")),
    }
}

async fn accept_loop(inner: Arc<NodeInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "accepted connection");
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(inner, stream, addr).await {
                        debug!(%addr, error = %err, "inbound connection ended");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Server side of a connection: challenge, verify `mesh.connect`,
/// answer with our own signed payload, then serve the session until the
/// socket closes.
async fn serve_connection(
    inner: Arc<NodeInner>,
    stream: TcpStream,
    addr: SocketAddr,
) -> MeshResult<()> {
    let mut ws = tokio_tungstenite::accept_async(stream).await.map_err(|e| {
        MeshError::new(
            ErrorCode::AuthFailed,
            format!("websocket accept failed: {e}"),
        )
    })?;

    let nonce = generate_nonce();
    transport::send_frame(
        &mut ws,
        &WireFrame::event(CHALLENGE_EVENT, json!({ "nonce": nonce })),
    )
    .await?;

    let frame = transport::recv_frame_timeout(&mut ws, HANDSHAKE_TIMEOUT).await?;
    let WireFrame::Req { id, method, params } = frame else {
        return Err(MeshError::new(
            ErrorCode::AuthFailed,
            "expected a mesh.connect request",
        ));
    };

    if method != "mesh.connect" {
        let err = MeshError::new(
            ErrorCode::AuthFailed,
            "authentication required: complete mesh.connect first",
        );
        let _ = transport::send_frame(&mut ws, &WireFrame::err_response(id.clone(), err.clone())).await;
        return Err(err);
    }

    let payload: AuthPayload = match serde_json::from_value(params) {
        Ok(payload) => payload,
        Err(e) => {
            let err = MeshError::invalid_params(format!("malformed auth payload: {e}"));
            let _ =
                transport::send_frame(&mut ws, &WireFrame::err_response(id.clone(), err.clone())).await;
            return Err(err);
        }
    };

    // A client that echoes a nonce must echo ours.
    if let Some(client_nonce) = &payload.nonce {
        if !nonce_matches(&nonce, client_nonce) {
            let err = MeshError::new(ErrorCode::AuthFailed, "nonce mismatch");
            let _ =
                transport::send_frame(&mut ws, &WireFrame::err_response(id.clone(), err.clone())).await;
            return Err(err);
        }
    }

    let check = HandshakeCheck {
        trusted: inner.trust.contains(&payload.device_id),
        now_ms: now_ms(),
    };
    if let Err(err) = verify_auth_payload(&payload, &check) {
        warn!(%addr, device_id = %payload.device_id, code = %err.code, "handshake refused");
        let _ = transport::send_frame(&mut ws, &WireFrame::err_response(id.clone(), err.clone())).await;
        return Err(err);
    }

    let server_payload = build_auth_payload(
        &inner.identity,
        now_ms(),
        None,
        inner.options.display_name.clone(),
        inner.local_capabilities(),
    );
    let server_payload = serde_json::to_value(server_payload)
        .map_err(|e| MeshError::internal(e.to_string()))?;
    transport::send_frame(&mut ws, &WireFrame::ok_response(id.clone(), server_payload)).await?;

    info!(
        device_id = %payload.device_id,
        %addr,
        "inbound handshake complete"
    );

    let (conn_id, mut read) = register_session(&inner, ws, &payload, false);
    read_loop(&inner, &mut read, &conn_id, &payload.device_id).await;
    finish_session(&inner, &conn_id);
    Ok(())
}

/// Client side: dial, answer the challenge, verify the server's signed
/// payload, register the session, and spawn its read loop. The session
/// is installed before this returns.
async fn connect_to_peer(
    inner: Arc<NodeInner>,
    url: String,
    expected_device_id: Option<String>,
) -> MeshResult<String> {
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.map_err(|e| {
        MeshError::new(
            ErrorCode::NotConnected,
            format!("dial {url} failed: {e}"),
        )
    })?;

    let frame = transport::recv_frame_timeout(&mut ws, HANDSHAKE_TIMEOUT).await?;
    let nonce = match frame {
        WireFrame::Event { event, payload } if event == CHALLENGE_EVENT => payload
            .get("nonce")
            .and_then(|n| n.as_str())
            .map(String::from),
        _ => {
            return Err(MeshError::new(
                ErrorCode::AuthFailed,
                "server did not issue a challenge",
            ));
        }
    };

    let auth = build_auth_payload(
        &inner.identity,
        now_ms(),
        nonce,
        inner.options.display_name.clone(),
        inner.local_capabilities(),
    );
    let request_id = uuid::Uuid::new_v4().to_string();
    let params = serde_json::to_value(auth).map_err(|e| MeshError::internal(e.to_string()))?;
    transport::send_frame(
        &mut ws,
        &WireFrame::Req {
            id: request_id.clone(),
            method: "mesh.connect".to_string(),
            params,
        },
    )
    .await?;

    let frame = transport::recv_frame_timeout(&mut ws, HANDSHAKE_TIMEOUT).await?;
    let WireFrame::Res {
        id,
        ok,
        payload,
        error,
    } = frame
    else {
        return Err(MeshError::new(
            ErrorCode::AuthFailed,
            "expected a mesh.connect response",
        ));
    };
    if id != request_id {
        return Err(MeshError::new(
            ErrorCode::AuthFailed,
            "response does not match the handshake request",
        ));
    }
    if !ok {
        return Err(error.unwrap_or_else(|| {
            MeshError::new(ErrorCode::AuthFailed, "handshake refused without a reason")
        }));
    }

    let server_auth: AuthPayload =
        serde_json::from_value(payload.unwrap_or(Value::Null)).map_err(|e| {
            MeshError::invalid_params(format!("malformed server auth payload: {e}"))
        })?;

    if let Some(expected) = &expected_device_id {
        if expected != &server_auth.device_id {
            return Err(MeshError::new(
                ErrorCode::AuthFailed,
                format!(
                    "peer identified as {} but {} was expected",
                    server_auth.device_id, expected
                ),
            ));
        }
    }

    let check = HandshakeCheck {
        trusted: inner.trust.contains(&server_auth.device_id),
        now_ms: now_ms(),
    };
    verify_auth_payload(&server_auth, &check)?;

    info!(device_id = %server_auth.device_id, url = %url, "outbound handshake complete");

    let device_id = server_auth.device_id.clone();
    let (conn_id, mut read) = register_session(&inner, ws, &server_auth, true);
    let loop_inner = Arc::clone(&inner);
    let loop_device = device_id.clone();
    tokio::spawn(async move {
        read_loop(&loop_inner, &mut read, &conn_id, &loop_device).await;
        finish_session(&loop_inner, &conn_id);
    });

    Ok(device_id)
}

/// Split the socket, start its writer task, and install the session and
/// the peer's advertised capabilities.
fn register_session<S>(
    inner: &Arc<NodeInner>,
    ws: WebSocketStream<S>,
    auth: &AuthPayload,
    outbound: bool,
) -> (String, SplitStream<WebSocketStream<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (sink, read) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();
    transport::spawn_writer(sink, rx);

    let session = PeerSession::new(
        auth.device_id.clone(),
        conn_id.clone(),
        auth.display_name.clone(),
        auth.public_key.clone(),
        outbound,
        now_ms(),
        tx,
    );
    inner.sessions.register(session);
    inner
        .capabilities
        .update_peer(&auth.device_id, auth.capabilities.clone().unwrap_or_default());
    (conn_id, read)
}

/// Tear down after the read loop ends. Capabilities go away with the
/// session, but only if this connection still owned it.
fn finish_session(inner: &Arc<NodeInner>, conn_id: &str) {
    if let Some(device_id) = inner.sessions.unregister(conn_id) {
        inner.capabilities.remove_peer(&device_id);
        info!(device_id = %device_id, "peer disconnected");
    }
}

/// Route frames from one session until the socket closes.
async fn read_loop<S>(
    inner: &Arc<NodeInner>,
    read: &mut SplitStream<WebSocketStream<S>>,
    conn_id: &str,
    device_id: &str,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = transport::next_frame(read).await {
        match frame {
            WireFrame::Req { id, method, params } => {
                let ctx = RequestCtx {
                    peer_device_id: device_id.to_string(),
                    params,
                };
                let result = inner.methods.dispatch(&method, ctx).await;
                let response = match result {
                    Ok(payload) => WireFrame::ok_response(id.clone(), payload),
                    Err(err) => {
                        debug!(method = %method, code = %err.code, "request failed");
                        WireFrame::err_response(id.clone(), err)
                    }
                };
                // Respond only while this connection still owns the session.
                if let Some(session) = inner.sessions.get(device_id) {
                    if session.conn_id == conn_id {
                        let _ = session.send_frame(response);
                    }
                }
            }
            WireFrame::Res {
                id,
                ok,
                payload,
                error,
            } => {
                if !inner.sessions.handle_rpc_result(&id, ok, payload, error) {
                    debug!(id = %id, "response for unknown request id");
                }
            }
            WireFrame::Event { event, payload } => {
                handle_event(inner, device_id, &event, payload);
            }
        }
    }
}

fn handle_event(inner: &Arc<NodeInner>, from_device_id: &str, event: &str, payload: Value) {
    match event {
        CONTEXT_FRAME_EVENT => match serde_json::from_value::<ContextFrame>(payload) {
            Ok(frame) => {
                inner.propagator.handle_inbound(frame, from_device_id);
            }
            Err(e) => debug!(error = %e, "dropping malformed context frame"),
        },
        CAPABILITIES_EVENT => {
            let capabilities: Vec<String> = payload
                .get("capabilities")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            inner.capabilities.update_peer(from_device_id, capabilities);
        }
        other => debug!(event = other, "ignoring unknown event"),
    }
}

/// Keep a configured static peer connected, with jittered exponential
/// backoff between failed dials.
async fn maintain_static_peer(inner: Arc<NodeInner>, peer: DiscoveredPeer) {
    let Some(host) = peer.host.clone() else {
        return;
    };
    let url = format!("ws://{host}:{}", peer.port);
    let mut backoff = RECONNECT_BASE;
    loop {
        if inner.current_state() != NodeState::Listening {
            break;
        }
        if inner.sessions.is_connected(&peer.device_id) {
            backoff = RECONNECT_BASE;
            tokio::time::sleep(STATIC_PEER_CHECK).await;
            continue;
        }
        match connect_to_peer(Arc::clone(&inner), url.clone(), Some(peer.device_id.clone())).await {
            Ok(_) => {
                backoff = RECONNECT_BASE;
                tokio::time::sleep(STATIC_PEER_CHECK).await;
            }
            Err(err) => {
                debug!(url = %url, error = %err, "static peer dial failed");
                let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                backoff = (backoff * 2).min(RECONNECT_CAP);
            }
        }
    }
}

/// Dial trusted peers surfaced by discovery, honoring the
/// connection-direction tiebreak.
async fn react_to_discovery(
    inner: Arc<NodeInner>,
    mut events: broadcast::Receiver<DiscoveryEvent>,
) {
    loop {
        match events.recv().await {
            Ok(DiscoveryEvent::PeerDiscovered(peer)) => {
                if !inner.trust.contains(&peer.device_id) {
                    debug!(device_id = %peer.device_id, "ignoring untrusted discovered peer");
                    continue;
                }
                if inner.sessions.is_connected(&peer.device_id) {
                    continue;
                }
                if !should_initiate(inner.identity.device_id(), &peer.device_id) {
                    debug!(device_id = %peer.device_id, "tiebreak: waiting for peer to dial");
                    continue;
                }
                let Some(host) = peer.host.clone() else {
                    continue;
                };
                if peer.tls_fingerprint.is_some() {
                    // The beacon pins a certificate, but this node dials
                    // plaintext ws:// and observes none. The signed
                    // handshake still authenticates the peer.
                    warn!(
                        device_id = %peer.device_id,
                        "peer advertises a TLS fingerprint this transport cannot attest"
                    );
                }
                let url = format!("ws://{host}:{}", peer.port);
                if let Err(err) =
                    connect_to_peer(Arc::clone(&inner), url, Some(peer.device_id.clone())).await
                {
                    debug!(device_id = %peer.device_id, error = %err, "discovery dial failed");
                }
            }
            Ok(DiscoveryEvent::PeerLost(device_id)) => {
                debug!(device_id = %device_id, "discovery reports peer lost");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "discovery events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
