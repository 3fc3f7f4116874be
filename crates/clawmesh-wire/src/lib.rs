//! Peer wiring: mutual authentication, live sessions, capability
//! routing, and the WebSocket framing the node runtime drives.

pub mod handshake;
pub mod registry;
pub mod route;
pub mod session;
pub mod transport;

pub use handshake::{
    build_auth_payload, canonical_auth_string, generate_nonce, nonce_matches, should_initiate,
    verify_auth_payload, AuthPayload, HandshakeCheck, CHALLENGE_EVENT, MAX_CLOCK_DRIFT_MS,
};
pub use registry::CapabilityRegistry;
pub use route::{resolve_route, Route};
pub use session::{Outbound, PeerSession, SessionRegistry, DEFAULT_RPC_TIMEOUT};
