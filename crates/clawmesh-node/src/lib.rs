//! clawmesh node runtime.
//!
//! Wires identity, trust, discovery, sessions, routing, the trust-gated
//! forward path and the context propagator into a running mesh node.
//! Host applications inject a [`ForwardSink`] for accepted forwards and
//! may register their own method handlers next to the standard
//! `mesh.*` set.

pub mod forward;
pub mod methods;
pub mod node;

pub use forward::{
    forward_message_to_peer, ForwardAck, ForwardReceiver, ForwardRequest, ForwardSink,
    FORWARD_METHOD,
};
pub use methods::{MethodTable, RequestCtx};
pub use node::{MeshNode, NodeError, NodeOptions, NodeState, CAPABILITIES_EVENT, HANDSHAKE_TIMEOUT};
