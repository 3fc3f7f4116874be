//! Shared types for the clawmesh gateway fabric.
//!
//! Everything that crosses a crate boundary lives here: the wire frame
//! protocol, the command envelope and its trust policy, context frames
//! for gossip, capability strings, the error taxonomy, and configuration.
//!
//! All policy functions in this crate are pure and synchronous. The
//! node runtime enforces them, it never reimplements them.

pub mod canonical;
pub mod capability;
pub mod config;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod trust;
pub mod wire;

pub use envelope::{CommandDraft, CommandEnvelope, CommandOperation, CommandSource, CommandTarget, TargetKind};
pub use error::{ErrorCode, MeshError, MeshResult};
pub use frame::{ContextFrame, ContextKind, FrameTrust};
pub use trust::{ActionType, EvidenceSource, ForwardPayload, TrustMetadata, TrustTier, VerificationMode};
pub use wire::{WireError, WireFrame, MAX_FRAME_BYTES};
