//! Error taxonomy for the mesh.
//!
//! Every failure that can cross the wire carries a stable code string.
//! RPC errors are values: they travel in the `error` field of a response
//! frame and are surfaced to the caller of `invoke`, never thrown across
//! the event loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Stable error codes carried in response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Transport
    SendFailed,
    PeerDisconnected,
    NotConnected,
    Timeout,
    UnknownMethod,
    InternalError,

    // Auth
    UntrustedPeer,
    AuthFailed,
    /// Returned by TLS-terminating peers whose observed certificate does
    /// not match a pinned fingerprint. This node dials plaintext `ws://`
    /// and never emits it locally; it is kept so remote denials parse.
    TlsFingerprintMismatch,
    InvalidParams,

    // Forward / trust
    LoopDetected,
    DeliveryFailed,
    InvalidCommandEnvelope,
    TrustEnvelopeMismatch,
    InvalidTrustPolicy,
    TrustMetadataRequired,
    LlmOnlyActuationBlocked,
    InsufficientTrustTier,
    VerificationRequired,
}

impl ErrorCode {
    /// The wire representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SendFailed => "SEND_FAILED",
            ErrorCode::PeerDisconnected => "PEER_DISCONNECTED",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::UnknownMethod => "UNKNOWN_METHOD",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::UntrustedPeer => "UNTRUSTED_PEER",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::TlsFingerprintMismatch => "TLS_FINGERPRINT_MISMATCH",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::LoopDetected => "LOOP_DETECTED",
            ErrorCode::DeliveryFailed => "DELIVERY_FAILED",
            ErrorCode::InvalidCommandEnvelope => "INVALID_COMMAND_ENVELOPE",
            ErrorCode::TrustEnvelopeMismatch => "TRUST_ENVELOPE_MISMATCH",
            ErrorCode::InvalidTrustPolicy => "INVALID_TRUST_POLICY",
            ErrorCode::TrustMetadataRequired => "TRUST_METADATA_REQUIRED",
            ErrorCode::LlmOnlyActuationBlocked => "LLM_ONLY_ACTUATION_BLOCKED",
            ErrorCode::InsufficientTrustTier => "INSUFFICIENT_TRUST_TIER",
            ErrorCode::VerificationRequired => "VERIFICATION_REQUIRED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed mesh error: a wire code plus a human-readable message and
/// optional structured details.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct MeshError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl MeshError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Shorthand for the most common parameter-shape failure.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    /// Handler-side catch-all; used where a handler failure must not
    /// escape as a panic.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

/// Alias for mesh results.
pub type MeshResult<T> = Result<T, MeshError>;
