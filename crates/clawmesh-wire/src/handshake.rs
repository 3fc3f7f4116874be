//! Mutual authentication over an accepted transport connection.
//!
//! The server challenges with a nonce; the client answers with a signed
//! payload over the pipe-delimited canonical string
//! `mesh.connect|v1|deviceId|signedAtMs[|nonce]`, and the server replies
//! with the same shape signed by its own key. A `v1` payload without a
//! nonce still verifies; the canonical string simply has no nonce
//! segment.
//!
//! Authentication rests entirely on the Ed25519 signatures: the node
//! terminates plaintext `ws://` and has no certificate to attest, so a
//! discovery-advertised TLS fingerprint cannot be checked here. The
//! `TLS_FINGERPRINT_MISMATCH` code stays in the taxonomy for peers that
//! do terminate TLS.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use clawmesh_identity::{device_id_from_public_key_hex, verify_signature, DeviceIdentity};
use clawmesh_types::{ErrorCode, MeshError, MeshResult};

/// Event the server emits immediately after accepting a connection.
pub const CHALLENGE_EVENT: &str = "mesh.challenge";

/// Accepted clock drift. Drift of exactly this much is rejected.
pub const MAX_CLOCK_DRIFT_MS: i64 = 5 * 60 * 1000;

/// The signed authentication payload exchanged in `mesh.connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub device_id: String,
    /// Hex-encoded raw Ed25519 public key.
    pub public_key: String,
    /// Hex-encoded signature over the canonical auth string.
    pub signature: String,
    pub signed_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

/// The canonical string both sides sign.
pub fn canonical_auth_string(device_id: &str, signed_at_ms: i64, nonce: Option<&str>) -> String {
    match nonce {
        Some(nonce) => format!("mesh.connect|v1|{device_id}|{signed_at_ms}|{nonce}"),
        None => format!("mesh.connect|v1|{device_id}|{signed_at_ms}"),
    }
}

/// A random 32-byte hex nonce for the server challenge.
pub fn generate_nonce() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

/// Constant-time comparison of a client's echoed nonce against the
/// challenge the server issued.
pub fn nonce_matches(expected: &str, provided: &str) -> bool {
    if expected.len() != provided.len() {
        return false;
    }
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Build and sign an auth payload for the local identity.
pub fn build_auth_payload(
    identity: &DeviceIdentity,
    signed_at_ms: i64,
    nonce: Option<String>,
    display_name: Option<String>,
    capabilities: Vec<String>,
) -> AuthPayload {
    let canonical = canonical_auth_string(identity.device_id(), signed_at_ms, nonce.as_deref());
    AuthPayload {
        device_id: identity.device_id().to_string(),
        public_key: identity.public_key_hex(),
        signature: identity.sign_hex(canonical.as_bytes()),
        signed_at_ms,
        nonce,
        display_name,
        capabilities: Some(capabilities),
    }
}

/// Context the verifier needs beyond the payload itself.
#[derive(Debug, Clone, Default)]
pub struct HandshakeCheck {
    /// Whether the claimed `deviceId` is in the trust set right now.
    pub trusted: bool,
    pub now_ms: i64,
}

/// Verify a received auth payload.
///
/// Checks, in order: trust-set membership, key/deviceId consistency,
/// signature over the canonical string, and clock drift. Failure closes
/// the connection with the typed error.
pub fn verify_auth_payload(payload: &AuthPayload, check: &HandshakeCheck) -> MeshResult<()> {
    if payload.device_id.trim().is_empty() || payload.public_key.trim().is_empty() {
        return Err(MeshError::invalid_params(
            "auth payload requires deviceId and publicKey",
        ));
    }

    if !check.trusted {
        return Err(MeshError::new(
            ErrorCode::UntrustedPeer,
            format!("device {} is not in the trust set", payload.device_id),
        ));
    }

    match device_id_from_public_key_hex(&payload.public_key) {
        Some(derived) if derived == payload.device_id => {}
        _ => {
            return Err(MeshError::new(
                ErrorCode::AuthFailed,
                "deviceId does not match the presented public key",
            ));
        }
    }

    let canonical = canonical_auth_string(
        &payload.device_id,
        payload.signed_at_ms,
        payload.nonce.as_deref(),
    );
    if !verify_signature(&payload.public_key, canonical.as_bytes(), &payload.signature) {
        return Err(MeshError::new(
            ErrorCode::AuthFailed,
            "signature does not verify over the canonical auth string",
        ));
    }

    let drift = (check.now_ms - payload.signed_at_ms).abs();
    if drift >= MAX_CLOCK_DRIFT_MS {
        return Err(MeshError::new(
            ErrorCode::AuthFailed,
            format!("signedAtMs drift {drift}ms exceeds the allowed window"),
        ));
    }

    Ok(())
}

/// Connection-direction tiebreak: when both peers see each other
/// concurrently, only the lexicographically smaller `deviceId`
/// initiates, so the steady state has one session per pair.
pub fn should_initiate(local_device_id: &str, remote_device_id: &str) -> bool {
    local_device_id < remote_device_id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trusted_now(now_ms: i64) -> HandshakeCheck {
        HandshakeCheck {
            trusted: true,
            now_ms,
        }
    }

    #[test]
    fn test_build_then_verify() {
        let identity = DeviceIdentity::generate();
        let payload = build_auth_payload(&identity, 1_000_000, None, None, vec![]);
        assert!(verify_auth_payload(&payload, &trusted_now(1_000_000)).is_ok());
    }

    #[test]
    fn test_nonce_is_part_of_signature() {
        let identity = DeviceIdentity::generate();
        let mut payload =
            build_auth_payload(&identity, 1_000_000, Some("abc".to_string()), None, vec![]);
        assert!(verify_auth_payload(&payload, &trusted_now(1_000_000)).is_ok());

        // Stripping the nonce changes the canonical string.
        payload.nonce = None;
        let err = verify_auth_payload(&payload, &trusted_now(1_000_000)).unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthFailed);
    }

    #[test]
    fn test_altered_signature_rejected() {
        let identity = DeviceIdentity::generate();
        let mut payload = build_auth_payload(&identity, 1_000_000, None, None, vec![]);
        let mut sig = payload.signature.into_bytes();
        sig[0] = if sig[0] == b'0' { b'1' } else { b'0' };
        payload.signature = String::from_utf8(sig).unwrap();
        let err = verify_auth_payload(&payload, &trusted_now(1_000_000)).unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthFailed);
    }

    #[test]
    fn test_untrusted_peer_rejected_first() {
        let identity = DeviceIdentity::generate();
        let payload = build_auth_payload(&identity, 1_000_000, None, None, vec![]);
        let check = HandshakeCheck {
            trusted: false,
            ..trusted_now(1_000_000)
        };
        let err = verify_auth_payload(&payload, &check).unwrap_err();
        assert_eq!(err.code, ErrorCode::UntrustedPeer);
    }

    #[test]
    fn test_device_id_must_match_key() {
        let identity = DeviceIdentity::generate();
        let other = DeviceIdentity::generate();
        let mut payload = build_auth_payload(&identity, 1_000_000, None, None, vec![]);
        payload.public_key = other.public_key_hex();
        let err = verify_auth_payload(&payload, &trusted_now(1_000_000)).unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthFailed);
    }

    #[test]
    fn test_drift_window_boundaries() {
        let identity = DeviceIdentity::generate();
        let signed_at = 10 * 60 * 1000i64;
        let payload = build_auth_payload(&identity, signed_at, None, None, vec![]);

        // Four minutes of drift: accepted.
        let ok = trusted_now(signed_at + 4 * 60 * 1000);
        assert!(verify_auth_payload(&payload, &ok).is_ok());

        // Exactly five minutes: rejected.
        let edge = trusted_now(signed_at + MAX_CLOCK_DRIFT_MS);
        assert_eq!(
            verify_auth_payload(&payload, &edge).unwrap_err().code,
            ErrorCode::AuthFailed
        );

        // Past the window in the other direction too.
        let past = trusted_now(signed_at - MAX_CLOCK_DRIFT_MS - 1);
        assert!(verify_auth_payload(&payload, &past).is_err());
    }

    #[test]
    fn test_nonce_matches_constant_time() {
        let nonce = generate_nonce();
        assert!(nonce_matches(&nonce, &nonce.clone()));
        assert!(!nonce_matches(&nonce, &generate_nonce()));
        assert!(!nonce_matches(&nonce, "short"));
    }

    #[test]
    fn test_tiebreak_smaller_initiates() {
        assert!(should_initiate("aaa", "bbb"));
        assert!(!should_initiate("bbb", "aaa"));
        assert!(!should_initiate("aaa", "aaa"));
    }
}
