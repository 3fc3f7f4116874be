//! Trust policy: tiers, metadata, and the forward gate.
//!
//! The policy decides whether an actuation request may cross the wire.
//! It is evaluated twice per command, at the sender before transmission
//! and at the receiver before any local side effect, and must refuse
//! the same inputs for the same reasons at both ends. All functions here
//! are pure and synchronous.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::validate_command_envelope;
use crate::error::{ErrorCode, MeshError, MeshResult};

/// Evidence quality, totally ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrustTier {
    #[serde(rename = "T0_planning_inference")]
    T0PlanningInference,
    #[serde(rename = "T1_unverified_observation")]
    T1UnverifiedObservation,
    #[serde(rename = "T2_operational_observation")]
    T2OperationalObservation,
    #[serde(rename = "T3_verified_action_evidence")]
    T3VerifiedActionEvidence,
}

/// What class of effect a command has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Communication,
    Observation,
    Actuation,
}

/// External confirmation required before acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    None,
    Device,
    Human,
    DeviceOrHuman,
}

/// Where the evidence backing a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceSource {
    Llm,
    Sensor,
    Device,
    Human,
    Mixed,
}

/// The trust block carried by command envelopes and forward payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustMetadata {
    pub action_type: ActionType,
    pub evidence_trust_tier: TrustTier,
    pub minimum_trust_tier: TrustTier,
    pub verification_required: VerificationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_satisfied: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_sources: Option<Vec<EvidenceSource>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<Vec<String>>,
}

/// Wire wrapper around an envelope for one-hop delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardPayload {
    pub channel: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub origin_gateway_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Command envelope, validated on receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,
    /// Top-level trust block; must canonically match the envelope's when
    /// both are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust: Option<Value>,
}

fn parse_field<T: DeserializeOwned>(trust: &Value, field: &str) -> MeshResult<Option<T>> {
    match trust.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone()).map(Some).map_err(|_| {
            MeshError::new(
                ErrorCode::InvalidTrustPolicy,
                format!("trust.{field} is outside its domain: {raw}"),
            )
        }),
    }
}

/// Evaluate the trust gate over a forward's effective trust block.
///
/// A missing block is allowed (legacy path). Non-actuation passes once
/// the enum shapes validate. Actuation runs the full rule set in order:
/// metadata presence, llm-only block, tier comparison, verification.
pub fn evaluate_forward_trust(trust: Option<&Value>) -> MeshResult<()> {
    let Some(trust) = trust else {
        return Ok(());
    };
    if trust.is_null() {
        return Ok(());
    }
    if !trust.is_object() {
        return Err(MeshError::new(
            ErrorCode::InvalidTrustPolicy,
            "trust block must be an object",
        ));
    }

    let action_type: Option<ActionType> = parse_field(trust, "action_type")?;
    let evidence_tier: Option<TrustTier> = parse_field(trust, "evidence_trust_tier")?;
    let minimum_tier: Option<TrustTier> = parse_field(trust, "minimum_trust_tier")?;
    let verification: Option<VerificationMode> = parse_field(trust, "verification_required")?;
    let sources: Option<Vec<EvidenceSource>> = parse_field(trust, "evidence_sources")?;
    let satisfied: Option<bool> = parse_field(trust, "verification_satisfied")?;

    if action_type != Some(ActionType::Actuation) {
        return Ok(());
    }

    let (Some(evidence_tier), Some(minimum_tier), Some(verification)) =
        (evidence_tier, minimum_tier, verification)
    else {
        return Err(MeshError::new(
            ErrorCode::TrustMetadataRequired,
            "actuation requires evidence_trust_tier, minimum_trust_tier and verification_required",
        ));
    };

    if let Some(sources) = &sources {
        if !sources.is_empty() && sources.iter().all(|s| *s == EvidenceSource::Llm) {
            return Err(MeshError::new(
                ErrorCode::LlmOnlyActuationBlocked,
                "actuation backed solely by llm evidence is refused",
            ));
        }
    }

    if evidence_tier < minimum_tier {
        return Err(MeshError::new(
            ErrorCode::InsufficientTrustTier,
            format!("evidence tier {evidence_tier:?} is below required {minimum_tier:?}"),
        ));
    }

    if verification != VerificationMode::None && satisfied != Some(true) {
        return Err(MeshError::new(
            ErrorCode::VerificationRequired,
            format!("verification {verification:?} not satisfied"),
        ));
    }

    Ok(())
}

/// Reduce a trust block to its canonical comparison form: the seven
/// policy fields, with `evidence_sources` and `approved_by` sorted and
/// every absent field pinned to null.
pub fn canonical_trust(trust: &Value) -> Value {
    let sorted_strings = |field: &str| -> Value {
        match trust.get(field) {
            Some(Value::Array(arr)) => {
                let mut items: Vec<String> = arr
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                items.sort();
                Value::Array(items.into_iter().map(Value::String).collect())
            }
            _ => Value::Null,
        }
    };
    let pick = |field: &str| trust.get(field).cloned().unwrap_or(Value::Null);

    serde_json::json!({
        "action_type": pick("action_type"),
        "evidence_trust_tier": pick("evidence_trust_tier"),
        "minimum_trust_tier": pick("minimum_trust_tier"),
        "verification_required": pick("verification_required"),
        "verification_satisfied": pick("verification_satisfied"),
        "evidence_sources": sorted_strings("evidence_sources"),
        "approved_by": sorted_strings("approved_by"),
    })
}

/// Resolve the effective trust block for a forward.
///
/// Validates the envelope when present, checks envelope/top-level trust
/// consistency, and returns the block the gate should evaluate: the
/// envelope's when an envelope is carried, the top-level one otherwise.
pub fn resolve_forward_trust(payload: &ForwardPayload) -> MeshResult<Option<Value>> {
    let Some(command) = &payload.command else {
        return Ok(payload.trust.clone());
    };

    let envelope = validate_command_envelope(command)?;
    let envelope_trust = serde_json::to_value(&envelope.trust)
        .map_err(|e| MeshError::internal(format!("trust serialization failed: {e}")))?;

    if let Some(top_level) = &payload.trust {
        if canonical_trust(&envelope_trust) != canonical_trust(top_level) {
            return Err(MeshError::new(
                ErrorCode::TrustEnvelopeMismatch,
                "envelope trust and top-level trust disagree",
            ));
        }
    }

    Ok(Some(envelope_trust))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn actuation_trust() -> Value {
        json!({
            "action_type": "actuation",
            "evidence_trust_tier": "T3_verified_action_evidence",
            "minimum_trust_tier": "T2_operational_observation",
            "verification_required": "human",
            "verification_satisfied": true,
            "evidence_sources": ["sensor", "human"],
        })
    }

    #[test]
    fn test_tier_ordering() {
        assert!(TrustTier::T0PlanningInference < TrustTier::T1UnverifiedObservation);
        assert!(TrustTier::T2OperationalObservation < TrustTier::T3VerifiedActionEvidence);
    }

    #[test]
    fn test_missing_trust_allowed() {
        assert!(evaluate_forward_trust(None).is_ok());
        assert!(evaluate_forward_trust(Some(&Value::Null)).is_ok());
    }

    #[test]
    fn test_verified_actuation_passes() {
        assert!(evaluate_forward_trust(Some(&actuation_trust())).is_ok());
    }

    #[test]
    fn test_unknown_tier_rejected() {
        let mut trust = actuation_trust();
        trust["evidence_trust_tier"] = json!("T9_imaginary");
        let err = evaluate_forward_trust(Some(&trust)).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTrustPolicy);
    }

    #[test]
    fn test_actuation_missing_fields() {
        let trust = json!({"action_type": "actuation"});
        let err = evaluate_forward_trust(Some(&trust)).unwrap_err();
        assert_eq!(err.code, ErrorCode::TrustMetadataRequired);
    }

    #[test]
    fn test_llm_only_blocked() {
        let mut trust = actuation_trust();
        trust["evidence_sources"] = json!(["llm", "llm"]);
        trust["verification_required"] = json!("none");
        let err = evaluate_forward_trust(Some(&trust)).unwrap_err();
        assert_eq!(err.code, ErrorCode::LlmOnlyActuationBlocked);
    }

    #[test]
    fn test_mixed_sources_not_llm_only() {
        let mut trust = actuation_trust();
        trust["evidence_sources"] = json!(["llm", "sensor"]);
        assert!(evaluate_forward_trust(Some(&trust)).is_ok());
    }

    #[test]
    fn test_insufficient_tier() {
        let mut trust = actuation_trust();
        trust["evidence_trust_tier"] = json!("T1_unverified_observation");
        let err = evaluate_forward_trust(Some(&trust)).unwrap_err();
        assert_eq!(err.code, ErrorCode::InsufficientTrustTier);
    }

    #[test]
    fn test_verification_unsatisfied() {
        let mut trust = actuation_trust();
        trust["verification_satisfied"] = json!(false);
        let err = evaluate_forward_trust(Some(&trust)).unwrap_err();
        assert_eq!(err.code, ErrorCode::VerificationRequired);
    }

    #[test]
    fn test_non_actuation_skips_tier_rules() {
        let trust = json!({
            "action_type": "observation",
            "evidence_trust_tier": "T0_planning_inference",
            "minimum_trust_tier": "T3_verified_action_evidence",
            "verification_required": "human",
        });
        assert!(evaluate_forward_trust(Some(&trust)).is_ok());
    }

    #[test]
    fn test_canonical_comparison_order_independent() {
        let a = json!({
            "action_type": "actuation",
            "evidence_sources": ["sensor", "human"],
            "approved_by": ["bob", "alice"],
            "evidence_trust_tier": "T2_operational_observation",
            "minimum_trust_tier": "T2_operational_observation",
            "verification_required": "none",
        });
        let b = json!({
            "verification_required": "none",
            "minimum_trust_tier": "T2_operational_observation",
            "evidence_trust_tier": "T2_operational_observation",
            "approved_by": ["alice", "bob"],
            "evidence_sources": ["human", "sensor"],
            "action_type": "actuation",
        });
        assert_eq!(canonical_trust(&a), canonical_trust(&b));
    }

    #[test]
    fn test_canonical_comparison_detects_mismatch() {
        let mut a = actuation_trust();
        let b = actuation_trust();
        a["minimum_trust_tier"] = json!("T3_verified_action_evidence");
        assert_ne!(canonical_trust(&a), canonical_trust(&b));
    }
}
