//! Context frames: the unit of gossip.
//!
//! A frame carries an observation, event, human input, inference, or
//! capability update, stamped with its source and trust metadata, and a
//! hop counter for bounded re-broadcast.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::trust::{EvidenceSource, TrustTier};

/// What kind of context a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Observation,
    Event,
    HumanInput,
    Inference,
    CapabilityUpdate,
}

impl ContextKind {
    /// Wire string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Observation => "observation",
            ContextKind::Event => "event",
            ContextKind::HumanInput => "human_input",
            ContextKind::Inference => "inference",
            ContextKind::CapabilityUpdate => "capability_update",
        }
    }
}

/// Trust metadata on a context frame: where the evidence came from and
/// how strong it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameTrust {
    pub evidence_sources: Vec<EvidenceSource>,
    pub evidence_trust_tier: TrustTier,
}

impl FrameTrust {
    /// The conventional trust for sensor observations.
    pub fn observation() -> Self {
        Self {
            evidence_sources: vec![EvidenceSource::Sensor],
            evidence_trust_tier: TrustTier::T2OperationalObservation,
        }
    }

    /// The conventional trust for direct human input.
    pub fn human_input() -> Self {
        Self {
            evidence_sources: vec![EvidenceSource::Human],
            evidence_trust_tier: TrustTier::T3VerifiedActionEvidence,
        }
    }

    /// The conventional trust for model inference.
    pub fn inference() -> Self {
        Self {
            evidence_sources: vec![EvidenceSource::Llm],
            evidence_trust_tier: TrustTier::T0PlanningInference,
        }
    }
}

/// A gossip frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFrame {
    pub kind: ContextKind,
    pub frame_id: String,
    pub source_device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_display_name: Option<String>,
    /// Unix millis at the source.
    pub timestamp: i64,
    pub data: Value,
    pub trust: FrameTrust,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Hops taken so far; absent means zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hops: Option<u32>,
}

impl ContextFrame {
    /// Hop count, treating an absent field as zero.
    pub fn hop_count(&self) -> u32 {
        self.hops.unwrap_or(0)
    }
}
