//! LLM panel consensus
//!
//! An attested request is put to a panel of heterogeneous model endpoints.
//! Each node independently returns a structured verdict; the engine
//! aggregates them under a strict two-thirds supermajority with a minimum
//! valid-count floor, then anchors the transcript hash on-ledger.
//!
//! Aggregation rules, deliberately:
//! - cost estimate by **median** - model dollar estimates vary by an order
//!   of magnitude and a mean is too easy to skew;
//! - categorical choices (aid class, fulfiller class) by plurality with a
//!   lowest-numeric-class tiebreak, so the outcome is deterministic.

pub mod engine;
pub mod node;

pub use engine::ConsensusEngine;
pub use node::{OpenAiCompatTransport, VerdictTransport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::attestation::EventAttestation;
use crate::gnss::GnssProofBundle;
use crate::types::{AidClass, AidRequest, FulfillerClass, Result as CorridorResult};

/// Minimum valid (non-failing) nodes for a decision
pub const QUORUM_FLOOR: u32 = 3;

/// The JSON verdict every panel node must return
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmVerdict {
    pub approved: bool,
    pub reason: String,
    /// Recommended aid class, wire encoding 0-5
    pub recommended_aid: u8,
    /// 0 = aerial, 1 = human
    pub fulfiller_type: u8,
    /// Currency minor units
    pub estimated_cost: u64,
    /// 0-100
    pub confidence: u8,
    /// 1-10
    pub priority_score: u8,
}

/// Per-node record in the consensus transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub model: String,
    /// False when the node timed out or returned an unparseable verdict
    pub valid: bool,
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_aid: Option<AidClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfiller_class: Option<FulfillerClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The structured record of a panel run and its aggregated decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusTranscript {
    pub node_count: u32,
    pub valid_count: u32,
    pub approval_count: u32,
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aid_class: Option<AidClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfiller_class: Option<FulfillerClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<u64>,
    /// Mean confidence of approving nodes, basis points (82.5% => 8250)
    pub avg_confidence_bp: u32,
    pub nodes: Vec<NodeRecord>,
}

impl ConsensusTranscript {
    /// Deterministic 32-byte digest over the canonical serialisation
    pub fn digest(&self) -> CorridorResult<String> {
        crate::digest::digest_canonical(self)
    }
}

/// Everything a panel node gets to see: the attested request, nothing more
#[derive(Debug, Clone)]
pub struct ConsensusContext {
    pub request: AidRequest,
    pub gnss: GnssProofBundle,
    pub event: EventAttestation,
}

/// Pipeline-facing seam for the consensus stage
#[async_trait]
pub trait ConsensusPanel: Send + Sync {
    async fn run_consensus(&self, ctx: &ConsensusContext) -> CorridorResult<ConsensusTranscript>;
}

/// Build the structured prompt shared verbatim by every panel node
pub fn build_prompt(ctx: &ConsensusContext) -> String {
    format!(
        "You are one node of an independent review panel for a humanitarian-aid \
protocol. Evaluate the following aid request. Location and disaster data below \
are already cryptographically attested; judge plausibility, urgency and cost.\n\
\n\
Request:\n\
- aid class: {aid} (urgency: {urgency})\n\
- authenticated position: {lat:.5}, {lng:.5} (accuracy {acc:.1} m, {sats} satellites)\n\
\n\
Corroborated disaster event:\n\
- {event_class} in {region}, severity {severity:?}\n\
- distance from requester: {distance:.1} km\n\
- corroborating sources: {sources}\n\
\n\
Answer with a single JSON object, no prose, with exactly these fields:\n\
{{\"approved\": bool, \"reason\": string, \"recommended_aid\": 0-5 \
(0 medical, 1 food, 2 shelter, 3 rescue, 4 comms, 5 evacuation), \
\"fulfiller_type\": 0 or 1 (0 aerial drone drop, 1 human team), \
\"estimated_cost\": integer USD minor units (6 decimal places), \
\"confidence\": 0-100, \"priority_score\": 1-10}}",
        aid = ctx.request.aid_class.as_str(),
        urgency = ctx.request.urgency.as_str(),
        lat = crate::geo::from_e7(ctx.gnss.lat_e7),
        lng = crate::geo::from_e7(ctx.gnss.lng_e7),
        acc = ctx.gnss.accuracy_cm as f64 / 100.0,
        sats = ctx.gnss.satellite_count,
        event_class = ctx.event.event_class,
        region = ctx.event.region,
        severity = ctx.event.severity,
        distance = ctx.event.distance_m as f64 / 1000.0,
        sources = ctx.event.sources.join(", "),
    )
}
