//! Disaster event attestation
//!
//! Cross-references a requester's position against several independent
//! disaster-data providers, merges duplicate reports, scores the surviving
//! events and produces a content-addressed attestation for the best match.

pub mod engine;
pub mod providers;

pub use engine::AttestationEngine;
pub use providers::{EventProvider, HttpEventProvider, ProviderEvent};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Result as CorridorResult;

/// Event severity as reported by providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Moderate,
    Severe,
    Critical,
}

impl Severity {
    /// Scoring weight
    pub fn weight(self) -> f64 {
        match self {
            Self::Low => 0.25,
            Self::Moderate => 0.5,
            Self::Severe => 0.75,
            Self::Critical => 1.0,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Moderate => 1,
            Self::Severe => 2,
            Self::Critical => 3,
        }
    }
}

/// Attestation query built from the verified request
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub lat: f64,
    pub lng: f64,
    pub radius_km: f64,
}

/// Content-addressed attestation of a corroborated disaster event.
///
/// `sources` is kept sorted so the canonical serialisation is stable no
/// matter which provider answered first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventAttestation {
    /// Stable event id from the aggregation (survivor's id)
    pub event_id: String,
    pub event_class: String,
    pub severity: Severity,
    pub region: String,
    pub center_lat_e7: i64,
    pub center_lng_e7: i64,
    /// Affected radius in kilometres
    pub radius_km: u32,
    pub sources: Vec<String>,
    /// Distance from the requester to the event centre, metres
    pub distance_m: u64,
    pub active: bool,
    /// Unix seconds
    pub attested_at: i64,
}

impl EventAttestation {
    pub fn source_count(&self) -> u32 {
        self.sources.len() as u32
    }

    /// Deterministic 32-byte digest over the canonical serialisation
    pub fn digest(&self) -> CorridorResult<String> {
        crate::digest::digest_canonical(self)
    }
}

/// Event attestation failure reasons
#[derive(Debug, Clone, PartialEq)]
pub enum AttestationFailure {
    /// No active event of any class within the search radius
    NoEventFound,
    /// The best-scoring event is no longer active
    EventNotActive,
    /// Every configured provider failed or timed out
    ProvidersUnavailable(String),
}

impl fmt::Display for AttestationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEventFound => write!(f, "no disaster event found within the search radius"),
            Self::EventNotActive => write!(f, "the matched disaster event is not active"),
            Self::ProvidersUnavailable(detail) => {
                write!(f, "all disaster-data providers failed: {}", detail)
            }
        }
    }
}

/// Pipeline-facing seam for the attestation stage
#[async_trait]
pub trait EventVerifier: Send + Sync {
    async fn verify_event(&self, query: &EventQuery)
        -> Result<EventAttestation, AttestationFailure>;
}
