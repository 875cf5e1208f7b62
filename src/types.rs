//! Shared domain types for Corridor
//!
//! The canonical aid-request record mirrored on-ledger, the wire encodings
//! for its enums, and the crate-wide error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, CorridorError>;

/// Top-level error type for Corridor
#[derive(Debug, Error)]
pub enum CorridorError {
    /// Malformed input rejected at the surface; no pipeline is created
    #[error("validation error: {0}")]
    Validation(String),

    /// Writes are disabled because no oracle key was provisioned
    #[error("ledger writes unavailable: {0}")]
    LedgerUnavailable(String),

    /// The ledger rejected the transaction (revert, invalid state); not retriable
    #[error("ledger rejected transaction: {0}")]
    LedgerRevert(String),

    /// Ledger RPC fault that survived the adapter's retry budget
    #[error("ledger error: {0}")]
    Ledger(String),

    /// A remote dependency (GNSS backend, provider, LLM endpoint, fulfiller) failed
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Invariant violation or invalid state transition attempt
    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Wire enums
// ============================================================================

/// Aid class, wire-encoded 0-5
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AidClass {
    Medical,
    Food,
    Shelter,
    Rescue,
    Comms,
    Evacuation,
}

impl AidClass {
    pub const COUNT: usize = 6;

    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Medical),
            1 => Some(Self::Food),
            2 => Some(Self::Shelter),
            3 => Some(Self::Rescue),
            4 => Some(Self::Comms),
            5 => Some(Self::Evacuation),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Medical => 0,
            Self::Food => 1,
            Self::Shelter => 2,
            Self::Rescue => 3,
            Self::Comms => 4,
            Self::Evacuation => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Medical => "medical",
            Self::Food => "food",
            Self::Shelter => "shelter",
            Self::Rescue => "rescue",
            Self::Comms => "comms",
            Self::Evacuation => "evacuation",
        }
    }
}

/// Request urgency, wire-encoded 0-2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Medium),
            1 => Some(Self::High),
            2 => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Medium => 0,
            Self::High => 1,
            Self::Critical => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Fulfiller class, wire-encoded 0-1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillerClass {
    Aerial,
    Human,
}

impl FulfillerClass {
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Aerial),
            1 => Some(Self::Human),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Aerial => 0,
            Self::Human => 1,
        }
    }
}

// ============================================================================
// Request status
// ============================================================================

/// On-ledger request status
///
/// Linear with two failure branches; the ledger enforces the transition
/// constraint, the orchestrator mirrors it to catch internal bugs early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Submitted,
    Verified,
    Approved,
    Funded,
    DeliverySubmitted,
    DeliveryVerified,
    Settled,
    Rejected,
    DeliveryFailed,
    TimedOut,
}

impl RequestStatus {
    /// Whether `next` is a permitted forward transition from `self`
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Submitted, Verified)
                | (Verified, Approved)
                | (Verified, Rejected)
                | (Approved, Funded)
                | (Funded, DeliverySubmitted)
                | (DeliverySubmitted, DeliveryVerified)
                | (DeliverySubmitted, DeliveryFailed)
                | (DeliveryVerified, Settled)
                | (DeliveryFailed, TimedOut)
                | (Funded, TimedOut)
                | (DeliverySubmitted, TimedOut)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Settled | RequestStatus::Rejected | RequestStatus::TimedOut
        )
    }

    /// Whether the orchestrator should hold an in-memory pipeline record
    /// for a request in this status
    pub fn is_pipeline_active(self) -> bool {
        matches!(
            self,
            RequestStatus::Submitted
                | RequestStatus::Verified
                | RequestStatus::Approved
                | RequestStatus::Funded
                | RequestStatus::DeliverySubmitted
        )
    }
}

// ============================================================================
// Aid request
// ============================================================================

/// Canonical aid request record, mirrored on-ledger
///
/// Coordinates are fixed-point signed integers at scale 10^7 degrees;
/// monetary values everywhere in this crate are integer minor units
/// (6 decimal places).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AidRequest {
    /// Monotonic id assigned by the ledger on submission
    pub id: u64,
    /// Requester address (hex-encoded verifying key)
    pub requester: String,
    pub aid_class: AidClass,
    pub urgency: Urgency,
    pub lat_e7: i64,
    pub lng_e7: i64,
    /// SHA-256 over the free-text details; only the digest crosses the adapter
    pub details_digest: String,
    pub status: RequestStatus,
    /// Unix seconds
    pub created_at: i64,
}

/// Fund pool statistics, integer minor units
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_deposited: u64,
    pub total_escrowed: u64,
    pub total_paid_out: u64,
    pub available_balance: u64,
}

/// Format integer minor units (6 dp) as a human-facing decimal string
///
/// Conversion to strings happens only at the external surface; the adapter
/// boundary carries integers.
pub fn format_minor_units(v: u64) -> String {
    format!("{}.{:06}", v / 1_000_000, v % 1_000_000)
}
