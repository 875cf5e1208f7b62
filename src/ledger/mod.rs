//! Ledger adapter - typed interface to the on-ledger escrow and registry
//!
//! The orchestrator never talks to the chain directly: every read and every
//! state transition goes through the [`Ledger`] trait. Startup wires the RPC
//! implementation; tests wire fakes. Writes are signed with the process-wide
//! oracle key and serialised (one in-flight write per signing key).
//!
//! Monetary values cross this boundary as integer minor units; coordinates
//! as signed integers at scale 10^7.

pub mod events;
pub mod rpc;

pub use events::{load_cursor, store_cursor, EventPoller};
pub use rpc::{with_write_backoff, RpcLedger};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AidRequest, CorridorError, FulfillerClass, PoolStats};

/// Ledger adapter error kinds
///
/// Transient faults are retried inside the adapter with bounded backoff;
/// everything else surfaces immediately.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// No oracle key provisioned; writes are disabled
    #[error("ledger writes unavailable: {0}")]
    Unavailable(String),

    /// RPC timeout, connection failure, or temporary node error
    #[error("transient ledger fault: {0}")]
    Transient(String),

    /// Contract revert or invalid state transition; never retried
    #[error("transaction reverted: {0}")]
    Reverted(String),

    /// Malformed response or non-retriable RPC failure
    #[error("ledger rpc error: {0}")]
    Rpc(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }
}

impl From<LedgerError> for CorridorError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Unavailable(msg) => CorridorError::LedgerUnavailable(msg),
            LedgerError::Reverted(msg) => CorridorError::LedgerRevert(msg),
            LedgerError::Transient(msg) | LedgerError::Rpc(msg) => CorridorError::Ledger(msg),
        }
    }
}

/// Confirmed transaction receipt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block: u64,
}

/// New-request submission relayed on behalf of an authenticated requester
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSubmission {
    pub requester: String,
    pub aid_class: u8,
    pub urgency: u8,
    pub lat_e7: i64,
    pub lng_e7: i64,
    pub details_digest: String,
}

/// The single stage-3 verification write: GNSS proof hash plus the event
/// attestation fields, written together at event-verification exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub gnss_hash: String,
    pub event_id: String,
    pub event_class: String,
    pub event_severity: u8,
    pub event_hash: String,
    pub distance_m: u64,
    pub source_count: u32,
}

/// Consensus outcome write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSubmission {
    pub approved: bool,
    pub transcript_hash: String,
    pub node_count: u32,
    pub approval_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aid_class: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfiller_class: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<u64>,
}

/// One entry of the ledger's approved-fulfiller registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillerInfo {
    pub address: String,
    pub name: String,
    pub class: FulfillerClass,
    /// Dispatch endpoint base URL
    pub endpoint: String,
}

/// The escrow/fulfiller binding written by `assign_fulfiller`, read back
/// when a restarted orchestrator has to reconstruct a funded request's
/// dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillerAssignment {
    pub fulfiller: String,
    pub escrow_amount: u64,
}

/// Typed events decoded from ledger logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    AidRequested {
        request_id: u64,
        requester: String,
        block: u64,
    },
    RequestVerified {
        request_id: u64,
        block: u64,
    },
    ConsensusReached {
        request_id: u64,
        approved: bool,
        block: u64,
    },
    FulfillerAssigned {
        request_id: u64,
        fulfiller: String,
        amount: u64,
        block: u64,
    },
    DeliverySubmitted {
        request_id: u64,
        block: u64,
    },
    DeliveryVerified {
        request_id: u64,
        verified: bool,
        block: u64,
    },
    PayoutReleased {
        request_id: u64,
        amount: u64,
        block: u64,
    },
    RequestTimedOut {
        request_id: u64,
        block: u64,
    },
}

impl LedgerEvent {
    pub fn request_id(&self) -> u64 {
        match self {
            Self::AidRequested { request_id, .. }
            | Self::RequestVerified { request_id, .. }
            | Self::ConsensusReached { request_id, .. }
            | Self::FulfillerAssigned { request_id, .. }
            | Self::DeliverySubmitted { request_id, .. }
            | Self::DeliveryVerified { request_id, .. }
            | Self::PayoutReleased { request_id, .. }
            | Self::RequestTimedOut { request_id, .. } => *request_id,
        }
    }

    pub fn block(&self) -> u64 {
        match self {
            Self::AidRequested { block, .. }
            | Self::RequestVerified { block, .. }
            | Self::ConsensusReached { block, .. }
            | Self::FulfillerAssigned { block, .. }
            | Self::DeliverySubmitted { block, .. }
            | Self::DeliveryVerified { block, .. }
            | Self::PayoutReleased { block, .. }
            | Self::RequestTimedOut { block, .. } => *block,
        }
    }
}

/// Typed read/write interface to the on-ledger contracts
///
/// One read operation per entity, one write operation per transition. Writes
/// await one confirmation before returning and never hold orchestrator
/// private data - only the fields the ledger accepts.
#[async_trait]
pub trait Ledger: Send + Sync {
    // Reads
    async fn get_request(&self, id: u64) -> Result<AidRequest, LedgerError>;
    async fn get_user_requests(&self, address: &str) -> Result<Vec<u64>, LedgerError>;
    async fn get_request_count(&self) -> Result<u64, LedgerError>;
    async fn is_identity_verified(&self, address: &str) -> Result<bool, LedgerError>;
    async fn get_pool_stats(&self) -> Result<PoolStats, LedgerError>;
    async fn get_approved_fulfillers(&self) -> Result<Vec<FulfillerInfo>, LedgerError>;
    /// The escrow/fulfiller binding for a request; `None` before stage 5
    async fn get_fulfiller_assignment(
        &self,
        request_id: u64,
    ) -> Result<Option<FulfillerAssignment>, LedgerError>;

    // Writes (oracle-signed, confirmed)
    async fn submit_request(&self, submission: &RequestSubmission) -> Result<u64, LedgerError>;
    async fn submit_verification(
        &self,
        request_id: u64,
        record: &VerificationRecord,
    ) -> Result<TxReceipt, LedgerError>;
    async fn submit_consensus(
        &self,
        request_id: u64,
        submission: &ConsensusSubmission,
    ) -> Result<TxReceipt, LedgerError>;
    async fn assign_fulfiller(
        &self,
        request_id: u64,
        fulfiller: &str,
        escrow_amount: u64,
    ) -> Result<TxReceipt, LedgerError>;
    async fn verify_delivery(
        &self,
        request_id: u64,
        verified: bool,
        verification_hash: &str,
    ) -> Result<TxReceipt, LedgerError>;
    async fn release_payout(&self, request_id: u64) -> Result<TxReceipt, LedgerError>;
    async fn timeout_request(&self, request_id: u64) -> Result<TxReceipt, LedgerError>;

    // Event subscription
    async fn block_number(&self) -> Result<u64, LedgerError>;
    async fn get_events(&self, from_block: u64, to_block: u64)
        -> Result<Vec<LedgerEvent>, LedgerError>;

    /// Whether this adapter can sign writes (oracle key provisioned)
    fn writes_enabled(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_event_accessors() {
        let e = LedgerEvent::PayoutReleased {
            request_id: 12,
            amount: 150_000_000,
            block: 88,
        };
        assert_eq!(e.request_id(), 12);
        assert_eq!(e.block(), 88);
    }

    #[test]
    fn test_ledger_event_serialization() {
        let e = LedgerEvent::AidRequested {
            request_id: 3,
            requester: "ab".repeat(32),
            block: 10,
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"event\":\"aid_requested\""));
        let back: LedgerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn test_transient_classification() {
        assert!(LedgerError::Transient("rpc timeout".into()).is_transient());
        assert!(!LedgerError::Reverted("bad state".into()).is_transient());
        assert!(!LedgerError::Unavailable("no key".into()).is_transient());
    }

    #[test]
    fn test_consensus_submission_omits_empty_choices() {
        let s = ConsensusSubmission {
            approved: false,
            transcript_hash: "00".repeat(32),
            node_count: 5,
            approval_count: 1,
            aid_class: None,
            fulfiller_class: None,
            estimated_cost: None,
        };
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("aid_class"));
        assert!(!json.contains("estimated_cost"));
    }
}
