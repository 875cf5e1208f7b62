//! Fulfiller dispatch and delivery verification
//!
//! The approved-fulfiller set lives on-ledger; the dispatcher reads it,
//! picks the fulfiller matching the consensus-chosen class, and issues the
//! dispatch call. Delivery proofs arriving later through the webhook surface
//! are verified by a pure function over the proof inputs.

pub mod dispatch;
pub mod verify;

pub use dispatch::FulfillerDispatcher;
pub use verify::{verify_delivery, AcceptAllOfficers, OfficerRegistry};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ledger::FulfillerInfo;
use crate::types::{AidClass, FulfillerClass, Result as CorridorResult};

/// Proof that a delivery happened, as submitted by the fulfiller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "delivery_class", rename_all = "snake_case")]
pub enum DeliveryProof {
    /// Unmanned aerial drop
    Aerial {
        drop_lat_e7: i64,
        drop_lng_e7: i64,
        /// SHA-256 of the payload release photo
        payload_image_digest: String,
        drone_id: String,
        /// Unix seconds
        timestamp: i64,
    },
    /// Human-operated delivery signed off by a field officer
    Human {
        officer_id: String,
        /// Officer signature, base64
        signature: String,
        /// Unix seconds
        timestamp: i64,
    },
}

impl DeliveryProof {
    pub fn delivery_class(&self) -> FulfillerClass {
        match self {
            Self::Aerial { .. } => FulfillerClass::Aerial,
            Self::Human { .. } => FulfillerClass::Human,
        }
    }

    pub fn digest(&self) -> CorridorResult<String> {
        crate::digest::digest_canonical(self)
    }
}

/// Outcome of delivery verification; its canonical digest is anchored
/// on-ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryVerification {
    pub verified: bool,
    pub delivery_class: FulfillerClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gps_ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub officer_ok: Option<bool>,
    /// Drop-to-target distance, metres (aerial only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub proof_digest: String,
    /// Unix seconds
    pub verified_at: i64,
}

impl DeliveryVerification {
    pub fn digest(&self) -> CorridorResult<String> {
        crate::digest::digest_canonical(self)
    }
}

/// A dispatch order for the selected fulfiller
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOrder {
    /// Deliverable reference the fulfiller must echo in its webhook
    pub reference: String,
    pub aid_class: AidClass,
    pub lat: f64,
    pub lng: f64,
    /// Consensus-approved cost, minor units
    pub estimated_cost: u64,
}

impl DispatchOrder {
    pub fn reference_for(request_id: u64) -> String {
        format!("aidchain-{}", request_id)
    }
}

/// Result of a dispatch call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub dispatch_id: String,
    pub fulfiller_address: String,
    pub fulfiller_name: String,
    pub eta_minutes: u32,
}

/// Pipeline-facing seam: fulfiller selection and dispatch
#[async_trait]
pub trait Fulfillment: Send + Sync {
    /// Pick the approved fulfiller for the consensus-chosen class
    async fn select(&self, class: FulfillerClass) -> CorridorResult<FulfillerInfo>;

    /// Issue the dispatch call to the selected fulfiller
    async fn dispatch(
        &self,
        fulfiller: &FulfillerInfo,
        order: &DispatchOrder,
    ) -> CorridorResult<DispatchResult>;
}
