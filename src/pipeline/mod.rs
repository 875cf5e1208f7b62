//! Per-request pipeline state
//!
//! A pipeline record exists in memory exactly while the orchestrator is
//! driving the request: created on submission, destroyed on terminal status
//! or timeout. The registry map is the single shared mutable structure; its
//! lock is held only for lookup/insert/delete, never across suspensions.

pub mod runner;

pub use runner::{Orchestrator, OrchestratorConfig};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

use crate::attestation::EventAttestation;
use crate::consensus::ConsensusTranscript;
use crate::fulfiller::{DeliveryProof, DeliveryVerification, DispatchResult};
use crate::gnss::GnssProofBundle;

/// Pipeline stages. `AwaitingDelivery` is the rendezvous between dispatch
/// and proof arrival; it reports the fulfilment stage number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Request,
    GnssVerify,
    EventVerify,
    Consensus,
    Contract,
    Fulfillment,
    AwaitingDelivery,
    Receipt,
    Settlement,
}

impl Stage {
    pub fn number(self) -> u8 {
        match self {
            Self::Request => 1,
            Self::GnssVerify => 2,
            Self::EventVerify => 3,
            Self::Consensus => 4,
            Self::Contract => 5,
            Self::Fulfillment => 6,
            Self::AwaitingDelivery => 6,
            Self::Receipt => 7,
            Self::Settlement => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::GnssVerify => "gnss_verify",
            Self::EventVerify => "event_verify",
            Self::Consensus => "consensus",
            Self::Contract => "contract",
            Self::Fulfillment => "fulfillment",
            Self::AwaitingDelivery => "awaiting_delivery",
            Self::Receipt => "receipt",
            Self::Settlement => "settlement",
        }
    }
}

/// Outcome reported back to a delivery-proof submitter
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Settled,
    Failed(String),
}

/// A delivery proof handed to the waiting pipeline, with the channel the
/// submitter is blocked on
pub struct DeliveryHandoff {
    pub proof: DeliveryProof,
    pub outcome_tx: oneshot::Sender<DeliveryOutcome>,
}

/// Completion timestamp of one stage
#[derive(Debug, Clone, Serialize)]
pub struct StageCompletion {
    pub stage: Stage,
    /// RFC3339
    pub completed_at: String,
}

#[derive(Default)]
struct RecordInner {
    stage: Option<Stage>,
    completed: Vec<StageCompletion>,
    gnss: Option<GnssProofBundle>,
    event: Option<EventAttestation>,
    transcript: Option<ConsensusTranscript>,
    dispatch: Option<DispatchResult>,
    delivery_proof: Option<DeliveryProof>,
    delivery_verification: Option<DeliveryVerification>,
    last_error: Option<String>,
}

enum DeliverySlot {
    /// Pipeline has not reached the rendezvous yet
    NotArmed,
    /// Pipeline is waiting on this sender
    Armed(oneshot::Sender<DeliveryHandoff>),
    /// A proof was already handed over
    Consumed,
}

/// In-memory state of one active pipeline
pub struct PipelineRecord {
    pub request_id: u64,
    started: Instant,
    started_at: chrono::DateTime<chrono::Utc>,
    inner: Mutex<RecordInner>,
    delivery: Mutex<DeliverySlot>,
}

/// Queryable snapshot of a pipeline record
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub request_id: u64,
    pub current_stage: Stage,
    pub stage_number: u8,
    pub elapsed_ms: u64,
    pub started_at: String,
    pub stages: Vec<StageCompletion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineRecord {
    pub fn new(request_id: u64) -> Self {
        Self {
            request_id,
            started: Instant::now(),
            started_at: chrono::Utc::now(),
            inner: Mutex::new(RecordInner::default()),
            delivery: Mutex::new(DeliverySlot::NotArmed),
        }
    }

    pub fn set_stage(&self, stage: Stage) {
        self.inner.lock().unwrap().stage = Some(stage);
    }

    pub fn complete_stage(&self, stage: Stage) {
        self.inner.lock().unwrap().completed.push(StageCompletion {
            stage,
            completed_at: chrono::Utc::now().to_rfc3339(),
        });
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.inner.lock().unwrap().last_error = Some(message.into());
    }

    pub fn attach_gnss(&self, bundle: GnssProofBundle) {
        self.inner.lock().unwrap().gnss = Some(bundle);
    }

    pub fn attach_event(&self, attestation: EventAttestation) {
        self.inner.lock().unwrap().event = Some(attestation);
    }

    pub fn attach_transcript(&self, transcript: ConsensusTranscript) {
        self.inner.lock().unwrap().transcript = Some(transcript);
    }

    pub fn attach_dispatch(&self, dispatch: DispatchResult) {
        self.inner.lock().unwrap().dispatch = Some(dispatch);
    }

    pub fn attach_delivery(&self, proof: DeliveryProof, verification: DeliveryVerification) {
        let mut inner = self.inner.lock().unwrap();
        inner.delivery_proof = Some(proof);
        inner.delivery_verification = Some(verification);
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let inner = self.inner.lock().unwrap();
        PipelineSnapshot {
            request_id: self.request_id,
            current_stage: inner.stage.unwrap_or(Stage::Request),
            stage_number: inner.stage.unwrap_or(Stage::Request).number(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            started_at: self.started_at.to_rfc3339(),
            stages: inner.completed.clone(),
            error: inner.last_error.clone(),
        }
    }

    /// Arm the delivery rendezvous; the pipeline task awaits the returned
    /// receiver.
    pub fn arm_delivery(&self) -> oneshot::Receiver<DeliveryHandoff> {
        let (tx, rx) = oneshot::channel();
        *self.delivery.lock().unwrap() = DeliverySlot::Armed(tx);
        rx
    }

    /// Hand a delivery proof to the waiting pipeline. First submission
    /// wins; repeats get a clear state error.
    pub fn offer_proof(
        &self,
        proof: DeliveryProof,
    ) -> Result<oneshot::Receiver<DeliveryOutcome>, String> {
        let mut slot = self.delivery.lock().unwrap();
        match std::mem::replace(&mut *slot, DeliverySlot::Consumed) {
            DeliverySlot::Armed(tx) => {
                let (outcome_tx, outcome_rx) = oneshot::channel();
                let handoff = DeliveryHandoff { proof, outcome_tx };
                tx.send(handoff)
                    .map_err(|_| "pipeline no longer waiting for delivery".to_string())?;
                Ok(outcome_rx)
            }
            DeliverySlot::NotArmed => {
                *slot = DeliverySlot::NotArmed;
                Err("request is not awaiting delivery".to_string())
            }
            DeliverySlot::Consumed => {
                Err("delivery proof already submitted".to_string())
            }
        }
    }

    pub fn gnss(&self) -> Option<GnssProofBundle> {
        self.inner.lock().unwrap().gnss.clone()
    }

    pub fn event(&self) -> Option<EventAttestation> {
        self.inner.lock().unwrap().event.clone()
    }

    pub fn transcript(&self) -> Option<ConsensusTranscript> {
        self.inner.lock().unwrap().transcript.clone()
    }
}

/// Registry of active pipelines, keyed by request id
#[derive(Default)]
pub struct PipelineRegistry {
    records: Mutex<HashMap<u64, Arc<PipelineRecord>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh record; refuses a duplicate id
    pub fn insert(&self, record: Arc<PipelineRecord>) -> Result<(), String> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.request_id) {
            return Err(format!("pipeline {} already active", record.request_id));
        }
        records.insert(record.request_id, record);
        Ok(())
    }

    pub fn get(&self, request_id: u64) -> Option<Arc<PipelineRecord>> {
        self.records.lock().unwrap().get(&request_id).cloned()
    }

    pub fn remove(&self, request_id: u64) -> Option<Arc<PipelineRecord>> {
        self.records.lock().unwrap().remove(&request_id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Snapshots of every active pipeline, ordered by request id
    pub fn active_snapshots(&self) -> Vec<PipelineSnapshot> {
        let records: Vec<Arc<PipelineRecord>> =
            self.records.lock().unwrap().values().cloned().collect();
        let mut snapshots: Vec<PipelineSnapshot> =
            records.iter().map(|r| r.snapshot()).collect();
        snapshots.sort_by_key(|s| s.request_id);
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aerial_proof() -> DeliveryProof {
        DeliveryProof::Aerial {
            drop_lat_e7: 0,
            drop_lng_e7: 0,
            payload_image_digest: "aa".repeat(32),
            drone_id: "drone-1".into(),
            timestamp: 0,
        }
    }

    #[test]
    fn test_stage_numbering() {
        assert_eq!(Stage::Request.number(), 1);
        assert_eq!(Stage::GnssVerify.number(), 2);
        assert_eq!(Stage::AwaitingDelivery.number(), 6);
        assert_eq!(Stage::Settlement.number(), 8);
    }

    #[test]
    fn test_registry_insert_and_duplicate() {
        let registry = PipelineRegistry::new();
        registry.insert(Arc::new(PipelineRecord::new(1))).unwrap();
        assert!(registry.insert(Arc::new(PipelineRecord::new(1))).is_err());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(1).is_some());
        registry.remove(1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_reflects_progress() {
        let record = PipelineRecord::new(5);
        record.set_stage(Stage::GnssVerify);
        record.complete_stage(Stage::Request);
        record.set_error("boom");
        let s = record.snapshot();
        assert_eq!(s.request_id, 5);
        assert_eq!(s.current_stage, Stage::GnssVerify);
        assert_eq!(s.stage_number, 2);
        assert_eq!(s.stages.len(), 1);
        assert_eq!(s.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_delivery_rendezvous_first_wins() {
        let record = PipelineRecord::new(7);
        let rx = record.arm_delivery();

        let _outcome_rx = record.offer_proof(aerial_proof()).unwrap();
        // Second submission is a clear state error
        let err = record.offer_proof(aerial_proof()).unwrap_err();
        assert!(err.contains("already submitted"));

        let handoff = rx.await.unwrap();
        assert_eq!(handoff.proof.delivery_class(), crate::types::FulfillerClass::Aerial);
    }

    #[test]
    fn test_proof_before_rendezvous_is_rejected() {
        let record = PipelineRecord::new(8);
        let err = record.offer_proof(aerial_proof()).unwrap_err();
        assert!(err.contains("not awaiting"));
        // Still not armed: a later arm + offer works
        let _rx = record.arm_delivery();
        assert!(record.offer_proof(aerial_proof()).is_ok());
    }

    #[test]
    fn test_active_snapshots_sorted() {
        let registry = PipelineRegistry::new();
        for id in [9u64, 3, 6] {
            registry.insert(Arc::new(PipelineRecord::new(id))).unwrap();
        }
        let ids: Vec<u64> = registry.active_snapshots().iter().map(|s| s.request_id).collect();
        assert_eq!(ids, vec![3, 6, 9]);
    }
}
