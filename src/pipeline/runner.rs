//! The per-request pipeline driver
//!
//! Drives stages strictly in order for one request while pipelines for
//! different requests interleave freely. Every stage call returns an
//! explicit result the driver branches on; stage failures terminate the
//! pipeline and are recorded on-ledger only where the protocol requires it
//! (consensus rejection). Ledger writes for one request happen from this
//! single sequential task, so they are never interleaved.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{
    DeliveryHandoff, DeliveryOutcome, PipelineRecord, PipelineRegistry, Stage,
};
use crate::attestation::{EventQuery, EventVerifier};
use crate::bus::{EventBus, EventStatus, PipelineEvent};
use crate::consensus::{ConsensusContext, ConsensusPanel};
use crate::fulfiller::{
    verify_delivery, DispatchOrder, DispatchResult, Fulfillment, OfficerRegistry,
};
use crate::geo;
use crate::gnss::{LocationClaim, LocationVerifier};
use crate::ledger::{ConsensusSubmission, Ledger, LedgerEvent, VerificationRecord};
use crate::types::{AidRequest, RequestStatus, Result as CorridorResult};

/// How many trailing requests the restart scan inspects for pipelines to
/// resume
const RESUME_SCAN_WINDOW: u64 = 200;

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wall-clock delivery window, matched to the ledger timeout rule
    pub delivery_timeout: Duration,
    /// Aerial drop tolerance in metres
    pub delivery_radius_m: f64,
    /// Disaster event search radius in kilometres
    pub event_search_radius_km: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: Duration::from_secs(24 * 3600),
            delivery_radius_m: 30.0,
            event_search_radius_km: 100.0,
        }
    }
}

/// The pipeline orchestrator
///
/// All collaborators are explicit constructor dependencies: startup wires
/// the real clients, tests wire fakes.
pub struct Orchestrator {
    ledger: Arc<dyn Ledger>,
    gnss: Arc<dyn LocationVerifier>,
    events: Arc<dyn EventVerifier>,
    consensus: Arc<dyn ConsensusPanel>,
    fulfillment: Arc<dyn Fulfillment>,
    officers: Arc<dyn OfficerRegistry>,
    bus: Arc<EventBus>,
    registry: PipelineRegistry,
    config: OrchestratorConfig,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        gnss: Arc<dyn LocationVerifier>,
        events: Arc<dyn EventVerifier>,
        consensus: Arc<dyn ConsensusPanel>,
        fulfillment: Arc<dyn Fulfillment>,
        officers: Arc<dyn OfficerRegistry>,
        bus: Arc<EventBus>,
        config: OrchestratorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ledger,
            gnss,
            events,
            consensus,
            fulfillment,
            officers,
            bus,
            registry: PipelineRegistry::new(),
            config,
            shutdown,
        }
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Create the pipeline record for a freshly submitted request and spawn
    /// its driver task.
    pub fn start_pipeline(
        self: &Arc<Self>,
        request: AidRequest,
        claim: LocationClaim,
    ) -> CorridorResult<()> {
        let record = Arc::new(PipelineRecord::new(request.id));
        self.registry
            .insert(Arc::clone(&record))
            .map_err(crate::CorridorError::Internal)?;

        info!(request_id = request.id, requester = %request.requester, "Pipeline started");

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run(record, request, claim).await;
        });
        Ok(())
    }

    /// Stage driver for one request
    async fn run(self: Arc<Self>, record: Arc<PipelineRecord>, request: AidRequest, claim: LocationClaim) {
        let id = request.id;

        // Stage 1: the record exists; exits immediately.
        record.set_stage(Stage::Request);
        self.publish(id, Stage::Request, EventStatus::Started, "aid request received").await;
        record.complete_stage(Stage::Request);
        self.publish(id, Stage::Request, EventStatus::Completed, "pipeline record created").await;

        // Stage 2: GNSS location authentication (off-ledger per the
        // combined stage-3 write).
        record.set_stage(Stage::GnssVerify);
        self.publish(id, Stage::GnssVerify, EventStatus::Started, "authenticating location").await;
        let gnss = match self.gnss.verify_location(&claim).await {
            Ok(bundle) => bundle,
            Err(failure) => {
                self.fail(&record, Stage::GnssVerify, failure.to_string()).await;
                return;
            }
        };
        let gnss_hash = match gnss.digest() {
            Ok(h) => h,
            Err(e) => {
                self.fail(&record, Stage::GnssVerify, e.to_string()).await;
                return;
            }
        };
        record.attach_gnss(gnss.clone());
        record.complete_stage(Stage::GnssVerify);
        self.publish_data(
            id,
            Stage::GnssVerify,
            EventStatus::Completed,
            "location authenticated",
            serde_json::json!({ "gnss_hash": gnss_hash, "satellites": gnss.satellite_count }),
        )
        .await;

        // Stage 3: disaster event attestation + the single verification
        // write carrying both hashes.
        record.set_stage(Stage::EventVerify);
        self.publish(id, Stage::EventVerify, EventStatus::Started, "cross-referencing disaster event").await;
        let query = EventQuery {
            lat: geo::from_e7(request.lat_e7),
            lng: geo::from_e7(request.lng_e7),
            radius_km: self.config.event_search_radius_km,
        };
        let event = match self.events.verify_event(&query).await {
            Ok(attestation) => attestation,
            Err(failure) => {
                self.fail(&record, Stage::EventVerify, failure.to_string()).await;
                return;
            }
        };
        let event_hash = match event.digest() {
            Ok(h) => h,
            Err(e) => {
                self.fail(&record, Stage::EventVerify, e.to_string()).await;
                return;
            }
        };
        let verification = VerificationRecord {
            gnss_hash: gnss_hash.clone(),
            event_id: event.event_id.clone(),
            event_class: event.event_class.clone(),
            event_severity: event.severity.to_wire(),
            event_hash: event_hash.clone(),
            distance_m: event.distance_m,
            source_count: event.source_count(),
        };
        if let Err(e) = self.ledger.submit_verification(id, &verification).await {
            self.fail(&record, Stage::EventVerify, format!("verification write: {}", e)).await;
            return;
        }
        record.attach_event(event.clone());
        record.complete_stage(Stage::EventVerify);
        self.publish_data(
            id,
            Stage::EventVerify,
            EventStatus::Completed,
            format!("{} attested in {}", event.event_class, event.region),
            serde_json::json!({ "event_hash": event_hash, "sources": event.sources }),
        )
        .await;

        // Stage 4: LLM panel consensus. The outcome is written on-ledger
        // whether approved or rejected.
        record.set_stage(Stage::Consensus);
        self.publish(id, Stage::Consensus, EventStatus::Started, "running consensus panel").await;
        let ctx = ConsensusContext {
            request: request.clone(),
            gnss,
            event,
        };
        let transcript = match self.consensus.run_consensus(&ctx).await {
            Ok(t) => t,
            Err(e) => {
                self.fail(&record, Stage::Consensus, e.to_string()).await;
                return;
            }
        };
        let transcript_hash = match transcript.digest() {
            Ok(h) => h,
            Err(e) => {
                self.fail(&record, Stage::Consensus, e.to_string()).await;
                return;
            }
        };
        let submission = ConsensusSubmission {
            approved: transcript.approved,
            transcript_hash,
            node_count: transcript.node_count,
            approval_count: transcript.approval_count,
            aid_class: transcript.aid_class.map(|c| c.to_wire()),
            fulfiller_class: transcript.fulfiller_class.map(|c| c.to_wire()),
            estimated_cost: transcript.estimated_cost,
        };
        if let Err(e) = self.ledger.submit_consensus(id, &submission).await {
            self.fail(&record, Stage::Consensus, format!("consensus write: {}", e)).await;
            return;
        }
        record.attach_transcript(transcript.clone());
        if !transcript.approved {
            let reason = transcript
                .reason
                .unwrap_or_else(|| "panel rejected the request".to_string());
            self.fail(&record, Stage::Consensus, format!("consensus rejected: {}", reason)).await;
            return;
        }
        record.complete_stage(Stage::Consensus);
        self.publish_data(
            id,
            Stage::Consensus,
            EventStatus::Completed,
            format!(
                "approved {} of {} valid nodes",
                transcript.approval_count, transcript.valid_count
            ),
            serde_json::json!({
                "estimated_cost": transcript.estimated_cost,
                "aid_class": transcript.aid_class,
                "fulfiller_class": transcript.fulfiller_class,
            }),
        )
        .await;

        // The aggregates exist on every approved transcript; a hole here is
        // an internal bug, not a dependency fault.
        let (fulfiller_class, cost) = match (transcript.fulfiller_class, transcript.estimated_cost) {
            (Some(class), Some(cost)) => (class, cost),
            _ => {
                error!(request_id = id, "Approved transcript missing aggregates");
                self.fail(&record, Stage::Consensus, "internal: approved transcript missing aggregates").await;
                return;
            }
        };

        // Stage 5: escrow + fulfiller binding on-ledger.
        record.set_stage(Stage::Contract);
        self.publish(id, Stage::Contract, EventStatus::Started, "binding fulfiller and escrow").await;
        let fulfiller = match self.fulfillment.select(fulfiller_class).await {
            Ok(f) => f,
            Err(e) => {
                self.fail(&record, Stage::Contract, e.to_string()).await;
                return;
            }
        };
        if let Err(e) = self.ledger.assign_fulfiller(id, &fulfiller.address, cost).await {
            self.fail(&record, Stage::Contract, format!("fulfiller assignment: {}", e)).await;
            return;
        }
        record.complete_stage(Stage::Contract);
        self.publish_data(
            id,
            Stage::Contract,
            EventStatus::Completed,
            format!("escrow funded, fulfiller {}", fulfiller.name),
            serde_json::json!({ "fulfiller": fulfiller.address, "escrow_amount": cost }),
        )
        .await;

        // Stage 6: dispatch.
        record.set_stage(Stage::Fulfillment);
        self.publish(id, Stage::Fulfillment, EventStatus::Started, "dispatching fulfiller").await;
        let order = DispatchOrder {
            reference: DispatchOrder::reference_for(id),
            aid_class: request.aid_class,
            lat: geo::from_e7(request.lat_e7),
            lng: geo::from_e7(request.lng_e7),
            estimated_cost: cost,
        };
        let dispatch = match self.fulfillment.dispatch(&fulfiller, &order).await {
            Ok(d) => d,
            Err(e) => {
                // Fatal: escrow stays bound, operator intervention required.
                self.fail(&record, Stage::Fulfillment, format!("dispatch failed: {}", e)).await;
                return;
            }
        };
        record.attach_dispatch(dispatch.clone());
        record.complete_stage(Stage::Fulfillment);
        self.publish_data(
            id,
            Stage::Fulfillment,
            EventStatus::Completed,
            format!("dispatched via {}", dispatch.fulfiller_name),
            serde_json::json!({ "dispatch_id": dispatch.dispatch_id, "eta_minutes": dispatch.eta_minutes }),
        )
        .await;

        self.await_delivery_and_settle(record, request).await;
    }

    /// The delivery rendezvous and the receipt/settlement tail.
    ///
    /// Shared between a live pipeline after dispatch and a pipeline resumed
    /// from a `Funded` ledger state after restart.
    async fn await_delivery_and_settle(self: &Arc<Self>, record: Arc<PipelineRecord>, request: AidRequest) {
        let id = request.id;

        // Arm the rendezvous before the stage becomes visible so a proof
        // arriving immediately after a status poll cannot fall in the gap.
        let delivery_rx = record.arm_delivery();
        record.set_stage(Stage::AwaitingDelivery);
        self.publish(id, Stage::AwaitingDelivery, EventStatus::Pending, "awaiting delivery proof").await;
        let mut shutdown = self.shutdown.clone();

        let handoff: DeliveryHandoff = tokio::select! {
            handoff = delivery_rx => match handoff {
                Ok(h) => h,
                Err(_) => {
                    // The record was torn down underneath us (on-ledger
                    // timeout observed by the poller).
                    debug!(request_id = id, "Delivery rendezvous dropped");
                    return;
                }
            },
            _ = tokio::time::sleep(self.config.delivery_timeout) => {
                warn!(request_id = id, "Delivery window expired");
                if let Err(e) = self.ledger.timeout_request(id).await {
                    error!(request_id = id, error = %e, "Timeout write failed");
                }
                self.fail(&record, Stage::AwaitingDelivery, "delivery window expired, escrow returned to pool").await;
                return;
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                self.publish(id, Stage::AwaitingDelivery, EventStatus::Shutdown, "orchestrator shutting down").await;
                self.registry.remove(id);
                return;
            }
        };

        // Stage 7: delivery verification.
        record.set_stage(Stage::Receipt);
        self.publish(id, Stage::Receipt, EventStatus::Started, "verifying delivery proof").await;
        let verification = verify_delivery(
            &handoff.proof,
            request.lat_e7,
            request.lng_e7,
            self.config.delivery_radius_m,
            self.officers.as_ref(),
        );
        let verification_hash = match verification.digest() {
            Ok(h) => h,
            Err(e) => {
                let _ = handoff.outcome_tx.send(DeliveryOutcome::Failed(e.to_string()));
                self.fail(&record, Stage::Receipt, e.to_string()).await;
                return;
            }
        };
        if let Err(e) = self
            .ledger
            .verify_delivery(id, verification.verified, &verification_hash)
            .await
        {
            let _ = handoff.outcome_tx.send(DeliveryOutcome::Failed(e.to_string()));
            self.fail(&record, Stage::Receipt, format!("delivery write: {}", e)).await;
            return;
        }
        if !verification.verified {
            let reason = verification
                .reason
                .clone()
                .unwrap_or_else(|| "delivery verification failed".to_string());
            record.attach_delivery(handoff.proof, verification);
            let _ = handoff.outcome_tx.send(DeliveryOutcome::Failed(reason.clone()));
            // DeliveryFailed is on-ledger; the timeout rule returns escrow.
            self.fail(&record, Stage::Receipt, reason).await;
            return;
        }
        record.attach_delivery(handoff.proof, verification);
        record.complete_stage(Stage::Receipt);
        self.publish_data(
            id,
            Stage::Receipt,
            EventStatus::Completed,
            "delivery verified",
            serde_json::json!({ "verification_hash": verification_hash }),
        )
        .await;

        // Stage 8: settlement.
        record.set_stage(Stage::Settlement);
        self.publish(id, Stage::Settlement, EventStatus::Started, "releasing payout").await;
        match self.ledger.release_payout(id).await {
            Ok(receipt) => {
                record.complete_stage(Stage::Settlement);
                self.publish_data(
                    id,
                    Stage::Settlement,
                    EventStatus::Completed,
                    "payout released",
                    serde_json::json!({ "tx_hash": receipt.tx_hash }),
                )
                .await;
                let _ = handoff.outcome_tx.send(DeliveryOutcome::Settled);
                self.registry.remove(id);
                info!(request_id = id, "Pipeline settled");
            }
            Err(e) => {
                let _ = handoff.outcome_tx.send(DeliveryOutcome::Failed(e.to_string()));
                self.fail(&record, Stage::Settlement, format!("payout write: {}", e)).await;
            }
        }
    }

    /// Scan the tail of the ledger for requests the previous process left
    /// mid-flight: funded requests get an idempotent re-dispatch, then both
    /// funded and delivery-submitted requests get their delivery windows
    /// re-armed.
    pub async fn resume_active(self: &Arc<Self>) {
        let count = match self.ledger.get_request_count().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Resume scan skipped: request count unavailable");
                return;
            }
        };

        let from = count.saturating_sub(RESUME_SCAN_WINDOW) + 1;
        let mut resumed = 0usize;
        for id in from..=count {
            let request = match self.ledger.get_request(id).await {
                Ok(r) => r,
                Err(e) => {
                    debug!(request_id = id, error = %e, "Resume scan read failed");
                    continue;
                }
            };
            match request.status {
                RequestStatus::Funded => {
                    // The crash may have landed between the escrow binding
                    // and the dispatch call, so the dispatch is re-attempted
                    // before the delivery wait.
                    let record = Arc::new(PipelineRecord::new(id));
                    if self.registry.insert(Arc::clone(&record)).is_err() {
                        continue;
                    }
                    resumed += 1;
                    info!(request_id = id, "Resuming funded request after restart");
                    let orchestrator = Arc::clone(self);
                    tokio::spawn(async move {
                        orchestrator.resume_funded(record, request).await;
                    });
                }
                RequestStatus::DeliverySubmitted => {
                    // The proof anchored by the fulfiller never made it
                    // through verification before the crash. Re-arm the
                    // window: the fulfiller re-submits the proof, or the
                    // timeout returns the escrow. No re-dispatch - the
                    // delivery already happened.
                    let record = Arc::new(PipelineRecord::new(id));
                    if self.registry.insert(Arc::clone(&record)).is_err() {
                        continue;
                    }
                    resumed += 1;
                    info!(request_id = id, "Re-arming delivery window for submitted proof after restart");
                    let orchestrator = Arc::clone(self);
                    tokio::spawn(async move {
                        orchestrator.await_delivery_and_settle(record, request).await;
                    });
                }
                _ => {}
            }
        }
        if resumed > 0 {
            info!(resumed, "Pipelines resumed from ledger state");
        }
    }

    /// Resume a request found `Funded` on restart.
    ///
    /// The dispatch is re-attempted from the on-ledger assignment before
    /// the delivery wait: the deliverable reference is deterministic
    /// (`aidchain-{id}`), so a fulfiller that was already notified returns
    /// its existing dispatch instead of creating a second one. A failing
    /// re-dispatch does not kill the pipeline - the delivery window still
    /// bounds the request either way.
    async fn resume_funded(self: &Arc<Self>, record: Arc<PipelineRecord>, request: AidRequest) {
        match self.redispatch(&request).await {
            Ok(dispatch) => {
                record.attach_dispatch(dispatch.clone());
                self.publish_data(
                    request.id,
                    Stage::Fulfillment,
                    EventStatus::Completed,
                    format!("re-dispatched via {} after restart", dispatch.fulfiller_name),
                    serde_json::json!({ "dispatch_id": dispatch.dispatch_id }),
                )
                .await;
            }
            Err(e) => {
                warn!(
                    request_id = request.id,
                    error = %e,
                    "Re-dispatch after restart failed, relying on the delivery window"
                );
            }
        }
        self.await_delivery_and_settle(record, request).await;
    }

    /// Rebuild and re-issue the dispatch for a funded request from the
    /// on-ledger escrow/fulfiller binding.
    async fn redispatch(&self, request: &AidRequest) -> CorridorResult<DispatchResult> {
        let assignment = self
            .ledger
            .get_fulfiller_assignment(request.id)
            .await?
            .ok_or_else(|| {
                crate::CorridorError::Internal(format!(
                    "request {} is funded without an assignment",
                    request.id
                ))
            })?;

        let fulfiller = self
            .ledger
            .get_approved_fulfillers()
            .await?
            .into_iter()
            .find(|f| f.address == assignment.fulfiller)
            .ok_or_else(|| {
                crate::CorridorError::Upstream(format!(
                    "assigned fulfiller {} not in the approved set",
                    assignment.fulfiller
                ))
            })?;

        let order = DispatchOrder {
            reference: DispatchOrder::reference_for(request.id),
            aid_class: request.aid_class,
            lat: geo::from_e7(request.lat_e7),
            lng: geo::from_e7(request.lng_e7),
            estimated_cost: assignment.escrow_amount,
        };
        self.fulfillment.dispatch(&fulfiller, &order).await
    }

    /// React to events observed by the ledger poller
    pub async fn handle_ledger_event(&self, event: LedgerEvent) {
        match event {
            LedgerEvent::RequestTimedOut { request_id, .. } => {
                if let Some(record) = self.registry.remove(request_id) {
                    record.set_error("request timed out on-ledger");
                    self.publish(
                        request_id,
                        Stage::AwaitingDelivery,
                        EventStatus::Failed,
                        "request timed out on-ledger, escrow returned to pool",
                    )
                    .await;
                }
            }
            LedgerEvent::AidRequested { request_id, .. } => {
                if self.registry.get(request_id).is_none() {
                    // On-ledger submissions carry no signal bundle; the
                    // pipeline starts when the requester submits through
                    // the surface.
                    debug!(request_id, "On-ledger submission observed, awaiting surface submission");
                }
            }
            LedgerEvent::PayoutReleased { request_id, amount, .. } => {
                debug!(request_id, amount, "Payout release observed");
            }
            other => {
                debug!(event = ?other, "Ledger event observed");
            }
        }
    }

    /// Emit the final shutdown event for every pipeline still registered
    pub async fn emit_shutdown_events(&self) {
        for snapshot in self.registry.active_snapshots() {
            self.publish(
                snapshot.request_id,
                snapshot.current_stage,
                EventStatus::Shutdown,
                "orchestrator shutting down",
            )
            .await;
        }
    }

    async fn publish(&self, request_id: u64, stage: Stage, status: EventStatus, message: impl Into<String>) {
        self.bus
            .publish(PipelineEvent::new(request_id, stage, status, message))
            .await;
    }

    async fn publish_data(
        &self,
        request_id: u64,
        stage: Stage,
        status: EventStatus,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        self.bus
            .publish(PipelineEvent::new(request_id, stage, status, message).with_data(data))
            .await;
    }

    /// Terminate a pipeline: record the error, emit the final failed event,
    /// destroy the record.
    async fn fail(&self, record: &PipelineRecord, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        warn!(request_id = record.request_id, stage = ?stage, %message, "Pipeline terminated");
        record.set_error(message.clone());
        self.publish_data(
            record.request_id,
            stage,
            EventStatus::Failed,
            message,
            serde_json::json!({ "stage": stage.as_str() }),
        )
        .await;
        self.registry.remove(record.request_id);
    }
}

/// Resolve once the shutdown flag flips to true
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender gone: treat as shutdown
            return;
        }
    }
}
