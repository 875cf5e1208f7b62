//! End-to-end pipeline scenarios against in-memory fakes
//!
//! Every external dependency (ledger, GNSS upstream, disaster providers,
//! LLM transport, fulfiller) is faked; the orchestrator, engines and bus
//! are the real implementations.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use corridor::attestation::{
    AttestationEngine, EventProvider, ProviderEvent, Severity,
};
use corridor::bus::{EventBus, EventStatus, PipelineEvent};
use corridor::consensus::{ConsensusEngine, VerdictTransport};
use corridor::config::LlmEndpointConfig;
use corridor::fulfiller::{
    AcceptAllOfficers, DeliveryProof, DispatchOrder, DispatchResult, Fulfillment,
};
use corridor::gnss::{
    GnssAuthenticator, LocationClaim, PositionFix, SatelliteObservation, SignalSnapshot,
    SignalSource,
};
use corridor::ledger::{
    with_write_backoff, ConsensusSubmission, FulfillerAssignment, FulfillerInfo, Ledger,
    LedgerError, LedgerEvent, RequestSubmission, TxReceipt, VerificationRecord,
};
use corridor::pipeline::{DeliveryOutcome, Orchestrator, OrchestratorConfig, Stage};
use corridor::types::{
    AidClass, AidRequest, FulfillerClass, PoolStats, RequestStatus, Urgency,
};

// ============================================================================
// Fakes
// ============================================================================

/// Recording ledger fake that enforces the status transition graph
struct FakeLedger {
    status: Mutex<HashMap<u64, RequestStatus>>,
    writes: Mutex<Vec<String>>,
    escrow: Mutex<HashMap<u64, u64>>,
    assignments: Mutex<HashMap<u64, FulfillerAssignment>>,
    fail_first_verification: AtomicBool,
    verification_attempts: AtomicU32,
}

impl FakeLedger {
    fn new() -> Arc<Self> {
        let status = HashMap::from([(1u64, RequestStatus::Submitted)]);
        Arc::new(Self {
            status: Mutex::new(status),
            writes: Mutex::new(Vec::new()),
            escrow: Mutex::new(HashMap::new()),
            assignments: Mutex::new(HashMap::new()),
            fail_first_verification: AtomicBool::new(false),
            verification_attempts: AtomicU32::new(0),
        })
    }

    fn transition(&self, id: u64, next: RequestStatus) {
        let mut map = self.status.lock().unwrap();
        let current = map.get(&id).copied().unwrap_or(RequestStatus::Submitted);
        assert!(
            current.can_transition_to(next),
            "illegal ledger transition {:?} -> {:?}",
            current,
            next
        );
        map.insert(id, next);
    }

    /// Place a request directly into a mid-flight state, as a previous
    /// process would have left it
    fn seed_status(&self, id: u64, status: RequestStatus) {
        self.status.lock().unwrap().insert(id, status);
    }

    fn seed_assignment(&self, id: u64, fulfiller: &str, escrow_amount: u64) {
        self.assignments.lock().unwrap().insert(
            id,
            FulfillerAssignment {
                fulfiller: fulfiller.to_string(),
                escrow_amount,
            },
        );
    }

    fn record(&self, method: &str) -> TxReceipt {
        self.writes.lock().unwrap().push(method.to_string());
        TxReceipt {
            tx_hash: format!("0x{:064x}", self.writes.lock().unwrap().len()),
            block: 100,
        }
    }

    fn status_of(&self, id: u64) -> RequestStatus {
        *self.status.lock().unwrap().get(&id).unwrap()
    }

    fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn get_request(&self, id: u64) -> Result<AidRequest, LedgerError> {
        let status = self
            .status
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .ok_or_else(|| LedgerError::Rpc("request not found".into()))?;
        Ok(AidRequest {
            id,
            requester: "ab".repeat(32),
            aid_class: AidClass::Medical,
            urgency: Urgency::High,
            lat_e7: -170_523_000,
            lng_e7: 368_714_000,
            details_digest: "00".repeat(32),
            status,
            created_at: 0,
        })
    }

    async fn get_user_requests(&self, _address: &str) -> Result<Vec<u64>, LedgerError> {
        Ok(self.status.lock().unwrap().keys().copied().collect())
    }

    async fn get_request_count(&self) -> Result<u64, LedgerError> {
        Ok(self.status.lock().unwrap().len() as u64)
    }

    async fn is_identity_verified(&self, _address: &str) -> Result<bool, LedgerError> {
        Ok(true)
    }

    async fn get_pool_stats(&self) -> Result<PoolStats, LedgerError> {
        Ok(PoolStats::default())
    }

    async fn get_approved_fulfillers(&self) -> Result<Vec<FulfillerInfo>, LedgerError> {
        Ok(vec![
            FulfillerInfo {
                address: "fa".repeat(32),
                name: "skydrop".into(),
                class: FulfillerClass::Aerial,
                endpoint: "http://skydrop.example".into(),
            },
            FulfillerInfo {
                address: "fb".repeat(32),
                name: "groundteam".into(),
                class: FulfillerClass::Human,
                endpoint: "http://groundteam.example".into(),
            },
        ])
    }

    async fn submit_request(&self, _s: &RequestSubmission) -> Result<u64, LedgerError> {
        Ok(1)
    }

    async fn submit_verification(
        &self,
        request_id: u64,
        _record: &VerificationRecord,
    ) -> Result<TxReceipt, LedgerError> {
        // Mirrors the RPC adapter: transient faults retry with the same
        // envelope, so a retried write lands exactly once.
        with_write_backoff("submit_verification", || {
            let attempt = self.verification_attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 && self.fail_first_verification.load(Ordering::SeqCst) {
                    return Err(LedgerError::Transient("rpc timeout".into()));
                }
                Ok(())
            }
        })
        .await?;
        self.transition(request_id, RequestStatus::Verified);
        Ok(self.record("submit_verification"))
    }

    async fn submit_consensus(
        &self,
        request_id: u64,
        submission: &ConsensusSubmission,
    ) -> Result<TxReceipt, LedgerError> {
        if submission.approved {
            self.transition(request_id, RequestStatus::Approved);
        } else {
            self.transition(request_id, RequestStatus::Rejected);
        }
        Ok(self.record("submit_consensus"))
    }

    async fn get_fulfiller_assignment(
        &self,
        request_id: u64,
    ) -> Result<Option<FulfillerAssignment>, LedgerError> {
        Ok(self.assignments.lock().unwrap().get(&request_id).cloned())
    }

    async fn assign_fulfiller(
        &self,
        request_id: u64,
        fulfiller: &str,
        escrow_amount: u64,
    ) -> Result<TxReceipt, LedgerError> {
        self.transition(request_id, RequestStatus::Funded);
        self.escrow.lock().unwrap().insert(request_id, escrow_amount);
        self.seed_assignment(request_id, fulfiller, escrow_amount);
        Ok(self.record("assign_fulfiller"))
    }

    async fn verify_delivery(
        &self,
        request_id: u64,
        verified: bool,
        _verification_hash: &str,
    ) -> Result<TxReceipt, LedgerError> {
        // The fulfiller may already have anchored the proof
        // (DeliverySubmitted); only a funded request still needs that step.
        let current = self.status_of(request_id);
        if current == RequestStatus::Funded {
            self.transition(request_id, RequestStatus::DeliverySubmitted);
        }
        self.transition(
            request_id,
            if verified {
                RequestStatus::DeliveryVerified
            } else {
                RequestStatus::DeliveryFailed
            },
        );
        Ok(self.record("verify_delivery"))
    }

    async fn release_payout(&self, request_id: u64) -> Result<TxReceipt, LedgerError> {
        self.transition(request_id, RequestStatus::Settled);
        Ok(self.record("release_payout"))
    }

    async fn timeout_request(&self, request_id: u64) -> Result<TxReceipt, LedgerError> {
        self.transition(request_id, RequestStatus::TimedOut);
        Ok(self.record("timeout_request"))
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        Ok(100)
    }

    async fn get_events(&self, _f: u64, _t: u64) -> Result<Vec<LedgerEvent>, LedgerError> {
        Ok(vec![])
    }

    fn writes_enabled(&self) -> bool {
        true
    }
}

/// GNSS upstream returning one fixed snapshot
struct FixedSignalSource(SignalSnapshot);

#[async_trait]
impl SignalSource for FixedSignalSource {
    async fn snapshot(&self, _claim: &LocationClaim) -> Result<SignalSnapshot, String> {
        Ok(self.0.clone())
    }
}

/// Disaster provider returning a fixed event list
struct FixedProvider {
    name: String,
    events: Vec<ProviderEvent>,
}

#[async_trait]
impl EventProvider for FixedProvider {
    fn name(&self) -> &str {
        &self.name
    }
    async fn query(
        &self,
        _lat: f64,
        _lng: f64,
        _radius_km: f64,
    ) -> Result<Vec<ProviderEvent>, String> {
        Ok(self.events.clone())
    }
}

/// Scripted LLM transport: node id -> canned completion
struct ScriptedTransport {
    responses: HashMap<String, String>,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl VerdictTransport for ScriptedTransport {
    async fn complete(
        &self,
        endpoint: &LlmEndpointConfig,
        _prompt: &str,
    ) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .get(&endpoint.id)
            .cloned()
            .ok_or_else(|| "connection refused".to_string())
    }
}

/// Fulfiller fake: selection via the real ledger registry read, dispatch
/// always succeeds and records the deliverable reference it was handed
struct FakeFulfillment {
    ledger: Arc<FakeLedger>,
    dispatches: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Fulfillment for FakeFulfillment {
    async fn select(&self, class: FulfillerClass) -> corridor::Result<FulfillerInfo> {
        self.ledger
            .get_approved_fulfillers()
            .await
            .map_err(corridor::CorridorError::from)?
            .into_iter()
            .find(|f| f.class == class)
            .ok_or_else(|| corridor::CorridorError::Upstream("no fulfiller".into()))
    }

    async fn dispatch(
        &self,
        fulfiller: &FulfillerInfo,
        order: &DispatchOrder,
    ) -> corridor::Result<DispatchResult> {
        assert!(order.reference.starts_with("aidchain-"));
        self.dispatches.lock().unwrap().push(order.reference.clone());
        Ok(DispatchResult {
            dispatch_id: "disp-1".into(),
            fulfiller_address: fulfiller.address.clone(),
            fulfiller_name: fulfiller.name.clone(),
            eta_minutes: 25,
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

fn healthy_snapshot() -> SignalSnapshot {
    SignalSnapshot {
        satellites: vec![
            sat("G02", 44.1, 62.0),
            sat("G05", 41.3, 48.0),
            sat("G12", 46.8, 71.0),
            sat("E03", 39.2, 22.0),
            sat("E11", 43.0, 35.0),
        ],
        nav_chain_valid: true,
        fix: PositionFix {
            lat: -17.0523,
            lng: 36.8714,
            accuracy_m: 3.2,
        },
        atomic_time_unix: 1_760_000_000,
        auth_key_id: "osnma-k41".into(),
    }
}

fn sat(sv: &str, cn0: f64, elevation: f64) -> SatelliteObservation {
    SatelliteObservation {
        sv_id: sv.into(),
        cn0_dbhz: cn0,
        elevation_deg: elevation,
        nav_auth_ok: true,
    }
}

fn critical_flood() -> ProviderEvent {
    ProviderEvent {
        id: "fl-2071".into(),
        class: "flood".into(),
        severity: Severity::Critical,
        region: "Zambezia".into(),
        lat: -17.05,
        lng: 36.87,
        radius_km: 80.0,
        active: true,
        updated_at: 1_760_000_000,
    }
}

fn verdict(approved: bool, cost: u64) -> String {
    format!(
        r#"{{"approved": {}, "reason": "flood corroborated", "recommended_aid": 0, "fulfiller_type": 0, "estimated_cost": {}, "confidence": 85, "priority_score": 9}}"#,
        approved, cost
    )
}

fn request() -> AidRequest {
    AidRequest {
        id: 1,
        requester: "ab".repeat(32),
        aid_class: AidClass::Medical,
        urgency: Urgency::High,
        lat_e7: -170_523_000,
        lng_e7: 368_714_000,
        details_digest: "11".repeat(32),
        status: RequestStatus::Submitted,
        created_at: 1_760_000_000,
    }
}

fn claim() -> LocationClaim {
    LocationClaim {
        lat: -17.0523,
        lng: 36.8714,
        device_id: "dev-1".into(),
        raw_signal_bundle: "c2lnbmFs".into(),
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    ledger: Arc<FakeLedger>,
    bus: Arc<EventBus>,
    transport_calls: Arc<AtomicU32>,
    dispatches: Arc<Mutex<Vec<String>>>,
    _shutdown_tx: watch::Sender<bool>,
}

fn build(
    snapshot: SignalSnapshot,
    providers: Vec<(&str, Vec<ProviderEvent>)>,
    verdicts: Vec<String>,
) -> Harness {
    let ledger = FakeLedger::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gnss = Arc::new(GnssAuthenticator::new(
        Arc::new(FixedSignalSource(snapshot)),
        Duration::from_secs(15),
    ));

    let providers: Vec<Arc<dyn EventProvider>> = providers
        .into_iter()
        .map(|(name, events)| {
            Arc::new(FixedProvider {
                name: name.to_string(),
                events,
            }) as Arc<dyn EventProvider>
        })
        .collect();
    let attestation = Arc::new(AttestationEngine::new(providers, Duration::from_secs(10)));

    let transport_calls = Arc::new(AtomicU32::new(0));
    let endpoints: Vec<LlmEndpointConfig> = (0..verdicts.len())
        .map(|i| LlmEndpointConfig {
            id: format!("n{}", i),
            model: format!("model-{}", i),
            url: "http://panel.example".into(),
            api_key: None,
        })
        .collect();
    let responses = verdicts
        .into_iter()
        .enumerate()
        .map(|(i, v)| (format!("n{}", i), v))
        .collect();
    let consensus = Arc::new(ConsensusEngine::new(
        endpoints,
        Arc::new(ScriptedTransport {
            responses,
            calls: Arc::clone(&transport_calls),
        }),
        Duration::from_secs(30),
    ));

    let bus = Arc::new(EventBus::new());
    let dispatches = Arc::new(Mutex::new(Vec::new()));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&ledger) as Arc<dyn Ledger>,
        gnss,
        attestation,
        consensus,
        Arc::new(FakeFulfillment {
            ledger: Arc::clone(&ledger),
            dispatches: Arc::clone(&dispatches),
        }),
        Arc::new(AcceptAllOfficers),
        Arc::clone(&bus),
        OrchestratorConfig {
            delivery_timeout: Duration::from_secs(24 * 3600),
            delivery_radius_m: 30.0,
            event_search_radius_km: 100.0,
        },
        shutdown_rx,
    ));

    Harness {
        orchestrator,
        ledger,
        bus,
        transport_calls,
        dispatches,
        _shutdown_tx: shutdown_tx,
    }
}

fn five_approvals() -> Vec<String> {
    [120u64, 140, 150, 160, 200]
        .iter()
        .map(|&c| verdict(true, c))
        .collect()
}

/// Drain bus events until a terminal (failed/shutdown/settlement-completed)
/// event arrives or the drain times out.
async fn collect_until_terminal(
    rx: &mut tokio::sync::mpsc::Receiver<PipelineEvent>,
) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(30), rx.recv()).await;
        match next {
            Ok(Some(event)) => {
                let terminal = event.status == EventStatus::Failed
                    || event.status == EventStatus::Shutdown
                    || (event.stage == Stage::Settlement
                        && event.status == EventStatus::Completed);
                events.push(event);
                if terminal {
                    return events;
                }
            }
            _ => return events,
        }
    }
}

/// Wait until the pipeline record reports the given stage
async fn wait_for_stage(harness: &Harness, id: u64, stage: Stage) {
    for _ in 0..2000 {
        if let Some(record) = harness.orchestrator.registry().get(id) {
            if record.snapshot().current_stage == stage {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pipeline {} never reached {:?}", id, stage);
}

fn good_drop() -> DeliveryProof {
    DeliveryProof::Aerial {
        // (-17.05231, 36.87138), about 2 m from the target
        drop_lat_e7: -170_523_100,
        drop_lng_e7: 368_713_800,
        payload_image_digest: "aa".repeat(32),
        drone_id: "drone-7".into(),
        timestamp: 1_760_001_000,
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn happy_aerial_path_settles_with_median_escrow() {
    let harness = build(
        healthy_snapshot(),
        vec![
            ("gdacs", vec![critical_flood()]),
            ("reliefweb", vec![critical_flood()]),
        ],
        five_approvals(),
    );
    let (_sub, mut rx) = harness.bus.subscribe(Some(1)).await;

    harness.orchestrator.start_pipeline(request(), claim()).unwrap();
    wait_for_stage(&harness, 1, Stage::AwaitingDelivery).await;

    let record = harness.orchestrator.registry().get(1).unwrap();
    let outcome_rx = record.offer_proof(good_drop()).unwrap();
    assert_eq!(outcome_rx.await.unwrap(), DeliveryOutcome::Settled);

    // Ledger effects
    assert_eq!(harness.ledger.status_of(1), RequestStatus::Settled);
    assert_eq!(harness.ledger.escrow.lock().unwrap()[&1], 150, "escrow = median cost");
    assert_eq!(
        harness.ledger.writes(),
        vec![
            "submit_verification",
            "submit_consensus",
            "assign_fulfiller",
            "verify_delivery",
            "release_payout",
        ]
    );

    // The record is destroyed on terminal status
    assert!(harness.orchestrator.registry().get(1).is_none());

    // The subscriber saw the full progression, ending in settlement
    let events = collect_until_terminal(&mut rx).await;
    let last = events.last().unwrap();
    assert_eq!(last.stage, Stage::Settlement);
    assert_eq!(last.status, EventStatus::Completed);
    assert!(events
        .iter()
        .any(|e| e.stage == Stage::Consensus && e.status == EventStatus::Completed));
}

#[tokio::test]
async fn spoofed_gnss_terminates_with_no_ledger_writes() {
    let mut snapshot = healthy_snapshot();
    // Uniform carrier-to-noise: dispersion collapses below the floor
    for s in snapshot.satellites.iter_mut() {
        s.cn0_dbhz = 45.0;
    }
    snapshot.satellites[0].cn0_dbhz = 45.1;

    let harness = build(
        snapshot,
        vec![("gdacs", vec![critical_flood()])],
        five_approvals(),
    );
    let (_sub, mut rx) = harness.bus.subscribe(Some(1)).await;

    harness.orchestrator.start_pipeline(request(), claim()).unwrap();
    let events = collect_until_terminal(&mut rx).await;

    let last = events.last().unwrap();
    assert_eq!(last.stage, Stage::GnssVerify);
    assert_eq!(last.status, EventStatus::Failed);
    assert!(last.message.contains("spoofing"));

    // No on-ledger writes after the initial submission
    assert!(harness.ledger.writes().is_empty());
    assert_eq!(harness.ledger.status_of(1), RequestStatus::Submitted);
    assert!(harness.orchestrator.registry().get(1).is_none());
}

#[tokio::test]
async fn no_matching_event_stops_before_consensus() {
    let harness = build(
        healthy_snapshot(),
        // Providers answer, but with nothing inside 100 km
        vec![("gdacs", vec![]), ("reliefweb", vec![])],
        five_approvals(),
    );
    let (_sub, mut rx) = harness.bus.subscribe(Some(1)).await;

    harness.orchestrator.start_pipeline(request(), claim()).unwrap();
    let events = collect_until_terminal(&mut rx).await;

    let last = events.last().unwrap();
    assert_eq!(last.stage, Stage::EventVerify);
    assert_eq!(last.status, EventStatus::Failed);

    // The panel was never consulted and nothing was written
    assert_eq!(harness.transport_calls.load(Ordering::SeqCst), 0);
    assert!(harness.ledger.writes().is_empty());
}

#[tokio::test]
async fn split_panel_rejects_on_ledger() {
    // 3 approve, 2 reject: 9 > 10 fails the strict two-thirds test
    let verdicts = vec![
        verdict(true, 120),
        verdict(true, 140),
        verdict(true, 150),
        verdict(false, 0),
        verdict(false, 0),
    ];
    let harness = build(
        healthy_snapshot(),
        vec![("gdacs", vec![critical_flood()])],
        verdicts,
    );
    let (_sub, mut rx) = harness.bus.subscribe(Some(1)).await;

    harness.orchestrator.start_pipeline(request(), claim()).unwrap();
    let events = collect_until_terminal(&mut rx).await;

    let last = events.last().unwrap();
    assert_eq!(last.stage, Stage::Consensus);
    assert_eq!(last.status, EventStatus::Failed);

    // The rejection itself is recorded on-ledger
    assert_eq!(
        harness.ledger.writes(),
        vec!["submit_verification", "submit_consensus"]
    );
    assert_eq!(harness.ledger.status_of(1), RequestStatus::Rejected);
    assert!(harness.orchestrator.registry().get(1).is_none());
}

#[tokio::test]
async fn out_of_tolerance_drop_fails_delivery() {
    let harness = build(
        healthy_snapshot(),
        vec![("gdacs", vec![critical_flood()])],
        five_approvals(),
    );

    harness.orchestrator.start_pipeline(request(), claim()).unwrap();
    wait_for_stage(&harness, 1, Stage::AwaitingDelivery).await;

    // Drop at (-17.0530, 36.8720): ~95 m from the target
    let proof = DeliveryProof::Aerial {
        drop_lat_e7: -170_530_000,
        drop_lng_e7: 368_720_000,
        payload_image_digest: "aa".repeat(32),
        drone_id: "drone-7".into(),
        timestamp: 1_760_001_000,
    };
    let record = harness.orchestrator.registry().get(1).unwrap();
    let outcome = record.offer_proof(proof).unwrap().await.unwrap();

    match outcome {
        DeliveryOutcome::Failed(reason) => assert!(reason.contains("tolerance")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(harness.ledger.status_of(1), RequestStatus::DeliveryFailed);
    assert!(harness.ledger.writes().contains(&"verify_delivery".to_string()));
    assert!(!harness.ledger.writes().contains(&"release_payout".to_string()));
}

#[tokio::test(start_paused = true)]
async fn transient_ledger_fault_retries_without_duplicate_write() {
    let harness = build(
        healthy_snapshot(),
        vec![("gdacs", vec![critical_flood()])],
        five_approvals(),
    );
    harness
        .ledger
        .fail_first_verification
        .store(true, Ordering::SeqCst);

    harness.orchestrator.start_pipeline(request(), claim()).unwrap();
    wait_for_stage(&harness, 1, Stage::AwaitingDelivery).await;

    // Two attempts, one on-ledger write
    assert_eq!(harness.ledger.verification_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(
        harness
            .ledger
            .writes()
            .iter()
            .filter(|w| *w == "submit_verification")
            .count(),
        1
    );
    assert_eq!(harness.ledger.status_of(1), RequestStatus::Funded);
}

#[tokio::test(start_paused = true)]
async fn delivery_window_expiry_times_out_on_ledger() {
    let harness = build(
        healthy_snapshot(),
        vec![("gdacs", vec![critical_flood()])],
        five_approvals(),
    );
    let (_sub, mut rx) = harness.bus.subscribe(Some(1)).await;

    harness.orchestrator.start_pipeline(request(), claim()).unwrap();
    wait_for_stage(&harness, 1, Stage::AwaitingDelivery).await;

    // No proof ever arrives; paused time fast-forwards the 24 h window.
    // The drain deadline sits beyond the delivery window so the window's
    // timer is the next one the paused clock jumps to.
    let mut last = None;
    loop {
        match tokio::time::timeout(Duration::from_secs(48 * 3600), rx.recv()).await {
            Ok(Some(event)) => {
                let done = event.status == EventStatus::Failed;
                last = Some(event);
                if done {
                    break;
                }
            }
            _ => break,
        }
    }
    let last = last.expect("no events observed");
    assert_eq!(last.stage, Stage::AwaitingDelivery);
    assert_eq!(last.status, EventStatus::Failed);

    assert_eq!(harness.ledger.status_of(1), RequestStatus::TimedOut);
    assert!(harness.ledger.writes().contains(&"timeout_request".to_string()));
    assert!(harness.orchestrator.registry().get(1).is_none());
}

#[tokio::test]
async fn duplicate_delivery_proof_is_rejected() {
    let harness = build(
        healthy_snapshot(),
        vec![("gdacs", vec![critical_flood()])],
        five_approvals(),
    );

    harness.orchestrator.start_pipeline(request(), claim()).unwrap();
    wait_for_stage(&harness, 1, Stage::AwaitingDelivery).await;

    let record = harness.orchestrator.registry().get(1).unwrap();
    let outcome_rx = record.offer_proof(good_drop()).unwrap();

    // The second identical proof does not reach the pipeline
    let err = record.offer_proof(good_drop()).unwrap_err();
    assert!(err.contains("already submitted"));

    assert_eq!(outcome_rx.await.unwrap(), DeliveryOutcome::Settled);
    assert_eq!(
        harness
            .ledger
            .writes()
            .iter()
            .filter(|w| *w == "release_payout")
            .count(),
        1
    );
}

#[tokio::test]
async fn resume_funded_redispatches_then_settles() {
    let harness = build(
        healthy_snapshot(),
        vec![("gdacs", vec![critical_flood()])],
        five_approvals(),
    );
    // The previous process crashed after the escrow binding confirmed; the
    // assignment is on-ledger, the dispatch may never have gone out.
    harness.ledger.seed_status(1, RequestStatus::Funded);
    harness.ledger.seed_assignment(1, &"fa".repeat(32), 150);

    harness.orchestrator.resume_active().await;
    wait_for_stage(&harness, 1, Stage::AwaitingDelivery).await;

    // The fulfiller was (re-)notified with the deterministic reference
    assert_eq!(
        harness.dispatches.lock().unwrap().as_slice(),
        &["aidchain-1".to_string()]
    );

    let record = harness.orchestrator.registry().get(1).unwrap();
    let outcome = record.offer_proof(good_drop()).unwrap().await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::Settled);
    assert_eq!(harness.ledger.status_of(1), RequestStatus::Settled);
    assert_eq!(harness.ledger.writes(), vec!["verify_delivery", "release_payout"]);
}

#[tokio::test]
async fn resume_funded_without_assignment_still_rearms_window() {
    let harness = build(
        healthy_snapshot(),
        vec![("gdacs", vec![critical_flood()])],
        five_approvals(),
    );
    // Funded but the assignment read comes back empty: the re-dispatch
    // fails, the delivery window must still protect the request.
    harness.ledger.seed_status(1, RequestStatus::Funded);

    harness.orchestrator.resume_active().await;
    wait_for_stage(&harness, 1, Stage::AwaitingDelivery).await;

    assert!(harness.dispatches.lock().unwrap().is_empty());

    let record = harness.orchestrator.registry().get(1).unwrap();
    let outcome = record.offer_proof(good_drop()).unwrap().await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::Settled);
}

#[tokio::test]
async fn resume_delivery_submitted_rearms_without_redispatch() {
    let harness = build(
        healthy_snapshot(),
        vec![("gdacs", vec![critical_flood()])],
        five_approvals(),
    );
    // The fulfiller already anchored its proof on-ledger; verification
    // died with the previous process.
    harness.ledger.seed_status(1, RequestStatus::DeliverySubmitted);

    harness.orchestrator.resume_active().await;
    wait_for_stage(&harness, 1, Stage::AwaitingDelivery).await;

    // The delivery already happened: no second dispatch goes out
    assert!(harness.dispatches.lock().unwrap().is_empty());

    // The fulfiller re-submits its proof and the pipeline settles
    let record = harness.orchestrator.registry().get(1).unwrap();
    let outcome = record.offer_proof(good_drop()).unwrap().await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::Settled);
    assert_eq!(harness.ledger.status_of(1), RequestStatus::Settled);
    assert_eq!(harness.ledger.writes(), vec!["verify_delivery", "release_payout"]);
}
