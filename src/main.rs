//! Corridor - off-chain orchestrator for the AidChain protocol

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use corridor::{
    attestation::{AttestationEngine, EventProvider, HttpEventProvider},
    bus::{spawn_log_subscriber, EventBus},
    config::Args,
    consensus::{ConsensusEngine, OpenAiCompatTransport},
    fulfiller::{AcceptAllOfficers, FulfillerDispatcher},
    gnss::{GnssAuthenticator, HttpSignalSource},
    ledger::{events::PollerConfig, EventPoller, RpcLedger},
    pipeline::{Orchestrator, OrchestratorConfig},
    server,
};

/// Grace period for in-flight stages after the shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("corridor={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let providers_cfg = args.event_provider_list();
    let llm_endpoints = args
        .llm_endpoint_list()
        .expect("validated above");

    info!("======================================");
    info!("  Corridor - AidChain Orchestrator");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Ledger RPC: {}", args.ledger_rpc_url);
    info!("GNSS authenticator: {}", args.gnss_url);
    info!("Disaster providers: {}", providers_cfg.len());
    for (name, url) in &providers_cfg {
        info!("  {}: {}", name, url);
    }
    info!("LLM panel: {} endpoint(s)", llm_endpoints.len());
    for endpoint in &llm_endpoints {
        info!("  {}: {}", endpoint.id, endpoint.model);
    }
    info!("Delivery window: {} h", args.delivery_timeout_hours);
    info!("======================================");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Ledger adapter; the oracle key decides whether writes are live
    let ledger: Arc<dyn corridor::ledger::Ledger> = match RpcLedger::new(&args) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            error!("Ledger adapter init failed: {}", e);
            std::process::exit(1);
        }
    };

    // GNSS authenticator client
    let gnss_timeout = Duration::from_secs(args.gnss_timeout_secs);
    let gnss_source = match HttpSignalSource::new(args.gnss_url.clone(), gnss_timeout) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("GNSS client init failed: {}", e);
            std::process::exit(1);
        }
    };
    let gnss = Arc::new(GnssAuthenticator::new(gnss_source, gnss_timeout));

    // Disaster-data providers
    let provider_timeout = Duration::from_secs(args.provider_timeout_secs);
    let mut providers: Vec<Arc<dyn EventProvider>> = Vec::new();
    for (name, url) in providers_cfg {
        match HttpEventProvider::new(name.clone(), url, provider_timeout) {
            Ok(p) => providers.push(Arc::new(p)),
            Err(e) => {
                error!("Provider {} init failed: {}", name, e);
                std::process::exit(1);
            }
        }
    }
    let attestation = Arc::new(AttestationEngine::new(providers, provider_timeout));

    // LLM consensus panel
    let llm_timeout = Duration::from_secs(args.llm_timeout_secs);
    let transport = match OpenAiCompatTransport::new(llm_timeout) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!("LLM transport init failed: {}", e);
            std::process::exit(1);
        }
    };
    let consensus = Arc::new(ConsensusEngine::new(llm_endpoints, transport, llm_timeout));

    // Fulfiller dispatch
    let dispatcher = match FulfillerDispatcher::new(
        Arc::clone(&ledger),
        Duration::from_secs(args.dispatch_timeout_secs),
    ) {
        Ok(d) => Arc::new(d),
        Err(e) => {
            error!("Dispatcher init failed: {}", e);
            std::process::exit(1);
        }
    };

    // Event bus with the log subscriber attached
    let bus = Arc::new(EventBus::new());
    spawn_log_subscriber(Arc::clone(&bus));

    // The orchestrator wires every collaborator explicitly
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&ledger),
        gnss,
        attestation,
        consensus,
        dispatcher,
        Arc::new(AcceptAllOfficers),
        Arc::clone(&bus),
        OrchestratorConfig {
            delivery_timeout: Duration::from_secs(args.delivery_timeout_hours * 3600),
            delivery_radius_m: args.delivery_radius_m,
            event_search_radius_km: args.event_search_radius_km,
        },
        shutdown_rx.clone(),
    ));

    // Recover requests the previous process left mid-flight: funded ones
    // get an idempotent re-dispatch, then both funded and
    // delivery-submitted ones get their delivery windows re-armed
    orchestrator.resume_active().await;

    // Ledger event poller + consumer
    let poller = EventPoller::new(
        Arc::clone(&ledger),
        PollerConfig {
            interval: Duration::from_secs(args.ledger_poll_interval_secs),
            cursor_path: args.ledger_cursor_path.clone().into(),
        },
        shutdown_rx.clone(),
    );
    let (mut ledger_events, poller_handle) = poller.spawn();
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            while let Some(event) = ledger_events.recv().await {
                orchestrator.handle_ledger_event(event).await;
            }
        });
    }

    let state = Arc::new(server::AppState::new(
        args,
        Arc::clone(&ledger),
        Arc::clone(&orchestrator),
        Arc::clone(&bus),
    ));

    // Run the server until the operator signals shutdown
    let server_handle = {
        let state = Arc::clone(&state);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { server::run(state, shutdown_rx).await })
    };

    wait_for_signal().await;
    info!("Shutdown signal received");

    // Stop accepting, let in-flight stages reach their deadlines, emit the
    // final shutdown events, persist the poll cursor.
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    orchestrator.emit_shutdown_events().await;

    if let Err(e) = poller_handle.await {
        warn!("Poller task join failed: {}", e);
    }
    server_handle.abort();

    info!("Corridor stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("SIGTERM handler failed: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
