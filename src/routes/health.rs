//! Liveness, readiness and version endpoints

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

use super::json_response;
use crate::server::AppState;

/// GET /health - liveness probe
pub fn health_check(state: &std::sync::Arc<AppState>) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "status": "ok",
            "node_id": state.args.node_id,
            "uptime_secs": state.started_at.elapsed().as_secs(),
            "active_pipelines": state.orchestrator.registry().len(),
        }),
    )
}

/// GET /ready - readiness: the ledger answers and writes are possible
pub async fn readiness_check(state: &std::sync::Arc<AppState>) -> Response<Full<Bytes>> {
    let ledger_ok = state.ledger.block_number().await.is_ok();
    let writes_ok = state.ledger.writes_enabled() || state.args.dev_mode;
    let ready = ledger_ok && writes_ok;

    json_response(
        if ready {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        },
        &serde_json::json!({
            "ready": ready,
            "ledger_reachable": ledger_ok,
            "writes_enabled": state.ledger.writes_enabled(),
        }),
    )
}

/// GET /version
pub fn version_info() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }),
    )
}
