//! Fulfiller delivery webhooks
//!
//! Providers push delivery notifications here with their shared secret.
//! The payload is provider-specific; the only hard requirements are the
//! deliverable reference (`aidchain-{id}`) and enough proof fields to build
//! a delivery proof. The webhook acknowledges immediately; verification and
//! settlement run in the pipeline task.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::{Response, StatusCode};
use tracing::{info, warn};

use super::{error_response, json_response};
use crate::fulfiller::DeliveryProof;
use crate::geo;
use crate::pipeline::DeliveryOutcome;
use crate::server::AppState;

/// Header carrying the provider shared secret
const SECRET_HEADER: &str = "x-webhook-secret";

/// POST /api/webhooks/{fulfiller}
pub async fn handle_webhook(
    state: &std::sync::Arc<AppState>,
    fulfiller: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response<Full<Bytes>> {
    let Some(expected) = state.webhook_secrets.get(fulfiller) else {
        return error_response(StatusCode::UNAUTHORIZED, "unknown fulfiller", None);
    };
    let presented = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    if presented != Some(expected.as_str()) {
        warn!(fulfiller, "Webhook with bad shared secret rejected");
        return error_response(StatusCode::UNAUTHORIZED, "invalid webhook secret", None);
    }

    let payload: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "malformed webhook payload", None),
    };

    let Some(request_id) = extract_reference(&payload) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "missing or malformed deliverable reference",
            None,
        );
    };

    let Some(proof) = extract_proof(&payload) else {
        return error_response(StatusCode::BAD_REQUEST, "no recognisable proof fields", None);
    };

    let Some(record) = state.orchestrator.registry().get(request_id) else {
        return error_response(StatusCode::BAD_REQUEST, "request is not awaiting delivery", None);
    };

    match record.offer_proof(proof) {
        Ok(outcome_rx) => {
            info!(fulfiller, request_id, "Webhook delivery proof accepted");
            // Acknowledge now; log the eventual outcome.
            tokio::spawn(async move {
                match outcome_rx.await {
                    Ok(DeliveryOutcome::Settled) => {
                        info!(request_id, "Webhook-submitted delivery settled")
                    }
                    Ok(DeliveryOutcome::Failed(reason)) => {
                        warn!(request_id, %reason, "Webhook-submitted delivery failed")
                    }
                    Err(_) => warn!(request_id, "Delivery outcome channel closed"),
                }
            });
            json_response(StatusCode::OK, &serde_json::json!({ "received": true }))
        }
        Err(reason) => error_response(StatusCode::BAD_REQUEST, &reason, None),
    }
}

/// Pull the request id out of the `aidchain-{id}` deliverable reference
fn extract_reference(payload: &serde_json::Value) -> Option<u64> {
    let reference = payload
        .get("reference")
        .or_else(|| payload.get("deliverable"))
        .and_then(|v| v.as_str())?;
    reference.strip_prefix("aidchain-")?.parse().ok()
}

/// Build a delivery proof from whatever fields the provider sent
fn extract_proof(payload: &serde_json::Value) -> Option<DeliveryProof> {
    let timestamp = payload
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| chrono::Utc::now().timestamp());

    if let (Some(lat), Some(lng)) = (
        payload.get("drop_lat").and_then(|v| v.as_f64()),
        payload.get("drop_lng").and_then(|v| v.as_f64()),
    ) {
        return Some(DeliveryProof::Aerial {
            drop_lat_e7: geo::to_e7(lat),
            drop_lng_e7: geo::to_e7(lng),
            payload_image_digest: payload
                .get("payload_image_digest")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            drone_id: payload
                .get("drone_id")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            timestamp,
        });
    }

    if let Some(officer_id) = payload.get("officer_id").and_then(|v| v.as_str()) {
        return Some(DeliveryProof::Human {
            officer_id: officer_id.to_string(),
            signature: payload
                .get("signature")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            timestamp,
        });
    }

    None
}
