//! Aid request submission and query routes

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::{authenticate, error_response, internal_error, json_response};
use crate::digest::sha256_hex;
use crate::geo;
use crate::gnss::LocationClaim;
use crate::ledger::RequestSubmission;
use crate::server::AppState;
use crate::types::{AidClass, AidRequest, Urgency};

/// POST /api/requests body
#[derive(Debug, Deserialize)]
pub struct SubmitRequestBody {
    /// Aid class, wire encoding 0-5
    pub aid_type: u8,
    /// Urgency, wire encoding 0-2
    pub urgency: u8,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub details: Option<String>,
    /// Raw GNSS signal bundle captured by the device, base64
    pub gnss_data: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Serialize)]
struct SubmitResponse {
    request_id: u64,
    status: &'static str,
    pipeline_url: String,
}

/// Wire view of an aid request: degrees at the surface, integers on-ledger
#[derive(Serialize)]
struct RequestView {
    id: u64,
    requester: String,
    aid_type: u8,
    aid_class: AidClass,
    urgency: Urgency,
    lat: f64,
    lng: f64,
    details_digest: String,
    status: crate::types::RequestStatus,
    created_at: i64,
}

impl From<AidRequest> for RequestView {
    fn from(r: AidRequest) -> Self {
        Self {
            id: r.id,
            requester: r.requester,
            aid_type: r.aid_class.to_wire(),
            aid_class: r.aid_class,
            urgency: r.urgency,
            lat: geo::from_e7(r.lat_e7),
            lng: geo::from_e7(r.lng_e7),
            details_digest: r.details_digest,
            status: r.status,
            created_at: r.created_at,
        }
    }
}

/// POST /api/requests - validate, anchor on-ledger, start the pipeline
pub async fn handle_submit(
    state: &std::sync::Arc<AppState>,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response<Full<Bytes>> {
    let claims = match authenticate(state, headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let body: SubmitRequestBody = match serde_json::from_slice(body) {
        Ok(b) => b,
        Err(e) => {
            let details = e.to_string();
            return error_response(
                StatusCode::BAD_REQUEST,
                "malformed request body",
                state.args.dev_mode.then_some(details.as_str()),
            );
        }
    };

    let Some(aid_class) = AidClass::from_wire(body.aid_type) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid aid_type", None);
    };
    let Some(urgency) = Urgency::from_wire(body.urgency) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid urgency", None);
    };
    if !geo::is_valid_coordinate(body.lat, body.lng) {
        return error_response(StatusCode::BAD_REQUEST, "invalid coordinates", None);
    }
    if body.gnss_data.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "gnss_data is required", None);
    }

    // The token's verified flag is advisory; the registry gates the write.
    match state.ledger.is_identity_verified(&claims.sub).await {
        Ok(true) => {}
        Ok(false) => {
            if !state.args.dev_mode {
                return error_response(StatusCode::UNAUTHORIZED, "identity not verified", None);
            }
        }
        Err(e) => return internal_error(state, "identity check failed", e),
    }

    let submission = RequestSubmission {
        requester: claims.sub.clone(),
        aid_class: aid_class.to_wire(),
        urgency: urgency.to_wire(),
        lat_e7: geo::to_e7(body.lat),
        lng_e7: geo::to_e7(body.lng),
        details_digest: sha256_hex(body.details.as_deref().unwrap_or_default().as_bytes()),
    };

    let request_id = match state.ledger.submit_request(&submission).await {
        Ok(id) => id,
        Err(e) => return internal_error(state, "ledger submission failed", e),
    };

    let request = AidRequest {
        id: request_id,
        requester: submission.requester.clone(),
        aid_class,
        urgency,
        lat_e7: submission.lat_e7,
        lng_e7: submission.lng_e7,
        details_digest: submission.details_digest.clone(),
        status: crate::types::RequestStatus::Submitted,
        created_at: chrono::Utc::now().timestamp(),
    };
    let claim = LocationClaim {
        lat: body.lat,
        lng: body.lng,
        device_id: body.device_id.unwrap_or_else(|| "unknown".to_string()),
        raw_signal_bundle: body.gnss_data,
    };

    if let Err(e) = state.orchestrator.start_pipeline(request, claim) {
        return internal_error(state, "pipeline start failed", e);
    }

    json_response(
        StatusCode::ACCEPTED,
        &SubmitResponse {
            request_id,
            status: "pipeline_started",
            pipeline_url: format!(
                "{}/api/requests/{}/pipeline",
                state.args.public_url, request_id
            ),
        },
    )
}

/// GET /api/requests/{id}
pub async fn handle_get_request(
    state: &std::sync::Arc<AppState>,
    id: u64,
) -> Response<Full<Bytes>> {
    match state.ledger.get_request(id).await {
        Ok(request) => json_response(StatusCode::OK, &RequestView::from(request)),
        Err(e) => {
            let message = e.to_string();
            if message.contains("not found") {
                error_response(StatusCode::NOT_FOUND, "request not found", None)
            } else {
                internal_error(state, "request lookup failed", message)
            }
        }
    }
}

/// GET /api/requests/user/{addr}
pub async fn handle_user_requests(
    state: &std::sync::Arc<AppState>,
    address: &str,
) -> Response<Full<Bytes>> {
    match state.ledger.get_user_requests(address).await {
        Ok(request_ids) => json_response(
            StatusCode::OK,
            &serde_json::json!({ "address": address, "request_ids": request_ids }),
        ),
        Err(e) => internal_error(state, "user request lookup failed", e),
    }
}

/// GET /api/requests/{id}/pipeline
pub fn handle_pipeline_status(state: &std::sync::Arc<AppState>, id: u64) -> Response<Full<Bytes>> {
    match state.orchestrator.registry().get(id) {
        Some(record) => json_response(StatusCode::OK, &record.snapshot()),
        None => json_response(StatusCode::OK, &serde_json::json!({ "status": "not_active" })),
    }
}

/// GET /api/pipeline/active
pub fn handle_active(state: &std::sync::Arc<AppState>) -> Response<Full<Bytes>> {
    #[derive(Serialize)]
    struct ActiveEntry {
        request_id: u64,
        current_stage: crate::pipeline::Stage,
        elapsed_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    }

    let entries: Vec<ActiveEntry> = state
        .orchestrator
        .registry()
        .active_snapshots()
        .into_iter()
        .map(|s| ActiveEntry {
            request_id: s.request_id,
            current_stage: s.current_stage,
            elapsed_ms: s.elapsed_ms,
            error: s.error,
        })
        .collect();

    json_response(StatusCode::OK, &entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_body_parsing() {
        let json = r#"{
            "aid_type": 0,
            "urgency": 1,
            "lat": -17.0523,
            "lng": 36.8714,
            "gnss_data": "c2lnbmFs",
            "device_id": "dev-1"
        }"#;
        let body: SubmitRequestBody = serde_json::from_str(json).unwrap();
        assert_eq!(body.aid_type, 0);
        assert!(body.details.is_none());
    }

    #[test]
    fn test_request_view_converts_coordinates() {
        let view = RequestView::from(AidRequest {
            id: 3,
            requester: "ab".repeat(32),
            aid_class: AidClass::Medical,
            urgency: Urgency::High,
            lat_e7: -170_523_000,
            lng_e7: 368_714_000,
            details_digest: "00".repeat(32),
            status: crate::types::RequestStatus::Submitted,
            created_at: 0,
        });
        assert!((view.lat + 17.0523).abs() < 1e-9);
        assert_eq!(view.aid_type, 0);
    }
}
