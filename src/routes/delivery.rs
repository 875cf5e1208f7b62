//! Delivery confirmation route
//!
//! The submitter blocks on the pipeline's receipt/settlement tail: a 200
//! means the escrow was released, a 400 carries the verification or state
//! failure. Duplicate submissions get a clear state error - the first proof
//! wins.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::{Response, StatusCode};
use serde::Deserialize;

use super::{authenticate, error_response, internal_error, json_response};
use crate::fulfiller::DeliveryProof;
use crate::geo;
use crate::pipeline::DeliveryOutcome;
use crate::server::AppState;

/// POST /api/delivery/confirm body; coordinates in decimal degrees
#[derive(Debug, Deserialize)]
pub struct DeliveryConfirmBody {
    pub request_id: u64,
    #[serde(flatten)]
    pub proof: DeliveryProofWire,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "delivery_class", rename_all = "snake_case")]
pub enum DeliveryProofWire {
    Aerial {
        drop_lat: f64,
        drop_lng: f64,
        payload_image_digest: String,
        drone_id: String,
    },
    Human {
        officer_id: String,
        signature: String,
    },
}

impl DeliveryProofWire {
    pub fn into_proof(self) -> DeliveryProof {
        let timestamp = chrono::Utc::now().timestamp();
        match self {
            Self::Aerial {
                drop_lat,
                drop_lng,
                payload_image_digest,
                drone_id,
            } => DeliveryProof::Aerial {
                drop_lat_e7: geo::to_e7(drop_lat),
                drop_lng_e7: geo::to_e7(drop_lng),
                payload_image_digest,
                drone_id,
                timestamp,
            },
            Self::Human {
                officer_id,
                signature,
            } => DeliveryProof::Human {
                officer_id,
                signature,
                timestamp,
            },
        }
    }
}

fn failed_response(reason: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::BAD_REQUEST,
        &serde_json::json!({ "status": "failed", "reason": reason }),
    )
}

/// POST /api/delivery/confirm
pub async fn handle_confirm(
    state: &std::sync::Arc<AppState>,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response<Full<Bytes>> {
    let claims = match authenticate(state, headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let body: DeliveryConfirmBody = match serde_json::from_slice(body) {
        Ok(b) => b,
        Err(e) => {
            let details = e.to_string();
            return error_response(
                StatusCode::BAD_REQUEST,
                "malformed delivery proof",
                state.args.dev_mode.then_some(details.as_str()),
            );
        }
    };

    // Registry gate, same rule as submission
    match state.ledger.is_identity_verified(&claims.sub).await {
        Ok(true) => {}
        Ok(false) => {
            if !state.args.dev_mode {
                return error_response(StatusCode::UNAUTHORIZED, "identity not verified", None);
            }
        }
        Err(e) => return internal_error(state, "identity check failed", e),
    }

    let Some(record) = state.orchestrator.registry().get(body.request_id) else {
        return failed_response("request is not awaiting delivery");
    };

    let outcome_rx = match record.offer_proof(body.proof.into_proof()) {
        Ok(rx) => rx,
        Err(reason) => return failed_response(&reason),
    };

    match outcome_rx.await {
        Ok(DeliveryOutcome::Settled) => {
            json_response(StatusCode::OK, &serde_json::json!({ "status": "settled" }))
        }
        Ok(DeliveryOutcome::Failed(reason)) => failed_response(&reason),
        Err(_) => internal_error(state, "pipeline dropped the delivery", "outcome channel closed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aerial_body_parsing() {
        let json = r#"{
            "request_id": 9,
            "delivery_class": "aerial",
            "drop_lat": -17.05231,
            "drop_lng": 36.87138,
            "payload_image_digest": "ab12",
            "drone_id": "drone-7"
        }"#;
        let body: DeliveryConfirmBody = serde_json::from_str(json).unwrap();
        assert_eq!(body.request_id, 9);
        let proof = body.proof.into_proof();
        match proof {
            DeliveryProof::Aerial { drop_lat_e7, .. } => {
                assert_eq!(drop_lat_e7, -170_523_100);
            }
            _ => panic!("expected aerial proof"),
        }
    }

    #[test]
    fn test_human_body_parsing() {
        let json = r#"{
            "request_id": 9,
            "delivery_class": "human",
            "officer_id": "off-3",
            "signature": "c2ln"
        }"#;
        let body: DeliveryConfirmBody = serde_json::from_str(json).unwrap();
        assert!(matches!(body.proof, DeliveryProofWire::Human { .. }));
    }

    #[test]
    fn test_unknown_class_rejected() {
        let json = r#"{"request_id": 9, "delivery_class": "submarine"}"#;
        assert!(serde_json::from_str::<DeliveryConfirmBody>(json).is_err());
    }
}
