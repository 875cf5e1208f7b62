//! Delivery proof verification
//!
//! Pure over the proof inputs: no clock reads besides the stamped
//! verification time, no network. Aerial proofs must land inside the
//! configured tolerance of the request coordinate with a non-zero payload
//! image digest; human-fulfilled proofs need a non-empty officer signature
//! and an officer id accepted by the registry hook.

use tracing::debug;

use super::{DeliveryProof, DeliveryVerification};
use crate::digest::is_zero_digest;
use crate::geo;

/// Replaceable officer-registry hook for human-fulfilled deliveries.
///
/// The default accepts any non-empty id; deployments wire a registry-backed
/// implementation.
pub trait OfficerRegistry: Send + Sync {
    fn is_registered(&self, officer_id: &str) -> bool;
}

/// Default hook: every non-empty officer id passes
pub struct AcceptAllOfficers;

impl OfficerRegistry for AcceptAllOfficers {
    fn is_registered(&self, _officer_id: &str) -> bool {
        true
    }
}

/// Verify a delivery proof against the request's target coordinate
pub fn verify_delivery(
    proof: &DeliveryProof,
    target_lat_e7: i64,
    target_lng_e7: i64,
    tolerance_m: f64,
    officers: &dyn OfficerRegistry,
) -> DeliveryVerification {
    let proof_digest = proof.digest().unwrap_or_else(|_| crate::digest::ZERO_DIGEST.to_string());
    let verified_at = chrono::Utc::now().timestamp();

    match proof {
        DeliveryProof::Aerial {
            drop_lat_e7,
            drop_lng_e7,
            payload_image_digest,
            drone_id,
            ..
        } => {
            let distance_m =
                geo::haversine_e7_m(target_lat_e7, target_lng_e7, *drop_lat_e7, *drop_lng_e7);
            let gps_ok = distance_m < tolerance_m;
            let image_ok = !payload_image_digest.is_empty() && !is_zero_digest(payload_image_digest);
            let verified = gps_ok && image_ok;

            debug!(
                drone = %drone_id,
                distance_m = format!("{:.1}", distance_m),
                gps_ok,
                image_ok,
                "Aerial delivery verification"
            );

            DeliveryVerification {
                verified,
                delivery_class: proof.delivery_class(),
                gps_ok: Some(gps_ok),
                image_ok: Some(image_ok),
                signature_ok: None,
                officer_ok: None,
                distance_m: Some(distance_m.round() as u64),
                reason: if verified {
                    None
                } else if !gps_ok {
                    Some(format!(
                        "drop point {:.1} m from target, tolerance {:.0} m",
                        distance_m, tolerance_m
                    ))
                } else {
                    Some("missing payload image digest".to_string())
                },
                proof_digest,
                verified_at,
            }
        }
        DeliveryProof::Human {
            officer_id,
            signature,
            ..
        } => {
            let signature_ok = !signature.is_empty();
            let officer_ok = !officer_id.is_empty() && officers.is_registered(officer_id);
            let verified = signature_ok && officer_ok;

            DeliveryVerification {
                verified,
                delivery_class: proof.delivery_class(),
                gps_ok: None,
                image_ok: None,
                signature_ok: Some(signature_ok),
                officer_ok: Some(officer_ok),
                distance_m: None,
                reason: if verified {
                    None
                } else if !signature_ok {
                    Some("empty officer signature".to_string())
                } else {
                    Some(format!("officer '{}' not accepted", officer_id))
                },
                proof_digest,
                verified_at,
            }
        }
    }
}
