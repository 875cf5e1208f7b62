//! GNSS location authentication client
//!
//! Corridor does not re-authenticate navigation signals itself: a
//! specialised upstream backend produces the satellite snapshot and the
//! pseudorange fix. This client drives that backend, runs the anti-spoofing
//! battery over the returned observations, cross-checks the claimed
//! coordinates, and assembles the content-addressed proof bundle anchored
//! on-ledger.
//!
//! A failure result is still recorded for audit but halts the pipeline at
//! the location-verification stage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::geo;
use crate::types::Result as CorridorResult;

/// Minimum authenticated satellites for a usable fix
const MIN_AUTHENTICATED_SATELLITES: usize = 4;

/// Carrier-to-noise standard deviation floor (dB); uniform signal power
/// across satellites is the signature of a single-source simulator
const CN0_STDDEV_MIN_DB: f64 = 0.5;

/// Low-elevation mean C/N0 may not exceed the high-elevation mean by more
/// than this margin (dB)
const ELEVATION_POWER_MARGIN_DB: f64 = 5.0;

/// Elevation split between "low" and "high" satellites (degrees)
const ELEVATION_SPLIT_DEG: f64 = 30.0;

/// Claimed-to-authenticated position tolerance (metres)
const POSITION_TOLERANCE_M: f64 = 50.0;

// ============================================================================
// Types
// ============================================================================

/// A location claim submitted with an aid request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationClaim {
    pub lat: f64,
    pub lng: f64,
    pub device_id: String,
    /// Raw signal bundle captured by the device, base64
    pub raw_signal_bundle: String,
}

/// One satellite observation from the upstream authenticator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatelliteObservation {
    pub sv_id: String,
    pub cn0_dbhz: f64,
    pub elevation_deg: f64,
    /// Navigation-message authentication outcome for this satellite
    pub nav_auth_ok: bool,
}

/// Authenticated pseudorange fix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionFix {
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: f64,
}

/// Full snapshot returned by the upstream authenticator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub satellites: Vec<SatelliteObservation>,
    /// Whether the navigation-message authentication chain verified
    pub nav_chain_valid: bool,
    pub fix: PositionFix,
    /// Authenticated atomic time, unix seconds
    pub atomic_time_unix: i64,
    /// Authentication key identifier used by the upstream chain
    pub auth_key_id: String,
}

/// Content-addressed proof that a claimed position+time was authenticated.
///
/// Coordinates at scale 10^7, accuracy in centimetres: the canonical form
/// carries integers only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GnssProofBundle {
    pub lat_e7: i64,
    pub lng_e7: i64,
    pub accuracy_cm: u32,
    pub satellite_count: u32,
    pub auth_key_id: String,
    pub anti_spoofing_passed: bool,
    /// Authenticated timestamp, unix seconds
    pub authenticated_at: i64,
    pub device_id: String,
}

impl GnssProofBundle {
    /// Deterministic 32-byte digest over the canonical serialisation
    pub fn digest(&self) -> CorridorResult<String> {
        crate::digest::digest_canonical(self)
    }
}

/// Location verification failure reasons
#[derive(Debug, Clone, PartialEq)]
pub enum GnssFailure {
    InsufficientCoverage { satellites: usize },
    AuthenticationFailed,
    SpoofingDetected(String),
    PositionMismatch { distance_m: f64 },
    Upstream(String),
}

impl fmt::Display for GnssFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientCoverage { satellites } => {
                write!(f, "insufficient coverage: {} authenticated satellites", satellites)
            }
            Self::AuthenticationFailed => write!(f, "navigation message authentication failed"),
            Self::SpoofingDetected(reason) => write!(f, "spoofing detected: {}", reason),
            Self::PositionMismatch { distance_m } => {
                write!(f, "position mismatch: {:.1} m from claimed coordinates", distance_m)
            }
            Self::Upstream(msg) => write!(f, "authenticator unavailable: {}", msg),
        }
    }
}

// ============================================================================
// Upstream seam
// ============================================================================

/// Upstream authenticator backend: produces the satellite snapshot for a
/// device. The HTTP implementation is wired at startup; tests feed
/// snapshots directly.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn snapshot(&self, claim: &LocationClaim) -> Result<SignalSnapshot, String>;
}

/// HTTP client for the upstream authenticator
pub struct HttpSignalSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSignalSource {
    pub fn new(url: String, timeout: Duration) -> CorridorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::CorridorError::Internal(format!("http client: {}", e)))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl SignalSource for HttpSignalSource {
    async fn snapshot(&self, claim: &LocationClaim) -> Result<SignalSnapshot, String> {
        let response = self
            .client
            .post(format!("{}/authenticate", self.url))
            .json(claim)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("authenticator returned http {}", response.status()));
        }

        response.json().await.map_err(|e| e.to_string())
    }
}

// ============================================================================
// Verifier
// ============================================================================

/// Pipeline-facing seam: one verification call per request at the location
/// stage
#[async_trait]
pub trait LocationVerifier: Send + Sync {
    async fn verify_location(&self, claim: &LocationClaim)
        -> Result<GnssProofBundle, GnssFailure>;
}

/// GNSS authenticator client
pub struct GnssAuthenticator {
    source: Arc<dyn SignalSource>,
    deadline: Duration,
}

impl GnssAuthenticator {
    pub fn new(source: Arc<dyn SignalSource>, deadline: Duration) -> Self {
        Self { source, deadline }
    }
}

#[async_trait]
impl LocationVerifier for GnssAuthenticator {
    async fn verify_location(
        &self,
        claim: &LocationClaim,
    ) -> Result<GnssProofBundle, GnssFailure> {
        let snapshot = tokio::time::timeout(self.deadline, self.source.snapshot(claim))
            .await
            .map_err(|_| GnssFailure::Upstream("snapshot deadline expired".to_string()))?
            .map_err(GnssFailure::Upstream)?;

        let authenticated: Vec<&SatelliteObservation> = snapshot
            .satellites
            .iter()
            .filter(|s| s.nav_auth_ok)
            .collect();

        if authenticated.len() < MIN_AUTHENTICATED_SATELLITES {
            return Err(GnssFailure::InsufficientCoverage {
                satellites: authenticated.len(),
            });
        }

        if !snapshot.nav_chain_valid {
            return Err(GnssFailure::AuthenticationFailed);
        }

        // Anti-spoofing battery over the authenticated observations.
        let stddev = cn0_stddev(&authenticated);
        if stddev <= CN0_STDDEV_MIN_DB {
            return Err(GnssFailure::SpoofingDetected(format!(
                "carrier-to-noise dispersion {:.2} dB below {:.1} dB floor",
                stddev, CN0_STDDEV_MIN_DB
            )));
        }

        if let Some(gap) = elevation_power_gap(&authenticated) {
            if gap > ELEVATION_POWER_MARGIN_DB {
                return Err(GnssFailure::SpoofingDetected(format!(
                    "low-elevation power exceeds high-elevation by {:.1} dB",
                    gap
                )));
            }
        }

        let distance_m = geo::haversine_m(claim.lat, claim.lng, snapshot.fix.lat, snapshot.fix.lng);
        if distance_m > POSITION_TOLERANCE_M {
            return Err(GnssFailure::PositionMismatch { distance_m });
        }

        let bundle = GnssProofBundle {
            lat_e7: geo::to_e7(snapshot.fix.lat),
            lng_e7: geo::to_e7(snapshot.fix.lng),
            accuracy_cm: (snapshot.fix.accuracy_m * 100.0).round() as u32,
            satellite_count: authenticated.len() as u32,
            auth_key_id: snapshot.auth_key_id,
            anti_spoofing_passed: true,
            authenticated_at: snapshot.atomic_time_unix,
            device_id: claim.device_id.clone(),
        };

        info!(
            device = %bundle.device_id,
            satellites = bundle.satellite_count,
            distance_m = format!("{:.1}", distance_m),
            "Location authenticated"
        );
        debug!(cn0_stddev_db = format!("{:.2}", stddev), "Anti-spoofing battery passed");

        Ok(bundle)
    }
}

/// Standard deviation of carrier-to-noise ratios across satellites
fn cn0_stddev(satellites: &[&SatelliteObservation]) -> f64 {
    if satellites.is_empty() {
        return 0.0;
    }
    let n = satellites.len() as f64;
    let mean = satellites.iter().map(|s| s.cn0_dbhz).sum::<f64>() / n;
    let variance = satellites
        .iter()
        .map(|s| (s.cn0_dbhz - mean).powi(2))
        .sum::<f64>()
        / n;
    variance.sqrt()
}

/// How far low-elevation mean power exceeds high-elevation mean power.
/// `None` when either elevation band is empty.
fn elevation_power_gap(satellites: &[&SatelliteObservation]) -> Option<f64> {
    let (low, high): (Vec<_>, Vec<_>) = satellites
        .iter()
        .partition(|s| s.elevation_deg < ELEVATION_SPLIT_DEG);
    if low.is_empty() || high.is_empty() {
        return None;
    }
    let low_mean =
        low.iter().map(|s: &&SatelliteObservation| s.cn0_dbhz).sum::<f64>() / low.len() as f64;
    let high_mean =
        high.iter().map(|s: &&SatelliteObservation| s.cn0_dbhz).sum::<f64>() / high.len() as f64;
    Some(low_mean - high_mean)
}
