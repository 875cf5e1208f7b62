//! Attestation engine: fan-out, dedup, score, select
//!
//! Providers are queried in parallel with a per-provider timeout; a slow or
//! failing provider is skipped as long as at least one answers. Events of
//! the same class whose centres lie within the merge radius are collapsed
//! into one record whose source set is the union of the contributors.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::providers::{EventProvider, ProviderEvent};
use super::{AttestationFailure, EventAttestation, EventQuery, EventVerifier, Severity};
use crate::geo;

/// Same-class events with centres inside this radius are one event
const DEDUP_RADIUS_KM: f64 = 50.0;

/// Scoring weights: proximity, source coverage, severity
const W_PROXIMITY: f64 = 0.5;
const W_COVERAGE: f64 = 0.3;
const W_SEVERITY: f64 = 0.2;

/// Source count at which coverage saturates
const COVERAGE_SATURATION: f64 = 3.0;

/// An event surviving cross-provider deduplication
#[derive(Debug, Clone)]
struct MergedEvent {
    id: String,
    class: String,
    severity: Severity,
    region: String,
    lat: f64,
    lng: f64,
    radius_km: f64,
    active: bool,
    updated_at: i64,
    sources: Vec<String>,
}

impl MergedEvent {
    fn from_report(source: &str, event: ProviderEvent) -> Self {
        Self {
            id: event.id,
            class: event.class,
            severity: event.severity,
            region: event.region,
            lat: event.lat,
            lng: event.lng,
            radius_km: event.radius_km,
            active: event.active,
            updated_at: event.updated_at,
            sources: vec![source.to_string()],
        }
    }

    /// Fold another provider's report of the same event into this record
    fn absorb(&mut self, source: &str, event: &ProviderEvent) {
        if !self.sources.iter().any(|s| s == source) {
            self.sources.push(source.to_string());
        }
        // Keep the most severe view of the event
        if event.severity > self.severity {
            self.severity = event.severity;
        }
        if event.radius_km > self.radius_km {
            self.radius_km = event.radius_km;
        }
        self.active = self.active || event.active;
        self.updated_at = self.updated_at.max(event.updated_at);
    }
}

/// Multi-provider attestation engine
pub struct AttestationEngine {
    providers: Vec<Arc<dyn EventProvider>>,
    per_provider_timeout: Duration,
}

impl AttestationEngine {
    pub fn new(providers: Vec<Arc<dyn EventProvider>>, per_provider_timeout: Duration) -> Self {
        Self {
            providers,
            per_provider_timeout,
        }
    }

    /// Query every provider in parallel; returns (source, events) per
    /// success and a description of the failures.
    async fn fan_out(&self, query: &EventQuery) -> (Vec<(String, Vec<ProviderEvent>)>, Vec<String>) {
        let calls = self.providers.iter().map(|provider| {
            let provider = Arc::clone(provider);
            let (lat, lng, radius) = (query.lat, query.lng, query.radius_km);
            let timeout = self.per_provider_timeout;
            async move {
                let name = provider.name().to_string();
                match tokio::time::timeout(timeout, provider.query(lat, lng, radius)).await {
                    Ok(Ok(events)) => (name, Ok(events)),
                    Ok(Err(e)) => (name, Err(e)),
                    Err(_) => (name, Err("timed out".to_string())),
                }
            }
        });

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in join_all(calls).await {
            match result {
                Ok(events) => {
                    debug!(provider = %name, count = events.len(), "Provider answered");
                    successes.push((name, events));
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "Provider skipped");
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }
        (successes, failures)
    }

    fn score(&self, event: &MergedEvent, distance_km: f64) -> f64 {
        let proximity = if event.radius_km > 0.0 {
            (1.0 - distance_km / event.radius_km).max(0.0)
        } else {
            0.0
        };
        let coverage = (event.sources.len() as f64 / COVERAGE_SATURATION).min(1.0);
        W_PROXIMITY * proximity + W_COVERAGE * coverage + W_SEVERITY * event.severity.weight()
    }
}

/// Collapse same-class reports whose centres lie within the merge radius
fn deduplicate(reports: Vec<(String, Vec<ProviderEvent>)>) -> Vec<MergedEvent> {
    let mut merged: Vec<MergedEvent> = Vec::new();
    for (source, events) in reports {
        for event in events {
            let existing = merged.iter_mut().find(|m| {
                m.class == event.class
                    && geo::haversine_km(m.lat, m.lng, event.lat, event.lng) <= DEDUP_RADIUS_KM
            });
            match existing {
                Some(m) => m.absorb(&source, &event),
                None => merged.push(MergedEvent::from_report(&source, event)),
            }
        }
    }
    merged
}

#[async_trait]
impl EventVerifier for AttestationEngine {
    async fn verify_event(
        &self,
        query: &EventQuery,
    ) -> Result<EventAttestation, AttestationFailure> {
        let (successes, failures) = self.fan_out(query).await;
        if successes.is_empty() {
            return Err(AttestationFailure::ProvidersUnavailable(failures.join("; ")));
        }

        // Filter to the search radius before merging
        let in_range: Vec<(String, Vec<ProviderEvent>)> = successes
            .into_iter()
            .map(|(source, events)| {
                let events = events
                    .into_iter()
                    .filter(|e| {
                        geo::haversine_km(query.lat, query.lng, e.lat, e.lng) <= query.radius_km
                    })
                    .collect();
                (source, events)
            })
            .collect();

        let merged = deduplicate(in_range);

        let best = merged
            .into_iter()
            .map(|event| {
                let distance_km = geo::haversine_km(query.lat, query.lng, event.lat, event.lng);
                let score = self.score(&event, distance_km);
                (event, distance_km, score)
            })
            // Deterministic winner: score, then id as the tiebreak
            .max_by(|(a, _, sa), (b, _, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.id.cmp(&a.id))
            });

        let Some((event, distance_km, score)) = best else {
            return Err(AttestationFailure::NoEventFound);
        };
        debug!(
            event = %event.id,
            class = %event.class,
            score = format!("{:.3}", score),
            "Best-scoring event selected"
        );
        if !event.active {
            return Err(AttestationFailure::EventNotActive);
        }

        let mut sources = event.sources.clone();
        sources.sort();

        let attestation = EventAttestation {
            event_id: event.id,
            event_class: event.class,
            severity: event.severity,
            region: event.region,
            center_lat_e7: geo::to_e7(event.lat),
            center_lng_e7: geo::to_e7(event.lng),
            radius_km: event.radius_km.round() as u32,
            sources,
            distance_m: (distance_km * 1000.0).round() as u64,
            active: true,
            attested_at: chrono::Utc::now().timestamp(),
        };

        info!(
            event = %attestation.event_id,
            class = %attestation.event_class,
            severity = ?attestation.severity,
            sources = attestation.source_count(),
            distance_m = attestation.distance_m,
            "Disaster event attested"
        );

        Ok(attestation)
    }
}
