//! Disaster-data provider clients
//!
//! Every provider is queried through the same narrow seam: position plus
//! search radius in, zero or more events out. The HTTP implementation talks
//! to aggregator endpoints that expose the common event schema; tests and
//! dev mode wire static providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::Severity;
use crate::types::Result as CorridorResult;

/// One event as reported by a single provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    /// Event class label ("flood", "wildfire", "earthquake", ...)
    pub class: String,
    pub severity: Severity,
    /// Human-readable region label
    pub region: String,
    pub lat: f64,
    pub lng: f64,
    /// Effective affected radius in kilometres
    pub radius_km: f64,
    pub active: bool,
    /// Last update, unix seconds
    pub updated_at: i64,
}

/// A disaster-data source
#[async_trait]
pub trait EventProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Events near the given position. Implementations may return events
    /// outside the radius; the engine filters again.
    async fn query(
        &self,
        lat: f64,
        lng: f64,
        radius_km: f64,
    ) -> Result<Vec<ProviderEvent>, String>;
}

/// HTTP provider speaking the common aggregator schema
pub struct HttpEventProvider {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpEventProvider {
    pub fn new(name: String, url: String, timeout: Duration) -> CorridorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::CorridorError::Internal(format!("http client: {}", e)))?;
        Ok(Self { name, url, client })
    }
}

#[async_trait]
impl EventProvider for HttpEventProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(
        &self,
        lat: f64,
        lng: f64,
        radius_km: f64,
    ) -> Result<Vec<ProviderEvent>, String> {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("lat", lat.to_string()),
                ("lng", lng.to_string()),
                ("radius_km", radius_km.to_string()),
            ])
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("{} returned http {}", self.name, response.status()));
        }

        response.json().await.map_err(|e| e.to_string())
    }
}
