//! Fulfiller selection and dispatch
//!
//! The approved-fulfiller set is read from the ledger registry before each
//! dispatch; a stale copy is kept as a fallback when the registry read
//! fails transiently. Dispatch itself is one POST to the fulfiller's
//! endpoint carrying the deliverable reference the fulfiller must echo in
//! its delivery webhook.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{DispatchOrder, DispatchResult, Fulfillment};
use crate::ledger::{FulfillerInfo, Ledger};
use crate::types::{CorridorError, FulfillerClass, Result as CorridorResult};

#[derive(Deserialize)]
struct DispatchResponse {
    dispatch_id: String,
    #[serde(default)]
    eta_minutes: u32,
}

/// Ledger-backed fulfiller dispatcher
pub struct FulfillerDispatcher {
    ledger: Arc<dyn Ledger>,
    client: reqwest::Client,
    /// Last-known registry copy by class, used when the registry read fails
    cache: DashMap<FulfillerClass, FulfillerInfo>,
}

impl FulfillerDispatcher {
    pub fn new(ledger: Arc<dyn Ledger>, dispatch_timeout: Duration) -> CorridorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(dispatch_timeout)
            .build()
            .map_err(|e| CorridorError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            ledger,
            client,
            cache: DashMap::new(),
        })
    }
}

#[async_trait]
impl Fulfillment for FulfillerDispatcher {
    async fn select(&self, class: FulfillerClass) -> CorridorResult<FulfillerInfo> {
        match self.ledger.get_approved_fulfillers().await {
            Ok(fulfillers) => {
                for f in &fulfillers {
                    self.cache.insert(f.class, f.clone());
                }
                fulfillers
                    .into_iter()
                    .find(|f| f.class == class)
                    .ok_or_else(|| {
                        CorridorError::Upstream(format!(
                            "no approved fulfiller for class {:?}",
                            class
                        ))
                    })
            }
            Err(e) => match self.cache.get(&class) {
                Some(cached) => {
                    warn!(error = %e, class = ?class, "Registry read failed, using cached fulfiller");
                    Ok(cached.clone())
                }
                None => Err(e.into()),
            },
        }
    }

    async fn dispatch(
        &self,
        fulfiller: &FulfillerInfo,
        order: &DispatchOrder,
    ) -> CorridorResult<DispatchResult> {
        let response = self
            .client
            .post(format!("{}/dispatch", fulfiller.endpoint))
            .json(order)
            .send()
            .await
            .map_err(|e| CorridorError::Upstream(format!("dispatch to {}: {}", fulfiller.name, e)))?;

        if !response.status().is_success() {
            return Err(CorridorError::Upstream(format!(
                "dispatch to {} returned http {}",
                fulfiller.name,
                response.status()
            )));
        }

        let body: DispatchResponse = response
            .json()
            .await
            .map_err(|e| CorridorError::Upstream(format!("dispatch response: {}", e)))?;

        info!(
            reference = %order.reference,
            fulfiller = %fulfiller.name,
            dispatch_id = %body.dispatch_id,
            eta_minutes = body.eta_minutes,
            "Fulfiller dispatched"
        );

        Ok(DispatchResult {
            dispatch_id: body.dispatch_id,
            fulfiller_address: fulfiller.address.clone(),
            fulfiller_name: fulfiller.name.clone(),
            eta_minutes: body.eta_minutes,
        })
    }
}
