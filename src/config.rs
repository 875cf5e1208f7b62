//! Configuration for Corridor
//!
//! CLI arguments and environment variable handling using clap. One value,
//! parsed at startup, passed to constructors - nothing reads the environment
//! past this point.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use uuid::Uuid;

/// Corridor - off-chain orchestrator for the AidChain protocol
#[derive(Parser, Debug, Clone)]
#[command(name = "corridor")]
#[command(about = "Pipeline orchestrator for the AidChain humanitarian-aid protocol")]
pub struct Args {
    /// Unique node identifier for this orchestrator instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Public base URL of this instance (used in pipeline_url responses)
    #[arg(long, env = "PUBLIC_URL", default_value = "http://localhost:8080")]
    pub public_url: String,

    /// Enable development mode (optional auth, ledger writes may be disabled)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------
    /// Ledger RPC endpoint
    #[arg(long, env = "LEDGER_RPC_URL", default_value = "http://localhost:9650/rpc")]
    pub ledger_rpc_url: String,

    /// Per-call ledger RPC timeout in seconds
    #[arg(long, env = "LEDGER_RPC_TIMEOUT_SECS", default_value = "20")]
    pub ledger_rpc_timeout_secs: u64,

    /// Ledger event poll interval in seconds
    #[arg(long, env = "LEDGER_POLL_INTERVAL_SECS", default_value = "10")]
    pub ledger_poll_interval_secs: u64,

    /// Path of the persisted event-poll cursor (last seen block)
    #[arg(long, env = "LEDGER_CURSOR_PATH", default_value = "corridor.cursor")]
    pub ledger_cursor_path: String,

    /// Oracle signing key: hex-encoded 32-byte ed25519 seed.
    /// Absent => ledger writes disabled (reads still live).
    #[arg(long, env = "ORACLE_KEY")]
    pub oracle_key: Option<String>,

    // ------------------------------------------------------------------
    // GNSS authenticator
    // ------------------------------------------------------------------
    /// Upstream GNSS authenticator base URL
    #[arg(long, env = "GNSS_URL", default_value = "http://localhost:8090")]
    pub gnss_url: String,

    /// End-to-end GNSS verification timeout in seconds
    #[arg(long, env = "GNSS_TIMEOUT_SECS", default_value = "15")]
    pub gnss_timeout_secs: u64,

    // ------------------------------------------------------------------
    // Disaster-data providers
    // ------------------------------------------------------------------
    /// Comma-separated list of disaster-data providers as name=url pairs,
    /// e.g. "gdacs=https://gdacs.example/api,reliefweb=https://rw.example/api"
    #[arg(long, env = "EVENT_PROVIDERS", default_value = "")]
    pub event_providers: String,

    /// Per-provider query timeout in seconds
    #[arg(long, env = "PROVIDER_TIMEOUT_SECS", default_value = "10")]
    pub provider_timeout_secs: u64,

    /// Search radius for disaster events in kilometres
    #[arg(long, env = "EVENT_SEARCH_RADIUS_KM", default_value = "100")]
    pub event_search_radius_km: f64,

    // ------------------------------------------------------------------
    // LLM consensus panel
    // ------------------------------------------------------------------
    /// JSON array of panel endpoints:
    /// [{"id":"node-1","model":"gpt-4o","url":"https://...","api_key":"..."}]
    #[arg(long, env = "LLM_ENDPOINTS", default_value = "[]")]
    pub llm_endpoints: String,

    /// Per-node LLM timeout in seconds
    #[arg(long, env = "LLM_TIMEOUT_SECS", default_value = "30")]
    pub llm_timeout_secs: u64,

    // ------------------------------------------------------------------
    // Fulfilment
    // ------------------------------------------------------------------
    /// Fulfiller dispatch call timeout in seconds
    #[arg(long, env = "DISPATCH_TIMEOUT_SECS", default_value = "15")]
    pub dispatch_timeout_secs: u64,

    /// Delivery wall-clock timeout in hours (matched to the ledger rule)
    #[arg(long, env = "DELIVERY_TIMEOUT_HOURS", default_value = "24")]
    pub delivery_timeout_hours: u64,

    /// Aerial drop tolerance radius in metres
    #[arg(long, env = "DELIVERY_RADIUS_M", default_value = "30")]
    pub delivery_radius_m: f64,

    /// Comma-separated fulfiller webhook shared secrets as name=secret pairs
    #[arg(long, env = "WEBHOOK_SECRETS", default_value = "")]
    pub webhook_secrets: String,

    // ------------------------------------------------------------------
    // Auth
    // ------------------------------------------------------------------
    /// Secret for bearer session tokens (required in production)
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Bearer token lifetime in seconds
    #[arg(long, env = "TOKEN_EXPIRY_SECS", default_value = "86400")]
    pub token_expiry_secs: u64,
}

/// One LLM panel endpoint, parsed from the LLM_ENDPOINTS JSON array
#[derive(Debug, Clone, Deserialize)]
pub struct LlmEndpointConfig {
    pub id: String,
    pub model: String,
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Args {
    /// Get effective JWT secret (uses default in dev mode)
    pub fn jwt_secret(&self) -> String {
        if self.dev_mode {
            self.jwt_secret
                .clone()
                .unwrap_or_else(|| "dev-only-insecure-secret".to_string())
        } else {
            self.jwt_secret
                .clone()
                .expect("JWT_SECRET is required in production mode")
        }
    }

    /// Parse the provider list into (name, url) pairs
    pub fn event_provider_list(&self) -> Vec<(String, String)> {
        self.event_providers
            .split(',')
            .filter_map(|entry| {
                let (name, url) = entry.trim().split_once('=')?;
                if name.is_empty() || url.is_empty() {
                    return None;
                }
                Some((name.to_string(), url.to_string()))
            })
            .collect()
    }

    /// Parse the LLM panel endpoint list
    pub fn llm_endpoint_list(&self) -> Result<Vec<LlmEndpointConfig>, String> {
        serde_json::from_str(&self.llm_endpoints)
            .map_err(|e| format!("LLM_ENDPOINTS is not a valid JSON array: {}", e))
    }

    /// Parse fulfiller webhook secrets into (name, secret) pairs
    pub fn webhook_secret_list(&self) -> Vec<(String, String)> {
        self.webhook_secrets
            .split(',')
            .filter_map(|entry| {
                let (name, secret) = entry.trim().split_once('=')?;
                if name.is_empty() || secret.is_empty() {
                    return None;
                }
                Some((name.to_string(), secret.to_string()))
            })
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            if self.jwt_secret.is_none() {
                return Err("JWT_SECRET is required in production mode".to_string());
            }
            if self.oracle_key.is_none() {
                return Err("ORACLE_KEY is required in production mode".to_string());
            }
        }

        if let Some(ref key) = self.oracle_key {
            let bytes = hex::decode(key).map_err(|_| "ORACLE_KEY must be hex".to_string())?;
            if bytes.len() != 32 {
                return Err("ORACLE_KEY must be a 32-byte hex seed".to_string());
            }
        }

        let endpoints = self.llm_endpoint_list()?;
        if !self.dev_mode && endpoints.len() < 3 {
            return Err(format!(
                "at least 3 LLM endpoints are required to reach quorum, got {}",
                endpoints.len()
            ));
        }

        if !self.dev_mode && self.event_provider_list().is_empty() {
            return Err("at least one disaster-data provider is required".to_string());
        }

        if self.delivery_radius_m <= 0.0 {
            return Err("DELIVERY_RADIUS_M must be positive".to_string());
        }

        Ok(())
    }
}
