//! JSON-RPC ledger adapter implementation
//!
//! Speaks JSON-RPC 2.0 to the ledger node. Writes are wrapped in a signed
//! transaction envelope (ed25519 oracle key over the canonical envelope
//! body), submitted, and confirmed before returning. The same nonce is
//! reused across retry attempts so a resubmission after an RPC timeout is
//! idempotent on the ledger side.

use ed25519_dalek::{Signer, SigningKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    ConsensusSubmission, FulfillerAssignment, FulfillerInfo, Ledger, LedgerError, LedgerEvent,
    RequestSubmission, TxReceipt, VerificationRecord,
};
use crate::config::Args;
use crate::digest;
use crate::types::{AidRequest, PoolStats};

/// Retry delays applied before write attempts 2..=4
const WRITE_BACKOFF: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(2),
    Duration::from_secs(8),
];

/// Receipt poll cadence while awaiting confirmation
const CONFIRMATION_POLL: Duration = Duration::from_millis(500);

/// Give up waiting for a confirmation after this long (counts as transient)
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Oracle signing identity
struct OracleSigner {
    key: SigningKey,
    /// Hex-encoded verifying key; doubles as the on-ledger oracle address
    address: String,
}

/// JSON-RPC implementation of [`Ledger`]
pub struct RpcLedger {
    client: reqwest::Client,
    url: String,
    signer: Option<OracleSigner>,
    /// Serialises writes: a single in-flight transaction per signing key
    write_lock: Mutex<()>,
    rpc_id: AtomicU64,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Signed transaction envelope accepted by `aid_submitTransaction`
#[derive(Serialize)]
struct TxEnvelope<'a> {
    method: &'a str,
    request_id: u64,
    params: Value,
    nonce: u64,
    signer: &'a str,
    signature: String,
}

/// Receipt shape returned by `chain_getTransactionReceipt`. The node
/// answers immediately with `confirmed: false` while the transaction is
/// pending.
#[derive(Deserialize)]
struct ReceiptBody {
    confirmed: bool,
    #[serde(default)]
    reverted: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    block: u64,
}

impl RpcLedger {
    /// Build the adapter from startup configuration.
    ///
    /// An absent or unparseable oracle key leaves the adapter read-only;
    /// `validate()` has already rejected that outside dev mode.
    pub fn new(args: &Args) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(args.ledger_rpc_timeout_secs))
            .build()
            .map_err(|e| crate::CorridorError::Internal(format!("http client: {}", e)))?;

        let signer = match &args.oracle_key {
            Some(hex_seed) => {
                let bytes = hex::decode(hex_seed)
                    .map_err(|_| crate::CorridorError::Validation("ORACLE_KEY must be hex".into()))?;
                let seed: [u8; 32] = bytes.try_into().map_err(|_| {
                    crate::CorridorError::Validation("ORACLE_KEY must be a 32-byte seed".into())
                })?;
                let key = SigningKey::from_bytes(&seed);
                let address = hex::encode(key.verifying_key().to_bytes());
                info!(oracle = %address, "Oracle signing key loaded");
                Some(OracleSigner { key, address })
            }
            None => {
                warn!("No oracle key provisioned - ledger writes disabled");
                None
            }
        };

        Ok(Self {
            client,
            url: args.ledger_rpc_url.clone(),
            signer,
            write_lock: Mutex::new(()),
            rpc_id: AtomicU64::new(1),
        })
    }

    /// One JSON-RPC call with transient/permanent error classification.
    /// A null result is legal here (entity-not-present reads).
    async fn rpc_call_opt<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, LedgerError> {
        let body = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.rpc_id.fetch_add(1, Ordering::Relaxed),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    LedgerError::Transient(format!("{}: {}", method, e))
                } else {
                    LedgerError::Rpc(format!("{}: {}", method, e))
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(LedgerError::Transient(format!("{}: http {}", method, status)));
        }
        if !status.is_success() {
            return Err(LedgerError::Rpc(format!("{}: http {}", method, status)));
        }

        let parsed: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| LedgerError::Rpc(format!("{}: bad response: {}", method, e)))?;

        if let Some(err) = parsed.error {
            return Err(classify_rpc_error(method, err));
        }

        Ok(parsed.result)
    }

    /// One JSON-RPC call whose result must be present
    async fn rpc_call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, LedgerError> {
        self.rpc_call_opt(method, params)
            .await?
            .ok_or_else(|| LedgerError::Rpc(format!("{}: empty result", method)))
    }

    /// Submit a signed write and await one confirmation.
    ///
    /// The nonce is fetched once and reused across attempts: resubmitting an
    /// identical envelope after a timeout cannot produce a duplicate write.
    async fn write(
        &self,
        method: &str,
        request_id: u64,
        params: Value,
    ) -> Result<TxReceipt, LedgerError> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            LedgerError::Unavailable("oracle key not provisioned".to_string())
        })?;

        let _guard = self.write_lock.lock().await;

        let nonce: u64 = self
            .rpc_call("chain_getNonce", json!([signer.address]))
            .await?;

        let payload = json!({
            "method": method,
            "request_id": request_id,
            "params": params.clone(),
            "nonce": nonce,
        });
        let signature = hex::encode(
            signer
                .key
                .sign(payload.to_string().as_bytes())
                .to_bytes(),
        );
        let envelope = TxEnvelope {
            method,
            request_id,
            params,
            nonce,
            signer: &signer.address,
            signature,
        };
        let envelope = serde_json::to_value(&envelope)
            .map_err(|e| LedgerError::Rpc(format!("envelope: {}", e)))?;

        let receipt = with_write_backoff(method, || self.submit_and_confirm(&envelope)).await?;
        info!(
            method,
            request_id,
            tx = %receipt.tx_hash,
            block = receipt.block,
            "Ledger write confirmed"
        );
        Ok(receipt)
    }

    async fn submit_and_confirm(&self, envelope: &Value) -> Result<TxReceipt, LedgerError> {
        let tx_hash: String = self
            .rpc_call("aid_submitTransaction", json!([envelope]))
            .await?;

        let deadline = tokio::time::Instant::now() + CONFIRMATION_TIMEOUT;
        loop {
            let receipt: ReceiptBody = self
                .rpc_call("chain_getTransactionReceipt", json!([tx_hash]))
                .await?;

            if receipt.reverted {
                return Err(LedgerError::Reverted(
                    receipt
                        .reason
                        .unwrap_or_else(|| "execution reverted".to_string()),
                ));
            }
            if receipt.confirmed {
                return Ok(TxReceipt {
                    tx_hash,
                    block: receipt.block,
                });
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(LedgerError::Transient(format!(
                    "confirmation timeout for {}",
                    tx_hash
                )));
            }
            tokio::time::sleep(CONFIRMATION_POLL).await;
        }
    }
}

/// Run a ledger write with the adapter's bounded backoff.
///
/// Transient faults retry with the fixed delay ladder; anything else
/// surfaces immediately. Callers pass an idempotent operation (the signed
/// envelope keeps its nonce across attempts), so a retry after an RPC
/// timeout cannot double-apply.
pub async fn with_write_backoff<T, F, Fut>(method: &str, mut op: F) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, LedgerError>>,
{
    let mut last_err = LedgerError::Transient("no attempt made".into());
    for attempt in 0..=WRITE_BACKOFF.len() {
        if attempt > 0 {
            let delay = WRITE_BACKOFF[attempt - 1];
            debug!(
                method,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Retrying ledger write"
            );
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                warn!(method, error = %e, "Transient ledger fault");
                last_err = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

fn classify_rpc_error(method: &str, err: RpcErrorBody) -> LedgerError {
    // Code 3: execution revert (invalid state, bad fulfiller, ...).
    // -32000..-32099: node-side temporary failures.
    match err.code {
        3 => LedgerError::Reverted(format!("{}: {}", method, err.message)),
        -32099..=-32000 => LedgerError::Transient(format!("{}: {}", method, err.message)),
        _ => LedgerError::Rpc(format!("{}: [{}] {}", method, err.code, err.message)),
    }
}

#[async_trait::async_trait]
impl Ledger for RpcLedger {
    async fn get_request(&self, id: u64) -> Result<AidRequest, LedgerError> {
        self.rpc_call("aid_getRequest", json!([id])).await
    }

    async fn get_user_requests(&self, address: &str) -> Result<Vec<u64>, LedgerError> {
        self.rpc_call("aid_getUserRequests", json!([address])).await
    }

    async fn get_request_count(&self) -> Result<u64, LedgerError> {
        self.rpc_call("aid_getRequestCount", json!([])).await
    }

    async fn is_identity_verified(&self, address: &str) -> Result<bool, LedgerError> {
        self.rpc_call("registry_isIdentityVerified", json!([address]))
            .await
    }

    async fn get_pool_stats(&self) -> Result<PoolStats, LedgerError> {
        self.rpc_call("pool_getStats", json!([])).await
    }

    async fn get_approved_fulfillers(&self) -> Result<Vec<FulfillerInfo>, LedgerError> {
        self.rpc_call("registry_getApprovedFulfillers", json!([]))
            .await
    }

    async fn get_fulfiller_assignment(
        &self,
        request_id: u64,
    ) -> Result<Option<FulfillerAssignment>, LedgerError> {
        self.rpc_call_opt("aid_getAssignment", json!([request_id]))
            .await
    }

    async fn submit_request(&self, submission: &RequestSubmission) -> Result<u64, LedgerError> {
        let params = serde_json::to_value(submission)
            .map_err(|e| LedgerError::Rpc(format!("submission: {}", e)))?;
        let receipt = self.write("submit_request", 0, params).await?;
        // The assigned id is echoed in the receipt lookup
        self.rpc_call("aid_getAssignedId", json!([receipt.tx_hash]))
            .await
    }

    async fn submit_verification(
        &self,
        request_id: u64,
        record: &VerificationRecord,
    ) -> Result<TxReceipt, LedgerError> {
        let params = serde_json::to_value(record)
            .map_err(|e| LedgerError::Rpc(format!("verification: {}", e)))?;
        self.write("submit_verification", request_id, params).await
    }

    async fn submit_consensus(
        &self,
        request_id: u64,
        submission: &ConsensusSubmission,
    ) -> Result<TxReceipt, LedgerError> {
        let params = serde_json::to_value(submission)
            .map_err(|e| LedgerError::Rpc(format!("consensus: {}", e)))?;
        self.write("submit_consensus", request_id, params).await
    }

    async fn assign_fulfiller(
        &self,
        request_id: u64,
        fulfiller: &str,
        escrow_amount: u64,
    ) -> Result<TxReceipt, LedgerError> {
        self.write(
            "assign_fulfiller",
            request_id,
            json!({ "fulfiller": fulfiller, "escrow_amount": escrow_amount }),
        )
        .await
    }

    async fn verify_delivery(
        &self,
        request_id: u64,
        verified: bool,
        verification_hash: &str,
    ) -> Result<TxReceipt, LedgerError> {
        self.write(
            "verify_delivery",
            request_id,
            json!({ "verified": verified, "verification_hash": verification_hash }),
        )
        .await
    }

    async fn release_payout(&self, request_id: u64) -> Result<TxReceipt, LedgerError> {
        self.write("release_payout", request_id, json!({})).await
    }

    async fn timeout_request(&self, request_id: u64) -> Result<TxReceipt, LedgerError> {
        self.write("timeout_request", request_id, json!({})).await
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        self.rpc_call("chain_blockNumber", json!([])).await
    }

    async fn get_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.rpc_call("chain_getLogs", json!([from_block, to_block]))
            .await
    }

    fn writes_enabled(&self) -> bool {
        self.signer.is_some()
    }
}

/// Hash of the envelope body a write would sign, without submitting it.
/// What the oracle signs is exactly this payload, so two writes with the
/// same method, params and nonce sign the same bytes.
pub fn envelope_digest(method: &str, request_id: u64, params: &Value, nonce: u64) -> String {
    let payload = json!({
        "method": method,
        "request_id": request_id,
        "params": params,
        "nonce": nonce,
    });
    digest::sha256_hex(payload.to_string().as_bytes())
}
