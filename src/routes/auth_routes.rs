//! Login route
//!
//! A login proves key control by signature; the identity-verified flag in
//! the issued token is read from the registry but remains advisory - every
//! write-gated route consults the registry again.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{error_response, json_response};
use crate::auth::verify_login_signature;
use crate::server::AppState;

#[derive(Deserialize)]
struct LoginBody {
    address: String,
    signature: String,
    message: String,
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    address: String,
    verified: bool,
    expires_in: u64,
}

/// POST /api/auth/login
pub async fn handle_login(
    state: &std::sync::Arc<AppState>,
    body: &Bytes,
) -> Response<Full<Bytes>> {
    let body: LoginBody = match serde_json::from_slice(body) {
        Ok(b) => b,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "malformed login body", None),
    };

    if !verify_login_signature(&body.address, &body.message, &body.signature) {
        return error_response(StatusCode::UNAUTHORIZED, "invalid signature", None);
    }

    let verified = match state.ledger.is_identity_verified(&body.address).await {
        Ok(v) => v,
        Err(e) => {
            warn!(address = %body.address, error = %e, "Registry lookup failed during login");
            false
        }
    };

    match state.tokens.issue(&body.address, verified, body.device_id) {
        Ok((token, expires_in)) => json_response(
            StatusCode::OK,
            &LoginResponse {
                token,
                address: body.address,
                verified,
                expires_in,
            },
        ),
        Err(e) => super::internal_error(state, "token mint failed", e),
    }
}
