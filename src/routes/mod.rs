//! HTTP routes for Corridor

pub mod auth_routes;
pub mod delivery;
pub mod fund;
pub mod health;
pub mod requests;
pub mod webhooks;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::auth::{extract_token_from_header, Claims};
use crate::server::AppState;

/// Error payload: always a single safe `error` field, plus `details`
/// outside production mode
#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
}

/// Build a JSON response
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(bytes)))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from(r#"{"error":"internal error"}"#)))
                .unwrap()
        })
}

/// Build a JSON error response
pub fn error_response(
    status: StatusCode,
    message: &str,
    details: Option<&str>,
) -> Response<Full<Bytes>> {
    json_response(
        status,
        &ErrorBody {
            error: message,
            details,
        },
    )
}

/// Map an internal error to a response, exposing details only outside
/// production mode
pub fn internal_error(state: &AppState, context: &str, error: impl ToString) -> Response<Full<Bytes>> {
    let details = error.to_string();
    tracing::error!(context, error = %details, "Request failed");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        context,
        state.args.dev_mode.then_some(details.as_str()),
    )
}

/// Authenticate a bearer-gated route.
///
/// Production requires a valid token; dev mode falls back to an anonymous
/// subject so local flows can be exercised without the auth service.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Claims, Response<Full<Bytes>>> {
    let header = headers
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if let Some(token) = extract_token_from_header(header) {
        if let Some(claims) = state.tokens.verify(token) {
            return Ok(claims);
        }
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid or expired token",
            None,
        ));
    }

    if state.args.dev_mode {
        return Ok(Claims {
            sub: "00".repeat(32),
            verified: false,
            device_id: None,
            iat: 0,
            exp: u64::MAX,
        });
    }

    Err(error_response(
        StatusCode::UNAUTHORIZED,
        "authentication required",
        None,
    ))
}
