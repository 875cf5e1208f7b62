//! HTTP server implementation
//!
//! hyper http1 with TokioIo for async handling; one accept loop, one task
//! per connection. The route table is a straight match on method and path -
//! the surface is deliberately thin: validate, hand to the orchestrator,
//! translate outcomes to status codes.

use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::auth::TokenService;
use crate::bus::EventBus;
use crate::config::Args;
use crate::ledger::Ledger;
use crate::pipeline::Orchestrator;
use crate::routes;
use crate::server::websocket;
use crate::types::Result as CorridorResult;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub ledger: Arc<dyn Ledger>,
    pub orchestrator: Arc<Orchestrator>,
    pub bus: Arc<EventBus>,
    pub tokens: TokenService,
    /// Fulfiller webhook shared secrets by fulfiller name
    pub webhook_secrets: DashMap<String, String>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        args: Args,
        ledger: Arc<dyn Ledger>,
        orchestrator: Arc<Orchestrator>,
        bus: Arc<EventBus>,
    ) -> Self {
        let tokens = TokenService::new(&args.jwt_secret(), args.token_expiry_secs);
        let webhook_secrets = DashMap::new();
        for (name, secret) in args.webhook_secret_list() {
            webhook_secrets.insert(name, secret);
        }
        Self {
            args,
            ledger,
            orchestrator,
            bus,
            tokens,
            webhook_secrets,
            started_at: Instant::now(),
        }
    }
}

/// Start the HTTP server; returns when the shutdown flag flips
pub async fn run(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> CorridorResult<()> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Corridor listening on {} as node {}",
        state.args.listen, state.args.node_id
    );
    if state.args.dev_mode {
        warn!("Development mode enabled - bearer auth optional");
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move { handle_request(state, addr, req).await }
                        });

                        if let Err(err) = http1::Builder::new()
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            debug!("Error serving connection from {}: {:?}", addr, err);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {:?}", e);
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Shutdown signalled, no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    // WebSocket subscription channel
    if method == Method::GET && path == "/ws" {
        if hyper_tungstenite::is_upgrade_request(&req) {
            return Ok(websocket::handle_ws_upgrade(state, req).await);
        }
        return Ok(routes::error_response(
            StatusCode::BAD_REQUEST,
            "WebSocket upgrade required for /ws",
            None,
        ));
    }

    let response = match (method, path.as_str()) {
        // Liveness / readiness / version
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            routes::health::health_check(&state)
        }
        (Method::GET, "/ready") | (Method::GET, "/readyz") => {
            routes::health::readiness_check(&state).await
        }
        (Method::GET, "/version") => routes::health::version_info(),

        // CORS preflight
        (Method::OPTIONS, _) => preflight_response(),

        (Method::POST, "/api/requests") => {
            let (parts, body) = req.into_parts();
            let bytes = body.collect().await?.to_bytes();
            routes::requests::handle_submit(&state, &parts.headers, &bytes).await
        }

        (Method::GET, p) if p.starts_with("/api/requests/user/") => {
            let address = p.trim_start_matches("/api/requests/user/");
            routes::requests::handle_user_requests(&state, address).await
        }

        (Method::GET, p) if p.starts_with("/api/requests/") && p.ends_with("/pipeline") => {
            match parse_id(p, "/api/requests/", "/pipeline") {
                Some(id) => routes::requests::handle_pipeline_status(&state, id),
                None => routes::error_response(StatusCode::BAD_REQUEST, "invalid request id", None),
            }
        }

        (Method::GET, p) if p.starts_with("/api/requests/") => {
            match parse_id(p, "/api/requests/", "") {
                Some(id) => routes::requests::handle_get_request(&state, id).await,
                None => routes::error_response(StatusCode::BAD_REQUEST, "invalid request id", None),
            }
        }

        (Method::POST, "/api/delivery/confirm") => {
            let (parts, body) = req.into_parts();
            let bytes = body.collect().await?.to_bytes();
            routes::delivery::handle_confirm(&state, &parts.headers, &bytes).await
        }

        (Method::GET, "/api/fund/stats") => routes::fund::handle_fund_stats(&state).await,

        (Method::GET, "/api/pipeline/active") => routes::requests::handle_active(&state),

        (Method::POST, "/api/auth/login") => {
            let bytes = req.into_body().collect().await?.to_bytes();
            routes::auth_routes::handle_login(&state, &bytes).await
        }

        (Method::POST, p) if p.starts_with("/api/webhooks/") => {
            let fulfiller = p.trim_start_matches("/api/webhooks/").to_string();
            let (parts, body) = req.into_parts();
            let bytes = body.collect().await?.to_bytes();
            routes::webhooks::handle_webhook(&state, &fulfiller, &parts.headers, &bytes).await
        }

        (_, p) => routes::error_response(
            StatusCode::NOT_FOUND,
            &format!("no route for {}", p),
            None,
        ),
    };

    Ok(response)
}

/// Parse a numeric id out of a path segment
fn parse_id(path: &str, prefix: &str, suffix: &str) -> Option<u64> {
    let inner = path.strip_prefix(prefix)?;
    let inner = if suffix.is_empty() {
        inner
    } else {
        inner.strip_suffix(suffix)?
    };
    inner.parse().ok()
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type, Authorization, X-Webhook-Secret")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("/api/requests/42", "/api/requests/", ""), Some(42));
        assert_eq!(
            parse_id("/api/requests/42/pipeline", "/api/requests/", "/pipeline"),
            Some(42)
        );
        assert_eq!(parse_id("/api/requests/abc", "/api/requests/", ""), None);
        assert_eq!(parse_id("/api/requests/", "/api/requests/", ""), None);
    }

    #[test]
    fn test_preflight_headers() {
        let resp = preflight_response();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(resp.headers().contains_key("Access-Control-Allow-Methods"));
    }
}
