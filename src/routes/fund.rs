//! Fund pool statistics route

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::{internal_error, json_response};
use crate::server::AppState;
use crate::types::format_minor_units;

/// String-decimal view of the pool; integers never cross the surface
#[derive(Serialize)]
struct FundStatsView {
    total_deposited: String,
    total_escrowed: String,
    total_paid_out: String,
    available_balance: String,
}

/// GET /api/fund/stats
pub async fn handle_fund_stats(state: &std::sync::Arc<AppState>) -> Response<Full<Bytes>> {
    match state.ledger.get_pool_stats().await {
        Ok(stats) => json_response(
            StatusCode::OK,
            &FundStatsView {
                total_deposited: format_minor_units(stats.total_deposited),
                total_escrowed: format_minor_units(stats.total_escrowed),
                total_paid_out: format_minor_units(stats.total_paid_out),
                available_balance: format_minor_units(stats.available_balance),
            },
        ),
        Err(e) => internal_error(state, "pool stats unavailable", e),
    }
}
