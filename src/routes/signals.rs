use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{error, info};

use crate::errors::AppError;
use crate::routes::DateQuery;
use crate::services::deal_service::SignalOutcome;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(signal_search))
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub identity: String,
    pub origin: String,
    pub destination: String,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

/// Quota-gated fresh search. Exhausted callers get 402 with the outcome body.
pub async fn signal_search(
    State(state): State<AppState>,
    Json(request): Json<SignalRequest>,
) -> Result<(StatusCode, Json<SignalOutcome>), AppError> {
    info!("POST /signals - {} searching {}-{}", request.identity, request.origin, request.destination);
    let dates = DateQuery { from: request.from, to: request.to }.to_range(state.search_window_days)?;

    let outcome = state
        .deal_service
        .signal_search(&request.identity, &request.origin, &request.destination, dates)
        .await
        .map_err(|e| {
            error!("Signal search failed for {}: {}", request.identity, e);
            e
        })?;

    let status = match outcome {
        SignalOutcome::Deals { .. } => StatusCode::OK,
        SignalOutcome::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
    };
    Ok((status, Json(outcome)))
}
