use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{error, info};

use crate::errors::AppError;
use crate::models::{RecordPriceRequest, RouteHistory};
use crate::state::AppState;

const DEFAULT_CURRENCY: &str = "GBP";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(record_price))
        .route("/:origin/:destination", get(get_history))
}

pub async fn record_price(
    State(state): State<AppState>,
    Json(request): Json<RecordPriceRequest>,
) -> Result<(StatusCode, Json<RouteHistory>), AppError> {
    info!("POST /prices - Recording {} for {}-{}", request.price, request.origin, request.destination);
    let history = state
        .deal_service
        .record_observed_price(
            &request.origin,
            &request.destination,
            request.price,
            request.departure_date,
            request.currency.as_deref().unwrap_or(DEFAULT_CURRENCY),
        )
        .await
        .map_err(|e| {
            error!("Failed to record price for {}-{}: {}", request.origin, request.destination, e);
            e
        })?;
    Ok((StatusCode::CREATED, Json(history)))
}

pub async fn get_history(
    Path((origin, destination)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<RouteHistory>, AppError> {
    info!("GET /prices/{}/{} - Getting route history", origin, destination);
    state
        .deal_service
        .route_history(&origin, &destination)?
        .map(Json)
        .ok_or(AppError::NotFound)
}
