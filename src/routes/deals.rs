use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{error, info};

use crate::errors::AppError;
use crate::models::DealRecord;
use crate::routes::DateQuery;
use crate::state::AppState;

const DEFAULT_ORIGIN_LIMIT: usize = 20;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/route/:origin/:destination", get(get_route_deals))
        .route("/origin/:origin", get(get_origin_deals))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

pub async fn get_route_deals(
    Path((origin, destination)): Path<(String, String)>,
    Query(dates): Query<DateQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<DealRecord>>, AppError> {
    info!("GET /deals/route/{}/{} - Finding route deals", origin, destination);
    let dates = dates.to_range(state.search_window_days)?;
    let deals = state
        .deal_service
        .find_deals_for_route(&origin, &destination, dates)
        .await
        .map_err(|e| {
            error!("Failed to find deals for {}-{}: {}", origin, destination, e);
            e
        })?;
    Ok(Json(deals))
}

pub async fn get_origin_deals(
    Path(origin): Path<String>,
    Query(query): Query<LimitQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<DealRecord>>, AppError> {
    info!("GET /deals/origin/{} - Listing deals", origin);
    let deals = state
        .deal_service
        .find_deals_from_origin(&origin, query.limit.unwrap_or(DEFAULT_ORIGIN_LIMIT))
        .await
        .map_err(|e| {
            error!("Failed to list deals from {}: {}", origin, e);
            e
        })?;
    Ok(Json(deals))
}
