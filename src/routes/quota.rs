use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use crate::errors::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:identity", get(get_remaining))
        .route("/:identity/consume", post(consume))
}

#[derive(Debug, Serialize)]
pub struct QuotaResponse {
    pub identity: String,
    pub remaining: u32,
}

pub async fn get_remaining(
    Path(identity): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<QuotaResponse>, AppError> {
    info!("GET /quota/{} - Remaining free signals", identity);
    let remaining = state.deal_service.get_remaining_free_signals(&identity).await?;
    Ok(Json(QuotaResponse { identity, remaining }))
}

#[derive(Debug, Serialize)]
pub struct ConsumeResponse {
    pub identity: String,
    pub consumed: u32,
}

pub async fn consume(
    Path(identity): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ConsumeResponse>, AppError> {
    info!("POST /quota/{}/consume - Consuming a free signal", identity);
    let consumed = state.deal_service.consume_free_signal(&identity).await?;
    Ok(Json(ConsumeResponse { identity, consumed }))
}
