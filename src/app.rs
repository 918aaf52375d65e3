use axum::Router;
use tower_http::cors::CorsLayer;

use crate::routes::{deals, health, prices, quota, signals};
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    Router::<AppState>::new()
        .nest("/health", health::router())
        .nest("/api/deals", deals::router())
        .nest("/api/prices", prices::router())
        .nest("/api/quota", quota::router())
        .nest("/api/signals", signals::router())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
