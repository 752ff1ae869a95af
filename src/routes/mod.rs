pub mod health;
pub mod metrics;
pub mod predictions;

use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// API routes without the metrics endpoint, which carries its own state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/predictions", post(predictions::submit_prediction))
        .route("/api/v1/predictions/{job_id}", get(predictions::get_prediction))
        .with_state(state)
}
