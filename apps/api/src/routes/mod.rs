pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::feedback::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/feedback/submit", post(handlers::handle_submit))
        .route("/api/feedback/statistics", get(handlers::handle_statistics))
        .route("/api/feedback/search", get(handlers::handle_search))
        .route(
            "/api/feedback/high-quality",
            get(handlers::handle_high_quality),
        )
        .route("/api/feedback/export-csv", get(handlers::handle_export_csv))
        .route("/api/feedback/rebuild", post(handlers::handle_rebuild))
        .with_state(state)
}
