//! API routes.

pub mod health;
pub mod ingest;
pub mod monitor;
pub mod schedules;
pub mod tasks;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use engine_core::limits::MAX_INGEST_BODY_BYTES;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tasks", post(tasks::submit_handler))
        .route("/tasks/:id", get(tasks::result_handler))
        .route(
            "/schedules",
            get(schedules::list_handler).post(schedules::create_handler),
        )
        .route(
            "/schedules/:name",
            get(schedules::get_handler).put(schedules::update_handler),
        )
        .route("/schedules/:name/enable", post(schedules::enable_handler))
        .route("/schedules/:name/disable", post(schedules::disable_handler))
        .route(
            "/ingest",
            post(ingest::ingest_handler).layer(DefaultBodyLimit::max(MAX_INGEST_BODY_BYTES + 1)),
        )
        .route("/monitor", get(monitor::monitor_handler))
        .route("/health", get(health::health_handler))
        .route("/health/ready", get(health::ready_handler))
        .route("/health/live", get(health::live_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(cors),
        )
        .with_state(state)
}
