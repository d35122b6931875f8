//! HTTP router construction.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the full axum router with all routes and shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tasks/create", post(handlers::tasks::create))
        .route("/tasks/start", post(handlers::tasks::start))
        .route("/tasks/stop", post(handlers::tasks::stop))
        .route("/tasks/delete", post(handlers::tasks::delete))
        .route("/tasks/status", post(handlers::tasks::status))
        .route("/tasks", get(handlers::tasks::list))
        .route("/callback", post(handlers::callback::callback))
        .route("/nodes", get(handlers::nodes::list))
        .route("/nodes/:id", get(handlers::nodes::get))
        .route("/nodes/:id/command", post(handlers::nodes::command))
        .route("/system/broadcast", post(handlers::nodes::broadcast))
        .route("/streams/create", post(handlers::streams::create))
        .route("/streams", get(handlers::streams::list))
        .route("/models", get(handlers::models::list))
        .route("/models/sync", post(handlers::models::sync))
        .route("/health", get(handlers::health::health))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
