//! GET /health — liveness plus a few gauges worth having on a dashboard.

use std::sync::Arc;

use axum::{extract::Extension, Json};
use meek_core::ports::CommandBus;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let queue = state.message_queue.stats();
    Json(json!({
        "status": "ok",
        "bus_connected": state.bus.is_connected(),
        "message_queue": {
            "depth": queue.depth,
            "enqueued": queue.enqueued,
            "dequeued": queue.dequeued,
            "dropped": queue.dropped,
        },
        "retry_queue_depth": state.retry_queue.len(),
    }))
}
