//! POST /callback — HTTP fallback for worker-emitted result payloads.
//! Same shape as the broker result topic, same ingestion path.

use std::sync::Arc;

use axum::{extract::Extension, Json};
use serde_json::{json, Value};

use meek_core::proto::ResultMessage;
use meek_core::MeekError;

use crate::error::AppError;
use crate::state::AppState;

pub async fn callback(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let msg: ResultMessage = serde_json::from_value(payload)
        .map_err(|e| MeekError::InvalidInput(format!("malformed callback payload: {e}")))?;
    state.ingester.handle_result(&msg).await?;
    Ok(Json(json!({ "ok": true })))
}
