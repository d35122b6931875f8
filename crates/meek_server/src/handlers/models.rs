//! Model catalogue endpoints: list what is known, sync from the
//! marketplace.

use std::sync::Arc;

use axum::{extract::Extension, Json};
use serde_json::{json, Value};

use meek_core::ports::ModelStore;
use meek_core::MeekError;

use crate::error::AppError;
use crate::state::AppState;

pub async fn list(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, AppError> {
    let models = state.models.list().await?;
    let items: Vec<Value> = models
        .iter()
        .map(|m| {
            json!({
                "model_id": m.id,
                "code": m.code,
                "name": m.name,
                "version": m.version,
                "class_count": m.class_count,
            })
        })
        .collect();
    Ok(Json(json!({ "models": items })))
}

pub async fn sync(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, AppError> {
    let market = state
        .market
        .as_ref()
        .ok_or_else(|| MeekError::Unavailable("model marketplace is not configured".into()))?;
    let synced = market.sync(&state.models).await?;
    Ok(Json(json!({ "ok": true, "synced": synced })))
}
