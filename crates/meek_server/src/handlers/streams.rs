//! Stream management: register the video sources that stream tasks
//! reference.

use std::sync::Arc;

use axum::{extract::Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use meek_core::ports::StreamStore;
use meek_core::MeekError;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateStreamBody {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub group_ids: Vec<i64>,
}

pub async fn create(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<CreateStreamBody>,
) -> Result<Json<Value>, AppError> {
    if body.url.trim().is_empty() {
        return Err(MeekError::InvalidInput("stream url must not be empty".into()).into());
    }
    let stream = state.streams.insert(&body.name, &body.url, &body.group_ids).await?;
    Ok(Json(json!({
        "stream_id": stream.id,
        "name": stream.name,
        "url": stream.url,
        "status": stream.status.as_i16(),
    })))
}

pub async fn list(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, AppError> {
    let streams = state.streams.list().await?;
    let items: Vec<Value> = streams
        .iter()
        .map(|s| {
            json!({
                "stream_id": s.id,
                "name": s.name,
                "url": s.url,
                "status": s.status.as_i16(),
                "group_ids": s.group_ids,
            })
        })
        .collect();
    Ok(Json(json!({ "streams": items })))
}
