//! Task lifecycle endpoints. Status values cross the API as their numeric
//! codes (0 pending … 4 error), matching what the worker fleet reports.

use std::sync::Arc;

use axum::{extract::Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use meek_core::service::CreateTaskRequest;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct TaskIdBody {
    pub task_id: i64,
}

pub async fn create(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<Value>, AppError> {
    let task = state.service.create_task(req).await?;
    Ok(Json(json!({ "task_id": task.id })))
}

pub async fn start(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<TaskIdBody>,
) -> Result<Json<Value>, AppError> {
    let report = state.service.start_task(body.task_id).await?;
    Ok(Json(json!({
        "task_id": report.task_id,
        "status": report.status.as_i16(),
        "dispatched": report.dispatched,
        "queued": report.queued,
    })))
}

pub async fn stop(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<TaskIdBody>,
) -> Result<Json<Value>, AppError> {
    let status = state.service.stop_task(body.task_id).await?;
    Ok(Json(json!({ "task_id": body.task_id, "status": status.as_i16() })))
}

pub async fn delete(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<TaskIdBody>,
) -> Result<Json<Value>, AppError> {
    state.service.delete_task(body.task_id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn status(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<TaskIdBody>,
) -> Result<Json<Value>, AppError> {
    let report = state.service.task_status(body.task_id).await?;
    let subtask_errors: Vec<Value> = report
        .subtask_errors
        .iter()
        .map(|e| {
            json!({
                "subtask_id": e.subtask_id,
                "status": e.status.as_i16(),
                "error": e.error,
            })
        })
        .collect();
    Ok(Json(json!({
        "task_id": report.view.task_id,
        "status": report.view.status.as_i16(),
        "counters": report.view.counters,
        "active": report.view.active,
        "total": report.view.total,
        "error_message": report.error_message,
        "subtask_errors": subtask_errors,
    })))
}

pub async fn list(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, AppError> {
    let tasks = state.service.list_tasks().await?;
    let items: Vec<Value> = tasks
        .iter()
        .map(|t| {
            json!({
                "task_id": t.id,
                "name": t.name,
                "analysis_type": t.kind.as_i16(),
                "status": t.status.as_i16(),
                "active": t.active_subtasks,
                "total": t.total_subtasks,
                "error_message": t.error_message,
            })
        })
        .collect();
    Ok(Json(json!({ "tasks": items })))
}
