//! Node admin surface: registry snapshots for operators.

use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use meek_core::proto::CmdType;
use meek_core::types::Node;
use meek_core::MeekError;

use crate::error::AppError;
use crate::state::AppState;

fn node_view(n: &Node) -> Value {
    json!({
        "node_id": n.id,
        "mac_address": n.mac_address,
        "client_id": n.client_id,
        "service_type": n.service_type,
        "hostname": n.hostname,
        "ip": n.ip,
        "port": n.port,
        "version": n.version,
        "status": n.status,
        "is_active": n.is_active,
        "last_heartbeat": n.last_heartbeat,
        "cpu_usage": n.cpu_usage,
        "memory_usage": n.memory_usage,
        "gpu_usage": n.gpu_usage,
        "task_counts": {
            "image": n.image_task_count,
            "video": n.video_task_count,
            "stream": n.stream_task_count,
            "total": n.task_count(),
        },
        "max_tasks": n.max_tasks,
        "weight": n.weight,
    })
}

pub async fn list(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, AppError> {
    let nodes = state.registry.all_nodes().await?;
    let mut views: Vec<Value> = nodes.iter().map(node_view).collect();
    views.sort_by_key(|v| v["node_id"].as_i64());
    Ok(Json(json!({ "nodes": views })))
}

pub async fn get(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let node = state
        .registry
        .get(id)
        .await?
        .ok_or_else(|| MeekError::NotFound(format!("node {id}")))?;
    Ok(Json(node_view(&node)))
}

#[derive(Deserialize)]
pub struct NodeCommandBody {
    pub cmd_type: String,
    #[serde(default)]
    pub config: Option<Value>,
}

/// POST /nodes/:id/command — node-level commands (time sync, config push).
pub async fn command(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<NodeCommandBody>,
) -> Result<Json<Value>, AppError> {
    let cmd = match body.cmd_type.as_str() {
        "sync_time" => CmdType::SyncTime,
        "update_config" => CmdType::UpdateConfig,
        other => {
            return Err(
                MeekError::InvalidInput(format!("unsupported node command {other}")).into()
            )
        }
    };
    let node = state
        .registry
        .get(id)
        .await?
        .ok_or_else(|| MeekError::NotFound(format!("node {id}")))?;
    let message_uuid = state
        .dispatcher
        .send_node_command(&node.mac_address, cmd, body.config)
        .await?;
    Ok(Json(json!({ "ok": true, "message_uuid": message_uuid })))
}

#[derive(Deserialize)]
pub struct BroadcastBody {
    pub message: Value,
}

/// POST /system/broadcast — controller-wide announcement to every node.
pub async fn broadcast(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<BroadcastBody>,
) -> Result<Json<Value>, AppError> {
    state.dispatcher.broadcast(body.message).await?;
    Ok(Json(json!({ "ok": true })))
}
