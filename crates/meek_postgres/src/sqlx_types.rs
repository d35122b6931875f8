//! Row structs bridging Postgres rows to the pure domain types.
//! All SQL is runtime-checked (`sqlx::query_as`, not the macros) so the
//! crate builds without a live database.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use meek_core::types::*;

fn urls_from_json(v: &serde_json::Value) -> Vec<String> {
    v.as_array()
        .map(|a| {
            a.iter()
                .filter_map(|u| u.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn urls_to_json(urls: &[String]) -> serde_json::Value {
    serde_json::Value::Array(urls.iter().map(|u| serde_json::Value::String(u.clone())).collect())
}

#[derive(FromRow)]
pub struct PgTaskRow {
    pub id: i64,
    pub name: String,
    pub analysis_type: i16,
    pub image_urls: serde_json::Value,
    pub video_urls: serde_json::Value,
    pub config: serde_json::Value,
    pub save_result: bool,
    pub save_images: bool,
    pub analysis_interval: Option<i32>,
    pub status: i16,
    pub active_subtasks: i64,
    pub total_subtasks: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<PgTaskRow> for Task {
    type Error = String;

    fn try_from(r: PgTaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: r.id,
            name: r.name,
            kind: AnalysisKind::from_i16(r.analysis_type)
                .ok_or_else(|| format!("task {} has unknown analysis_type {}", r.id, r.analysis_type))?,
            image_urls: urls_from_json(&r.image_urls),
            video_urls: urls_from_json(&r.video_urls),
            config: r.config,
            save_result: r.save_result,
            save_images: r.save_images,
            analysis_interval: r.analysis_interval,
            status: SubTaskStatus::from_i16(r.status)
                .ok_or_else(|| format!("task {} has unknown status {}", r.id, r.status))?,
            active_subtasks: r.active_subtasks,
            total_subtasks: r.total_subtasks,
            error_message: r.error_message,
            created_at: r.created_at,
            updated_at: r.updated_at,
            started_at: r.started_at,
            stopped_at: r.stopped_at,
            completed_at: r.completed_at,
        })
    }
}

#[derive(FromRow)]
pub struct PgSubTaskRow {
    pub id: i64,
    pub task_id: i64,
    pub analysis_type: i16,
    pub model_id: i64,
    pub stream_id: Option<i64>,
    pub source_urls: serde_json::Value,
    pub config: serde_json::Value,
    pub analysis_detail: String,
    pub status: i16,
    pub node_id: Option<i64>,
    pub analysis_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PgSubTaskRow> for SubTask {
    type Error = String;

    fn try_from(r: PgSubTaskRow) -> Result<Self, Self::Error> {
        let kind = AnalysisKind::from_i16(r.analysis_type)
            .ok_or_else(|| format!("subtask {} has unknown analysis_type {}", r.id, r.analysis_type))?;
        let source = match kind {
            AnalysisKind::Stream => SubTaskSource::LiveStream {
                stream_id: r
                    .stream_id
                    .ok_or_else(|| format!("stream subtask {} misses stream_id", r.id))?,
            },
            AnalysisKind::Image => SubTaskSource::ImageBatch { urls: urls_from_json(&r.source_urls) },
            AnalysisKind::Video => SubTaskSource::VideoBatch { urls: urls_from_json(&r.source_urls) },
        };
        Ok(SubTask {
            id: r.id,
            task_id: r.task_id,
            kind,
            model_id: r.model_id,
            source,
            config: r.config,
            detail: AnalysisDetail::from_str(&r.analysis_detail),
            status: SubTaskStatus::from_i16(r.status)
                .ok_or_else(|| format!("subtask {} has unknown status {}", r.id, r.status))?,
            node_id: r.node_id,
            analysis_id: r.analysis_id,
            started_at: r.started_at,
            completed_at: r.completed_at,
            error_message: r.error_message,
            retry_count: r.retry_count,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
pub struct PgNodeRow {
    pub id: i64,
    pub mac_address: String,
    pub client_id: Option<String>,
    pub service_type: String,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub port: Option<i32>,
    pub version: Option<String>,
    pub status: String,
    pub is_active: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub offline_at: Option<DateTime<Utc>>,
    pub needs_task_transfer: bool,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub gpu_usage: Option<f64>,
    pub image_task_count: i32,
    pub video_task_count: i32,
    pub stream_task_count: i32,
    pub max_tasks: i32,
    pub weight: f64,
    pub capabilities: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PgNodeRow> for Node {
    type Error = String;

    fn try_from(r: PgNodeRow) -> Result<Self, Self::Error> {
        Ok(Node {
            id: r.id,
            status: NodeStatus::from_str(&r.status)
                .ok_or_else(|| format!("node {} has unknown status {}", r.id, r.status))?,
            mac_address: r.mac_address,
            client_id: r.client_id,
            service_type: r.service_type,
            hostname: r.hostname,
            ip: r.ip,
            port: r.port,
            version: r.version,
            is_active: r.is_active,
            last_heartbeat: r.last_heartbeat,
            offline_at: r.offline_at,
            needs_task_transfer: r.needs_task_transfer,
            cpu_usage: r.cpu_usage,
            memory_usage: r.memory_usage,
            gpu_usage: r.gpu_usage,
            image_task_count: r.image_task_count,
            video_task_count: r.video_task_count,
            stream_task_count: r.stream_task_count,
            max_tasks: r.max_tasks,
            weight: r.weight,
            capabilities: r.capabilities,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
pub struct PgStreamRow {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub status: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PgStreamRow {
    pub fn into_stream(self, group_ids: Vec<i64>) -> Result<Stream, String> {
        Ok(Stream {
            id: self.id,
            name: self.name,
            url: self.url,
            status: StreamStatus::from_i16(self.status)
                .ok_or_else(|| format!("stream {} has unknown status {}", self.id, self.status))?,
            group_ids,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
pub struct PgModelRow {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub version: Option<String>,
    pub class_count: i32,
    pub classes: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<PgModelRow> for Model {
    fn from(r: PgModelRow) -> Self {
        Model {
            id: r.id,
            code: r.code,
            name: r.name,
            version: r.version,
            class_count: r.class_count,
            classes: r.classes,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}
