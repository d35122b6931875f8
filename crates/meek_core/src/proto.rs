//! Wire protocol between the controller and analysis nodes.
//!
//! Every payload crosses the broker as JSON. Envelope shapes mirror the
//! command protocol the worker fleet speaks: a request on
//! `<prefix><MAC>/request_setting` names a `confirmation_topic`, and the
//! node answers there with a [`ReplyEnvelope`] carrying the same
//! `message_uuid`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{NodeConnectInfo, NodeHeartbeat};

pub const DEFAULT_TOPIC_PREFIX: &str = "meek/";

/// Stable marker written to a task's error field when the user stops it.
/// Migration must never resurrect subtasks of a task carrying this marker.
pub const USER_STOP_MARKER: &str = "任务由用户手动停止";

pub mod error_codes {
    pub const INVALID_PARAMS: &str = "ERR_001";
    pub const UNSUPPORTED_TYPE: &str = "ERR_002";
    pub const TASK_EXISTS: &str = "ERR_003";
    pub const TASK_NOT_FOUND: &str = "ERR_004";
}

// ── Topics ───────────────────────────────────────────────────

pub mod topics {
    pub fn connection(prefix: &str) -> String {
        format!("{prefix}connection")
    }

    pub fn status(prefix: &str, mac: &str) -> String {
        format!("{prefix}{mac}/status")
    }

    pub fn status_wildcard(prefix: &str) -> String {
        format!("{prefix}+/status")
    }

    pub fn request_setting(prefix: &str, mac: &str) -> String {
        format!("{prefix}{mac}/request_setting")
    }

    pub fn device_config_reply(prefix: &str) -> String {
        format!("{prefix}device_config_reply")
    }

    pub fn result(prefix: &str, mac: &str) -> String {
        format!("{prefix}{mac}/result")
    }

    pub fn result_wildcard(prefix: &str) -> String {
        format!("{prefix}+/result")
    }

    pub fn broadcast(prefix: &str) -> String {
        format!("{prefix}system/broadcast")
    }

    /// `<prefix><MAC>/status` and `<prefix><MAC>/result` carry the MAC as
    /// the second level; anything else yields None.
    pub fn mac_from_topic(prefix: &str, topic: &str) -> Option<String> {
        let rest = topic.strip_prefix(prefix)?;
        let mut parts = rest.split('/');
        let mac = parts.next()?;
        parts.next()?;
        if mac.is_empty() {
            None
        } else {
            Some(mac.to_string())
        }
    }
}

/// Fresh correlation uuid for a request envelope. Short form, hyphens
/// stripped, matching what the node fleet echoes back.
pub fn new_message_uuid() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

pub fn now_message_id() -> i64 {
    Utc::now().timestamp()
}

// ── Connection / heartbeat ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub memory: Option<f64>,
    #[serde(default)]
    pub gpu: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<i32>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub max_tasks: Option<i32>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default)]
    pub resources: Option<ResourceSnapshot>,
}

/// Retained message on `<prefix>connection`; the node's last-will publishes
/// the offline form so an ungraceful drop still lands here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMessage {
    pub status: ConnectionStatus,
    pub mac_address: String,
    pub client_id: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub metadata: ConnectionMetadata,
}

fn default_service_type() -> String {
    "analysis".into()
}

impl ConnectionMessage {
    pub fn online(mac: &str, client_id: &str, service_type: &str) -> Self {
        Self {
            status: ConnectionStatus::Online,
            mac_address: mac.into(),
            client_id: client_id.into(),
            service_type: service_type.into(),
            timestamp: Some(Utc::now().timestamp()),
            metadata: ConnectionMetadata::default(),
        }
    }

    pub fn offline(mac: &str, client_id: &str, service_type: &str) -> Self {
        Self {
            status: ConnectionStatus::Offline,
            mac_address: mac.into(),
            client_id: client_id.into(),
            service_type: service_type.into(),
            timestamp: Some(Utc::now().timestamp()),
            metadata: ConnectionMetadata::default(),
        }
    }

    pub fn connect_info(&self) -> NodeConnectInfo {
        let resources = self.metadata.resources.clone().unwrap_or_default();
        NodeConnectInfo {
            mac_address: self.mac_address.clone(),
            client_id: self.client_id.clone(),
            service_type: self.service_type.clone(),
            hostname: self.metadata.hostname.clone(),
            ip: self.metadata.ip.clone(),
            port: self.metadata.port,
            version: self.metadata.version.clone(),
            max_tasks: self.metadata.max_tasks,
            capabilities: self.metadata.capabilities.clone(),
            cpu_usage: resources.cpu,
            memory_usage: resources.memory,
            gpu_usage: resources.gpu,
        }
    }
}

/// Periodic heartbeat on `<prefix><MAC>/status` (`type: "heartbeat"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub mac_address: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub cpu_usage: Option<f64>,
    #[serde(default)]
    pub memory_usage: Option<f64>,
    #[serde(default)]
    pub gpu_usage: Option<f64>,
    #[serde(default)]
    pub task_count: Option<i32>,
    #[serde(default)]
    pub max_tasks: Option<i32>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl HeartbeatMessage {
    pub fn heartbeat_update(&self) -> NodeHeartbeat {
        NodeHeartbeat {
            mac_address: self.mac_address.clone(),
            client_id: self.client_id.clone(),
            service_type: self.service_type.clone(),
            cpu_usage: self.cpu_usage,
            memory_usage: self.memory_usage,
            gpu_usage: self.gpu_usage,
            task_count: self.task_count,
            max_tasks: self.max_tasks,
            is_active: self.is_active,
        }
    }
}

// ── Command envelopes ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    TaskCmd,
    NodeCmd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmdType {
    StartTask,
    StopTask,
    SyncTime,
    UpdateConfig,
}

/// The `source` block of a start command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultConfig {
    pub save_result: bool,
    pub save_images: bool,
    pub callback_topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandData {
    pub cmd_type: CmdType,
    pub task_id: String,
    pub subtask_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_config: Option<ResultConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub confirmation_topic: String,
    pub message_id: i64,
    pub message_uuid: String,
    pub request_type: RequestType,
    pub data: CommandData,
}

impl RequestEnvelope {
    pub fn task_cmd(prefix: &str, data: CommandData) -> Self {
        Self {
            confirmation_topic: topics::device_config_reply(prefix),
            message_id: now_message_id(),
            message_uuid: new_message_uuid(),
            request_type: RequestType::TaskCmd,
            data,
        }
    }
}

// ── Replies ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyData {
    #[serde(default)]
    pub cmd_type: Option<CmdType>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub subtask_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    #[serde(default)]
    pub message_id: Option<i64>,
    pub message_uuid: String,
    #[serde(default)]
    pub response_type: Option<String>,
    pub status: ReplyStatus,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub data: ReplyData,
}

// ── Results ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Workers differ on the wording for in-flight frames.
    #[serde(alias = "running", alias = "success")]
    Processing,
    Completed,
    Failed,
}

/// Result / progress message on `<prefix><MAC>/result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub task_id: String,
    pub subtask_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub status_code: Option<i32>,
    #[serde(default)]
    pub results: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub frame_count: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_builders() {
        assert_eq!(topics::connection("meek/"), "meek/connection");
        assert_eq!(topics::request_setting("meek/", "AA:01"), "meek/AA:01/request_setting");
        assert_eq!(topics::result_wildcard("meek/"), "meek/+/result");
        assert_eq!(topics::device_config_reply("meek/"), "meek/device_config_reply");
    }

    #[test]
    fn test_mac_from_topic() {
        assert_eq!(
            topics::mac_from_topic("meek/", "meek/AA:01/result").as_deref(),
            Some("AA:01")
        );
        assert_eq!(
            topics::mac_from_topic("meek/", "meek/BB:02/status").as_deref(),
            Some("BB:02")
        );
        assert_eq!(topics::mac_from_topic("meek/", "meek/connection"), None);
        assert_eq!(topics::mac_from_topic("meek/", "other/AA:01/result"), None);
    }

    #[test]
    fn test_message_uuid_shape() {
        let u = new_message_uuid();
        assert_eq!(u.len(), 16);
        assert!(!u.contains('-'));
    }

    #[test]
    fn test_request_envelope_serializes_snake_case() {
        let env = RequestEnvelope::task_cmd(
            "meek/",
            CommandData {
                cmd_type: CmdType::StartTask,
                task_id: "7".into(),
                subtask_id: "12".into(),
                source: Some(SourceSpec { kind: "stream".into(), urls: vec!["rtsp://cam".into()] }),
                config: Some(serde_json::json!({"model_code": "yolo-v8"})),
                result_config: Some(ResultConfig {
                    save_result: false,
                    save_images: false,
                    callback_topic: "meek/AA:01/result".into(),
                }),
            },
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["request_type"], "task_cmd");
        assert_eq!(v["data"]["cmd_type"], "start_task");
        assert_eq!(v["data"]["source"]["type"], "stream");
        assert_eq!(v["confirmation_topic"], "meek/device_config_reply");
    }

    #[test]
    fn test_result_status_aliases() {
        let m: ResultMessage = serde_json::from_value(serde_json::json!({
            "task_id": "1", "subtask_id": "2", "status": "running"
        }))
        .unwrap();
        assert_eq!(m.status, ResultStatus::Processing);
        let m: ResultMessage = serde_json::from_value(serde_json::json!({
            "task_id": "1", "subtask_id": "2", "status": "completed", "status_code": 200
        }))
        .unwrap();
        assert_eq!(m.status, ResultStatus::Completed);
    }

    #[test]
    fn test_connection_message_tolerates_missing_metadata() {
        let m: ConnectionMessage = serde_json::from_value(serde_json::json!({
            "status": "online", "mac_address": "AA:01", "client_id": "node-1"
        }))
        .unwrap();
        assert_eq!(m.status, ConnectionStatus::Online);
        assert_eq!(m.service_type, "analysis");
        assert!(m.metadata.max_tasks.is_none());
    }
}
