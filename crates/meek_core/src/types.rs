//! Core domain types for the meek control plane.
//! These are pure value types — no sqlx, no broker dependencies.

// Several enums intentionally use `from_i16()/from_str() -> Option<Self>`
// instead of `FromStr` because they return None for unknown values rather
// than an error.
#![allow(clippy::should_implement_trait)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = i64;
pub type SubTaskId = i64;
pub type NodeId = i64;
pub type StreamId = i64;
pub type ModelId = i64;
pub type GroupId = i64;

// ── Status enums ─────────────────────────────────────────────

/// Subtask lifecycle status. The parent task status is derived from these
/// (see [`StatusCounters::derive_task_status`]), using the same value space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    Pending,
    Running,
    Stopped,
    Completed,
    Error,
}

/// Task status shares the subtask value space; the alias keeps signatures
/// honest about which side of the derivation a value sits on.
pub type TaskStatus = SubTaskStatus;

impl SubTaskStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Stopped => 2,
            Self::Completed => 3,
            Self::Error => 4,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(Self::Pending),
            1 => Some(Self::Running),
            2 => Some(Self::Stopped),
            3 => Some(Self::Completed),
            4 => Some(Self::Error),
            _ => None,
        }
    }

    /// Terminal statuses are never flipped by `stop` or migration.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }
}

/// What kind of source a task analyses. Determines which source fields are
/// meaningful and how subtasks fan out on create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Image,
    Video,
    Stream,
}

impl AnalysisKind {
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::Image => 1,
            Self::Video => 2,
            Self::Stream => 3,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            1 => Some(Self::Image),
            2 => Some(Self::Video),
            3 => Some(Self::Stream),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Stream => "stream",
        }
    }
}

/// The worker-side algorithm family for a subtask.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AnalysisDetail {
    Detection,
    Segmentation,
    Tracking,
    Counting,
    Other(String),
}

impl AnalysisDetail {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Detection => "detection",
            Self::Segmentation => "segmentation",
            Self::Tracking => "tracking",
            Self::Counting => "counting",
            Self::Other(s) => s,
        }
    }

    /// Unknown detail kinds are carried through verbatim — the worker owns
    /// the algorithm namespace, the controller only routes it.
    pub fn from_str(s: &str) -> Self {
        match s {
            "detection" => Self::Detection,
            "segmentation" => Self::Segmentation,
            "tracking" => Self::Tracking,
            "counting" => Self::Counting,
            other => Self::Other(other.to_string()),
        }
    }
}

impl Serialize for AnalysisDetail {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AnalysisDetail {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from_str(&s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Offline,
    Online,
}

impl StreamStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::Offline => 0,
            Self::Online => 1,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(Self::Offline),
            1 => Some(Self::Online),
            _ => None,
        }
    }
}

// ── Entities ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub kind: AnalysisKind,
    /// Meaningful only for image / video kinds; stream kind references
    /// streams through the task↔stream association instead.
    pub image_urls: Vec<String>,
    pub video_urls: Vec<String>,
    pub config: serde_json::Value,
    pub save_result: bool,
    pub save_images: bool,
    pub analysis_interval: Option<i32>,
    pub status: TaskStatus,
    pub active_subtasks: i64,
    pub total_subtasks: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub kind: AnalysisKind,
    pub image_urls: Vec<String>,
    pub video_urls: Vec<String>,
    pub config: serde_json::Value,
    pub save_result: bool,
    pub save_images: bool,
    pub analysis_interval: Option<i32>,
    pub model_ids: Vec<ModelId>,
    pub stream_ids: Vec<StreamId>,
    pub total_subtasks: i64,
}

/// The source a single subtask analyses — exactly one variant per subtask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubTaskSource {
    ImageBatch { urls: Vec<String> },
    VideoBatch { urls: Vec<String> },
    LiveStream { stream_id: StreamId },
}

impl SubTaskSource {
    pub fn kind(&self) -> AnalysisKind {
        match self {
            Self::ImageBatch { .. } => AnalysisKind::Image,
            Self::VideoBatch { .. } => AnalysisKind::Video,
            Self::LiveStream { .. } => AnalysisKind::Stream,
        }
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Self::LiveStream { stream_id } => Some(*stream_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: SubTaskId,
    pub task_id: TaskId,
    pub kind: AnalysisKind,
    pub model_id: ModelId,
    pub source: SubTaskSource,
    pub config: serde_json::Value,
    pub detail: AnalysisDetail,
    pub status: SubTaskStatus,
    pub node_id: Option<NodeId>,
    /// Worker-side id. Opaque string: generated once at first dispatch and
    /// matched verbatim against replies/results, never parsed.
    pub analysis_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSubTask {
    pub task_id: TaskId,
    pub kind: AnalysisKind,
    pub model_id: ModelId,
    pub source: SubTaskSource,
    pub config: serde_json::Value,
    pub detail: AnalysisDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub mac_address: String,
    pub client_id: Option<String>,
    pub service_type: String,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub port: Option<i32>,
    pub version: Option<String>,
    pub status: NodeStatus,
    pub is_active: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub offline_at: Option<DateTime<Utc>>,
    /// Set when the node drops; cleared once the health tracker has moved
    /// or reset every subtask that was running there.
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

impl Node {
    pub fn task_count(&self) -> i32 {
        self.image_task_count + self.video_task_count + self.stream_task_count
    }

    pub fn kind_count(&self, kind: AnalysisKind) -> i32 {
        match kind {
            AnalysisKind::Image => self.image_task_count,
            AnalysisKind::Video => self.video_task_count,
            AnalysisKind::Stream => self.stream_task_count,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.max_tasks > 0 && self.task_count() < self.max_tasks
    }

    /// Eligible to receive new subtasks.
    pub fn is_dispatchable(&self) -> bool {
        self.status == NodeStatus::Online && self.is_active && self.has_capacity()
    }
}

/// Everything a connect message tells us about a node.
#[derive(Debug, Clone)]
pub struct NodeConnectInfo {
    pub mac_address: String,
    pub client_id: String,
    pub service_type: String,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub port: Option<i32>,
    pub version: Option<String>,
    pub max_tasks: Option<i32>,
    pub capabilities: serde_json::Value,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub gpu_usage: Option<f64>,
}

/// Fields a heartbeat may refresh. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct NodeHeartbeat {
    pub mac_address: String,
    pub client_id: Option<String>,
    pub service_type: Option<String>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub gpu_usage: Option<f64>,
    pub task_count: Option<i32>,
    pub max_tasks: Option<i32>,
    pub is_active: Option<bool>,
}

impl NodeHeartbeat {
    /// A heartbeat from an unknown MAC can synthesize a node record only
    /// when it carries enough identity to be useful later.
    pub fn can_synthesize_node(&self) -> bool {
        self.client_id.is_some() && self.service_type.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,
    pub name: String,
    pub url: String,
    pub status: StreamStatus,
    pub group_ids: Vec<GroupId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    pub code: String,
    pub name: String,
    pub version: Option<String>,
    pub class_count: i32,
    /// class index → class name
    pub classes: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewModel {
    pub code: String,
    pub name: String,
    pub version: Option<String>,
    pub class_count: i32,
    pub classes: serde_json::Value,
}

// ── Status counters ──────────────────────────────────────────

/// Per-task count of subtasks in each status. This is the cache-resident
/// fast path: the parent status is derived from it without rescanning
/// subtask rows, and the batched writer reconciles the SQL row from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounters(pub BTreeMap<i16, i64>);

impl StatusCounters {
    pub fn new() -> Self {
        let mut m = BTreeMap::new();
        for s in 0..5 {
            m.insert(s, 0);
        }
        Self(m)
    }

    pub fn from_statuses<'a, I: IntoIterator<Item = &'a SubTaskStatus>>(statuses: I) -> Self {
        let mut c = Self::new();
        for s in statuses {
            *c.0.entry(s.as_i16()).or_insert(0) += 1;
        }
        c
    }

    pub fn count(&self, status: SubTaskStatus) -> i64 {
        self.0.get(&status.as_i16()).copied().unwrap_or(0)
    }

    pub fn running(&self) -> i64 {
        self.count(SubTaskStatus::Running)
    }

    pub fn total(&self) -> i64 {
        self.0.values().sum()
    }

    /// Move one subtask from `old` to `new`. Counters never go negative:
    /// a stale old-status (e.g. after a cache wipe) decrements nothing.
    pub fn transition(&mut self, old: Option<SubTaskStatus>, new: SubTaskStatus) {
        if let Some(old) = old {
            let slot = self.0.entry(old.as_i16()).or_insert(0);
            *slot = (*slot - 1).max(0);
        }
        *self.0.entry(new.as_i16()).or_insert(0) += 1;
    }

    /// Derive the parent task status:
    /// any running → running; else any pending → pending; else all
    /// completed → completed; else all errored → error; else stopped.
    pub fn derive_task_status(&self) -> TaskStatus {
        let total = self.total();
        if self.count(SubTaskStatus::Running) > 0 {
            TaskStatus::Running
        } else if self.count(SubTaskStatus::Pending) > 0 {
            TaskStatus::Pending
        } else if total > 0 && self.count(SubTaskStatus::Completed) == total {
            TaskStatus::Completed
        } else if total > 0 && self.count(SubTaskStatus::Error) == total {
            TaskStatus::Error
        } else {
            TaskStatus::Stopped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for v in 0..5 {
            let s = SubTaskStatus::from_i16(v).unwrap();
            assert_eq!(s.as_i16(), v);
        }
        assert!(SubTaskStatus::from_i16(9).is_none());
    }

    #[test]
    fn test_derive_running_wins() {
        let mut c = StatusCounters::new();
        c.transition(None, SubTaskStatus::Running);
        c.transition(None, SubTaskStatus::Error);
        c.transition(None, SubTaskStatus::Completed);
        assert_eq!(c.derive_task_status(), TaskStatus::Running);
    }

    #[test]
    fn test_derive_pending_before_terminal() {
        let mut c = StatusCounters::new();
        c.transition(None, SubTaskStatus::Pending);
        c.transition(None, SubTaskStatus::Completed);
        assert_eq!(c.derive_task_status(), TaskStatus::Pending);
    }

    #[test]
    fn test_derive_all_completed() {
        let c = StatusCounters::from_statuses(&[SubTaskStatus::Completed, SubTaskStatus::Completed]);
        assert_eq!(c.derive_task_status(), TaskStatus::Completed);
    }

    #[test]
    fn test_derive_all_errored() {
        let c = StatusCounters::from_statuses(&[SubTaskStatus::Error]);
        assert_eq!(c.derive_task_status(), TaskStatus::Error);
    }

    #[test]
    fn test_derive_mixed_terminal_is_stopped() {
        let c = StatusCounters::from_statuses(&[
            SubTaskStatus::Completed,
            SubTaskStatus::Error,
            SubTaskStatus::Stopped,
        ]);
        assert_eq!(c.derive_task_status(), TaskStatus::Stopped);
    }

    #[test]
    fn test_transition_never_negative() {
        let mut c = StatusCounters::new();
        c.transition(Some(SubTaskStatus::Running), SubTaskStatus::Completed);
        assert_eq!(c.count(SubTaskStatus::Running), 0);
        assert_eq!(c.count(SubTaskStatus::Completed), 1);
    }

    #[test]
    fn test_transition_same_status_applied_twice_is_idempotent_upstream() {
        // The status manager skips no-op transitions; the counter itself
        // just records what it is told.
        let mut c = StatusCounters::from_statuses(&[SubTaskStatus::Running]);
        c.transition(Some(SubTaskStatus::Running), SubTaskStatus::Completed);
        assert_eq!(c.running(), 0);
        assert_eq!(c.count(SubTaskStatus::Completed), 1);
        assert_eq!(c.total(), 1);
    }

    #[test]
    fn test_node_capacity() {
        let node = node_fixture();
        assert!(node.has_capacity());
        assert_eq!(node.task_count(), 3);
        assert_eq!(node.kind_count(AnalysisKind::Stream), 2);
    }

    #[test]
    fn test_subtask_source_kind() {
        let s = SubTaskSource::LiveStream { stream_id: 42 };
        assert_eq!(s.kind(), AnalysisKind::Stream);
        assert_eq!(s.stream_id(), Some(42));
        let i = SubTaskSource::ImageBatch { urls: vec!["http://x/a.jpg".into()] };
        assert_eq!(i.kind(), AnalysisKind::Image);
        assert_eq!(i.stream_id(), None);
    }

    fn node_fixture() -> Node {
        Node {
            id: 1,
            mac_address: "AA:01".into(),
            client_id: Some("analysis-1".into()),
            service_type: "analysis".into(),
            hostname: None,
            ip: None,
            port: None,
            version: None,
            status: NodeStatus::Online,
            is_active: true,
            last_heartbeat: None,
            offline_at: None,
            needs_task_transfer: false,
            cpu_usage: Some(10.0),
            memory_usage: Some(20.0),
            gpu_usage: None,
            image_task_count: 1,
            video_task_count: 0,
            stream_task_count: 2,
            max_tasks: 4,
            weight: 1.0,
            capabilities: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
