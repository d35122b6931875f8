//! Port traits — implemented by meek_postgres / meek_redis / meek_mqtt.
//! Core logic depends only on these traits, never on sqlx, redis, or
//! rumqttc directly. `MemoryStores` implements all of them for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MeekError;
use crate::retry::RetryEntry;
use crate::types::*;

pub type Result<T> = std::result::Result<T, MeekError>;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert the task row plus its model / stream associations.
    async fn insert(&self, new: NewTask) -> Result<Task>;
    async fn get(&self, id: TaskId) -> Result<Option<Task>>;
    async fn list(&self) -> Result<Vec<Task>>;

    /// Set the task status directly (lifecycle verbs). The adapter stamps
    /// the matching timestamp column (started/stopped/completed) and
    /// replaces the error message with the given value.
    async fn set_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// One transaction per task: write every touched subtask status as an
    /// absolute value, then reconcile the parent row (derived status,
    /// active/total counts, timestamps). At-least-once safe.
    async fn apply_status_batch(
        &self,
        id: TaskId,
        subtask_updates: &[(SubTaskId, SubTaskStatus)],
        derived: TaskStatus,
        active: i64,
        total: i64,
    ) -> Result<()>;

    async fn delete(&self, id: TaskId) -> Result<()>;

    async fn model_ids(&self, id: TaskId) -> Result<Vec<ModelId>>;
    async fn stream_ids(&self, id: TaskId) -> Result<Vec<StreamId>>;

    /// Distinct stream ids referenced by at least one running task; the
    /// stream monitor probes exactly these.
    async fn running_task_stream_ids(&self) -> Result<Vec<StreamId>>;
}

#[async_trait]
pub trait SubTaskStore: Send + Sync {
    async fn insert_many(&self, new: Vec<NewSubTask>) -> Result<Vec<SubTask>>;
    async fn get(&self, id: SubTaskId) -> Result<Option<SubTask>>;
    async fn list_for_task(&self, task_id: TaskId) -> Result<Vec<SubTask>>;
    async fn list_for_task_with_status(
        &self,
        task_id: TaskId,
        status: SubTaskStatus,
    ) -> Result<Vec<SubTask>>;
    async fn list_pending(&self, limit: i64) -> Result<Vec<SubTask>>;
    async fn list_running_on_node(&self, node_id: NodeId) -> Result<Vec<SubTask>>;

    /// Lookup by the worker-side id, matched verbatim.
    async fn find_by_analysis_id(
        &self,
        task_id: TaskId,
        analysis_id: &str,
    ) -> Result<Option<SubTask>>;

    /// Record a dispatch: assigned node, worker-side id, started-at.
    async fn mark_dispatched(
        &self,
        id: SubTaskId,
        node_id: NodeId,
        analysis_id: &str,
    ) -> Result<()>;

    /// Migration: move a still-running subtask to a new node.
    async fn reassign_node(&self, id: SubTaskId, node_id: NodeId, note: &str) -> Result<()>;

    /// Back to pending: clear node, worker-side id and started-at, record
    /// why in the error field.
    async fn reset_to_pending(&self, id: SubTaskId, note: &str) -> Result<()>;

    async fn set_error(&self, id: SubTaskId, message: &str) -> Result<()>;
    async fn set_completed_at(&self, id: SubTaskId, at: DateTime<Utc>) -> Result<()>;
    async fn increment_retry(&self, id: SubTaskId) -> Result<i32>;

    /// Delete all subtasks of a task, returning the ids removed so the
    /// caller can clear cache entries.
    async fn delete_for_task(&self, task_id: TaskId) -> Result<Vec<SubTaskId>>;
}

#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Upsert on a connect message. A changed client id means the worker
    /// restarted: per-kind task counters reset to zero.
    async fn upsert_online(&self, info: NodeConnectInfo) -> Result<Node>;
    async fn get(&self, id: NodeId) -> Result<Option<Node>>;
    async fn get_by_mac(&self, mac: &str) -> Result<Option<Node>>;
    async fn list(&self) -> Result<Vec<Node>>;
    async fn list_online(&self) -> Result<Vec<Node>>;

    /// Flip to offline, stamp offline-at, set the transfer flag. Running
    /// subtask rows are untouched here — migration is the health tracker's
    /// job.
    async fn mark_offline(&self, id: NodeId) -> Result<()>;
    async fn clear_transfer_flag(&self, id: NodeId) -> Result<()>;

    /// Refresh gauges / counters / last-heartbeat. Returns the node, or
    /// None when the MAC is unknown and the heartbeat cannot synthesize a
    /// record.
    async fn record_heartbeat(&self, hb: NodeHeartbeat) -> Result<Option<Node>>;

    async fn adjust_kind_count(&self, id: NodeId, kind: AnalysisKind, delta: i32) -> Result<()>;

    /// Online nodes whose last heartbeat is older than the cutoff.
    async fn stale_online(&self, cutoff: DateTime<Utc>) -> Result<Vec<Node>>;

    /// Offline nodes still flagged as needing task transfer.
    async fn transfer_pending(&self) -> Result<Vec<Node>>;
}

#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn insert(&self, name: &str, url: &str, group_ids: &[GroupId]) -> Result<Stream>;
    async fn get(&self, id: StreamId) -> Result<Option<Stream>>;
    async fn get_many(&self, ids: &[StreamId]) -> Result<Vec<Stream>>;
    async fn list(&self) -> Result<Vec<Stream>>;
    async fn set_status(&self, id: StreamId, status: StreamStatus) -> Result<()>;
}

#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn upsert_by_code(&self, model: NewModel) -> Result<Model>;
    async fn get(&self, id: ModelId) -> Result<Option<Model>>;
    async fn get_many(&self, ids: &[ModelId]) -> Result<Vec<Model>>;
    async fn list(&self) -> Result<Vec<Model>>;
}

/// Hot-path cache: per-task status counters, per-subtask status mirror and
/// the retry queue snapshot. Reads never block on SQL.
#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn get_counters(&self, task_id: TaskId) -> Result<Option<StatusCounters>>;
    async fn set_counters(&self, task_id: TaskId, counters: &StatusCounters) -> Result<()>;
    async fn get_subtask_status(&self, id: SubTaskId) -> Result<Option<SubTaskStatus>>;
    async fn set_subtask_status(&self, id: SubTaskId, status: SubTaskStatus) -> Result<()>;

    /// Drop every cache trace of a deleted task.
    async fn forget_task(&self, task_id: TaskId, subtask_ids: &[SubTaskId]) -> Result<()>;

    async fn save_retry_snapshot(&self, entries: &[RetryEntry]) -> Result<()>;
    async fn load_retry_snapshot(&self) -> Result<Vec<RetryEntry>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Outbound half of the broker connection. Publish fails with
/// `MeekError::Transport` while disconnected — queueing for later is the
/// retry queue's job, not this port's.
#[async_trait]
pub trait CommandBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        qos: QosLevel,
        retain: bool,
    ) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Opens a stream URL and reports whether it currently serves media.
#[async_trait]
pub trait StreamProber: Send + Sync {
    async fn probe(&self, url: &str) -> bool;
}

/// Persists worker result blobs for tasks created with `save_result`.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn persist(
        &self,
        task_id: TaskId,
        subtask_id: SubTaskId,
        results: &serde_json::Value,
    ) -> Result<()>;
}
