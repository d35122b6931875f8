//! meek_redis — Redis implementation of the `StatusCache` port.
//!
//! Key layout mirrors what the rest of the system expects:
//!   `task:status:<task_id>`    — JSON map of status value → count
//!   `subtask:status:<id>`      — status value as a decimal string
//!   `task_retry_queue`         — JSON array of retry entries

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use meek_core::error::MeekError;
use meek_core::ports::{Result, StatusCache};
use meek_core::retry::RetryEntry;
use meek_core::types::{StatusCounters, SubTaskId, SubTaskStatus, TaskId};

const TASK_STATUS_PREFIX: &str = "task:status:";
const SUBTASK_STATUS_PREFIX: &str = "subtask:status:";
const RETRY_QUEUE_KEY: &str = "task_retry_queue";

pub struct RedisStatusCache {
    conn: ConnectionManager,
}

impl RedisStatusCache {
    /// `url` is a standard redis connection string, e.g.
    /// `redis://:password@localhost:6379/1`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| MeekError::Transport(format!("redis: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| MeekError::Transport(format!("redis connect: {e}")))?;
        tracing::info!("connected to redis");
        Ok(Self { conn })
    }

    fn transport(e: redis::RedisError) -> MeekError {
        MeekError::Transport(format!("redis: {e}"))
    }
}

#[async_trait]
impl StatusCache for RedisStatusCache {
    async fn get_counters(&self, task_id: TaskId) -> Result<Option<StatusCounters>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(format!("{TASK_STATUS_PREFIX}{task_id}"))
            .await
            .map_err(Self::transport)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let counters: StatusCounters = serde_json::from_str(&raw)
            .map_err(|e| MeekError::Internal(anyhow::anyhow!("corrupt counter map: {e}")))?;
        Ok(Some(counters))
    }

    async fn set_counters(&self, task_id: TaskId, counters: &StatusCounters) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(counters)
            .map_err(|e| MeekError::Internal(anyhow::anyhow!(e)))?;
        conn.set(format!("{TASK_STATUS_PREFIX}{task_id}"), raw)
            .await
            .map_err(Self::transport)
    }

    async fn get_subtask_status(&self, id: SubTaskId) -> Result<Option<SubTaskStatus>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(format!("{SUBTASK_STATUS_PREFIX}{id}"))
            .await
            .map_err(Self::transport)?;
        Ok(raw
            .and_then(|s| s.parse::<i16>().ok())
            .and_then(SubTaskStatus::from_i16))
    }

    async fn set_subtask_status(&self, id: SubTaskId, status: SubTaskStatus) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set(
            format!("{SUBTASK_STATUS_PREFIX}{id}"),
            status.as_i16().to_string(),
        )
        .await
        .map_err(Self::transport)
    }

    async fn forget_task(&self, task_id: TaskId, subtask_ids: &[SubTaskId]) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut keys = vec![format!("{TASK_STATUS_PREFIX}{task_id}")];
        keys.extend(subtask_ids.iter().map(|id| format!("{SUBTASK_STATUS_PREFIX}{id}")));
        conn.del(keys).await.map_err(Self::transport)
    }

    async fn save_retry_snapshot(&self, entries: &[RetryEntry]) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(entries)
            .map_err(|e| MeekError::Internal(anyhow::anyhow!(e)))?;
        conn.set(RETRY_QUEUE_KEY, raw).await.map_err(Self::transport)
    }

    async fn load_retry_snapshot(&self) -> Result<Vec<RetryEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(RETRY_QUEUE_KEY).await.map_err(Self::transport)?;
        let Some(raw) = raw else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&raw)
            .map_err(|e| MeekError::Internal(anyhow::anyhow!("corrupt retry snapshot: {e}")))
    }
}
