//! Postgres implementations of the meek_core store ports.
//! Each adapter is a newtype wrapping PgPool.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use meek_core::error::MeekError;
use meek_core::ports::{
    ModelStore, NodeStore, Result, ResultSink, StreamStore, SubTaskStore, TaskStore,
};
use meek_core::types::*;

use crate::sqlx_types::*;

fn db_err(e: sqlx::Error) -> MeekError {
    MeekError::Internal(anyhow!(e))
}

fn row_err(e: String) -> MeekError {
    MeekError::Internal(anyhow!(e))
}

const TASK_COLUMNS: &str = "id, name, analysis_type, image_urls, video_urls, config, \
     save_result, save_images, analysis_interval, status, active_subtasks, total_subtasks, \
     error_message, created_at, updated_at, started_at, stopped_at, completed_at";

const SUBTASK_COLUMNS: &str = "id, task_id, analysis_type, model_id, stream_id, source_urls, \
     config, analysis_detail, status, node_id, analysis_id, started_at, completed_at, \
     error_message, retry_count, created_at, updated_at";

const NODE_COLUMNS: &str = "id, mac_address, client_id, service_type, hostname, ip, port, \
     version, status, is_active, last_heartbeat, offline_at, needs_task_transfer, cpu_usage, \
     memory_usage, gpu_usage, image_task_count, video_task_count, stream_task_count, max_tasks, \
     weight, capabilities, created_at, updated_at";

// ── PgTaskStore ──────────────────────────────────────────────

pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert(&self, new: NewTask) -> Result<Task> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query_as::<_, PgTaskRow>(&format!(
            r#"
            INSERT INTO tasks
                (name, analysis_type, image_urls, video_urls, config,
                 save_result, save_images, analysis_interval, status, total_subtasks)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(&new.name)
        .bind(new.kind.as_i16())
        .bind(urls_to_json(&new.image_urls))
        .bind(urls_to_json(&new.video_urls))
        .bind(&new.config)
        .bind(new.save_result)
        .bind(new.save_images)
        .bind(new.analysis_interval)
        .bind(new.total_subtasks)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        for model_id in &new.model_ids {
            sqlx::query("INSERT INTO task_models (task_id, model_id) VALUES ($1, $2)")
                .bind(row.id)
                .bind(model_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        for stream_id in &new.stream_ids {
            sqlx::query("INSERT INTO task_streams (task_id, stream_id) VALUES ($1, $2)")
                .bind(row.id)
                .bind(stream_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        row.try_into().map_err(row_err)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, PgTaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| r.try_into().map_err(row_err)).transpose()
    }

    async fn list(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, PgTaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(|r| r.try_into().map_err(row_err)).collect()
    }

    async fn set_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = $2,
                error_message = $3,
                updated_at = now(),
                started_at = CASE WHEN $2 = 1 THEN now() ELSE started_at END,
                stopped_at = CASE WHEN $2 = 2 THEN now() ELSE stopped_at END,
                completed_at = CASE WHEN $2 = 3 THEN now() ELSE completed_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_i16())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(MeekError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    async fn apply_status_batch(
        &self,
        id: TaskId,
        subtask_updates: &[(SubTaskId, SubTaskStatus)],
        derived: TaskStatus,
        active: i64,
        total: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for (sub_id, status) in subtask_updates {
            sqlx::query(
                r#"
                UPDATE subtasks SET
                    status = $2,
                    updated_at = now(),
                    completed_at = CASE
                        WHEN $2 = 3 AND completed_at IS NULL THEN now()
                        ELSE completed_at
                    END
                WHERE id = $1
                "#,
            )
            .bind(sub_id)
            .bind(status.as_i16())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        sqlx::query(
            r#"
            UPDATE tasks SET
                status = $2,
                active_subtasks = $3,
                total_subtasks = $4,
                updated_at = now(),
                completed_at = CASE
                    WHEN $2 = 3 AND completed_at IS NULL THEN now()
                    ELSE completed_at
                END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(derived.as_i16())
        .bind(active)
        .bind(total)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn delete(&self, id: TaskId) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn model_ids(&self, id: TaskId) -> Result<Vec<ModelId>> {
        let ids: Vec<(i64,)> =
            sqlx::query_as("SELECT model_id FROM task_models WHERE task_id = $1 ORDER BY model_id")
                .bind(id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(ids.into_iter().map(|(i,)| i).collect())
    }

    async fn stream_ids(&self, id: TaskId) -> Result<Vec<StreamId>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT stream_id FROM task_streams WHERE task_id = $1 ORDER BY stream_id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(ids.into_iter().map(|(i,)| i).collect())
    }

    async fn running_task_stream_ids(&self) -> Result<Vec<StreamId>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT ts.stream_id
            FROM task_streams ts
            JOIN tasks t ON t.id = ts.task_id
            WHERE t.status = 1
            ORDER BY ts.stream_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(ids.into_iter().map(|(i,)| i).collect())
    }
}

// ── PgSubTaskStore ───────────────────────────────────────────

pub struct PgSubTaskStore {
    pool: PgPool,
}

impl PgSubTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_many(&self, sql: &str, bind: Option<i64>) -> Result<Vec<SubTask>> {
        let mut query = sqlx::query_as::<_, PgSubTaskRow>(sql);
        if let Some(v) = bind {
            query = query.bind(v);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.into_iter().map(|r| r.try_into().map_err(row_err)).collect()
    }
}

#[async_trait]
impl SubTaskStore for PgSubTaskStore {
    async fn insert_many(&self, new: Vec<NewSubTask>) -> Result<Vec<SubTask>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut out = Vec::with_capacity(new.len());
        for n in new {
            let (stream_id, urls) = match &n.source {
                SubTaskSource::LiveStream { stream_id } => (Some(*stream_id), vec![]),
                SubTaskSource::ImageBatch { urls } | SubTaskSource::VideoBatch { urls } => {
                    (None, urls.clone())
                }
            };
            let row = sqlx::query_as::<_, PgSubTaskRow>(&format!(
                r#"
                INSERT INTO subtasks
                    (task_id, analysis_type, model_id, stream_id, source_urls,
                     config, analysis_detail, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 0)
                RETURNING {SUBTASK_COLUMNS}
                "#
            ))
            .bind(n.task_id)
            .bind(n.kind.as_i16())
            .bind(n.model_id)
            .bind(stream_id)
            .bind(urls_to_json(&urls))
            .bind(&n.config)
            .bind(n.detail.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            out.push(row.try_into().map_err(row_err)?);
        }
        tx.commit().await.map_err(db_err)?;
        Ok(out)
    }

    async fn get(&self, id: SubTaskId) -> Result<Option<SubTask>> {
        let row = sqlx::query_as::<_, PgSubTaskRow>(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| r.try_into().map_err(row_err)).transpose()
    }

    async fn list_for_task(&self, task_id: TaskId) -> Result<Vec<SubTask>> {
        self.fetch_many(
            &format!("SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE task_id = $1 ORDER BY id"),
            Some(task_id),
        )
        .await
    }

    async fn list_for_task_with_status(
        &self,
        task_id: TaskId,
        status: SubTaskStatus,
    ) -> Result<Vec<SubTask>> {
        let rows = sqlx::query_as::<_, PgSubTaskRow>(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE task_id = $1 AND status = $2 ORDER BY id"
        ))
        .bind(task_id)
        .bind(status.as_i16())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(|r| r.try_into().map_err(row_err)).collect()
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<SubTask>> {
        self.fetch_many(
            &format!(
                "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE status = 0 ORDER BY id LIMIT $1"
            ),
            Some(limit),
        )
        .await
    }

    async fn list_running_on_node(&self, node_id: NodeId) -> Result<Vec<SubTask>> {
        self.fetch_many(
            &format!(
                "SELECT {SUBTASK_COLUMNS} FROM subtasks \
                 WHERE node_id = $1 AND status = 1 ORDER BY id"
            ),
            Some(node_id),
        )
        .await
    }

    async fn find_by_analysis_id(
        &self,
        task_id: TaskId,
        analysis_id: &str,
    ) -> Result<Option<SubTask>> {
        let row = sqlx::query_as::<_, PgSubTaskRow>(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE task_id = $1 AND analysis_id = $2"
        ))
        .bind(task_id)
        .bind(analysis_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| r.try_into().map_err(row_err)).transpose()
    }

    async fn mark_dispatched(
        &self,
        id: SubTaskId,
        node_id: NodeId,
        analysis_id: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE subtasks SET
                node_id = $2, analysis_id = $3, started_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(node_id)
        .bind(analysis_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn reassign_node(&self, id: SubTaskId, node_id: NodeId, note: &str) -> Result<()> {
        sqlx::query(
            "UPDATE subtasks SET node_id = $2, error_message = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(node_id)
        .bind(note)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn reset_to_pending(&self, id: SubTaskId, note: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE subtasks SET
                status = 0, node_id = NULL, analysis_id = NULL, started_at = NULL,
                error_message = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(note)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_error(&self, id: SubTaskId, message: &str) -> Result<()> {
        sqlx::query("UPDATE subtasks SET error_message = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_completed_at(&self, id: SubTaskId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE subtasks SET completed_at = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn increment_retry(&self, id: SubTaskId) -> Result<i32> {
        let (count,): (i32,) = sqlx::query_as(
            "UPDATE subtasks SET retry_count = retry_count + 1, updated_at = now() \
             WHERE id = $1 RETURNING retry_count",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count)
    }

    async fn delete_for_task(&self, task_id: TaskId) -> Result<Vec<SubTaskId>> {
        let ids: Vec<(i64,)> =
            sqlx::query_as("DELETE FROM subtasks WHERE task_id = $1 RETURNING id")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(ids.into_iter().map(|(i,)| i).collect())
    }
}

// ── PgNodeStore ──────────────────────────────────────────────

pub struct PgNodeStore {
    pool: PgPool,
}

impl PgNodeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_where(&self, predicate: &str) -> Result<Vec<Node>> {
        let rows = sqlx::query_as::<_, PgNodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE {predicate} ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(|r| r.try_into().map_err(row_err)).collect()
    }
}

#[async_trait]
impl NodeStore for PgNodeStore {
    async fn upsert_online(&self, info: NodeConnectInfo) -> Result<Node> {
        // A changed client id means the worker restarted and nothing runs
        // there any more — counters reset inside the same statement.
        let row = sqlx::query_as::<_, PgNodeRow>(&format!(
            r#"
            INSERT INTO nodes
                (mac_address, client_id, service_type, hostname, ip, port, version,
                 status, is_active, last_heartbeat, offline_at, needs_task_transfer,
                 cpu_usage, memory_usage, gpu_usage, max_tasks, capabilities)
            VALUES ($1, $2, $3, $4, $5, $6, $7,
                    'online', TRUE, now(), NULL, FALSE,
                    $8, $9, $10, COALESCE($11, 20), $12)
            ON CONFLICT (mac_address) DO UPDATE SET
                client_id = EXCLUDED.client_id,
                service_type = EXCLUDED.service_type,
                hostname = EXCLUDED.hostname,
                ip = EXCLUDED.ip,
                port = EXCLUDED.port,
                version = COALESCE(EXCLUDED.version, nodes.version),
                status = 'online',
                is_active = TRUE,
                last_heartbeat = now(),
                offline_at = NULL,
                needs_task_transfer = FALSE,
                cpu_usage = COALESCE(EXCLUDED.cpu_usage, nodes.cpu_usage),
                memory_usage = COALESCE(EXCLUDED.memory_usage, nodes.memory_usage),
                gpu_usage = COALESCE(EXCLUDED.gpu_usage, nodes.gpu_usage),
                max_tasks = COALESCE($11, nodes.max_tasks),
                capabilities = EXCLUDED.capabilities,
                image_task_count = CASE
                    WHEN nodes.client_id IS DISTINCT FROM EXCLUDED.client_id THEN 0
                    ELSE nodes.image_task_count END,
                video_task_count = CASE
                    WHEN nodes.client_id IS DISTINCT FROM EXCLUDED.client_id THEN 0
                    ELSE nodes.video_task_count END,
                stream_task_count = CASE
                    WHEN nodes.client_id IS DISTINCT FROM EXCLUDED.client_id THEN 0
                    ELSE nodes.stream_task_count END,
                updated_at = now()
            RETURNING {NODE_COLUMNS}
            "#
        ))
        .bind(&info.mac_address)
        .bind(&info.client_id)
        .bind(&info.service_type)
        .bind(&info.hostname)
        .bind(&info.ip)
        .bind(info.port)
        .bind(&info.version)
        .bind(info.cpu_usage)
        .bind(info.memory_usage)
        .bind(info.gpu_usage)
        .bind(info.max_tasks)
        .bind(&info.capabilities)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_into().map_err(row_err)
    }

    async fn get(&self, id: NodeId) -> Result<Option<Node>> {
        let row = sqlx::query_as::<_, PgNodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| r.try_into().map_err(row_err)).transpose()
    }

    async fn get_by_mac(&self, mac: &str) -> Result<Option<Node>> {
        let row = sqlx::query_as::<_, PgNodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE mac_address = $1"
        ))
        .bind(mac)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| r.try_into().map_err(row_err)).transpose()
    }

    async fn list(&self) -> Result<Vec<Node>> {
        self.fetch_where("TRUE").await
    }

    async fn list_online(&self) -> Result<Vec<Node>> {
        self.fetch_where("status = 'online' AND is_active").await
    }

    async fn mark_offline(&self, id: NodeId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE nodes SET
                status = 'offline', offline_at = now(), needs_task_transfer = TRUE,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn clear_transfer_flag(&self, id: NodeId) -> Result<()> {
        sqlx::query("UPDATE nodes SET needs_task_transfer = FALSE, updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn record_heartbeat(&self, hb: NodeHeartbeat) -> Result<Option<Node>> {
        let row = sqlx::query_as::<_, PgNodeRow>(&format!(
            r#"
            UPDATE nodes SET
                status = 'online',
                last_heartbeat = now(),
                client_id = COALESCE($2, client_id),
                service_type = COALESCE($3, service_type),
                cpu_usage = COALESCE($4, cpu_usage),
                memory_usage = COALESCE($5, memory_usage),
                gpu_usage = COALESCE($6, gpu_usage),
                max_tasks = COALESCE($7, max_tasks),
                is_active = COALESCE($8, is_active),
                updated_at = now()
            WHERE mac_address = $1
            RETURNING {NODE_COLUMNS}
            "#
        ))
        .bind(&hb.mac_address)
        .bind(&hb.client_id)
        .bind(&hb.service_type)
        .bind(hb.cpu_usage)
        .bind(hb.memory_usage)
        .bind(hb.gpu_usage)
        .bind(hb.max_tasks)
        .bind(hb.is_active)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if let Some(row) = row {
            return Ok(Some(row.try_into().map_err(row_err)?));
        }
        if !hb.can_synthesize_node() {
            return Ok(None);
        }

        // First contact from this MAC came as a heartbeat.
        let row = sqlx::query_as::<_, PgNodeRow>(&format!(
            r#"
            INSERT INTO nodes
                (mac_address, client_id, service_type, status, is_active, last_heartbeat,
                 cpu_usage, memory_usage, gpu_usage, max_tasks)
            VALUES ($1, $2, $3, 'online', COALESCE($8, TRUE), now(),
                    $4, $5, $6, COALESCE($7, 4))
            RETURNING {NODE_COLUMNS}
            "#
        ))
        .bind(&hb.mac_address)
        .bind(&hb.client_id)
        .bind(&hb.service_type)
        .bind(hb.cpu_usage)
        .bind(hb.memory_usage)
        .bind(hb.gpu_usage)
        .bind(hb.max_tasks)
        .bind(hb.is_active)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(Some(row.try_into().map_err(row_err)?))
    }

    async fn adjust_kind_count(&self, id: NodeId, kind: AnalysisKind, delta: i32) -> Result<()> {
        let column = match kind {
            AnalysisKind::Image => "image_task_count",
            AnalysisKind::Video => "video_task_count",
            AnalysisKind::Stream => "stream_task_count",
        };
        sqlx::query(&format!(
            "UPDATE nodes SET {column} = GREATEST(0, {column} + $2), updated_at = now() \
             WHERE id = $1"
        ))
        .bind(id)
        .bind(delta)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn stale_online(&self, cutoff: DateTime<Utc>) -> Result<Vec<Node>> {
        let rows = sqlx::query_as::<_, PgNodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes \
             WHERE status = 'online' AND is_active \
               AND (last_heartbeat IS NULL OR last_heartbeat < $1) \
             ORDER BY id"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(|r| r.try_into().map_err(row_err)).collect()
    }

    async fn transfer_pending(&self) -> Result<Vec<Node>> {
        self.fetch_where("status = 'offline' AND needs_task_transfer").await
    }
}

// ── PgStreamStore / PgModelStore ─────────────────────────────

pub struct PgStreamStore {
    pool: PgPool,
}

impl PgStreamStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn group_ids(&self, stream_id: StreamId) -> Result<Vec<GroupId>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT group_id FROM stream_group_members WHERE stream_id = $1 ORDER BY group_id",
        )
        .bind(stream_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(ids.into_iter().map(|(i,)| i).collect())
    }
}

#[async_trait]
impl StreamStore for PgStreamStore {
    async fn insert(&self, name: &str, url: &str, group_ids: &[GroupId]) -> Result<Stream> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query_as::<_, PgStreamRow>(
            r#"
            INSERT INTO streams (name, url, status)
            VALUES ($1, $2, 0)
            RETURNING id, name, url, status, created_at, updated_at
            "#,
        )
        .bind(name)
        .bind(url)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        for group_id in group_ids {
            sqlx::query("INSERT INTO stream_group_members (stream_id, group_id) VALUES ($1, $2)")
                .bind(row.id)
                .bind(group_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        row.into_stream(group_ids.to_vec()).map_err(row_err)
    }

    async fn get(&self, id: StreamId) -> Result<Option<Stream>> {
        let row = sqlx::query_as::<_, PgStreamRow>(
            "SELECT id, name, url, status, created_at, updated_at FROM streams WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(r) => {
                let groups = self.group_ids(r.id).await?;
                Ok(Some(r.into_stream(groups).map_err(row_err)?))
            }
            None => Ok(None),
        }
    }

    async fn get_many(&self, ids: &[StreamId]) -> Result<Vec<Stream>> {
        let rows = sqlx::query_as::<_, PgStreamRow>(
            "SELECT id, name, url, status, created_at, updated_at \
             FROM streams WHERE id = ANY($1) ORDER BY id",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let groups = self.group_ids(r.id).await?;
            out.push(r.into_stream(groups).map_err(row_err)?);
        }
        Ok(out)
    }

    async fn list(&self) -> Result<Vec<Stream>> {
        let rows = sqlx::query_as::<_, PgStreamRow>(
            "SELECT id, name, url, status, created_at, updated_at FROM streams ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let groups = self.group_ids(r.id).await?;
            out.push(r.into_stream(groups).map_err(row_err)?);
        }
        Ok(out)
    }

    async fn set_status(&self, id: StreamId, status: StreamStatus) -> Result<()> {
        sqlx::query("UPDATE streams SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_i16())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

pub struct PgModelStore {
    pool: PgPool,
}

impl PgModelStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ModelStore for PgModelStore {
    async fn upsert_by_code(&self, model: NewModel) -> Result<Model> {
        let row = sqlx::query_as::<_, PgModelRow>(
            r#"
            INSERT INTO models (code, name, version, class_count, classes)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (code) DO UPDATE SET
                name = EXCLUDED.name,
                version = EXCLUDED.version,
                class_count = EXCLUDED.class_count,
                classes = EXCLUDED.classes,
                updated_at = now()
            RETURNING id, code, name, version, class_count, classes, created_at, updated_at
            "#,
        )
        .bind(&model.code)
        .bind(&model.name)
        .bind(&model.version)
        .bind(model.class_count)
        .bind(&model.classes)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.into())
    }

    async fn get(&self, id: ModelId) -> Result<Option<Model>> {
        let row = sqlx::query_as::<_, PgModelRow>(
            "SELECT id, code, name, version, class_count, classes, created_at, updated_at \
             FROM models WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn get_many(&self, ids: &[ModelId]) -> Result<Vec<Model>> {
        let rows = sqlx::query_as::<_, PgModelRow>(
            "SELECT id, code, name, version, class_count, classes, created_at, updated_at \
             FROM models WHERE id = ANY($1) ORDER BY id",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list(&self) -> Result<Vec<Model>> {
        let rows = sqlx::query_as::<_, PgModelRow>(
            "SELECT id, code, name, version, class_count, classes, created_at, updated_at \
             FROM models ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ── PgResultSink ─────────────────────────────────────────────

pub struct PgResultSink {
    pool: PgPool,
}

impl PgResultSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultSink for PgResultSink {
    async fn persist(
        &self,
        task_id: TaskId,
        subtask_id: SubTaskId,
        results: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query("INSERT INTO analysis_results (task_id, subtask_id, results) VALUES ($1, $2, $3)")
            .bind(task_id)
            .bind(subtask_id)
            .bind(results)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
