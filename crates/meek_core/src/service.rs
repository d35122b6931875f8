//! Lifecycle verbs: create, start, stop, delete, status.
//!
//! Start / stop / delete serialize against each other through a per-task
//! async lock, created lazily. Stop always wins over recovery: the task
//! row gets the user-stop marker before any stop command leaves the
//! controller, and migration skips tasks carrying it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::dispatch::{DispatchMode, DispatchOutcome, SubTaskDispatcher};
use crate::error::MeekError;
use crate::ports::{CommandBus, ModelStore, Result, StreamStore, SubTaskStore, TaskStore};
use crate::proto::USER_STOP_MARKER;
use crate::registry::NodeRegistry;
use crate::retry::RetryQueue;
use crate::status::{TaskStatusManager, TaskStatusView};
use crate::types::*;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    /// 1 = image, 2 = video, 3 = stream.
    pub analysis_type: i16,
    pub model_ids: Vec<ModelId>,
    #[serde(default)]
    pub stream_ids: Vec<StreamId>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub video_urls: Vec<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub analysis_type_detail: Option<String>,
    #[serde(default)]
    pub save_result: bool,
    #[serde(default)]
    pub save_images: bool,
    #[serde(default)]
    pub analysis_interval: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub dispatched: usize,
    pub queued: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusReport {
    #[serde(flatten)]
    pub view: TaskStatusView,
    pub error_message: Option<String>,
    pub subtask_errors: Vec<SubTaskErrorView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubTaskErrorView {
    pub subtask_id: SubTaskId,
    pub status: SubTaskStatus,
    pub error: String,
}

pub struct TaskService {
    tasks: Arc<dyn TaskStore>,
    subtasks: Arc<dyn SubTaskStore>,
    models: Arc<dyn ModelStore>,
    streams: Arc<dyn StreamStore>,
    status: Arc<TaskStatusManager>,
    registry: Arc<NodeRegistry>,
    dispatcher: Arc<SubTaskDispatcher>,
    retry_queue: Arc<RetryQueue>,
    locks: Mutex<HashMap<TaskId, Arc<Mutex<()>>>>,
}

impl TaskService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        subtasks: Arc<dyn SubTaskStore>,
        models: Arc<dyn ModelStore>,
        streams: Arc<dyn StreamStore>,
        status: Arc<TaskStatusManager>,
        registry: Arc<NodeRegistry>,
        dispatcher: Arc<SubTaskDispatcher>,
        retry_queue: Arc<RetryQueue>,
    ) -> Self {
        Self {
            tasks,
            subtasks,
            models,
            streams,
            status,
            registry,
            dispatcher,
            retry_queue,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn task_lock(&self, id: TaskId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(id).or_default())
    }

    // ── create ───────────────────────────────────────────────

    /// Validate the request, insert the task row and fan out subtasks:
    /// N models × M streams for stream tasks, one per model otherwise.
    pub async fn create_task(&self, req: CreateTaskRequest) -> Result<Task> {
        let kind = AnalysisKind::from_i16(req.analysis_type).ok_or_else(|| {
            MeekError::InvalidInput(format!("unknown analysis_type {}", req.analysis_type))
        })?;
        if req.name.trim().is_empty() {
            return Err(MeekError::InvalidInput("task name must not be empty".into()));
        }
        if req.model_ids.is_empty() {
            return Err(MeekError::InvalidInput("at least one model is required".into()));
        }

        let models = self.models.get_many(&req.model_ids).await?;
        if models.len() != req.model_ids.len() {
            return Err(MeekError::InvalidInput("one or more model ids are unknown".into()));
        }

        let detail = AnalysisDetail::from_str(
            req.analysis_type_detail.as_deref().unwrap_or("detection"),
        );

        let sources: Vec<SubTaskSource> = match kind {
            AnalysisKind::Stream => {
                if req.stream_ids.is_empty() {
                    return Err(MeekError::InvalidInput(
                        "stream tasks require stream_ids".into(),
                    ));
                }
                let streams = self.streams.get_many(&req.stream_ids).await?;
                if streams.len() != req.stream_ids.len() {
                    return Err(MeekError::InvalidInput(
                        "one or more stream ids are unknown".into(),
                    ));
                }
                streams
                    .iter()
                    .map(|s| SubTaskSource::LiveStream { stream_id: s.id })
                    .collect()
            }
            AnalysisKind::Image => {
                if req.image_urls.is_empty() {
                    return Err(MeekError::InvalidInput("image tasks require image_urls".into()));
                }
                vec![SubTaskSource::ImageBatch { urls: req.image_urls.clone() }]
            }
            AnalysisKind::Video => {
                if req.video_urls.is_empty() {
                    return Err(MeekError::InvalidInput("video tasks require video_urls".into()));
                }
                vec![SubTaskSource::VideoBatch { urls: req.video_urls.clone() }]
            }
        };

        let total = (sources.len() * models.len()) as i64;
        let task = self
            .tasks
            .insert(NewTask {
                name: req.name.clone(),
                kind,
                image_urls: req.image_urls.clone(),
                video_urls: req.video_urls.clone(),
                config: req.config.clone(),
                save_result: req.save_result,
                save_images: req.save_images,
                analysis_interval: req.analysis_interval,
                model_ids: req.model_ids.clone(),
                stream_ids: req.stream_ids.clone(),
                total_subtasks: total,
            })
            .await?;

        let mut new_subtasks = Vec::with_capacity(total as usize);
        for source in &sources {
            for model in &models {
                new_subtasks.push(NewSubTask {
                    task_id: task.id,
                    kind,
                    model_id: model.id,
                    source: source.clone(),
                    config: req.config.clone(),
                    detail: detail.clone(),
                });
            }
        }
        let created = self.subtasks.insert_many(new_subtasks).await?;
        self.status.sync_from_database(task.id).await?;

        tracing::info!(
            "task {} ({:?}) created with {} subtasks",
            task.id,
            kind,
            created.len()
        );
        Ok(task)
    }

    // ── start ────────────────────────────────────────────────

    /// Dispatch every pending subtask. Already-running tasks are a no-op
    /// success; stopped and completed tasks cannot be restarted.
    pub async fn start_task(&self, id: TaskId) -> Result<StartReport> {
        let lock = self.task_lock(id).await;
        let _guard = lock.lock().await;

        let task = self
            .tasks
            .get(id)
            .await?
            .ok_or_else(|| MeekError::NotFound(format!("task {id}")))?;

        match task.status {
            TaskStatus::Running => {
                tracing::info!("task {id} already running, start is a no-op");
                return Ok(StartReport {
                    task_id: id,
                    status: TaskStatus::Running,
                    dispatched: 0,
                    queued: 0,
                });
            }
            TaskStatus::Stopped => {
                return Err(MeekError::Conflict(format!("task {id} is stopped")));
            }
            TaskStatus::Completed => {
                return Err(MeekError::Conflict(format!("task {id} is completed")));
            }
            TaskStatus::Pending | TaskStatus::Error => {}
        }

        let pending = self
            .subtasks
            .list_for_task_with_status(id, SubTaskStatus::Pending)
            .await?;
        if pending.is_empty() {
            // Nothing left to start; reconcile the row from the counters.
            let view = self.status.task_status(id).await?;
            self.tasks.set_status(id, view.status, task.error_message.as_deref()).await?;
            return Ok(StartReport { task_id: id, status: view.status, dispatched: 0, queued: 0 });
        }

        self.tasks.set_status(id, TaskStatus::Running, None).await?;

        let mut dispatched = 0;
        let mut queued = 0;
        for sub in &pending {
            match self
                .dispatcher
                .dispatch(&task, sub, None, DispatchMode::FireAndForget)
                .await?
            {
                DispatchOutcome::Started { .. } => dispatched += 1,
                DispatchOutcome::NoCapacity => {
                    // Not an error: park it for the retry loop.
                    self.retry_queue
                        .push(crate::retry::RetryEntry::new(id, sub.id, 1));
                    queued += 1;
                }
                DispatchOutcome::Failed { reason } => {
                    self.dispatcher
                        .handle_dispatch_failure(id, sub.id, &reason, 1)
                        .await?;
                    queued += 1;
                }
            }
        }

        let status = if dispatched > 0 { TaskStatus::Running } else { TaskStatus::Pending };
        tracing::info!(
            "task {id} started: {dispatched} dispatched, {queued} waiting for capacity"
        );
        Ok(StartReport { task_id: id, status, dispatched, queued })
    }

    // ── stop ─────────────────────────────────────────────────

    /// Stop a task. Stop commands go out fire-and-forget to every running
    /// subtask's node; the database transition happens regardless of
    /// broker connectivity.
    pub async fn stop_task(&self, id: TaskId) -> Result<TaskStatus> {
        let lock = self.task_lock(id).await;
        let _guard = lock.lock().await;

        let task = self
            .tasks
            .get(id)
            .await?
            .ok_or_else(|| MeekError::NotFound(format!("task {id}")))?;

        if task.status.is_terminal() {
            tracing::info!("task {id} already {:?}, stop is a no-op", task.status);
            return Ok(task.status);
        }

        // Mark first so a concurrent health cycle sees the user stop.
        self.tasks
            .set_status(id, TaskStatus::Stopped, Some(USER_STOP_MARKER))
            .await?;

        let subtasks = self.subtasks.list_for_task(id).await?;
        let bus_up = self.dispatcher.bus().is_connected();
        if !bus_up {
            tracing::warn!(
                "bus disconnected while stopping task {id}; nodes will reconcile on reconnect"
            );
        }

        for sub in &subtasks {
            if sub.status == SubTaskStatus::Running {
                if bus_up {
                    if let (Some(node_id), Some(analysis_id)) = (sub.node_id, &sub.analysis_id) {
                        if let Some(node) = self.registry.get(node_id).await? {
                            if let Err(e) =
                                self.dispatcher.send_stop(&node.mac_address, id, analysis_id).await
                            {
                                tracing::warn!(
                                    "stop command for subtask {} failed to publish: {e}",
                                    sub.id
                                );
                            }
                        }
                    }
                }
                if let Some(node_id) = sub.node_id {
                    self.registry.release(node_id, sub.kind).await?;
                }
            }
            if !sub.status.is_terminal() {
                self.status
                    .update_subtask_status(id, sub.id, SubTaskStatus::Stopped)
                    .await?;
            }
            self.retry_queue.remove(sub.id);
        }

        tracing::info!("task {id} stopped by user");
        Ok(TaskStatus::Stopped)
    }

    // ── delete ───────────────────────────────────────────────

    /// Delete a task and its subtasks. Running tasks must be stopped
    /// first; a missing task deletes successfully (idempotent).
    pub async fn delete_task(&self, id: TaskId) -> Result<()> {
        let lock = self.task_lock(id).await;
        let _guard = lock.lock().await;

        let Some(task) = self.tasks.get(id).await? else {
            tracing::info!("delete of unknown task {id} treated as success");
            return Ok(());
        };
        if task.status == TaskStatus::Running {
            return Err(MeekError::Conflict(format!(
                "task {id} is running; stop it before deleting"
            )));
        }

        let subtask_ids = self.subtasks.delete_for_task(id).await?;
        self.tasks.delete(id).await?;
        self.status.forget_task(id, &subtask_ids).await?;
        self.retry_queue.remove_task(id);
        self.locks.lock().await.remove(&id);

        tracing::info!("task {id} and {} subtasks deleted", subtask_ids.len());
        Ok(())
    }

    // ── status ───────────────────────────────────────────────

    /// Derived status plus counters and the most recent errors on both
    /// levels.
    pub async fn task_status(&self, id: TaskId) -> Result<TaskStatusReport> {
        let task = self
            .tasks
            .get(id)
            .await?
            .ok_or_else(|| MeekError::NotFound(format!("task {id}")))?;
        let view = self.status.task_status(id).await?;

        let mut subtask_errors: Vec<SubTaskErrorView> = self
            .subtasks
            .list_for_task(id)
            .await?
            .into_iter()
            .filter_map(|s| {
                s.error_message.map(|error| SubTaskErrorView {
                    subtask_id: s.id,
                    status: s.status,
                    error,
                })
            })
            .collect();
        subtask_errors.sort_by_key(|e| e.subtask_id);

        Ok(TaskStatusReport { view, error_message: task.error_message, subtask_errors })
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.tasks.list().await
    }
}
