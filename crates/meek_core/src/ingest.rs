//! Result ingester: consumes `<prefix>+/result` messages, updates subtask
//! status, persists result blobs when asked to, and releases node
//! capacity when a subtask leaves the running state.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::dispatch::CommandTracker;
use crate::error::MeekError;
use crate::ports::{Result, ResultSink, SubTaskStore, TaskStore};
use crate::proto::{ResultMessage, ResultStatus};
use crate::registry::NodeRegistry;
use crate::router::BusHandler;
use crate::status::TaskStatusManager;
use crate::types::{SubTask, SubTaskStatus};

pub struct ResultIngester {
    tasks: Arc<dyn TaskStore>,
    subtasks: Arc<dyn SubTaskStore>,
    status: Arc<TaskStatusManager>,
    registry: Arc<NodeRegistry>,
    results: Arc<dyn ResultSink>,
    tracker: Arc<CommandTracker>,
}

impl ResultIngester {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        subtasks: Arc<dyn SubTaskStore>,
        status: Arc<TaskStatusManager>,
        registry: Arc<NodeRegistry>,
        results: Arc<dyn ResultSink>,
        tracker: Arc<CommandTracker>,
    ) -> Self {
        Self { tasks, subtasks, status, registry, results, tracker }
    }

    pub async fn handle_result(&self, msg: &ResultMessage) -> Result<()> {
        let task_id: i64 = msg
            .task_id
            .parse()
            .map_err(|_| MeekError::InvalidInput(format!("task_id not numeric: {}", msg.task_id)))?;

        // The subtask_id field carries the worker-side id, matched
        // verbatim — never parsed.
        let Some(sub) = self.subtasks.find_by_analysis_id(task_id, &msg.subtask_id).await? else {
            tracing::warn!(
                "result for unknown subtask (task {task_id}, worker id {})",
                msg.subtask_id
            );
            return Ok(());
        };

        // Any result for a subtask with an in-flight start command is
        // implicit acceptance.
        self.tracker.notify_result(task_id, sub.id);

        let was_running = sub.status == SubTaskStatus::Running;
        match msg.status {
            ResultStatus::Completed => {
                tracing::info!(
                    "subtask {} of task {task_id} completed (frames={:?})",
                    sub.id,
                    msg.frame_count
                );
                self.subtasks.set_completed_at(sub.id, Utc::now()).await?;
                self.status
                    .update_subtask_status(task_id, sub.id, SubTaskStatus::Completed)
                    .await?;
                self.persist_if_requested(task_id, &sub, msg).await?;
                if was_running {
                    self.release(&sub).await?;
                }
            }
            ResultStatus::Failed => {
                let error = msg
                    .error_message
                    .clone()
                    .unwrap_or_else(|| {
                        format!("node reported failure (status code {:?})", msg.status_code)
                    });
                tracing::warn!("subtask {} of task {task_id} failed: {error}", sub.id);
                self.subtasks.set_error(sub.id, &error).await?;
                self.status
                    .update_subtask_status(task_id, sub.id, SubTaskStatus::Error)
                    .await?;
                if was_running {
                    self.release(&sub).await?;
                }
            }
            ResultStatus::Processing => {
                // A frame result from a subtask still marked pending means
                // the start command was accepted without a reply.
                if sub.status == SubTaskStatus::Pending {
                    self.status
                        .update_subtask_status(task_id, sub.id, SubTaskStatus::Running)
                        .await?;
                }
                self.persist_if_requested(task_id, &sub, msg).await?;
            }
        }
        Ok(())
    }

    async fn persist_if_requested(
        &self,
        task_id: i64,
        sub: &SubTask,
        msg: &ResultMessage,
    ) -> Result<()> {
        let Some(results) = &msg.results else {
            return Ok(());
        };
        let Some(task) = self.tasks.get(task_id).await? else {
            return Ok(());
        };
        if task.save_result {
            self.results.persist(task_id, sub.id, results).await?;
        }
        Ok(())
    }

    async fn release(&self, sub: &SubTask) -> Result<()> {
        if let Some(node_id) = sub.node_id {
            self.registry.release(node_id, sub.kind).await?;
            tracing::debug!("released node {node_id} after subtask {} finished", sub.id);
        }
        Ok(())
    }
}

/// `<prefix>+/result` → [`ResultIngester::handle_result`].
pub struct ResultHandler(pub Arc<ResultIngester>);

#[async_trait]
impl BusHandler for ResultHandler {
    async fn handle(&self, _topic: &str, payload: &serde_json::Value) -> Result<()> {
        let msg: ResultMessage = serde_json::from_value(payload.clone())
            .map_err(|e| MeekError::InvalidInput(format!("malformed result message: {e}")))?;
        self.0.handle_result(&msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStores;
    use crate::types::*;
    use serde_json::json;

    struct Fixture {
        stores: MemoryStores,
        ingester: ResultIngester,
        status: Arc<TaskStatusManager>,
        registry: Arc<NodeRegistry>,
        task: Task,
        sub: SubTask,
        node: Node,
    }

    async fn fixture(save_result: bool) -> Fixture {
        let stores = MemoryStores::new();
        let status = Arc::new(TaskStatusManager::new(
            stores.cache(),
            stores.tasks(),
            stores.subtasks(),
        ));
        let registry = Arc::new(NodeRegistry::new(stores.nodes()));
        let tracker = Arc::new(CommandTracker::new());
        let ingester = ResultIngester::new(
            stores.tasks(),
            stores.subtasks(),
            Arc::clone(&status),
            Arc::clone(&registry),
            stores.results(),
            tracker,
        );

        let task = stores
            .tasks()
            .insert(NewTask {
                name: "t1".into(),
                kind: AnalysisKind::Stream,
                image_urls: vec![],
                video_urls: vec![],
                config: json!({}),
                save_result,
                save_images: false,
                analysis_interval: Some(1),
                model_ids: vec![1],
                stream_ids: vec![1],
                total_subtasks: 1,
            })
            .await
            .unwrap();
        let sub = stores
            .subtasks()
            .insert_many(vec![NewSubTask {
                task_id: task.id,
                kind: AnalysisKind::Stream,
                model_id: 1,
                source: SubTaskSource::LiveStream { stream_id: 1 },
                config: json!({}),
                detail: AnalysisDetail::Detection,
            }])
            .await
            .unwrap()
            .remove(0);

        let node = stores.seed_node("AA:01", 4).await;
        stores
            .subtasks()
            .mark_dispatched(sub.id, node.id, &sub.id.to_string())
            .await
            .unwrap();
        registry.reserve(node.id, AnalysisKind::Stream).await.unwrap();
        status
            .update_subtask_status(task.id, sub.id, SubTaskStatus::Running)
            .await
            .unwrap();
        status.flush().await.unwrap();
        let sub = stores.subtasks().get(sub.id).await.unwrap().unwrap();

        Fixture { stores, ingester, status, registry, task, sub, node }
    }

    fn result_msg(task_id: i64, worker_id: &str, status: &str) -> ResultMessage {
        serde_json::from_value(json!({
            "task_id": task_id.to_string(),
            "subtask_id": worker_id,
            "status": status,
            "status_code": 200,
            "results": {"objects": []}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_completed_result_finishes_subtask_and_releases_node() {
        let f = fixture(false).await;
        let msg = result_msg(f.task.id, &f.sub.id.to_string(), "completed");
        f.ingester.handle_result(&msg).await.unwrap();

        let view = f.status.task_status(f.task.id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Completed);
        assert_eq!(view.active, 0);

        let sub = f.stores.subtasks().get(f.sub.id).await.unwrap().unwrap();
        assert!(sub.completed_at.is_some());

        let node = f.registry.get(f.node.id).await.unwrap().unwrap();
        assert_eq!(node.stream_task_count, 0);
    }

    #[tokio::test]
    async fn test_failed_result_records_error() {
        let f = fixture(false).await;
        let msg: ResultMessage = serde_json::from_value(json!({
            "task_id": f.task.id.to_string(),
            "subtask_id": f.sub.id.to_string(),
            "status": "failed",
            "status_code": 500,
            "error_message": "model not loaded"
        }))
        .unwrap();
        f.ingester.handle_result(&msg).await.unwrap();

        let view = f.status.task_status(f.task.id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Error);
        let sub = f.stores.subtasks().get(f.sub.id).await.unwrap().unwrap();
        assert_eq!(sub.error_message.as_deref(), Some("model not loaded"));
    }

    #[tokio::test]
    async fn test_duplicate_completed_result_releases_node_once() {
        let f = fixture(false).await;
        let msg = result_msg(f.task.id, &f.sub.id.to_string(), "completed");
        f.ingester.handle_result(&msg).await.unwrap();
        f.ingester.handle_result(&msg).await.unwrap();

        let node = f.registry.get(f.node.id).await.unwrap().unwrap();
        // Not double-decremented below zero / not decremented twice.
        assert_eq!(node.stream_task_count, 0);
        let view = f.status.task_status(f.task.id).await.unwrap();
        assert_eq!(view.counters.count(SubTaskStatus::Completed), 1);
    }

    #[tokio::test]
    async fn test_results_persisted_only_when_requested() {
        let f = fixture(true).await;
        let msg = result_msg(f.task.id, &f.sub.id.to_string(), "completed");
        f.ingester.handle_result(&msg).await.unwrap();
        assert_eq!(f.stores.persisted_results().await.len(), 1);

        let f2 = fixture(false).await;
        let msg = result_msg(f2.task.id, &f2.sub.id.to_string(), "completed");
        f2.ingester.handle_result(&msg).await.unwrap();
        assert!(f2.stores.persisted_results().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_worker_id_is_ignored() {
        let f = fixture(false).await;
        let msg = result_msg(f.task.id, "no-such-worker-id", "completed");
        f.ingester.handle_result(&msg).await.unwrap();
        let view = f.status.task_status(f.task.id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_non_numeric_task_id_is_invalid_input() {
        let f = fixture(false).await;
        let msg: ResultMessage = serde_json::from_value(json!({
            "task_id": "abc", "subtask_id": "1", "status": "completed"
        }))
        .unwrap();
        assert!(matches!(
            f.ingester.handle_result(&msg).await,
            Err(MeekError::InvalidInput(_))
        ));
    }
}
