//! Task state manager: the single writer for task / subtask status.
//!
//! Every transition updates the cache-resident counter map immediately and
//! queues the row writes; a background batcher flushes one transaction per
//! task. Writes are absolute values, so a re-flushed batch (after a failed
//! transaction) converges to the same state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::error::MeekError;
use crate::ports::{Result, StatusCache, SubTaskStore, TaskStore};
use crate::types::{StatusCounters, SubTaskId, SubTaskStatus, TaskId, TaskStatus};

pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub counters: StatusCounters,
    pub active: i64,
    pub total: i64,
}

#[derive(Default)]
struct Pending {
    task_ids: HashSet<TaskId>,
    subtask_updates: HashMap<TaskId, HashMap<SubTaskId, SubTaskStatus>>,
}

pub struct TaskStatusManager {
    cache: Arc<dyn StatusCache>,
    tasks: Arc<dyn TaskStore>,
    subtasks: Arc<dyn SubTaskStore>,
    pending: Mutex<Pending>,
}

impl TaskStatusManager {
    pub fn new(
        cache: Arc<dyn StatusCache>,
        tasks: Arc<dyn TaskStore>,
        subtasks: Arc<dyn SubTaskStore>,
    ) -> Self {
        Self { cache, tasks, subtasks, pending: Mutex::new(Pending::default()) }
    }

    /// Record a subtask transition. A no-op when the cached status already
    /// matches, which is what makes re-delivered status messages idempotent.
    pub async fn update_subtask_status(
        &self,
        task_id: TaskId,
        subtask_id: SubTaskId,
        status: SubTaskStatus,
    ) -> Result<()> {
        let mut counters = match self.cache.get_counters(task_id).await? {
            Some(c) => c,
            None => self.sync_from_database(task_id).await?,
        };
        let old = self.cache.get_subtask_status(subtask_id).await?;
        if old == Some(status) {
            return Ok(());
        }

        counters.transition(old, status);
        self.cache.set_subtask_status(subtask_id, status).await?;
        self.cache.set_counters(task_id, &counters).await?;

        let mut pending = self.pending.lock().expect("pending set poisoned");
        pending.task_ids.insert(task_id);
        pending
            .subtask_updates
            .entry(task_id)
            .or_default()
            .insert(subtask_id, status);
        tracing::debug!(
            "subtask {subtask_id} of task {task_id}: {:?} -> {:?}, queued for batch write",
            old,
            status
        );
        Ok(())
    }

    /// Rebuild the counter map from subtask rows and seed the cache.
    pub async fn sync_from_database(&self, task_id: TaskId) -> Result<StatusCounters> {
        let subtasks = self.subtasks.list_for_task(task_id).await?;
        let mut counters = StatusCounters::new();
        for s in &subtasks {
            counters.transition(None, s.status);
            self.cache.set_subtask_status(s.id, s.status).await?;
        }
        self.cache.set_counters(task_id, &counters).await?;
        tracing::debug!("synthesized counters for task {task_id} from {} subtasks", subtasks.len());
        Ok(counters)
    }

    /// Cache-backed fast path for the status endpoint.
    pub async fn task_status(&self, task_id: TaskId) -> Result<TaskStatusView> {
        let counters = match self.cache.get_counters(task_id).await? {
            Some(c) => c,
            None => self.sync_from_database(task_id).await?,
        };
        if counters.total() == 0 && self.tasks.get(task_id).await?.is_none() {
            return Err(MeekError::NotFound(format!("task {task_id}")));
        }
        Ok(TaskStatusView {
            task_id,
            status: counters.derive_task_status(),
            counters: counters.clone(),
            active: counters.running(),
            total: counters.total(),
        })
    }

    /// Drain the pending set and write each touched task in one
    /// transaction. A failed task goes back on the pending set.
    pub async fn flush(&self) -> Result<usize> {
        let (task_ids, mut updates) = {
            let mut pending = self.pending.lock().expect("pending set poisoned");
            let ids: Vec<TaskId> = pending.task_ids.drain().collect();
            let updates = std::mem::take(&mut pending.subtask_updates);
            (ids, updates)
        };
        if task_ids.is_empty() {
            return Ok(0);
        }

        let mut flushed = 0;
        for task_id in task_ids {
            let subtask_updates: Vec<(SubTaskId, SubTaskStatus)> = updates
                .remove(&task_id)
                .map(|m| m.into_iter().collect())
                .unwrap_or_default();
            let counters = match self.cache.get_counters(task_id).await? {
                Some(c) => c,
                None => continue,
            };
            let derived = counters.derive_task_status();
            let result = self
                .tasks
                .apply_status_batch(
                    task_id,
                    &subtask_updates,
                    derived,
                    counters.running(),
                    counters.total(),
                )
                .await;
            match result {
                Ok(()) => flushed += 1,
                Err(e) => {
                    tracing::error!("batch write for task {task_id} failed, requeueing: {e}");
                    let mut pending = self.pending.lock().expect("pending set poisoned");
                    pending.task_ids.insert(task_id);
                    let slot = pending.subtask_updates.entry(task_id).or_default();
                    for (id, status) in subtask_updates {
                        slot.entry(id).or_insert(status);
                    }
                }
            }
        }
        Ok(flushed)
    }

    /// Drop every cache trace of a deleted task.
    pub async fn forget_task(&self, task_id: TaskId, subtask_ids: &[SubTaskId]) -> Result<()> {
        {
            let mut pending = self.pending.lock().expect("pending set poisoned");
            pending.task_ids.remove(&task_id);
            pending.subtask_updates.remove(&task_id);
        }
        self.cache.forget_task(task_id, subtask_ids).await
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().expect("pending set poisoned").task_ids.is_empty()
    }
}

/// Run the batcher until `running` goes false, with a final flush on the
/// way out.
pub fn spawn_batcher(
    manager: Arc<TaskStatusManager>,
    interval: Duration,
    running: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("status batcher started (interval {interval:?})");
        while running.load(Ordering::Relaxed) {
            tokio::time::sleep(interval).await;
            if let Err(e) = manager.flush().await {
                tracing::error!("status batch flush failed: {e}");
            }
        }
        if let Err(e) = manager.flush().await {
            tracing::error!("final status batch flush failed: {e}");
        }
        tracing::info!("status batcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStores;
    use crate::types::*;

    async fn seed(stores: &MemoryStores, subtask_count: usize) -> (Task, Vec<SubTask>) {
        let task = stores
            .tasks()
            .insert(NewTask {
                name: "t".into(),
                kind: AnalysisKind::Stream,
                image_urls: vec![],
                video_urls: vec![],
                config: serde_json::json!({}),
                save_result: false,
                save_images: false,
                analysis_interval: Some(1),
                model_ids: vec![1],
                stream_ids: vec![1],
                total_subtasks: subtask_count as i64,
            })
            .await
            .unwrap();
        let subtasks = stores
            .subtasks()
            .insert_many(
                (0..subtask_count)
                    .map(|_| NewSubTask {
                        task_id: task.id,
                        kind: AnalysisKind::Stream,
                        model_id: 1,
                        source: SubTaskSource::LiveStream { stream_id: 1 },
                        config: serde_json::json!({}),
                        detail: AnalysisDetail::Detection,
                    })
                    .collect(),
            )
            .await
            .unwrap();
        (task, subtasks)
    }

    fn manager(stores: &MemoryStores) -> TaskStatusManager {
        TaskStatusManager::new(stores.cache(), stores.tasks(), stores.subtasks())
    }

    #[tokio::test]
    async fn test_transition_updates_counters_and_flush_writes_rows() {
        let stores = MemoryStores::new();
        let (task, subs) = seed(&stores, 2).await;
        let mgr = manager(&stores);

        mgr.update_subtask_status(task.id, subs[0].id, SubTaskStatus::Running).await.unwrap();
        let view = mgr.task_status(task.id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Running);
        assert_eq!(view.active, 1);
        assert_eq!(view.total, 2);

        // Rows only change after the batcher runs.
        assert_eq!(
            stores.tasks().get(task.id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
        mgr.flush().await.unwrap();
        let row = stores.tasks().get(task.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Running);
        assert_eq!(row.active_subtasks, 1);
        let sub = stores.subtasks().get(subs[0].id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubTaskStatus::Running);
    }

    #[tokio::test]
    async fn test_duplicate_transition_is_idempotent() {
        let stores = MemoryStores::new();
        let (task, subs) = seed(&stores, 1).await;
        let mgr = manager(&stores);

        mgr.update_subtask_status(task.id, subs[0].id, SubTaskStatus::Running).await.unwrap();
        mgr.update_subtask_status(task.id, subs[0].id, SubTaskStatus::Running).await.unwrap();

        let view = mgr.task_status(task.id).await.unwrap();
        assert_eq!(view.active, 1);
        assert_eq!(view.total, 1);
    }

    #[tokio::test]
    async fn test_active_count_matches_running_subtasks_after_flush() {
        let stores = MemoryStores::new();
        let (task, subs) = seed(&stores, 3).await;
        let mgr = manager(&stores);

        for s in &subs {
            mgr.update_subtask_status(task.id, s.id, SubTaskStatus::Running).await.unwrap();
        }
        mgr.update_subtask_status(task.id, subs[0].id, SubTaskStatus::Completed).await.unwrap();
        mgr.flush().await.unwrap();

        let row = stores.tasks().get(task.id).await.unwrap().unwrap();
        let running = stores
            .subtasks()
            .list_for_task_with_status(task.id, SubTaskStatus::Running)
            .await
            .unwrap()
            .len() as i64;
        assert_eq!(row.active_subtasks, running);
        assert_eq!(row.active_subtasks, 2);
    }

    #[tokio::test]
    async fn test_counters_synthesized_from_rows_on_cache_miss() {
        let stores = MemoryStores::new();
        let (task, subs) = seed(&stores, 2).await;
        let mgr = manager(&stores);

        // Nothing cached yet; the view must be synthesized from rows.
        let view = mgr.task_status(task.id).await.unwrap();
        assert_eq!(view.total, 2);
        assert_eq!(view.status, TaskStatus::Pending);
        assert_eq!(view.counters.count(SubTaskStatus::Pending), 2);
        let _ = subs;
    }

    #[tokio::test]
    async fn test_all_completed_derives_completed_task() {
        let stores = MemoryStores::new();
        let (task, subs) = seed(&stores, 2).await;
        let mgr = manager(&stores);

        for s in &subs {
            mgr.update_subtask_status(task.id, s.id, SubTaskStatus::Running).await.unwrap();
            mgr.update_subtask_status(task.id, s.id, SubTaskStatus::Completed).await.unwrap();
        }
        mgr.flush().await.unwrap();
        let row = stores.tasks().get(task.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Completed);
        assert_eq!(row.active_subtasks, 0);
    }

    #[tokio::test]
    async fn test_status_for_unknown_task_is_not_found() {
        let stores = MemoryStores::new();
        let mgr = manager(&stores);
        let err = mgr.task_status(999).await.unwrap_err();
        assert!(matches!(err, MeekError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_forget_task_clears_cache_and_pending() {
        let stores = MemoryStores::new();
        let (task, subs) = seed(&stores, 1).await;
        let mgr = manager(&stores);

        mgr.update_subtask_status(task.id, subs[0].id, SubTaskStatus::Running).await.unwrap();
        assert!(mgr.has_pending());
        mgr.forget_task(task.id, &[subs[0].id]).await.unwrap();
        assert!(!mgr.has_pending());
        assert!(stores.cache().get_counters(task.id).await.unwrap().is_none());
    }
}
