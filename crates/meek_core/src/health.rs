//! Node health tracker: flips silent nodes offline, migrates their
//! running subtasks, and sweeps pending subtasks into the retry queue.
//!
//! The registry is authoritative — offline detection and migration happen
//! in the same cycle, and a node being migrated is guarded against
//! concurrent migration by an in-memory set.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::dispatch::SubTaskDispatcher;
use crate::ports::{CommandBus, QosLevel, Result, SubTaskStore, TaskStore};
use crate::proto::{topics, USER_STOP_MARKER};
use crate::registry::NodeRegistry;
use crate::retry::{RetryEntry, RetryQueue};
use crate::status::TaskStatusManager;
use crate::types::{Node, SubTask, SubTaskStatus, TaskStatus};

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    /// A node is declared offline after `interval * timeout_multiplier`
    /// without a heartbeat.
    pub timeout_multiplier: u32,
    /// Pending subtasks swept into the retry queue per cycle.
    pub pending_sweep_limit: i64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(20), timeout_multiplier: 2, pending_sweep_limit: 50 }
    }
}

#[derive(Debug, Default, Clone)]
pub struct MigrationReport {
    pub moved: usize,
    pub reset: usize,
    pub skipped_user_stopped: usize,
}

pub struct NodeHealthChecker {
    registry: Arc<NodeRegistry>,
    tasks: Arc<dyn TaskStore>,
    subtasks: Arc<dyn SubTaskStore>,
    dispatcher: Arc<SubTaskDispatcher>,
    retry_queue: Arc<RetryQueue>,
    status: Arc<TaskStatusManager>,
    migrating: Mutex<HashSet<i64>>,
    cfg: HealthConfig,
}

impl NodeHealthChecker {
    pub fn new(
        registry: Arc<NodeRegistry>,
        tasks: Arc<dyn TaskStore>,
        subtasks: Arc<dyn SubTaskStore>,
        dispatcher: Arc<SubTaskDispatcher>,
        retry_queue: Arc<RetryQueue>,
        status: Arc<TaskStatusManager>,
        cfg: HealthConfig,
    ) -> Self {
        Self {
            registry,
            tasks,
            subtasks,
            dispatcher,
            retry_queue,
            status,
            migrating: Mutex::new(HashSet::new()),
            cfg,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.cfg
    }

    /// One health-check cycle: detect, migrate, sweep.
    pub async fn run_cycle(&self) -> Result<()> {
        self.detect_offline_nodes().await?;
        self.migrate_offline_nodes().await?;
        self.sweep_pending_subtasks().await?;
        Ok(())
    }

    async fn detect_offline_nodes(&self) -> Result<()> {
        let timeout = self.cfg.interval * self.cfg.timeout_multiplier;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(40));
        let stale = self.registry.store().stale_online(cutoff).await?;
        for node in stale {
            tracing::warn!(
                "node {} ({}) silent since {:?}, marking offline",
                node.mac_address,
                node.id,
                node.last_heartbeat
            );
            self.registry.mark_offline(node.id).await?;
        }
        Ok(())
    }

    async fn migrate_offline_nodes(&self) -> Result<()> {
        for node in self.registry.store().transfer_pending().await? {
            {
                let mut migrating = self.migrating.lock().expect("migration set poisoned");
                if !migrating.insert(node.id) {
                    tracing::debug!("node {} already migrating, skipping", node.id);
                    continue;
                }
            }
            let result = self.migrate_node(&node).await;
            self.migrating.lock().expect("migration set poisoned").remove(&node.id);
            if let Err(e) = result {
                tracing::error!("migration of node {} failed: {e}", node.id);
            }
        }
        Ok(())
    }

    /// Move every running subtask off an offline node. Subtasks of tasks
    /// the user stopped are left alone — user stop takes precedence over
    /// recovery.
    pub async fn migrate_node(&self, offline: &Node) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();
        let running = self.subtasks.list_running_on_node(offline.id).await?;
        if running.is_empty() {
            self.registry.clear_transfer_flag(offline.id).await?;
            return Ok(report);
        }

        tracing::info!(
            "migrating {} running subtasks away from offline node {}",
            running.len(),
            offline.mac_address
        );

        let mut candidates: Vec<Node> = self
            .registry
            .online_nodes()
            .await?
            .into_iter()
            .filter(|n| n.id != offline.id && n.is_dispatchable())
            .collect();
        candidates.sort_by_key(|n| n.task_count());

        let mut rr = 0usize;
        for sub in running {
            if self.task_user_stopped(&sub).await? {
                tracing::info!(
                    "subtask {} belongs to a user-stopped task, not migrating",
                    sub.id
                );
                report.skipped_user_stopped += 1;
                continue;
            }

            if candidates.is_empty() {
                self.reset_for_reassignment(offline, &sub).await?;
                self.registry.release(offline.id, sub.kind).await?;
                report.reset += 1;
                continue;
            }

            let target = candidates[rr % candidates.len()].clone();
            rr += 1;
            match self.republish_to(&target, &sub).await {
                Ok(()) => {
                    self.subtasks
                        .reassign_node(
                            sub.id,
                            target.id,
                            &format!(
                                "migrated from offline node {} to {}",
                                offline.mac_address, target.mac_address
                            ),
                        )
                        .await?;
                    self.registry.reserve(target.id, sub.kind).await?;
                    report.moved += 1;
                    tracing::info!(
                        "subtask {} migrated {} -> {}",
                        sub.id,
                        offline.mac_address,
                        target.mac_address
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "republish of subtask {} to {} failed ({e}), resetting to pending",
                        sub.id,
                        target.mac_address
                    );
                    self.reset_for_reassignment(offline, &sub).await?;
                    report.reset += 1;
                }
            }
            // Either way the subtask no longer runs on the offline node.
            self.registry.release(offline.id, sub.kind).await?;
        }

        self.registry.clear_transfer_flag(offline.id).await?;
        tracing::info!(
            "migration of node {} done: moved={} reset={} user_stopped={}",
            offline.mac_address,
            report.moved,
            report.reset,
            report.skipped_user_stopped
        );
        Ok(report)
    }

    /// Enqueue pending subtasks that nobody is retrying yet.
    async fn sweep_pending_subtasks(&self) -> Result<()> {
        let pending = self.subtasks.list_pending(self.cfg.pending_sweep_limit).await?;
        for sub in pending {
            if self.retry_queue.contains(sub.id) {
                continue;
            }
            let Some(task) = self.tasks.get(sub.task_id).await? else {
                continue;
            };
            // Only tasks that are supposed to be running get their pending
            // subtasks re-attempted.
            if !matches!(task.status, TaskStatus::Running | TaskStatus::Pending) {
                continue;
            }
            if task.status == TaskStatus::Pending && task.started_at.is_none() {
                // Never started by the user; creation leaves subtasks
                // pending on purpose.
                continue;
            }
            tracing::debug!("sweeping pending subtask {} into the retry queue", sub.id);
            self.retry_queue.push(RetryEntry::new(sub.task_id, sub.id, 1));
        }
        Ok(())
    }

    async fn task_user_stopped(&self, sub: &SubTask) -> Result<bool> {
        let Some(task) = self.tasks.get(sub.task_id).await? else {
            return Ok(false);
        };
        Ok(task.status == TaskStatus::Stopped
            && task.error_message.as_deref() == Some(USER_STOP_MARKER))
    }

    async fn reset_for_reassignment(&self, offline: &Node, sub: &SubTask) -> Result<()> {
        self.subtasks
            .reset_to_pending(
                sub.id,
                &format!("node {} offline, awaiting reassignment", offline.mac_address),
            )
            .await?;
        self.status
            .update_subtask_status(sub.task_id, sub.id, SubTaskStatus::Pending)
            .await?;
        if !self.retry_queue.contains(sub.id) {
            self.retry_queue.push(RetryEntry::new(sub.task_id, sub.id, 2));
        }
        Ok(())
    }

    /// Rebuild the start command and publish it to the new node. The
    /// worker-side id is reused so results keep correlating.
    async fn republish_to(&self, target: &Node, sub: &SubTask) -> Result<()> {
        let task = self
            .tasks
            .get(sub.task_id)
            .await?
            .ok_or_else(|| crate::error::MeekError::NotFound(format!("task {}", sub.task_id)))?;
        let analysis_id = sub.analysis_id.clone().unwrap_or_else(|| sub.id.to_string());
        let envelope = self
            .dispatcher
            .build_start_envelope(&task, sub, target, &analysis_id)
            .await?;
        let payload = serde_json::to_value(&envelope)
            .map_err(|e| crate::error::MeekError::Internal(anyhow::anyhow!(e)))?;
        let topic = topics::request_setting(
            &self.dispatcher.config().topic_prefix,
            &target.mac_address,
        );
        self.dispatcher
            .bus()
            .publish(&topic, payload, QosLevel::AtLeastOnce, false)
            .await
    }
}

/// Run the tracker until `running` goes false.
pub fn spawn_health_loop(
    checker: Arc<NodeHealthChecker>,
    running: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = checker.config().interval;
        tracing::info!("node health tracker started (interval {interval:?})");
        while running.load(Ordering::Relaxed) {
            tokio::time::sleep(interval).await;
            if let Err(e) = checker.run_cycle().await {
                tracing::error!("health check cycle failed: {e}");
            }
        }
        tracing::info!("node health tracker stopped");
    })
}
