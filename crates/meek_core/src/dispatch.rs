//! Subtask dispatcher: scores online nodes, issues start commands and
//! tracks acceptance.
//!
//! Two send modes exist. Fire-and-forget marks the subtask running
//! optimistically and lets the reply handler undo it on rejection.
//! Blocking mode registers a waiter keyed by the envelope's
//! `message_uuid` and waits for either an explicit reply or any result
//! message for the subtask (implicit acceptance).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;

use crate::error::MeekError;
use crate::ports::{
    CommandBus, ModelStore, QosLevel, Result, StreamStore, SubTaskStore, TaskStore,
};
use crate::proto::{
    topics, CmdType, CommandData, ReplyEnvelope, ReplyStatus, RequestEnvelope, ResultConfig,
    SourceSpec,
};
use crate::registry::NodeRegistry;
use crate::retry::{RetryEntry, RetryPolicy, RetryQueue};
use crate::router::BusHandler;
use crate::status::TaskStatusManager;
use crate::types::{AnalysisKind, Node, NodeId, SubTask, SubTaskSource, SubTaskStatus, Task};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub topic_prefix: String,
    pub resource_weight: f64,
    pub balance_weight: f64,
    pub node_weight: f64,
    pub accept_timeout: Duration,
    pub accept_retries: u32,
    pub accept_retry_gap: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            topic_prefix: crate::proto::DEFAULT_TOPIC_PREFIX.into(),
            resource_weight: 0.4,
            balance_weight: 0.4,
            node_weight: 0.2,
            accept_timeout: Duration::from_secs(10),
            accept_retries: 3,
            accept_retry_gap: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NodeScore {
    pub resource: f64,
    pub balance: f64,
    pub weight: f64,
    pub total: f64,
}

/// Score a node for a subtask of the given kind. Higher is better.
/// Missing gauges count as zero utilisation.
pub fn score_node(node: &Node, kind: AnalysisKind, cfg: &DispatchConfig) -> NodeScore {
    let cpu = node.cpu_usage.unwrap_or(0.0);
    let mem = node.memory_usage.unwrap_or(0.0);
    let gpu = node.gpu_usage.unwrap_or(0.0);
    let utilisation = (cpu + mem + gpu) / 3.0 / 100.0;
    let resource = (1.0 - utilisation).max(0.0) * cfg.resource_weight;

    let max_tasks = node.max_tasks.max(1) as f64;
    let balance = (1.0 - node.kind_count(kind) as f64 / max_tasks).max(0.0) * cfg.balance_weight;

    let weight = node.weight * cfg.node_weight;
    NodeScore { resource, balance, weight, total: resource + balance + weight }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    FireAndForget,
    AwaitAccept,
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// Start command published; subtask is running (tentatively in
    /// fire-and-forget mode, confirmed in blocking mode).
    Started { node_id: NodeId },
    /// No eligible node. Not an error: the subtask stays pending.
    NoCapacity,
    /// Publish failed, the node rejected, or acceptance timed out.
    /// The subtask has already been rolled back to pending.
    Failed { reason: String },
}

// ── Acceptance tracking ──────────────────────────────────────

#[derive(Debug, Clone)]
pub enum AcceptOutcome {
    Accepted,
    Rejected { message: String },
}

struct Waiter {
    subtask_key: (i64, i64),
    tx: oneshot::Sender<AcceptOutcome>,
}

/// Correlates command replies (by `message_uuid`) and result messages (by
/// task / subtask id) back to blocked dispatch calls.
#[derive(Default)]
pub struct CommandTracker {
    by_uuid: Mutex<HashMap<String, Waiter>>,
    uuid_by_subtask: Mutex<HashMap<(i64, i64), String>>,
}

impl CommandTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        message_uuid: &str,
        task_id: i64,
        subtask_id: i64,
    ) -> oneshot::Receiver<AcceptOutcome> {
        let (tx, rx) = oneshot::channel();
        self.by_uuid.lock().expect("tracker poisoned").insert(
            message_uuid.to_string(),
            Waiter { subtask_key: (task_id, subtask_id), tx },
        );
        self.uuid_by_subtask
            .lock()
            .expect("tracker poisoned")
            .insert((task_id, subtask_id), message_uuid.to_string());
        rx
    }

    /// Resolve a waiter from an explicit reply. Returns false when nobody
    /// was waiting on this uuid (fire-and-forget send).
    pub fn resolve_reply(&self, message_uuid: &str, outcome: AcceptOutcome) -> bool {
        let waiter = self.by_uuid.lock().expect("tracker poisoned").remove(message_uuid);
        match waiter {
            Some(w) => {
                self.uuid_by_subtask.lock().expect("tracker poisoned").remove(&w.subtask_key);
                let _ = w.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// A result message for a subtask is implicit acceptance of its
    /// pending start command.
    pub fn notify_result(&self, task_id: i64, subtask_id: i64) {
        let uuid = self
            .uuid_by_subtask
            .lock()
            .expect("tracker poisoned")
            .get(&(task_id, subtask_id))
            .cloned();
        if let Some(uuid) = uuid {
            self.resolve_reply(&uuid, AcceptOutcome::Accepted);
        }
    }

    pub fn abandon(&self, message_uuid: &str) {
        if let Some(w) = self.by_uuid.lock().expect("tracker poisoned").remove(message_uuid) {
            self.uuid_by_subtask.lock().expect("tracker poisoned").remove(&w.subtask_key);
        }
    }
}

// ── Dispatcher ───────────────────────────────────────────────

pub struct SubTaskDispatcher {
    registry: Arc<NodeRegistry>,
    tasks: Arc<dyn TaskStore>,
    subtasks: Arc<dyn SubTaskStore>,
    models: Arc<dyn ModelStore>,
    streams: Arc<dyn StreamStore>,
    status: Arc<TaskStatusManager>,
    bus: Arc<dyn CommandBus>,
    tracker: Arc<CommandTracker>,
    retry_queue: Arc<RetryQueue>,
    cfg: DispatchConfig,
}

impl SubTaskDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<NodeRegistry>,
        tasks: Arc<dyn TaskStore>,
        subtasks: Arc<dyn SubTaskStore>,
        models: Arc<dyn ModelStore>,
        streams: Arc<dyn StreamStore>,
        status: Arc<TaskStatusManager>,
        bus: Arc<dyn CommandBus>,
        tracker: Arc<CommandTracker>,
        retry_queue: Arc<RetryQueue>,
        cfg: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            tasks,
            subtasks,
            models,
            streams,
            status,
            bus,
            tracker,
            retry_queue,
            cfg,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.cfg
    }

    pub fn tracker(&self) -> &Arc<CommandTracker> {
        &self.tracker
    }

    pub fn bus(&self) -> &Arc<dyn CommandBus> {
        &self.bus
    }

    /// Pick the best eligible node, honouring a preferred node when it is
    /// itself eligible.
    pub async fn select_node(
        &self,
        kind: AnalysisKind,
        preferred: Option<NodeId>,
    ) -> Result<Option<Node>> {
        if let Some(id) = preferred {
            if let Some(node) = self.registry.get(id).await? {
                if node.is_dispatchable() {
                    tracing::info!("using preferred node {} for {kind:?} subtask", node.mac_address);
                    return Ok(Some(node));
                }
            }
        }

        let candidates = self.registry.online_nodes().await?;
        let mut best: Option<(Node, NodeScore)> = None;
        for node in candidates.into_iter().filter(Node::is_dispatchable) {
            let score = score_node(&node, kind, &self.cfg);
            match &best {
                Some((_, s)) if s.total >= score.total => {}
                _ => best = Some((node, score)),
            }
        }
        if let Some((node, score)) = &best {
            tracing::info!(
                "selected node {} for {kind:?} subtask (score {:.3})",
                node.mac_address,
                score.total
            );
        }
        Ok(best.map(|(n, _)| n))
    }

    /// Build the start command for a subtask on a node.
    pub async fn build_start_envelope(
        &self,
        task: &Task,
        sub: &SubTask,
        node: &Node,
        analysis_id: &str,
    ) -> Result<RequestEnvelope> {
        let source = match &sub.source {
            SubTaskSource::ImageBatch { urls } => {
                SourceSpec { kind: "image".into(), urls: urls.clone() }
            }
            SubTaskSource::VideoBatch { urls } => {
                SourceSpec { kind: "video".into(), urls: urls.clone() }
            }
            SubTaskSource::LiveStream { stream_id } => {
                let stream = self
                    .streams
                    .get(*stream_id)
                    .await?
                    .ok_or_else(|| MeekError::NotFound(format!("stream {stream_id}")))?;
                SourceSpec { kind: "stream".into(), urls: vec![stream.url] }
            }
        };

        let model = self
            .models
            .get(sub.model_id)
            .await?
            .ok_or_else(|| MeekError::NotFound(format!("model {}", sub.model_id)))?;

        let mut config = serde_json::json!({
            "model_code": model.code,
            "analysis_type": sub.detail.as_str(),
        });
        if let Some(interval) = task.analysis_interval {
            config["analysis_interval"] = interval.into();
        }
        if let serde_json::Value::Object(user) = &sub.config {
            for (k, v) in user {
                config[k.as_str()] = v.clone();
            }
        }

        Ok(RequestEnvelope::task_cmd(
            &self.cfg.topic_prefix,
            CommandData {
                cmd_type: CmdType::StartTask,
                task_id: task.id.to_string(),
                subtask_id: analysis_id.to_string(),
                source: Some(source),
                config: Some(config),
                result_config: Some(ResultConfig {
                    save_result: task.save_result,
                    save_images: task.save_images,
                    callback_topic: topics::result(&self.cfg.topic_prefix, &node.mac_address),
                }),
            },
        ))
    }

    /// Dispatch one subtask. On `Failed` the subtask has already been
    /// rolled back to pending and the node released; the caller decides
    /// whether to retry (see [`Self::handle_dispatch_failure`]).
    pub async fn dispatch(
        &self,
        task: &Task,
        sub: &SubTask,
        preferred: Option<NodeId>,
        mode: DispatchMode,
    ) -> Result<DispatchOutcome> {
        let Some(node) = self.select_node(sub.kind, preferred).await? else {
            tracing::warn!("no eligible node for subtask {} of task {}", sub.id, task.id);
            return Ok(DispatchOutcome::NoCapacity);
        };

        // The worker-side id is generated once and survives migration.
        let analysis_id = sub.analysis_id.clone().unwrap_or_else(|| sub.id.to_string());

        self.registry.reserve(node.id, sub.kind).await?;
        self.subtasks.mark_dispatched(sub.id, node.id, &analysis_id).await?;

        let envelope = match self.build_start_envelope(task, sub, &node, &analysis_id).await {
            Ok(envelope) => envelope,
            Err(e) => {
                self.rollback(task.id, sub, node.id, &format!("payload build failed: {e}"))
                    .await?;
                return Err(e);
            }
        };
        let message_uuid = envelope.message_uuid.clone();
        let topic = topics::request_setting(&self.cfg.topic_prefix, &node.mac_address);
        let payload = serde_json::to_value(&envelope)
            .map_err(|e| MeekError::Internal(anyhow::anyhow!(e)))?;

        let mut rx = match mode {
            DispatchMode::AwaitAccept => Some(self.tracker.register(&message_uuid, task.id, sub.id)),
            DispatchMode::FireAndForget => None,
        };

        tracing::info!(
            "dispatching subtask {} of task {} to node {} (uuid {message_uuid})",
            sub.id,
            task.id,
            node.mac_address
        );

        if let Err(e) = self
            .bus
            .publish(&topic, payload.clone(), QosLevel::AtLeastOnce, false)
            .await
        {
            self.tracker.abandon(&message_uuid);
            self.rollback(task.id, sub, node.id, &format!("publish failed: {e}")).await?;
            return Ok(DispatchOutcome::Failed { reason: format!("publish failed: {e}") });
        }

        self.status
            .update_subtask_status(task.id, sub.id, SubTaskStatus::Running)
            .await?;

        let Some(rx) = rx.as_mut() else {
            return Ok(DispatchOutcome::Started { node_id: node.id });
        };

        for attempt in 1..=self.cfg.accept_retries.max(1) {
            match tokio::time::timeout(self.cfg.accept_timeout, &mut *rx).await {
                Ok(Ok(AcceptOutcome::Accepted)) => {
                    tracing::info!("node {} accepted subtask {}", node.mac_address, sub.id);
                    return Ok(DispatchOutcome::Started { node_id: node.id });
                }
                Ok(Ok(AcceptOutcome::Rejected { message })) => {
                    tracing::warn!(
                        "node {} rejected subtask {}: {message}",
                        node.mac_address,
                        sub.id
                    );
                    self.rollback(task.id, sub, node.id, &format!("node rejected task: {message}"))
                        .await?;
                    return Ok(DispatchOutcome::Failed { reason: message });
                }
                Ok(Err(_)) => break, // waiter dropped
                Err(_) => {
                    tracing::warn!(
                        "acceptance wait {attempt}/{} timed out for subtask {}",
                        self.cfg.accept_retries,
                        sub.id
                    );
                    if attempt < self.cfg.accept_retries {
                        tokio::time::sleep(self.cfg.accept_retry_gap).await;
                        // Re-publish the same envelope; the node
                        // deduplicates by message uuid.
                        let _ = self
                            .bus
                            .publish(&topic, payload.clone(), QosLevel::AtLeastOnce, false)
                            .await;
                    }
                }
            }
        }

        self.tracker.abandon(&message_uuid);
        self.rollback(task.id, sub, node.id, "node acceptance timeout").await?;
        Ok(DispatchOutcome::Failed { reason: "node acceptance timeout".into() })
    }

    async fn rollback(
        &self,
        task_id: i64,
        sub: &SubTask,
        node_id: NodeId,
        note: &str,
    ) -> Result<()> {
        self.registry.release(node_id, sub.kind).await?;
        self.subtasks.reset_to_pending(sub.id, note).await?;
        self.status
            .update_subtask_status(task_id, sub.id, SubTaskStatus::Pending)
            .await
    }

    /// Shared failure path: bump the retry budget and either requeue with
    /// backoff or mark the subtask errored.
    pub async fn handle_dispatch_failure(
        &self,
        task_id: i64,
        subtask_id: i64,
        reason: &str,
        previous_priority: u8,
    ) -> Result<()> {
        let retry_count = self.subtasks.increment_retry(subtask_id).await? as u32;
        let policy = self.retry_queue.policy();
        if retry_count > policy.max_retries {
            tracing::warn!(
                "subtask {subtask_id} of task {task_id} exceeded {} retries, marking errored",
                policy.max_retries
            );
            self.subtasks
                .set_error(subtask_id, &format!("exceeded retries: {reason}"))
                .await?;
            self.status
                .update_subtask_status(task_id, subtask_id, SubTaskStatus::Error)
                .await?;
            return Ok(());
        }

        let delay = policy.delay_for(retry_count);
        let mut entry = RetryEntry::new(task_id, subtask_id, previous_priority.saturating_sub(1));
        entry.retry_count = retry_count;
        entry.next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(5));
        tracing::info!(
            "subtask {subtask_id} requeued (retry {retry_count}/{}, next attempt in {delay:?}): {reason}",
            policy.max_retries
        );
        self.retry_queue.push(entry);
        Ok(())
    }

    /// Node-level command (`sync_time`, `update_config`) addressed to one
    /// node. Returns the envelope's message uuid so callers can correlate
    /// the reply if they care.
    pub async fn send_node_command(
        &self,
        node_mac: &str,
        cmd: CmdType,
        config: Option<serde_json::Value>,
    ) -> Result<String> {
        let mut envelope = RequestEnvelope::task_cmd(
            &self.cfg.topic_prefix,
            CommandData {
                cmd_type: cmd,
                task_id: String::new(),
                subtask_id: String::new(),
                source: None,
                config,
                result_config: None,
            },
        );
        envelope.request_type = crate::proto::RequestType::NodeCmd;
        let uuid = envelope.message_uuid.clone();
        let topic = topics::request_setting(&self.cfg.topic_prefix, node_mac);
        let payload =
            serde_json::to_value(&envelope).map_err(|e| MeekError::Internal(anyhow::anyhow!(e)))?;
        self.bus.publish(&topic, payload, QosLevel::AtLeastOnce, false).await?;
        Ok(uuid)
    }

    /// Controller-wide announcement on `<prefix>system/broadcast`.
    pub async fn broadcast(&self, payload: serde_json::Value) -> Result<()> {
        let topic = topics::broadcast(&self.cfg.topic_prefix);
        self.bus.publish(&topic, payload, QosLevel::AtLeastOnce, false).await
    }

    /// Fire-and-forget stop command for a running subtask.
    pub async fn send_stop(
        &self,
        node_mac: &str,
        task_id: i64,
        analysis_id: &str,
    ) -> Result<()> {
        let envelope = RequestEnvelope::task_cmd(
            &self.cfg.topic_prefix,
            CommandData {
                cmd_type: CmdType::StopTask,
                task_id: task_id.to_string(),
                subtask_id: analysis_id.to_string(),
                source: None,
                config: None,
                result_config: None,
            },
        );
        let topic = topics::request_setting(&self.cfg.topic_prefix, node_mac);
        let payload =
            serde_json::to_value(&envelope).map_err(|e| MeekError::Internal(anyhow::anyhow!(e)))?;
        self.bus.publish(&topic, payload, QosLevel::AtLeastOnce, false).await
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_queue.policy()
    }
}

/// Drain due retry entries through the dispatcher until `running` goes
/// false. No capacity is not a failure: the entry is re-armed with the
/// base delay and an unchanged retry budget. A rejected or failed
/// dispatch burns budget via [`SubTaskDispatcher::handle_dispatch_failure`].
pub fn spawn_retry_dispatch_loop(
    dispatcher: Arc<SubTaskDispatcher>,
    retry_queue: Arc<RetryQueue>,
    tasks: Arc<dyn TaskStore>,
    subtasks: Arc<dyn SubTaskStore>,
    poll_interval: Duration,
    running: Arc<std::sync::atomic::AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    use std::sync::atomic::Ordering;

    tokio::spawn(async move {
        tracing::info!("retry dispatch loop started (poll {poll_interval:?})");
        while running.load(Ordering::Relaxed) {
            tokio::time::sleep(poll_interval).await;
            let due = retry_queue.pop_due(Utc::now(), 10);
            for entry in due {
                if let Err(e) = attempt_retry(&dispatcher, &retry_queue, &tasks, &subtasks, entry).await
                {
                    tracing::error!("retry dispatch attempt failed: {e}");
                }
            }
        }
        tracing::info!("retry dispatch loop stopped");
    })
}

async fn attempt_retry(
    dispatcher: &Arc<SubTaskDispatcher>,
    retry_queue: &Arc<RetryQueue>,
    tasks: &Arc<dyn TaskStore>,
    subtasks: &Arc<dyn SubTaskStore>,
    mut entry: RetryEntry,
) -> Result<()> {
    let Some(sub) = subtasks.get(entry.subtask_id).await? else {
        return Ok(());
    };
    if sub.status != SubTaskStatus::Pending {
        return Ok(());
    }
    let Some(task) = tasks.get(entry.task_id).await? else {
        return Ok(());
    };
    // Only tasks the user actually started (and has not stopped) keep
    // re-attempting.
    let startable = matches!(
        task.status,
        crate::types::TaskStatus::Running | crate::types::TaskStatus::Pending
    ) && task.started_at.is_some();
    if !startable {
        return Ok(());
    }

    match dispatcher.dispatch(&task, &sub, None, DispatchMode::AwaitAccept).await? {
        DispatchOutcome::Started { node_id } => {
            tracing::info!(
                "retried subtask {} of task {} now running on node {node_id}",
                sub.id,
                task.id
            );
        }
        DispatchOutcome::NoCapacity => {
            entry.next_retry_at = Utc::now()
                + chrono::Duration::from_std(retry_queue.policy().base_delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(5));
            retry_queue.push(entry);
        }
        DispatchOutcome::Failed { reason } => {
            dispatcher
                .handle_dispatch_failure(task.id, sub.id, &reason, entry.priority)
                .await?;
        }
    }
    Ok(())
}

// ── Reply handler ────────────────────────────────────────────

/// `<prefix>device_config_reply` → resolve waiters; apply side effects for
/// fire-and-forget start commands nobody is waiting on.
pub struct ReplyHandler {
    pub dispatcher: Arc<SubTaskDispatcher>,
    pub subtasks: Arc<dyn SubTaskStore>,
    pub status: Arc<TaskStatusManager>,
    pub registry: Arc<NodeRegistry>,
}

#[async_trait]
impl BusHandler for ReplyHandler {
    async fn handle(&self, _topic: &str, payload: &serde_json::Value) -> Result<()> {
        let reply: ReplyEnvelope = serde_json::from_value(payload.clone())
            .map_err(|e| MeekError::InvalidInput(format!("malformed command reply: {e}")))?;

        let outcome = match reply.status {
            ReplyStatus::Success => AcceptOutcome::Accepted,
            ReplyStatus::Error => AcceptOutcome::Rejected {
                message: reply
                    .data
                    .message
                    .clone()
                    .or(reply.data.error_code.clone())
                    .unwrap_or_else(|| "node rejected command".into()),
            },
        };

        let had_waiter = self
            .dispatcher
            .tracker()
            .resolve_reply(&reply.message_uuid, outcome.clone());
        if had_waiter || reply.data.cmd_type != Some(CmdType::StartTask) {
            return Ok(());
        }

        // Fire-and-forget start command: the reply is the only place the
        // tentative running state gets confirmed or undone.
        let (Some(task_id), Some(analysis_id)) = (&reply.data.task_id, &reply.data.subtask_id)
        else {
            return Ok(());
        };
        let task_id: i64 = task_id
            .parse()
            .map_err(|_| MeekError::InvalidInput(format!("reply task_id not numeric: {task_id}")))?;
        let Some(sub) = self.subtasks.find_by_analysis_id(task_id, analysis_id).await? else {
            tracing::warn!("reply for unknown subtask {analysis_id} of task {task_id}");
            return Ok(());
        };

        match outcome {
            AcceptOutcome::Accepted => {
                self.status
                    .update_subtask_status(task_id, sub.id, SubTaskStatus::Running)
                    .await?;
            }
            AcceptOutcome::Rejected { message } => {
                if let Some(node_id) = sub.node_id {
                    self.registry.release(node_id, sub.kind).await?;
                }
                self.subtasks
                    .reset_to_pending(sub.id, &format!("node rejected task: {message}"))
                    .await?;
                self.status
                    .update_subtask_status(task_id, sub.id, SubTaskStatus::Pending)
                    .await?;
                self.dispatcher
                    .handle_dispatch_failure(task_id, sub.id, &message, 1)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(mac: &str, cpu: Option<f64>, kind_count: i32, max: i32, weight: f64) -> Node {
        Node {
            id: 1,
            mac_address: mac.into(),
            client_id: None,
            service_type: "analysis".into(),
            hostname: None,
            ip: None,
            port: None,
            version: None,
            status: crate::types::NodeStatus::Online,
            is_active: true,
            last_heartbeat: None,
            offline_at: None,
            needs_task_transfer: false,
            cpu_usage: cpu,
            memory_usage: cpu,
            gpu_usage: cpu,
            image_task_count: 0,
            video_task_count: 0,
            stream_task_count: kind_count,
            max_tasks: max,
            weight,
            capabilities: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_idle_node_scores_higher_than_busy_node() {
        let cfg = DispatchConfig::default();
        let idle = score_node(&node("A", Some(10.0), 0, 4, 1.0), AnalysisKind::Stream, &cfg);
        let busy = score_node(&node("B", Some(90.0), 3, 4, 1.0), AnalysisKind::Stream, &cfg);
        assert!(idle.total > busy.total);
    }

    #[test]
    fn test_missing_gauges_count_as_zero_utilisation() {
        let cfg = DispatchConfig::default();
        let unknown = score_node(&node("A", None, 0, 4, 1.0), AnalysisKind::Stream, &cfg);
        // 0.4 resource + 0.4 balance + 0.2 weight
        assert!((unknown.total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_weight_breaks_ties() {
        let cfg = DispatchConfig::default();
        let light = score_node(&node("A", Some(50.0), 1, 4, 1.0), AnalysisKind::Stream, &cfg);
        let heavy = score_node(&node("B", Some(50.0), 1, 4, 2.0), AnalysisKind::Stream, &cfg);
        assert!(heavy.total > light.total);
    }

    #[tokio::test]
    async fn test_tracker_resolves_reply() {
        let tracker = CommandTracker::new();
        let rx = tracker.register("uuid-1", 7, 12);
        assert!(tracker.resolve_reply("uuid-1", AcceptOutcome::Accepted));
        assert!(matches!(rx.await.unwrap(), AcceptOutcome::Accepted));
        // Second resolve finds nothing.
        assert!(!tracker.resolve_reply("uuid-1", AcceptOutcome::Accepted));
    }

    #[tokio::test]
    async fn test_tracker_implicit_acceptance_via_result() {
        let tracker = CommandTracker::new();
        let rx = tracker.register("uuid-2", 7, 12);
        tracker.notify_result(7, 12);
        assert!(matches!(rx.await.unwrap(), AcceptOutcome::Accepted));
    }

    #[tokio::test]
    async fn test_tracker_abandon_clears_both_indexes() {
        let tracker = CommandTracker::new();
        let _rx = tracker.register("uuid-3", 7, 12);
        tracker.abandon("uuid-3");
        assert!(!tracker.resolve_reply("uuid-3", AcceptOutcome::Accepted));
        // notify_result after abandon is a no-op.
        tracker.notify_result(7, 12);
    }
}
