//! In-memory implementations of every port, used by unit and integration
//! tests (and handy for local experiments). Single `RwLock` around the
//! whole table set keeps the semantics simple; these are not meant for
//! production traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::MeekError;
use crate::ports::*;
use crate::retry::RetryEntry;
use crate::types::*;

#[derive(Default)]
struct Tables {
    tasks: HashMap<TaskId, Task>,
    task_models: HashMap<TaskId, Vec<ModelId>>,
    task_streams: HashMap<TaskId, Vec<StreamId>>,
    subtasks: HashMap<SubTaskId, SubTask>,
    nodes: HashMap<NodeId, Node>,
    streams: HashMap<StreamId, Stream>,
    models: HashMap<ModelId, Model>,
    counters: HashMap<TaskId, StatusCounters>,
    subtask_status: HashMap<SubTaskId, SubTaskStatus>,
    retry_snapshot: Vec<RetryEntry>,
    results: Vec<(TaskId, SubTaskId, serde_json::Value)>,
}

struct Shared {
    tables: RwLock<Tables>,
    next_id: AtomicI64,
}

impl Shared {
    fn next(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// All in-memory adapters share one `Shared`; the accessor methods hand
/// out `Arc<dyn Trait>` views over it.
#[derive(Clone)]
pub struct MemoryStores {
    shared: Arc<Shared>,
    bus: Arc<RecordingBus>,
}

impl MemoryStores {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                next_id: AtomicI64::new(1),
            }),
            bus: Arc::new(RecordingBus::new()),
        }
    }

    pub fn tasks(&self) -> Arc<dyn TaskStore> {
        Arc::new(MemoryTaskStore(Arc::clone(&self.shared)))
    }

    pub fn subtasks(&self) -> Arc<dyn SubTaskStore> {
        Arc::new(MemorySubTaskStore(Arc::clone(&self.shared)))
    }

    pub fn nodes(&self) -> Arc<dyn NodeStore> {
        Arc::new(MemoryNodeStore(Arc::clone(&self.shared)))
    }

    pub fn streams(&self) -> Arc<dyn StreamStore> {
        Arc::new(MemoryStreamStore(Arc::clone(&self.shared)))
    }

    pub fn models(&self) -> Arc<dyn ModelStore> {
        Arc::new(MemoryModelStore(Arc::clone(&self.shared)))
    }

    pub fn cache(&self) -> Arc<dyn StatusCache> {
        Arc::new(MemoryStatusCache(Arc::clone(&self.shared)))
    }

    pub fn results(&self) -> Arc<dyn ResultSink> {
        Arc::new(MemoryResultSink(Arc::clone(&self.shared)))
    }

    pub fn bus(&self) -> Arc<dyn CommandBus> {
        Arc::clone(&self.bus) as Arc<dyn CommandBus>
    }

    pub fn recording_bus(&self) -> Arc<RecordingBus> {
        Arc::clone(&self.bus)
    }

    pub fn set_bus_connected(&self, connected: bool) {
        self.bus.set_connected(connected);
    }

    pub async fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.bus.published().await
    }

    pub async fn persisted_results(&self) -> Vec<(TaskId, SubTaskId, serde_json::Value)> {
        self.shared.tables.read().await.results.clone()
    }

    /// Insert a ready-to-dispatch online node.
    pub async fn seed_node(&self, mac: &str, max_tasks: i32) -> Node {
        self.nodes()
            .upsert_online(NodeConnectInfo {
                mac_address: mac.into(),
                client_id: format!("client-{mac}"),
                service_type: "analysis".into(),
                hostname: None,
                ip: None,
                port: None,
                version: None,
                max_tasks: Some(max_tasks),
                capabilities: serde_json::json!({}),
                cpu_usage: Some(10.0),
                memory_usage: Some(10.0),
                gpu_usage: None,
            })
            .await
            .expect("seeding a node cannot fail in memory")
    }
}

fn not_found<T>(what: &str, id: i64) -> std::result::Result<T, MeekError> {
    Err(MeekError::NotFound(format!("{what} {id}")))
}

// ── TaskStore ────────────────────────────────────────────────

struct MemoryTaskStore(Arc<Shared>);

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, new: NewTask) -> Result<Task> {
        let id = self.0.next();
        let now = Utc::now();
        let task = Task {
            id,
            name: new.name,
            kind: new.kind,
            image_urls: new.image_urls,
            video_urls: new.video_urls,
            config: new.config,
            save_result: new.save_result,
            save_images: new.save_images,
            analysis_interval: new.analysis_interval,
            status: TaskStatus::Pending,
            active_subtasks: 0,
            total_subtasks: new.total_subtasks,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
            completed_at: None,
        };
        let mut tables = self.0.tables.write().await;
        tables.task_models.insert(id, new.model_ids);
        tables.task_streams.insert(id, new.stream_ids);
        tables.tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.0.tables.read().await.tasks.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.0.tables.read().await.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn set_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut tables = self.0.tables.write().await;
        let Some(task) = tables.tasks.get_mut(&id) else {
            return not_found("task", id);
        };
        let now = Utc::now();
        task.status = status;
        task.error_message = error_message.map(str::to_string);
        task.updated_at = now;
        match status {
            TaskStatus::Running => task.started_at = Some(now),
            TaskStatus::Stopped => task.stopped_at = Some(now),
            TaskStatus::Completed => task.completed_at = Some(now),
            _ => {}
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
        let mut tables = self.0.tables.write().await;
        let now = Utc::now();
        for (sub_id, status) in subtask_updates {
            if let Some(sub) = tables.subtasks.get_mut(sub_id) {
                sub.status = *status;
                sub.updated_at = now;
                if *status == SubTaskStatus::Completed && sub.completed_at.is_none() {
                    sub.completed_at = Some(now);
                }
            }
        }
        let Some(task) = tables.tasks.get_mut(&id) else {
            return not_found("task", id);
        };
        task.status = derived;
        task.active_subtasks = active;
        task.total_subtasks = total;
        task.updated_at = now;
        if derived == TaskStatus::Completed && task.completed_at.is_none() {
            task.completed_at = Some(now);
        }
        Ok(())
    }

    async fn delete(&self, id: TaskId) -> Result<()> {
        let mut tables = self.0.tables.write().await;
        tables.tasks.remove(&id);
        tables.task_models.remove(&id);
        tables.task_streams.remove(&id);
        Ok(())
    }

    async fn model_ids(&self, id: TaskId) -> Result<Vec<ModelId>> {
        Ok(self.0.tables.read().await.task_models.get(&id).cloned().unwrap_or_default())
    }

    async fn stream_ids(&self, id: TaskId) -> Result<Vec<StreamId>> {
        Ok(self.0.tables.read().await.task_streams.get(&id).cloned().unwrap_or_default())
    }

    async fn running_task_stream_ids(&self) -> Result<Vec<StreamId>> {
        let tables = self.0.tables.read().await;
        let mut ids: Vec<StreamId> = tables
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .flat_map(|t| tables.task_streams.get(&t.id).cloned().unwrap_or_default())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}

// ── SubTaskStore ─────────────────────────────────────────────

struct MemorySubTaskStore(Arc<Shared>);

#[async_trait]
impl SubTaskStore for MemorySubTaskStore {
    async fn insert_many(&self, new: Vec<NewSubTask>) -> Result<Vec<SubTask>> {
        let mut out = Vec::with_capacity(new.len());
        let now = Utc::now();
        let mut tables = self.0.tables.write().await;
        for n in new {
            let id = self.0.next();
            let sub = SubTask {
                id,
                task_id: n.task_id,
                kind: n.kind,
                model_id: n.model_id,
                source: n.source,
                config: n.config,
                detail: n.detail,
                status: SubTaskStatus::Pending,
                node_id: None,
                analysis_id: None,
                started_at: None,
                completed_at: None,
                error_message: None,
                retry_count: 0,
                created_at: now,
                updated_at: now,
            };
            tables.subtasks.insert(id, sub.clone());
            out.push(sub);
        }
        Ok(out)
    }

    async fn get(&self, id: SubTaskId) -> Result<Option<SubTask>> {
        Ok(self.0.tables.read().await.subtasks.get(&id).cloned())
    }

    async fn list_for_task(&self, task_id: TaskId) -> Result<Vec<SubTask>> {
        let mut subs: Vec<SubTask> = self
            .0
            .tables
            .read()
            .await
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.id);
        Ok(subs)
    }

    async fn list_for_task_with_status(
        &self,
        task_id: TaskId,
        status: SubTaskStatus,
    ) -> Result<Vec<SubTask>> {
        Ok(self
            .list_for_task(task_id)
            .await?
            .into_iter()
            .filter(|s| s.status == status)
            .collect())
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<SubTask>> {
        let mut subs: Vec<SubTask> = self
            .0
            .tables
            .read()
            .await
            .subtasks
            .values()
            .filter(|s| s.status == SubTaskStatus::Pending)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.id);
        subs.truncate(limit.max(0) as usize);
        Ok(subs)
    }

    async fn list_running_on_node(&self, node_id: NodeId) -> Result<Vec<SubTask>> {
        let mut subs: Vec<SubTask> = self
            .0
            .tables
            .read()
            .await
            .subtasks
            .values()
            .filter(|s| s.node_id == Some(node_id) && s.status == SubTaskStatus::Running)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.id);
        Ok(subs)
    }

    async fn find_by_analysis_id(
        &self,
        task_id: TaskId,
        analysis_id: &str,
    ) -> Result<Option<SubTask>> {
        Ok(self
            .0
            .tables
            .read()
            .await
            .subtasks
            .values()
            .find(|s| s.task_id == task_id && s.analysis_id.as_deref() == Some(analysis_id))
            .cloned())
    }

    async fn mark_dispatched(
        &self,
        id: SubTaskId,
        node_id: NodeId,
        analysis_id: &str,
    ) -> Result<()> {
        let mut tables = self.0.tables.write().await;
        let Some(sub) = tables.subtasks.get_mut(&id) else {
            return not_found("subtask", id);
        };
        sub.node_id = Some(node_id);
        sub.analysis_id = Some(analysis_id.to_string());
        sub.started_at = Some(Utc::now());
        sub.updated_at = Utc::now();
        Ok(())
    }

    async fn reassign_node(&self, id: SubTaskId, node_id: NodeId, note: &str) -> Result<()> {
        let mut tables = self.0.tables.write().await;
        let Some(sub) = tables.subtasks.get_mut(&id) else {
            return not_found("subtask", id);
        };
        sub.node_id = Some(node_id);
        sub.error_message = Some(note.to_string());
        sub.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_to_pending(&self, id: SubTaskId, note: &str) -> Result<()> {
        let mut tables = self.0.tables.write().await;
        let Some(sub) = tables.subtasks.get_mut(&id) else {
            return not_found("subtask", id);
        };
        sub.status = SubTaskStatus::Pending;
        sub.node_id = None;
        sub.analysis_id = None;
        sub.started_at = None;
        sub.error_message = Some(note.to_string());
        sub.updated_at = Utc::now();
        Ok(())
    }

    async fn set_error(&self, id: SubTaskId, message: &str) -> Result<()> {
        let mut tables = self.0.tables.write().await;
        let Some(sub) = tables.subtasks.get_mut(&id) else {
            return not_found("subtask", id);
        };
        sub.error_message = Some(message.to_string());
        sub.updated_at = Utc::now();
        Ok(())
    }

    async fn set_completed_at(&self, id: SubTaskId, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.0.tables.write().await;
        let Some(sub) = tables.subtasks.get_mut(&id) else {
            return not_found("subtask", id);
        };
        sub.completed_at = Some(at);
        sub.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_retry(&self, id: SubTaskId) -> Result<i32> {
        let mut tables = self.0.tables.write().await;
        let Some(sub) = tables.subtasks.get_mut(&id) else {
            return not_found("subtask", id);
        };
        sub.retry_count += 1;
        sub.updated_at = Utc::now();
        Ok(sub.retry_count)
    }

    async fn delete_for_task(&self, task_id: TaskId) -> Result<Vec<SubTaskId>> {
        let mut tables = self.0.tables.write().await;
        let ids: Vec<SubTaskId> = tables
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id)
            .map(|s| s.id)
            .collect();
        for id in &ids {
            tables.subtasks.remove(id);
        }
        Ok(ids)
    }
}

// ── NodeStore ────────────────────────────────────────────────

struct MemoryNodeStore(Arc<Shared>);

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn upsert_online(&self, info: NodeConnectInfo) -> Result<Node> {
        let mut tables = self.0.tables.write().await;
        let now = Utc::now();
        let existing = tables
            .nodes
            .values()
            .find(|n| n.mac_address == info.mac_address)
            .map(|n| n.id);

        let node = match existing {
            Some(id) => {
                let node = tables.nodes.get_mut(&id).expect("index consistent");
                let restarted = node.client_id.as_deref() != Some(info.client_id.as_str());
                node.status = NodeStatus::Online;
                node.is_active = true;
                node.client_id = Some(info.client_id);
                node.service_type = info.service_type;
                node.hostname = info.hostname;
                node.ip = info.ip;
                node.port = info.port;
                node.version = info.version.or(node.version.take());
                if let Some(max) = info.max_tasks {
                    node.max_tasks = max;
                }
                node.capabilities = info.capabilities;
                node.cpu_usage = info.cpu_usage.or(node.cpu_usage);
                node.memory_usage = info.memory_usage.or(node.memory_usage);
                node.gpu_usage = info.gpu_usage.or(node.gpu_usage);
                node.last_heartbeat = Some(now);
                node.needs_task_transfer = false;
                node.offline_at = None;
                node.updated_at = now;
                if restarted {
                    node.image_task_count = 0;
                    node.video_task_count = 0;
                    node.stream_task_count = 0;
                }
                node.clone()
            }
            None => {
                let id = self.0.next();
                let node = Node {
                    id,
                    mac_address: info.mac_address,
                    client_id: Some(info.client_id),
                    service_type: info.service_type,
                    hostname: info.hostname,
                    ip: info.ip,
                    port: info.port,
                    version: info.version,
                    status: NodeStatus::Online,
                    is_active: true,
                    last_heartbeat: Some(now),
                    offline_at: None,
                    needs_task_transfer: false,
                    cpu_usage: info.cpu_usage,
                    memory_usage: info.memory_usage,
                    gpu_usage: info.gpu_usage,
                    image_task_count: 0,
                    video_task_count: 0,
                    stream_task_count: 0,
                    max_tasks: info.max_tasks.unwrap_or(20),
                    weight: 1.0,
                    capabilities: info.capabilities,
                    created_at: now,
                    updated_at: now,
                };
                tables.nodes.insert(id, node.clone());
                node
            }
        };
        Ok(node)
    }

    async fn get(&self, id: NodeId) -> Result<Option<Node>> {
        Ok(self.0.tables.read().await.nodes.get(&id).cloned())
    }

    async fn get_by_mac(&self, mac: &str) -> Result<Option<Node>> {
        Ok(self
            .0
            .tables
            .read()
            .await
            .nodes
            .values()
            .find(|n| n.mac_address == mac)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self.0.tables.read().await.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn list_online(&self) -> Result<Vec<Node>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|n| n.status == NodeStatus::Online && n.is_active)
            .collect())
    }

    async fn mark_offline(&self, id: NodeId) -> Result<()> {
        let mut tables = self.0.tables.write().await;
        let Some(node) = tables.nodes.get_mut(&id) else {
            return not_found("node", id);
        };
        node.status = NodeStatus::Offline;
        node.offline_at = Some(Utc::now());
        node.needs_task_transfer = true;
        node.updated_at = Utc::now();
        Ok(())
    }

    async fn clear_transfer_flag(&self, id: NodeId) -> Result<()> {
        let mut tables = self.0.tables.write().await;
        let Some(node) = tables.nodes.get_mut(&id) else {
            return not_found("node", id);
        };
        node.needs_task_transfer = false;
        node.updated_at = Utc::now();
        Ok(())
    }

    async fn record_heartbeat(&self, hb: NodeHeartbeat) -> Result<Option<Node>> {
        let mut tables = self.0.tables.write().await;
        let now = Utc::now();
        let existing = tables
            .nodes
            .values()
            .find(|n| n.mac_address == hb.mac_address)
            .map(|n| n.id);

        if let Some(id) = existing {
            let node = tables.nodes.get_mut(&id).expect("index consistent");
            node.last_heartbeat = Some(now);
            node.status = NodeStatus::Online;
            if let Some(v) = hb.cpu_usage {
                node.cpu_usage = Some(v);
            }
            if let Some(v) = hb.memory_usage {
                node.memory_usage = Some(v);
            }
            if let Some(v) = hb.gpu_usage {
                node.gpu_usage = Some(v);
            }
            if let Some(v) = hb.max_tasks {
                node.max_tasks = v;
            }
            if let Some(v) = hb.is_active {
                node.is_active = v;
            }
            if let Some(v) = hb.client_id {
                node.client_id = Some(v);
            }
            if let Some(v) = hb.service_type {
                node.service_type = v;
            }
            node.updated_at = now;
            return Ok(Some(node.clone()));
        }

        if !hb.can_synthesize_node() {
            return Ok(None);
        }
        let id = self.0.next();
        let node = Node {
            id,
            mac_address: hb.mac_address,
            client_id: hb.client_id,
            service_type: hb.service_type.unwrap_or_else(|| "analysis".into()),
            hostname: None,
            ip: None,
            port: None,
            version: None,
            status: NodeStatus::Online,
            is_active: hb.is_active.unwrap_or(true),
            last_heartbeat: Some(now),
            offline_at: None,
            needs_task_transfer: false,
            cpu_usage: hb.cpu_usage,
            memory_usage: hb.memory_usage,
            gpu_usage: hb.gpu_usage,
            image_task_count: 0,
            video_task_count: 0,
            stream_task_count: 0,
            max_tasks: hb.max_tasks.unwrap_or(4),
            weight: 1.0,
            capabilities: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        tables.nodes.insert(id, node.clone());
        Ok(Some(node))
    }

    async fn adjust_kind_count(&self, id: NodeId, kind: AnalysisKind, delta: i32) -> Result<()> {
        let mut tables = self.0.tables.write().await;
        let Some(node) = tables.nodes.get_mut(&id) else {
            return not_found("node", id);
        };
        let slot = match kind {
            AnalysisKind::Image => &mut node.image_task_count,
            AnalysisKind::Video => &mut node.video_task_count,
            AnalysisKind::Stream => &mut node.stream_task_count,
        };
        *slot = (*slot + delta).max(0);
        node.updated_at = Utc::now();
        Ok(())
    }

    async fn stale_online(&self, cutoff: DateTime<Utc>) -> Result<Vec<Node>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|n| {
                n.status == NodeStatus::Online
                    && n.is_active
                    && n.last_heartbeat.map(|hb| hb < cutoff).unwrap_or(true)
            })
            .collect())
    }

    async fn transfer_pending(&self) -> Result<Vec<Node>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|n| n.status == NodeStatus::Offline && n.needs_task_transfer)
            .collect())
    }
}

// ── StreamStore / ModelStore ─────────────────────────────────

struct MemoryStreamStore(Arc<Shared>);

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn insert(&self, name: &str, url: &str, group_ids: &[GroupId]) -> Result<Stream> {
        let id = self.0.next();
        let now = Utc::now();
        let stream = Stream {
            id,
            name: name.to_string(),
            url: url.to_string(),
            status: StreamStatus::Offline,
            group_ids: group_ids.to_vec(),
            created_at: now,
            updated_at: now,
        };
        self.0.tables.write().await.streams.insert(id, stream.clone());
        Ok(stream)
    }

    async fn get(&self, id: StreamId) -> Result<Option<Stream>> {
        Ok(self.0.tables.read().await.streams.get(&id).cloned())
    }

    async fn get_many(&self, ids: &[StreamId]) -> Result<Vec<Stream>> {
        let tables = self.0.tables.read().await;
        Ok(ids.iter().filter_map(|id| tables.streams.get(id).cloned()).collect())
    }

    async fn list(&self) -> Result<Vec<Stream>> {
        let mut streams: Vec<Stream> =
            self.0.tables.read().await.streams.values().cloned().collect();
        streams.sort_by_key(|s| s.id);
        Ok(streams)
    }

    async fn set_status(&self, id: StreamId, status: StreamStatus) -> Result<()> {
        let mut tables = self.0.tables.write().await;
        let Some(stream) = tables.streams.get_mut(&id) else {
            return not_found("stream", id);
        };
        stream.status = status;
        stream.updated_at = Utc::now();
        Ok(())
    }
}

struct MemoryModelStore(Arc<Shared>);

#[async_trait]
impl ModelStore for MemoryModelStore {
    async fn upsert_by_code(&self, new: NewModel) -> Result<Model> {
        let mut tables = self.0.tables.write().await;
        let now = Utc::now();
        let existing = tables.models.values().find(|m| m.code == new.code).map(|m| m.id);
        let model = match existing {
            Some(id) => {
                let model = tables.models.get_mut(&id).expect("index consistent");
                model.name = new.name;
                model.version = new.version;
                model.class_count = new.class_count;
                model.classes = new.classes;
                model.updated_at = now;
                model.clone()
            }
            None => {
                let id = self.0.next();
                let model = Model {
                    id,
                    code: new.code,
                    name: new.name,
                    version: new.version,
                    class_count: new.class_count,
                    classes: new.classes,
                    created_at: now,
                    updated_at: now,
                };
                tables.models.insert(id, model.clone());
                model
            }
        };
        Ok(model)
    }

    async fn get(&self, id: ModelId) -> Result<Option<Model>> {
        Ok(self.0.tables.read().await.models.get(&id).cloned())
    }

    async fn get_many(&self, ids: &[ModelId]) -> Result<Vec<Model>> {
        let tables = self.0.tables.read().await;
        Ok(ids.iter().filter_map(|id| tables.models.get(id).cloned()).collect())
    }

    async fn list(&self) -> Result<Vec<Model>> {
        let mut models: Vec<Model> = self.0.tables.read().await.models.values().cloned().collect();
        models.sort_by_key(|m| m.id);
        Ok(models)
    }
}

// ── StatusCache / ResultSink ─────────────────────────────────

struct MemoryStatusCache(Arc<Shared>);

#[async_trait]
impl StatusCache for MemoryStatusCache {
    async fn get_counters(&self, task_id: TaskId) -> Result<Option<StatusCounters>> {
        Ok(self.0.tables.read().await.counters.get(&task_id).cloned())
    }

    async fn set_counters(&self, task_id: TaskId, counters: &StatusCounters) -> Result<()> {
        self.0.tables.write().await.counters.insert(task_id, counters.clone());
        Ok(())
    }

    async fn get_subtask_status(&self, id: SubTaskId) -> Result<Option<SubTaskStatus>> {
        Ok(self.0.tables.read().await.subtask_status.get(&id).copied())
    }

    async fn set_subtask_status(&self, id: SubTaskId, status: SubTaskStatus) -> Result<()> {
        self.0.tables.write().await.subtask_status.insert(id, status);
        Ok(())
    }

    async fn forget_task(&self, task_id: TaskId, subtask_ids: &[SubTaskId]) -> Result<()> {
        let mut tables = self.0.tables.write().await;
        tables.counters.remove(&task_id);
        for id in subtask_ids {
            tables.subtask_status.remove(id);
        }
        Ok(())
    }

    async fn save_retry_snapshot(&self, entries: &[RetryEntry]) -> Result<()> {
        self.0.tables.write().await.retry_snapshot = entries.to_vec();
        Ok(())
    }

    async fn load_retry_snapshot(&self) -> Result<Vec<RetryEntry>> {
        Ok(self.0.tables.read().await.retry_snapshot.clone())
    }
}

struct MemoryResultSink(Arc<Shared>);

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn persist(
        &self,
        task_id: TaskId,
        subtask_id: SubTaskId,
        results: &serde_json::Value,
    ) -> Result<()> {
        self.0
            .tables
            .write()
            .await
            .results
            .push((task_id, subtask_id, results.clone()));
        Ok(())
    }
}

// ── RecordingBus ─────────────────────────────────────────────

/// CommandBus stub that records every publish; tests flip connectivity to
/// exercise the database-still-moves paths.
pub struct RecordingBus {
    connected: AtomicBool,
    published: RwLock<Vec<(String, serde_json::Value)>>,
}

impl RecordingBus {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { connected: AtomicBool::new(true), published: RwLock::new(Vec::new()) }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.published.read().await.clone()
    }

    pub async fn clear(&self) {
        self.published.write().await.clear();
    }
}

#[async_trait]
impl CommandBus for RecordingBus {
    async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        _qos: QosLevel,
        _retain: bool,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(MeekError::Transport("bus disconnected".into()));
        }
        self.published.write().await.push((topic.to_string(), payload));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
