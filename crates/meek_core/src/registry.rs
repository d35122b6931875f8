//! Node registry: one record per worker MAC address, driven by
//! connect / disconnect / heartbeat messages and queried by the dispatcher.
//!
//! Reads go through an in-memory cache refreshed on a TTL and on every
//! mutation, so scoring never blocks on SQL. The registry is the single
//! writer for node rows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::MeekError;
use crate::ports::{NodeStore, Result};
use crate::proto::{self, ConnectionMessage, ConnectionStatus, HeartbeatMessage};
use crate::router::BusHandler;
use crate::types::{AnalysisKind, Node, NodeHeartbeat, NodeId};

pub const CACHE_TTL: Duration = Duration::from_secs(30);

struct RegistryCache {
    by_id: HashMap<NodeId, Node>,
    refreshed_at: Option<Instant>,
}

pub struct NodeRegistry {
    nodes: Arc<dyn NodeStore>,
    cache: RwLock<RegistryCache>,
    cache_ttl: Duration,
}

impl NodeRegistry {
    pub fn new(nodes: Arc<dyn NodeStore>) -> Self {
        Self {
            nodes,
            cache: RwLock::new(RegistryCache { by_id: HashMap::new(), refreshed_at: None }),
            cache_ttl: CACHE_TTL,
        }
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.nodes
    }

    // ── Message-driven transitions ───────────────────────────

    pub async fn handle_connection(&self, msg: &ConnectionMessage) -> Result<()> {
        match msg.status {
            ConnectionStatus::Online => {
                let node = self.nodes.upsert_online(msg.connect_info()).await?;
                tracing::info!(
                    "node {} ({}) online, max_tasks={}",
                    node.mac_address,
                    node.id,
                    node.max_tasks
                );
                self.cache_put(node).await;
            }
            ConnectionStatus::Offline => {
                let Some(node) = self.nodes.get_by_mac(&msg.mac_address).await? else {
                    tracing::warn!("offline message for unknown node {}", msg.mac_address);
                    return Ok(());
                };
                self.mark_offline(node.id).await?;
                tracing::info!(
                    "node {} ({}) offline, awaiting task transfer",
                    msg.mac_address,
                    node.id
                );
            }
        }
        Ok(())
    }

    pub async fn handle_heartbeat(&self, msg: &HeartbeatMessage) -> Result<()> {
        match self.nodes.record_heartbeat(msg.heartbeat_update()).await? {
            Some(node) => {
                tracing::debug!(
                    "heartbeat from {}: cpu={:?} mem={:?} tasks={}/{}",
                    node.mac_address,
                    node.cpu_usage,
                    node.memory_usage,
                    node.task_count(),
                    node.max_tasks
                );
                self.cache_put(node).await;
            }
            None => {
                tracing::warn!(
                    "heartbeat from unknown node {} without enough metadata to register it",
                    msg.mac_address
                );
            }
        }
        Ok(())
    }

    /// A non-heartbeat status snapshot: `{status, load: {cpu, memory, gpu,
    /// running_tasks}}` keyed by the MAC in the topic.
    pub async fn handle_status_snapshot(&self, mac: &str, payload: &Value) -> Result<()> {
        let load = payload.get("load").cloned().unwrap_or(Value::Null);
        let hb = NodeHeartbeat {
            mac_address: mac.to_string(),
            cpu_usage: load.get("cpu").and_then(Value::as_f64),
            memory_usage: load.get("memory").and_then(Value::as_f64),
            gpu_usage: load.get("gpu").and_then(Value::as_f64),
            task_count: load
                .get("running_tasks")
                .and_then(Value::as_i64)
                .map(|v| v as i32),
            ..NodeHeartbeat::default()
        };
        if let Some(node) = self.nodes.record_heartbeat(hb).await? {
            self.cache_put(node).await;
        }
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────

    pub async fn get(&self, id: NodeId) -> Result<Option<Node>> {
        self.refresh_if_stale().await?;
        Ok(self.cache.read().await.by_id.get(&id).cloned())
    }

    pub async fn get_by_mac(&self, mac: &str) -> Result<Option<Node>> {
        self.refresh_if_stale().await?;
        Ok(self
            .cache
            .read()
            .await
            .by_id
            .values()
            .find(|n| n.mac_address == mac)
            .cloned())
    }

    /// Snapshot of every node currently online and active.
    pub async fn online_nodes(&self) -> Result<Vec<Node>> {
        self.refresh_if_stale().await?;
        Ok(self
            .cache
            .read()
            .await
            .by_id
            .values()
            .filter(|n| n.status == crate::types::NodeStatus::Online && n.is_active)
            .cloned()
            .collect())
    }

    pub async fn all_nodes(&self) -> Result<Vec<Node>> {
        self.refresh_if_stale().await?;
        Ok(self.cache.read().await.by_id.values().cloned().collect())
    }

    // ── Mutations ────────────────────────────────────────────

    pub async fn mark_offline(&self, id: NodeId) -> Result<()> {
        self.nodes.mark_offline(id).await?;
        self.refresh_node(id).await
    }

    pub async fn clear_transfer_flag(&self, id: NodeId) -> Result<()> {
        self.nodes.clear_transfer_flag(id).await?;
        self.refresh_node(id).await
    }

    /// Best-effort counter bump when a subtask is dispatched; the node's
    /// own heartbeat reconciles drift.
    pub async fn reserve(&self, id: NodeId, kind: AnalysisKind) -> Result<()> {
        self.nodes.adjust_kind_count(id, kind, 1).await?;
        self.refresh_node(id).await
    }

    pub async fn release(&self, id: NodeId, kind: AnalysisKind) -> Result<()> {
        self.nodes.adjust_kind_count(id, kind, -1).await?;
        self.refresh_node(id).await
    }

    // ── Cache plumbing ───────────────────────────────────────

    async fn cache_put(&self, node: Node) {
        self.cache.write().await.by_id.insert(node.id, node);
    }

    async fn refresh_node(&self, id: NodeId) -> Result<()> {
        if let Some(node) = self.nodes.get(id).await? {
            self.cache_put(node).await;
        } else {
            self.cache.write().await.by_id.remove(&id);
        }
        Ok(())
    }

    async fn refresh_if_stale(&self) -> Result<()> {
        {
            let cache = self.cache.read().await;
            if let Some(at) = cache.refreshed_at {
                if at.elapsed() < self.cache_ttl {
                    return Ok(());
                }
            }
        }
        let nodes = self.nodes.list().await?;
        let mut cache = self.cache.write().await;
        cache.by_id = nodes.into_iter().map(|n| (n.id, n)).collect();
        cache.refreshed_at = Some(Instant::now());
        tracing::debug!("node cache refreshed, {} nodes", cache.by_id.len());
        Ok(())
    }
}

// ── Typed bus handlers ───────────────────────────────────────

/// `<prefix>connection` → [`NodeRegistry::handle_connection`].
pub struct ConnectionHandler(pub Arc<NodeRegistry>);

#[async_trait]
impl BusHandler for ConnectionHandler {
    async fn handle(&self, _topic: &str, payload: &Value) -> Result<()> {
        let msg: ConnectionMessage = serde_json::from_value(payload.clone())
            .map_err(|e| MeekError::InvalidInput(format!("malformed connection message: {e}")))?;
        // The controller publishes its own retained online message here;
        // only worker fleets belong in the registry.
        if msg.service_type == "api" {
            return Ok(());
        }
        self.0.handle_connection(&msg).await
    }
}

/// `<prefix>+/status` → heartbeat or status snapshot.
pub struct StatusHandler {
    pub registry: Arc<NodeRegistry>,
    pub topic_prefix: String,
}

#[async_trait]
impl BusHandler for StatusHandler {
    async fn handle(&self, topic: &str, payload: &Value) -> Result<()> {
        let is_heartbeat = payload.get("type").and_then(Value::as_str) == Some("heartbeat");
        if is_heartbeat {
            let msg: HeartbeatMessage = serde_json::from_value(payload.clone())
                .map_err(|e| MeekError::InvalidInput(format!("malformed heartbeat: {e}")))?;
            self.registry.handle_heartbeat(&msg).await
        } else {
            let mac = proto::topics::mac_from_topic(&self.topic_prefix, topic).ok_or_else(
                || MeekError::InvalidInput(format!("status topic without MAC level: {topic}")),
            )?;
            self.registry.handle_status_snapshot(&mac, payload).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStores;
    use serde_json::json;

    fn online_msg(mac: &str, client: &str, max_tasks: i32) -> ConnectionMessage {
        serde_json::from_value(json!({
            "status": "online",
            "mac_address": mac,
            "client_id": client,
            "service_type": "analysis",
            "metadata": {"max_tasks": max_tasks, "ip": "10.0.0.5", "hostname": "edge-1"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_creates_node() {
        let stores = MemoryStores::new();
        let registry = NodeRegistry::new(stores.nodes());
        registry.handle_connection(&online_msg("AA:01", "c1", 4)).await.unwrap();

        let node = registry.get_by_mac("AA:01").await.unwrap().unwrap();
        assert_eq!(node.max_tasks, 4);
        assert_eq!(node.status, crate::types::NodeStatus::Online);
        assert_eq!(node.hostname.as_deref(), Some("edge-1"));
    }

    #[tokio::test]
    async fn test_reconnect_with_new_client_id_resets_counters() {
        let stores = MemoryStores::new();
        let registry = NodeRegistry::new(stores.nodes());
        registry.handle_connection(&online_msg("AA:01", "c1", 4)).await.unwrap();
        let node = registry.get_by_mac("AA:01").await.unwrap().unwrap();
        registry.reserve(node.id, AnalysisKind::Stream).await.unwrap();
        assert_eq!(registry.get(node.id).await.unwrap().unwrap().stream_task_count, 1);

        // Same client id: counters survive.
        registry.handle_connection(&online_msg("AA:01", "c1", 4)).await.unwrap();
        assert_eq!(registry.get(node.id).await.unwrap().unwrap().stream_task_count, 1);

        // New client id: the worker restarted, nothing is running there.
        registry.handle_connection(&online_msg("AA:01", "c2", 4)).await.unwrap();
        assert_eq!(registry.get(node.id).await.unwrap().unwrap().stream_task_count, 0);
    }

    #[tokio::test]
    async fn test_offline_sets_transfer_flag() {
        let stores = MemoryStores::new();
        let registry = NodeRegistry::new(stores.nodes());
        registry.handle_connection(&online_msg("AA:01", "c1", 4)).await.unwrap();

        let offline: ConnectionMessage = serde_json::from_value(json!({
            "status": "offline", "mac_address": "AA:01", "client_id": "c1"
        }))
        .unwrap();
        registry.handle_connection(&offline).await.unwrap();

        let node = registry.get_by_mac("AA:01").await.unwrap().unwrap();
        assert_eq!(node.status, crate::types::NodeStatus::Offline);
        assert!(node.needs_task_transfer);
        assert!(node.offline_at.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_from_unknown_mac_synthesizes_node() {
        let stores = MemoryStores::new();
        let registry = NodeRegistry::new(stores.nodes());

        let hb: HeartbeatMessage = serde_json::from_value(json!({
            "type": "heartbeat", "mac_address": "CC:03", "client_id": "c9",
            "service_type": "analysis", "cpu_usage": 12.5, "task_count": 0, "max_tasks": 2
        }))
        .unwrap();
        registry.handle_heartbeat(&hb).await.unwrap();

        let node = registry.get_by_mac("CC:03").await.unwrap().unwrap();
        assert_eq!(node.max_tasks, 2);
        assert_eq!(node.cpu_usage, Some(12.5));
    }

    #[tokio::test]
    async fn test_heartbeat_without_identity_is_ignored() {
        let stores = MemoryStores::new();
        let registry = NodeRegistry::new(stores.nodes());

        let hb: HeartbeatMessage = serde_json::from_value(json!({
            "type": "heartbeat", "mac_address": "DD:04", "cpu_usage": 1.0
        }))
        .unwrap();
        registry.handle_heartbeat(&hb).await.unwrap();
        assert!(registry.get_by_mac("DD:04").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_never_goes_negative() {
        let stores = MemoryStores::new();
        let registry = NodeRegistry::new(stores.nodes());
        registry.handle_connection(&online_msg("AA:01", "c1", 4)).await.unwrap();
        let node = registry.get_by_mac("AA:01").await.unwrap().unwrap();

        registry.release(node.id, AnalysisKind::Image).await.unwrap();
        assert_eq!(registry.get(node.id).await.unwrap().unwrap().image_task_count, 0);
    }
}
