//! Control plane assembly: one place that wires stores, bus and the core
//! components together. `main` feeds it Postgres/Redis/MQTT adapters;
//! integration tests feed it `MemoryStores` and a recording bus.

use std::sync::Arc;

use meek_core::dispatch::{CommandTracker, DispatchConfig, ReplyHandler, SubTaskDispatcher};
use meek_core::health::{HealthConfig, NodeHealthChecker};
use meek_core::ingest::{ResultHandler, ResultIngester};
use meek_core::monitor::{MonitorConfig, StreamMonitor};
use meek_core::ports::*;
use meek_core::proto::topics;
use meek_core::queue::{MessageQueue, DEFAULT_QUEUE_CAPACITY};
use meek_core::registry::{ConnectionHandler, NodeRegistry, StatusHandler};
use meek_core::retry::{RetryPolicy, RetryQueue};
use meek_core::router::MessageRouter;
use meek_core::service::TaskService;
use meek_core::status::TaskStatusManager;

use crate::market::ModelMarket;

/// Every store port the control plane needs, already `Arc`-wrapped.
pub struct StorePorts {
    pub tasks: Arc<dyn TaskStore>,
    pub subtasks: Arc<dyn SubTaskStore>,
    pub nodes: Arc<dyn NodeStore>,
    pub streams: Arc<dyn StreamStore>,
    pub models: Arc<dyn ModelStore>,
    pub cache: Arc<dyn StatusCache>,
    pub results: Arc<dyn ResultSink>,
}

#[derive(Clone)]
pub struct ControlConfig {
    pub dispatch: DispatchConfig,
    pub health: HealthConfig,
    pub monitor: MonitorConfig,
    pub retry: RetryPolicy,
    pub queue_capacity: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            health: HealthConfig::default(),
            monitor: MonitorConfig::default(),
            retry: RetryPolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

pub struct AppState {
    pub service: Arc<TaskService>,
    pub status: Arc<TaskStatusManager>,
    pub registry: Arc<NodeRegistry>,
    pub dispatcher: Arc<SubTaskDispatcher>,
    pub ingester: Arc<ResultIngester>,
    pub health: Arc<NodeHealthChecker>,
    pub monitor: Arc<StreamMonitor>,
    pub retry_queue: Arc<RetryQueue>,
    pub message_router: Arc<MessageRouter>,
    pub message_queue: Arc<MessageQueue>,
    pub bus: Arc<dyn CommandBus>,
    pub tasks: Arc<dyn TaskStore>,
    pub subtasks: Arc<dyn SubTaskStore>,
    pub streams: Arc<dyn StreamStore>,
    pub models: Arc<dyn ModelStore>,
    pub cache: Arc<dyn StatusCache>,
    pub market: Option<Arc<ModelMarket>>,
}

impl AppState {
    /// The inbound queue is created first (and separately) because the
    /// broker event loop needs somewhere to enqueue before the rest of
    /// the plane is wired.
    pub fn message_queue_for(cfg: &ControlConfig) -> Arc<MessageQueue> {
        Arc::new(MessageQueue::new(cfg.queue_capacity, &cfg.dispatch.topic_prefix))
    }

    /// Wire the whole control plane and register the inbound message
    /// handlers on the router.
    pub fn build(
        stores: StorePorts,
        bus: Arc<dyn CommandBus>,
        message_queue: Arc<MessageQueue>,
        prober: Arc<dyn StreamProber>,
        market: Option<Arc<ModelMarket>>,
        cfg: ControlConfig,
    ) -> Arc<Self> {
        let prefix = cfg.dispatch.topic_prefix.clone();

        let message_router = Arc::new(MessageRouter::new());

        let registry = Arc::new(NodeRegistry::new(Arc::clone(&stores.nodes)));
        let status = Arc::new(TaskStatusManager::new(
            Arc::clone(&stores.cache),
            Arc::clone(&stores.tasks),
            Arc::clone(&stores.subtasks),
        ));
        let tracker = Arc::new(CommandTracker::new());
        let retry_queue = Arc::new(RetryQueue::new(cfg.retry));

        let dispatcher = Arc::new(SubTaskDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&stores.tasks),
            Arc::clone(&stores.subtasks),
            Arc::clone(&stores.models),
            Arc::clone(&stores.streams),
            Arc::clone(&status),
            Arc::clone(&bus),
            Arc::clone(&tracker),
            Arc::clone(&retry_queue),
            cfg.dispatch.clone(),
        ));

        let ingester = Arc::new(ResultIngester::new(
            Arc::clone(&stores.tasks),
            Arc::clone(&stores.subtasks),
            Arc::clone(&status),
            Arc::clone(&registry),
            Arc::clone(&stores.results),
            Arc::clone(&tracker),
        ));

        let health = Arc::new(NodeHealthChecker::new(
            Arc::clone(&registry),
            Arc::clone(&stores.tasks),
            Arc::clone(&stores.subtasks),
            Arc::clone(&dispatcher),
            Arc::clone(&retry_queue),
            Arc::clone(&status),
            cfg.health.clone(),
        ));

        let monitor = Arc::new(StreamMonitor::new(
            Arc::clone(&stores.tasks),
            Arc::clone(&stores.streams),
            prober,
            cfg.monitor.clone(),
        ));

        let service = Arc::new(TaskService::new(
            Arc::clone(&stores.tasks),
            Arc::clone(&stores.subtasks),
            Arc::clone(&stores.models),
            Arc::clone(&stores.streams),
            Arc::clone(&status),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            Arc::clone(&retry_queue),
        ));

        // Typed subscription registry: one handler per message kind.
        message_router.register(
            &topics::connection(&prefix),
            Arc::new(ConnectionHandler(Arc::clone(&registry))),
        );
        message_router.register(
            &topics::status_wildcard(&prefix),
            Arc::new(StatusHandler {
                registry: Arc::clone(&registry),
                topic_prefix: prefix.clone(),
            }),
        );
        message_router.register(
            &topics::device_config_reply(&prefix),
            Arc::new(ReplyHandler {
                dispatcher: Arc::clone(&dispatcher),
                subtasks: Arc::clone(&stores.subtasks),
                status: Arc::clone(&status),
                registry: Arc::clone(&registry),
            }),
        );
        message_router.register(
            &topics::result_wildcard(&prefix),
            Arc::new(ResultHandler(Arc::clone(&ingester))),
        );

        Arc::new(Self {
            service,
            status,
            registry,
            dispatcher,
            ingester,
            health,
            monitor,
            retry_queue,
            message_router,
            message_queue,
            bus,
            tasks: stores.tasks,
            subtasks: stores.subtasks,
            streams: stores.streams,
            models: stores.models,
            cache: stores.cache,
            market,
        })
    }
}
