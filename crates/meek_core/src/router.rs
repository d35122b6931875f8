//! Routes drained queue messages to registered handlers.
//!
//! One handler type per message kind is registered against a topic pattern
//! (exact or wildcard). Exact matches dispatch before wildcard matches.
//! Handler errors are logged and never propagate; a message whose
//! `(topic, message_id)` pair was already seen within the dedup TTL is
//! discarded before any handler runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::ports::Result;
use crate::queue::MessageQueue;
use crate::topic;

pub const DEDUP_TTL: Duration = Duration::from_secs(300);

#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: &serde_json::Value) -> Result<()>;
}

struct DedupCache {
    seen: HashMap<String, Instant>,
    ttl: Duration,
}

impl DedupCache {
    /// Returns true when the key was already recorded within the TTL.
    fn check_and_record(&mut self, key: String) -> bool {
        let now = Instant::now();
        if self.seen.len() > 4096 {
            self.seen.retain(|_, t| now.duration_since(*t) < self.ttl);
        }
        match self.seen.get(&key) {
            Some(t) if now.duration_since(*t) < self.ttl => true,
            _ => {
                self.seen.insert(key, now);
                false
            }
        }
    }
}

pub struct MessageRouter {
    exact: Mutex<HashMap<String, Vec<Arc<dyn BusHandler>>>>,
    wildcard: Mutex<Vec<(String, Arc<dyn BusHandler>)>>,
    dedup: Mutex<DedupCache>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::with_dedup_ttl(DEDUP_TTL)
    }

    pub fn with_dedup_ttl(ttl: Duration) -> Self {
        Self {
            exact: Mutex::new(HashMap::new()),
            wildcard: Mutex::new(Vec::new()),
            dedup: Mutex::new(DedupCache { seen: HashMap::new(), ttl }),
        }
    }

    pub fn register(&self, pattern: &str, handler: Arc<dyn BusHandler>) {
        if topic::is_wildcard(pattern) {
            self.wildcard
                .lock()
                .expect("router poisoned")
                .push((pattern.to_string(), handler));
        } else {
            self.exact
                .lock()
                .expect("router poisoned")
                .entry(pattern.to_string())
                .or_default()
                .push(handler);
        }
        tracing::debug!("registered bus handler for {pattern}");
    }

    /// Dispatch one message to every matching handler.
    pub async fn dispatch(&self, topic: &str, payload: &serde_json::Value) {
        if self.is_duplicate(topic, payload) {
            tracing::debug!("dropping duplicate message on {topic}");
            return;
        }

        let mut handlers: Vec<Arc<dyn BusHandler>> = Vec::new();
        if let Some(hs) = self.exact.lock().expect("router poisoned").get(topic) {
            handlers.extend(hs.iter().cloned());
        }
        for (pattern, h) in self.wildcard.lock().expect("router poisoned").iter() {
            if topic::matches(pattern, topic) {
                handlers.push(Arc::clone(h));
            }
        }

        if handlers.is_empty() {
            tracing::debug!("no handler matches topic {topic}");
            return;
        }

        for handler in handlers {
            if let Err(e) = handler.handle(topic, payload).await {
                tracing::error!("handler failed for message on {topic}: {e}");
            }
        }
    }

    fn is_duplicate(&self, topic: &str, payload: &serde_json::Value) -> bool {
        let message_id = payload
            .get("message_id")
            .or_else(|| payload.get("id"))
            .and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        let Some(id) = message_id else {
            // Nothing to key on — pass through.
            return false;
        };
        self.dedup
            .lock()
            .expect("router poisoned")
            .check_and_record(format!("{topic}:{id}"))
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn `workers` tokio tasks draining the queue through the router until
/// `running` goes false. Pops are non-blocking; idle workers nap briefly.
pub fn spawn_workers(
    router: Arc<MessageRouter>,
    queue: Arc<MessageQueue>,
    workers: usize,
    running: Arc<AtomicBool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..workers.max(1))
        .map(|i| {
            let router = Arc::clone(&router);
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            tokio::spawn(async move {
                tracing::debug!("message worker {i} started");
                while running.load(Ordering::Relaxed) {
                    match queue.pop() {
                        Some(msg) => router.dispatch(&msg.topic, &msg.payload).await,
                        None => tokio::time::sleep(Duration::from_millis(10)).await,
                    }
                }
                tracing::debug!("message worker {i} stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Counter(AtomicUsize);

    #[async_trait]
    impl BusHandler for Counter {
        async fn handle(&self, _topic: &str, _payload: &serde_json::Value) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl BusHandler for Failing {
        async fn handle(&self, _topic: &str, _payload: &serde_json::Value) -> Result<()> {
            Err(crate::error::MeekError::InvalidInput("boom".into()))
        }
    }

    #[tokio::test]
    async fn test_exact_and_wildcard_both_dispatch() {
        let router = MessageRouter::new();
        let exact = Arc::new(Counter(AtomicUsize::new(0)));
        let wild = Arc::new(Counter(AtomicUsize::new(0)));
        router.register("meek/AA/result", exact.clone());
        router.register("meek/+/result", wild.clone());

        router.dispatch("meek/AA/result", &json!({})).await;
        assert_eq!(exact.0.load(Ordering::SeqCst), 1);
        assert_eq!(wild.0.load(Ordering::SeqCst), 1);

        router.dispatch("meek/BB/result", &json!({})).await;
        assert_eq!(exact.0.load(Ordering::SeqCst), 1);
        assert_eq!(wild.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplicate_message_id_dispatches_once() {
        let router = MessageRouter::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        router.register("meek/+/result", counter.clone());

        let payload = json!({"message_id": "m-1", "task_id": "1"});
        router.dispatch("meek/AA/result", &payload).await;
        router.dispatch("meek/AA/result", &payload).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        // Same id on a different topic is a different message.
        router.dispatch("meek/BB/result", &payload).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_messages_without_id_are_not_deduplicated() {
        let router = MessageRouter::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        router.register("meek/connection", counter.clone());

        router.dispatch("meek/connection", &json!({"status": "online"})).await;
        router.dispatch("meek/connection", &json!({"status": "online"})).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_others() {
        let router = MessageRouter::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        router.register("meek/x", Arc::new(Failing));
        router.register("meek/x", counter.clone());

        router.dispatch("meek/x", &json!({})).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_pool_drains_queue() {
        let router = Arc::new(MessageRouter::new());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        router.register("meek/+/result", counter.clone());

        let queue = Arc::new(MessageQueue::new(100, "meek/"));
        for i in 0..5 {
            queue.push("meek/AA/result", json!({"message_id": format!("m{i}")}));
        }

        let running = Arc::new(AtomicBool::new(true));
        let handles = spawn_workers(router, queue.clone(), 2, running.clone());

        for _ in 0..100 {
            if counter.0.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        running.store(false, Ordering::Relaxed);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 5);
        assert!(queue.is_empty());
    }
}
