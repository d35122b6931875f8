//! In-memory priority queue for inbound broker messages.
//!
//! Broker callbacks enqueue and return; a worker pool drains in priority
//! order. Lower priority value = more urgent. Ten levels are recognised;
//! the topic → priority map is configurable, with the defaults below.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::MeekError;
use crate::topic;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
const DEFAULT_PRIORITY: u8 = 5;

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub depth: usize,
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: serde_json::Value,
    pub priority: u8,
}

struct Inner {
    /// Keyed by (priority, arrival seq): first entry is the most urgent,
    /// last entry is the drop candidate on overflow.
    entries: BTreeMap<(u8, u64), QueuedMessage>,
    latest: HashMap<String, serde_json::Value>,
    seq: u64,
    stats: QueueStats,
}

pub struct MessageQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    priorities: Mutex<Vec<(String, u8)>>,
}

impl MessageQueue {
    pub fn new(capacity: usize, topic_prefix: &str) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                latest: HashMap::new(),
                seq: 0,
                stats: QueueStats::default(),
            }),
            capacity,
            priorities: Mutex::new(default_priorities(topic_prefix)),
        }
    }

    /// Enqueue a message. When the queue is full, the single least-urgent
    /// entry is evicted to make room; if nothing queued is less urgent than
    /// the newcomer, the newcomer itself is dropped. The per-topic latest
    /// map is updated either way.
    pub fn push(&self, topic: &str, payload: serde_json::Value) -> bool {
        let priority = self.priority_for(topic);
        let mut inner = self.inner.lock().expect("message queue poisoned");

        inner.latest.insert(topic.to_string(), payload.clone());

        if inner.entries.len() >= self.capacity {
            let evict = inner
                .entries
                .last_key_value()
                .map(|(k, _)| *k)
                .filter(|(p, _)| *p > priority);
            match evict {
                Some(key) => {
                    inner.entries.remove(&key);
                    inner.stats.dropped += 1;
                    tracing::warn!("message queue full, evicted a priority-{} entry", key.0);
                }
                None => {
                    inner.stats.dropped += 1;
                    tracing::warn!("message queue full, dropping inbound message on {topic}");
                    return false;
                }
            }
        }

        inner.seq += 1;
        let key = (priority, inner.seq);
        inner.entries.insert(
            key,
            QueuedMessage { topic: topic.to_string(), payload, priority },
        );
        inner.stats.enqueued += 1;
        true
    }

    pub fn pop(&self) -> Option<QueuedMessage> {
        let mut inner = self.inner.lock().expect("message queue poisoned");
        let key = *inner.entries.first_key_value()?.0;
        let msg = inner.entries.remove(&key);
        if msg.is_some() {
            inner.stats.dequeued += 1;
        }
        msg
    }

    /// Most recent payload seen on a topic, regardless of queue drops.
    pub fn latest(&self, topic: &str) -> Option<serde_json::Value> {
        self.inner
            .lock()
            .expect("message queue poisoned")
            .latest
            .get(topic)
            .cloned()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("message queue poisoned");
        QueueStats { depth: inner.entries.len(), ..inner.stats.clone() }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("message queue poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_topic_priority(&self, pattern: &str, priority: u8) -> Result<(), MeekError> {
        if !(1..=10).contains(&priority) {
            return Err(MeekError::InvalidInput(format!(
                "priority must be within 1..=10, got {priority}"
            )));
        }
        let mut priorities = self.priorities.lock().expect("priority map poisoned");
        if let Some(slot) = priorities.iter_mut().find(|(p, _)| p == pattern) {
            slot.1 = priority;
        } else {
            priorities.push((pattern.to_string(), priority));
        }
        Ok(())
    }

    fn priority_for(&self, topic: &str) -> u8 {
        let priorities = self.priorities.lock().expect("priority map poisoned");
        // Exact entries first, wildcard patterns after.
        for (pattern, p) in priorities.iter() {
            if pattern == topic {
                return *p;
            }
        }
        for (pattern, p) in priorities.iter() {
            if topic::is_wildcard(pattern) && topic::matches(pattern, topic) {
                return *p;
            }
        }
        DEFAULT_PRIORITY
    }
}

/// Normative defaults: connection changes, explicit commands, stop
/// requests and errors at 1; replies / results / progress at 3;
/// heartbeats and status snapshots at 5; log chatter at 7.
fn default_priorities(prefix: &str) -> Vec<(String, u8)> {
    vec![
        (format!("{prefix}connection"), 1),
        (format!("{prefix}command"), 1),
        (format!("{prefix}stop"), 1),
        (format!("{prefix}error"), 1),
        (format!("{prefix}system/broadcast"), 1),
        (format!("{prefix}device_config_reply"), 3),
        (format!("{prefix}+/result"), 3),
        (format!("{prefix}progress"), 3),
        (format!("{prefix}+/status"), 5),
        (format!("{prefix}heartbeat"), 5),
        (format!("{prefix}logs"), 7),
        (format!("{prefix}+/logs"), 7),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pop_order_by_priority_then_arrival() {
        let q = MessageQueue::new(100, "meek/");
        q.push("meek/AA/status", json!({"n": 1}));
        q.push("meek/AA/result", json!({"n": 2}));
        q.push("meek/connection", json!({"n": 3}));
        q.push("meek/BB/result", json!({"n": 4}));

        assert_eq!(q.pop().unwrap().topic, "meek/connection");
        assert_eq!(q.pop().unwrap().payload["n"], 2);
        assert_eq!(q.pop().unwrap().payload["n"], 4);
        assert_eq!(q.pop().unwrap().topic, "meek/AA/status");
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_overflow_evicts_lowest_priority() {
        let q = MessageQueue::new(2, "meek/");
        q.push("meek/AA/status", json!({"n": 1})); // prio 5
        q.push("meek/AA/logs", json!({"n": 2})); // prio 7
        assert!(q.push("meek/connection", json!({"n": 3}))); // evicts logs

        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().topic, "meek/connection");
        assert_eq!(q.pop().unwrap().topic, "meek/AA/status");
        assert_eq!(q.stats().dropped, 1);
    }

    #[test]
    fn test_overflow_drops_incoming_when_nothing_lower() {
        let q = MessageQueue::new(2, "meek/");
        q.push("meek/connection", json!({"n": 1}));
        q.push("meek/error", json!({"n": 2}));
        // Incoming heartbeat is less urgent than everything queued.
        assert!(!q.push("meek/AA/status", json!({"n": 3})));
        assert_eq!(q.stats().dropped, 1);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_latest_survives_drop() {
        let q = MessageQueue::new(1, "meek/");
        q.push("meek/connection", json!({"n": 1}));
        assert!(!q.push("meek/AA/status", json!({"n": 2})));
        // Dropped from the queue, still visible in the shadow map.
        assert_eq!(q.latest("meek/AA/status").unwrap()["n"], 2);
    }

    #[test]
    fn test_priority_override() {
        let q = MessageQueue::new(100, "meek/");
        q.set_topic_priority("meek/AA/status", 1).unwrap();
        q.push("meek/BB/result", json!({})); // 3
        q.push("meek/AA/status", json!({})); // overridden to 1
        assert_eq!(q.pop().unwrap().topic, "meek/AA/status");
    }

    #[test]
    fn test_priority_out_of_range_rejected() {
        let q = MessageQueue::new(100, "meek/");
        assert!(q.set_topic_priority("meek/x", 0).is_err());
        assert!(q.set_topic_priority("meek/x", 11).is_err());
    }

    #[test]
    fn test_unknown_topic_gets_default_priority() {
        let q = MessageQueue::new(100, "meek/");
        q.push("unrelated/topic", json!({}));
        assert_eq!(q.pop().unwrap().priority, 5);
    }
}
