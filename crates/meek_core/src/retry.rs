//! Retry queue for subtasks waiting on a node.
//!
//! Entries become due at `next_retry_at`; pop order is due-time ascending,
//! then priority descending (3 = urgent, 0 = low), then insertion order.
//! Failed dispatches back off exponentially; once the retry budget is
//! spent the subtask is marked errored by the caller. The queue mirrors
//! itself to the cache on an interval and on shutdown so in-flight retries
//! survive a controller restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::{Result, StatusCache};
use crate::types::{SubTaskId, TaskId};

pub const PERSIST_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_secs(5), backoff_factor: 2.0, max_retries: 3 }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_count` (1-based): base · factor^(n-1),
    /// so the first retry waits exactly `base_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = self.backoff_factor.powi(retry_count.saturating_sub(1) as i32);
        self.base_delay.mul_f64(factor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEntry {
    pub task_id: TaskId,
    pub subtask_id: SubTaskId,
    /// 0 lowest — 3 highest.
    pub priority: u8,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RetryEntry {
    pub fn new(task_id: TaskId, subtask_id: SubTaskId, priority: u8) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            subtask_id,
            priority: priority.min(3),
            retry_count: 0,
            next_retry_at: now,
            enqueued_at: now,
            payload: serde_json::Value::Null,
        }
    }

    fn sort_key(&self) -> (i64, i16, i64, SubTaskId) {
        (
            self.next_retry_at.timestamp_millis(),
            3 - self.priority as i16,
            self.enqueued_at.timestamp_millis(),
            self.subtask_id,
        )
    }
}

pub enum RequeueOutcome {
    /// Re-armed; the entry went back on the queue one priority level lower.
    Requeued { next_retry_at: DateTime<Utc>, retry_count: u32 },
    /// Retry budget spent; the entry is gone and the subtask should be
    /// marked errored.
    Exhausted { retry_count: u32 },
}

struct Inner {
    by_subtask: HashMap<SubTaskId, RetryEntry>,
}

pub struct RetryQueue {
    inner: Mutex<Inner>,
    policy: RetryPolicy,
}

impl RetryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { inner: Mutex::new(Inner { by_subtask: HashMap::new() }), policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Insert or replace the entry for this subtask.
    pub fn push(&self, entry: RetryEntry) {
        let mut inner = self.inner.lock().expect("retry queue poisoned");
        inner.by_subtask.insert(entry.subtask_id, entry);
    }

    pub fn contains(&self, subtask_id: SubTaskId) -> bool {
        self.inner
            .lock()
            .expect("retry queue poisoned")
            .by_subtask
            .contains_key(&subtask_id)
    }

    pub fn remove(&self, subtask_id: SubTaskId) -> Option<RetryEntry> {
        self.inner
            .lock()
            .expect("retry queue poisoned")
            .by_subtask
            .remove(&subtask_id)
    }

    pub fn remove_task(&self, task_id: TaskId) {
        self.inner
            .lock()
            .expect("retry queue poisoned")
            .by_subtask
            .retain(|_, e| e.task_id != task_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("retry queue poisoned").by_subtask.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop up to `limit` entries that are due at `now`.
    pub fn pop_due(&self, now: DateTime<Utc>, limit: usize) -> Vec<RetryEntry> {
        let mut inner = self.inner.lock().expect("retry queue poisoned");
        let mut due: Vec<&RetryEntry> =
            inner.by_subtask.values().filter(|e| e.next_retry_at <= now).collect();
        due.sort_by_key(|e| e.sort_key());
        let ids: Vec<SubTaskId> = due.iter().take(limit).map(|e| e.subtask_id).collect();
        ids.iter()
            .filter_map(|id| inner.by_subtask.remove(id))
            .collect()
    }

    /// A dispatch attempt for this entry failed: bump the retry count,
    /// back off, drop one priority level, and requeue — or report the
    /// budget exhausted.
    pub fn requeue_failed(&self, mut entry: RetryEntry) -> RequeueOutcome {
        entry.retry_count += 1;
        if entry.retry_count > self.policy.max_retries {
            return RequeueOutcome::Exhausted { retry_count: entry.retry_count };
        }
        let delay = self.policy.delay_for(entry.retry_count);
        entry.next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(5));
        entry.priority = entry.priority.saturating_sub(1);
        let outcome = RequeueOutcome::Requeued {
            next_retry_at: entry.next_retry_at,
            retry_count: entry.retry_count,
        };
        self.push(entry);
        outcome
    }

    pub fn snapshot(&self) -> Vec<RetryEntry> {
        let inner = self.inner.lock().expect("retry queue poisoned");
        let mut entries: Vec<RetryEntry> = inner.by_subtask.values().cloned().collect();
        entries.sort_by_key(|e| e.sort_key());
        entries
    }

    pub fn restore(&self, entries: Vec<RetryEntry>) {
        let mut inner = self.inner.lock().expect("retry queue poisoned");
        for e in entries {
            inner.by_subtask.insert(e.subtask_id, e);
        }
    }

    /// Load the persisted snapshot from the cache (controller restart).
    pub async fn load_from_cache(&self, cache: &dyn StatusCache) -> Result<usize> {
        let entries = cache.load_retry_snapshot().await?;
        let n = entries.len();
        self.restore(entries);
        if n > 0 {
            tracing::info!("restored {n} retry entries from cache");
        }
        Ok(n)
    }

    pub async fn persist_to_cache(&self, cache: &dyn StatusCache) -> Result<()> {
        cache.save_retry_snapshot(&self.snapshot()).await
    }
}

/// Mirror the queue to the cache every [`PERSIST_INTERVAL`] until `running`
/// goes false, then once more on the way out.
pub fn spawn_persister(
    queue: Arc<RetryQueue>,
    cache: Arc<dyn StatusCache>,
    running: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while running.load(Ordering::Relaxed) {
            tokio::time::sleep(PERSIST_INTERVAL).await;
            if let Err(e) = queue.persist_to_cache(cache.as_ref()).await {
                tracing::error!("retry queue persistence failed: {e}");
            }
        }
        if let Err(e) = queue.persist_to_cache(cache.as_ref()).await {
            tracing::error!("final retry queue persistence failed: {e}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_due_orders_by_time_then_priority() {
        let q = RetryQueue::new(RetryPolicy::default());
        let now = Utc::now();

        let mut a = RetryEntry::new(1, 10, 1);
        a.next_retry_at = now - chrono::Duration::seconds(5);
        let mut b = RetryEntry::new(1, 11, 3);
        b.next_retry_at = now - chrono::Duration::seconds(5);
        let mut c = RetryEntry::new(1, 12, 0);
        c.next_retry_at = now - chrono::Duration::seconds(30);
        let mut d = RetryEntry::new(1, 13, 3);
        d.next_retry_at = now + chrono::Duration::seconds(60);

        q.push(a);
        q.push(b);
        q.push(c);
        q.push(d);

        let due = q.pop_due(now, 10);
        let ids: Vec<SubTaskId> = due.iter().map(|e| e.subtask_id).collect();
        // c is oldest; between a and b (same due time) the higher priority
        // b comes first. d is not yet due.
        assert_eq!(ids, vec![12, 11, 10]);
        assert!(q.contains(13));
    }

    #[test]
    fn test_backoff_delay_grows_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
    }

    #[test]
    fn test_requeue_failed_backs_off_and_lowers_priority() {
        let q = RetryQueue::new(RetryPolicy::default());
        let entry = RetryEntry::new(1, 10, 2);
        let before = Utc::now();

        match q.requeue_failed(entry) {
            RequeueOutcome::Requeued { next_retry_at, retry_count } => {
                assert_eq!(retry_count, 1);
                let delta = (next_retry_at - before).num_milliseconds();
                assert!(delta >= 4_900, "first retry should wait ~5s, waited {delta}ms");
            }
            RequeueOutcome::Exhausted { .. } => panic!("budget should not be spent yet"),
        }
        let snap = q.snapshot();
        assert_eq!(snap[0].priority, 1);
    }

    #[test]
    fn test_requeue_exhausts_after_max_retries() {
        let q = RetryQueue::new(RetryPolicy { max_retries: 3, ..Default::default() });
        let mut entry = RetryEntry::new(1, 10, 1);
        entry.retry_count = 3;
        match q.requeue_failed(entry) {
            RequeueOutcome::Exhausted { retry_count } => assert_eq!(retry_count, 4),
            RequeueOutcome::Requeued { .. } => panic!("expected exhaustion"),
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_push_replaces_existing_subtask_entry() {
        let q = RetryQueue::new(RetryPolicy::default());
        q.push(RetryEntry::new(1, 10, 0));
        q.push(RetryEntry::new(1, 10, 3));
        assert_eq!(q.len(), 1);
        assert_eq!(q.snapshot()[0].priority, 3);
    }

    #[test]
    fn test_remove_task_drops_all_entries() {
        let q = RetryQueue::new(RetryPolicy::default());
        q.push(RetryEntry::new(1, 10, 1));
        q.push(RetryEntry::new(1, 11, 1));
        q.push(RetryEntry::new(2, 20, 1));
        q.remove_task(1);
        assert_eq!(q.len(), 1);
        assert!(q.contains(20));
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let q = RetryQueue::new(RetryPolicy::default());
        q.push(RetryEntry::new(1, 10, 1));
        q.push(RetryEntry::new(2, 20, 2));
        let snap = q.snapshot();

        let restored = RetryQueue::new(RetryPolicy::default());
        restored.restore(snap);
        assert_eq!(restored.len(), 2);
        assert!(restored.contains(10));
        assert!(restored.contains(20));
    }
}
