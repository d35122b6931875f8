//! Background service lifecycle: spawn everything on boot, wind it down
//! on shutdown (flush the status batcher, mirror the retry queue).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meek_core::dispatch::spawn_retry_dispatch_loop;
use meek_core::health::spawn_health_loop;
use meek_core::monitor::spawn_monitor_loop;
use meek_core::retry::spawn_persister;
use meek_core::router::spawn_workers;
use meek_core::status::spawn_batcher;

use crate::state::AppState;

pub struct BackgroundServices {
    running: Arc<AtomicBool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    state: Arc<AppState>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub queue_workers: usize,
    pub batch_interval: Duration,
    pub retry_poll_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_workers: 4,
            batch_interval: meek_core::status::DEFAULT_BATCH_INTERVAL,
            retry_poll_interval: Duration::from_secs(1),
        }
    }
}

impl BackgroundServices {
    /// Restore persisted retry state and start every background loop.
    pub async fn start(state: Arc<AppState>, cfg: RuntimeConfig) -> Self {
        if let Err(e) = state.retry_queue.load_from_cache(state.cache.as_ref()).await {
            tracing::error!("could not restore the retry queue from cache: {e}");
        }

        let running = Arc::new(AtomicBool::new(true));
        let mut handles = Vec::new();

        handles.extend(spawn_workers(
            Arc::clone(&state.message_router),
            Arc::clone(&state.message_queue),
            cfg.queue_workers,
            Arc::clone(&running),
        ));
        handles.push(spawn_batcher(
            Arc::clone(&state.status),
            cfg.batch_interval,
            Arc::clone(&running),
        ));
        handles.push(spawn_health_loop(Arc::clone(&state.health), Arc::clone(&running)));
        handles.push(spawn_monitor_loop(Arc::clone(&state.monitor), Arc::clone(&running)));
        handles.push(spawn_persister(
            Arc::clone(&state.retry_queue),
            Arc::clone(&state.cache),
            Arc::clone(&running),
        ));
        handles.push(spawn_retry_dispatch_loop(
            Arc::clone(&state.dispatcher),
            Arc::clone(&state.retry_queue),
            Arc::clone(&state.tasks),
            Arc::clone(&state.subtasks),
            cfg.retry_poll_interval,
            Arc::clone(&running),
        ));

        tracing::info!("background services started");
        Self { running, handles, state }
    }

    /// Stop the loops and flush in-flight state.
    pub async fn shutdown(self) {
        self.running.store(false, Ordering::Relaxed);
        for handle in self.handles {
            let _ = handle.await;
        }
        if let Err(e) = self.state.status.flush().await {
            tracing::error!("final status flush failed: {e}");
        }
        if let Err(e) = self
            .state
            .retry_queue
            .persist_to_cache(self.state.cache.as_ref())
            .await
        {
            tracing::error!("final retry queue persistence failed: {e}");
        }
        tracing::info!("background services stopped");
    }
}
