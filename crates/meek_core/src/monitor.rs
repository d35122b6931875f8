//! Stream monitor: periodically probes the video sources referenced by
//! running tasks and flips their online/offline flag. Streams no running
//! task cares about are not probed — no wasted connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::ports::{Result, StreamProber, StreamStore, TaskStore};
use crate::types::StreamStatus;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub probe_pool_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(60), probe_pool_size: 5 }
    }
}

pub struct StreamMonitor {
    tasks: Arc<dyn TaskStore>,
    streams: Arc<dyn StreamStore>,
    prober: Arc<dyn StreamProber>,
    cfg: MonitorConfig,
}

impl StreamMonitor {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        streams: Arc<dyn StreamStore>,
        prober: Arc<dyn StreamProber>,
        cfg: MonitorConfig,
    ) -> Self {
        Self { tasks, streams, prober, cfg }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.cfg
    }

    /// Probe every stream referenced by a running task; returns how many
    /// were checked.
    pub async fn run_cycle(&self) -> Result<usize> {
        let ids = self.tasks.running_task_stream_ids().await?;
        if ids.is_empty() {
            tracing::debug!("no running task references a stream, skipping probe cycle");
            return Ok(0);
        }
        let streams = self.streams.get_many(&ids).await?;
        let checked = streams.len();

        let pool = Arc::new(Semaphore::new(self.cfg.probe_pool_size.max(1)));
        let mut probes = JoinSet::new();
        for stream in streams {
            let pool = Arc::clone(&pool);
            let prober = Arc::clone(&self.prober);
            probes.spawn(async move {
                let _permit = pool.acquire_owned().await;
                let online = prober.probe(&stream.url).await;
                (stream, online)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let Ok((stream, online)) = joined else {
                continue;
            };
            let status = if online { StreamStatus::Online } else { StreamStatus::Offline };
            if status != stream.status {
                tracing::info!(
                    "stream {} ({}) is now {status:?}",
                    stream.id,
                    stream.name
                );
            }
            if let Err(e) = self.streams.set_status(stream.id, status).await {
                tracing::error!("failed to update status of stream {}: {e}", stream.id);
            }
        }
        Ok(checked)
    }
}

pub fn spawn_monitor_loop(
    monitor: Arc<StreamMonitor>,
    running: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = monitor.config().interval;
        tracing::info!("stream monitor started (interval {interval:?})");
        while running.load(Ordering::Relaxed) {
            tokio::time::sleep(interval).await;
            match monitor.run_cycle().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!("probed {n} streams"),
                Err(e) => tracing::error!("stream probe cycle failed: {e}"),
            }
        }
        tracing::info!("stream monitor stopped");
    })
}
