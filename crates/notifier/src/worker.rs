//! Worker loop that drains the queue under a distributed lock.
//!
//! Every tick the worker refreshes its heartbeat and tries the queue lock.
//! Contention is not an error: the tick is skipped and the worker waits for
//! the next one. While holding the lock it drains one batch, extending the
//! lock before each send, and at most once per sweep interval purges terminal
//! jobs past the retention horizon.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::MissedTickBehavior;

use feedback_common::config::AppConfig;

use crate::dispatcher::{BatchStats, Dispatcher};
use crate::lock::{HeldLock, QUEUE_LOCK_KEY, QueueLock, WorkerHeartbeat};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub lock_key: String,
    pub lock_ttl: Duration,
    /// Terminal jobs older than this are purged; `None` disables the sweep
    pub retention: Option<chrono::Duration>,
    pub sweep_interval: Duration,
}

impl WorkerConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_size: config.batch_size,
            lock_key: QUEUE_LOCK_KEY.to_string(),
            lock_ttl: config.lock_ttl(),
            retention: (config.retention_days > 0).then(|| config.retention()),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another worker holds the lock, or the lock store was unreachable.
    Skipped,
    Processed(BatchStats),
    /// The batch aborted; its jobs are reclaimed after the lease expires.
    Failed,
}

pub struct Worker {
    dispatcher: Arc<Dispatcher>,
    lock: Arc<dyn QueueLock>,
    heartbeat: Option<WorkerHeartbeat>,
    config: WorkerConfig,
    last_sweep: Option<Instant>,
}

impl Worker {
    pub fn new(dispatcher: Arc<Dispatcher>, lock: Arc<dyn QueueLock>, config: WorkerConfig) -> Self {
        Self {
            dispatcher,
            lock,
            heartbeat: None,
            config,
            last_sweep: None,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: WorkerHeartbeat) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub async fn tick(&mut self) -> TickOutcome {
        if let Some(heartbeat) = &self.heartbeat
            && let Err(e) = heartbeat.beat().await
        {
            tracing::warn!(error = %e, "Failed to write worker heartbeat");
        }

        match self.lock.acquire(&self.config.lock_key, self.config.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Queue lock busy, skipping tick");
                return TickOutcome::Skipped;
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not reach lock store, skipping tick");
                return TickOutcome::Skipped;
            }
        }

        let held = HeldLock::new(&*self.lock, &self.config.lock_key, self.config.lock_ttl);
        let result = self
            .dispatcher
            .process_pending_batch_locked(self.config.batch_size, &held)
            .await;
        self.sweep_if_due().await;

        if let Err(e) = self.lock.release(&self.config.lock_key).await {
            tracing::warn!(error = %e, "Failed to release queue lock, it will expire");
        }

        match result {
            Ok(stats) => {
                if stats.processed > 0 {
                    let snapshot = self.dispatcher.metrics().snapshot();
                    tracing::info!(
                        total_processed = snapshot.processed,
                        total_retried = snapshot.retried,
                        avg_processing_ms = snapshot.avg_processing_ms,
                        sent = ?snapshot.sent,
                        failed = ?snapshot.failed,
                        "Delivery metrics"
                    );
                }
                TickOutcome::Processed(stats)
            }
            Err(e) => {
                tracing::error!(error = %e, "Notification tick failed");
                TickOutcome::Failed
            }
        }
    }

    async fn sweep_if_due(&mut self) {
        let Some(retention) = self.config.retention else {
            return;
        };
        if self
            .last_sweep
            .is_some_and(|at| at.elapsed() < self.config.sweep_interval)
        {
            return;
        }
        self.last_sweep = Some(Instant::now());

        if let Err(e) = self.dispatcher.queue().purge_terminal(Utc::now() - retention).await {
            tracing::warn!(error = %e, "Retention sweep failed");
        }
    }

    /// Tick on the poll interval until `shutdown` resolves. A tick already in
    /// progress is allowed to finish.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            worker_id = %self.dispatcher.worker_id(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Notification worker started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut shutdown => break,
            }
            self.tick().await;
        }

        tracing::info!(worker_id = %self.dispatcher.worker_id(), "Notification worker stopped");
    }
}
