//! Notification dispatcher: idempotent enqueue and batch processing.
//!
//! A batch is: claim up to `limit` due jobs, then for each one in turn renew
//! its lease, send it through its channel sender and persist the resulting
//! transition before moving on. Send failures never abort the batch; they
//! become `retrying` or `failed` transitions. A database error aborts the
//! batch, raises a critical alert and leaves the remaining claims to be
//! reclaimed once their leases expire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use feedback_common::config::AppConfig;
use feedback_common::error::AppError;
use feedback_common::types::{EnqueueOutcome, NewNotification, NotificationJob};

use crate::alert::{AlertEscalator, CriticalAlert};
use crate::backoff::BackoffPolicy;
use crate::lock::HeldLock;
use crate::metrics::DeliveryMetrics;
use crate::queue::{JobQueue, JobTransition};
use crate::sender::{SendOutcome, SenderSet};

/// Queue-level retry rules.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    /// `max_retries` for jobs that don't specify one
    pub default_max_retries: i32,
    pub retry_backoff: BackoffPolicy,
    /// Fail on a permanent remote error instead of spending the retry budget
    pub skip_retry_on_permanent: bool,
}

impl DeliveryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            default_max_retries: config.max_retries,
            retry_backoff: BackoffPolicy::new(
                Duration::from_secs(config.retry_base_secs),
                config.retry_factor,
                Duration::from_secs(config.retry_max_secs),
                0.1,
            ),
            skip_retry_on_permanent: config.skip_retry_on_permanent,
        }
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            retry_backoff: BackoffPolicy::queue_default(),
            skip_retry_on_permanent: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    pub retried: usize,
}

/// Decide what a send outcome does to a job.
///
/// A failed attempt increments `retry_count`; the job is retried while the
/// new count is below `max_retries`, otherwise it fails. The retry delay is
/// the queue backoff for the new count, stretched to the provider's
/// `retry_after` when that is longer. Rejected jobs fail immediately.
pub fn plan_transition(
    job: &NotificationJob,
    outcome: &SendOutcome,
    policy: &DeliveryPolicy,
    now: DateTime<Utc>,
) -> JobTransition {
    let (error, retry_after) = match outcome {
        SendOutcome::Delivered => return JobTransition::Sent { id: job.id },
        SendOutcome::Rejected { reason } => {
            return JobTransition::Failed {
                id: job.id,
                retry_count: job.retry_count,
                error: format!("rejected: {}", reason),
            };
        }
        SendOutcome::Permanent { reason } if policy.skip_retry_on_permanent => {
            return JobTransition::Failed {
                id: job.id,
                retry_count: job.retry_count,
                error: reason.clone(),
            };
        }
        SendOutcome::Permanent { reason } => (reason.clone(), None),
        SendOutcome::Transient {
            reason,
            retry_after,
        } => (reason.clone(), *retry_after),
    };

    let retry_count = job.retry_count.saturating_add(1);
    if retry_count < job.max_retries {
        let backoff = policy
            .retry_backoff
            .delay(u32::try_from(retry_count - 1).unwrap_or(0));
        let delay = backoff.max(retry_after.unwrap_or_default());
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::hours(1));
        JobTransition::Retry {
            id: job.id,
            retry_count,
            scheduled_at: now + delay,
            error,
        }
    } else {
        JobTransition::Failed {
            id: job.id,
            retry_count: retry_count.min(job.max_retries.max(0)),
            error,
        }
    }
}

pub struct Dispatcher {
    queue: JobQueue,
    senders: SenderSet,
    policy: DeliveryPolicy,
    alerts: AlertEscalator,
    metrics: Arc<DeliveryMetrics>,
    worker_id: String,
}

impl Dispatcher {
    pub fn new(
        queue: JobQueue,
        senders: SenderSet,
        policy: DeliveryPolicy,
        alerts: AlertEscalator,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            queue,
            senders,
            policy,
            alerts,
            metrics,
            worker_id: format!("worker-{}-{}", std::process::id(), &suffix[..8]),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<DeliveryMetrics> {
        &self.metrics
    }

    /// Idempotent enqueue with the policy's default retry budget.
    pub async fn enqueue(&self, new: &NewNotification) -> Result<EnqueueOutcome, AppError> {
        self.queue.enqueue(new, self.policy.default_max_retries).await
    }

    /// Drain one batch without a distributed lock. Single-worker setups and
    /// tests use this; the worker loop goes through
    /// [`process_pending_batch_locked`](Self::process_pending_batch_locked).
    pub async fn process_pending_batch(&self, limit: i64) -> Result<BatchStats, AppError> {
        self.run_batch(limit, None).await
    }

    /// Drain one batch while holding the queue lock. The lock is extended
    /// before every send; once it is lost the unsent claims are handed back
    /// and the batch stops.
    pub async fn process_pending_batch_locked(
        &self,
        limit: i64,
        lock: &HeldLock<'_>,
    ) -> Result<BatchStats, AppError> {
        self.run_batch(limit, Some(lock)).await
    }

    async fn run_batch(
        &self,
        limit: i64,
        lock: Option<&HeldLock<'_>>,
    ) -> Result<BatchStats, AppError> {
        let jobs = match self.queue.claim_batch(limit, &self.worker_id).await {
            Ok(jobs) => jobs,
            Err(e) => {
                self.alerts.raise(CriticalAlert::batch_failed(&e)).await;
                return Err(e);
            }
        };
        if jobs.is_empty() {
            return Ok(BatchStats::default());
        }

        let mut stats = BatchStats::default();
        for (index, job) in jobs.iter().enumerate() {
            if let Some(lock) = lock
                && !lock.extend().await
            {
                let unsent: Vec<Uuid> = jobs[index..].iter().map(|j| j.id).collect();
                if let Err(e) = self.queue.release_claims(&unsent, &self.worker_id).await {
                    tracing::warn!(
                        error = %e,
                        jobs = unsent.len(),
                        "Failed to release claims, leases will expire"
                    );
                }
                break;
            }

            match self.queue.renew_lease(job.id, &self.worker_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        job_id = %job.id,
                        worker_id = %self.worker_id,
                        "Lease lost before send, job skipped"
                    );
                    continue;
                }
                Err(e) => return Err(self.abort_batch(e).await),
            }

            let started = Instant::now();
            let outcome = self.senders.send(job).await;
            let transition = plan_transition(job, &outcome, &self.policy, Utc::now());
            self.metrics
                .record(job.channel, transition.status(), outcome.kind(), started.elapsed());
            log_transition(job, &outcome, &transition);

            // Persist before the next send so a reclaim never sees a
            // delivered job as unsent.
            let applied = match self
                .queue
                .complete(std::slice::from_ref(&transition), &self.worker_id)
                .await
            {
                Ok(applied) => applied,
                Err(e) => return Err(self.abort_batch(e).await),
            };
            if applied.is_empty() {
                continue;
            }

            stats.processed += 1;
            match &transition {
                JobTransition::Sent { .. } => stats.sent += 1,
                JobTransition::Retry { .. } => stats.retried += 1,
                JobTransition::Failed { error, .. } => {
                    stats.failed += 1;
                    self.alerts.raise(CriticalAlert::job_failed(job, error)).await;
                }
            }
        }

        tracing::info!(
            worker_id = %self.worker_id,
            processed = stats.processed,
            sent = stats.sent,
            retried = stats.retried,
            failed = stats.failed,
            "Notification batch processed"
        );
        Ok(stats)
    }

    /// The remaining claims stay `processing` and are reclaimed once their
    /// leases expire.
    async fn abort_batch(&self, error: AppError) -> AppError {
        tracing::error!(error = %error, worker_id = %self.worker_id, "Notification batch aborted");
        self.alerts.raise(CriticalAlert::batch_failed(&error)).await;
        error
    }
}

fn log_transition(job: &NotificationJob, outcome: &SendOutcome, transition: &JobTransition) {
    match transition {
        JobTransition::Sent { .. } => {
            tracing::info!(job_id = %job.id, channel = %job.channel, "Notification sent");
        }
        JobTransition::Retry {
            retry_count,
            scheduled_at,
            error,
            ..
        } => {
            tracing::warn!(
                job_id = %job.id,
                channel = %job.channel,
                retry_count,
                max_retries = job.max_retries,
                outcome = outcome.kind(),
                scheduled_at = %scheduled_at,
                error = %error,
                "Notification failed, retry scheduled"
            );
        }
        JobTransition::Failed {
            retry_count, error, ..
        } => {
            tracing::error!(
                job_id = %job.id,
                channel = %job.channel,
                retry_count,
                outcome = outcome.kind(),
                error = %error,
                "Notification permanently failed"
            );
        }
    }
}
