//! Postgres-backed notification queue.
//!
//! Rows move `pending → processing → {sent | retrying | failed}`. Claiming
//! takes a lease (`locked_at`, `locked_by`) with `FOR UPDATE SKIP LOCKED`, so
//! concurrent claimers never receive the same row. A lease older than the
//! configured bound is treated as abandoned and the row becomes claimable
//! again. The holder renews a job's lease right before sending it, so the
//! bound only has to cover one send. Completions are applied only by the
//! lease holder.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use feedback_common::error::AppError;
use feedback_common::types::{
    Channel, ChannelCounts, EnqueueOutcome, JobStatus, NewNotification, NotificationJob,
    QueueStats, metadata_str,
};

use crate::sender::telegram::is_valid_chat_id;

/// Final state of one claimed job, applied by [`JobQueue::complete`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    Sent {
        id: Uuid,
    },
    Retry {
        id: Uuid,
        retry_count: i32,
        scheduled_at: DateTime<Utc>,
        error: String,
    },
    Failed {
        id: Uuid,
        retry_count: i32,
        error: String,
    },
}

impl JobTransition {
    pub fn id(&self) -> Uuid {
        match self {
            JobTransition::Sent { id }
            | JobTransition::Retry { id, .. }
            | JobTransition::Failed { id, .. } => *id,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobTransition::Sent { .. } => JobStatus::Sent,
            JobTransition::Retry { .. } => JobStatus::Retrying,
            JobTransition::Failed { .. } => JobStatus::Failed,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    pending: i64,
    processing: i64,
    sent: i64,
    retrying: i64,
    failed: i64,
    ready_for_processing: i64,
    created_last_hour: i64,
    sent_last_day: i64,
    failed_last_day: i64,
    telegram_sent: i64,
    telegram_failed: i64,
    email_sent: i64,
    email_failed: i64,
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: PgPool,
    lease: Duration,
}

impl JobQueue {
    pub fn new(pool: PgPool, lease: Duration) -> Self {
        Self { pool, lease }
    }

    /// Insert a `pending` job, or return the active job holding the same
    /// dedup key. Never touches existing rows.
    pub async fn enqueue(
        &self,
        new: &NewNotification,
        default_max_retries: i32,
    ) -> Result<EnqueueOutcome, AppError> {
        validate_new(new)?;

        let max_retries = new.max_retries.unwrap_or(default_max_retries);
        let dedup_key = new
            .dedup_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());

        // The active holder of a key can finish between the insert and the
        // lookup, so give the insert another chance before giving up.
        for _ in 0..3 {
            let inserted: Option<Uuid> = sqlx::query_scalar(
                r#"
                INSERT INTO notification_jobs
                    (id, recipient_ref, survey_ref, channel, message_content, status,
                     retry_count, max_retries, scheduled_at, metadata, dedup_key)
                VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, NOW(), $7, $8)
                ON CONFLICT (dedup_key)
                    WHERE dedup_key IS NOT NULL AND status IN ('pending', 'processing', 'retrying')
                    DO NOTHING
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&new.recipient_ref)
            .bind(&new.survey_ref)
            .bind(new.channel.to_string())
            .bind(&new.message_content)
            .bind(max_retries)
            .bind(&new.metadata)
            .bind(dedup_key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(job_id) = inserted {
                tracing::info!(
                    job_id = %job_id,
                    channel = %new.channel,
                    recipient_ref = %new.recipient_ref,
                    "Notification queued"
                );
                return Ok(EnqueueOutcome::Queued { job_id });
            }

            let existing: Option<Uuid> = sqlx::query_scalar(
                r#"
                SELECT id FROM notification_jobs
                WHERE dedup_key = $1 AND status IN ('pending', 'processing', 'retrying')
                LIMIT 1
                "#,
            )
            .bind(dedup_key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(job_id) = existing {
                tracing::debug!(
                    job_id = %job_id,
                    dedup_key = dedup_key.unwrap_or_default(),
                    "Duplicate enqueue ignored"
                );
                return Ok(EnqueueOutcome::Duplicate { job_id });
            }
        }

        Err(AppError::Internal(
            "Enqueue kept conflicting on dedup key".to_string(),
        ))
    }

    /// Lease up to `limit` claimable jobs for `worker_id`, oldest
    /// `scheduled_at` first. Claimable means due `pending`/`retrying`, or
    /// `processing` with an expired lease.
    pub async fn claim_batch(
        &self,
        limit: i64,
        worker_id: &str,
    ) -> Result<Vec<NotificationJob>, AppError> {
        let mut jobs: Vec<NotificationJob> = sqlx::query_as(
            r#"
            UPDATE notification_jobs
            SET status = 'processing', locked_at = NOW(), locked_by = $3, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM notification_jobs
                WHERE (status IN ('pending', 'retrying') AND scheduled_at <= NOW())
                   OR (status = 'processing' AND locked_at < NOW() - make_interval(secs => $2))
                ORDER BY scheduled_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(limit)
        .bind(self.lease.as_secs_f64())
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the subquery order
        jobs.sort_by_key(|j| j.scheduled_at);

        if !jobs.is_empty() {
            tracing::debug!(count = jobs.len(), worker_id, "Claimed notification jobs");
        }
        Ok(jobs)
    }

    /// Restart the lease on a claimed job. `false` means `worker_id` no
    /// longer holds it and the job must not be sent.
    pub async fn renew_lease(&self, id: Uuid, worker_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_jobs
            SET locked_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Hand unsent claims back to the queue without spending a retry. Jobs
    /// that were already retrying stay `retrying`.
    pub async fn release_claims(&self, ids: &[Uuid], worker_id: &str) -> Result<u64, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE notification_jobs
            SET status = CASE WHEN retry_count > 0 THEN 'retrying' ELSE 'pending' END,
                locked_at = NULL, locked_by = NULL, updated_at = NOW()
            WHERE id = ANY($1) AND status = 'processing' AND locked_by = $2
            "#,
        )
        .bind(ids)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            released = result.rows_affected(),
            worker_id,
            "Released unsent notification claims"
        );
        Ok(result.rows_affected())
    }

    /// Apply a batch of completions in one transaction. Each update only
    /// lands while `worker_id` still holds the job's lease; returns the ids
    /// that were applied.
    pub async fn complete(
        &self,
        transitions: &[JobTransition],
        worker_id: &str,
    ) -> Result<Vec<Uuid>, AppError> {
        let mut tx = self.pool.begin().await?;
        let mut applied = Vec::with_capacity(transitions.len());

        for transition in transitions {
            let result = match transition {
                JobTransition::Sent { id } => {
                    sqlx::query(
                        r#"
                        UPDATE notification_jobs
                        SET status = 'sent', sent_at = NOW(), error_message = NULL,
                            locked_at = NULL, locked_by = NULL, updated_at = NOW()
                        WHERE id = $1 AND status = 'processing' AND locked_by = $2
                        "#,
                    )
                    .bind(id)
                    .bind(worker_id)
                    .execute(&mut *tx)
                    .await?
                }
                JobTransition::Retry {
                    id,
                    retry_count,
                    scheduled_at,
                    error,
                } => {
                    sqlx::query(
                        r#"
                        UPDATE notification_jobs
                        SET status = 'retrying', retry_count = $3, scheduled_at = $4,
                            error_message = $5, locked_at = NULL, locked_by = NULL,
                            updated_at = NOW()
                        WHERE id = $1 AND status = 'processing' AND locked_by = $2
                        "#,
                    )
                    .bind(id)
                    .bind(worker_id)
                    .bind(retry_count)
                    .bind(scheduled_at)
                    .bind(error)
                    .execute(&mut *tx)
                    .await?
                }
                JobTransition::Failed {
                    id,
                    retry_count,
                    error,
                } => {
                    sqlx::query(
                        r#"
                        UPDATE notification_jobs
                        SET status = 'failed', retry_count = $3, error_message = $4,
                            locked_at = NULL, locked_by = NULL, updated_at = NOW()
                        WHERE id = $1 AND status = 'processing' AND locked_by = $2
                        "#,
                    )
                    .bind(id)
                    .bind(worker_id)
                    .bind(retry_count)
                    .bind(error)
                    .execute(&mut *tx)
                    .await?
                }
            };

            if result.rows_affected() == 0 {
                tracing::warn!(
                    job_id = %transition.id(),
                    worker_id,
                    "Lease lost before completion, result discarded"
                );
            } else {
                applied.push(transition.id());
            }
        }

        tx.commit().await?;
        Ok(applied)
    }

    pub async fn get(&self, id: Uuid) -> Result<NotificationJob, AppError> {
        sqlx::query_as("SELECT * FROM notification_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification job {} not found", id)))
    }

    pub async fn stats(&self) -> Result<QueueStats, AppError> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'sent') AS sent,
                COUNT(*) FILTER (WHERE status = 'retrying') AS retrying,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (
                    WHERE status IN ('pending', 'retrying') AND scheduled_at <= NOW()
                ) AS ready_for_processing,
                COUNT(*) FILTER (WHERE created_at >= NOW() - INTERVAL '1 hour') AS created_last_hour,
                COUNT(*) FILTER (
                    WHERE status = 'sent' AND updated_at >= NOW() - INTERVAL '24 hours'
                ) AS sent_last_day,
                COUNT(*) FILTER (
                    WHERE status = 'failed' AND updated_at >= NOW() - INTERVAL '24 hours'
                ) AS failed_last_day,
                COUNT(*) FILTER (WHERE channel = 'telegram' AND status = 'sent') AS telegram_sent,
                COUNT(*) FILTER (WHERE channel = 'telegram' AND status = 'failed') AS telegram_failed,
                COUNT(*) FILTER (WHERE channel = 'email' AND status = 'sent') AS email_sent,
                COUNT(*) FILTER (WHERE channel = 'email' AND status = 'failed') AS email_failed
            FROM notification_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.pending,
            processing: row.processing,
            sent: row.sent,
            retrying: row.retrying,
            failed: row.failed,
            ready_for_processing: row.ready_for_processing,
            created_last_hour: row.created_last_hour,
            success_rate: success_rate(row.sent_last_day, row.failed_last_day),
            completed_last_day: row.sent_last_day + row.failed_last_day,
            telegram: ChannelCounts {
                sent: row.telegram_sent,
                failed: row.telegram_failed,
            },
            email: ChannelCounts {
                sent: row.email_sent,
                failed: row.email_failed,
            },
        })
    }

    /// Delete `sent`/`failed` jobs created before `cutoff`.
    pub async fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM notification_jobs WHERE status IN ('sent', 'failed') AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(deleted, cutoff = %cutoff, "Purged terminal notification jobs");
        }
        Ok(deleted)
    }
}

/// Percentage of successful completions, `None` when nothing completed.
pub fn success_rate(sent: i64, failed: i64) -> Option<f64> {
    let total = sent + failed;
    (total > 0).then(|| sent as f64 * 100.0 / total as f64)
}

/// Reject jobs that could never be delivered.
pub fn validate_new(new: &NewNotification) -> Result<(), AppError> {
    if new.recipient_ref.trim().is_empty() {
        return Err(AppError::Validation("recipient_ref must not be empty".to_string()));
    }
    if new.message_content.trim().is_empty() {
        return Err(AppError::Validation("message_content must not be empty".to_string()));
    }
    if !new.metadata.is_object() {
        return Err(AppError::Validation("metadata must be a JSON object".to_string()));
    }
    if new.max_retries.is_some_and(|n| n < 0) {
        return Err(AppError::Validation("max_retries must not be negative".to_string()));
    }

    match new.channel {
        Channel::Telegram => match metadata_str(&new.metadata, "chat_id") {
            Some(chat_id) if is_valid_chat_id(&chat_id) => Ok(()),
            Some(chat_id) => Err(AppError::Validation(format!(
                "chat_id '{}' is not a valid Telegram chat id",
                chat_id
            ))),
            None => Err(AppError::Validation(
                "telegram notifications require metadata.chat_id".to_string(),
            )),
        },
        Channel::Email => match metadata_str(&new.metadata, "email_address") {
            Some(addr) if addr.parse::<lettre::Address>().is_ok() => Ok(()),
            Some(addr) => Err(AppError::Validation(format!(
                "email_address '{}' is not a valid address",
                addr
            ))),
            None => Err(AppError::Validation(
                "email notifications require metadata.email_address".to_string(),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(channel: Channel, metadata: serde_json::Value) -> NewNotification {
        NewNotification {
            recipient_ref: "owner-1".to_string(),
            survey_ref: None,
            channel,
            message_content: "New feedback".to_string(),
            metadata,
            dedup_key: None,
            max_retries: None,
        }
    }

    #[test]
    fn test_validate_telegram() {
        assert!(validate_new(&new_job(Channel::Telegram, serde_json::json!({"chat_id": "-100"}))).is_ok());
        assert!(validate_new(&new_job(Channel::Telegram, serde_json::json!({"chat_id": 12345}))).is_ok());
        assert!(validate_new(&new_job(Channel::Telegram, serde_json::json!({}))).is_err());
        assert!(validate_new(&new_job(Channel::Telegram, serde_json::json!({"chat_id": "abc"}))).is_err());
    }

    #[test]
    fn test_validate_email() {
        assert!(
            validate_new(&new_job(Channel::Email, serde_json::json!({"email_address": "a@b.io"}))).is_ok()
        );
        assert!(
            validate_new(&new_job(Channel::Email, serde_json::json!({"email_address": "a@"}))).is_err()
        );
        assert!(validate_new(&new_job(Channel::Email, serde_json::json!({}))).is_err());
    }

    #[test]
    fn test_validate_common_fields() {
        let mut job = new_job(Channel::Telegram, serde_json::json!({"chat_id": "1"}));
        job.message_content = "  ".to_string();
        assert!(matches!(validate_new(&job), Err(AppError::Validation(_))));

        let mut job = new_job(Channel::Telegram, serde_json::json!({"chat_id": "1"}));
        job.max_retries = Some(-1);
        assert!(validate_new(&job).is_err());

        let job = new_job(Channel::Telegram, serde_json::json!(["chat_id", "1"]));
        assert!(validate_new(&job).is_err());
    }

    #[test]
    fn test_success_rate() {
        assert_eq!(success_rate(0, 0), None);
        assert_eq!(success_rate(9, 1), Some(90.0));
        assert_eq!(success_rate(0, 4), Some(0.0));
    }

    #[test]
    fn test_transition_accessors() {
        let id = Uuid::new_v4();
        let failed = JobTransition::Failed {
            id,
            retry_count: 3,
            error: "boom".to_string(),
        };
        assert_eq!(failed.id(), id);
        assert_eq!(failed.status(), JobStatus::Failed);
        assert_eq!(JobTransition::Sent { id }.status(), JobStatus::Sent);
    }
}
