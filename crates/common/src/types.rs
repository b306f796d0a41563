use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery channel of a notification job. Immutable after creation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Telegram,
    Email,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Telegram => write!(f, "telegram"),
            Channel::Email => write!(f, "email"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(Channel::Telegram),
            "email" => Ok(Channel::Email),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// Lifecycle state of a notification job.
///
/// `pending → processing → {sent | retrying | failed}`, `retrying → processing → …`.
/// `sent` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Sent,
    Retrying,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Sent => write!(f, "sent"),
            JobStatus::Retrying => write!(f, "retrying"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One unit of delivery work, as persisted in `notification_jobs`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationJob {
    pub id: Uuid,
    /// Owning account (filtering/metrics only)
    pub recipient_ref: String,
    pub survey_ref: Option<String>,
    pub channel: Channel,
    /// Opaque message body
    pub message_content: String,
    pub status: JobStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Earliest time the job may be claimed
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Channel addressing data (`chat_id`, `bot_token`, `email_address`, ...)
    pub metadata: serde_json::Value,
    pub dedup_key: Option<String>,
    /// Lease start, set when claimed
    pub locked_at: Option<DateTime<Utc>>,
    /// Lease owner, set when claimed
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationJob {
    /// Read a metadata field as a string. Numbers are accepted too, since chat ids
    /// frequently arrive as JSON integers.
    pub fn metadata_str(&self, key: &str) -> Option<String> {
        metadata_str(&self.metadata, key)
    }
}

/// Read a string-ish field out of a JSON metadata object.
pub fn metadata_str(metadata: &serde_json::Value, key: &str) -> Option<String> {
    match metadata.get(key)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A request to enqueue a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub recipient_ref: String,
    #[serde(default)]
    pub survey_ref: Option<String>,
    pub channel: Channel,
    pub message_content: String,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
    /// Idempotency token: a second enqueue with the same key is a no-op while
    /// an earlier job with that key is still active.
    #[serde(default)]
    pub dedup_key: Option<String>,
    /// Overrides the configured default when set.
    #[serde(default)]
    pub max_retries: Option<i32>,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum EnqueueOutcome {
    /// A new job row was written.
    Queued { job_id: Uuid },
    /// An active job with the same dedup key already exists; nothing was written.
    Duplicate { job_id: Uuid },
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Queued { job_id } | EnqueueOutcome::Duplicate { job_id } => *job_id,
        }
    }
}

/// Sent/failed totals for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCounts {
    pub sent: i64,
    pub failed: i64,
}

/// Queue introspection snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub retrying: i64,
    pub failed: i64,
    /// Pending/retrying jobs whose `scheduled_at` has passed
    pub ready_for_processing: i64,
    pub created_last_hour: i64,
    /// `sent / (sent + failed)` over jobs completed in the last 24 hours, in percent
    pub success_rate: Option<f64>,
    /// Number of jobs behind `success_rate`
    pub completed_last_day: i64,
    pub telegram: ChannelCounts,
    pub email: ChannelCounts,
}

impl QueueStats {
    pub fn backlog(&self) -> i64 {
        self.pending + self.retrying
    }
}

/// Overall delivery health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health verdict plus the reasons behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub queue: QueueStats,
    pub last_worker_heartbeat: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Sent.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_channel_round_trips_through_text() {
        for channel in [Channel::Telegram, Channel::Email] {
            assert_eq!(channel.to_string().parse::<Channel>().unwrap(), channel);
        }
        assert!("sms".parse::<Channel>().is_err());
    }

    #[test]
    fn test_metadata_str_accepts_numbers() {
        let meta = serde_json::json!({"chat_id": -100123, "email_address": " a@b.c ", "blank": ""});
        assert_eq!(metadata_str(&meta, "chat_id").as_deref(), Some("-100123"));
        assert_eq!(metadata_str(&meta, "email_address").as_deref(), Some("a@b.c"));
        assert_eq!(metadata_str(&meta, "blank"), None);
        assert_eq!(metadata_str(&meta, "missing"), None);
    }

    #[test]
    fn test_new_notification_defaults() {
        let req: NewNotification = serde_json::from_value(serde_json::json!({
            "recipient_ref": "user-7",
            "channel": "email",
            "message_content": "hello"
        }))
        .unwrap();
        assert_eq!(req.metadata, serde_json::json!({}));
        assert!(req.dedup_key.is_none());
        assert!(req.max_retries.is_none());
    }

    #[test]
    fn test_enqueue_outcome_serialization() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(EnqueueOutcome::Duplicate { job_id: id }).unwrap();
        assert_eq!(json["status"], "duplicate");
        assert_eq!(json["job_id"], id.to_string());
    }
}
