//! Survey fan-out: one notification job per enabled channel of the survey's
//! owner.
//!
//! Fire-and-forget from the caller's side. Errors are logged and reported per
//! channel but never returned, so a survey submission cannot fail because of
//! notification delivery.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use feedback_common::types::{Channel, EnqueueOutcome, NewNotification};

use crate::queue::JobQueue;

/// Notification settings of the account that owns the survey.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipientChannels {
    pub recipient_ref: String,
    #[serde(default)]
    pub restaurant_name: Option<String>,
    #[serde(default)]
    pub telegram_enabled: bool,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
    /// Account-specific bot; the configured default bot is used when absent
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    #[serde(default)]
    pub email_enabled: bool,
    #[serde(default)]
    pub email_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurveyNotification {
    pub survey_ref: String,
    pub message_content: String,
    pub recipient: RecipientChannels,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FanoutResult {
    Queued { job_id: Uuid },
    Duplicate { job_id: Uuid },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelFanout {
    pub channel: Channel,
    #[serde(flatten)]
    pub result: FanoutResult,
}

pub fn dedup_key(survey_ref: &str, channel: Channel) -> String {
    format!("survey:{}:{}", survey_ref, channel)
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Jobs for every channel that is both enabled and addressable.
pub fn plan_survey_jobs(request: &SurveyNotification) -> Vec<NewNotification> {
    let recipient = &request.recipient;
    let mut jobs = Vec::new();

    if recipient.telegram_enabled
        && let Some(chat_id) = present(&recipient.telegram_chat_id)
    {
        let mut metadata = serde_json::json!({ "chat_id": chat_id });
        if let Some(token) = present(&recipient.telegram_bot_token) {
            metadata["bot_token"] = token.into();
        }
        if let Some(name) = present(&recipient.restaurant_name) {
            metadata["restaurant_name"] = name.into();
        }
        jobs.push(new_job(request, Channel::Telegram, metadata));
    }

    if recipient.email_enabled
        && let Some(address) = present(&recipient.email_address)
    {
        let mut metadata = serde_json::json!({ "email_address": address });
        if let Some(name) = present(&recipient.restaurant_name) {
            metadata["restaurant_name"] = name.into();
        }
        jobs.push(new_job(request, Channel::Email, metadata));
    }

    jobs
}

fn new_job(request: &SurveyNotification, channel: Channel, metadata: serde_json::Value) -> NewNotification {
    NewNotification {
        recipient_ref: request.recipient.recipient_ref.clone(),
        survey_ref: Some(request.survey_ref.clone()),
        channel,
        message_content: request.message_content.clone(),
        metadata,
        dedup_key: Some(dedup_key(&request.survey_ref, channel)),
        max_retries: None,
    }
}

pub async fn enqueue_survey_notifications(
    queue: &JobQueue,
    default_max_retries: i32,
    request: &SurveyNotification,
) -> Vec<ChannelFanout> {
    let jobs = plan_survey_jobs(request);
    if jobs.is_empty() {
        tracing::debug!(
            survey_ref = %request.survey_ref,
            recipient_ref = %request.recipient.recipient_ref,
            "No notification channels enabled for survey"
        );
    }

    let mut results = Vec::with_capacity(jobs.len());
    for job in jobs {
        let result = match queue.enqueue(&job, default_max_retries).await {
            Ok(EnqueueOutcome::Queued { job_id }) => FanoutResult::Queued { job_id },
            Ok(EnqueueOutcome::Duplicate { job_id }) => FanoutResult::Duplicate { job_id },
            Err(e) => {
                tracing::error!(
                    survey_ref = %request.survey_ref,
                    channel = %job.channel,
                    error = %e,
                    "Failed to queue survey notification"
                );
                FanoutResult::Error {
                    message: e.to_string(),
                }
            }
        };
        results.push(ChannelFanout {
            channel: job.channel,
            result,
        });
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(recipient: RecipientChannels) -> SurveyNotification {
        SurveyNotification {
            survey_ref: "42".to_string(),
            message_content: "<b>New feedback</b>".to_string(),
            recipient,
        }
    }

    #[test]
    fn test_both_channels() {
        let jobs = plan_survey_jobs(&request(RecipientChannels {
            recipient_ref: "owner-1".to_string(),
            restaurant_name: Some("Chez Nous".to_string()),
            telegram_enabled: true,
            telegram_chat_id: Some("-100".to_string()),
            telegram_bot_token: Some("123:abc".to_string()),
            email_enabled: true,
            email_address: Some("owner@example.com".to_string()),
        }));

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].channel, Channel::Telegram);
        assert_eq!(jobs[0].metadata["bot_token"], "123:abc");
        assert_eq!(jobs[0].dedup_key.as_deref(), Some("survey:42:telegram"));
        assert_eq!(jobs[1].channel, Channel::Email);
        assert_eq!(jobs[1].metadata["restaurant_name"], "Chez Nous");
        assert_eq!(jobs[1].dedup_key.as_deref(), Some("survey:42:email"));
    }

    #[test]
    fn test_disabled_or_unaddressed_channels_are_skipped() {
        let jobs = plan_survey_jobs(&request(RecipientChannels {
            recipient_ref: "owner-1".to_string(),
            telegram_enabled: true,
            telegram_chat_id: Some("  ".to_string()),
            email_enabled: false,
            email_address: Some("owner@example.com".to_string()),
            ..Default::default()
        }));
        assert!(jobs.is_empty());
    }

    #[test]
    fn test_telegram_without_own_token() {
        let jobs = plan_survey_jobs(&request(RecipientChannels {
            recipient_ref: "owner-1".to_string(),
            telegram_enabled: true,
            telegram_chat_id: Some("@kitchen".to_string()),
            ..Default::default()
        }));
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].metadata.get("bot_token").is_none());
    }

    #[test]
    fn test_fanout_result_serialization() {
        let json = serde_json::to_value(ChannelFanout {
            channel: Channel::Email,
            result: FanoutResult::Error {
                message: "boom".to_string(),
            },
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"channel": "email", "status": "error", "message": "boom"}));
    }
}
