//! Channel senders.
//!
//! A sender performs one delivery attempt for a job and classifies the result
//! into a [`SendOutcome`]. Senders never return errors: every failure is
//! folded into the outcome so the dispatcher can branch on it directly.

pub mod email;
pub mod resilient;
pub mod telegram;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use feedback_common::types::{Channel, NotificationJob};

/// Result of a delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The remote accepted the message.
    Delivered,
    /// Timeout, 5xx, rate limiting or an open circuit. Worth retrying.
    Transient {
        reason: String,
        /// Provider-supplied wait before the next attempt
        retry_after: Option<Duration>,
    },
    /// The remote refused for a reason retrying will not fix (chat not found,
    /// bot blocked, bad token).
    Permanent { reason: String },
    /// The job itself is malformed (missing chat id, bad address). Never retried.
    Rejected { reason: String },
}

impl SendOutcome {
    pub fn transient(reason: impl Into<String>) -> Self {
        SendOutcome::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        SendOutcome::Permanent {
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        SendOutcome::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            SendOutcome::Delivered => None,
            SendOutcome::Transient { reason, .. }
            | SendOutcome::Permanent { reason }
            | SendOutcome::Rejected { reason } => Some(reason),
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SendOutcome::Delivered => "delivered",
            SendOutcome::Transient { .. } => "transient",
            SendOutcome::Permanent { .. } => "permanent",
            SendOutcome::Rejected { .. } => "rejected",
        }
    }
}

/// One delivery channel.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;

    /// Check the job's addressing data before any I/O. An `Err` makes the
    /// attempt a [`SendOutcome::Rejected`].
    fn validate(&self, _job: &NotificationJob) -> Result<(), String> {
        Ok(())
    }

    async fn send(&self, job: &NotificationJob) -> SendOutcome;
}

/// Senders keyed by the channel they serve.
#[derive(Clone, Default)]
pub struct SenderSet {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
}

impl SenderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sender, replacing any previous one for the same channel.
    pub fn with(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(sender.channel(), sender);
        self
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.senders.keys().copied().collect();
        channels.sort();
        channels
    }

    pub async fn send(&self, job: &NotificationJob) -> SendOutcome {
        match self.senders.get(&job.channel) {
            Some(sender) => sender.send(job).await,
            None => SendOutcome::transient(format!("no sender configured for {}", job.channel)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_missing_sender_is_transient() {
        let set = SenderSet::new().with(Arc::new(ScriptedSender::always(
            Channel::Telegram,
            SendOutcome::Delivered,
        )));
        let outcome = set.send(&job(Channel::Email, serde_json::json!({}))).await;
        assert_eq!(outcome.kind(), "transient");
        assert!(outcome.reason().unwrap().contains("email"));

        let outcome = set.send(&job(Channel::Telegram, serde_json::json!({}))).await;
        assert!(outcome.is_delivered());
        assert_eq!(set.channels(), vec![Channel::Telegram]);
    }
}
