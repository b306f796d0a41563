//! Critical alert escalation.
//!
//! Alerts go out through their own Telegram bot and SMTP path, never through
//! the notification queue, so a broken delivery channel can still report
//! itself. Delivery failures are logged and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use feedback_common::config::AlertSettings;
use feedback_common::error::AppError;
use feedback_common::types::{Channel, NotificationJob};

use crate::sender::SendOutcome;
use crate::sender::email::EmailSender;
use crate::sender::telegram::TelegramClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A job exhausted its retries or was rejected.
    JobFailed,
    /// Claiming or committing a batch failed.
    BatchProcessingFailed,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::JobFailed => write!(f, "job_failed"),
            AlertKind::BatchProcessingFailed => write!(f, "batch_processing_failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CriticalAlert {
    pub kind: AlertKind,
    pub message: String,
    pub job_id: Option<Uuid>,
    pub channel: Option<Channel>,
    pub timestamp: DateTime<Utc>,
}

impl CriticalAlert {
    pub fn job_failed(job: &NotificationJob, error: &str) -> Self {
        Self {
            kind: AlertKind::JobFailed,
            message: format!(
                "Notification {} to {} for {} failed after {} attempt(s): {}",
                job.id,
                job.channel,
                job.recipient_ref,
                job.retry_count + 1,
                error
            ),
            job_id: Some(job.id),
            channel: Some(job.channel),
            timestamp: Utc::now(),
        }
    }

    pub fn batch_failed(error: &AppError) -> Self {
        Self {
            kind: AlertKind::BatchProcessingFailed,
            message: format!("Notification batch processing failed: {}", error),
            job_id: None,
            channel: None,
            timestamp: Utc::now(),
        }
    }

    pub fn subject(&self) -> String {
        format!("[CRITICAL] Notification system: {}", self.kind)
    }

    /// Telegram HTML rendering.
    pub fn render_html(&self) -> String {
        let mut text = format!(
            "🚨 <b>CRITICAL ALERT</b>\n\n<b>Type:</b> {}\n<b>Time:</b> {}\n",
            self.kind,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if let Some(job_id) = self.job_id {
            text.push_str(&format!("<b>Job:</b> {}\n", job_id));
        }
        text.push_str(&format!("\n{}", escape_html(&self.message)));
        text
    }

    pub fn render_plain(&self) -> String {
        let mut text = format!(
            "CRITICAL ALERT\n\nType: {}\nTime: {}\n",
            self.kind,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if let Some(job_id) = self.job_id {
            text.push_str(&format!("Job: {}\n", job_id));
        }
        text.push_str(&format!("\n{}", self.message));
        text
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// One out-of-band alert destination.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, alert: &CriticalAlert) -> Result<(), AppError>;
}

pub struct TelegramAlertSink {
    client: TelegramClient,
    token: String,
    chat_id: String,
}

impl TelegramAlertSink {
    pub fn new(client: TelegramClient, token: String, chat_id: String) -> Self {
        Self {
            client,
            token,
            chat_id,
        }
    }
}

#[async_trait]
impl AlertSink for TelegramAlertSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, alert: &CriticalAlert) -> Result<(), AppError> {
        match self
            .client
            .send_message(&self.token, &self.chat_id, &alert.render_html())
            .await
        {
            SendOutcome::Delivered => Ok(()),
            other => Err(AppError::Transport(
                other.reason().unwrap_or("unknown").to_string(),
            )),
        }
    }
}

pub struct EmailAlertSink {
    sender: Arc<EmailSender>,
    to: String,
}

impl EmailAlertSink {
    pub fn new(sender: Arc<EmailSender>, to: String) -> Self {
        Self { sender, to }
    }
}

#[async_trait]
impl AlertSink for EmailAlertSink {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, alert: &CriticalAlert) -> Result<(), AppError> {
        let html = crate::sender::email::render_html(&alert.render_html());
        self.sender
            .deliver(&self.to, &alert.subject(), alert.render_plain(), html)
            .await
    }
}

/// Fans a critical alert out to every configured sink.
#[derive(Default)]
pub struct AlertEscalator {
    sinks: Vec<Box<dyn AlertSink>>,
}

impl AlertEscalator {
    pub fn new(sinks: Vec<Box<dyn AlertSink>>) -> Self {
        Self { sinks }
    }

    /// Build sinks from settings. Telegram needs both token and chat id;
    /// email needs a recipient and a configured mail transport.
    pub fn from_settings(
        settings: &AlertSettings,
        client: &TelegramClient,
        email: Option<Arc<EmailSender>>,
    ) -> Self {
        let mut sinks: Vec<Box<dyn AlertSink>> = Vec::new();

        if let (Some(token), Some(chat_id)) = (&settings.telegram_bot_token, &settings.telegram_chat_id) {
            sinks.push(Box::new(TelegramAlertSink::new(
                client.clone(),
                token.clone(),
                chat_id.clone(),
            )));
        }

        match (&settings.email, email) {
            (Some(to), Some(sender)) => sinks.push(Box::new(EmailAlertSink::new(sender, to.clone()))),
            (Some(_), None) => {
                tracing::warn!("ALERT_EMAIL is set but SMTP is not configured, email alerts disabled");
            }
            _ => {}
        }

        if sinks.is_empty() {
            tracing::warn!("No critical alert destinations configured, alerts will only be logged");
        }

        Self { sinks }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Log the alert, then attempt every sink. Never fails.
    pub async fn raise(&self, alert: CriticalAlert) {
        tracing::error!(
            alert_type = %alert.kind,
            severity = "critical",
            job_id = ?alert.job_id,
            message = %alert.message,
            "Critical alert"
        );

        for sink in &self.sinks {
            match sink.deliver(&alert).await {
                Ok(()) => tracing::info!(sink = sink.name(), alert_type = %alert.kind, "Critical alert delivered"),
                Err(e) => tracing::error!(
                    sink = sink.name(),
                    alert_type = %alert.kind,
                    error = %e,
                    "Critical alert delivery failed"
                ),
            }
        }
    }
}
