//! SMTP email sender.
//!
//! Job content is written in Telegram's HTML subset (`<b>`, `<i>`, newlines).
//! The mail is sent as multipart/alternative: an HTML rendering of that
//! content plus a tag-free plain-text part.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use feedback_common::config::{SmtpSecurity, SmtpSettings};
use feedback_common::error::AppError;
use feedback_common::types::{Channel, NotificationJob};

use super::{ChannelSender, SendOutcome};

pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailSender {
    /// Build the transport. No connection is opened until the first send.
    pub fn new(settings: &SmtpSettings, timeout: Duration) -> Result<Self, AppError> {
        let builder = match settings.security {
            SmtpSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
            }
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host),
            SmtpSecurity::None => Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
                &settings.host,
            )),
        }
        .map_err(|e| AppError::Config(format!("Invalid SMTP host '{}': {}", settings.host, e)))?
        .port(settings.port)
        .timeout(Some(timeout));

        let builder = match (&settings.username, &settings.password) {
            (Some(username), Some(password)) if settings.has_credentials() => {
                builder.credentials(Credentials::new(username.clone(), password.clone()))
            }
            _ => builder,
        };

        let from: Mailbox = settings
            .from
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid EMAIL_FROM '{}': {}", settings.from, e)))?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    /// Send one multipart message. Used directly by the alert side channel.
    pub async fn deliver(
        &self,
        to: &str,
        subject: &str,
        plain: String,
        html: String,
    ) -> Result<(), AppError> {
        let message = build_message(self.from.clone(), to, subject, plain, html)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| AppError::Transport(format!("SMTP send failed: {}", e)))?;
        Ok(())
    }
}

pub fn build_message(
    from: Mailbox,
    to: &str,
    subject: &str,
    plain: String,
    html: String,
) -> Result<Message, AppError> {
    let to: Mailbox = to
        .parse()
        .map_err(|e| AppError::Validation(format!("Invalid recipient '{}': {}", to, e)))?;

    Message::builder()
        .from(from)
        .to(to)
        .subject(subject)
        .multipart(MultiPart::alternative_plain_html(plain, html))
        .map_err(|e| AppError::Internal(format!("Failed to build email: {}", e)))
}

pub fn subject_for(job: &NotificationJob) -> String {
    match job.metadata_str("restaurant_name") {
        Some(name) => format!("New feedback - {}", name),
        None => "New feedback".to_string(),
    }
}

/// Convert the Telegram HTML subset into a standalone HTML body.
pub fn render_html(content: &str) -> String {
    let body = content
        .replace("<b>", "<strong>")
        .replace("</b>", "</strong>")
        .replace("<i>", "<em>")
        .replace("</i>", "</em>")
        .replace("\r\n", "\n")
        .replace('\n', "<br>\n");

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: Arial, sans-serif; line-height: 1.5; color: #222;">
<div style="max-width: 600px; margin: 0 auto; padding: 20px;">
{}
</div>
</body>
</html>"#,
        body
    )
}

/// Drop tags and decode the few entities the message templates use.
pub fn render_plain(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut in_tag = false;
    for c in content.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn validate(&self, job: &NotificationJob) -> Result<(), String> {
        if job.message_content.trim().is_empty() {
            return Err("message is empty".to_string());
        }
        match job.metadata_str("email_address") {
            None => Err("email_address is missing".to_string()),
            Some(addr) if addr.parse::<Address>().is_err() => {
                Err(format!("email_address '{}' is malformed", addr))
            }
            Some(_) => Ok(()),
        }
    }

    async fn send(&self, job: &NotificationJob) -> SendOutcome {
        let Some(to) = job.metadata_str("email_address") else {
            return SendOutcome::rejected("email_address is missing");
        };

        let result = self
            .deliver(
                &to,
                &subject_for(job),
                render_plain(&job.message_content),
                render_html(&job.message_content),
            )
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(job_id = %job.id, "Email accepted by SMTP relay");
                SendOutcome::Delivered
            }
            Err(AppError::Validation(reason)) => SendOutcome::rejected(reason),
            Err(e) => SendOutcome::transient(e.to_string()),
        }
    }
}
