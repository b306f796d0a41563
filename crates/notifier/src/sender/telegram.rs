//! Telegram Bot API client and sender.
//!
//! Bot tokens are part of the request URL, so reqwest errors are stripped of
//! their URL before they reach a log line or an error message.

use std::borrow::Cow;
use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use feedback_common::error::AppError;
use feedback_common::types::{Channel, NotificationJob};

use super::{ChannelSender, SendOutcome};

/// Hard limit on `sendMessage` text length.
pub const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Telegram request failed: {0}")]
    Http(reqwest::Error),

    #[error("Telegram API error {code}: {description}")]
    Api { code: u16, description: String },
}

impl From<reqwest::Error> for TelegramError {
    fn from(err: reqwest::Error) -> Self {
        TelegramError::Http(err.without_url())
    }
}

impl From<TelegramError> for AppError {
    fn from(err: TelegramError) -> Self {
        match err {
            TelegramError::Api { code: 401 | 404, .. } => {
                AppError::Validation("Invalid Telegram bot token".to_string())
            }
            other => AppError::Transport(other.to_string()),
        }
    }
}

/// Envelope of every Bot API response.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<u64>,
    pub migrate_to_chat_id: Option<i64>,
}

/// Identity returned by `getMe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotInfo {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Chat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HasChat {
    chat: Chat,
}

#[derive(Debug, Deserialize)]
struct Update {
    message: Option<HasChat>,
    edited_message: Option<HasChat>,
    channel_post: Option<HasChat>,
    edited_channel_post: Option<HasChat>,
    my_chat_member: Option<HasChat>,
}

impl Update {
    fn chats(&self) -> impl Iterator<Item = &Chat> {
        [
            &self.message,
            &self.edited_message,
            &self.channel_post,
            &self.edited_channel_post,
            &self.my_chat_member,
        ]
        .into_iter()
        .flatten()
        .map(|c| &c.chat)
    }
}

/// A group the bot has seen activity in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupChat {
    pub id: i64,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Thin Bot API client. The token is supplied per call so one client serves
/// every account's bot.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
}

impl TelegramClient {
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, token: &str, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, token, method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        token: &str,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, TelegramError> {
        let response = self.http.post(self.url(token, method)).json(body).send().await?;
        let status = response.status();
        let parsed: ApiResponse<T> = response.json().await?;

        match (parsed.ok, parsed.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(TelegramError::Api {
                code: status.as_u16(),
                description: parsed
                    .description
                    .unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }

    /// Validate a token and return the bot's identity.
    pub async fn get_me(&self, token: &str) -> Result<BotInfo, TelegramError> {
        self.call(token, "getMe", &serde_json::json!({})).await
    }

    /// Group and supergroup chats visible in the bot's pending updates,
    /// de-duplicated by chat id.
    pub async fn discover_group_chats(&self, token: &str) -> Result<Vec<GroupChat>, TelegramError> {
        let updates: Vec<Update> = self
            .call(token, "getUpdates", &serde_json::json!({ "limit": 100 }))
            .await?;

        let mut seen = HashSet::new();
        let mut groups = Vec::new();
        for chat in updates.iter().flat_map(Update::chats) {
            if !matches!(chat.kind.as_str(), "group" | "supergroup") || !seen.insert(chat.id) {
                continue;
            }
            groups.push(GroupChat {
                id: chat.id,
                title: chat
                    .title
                    .clone()
                    .unwrap_or_else(|| format!("Group {}", chat.id)),
                kind: chat.kind.clone(),
            });
        }

        tracing::debug!(count = groups.len(), "Discovered Telegram group chats");
        Ok(groups)
    }

    /// Single `sendMessage` attempt with HTML parse mode.
    pub async fn send_message(&self, token: &str, chat_id: &str, text: &str) -> SendOutcome {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": truncate_message(text, MAX_MESSAGE_CHARS),
            "parse_mode": "HTML",
        });

        let response = match self.http.post(self.url(token, "sendMessage")).json(&body).send().await {
            Ok(response) => response,
            Err(e) => return transport_failure(e),
        };
        let status = response.status();
        match response.text().await {
            Ok(text) => classify(status, &text),
            Err(e) => transport_failure(e),
        }
    }
}

fn transport_failure(err: reqwest::Error) -> SendOutcome {
    let kind = if err.is_timeout() { "timeout" } else { "network error" };
    SendOutcome::transient(format!("Telegram {}: {}", kind, err.without_url()))
}

/// Map a `sendMessage` response onto a delivery outcome.
pub fn classify(status: StatusCode, body: &str) -> SendOutcome {
    let parsed: Option<ApiResponse<serde_json::Value>> = serde_json::from_str(body).ok();
    let ok = parsed.as_ref().is_some_and(|p| p.ok);
    let description = parsed
        .as_ref()
        .and_then(|p| p.description.clone())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
    let parameters = parsed.and_then(|p| p.parameters).unwrap_or_default();
    let reason = format!("Telegram API error {}: {}", status.as_u16(), description);

    if status.is_success() {
        return if ok {
            SendOutcome::Delivered
        } else {
            SendOutcome::permanent(reason)
        };
    }

    match status {
        StatusCode::TOO_MANY_REQUESTS => SendOutcome::Transient {
            reason,
            retry_after: parameters.retry_after.map(Duration::from_secs),
        },
        StatusCode::REQUEST_TIMEOUT => SendOutcome::transient(reason),
        s if s.is_server_error() => SendOutcome::transient(reason),
        _ => match parameters.migrate_to_chat_id {
            Some(new_id) => SendOutcome::permanent(format!("{} (chat migrated to {})", reason, new_id)),
            None => SendOutcome::permanent(reason),
        },
    }
}

/// Cap `text` at `limit` characters, ending with an ellipsis when cut.
pub fn truncate_message(text: &str, limit: usize) -> Cow<'_, str> {
    if limit == 0 {
        return Cow::Borrowed("");
    }
    match text.char_indices().nth(limit) {
        None => Cow::Borrowed(text),
        Some(_) => {
            let mut out: String = text.chars().take(limit - 1).collect();
            out.push('…');
            Cow::Owned(out)
        }
    }
}

/// Numeric chat id (groups are negative) or a public `@username`.
pub fn is_valid_chat_id(chat_id: &str) -> bool {
    match chat_id.strip_prefix('@') {
        Some(name) => !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
        None => chat_id.parse::<i64>().is_ok_and(|id| id != 0),
    }
}

/// Delivers Telegram jobs. A job's `bot_token` metadata wins over the
/// configured default token.
pub struct TelegramSender {
    client: TelegramClient,
    default_token: Option<String>,
}

impl TelegramSender {
    pub fn new(client: TelegramClient, default_token: Option<String>) -> Self {
        Self {
            client,
            default_token,
        }
    }

    fn token_for(&self, job: &NotificationJob) -> Option<String> {
        job.metadata_str("bot_token").or_else(|| self.default_token.clone())
    }
}

#[async_trait]
impl ChannelSender for TelegramSender {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    fn validate(&self, job: &NotificationJob) -> Result<(), String> {
        if job.message_content.trim().is_empty() {
            return Err("message is empty".to_string());
        }
        match job.metadata_str("chat_id") {
            None => return Err("chat_id is missing".to_string()),
            Some(id) if !is_valid_chat_id(&id) => {
                return Err(format!("chat_id '{}' is malformed", id));
            }
            Some(_) => {}
        }
        if self.token_for(job).is_none() {
            return Err("no Telegram bot token configured".to_string());
        }
        Ok(())
    }

    async fn send(&self, job: &NotificationJob) -> SendOutcome {
        let (Some(token), Some(chat_id)) = (self.token_for(job), job.metadata_str("chat_id")) else {
            return SendOutcome::rejected("chat_id or bot token missing");
        };

        let outcome = self.client.send_message(&token, &chat_id, &job.message_content).await;
        tracing::debug!(
            job_id = %job.id,
            chat_id = %chat_id,
            outcome = outcome.kind(),
            "Telegram send attempt"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::testing::job;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> TelegramClient {
        TelegramClient::new(server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_classify_success() {
        let body = r#"{"ok":true,"result":{"message_id":1}}"#;
        assert_eq!(classify(StatusCode::OK, body), SendOutcome::Delivered);
    }

    #[test]
    fn test_classify_rate_limit_carries_hint() {
        let body = r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 30","parameters":{"retry_after":30}}"#;
        match classify(StatusCode::TOO_MANY_REQUESTS, body) {
            SendOutcome::Transient { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(30)));
            }
            other => panic!("expected transient, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_permanent_errors() {
        let cases = [
            (StatusCode::BAD_REQUEST, "Bad Request: chat not found"),
            (StatusCode::UNAUTHORIZED, "Unauthorized"),
            (StatusCode::FORBIDDEN, "Forbidden: bot was blocked by the user"),
            (StatusCode::NOT_FOUND, "Not Found"),
        ];
        for (status, description) in cases {
            let body = serde_json::json!({"ok": false, "description": description}).to_string();
            let outcome = classify(status, &body);
            assert_eq!(outcome.kind(), "permanent", "{}", status);
            assert!(outcome.reason().unwrap().contains(description));
        }
    }

    #[test]
    fn test_classify_server_errors_and_garbage() {
        assert_eq!(classify(StatusCode::BAD_GATEWAY, "<html>").kind(), "transient");
        assert_eq!(classify(StatusCode::SERVICE_UNAVAILABLE, "").kind(), "transient");
        assert_eq!(classify(StatusCode::OK, r#"{"ok":false}"#).kind(), "permanent");
    }

    #[test]
    fn test_classify_migrated_group() {
        let body = r#"{"ok":false,"description":"Bad Request: group chat was upgraded to a supergroup chat","parameters":{"migrate_to_chat_id":-1001234}}"#;
        let outcome = classify(StatusCode::BAD_REQUEST, body);
        assert!(outcome.reason().unwrap().contains("-1001234"));
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("short", 10), "short");
        let long = "é".repeat(5000);
        let cut = truncate_message(&long, MAX_MESSAGE_CHARS);
        assert_eq!(cut.chars().count(), MAX_MESSAGE_CHARS);
        assert!(cut.ends_with('…'));
        let exact = "a".repeat(MAX_MESSAGE_CHARS);
        assert_eq!(truncate_message(&exact, MAX_MESSAGE_CHARS), exact.as_str());
    }

    #[test]
    fn test_chat_id_formats() {
        assert!(is_valid_chat_id("123456"));
        assert!(is_valid_chat_id("-1001234567890"));
        assert!(is_valid_chat_id("@my_channel"));
        assert!(!is_valid_chat_id("@"));
        assert!(!is_valid_chat_id("chat-42"));
        assert!(!is_valid_chat_id("0"));
    }

    #[test]
    fn test_validate_job() {
        let sender = TelegramSender::new(
            TelegramClient::new("http://unused", Duration::from_secs(1)).unwrap(),
            None,
        );
        let ok = job(Channel::Telegram, serde_json::json!({"chat_id": -100, "bot_token": "t"}));
        assert!(sender.validate(&ok).is_ok());

        let no_chat = job(Channel::Telegram, serde_json::json!({"bot_token": "t"}));
        assert!(sender.validate(&no_chat).unwrap_err().contains("chat_id"));

        let no_token = job(Channel::Telegram, serde_json::json!({"chat_id": "42"}));
        assert!(sender.validate(&no_token).unwrap_err().contains("token"));

        let with_default = TelegramSender::new(
            TelegramClient::new("http://unused", Duration::from_secs(1)).unwrap(),
            Some("fallback".to_string()),
        );
        assert!(with_default.validate(&no_token).is_ok());
    }

    #[tokio::test]
    async fn test_send_message_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_partial_json(serde_json::json!({"chat_id": "-100", "parse_mode": "HTML"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"ok": true, "result": {"message_id": 7}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let sender = TelegramSender::new(client(&server), None);
        let job = job(Channel::Telegram, serde_json::json!({"chat_id": -100, "bot_token": "TOKEN"}));
        assert_eq!(sender.send(&job).await, SendOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_send_message_forbidden_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "ok": false,
                "error_code": 403,
                "description": "Forbidden: bot was kicked from the group chat"
            })))
            .mount(&server)
            .await;

        let outcome = client(&server).send_message("TOKEN", "-100", "hi").await;
        assert_eq!(outcome.kind(), "permanent");
    }

    #[tokio::test]
    async fn test_send_message_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let outcome = client(&server).send_message("TOKEN", "-100", "hi").await;
        assert_eq!(outcome.kind(), "transient");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient_and_hides_token() {
        let client = TelegramClient::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        let outcome = client.send_message("SECRET-TOKEN", "-100", "hi").await;
        assert_eq!(outcome.kind(), "transient");
        assert!(!outcome.reason().unwrap().contains("SECRET-TOKEN"));
    }

    #[tokio::test]
    async fn test_get_me() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/getMe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": {"id": 42, "is_bot": true, "first_name": "Feedback", "username": "feedback_bot"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botBAD/getMe"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "ok": false, "error_code": 401, "description": "Unauthorized"
            })))
            .mount(&server)
            .await;

        let bot = client(&server).get_me("TOKEN").await.unwrap();
        assert_eq!(bot.username.as_deref(), Some("feedback_bot"));

        let err = client(&server).get_me("BAD").await.unwrap_err();
        assert!(matches!(err, TelegramError::Api { code: 401, .. }));
        assert!(matches!(AppError::from(err), AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_discover_group_chats() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/getUpdates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": [
                    {"update_id": 1, "message": {"chat": {"id": -1, "type": "group", "title": "Kitchen"}}},
                    {"update_id": 2, "message": {"chat": {"id": 5, "type": "private"}}},
                    {"update_id": 3, "my_chat_member": {"chat": {"id": -2, "type": "supergroup", "title": "Staff"}}},
                    {"update_id": 4, "edited_message": {"chat": {"id": -1, "type": "group", "title": "Kitchen"}}},
                    {"update_id": 5, "channel_post": {"chat": {"id": -3, "type": "channel", "title": "News"}}}
                ]
            })))
            .mount(&server)
            .await;

        let groups = client(&server).discover_group_chats("TOKEN").await.unwrap();
        let ids: Vec<i64> = groups.iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![-1, -2]);
        assert_eq!(groups[1].title, "Staff");
    }
}
