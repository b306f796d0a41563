//! Circuit breaker and transport-level retry around any [`ChannelSender`].
//!
//! Transport retries absorb brief network blips and short rate limits without
//! spending one of the job's queue-level retries. Only the final result of
//! the loop is reported to the breaker and to the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use feedback_common::types::{Channel, NotificationJob};

use super::{ChannelSender, SendOutcome};
use crate::backoff::BackoffPolicy;
use crate::circuit_breaker::CircuitBreaker;

#[derive(Debug, Clone, Copy)]
pub struct TransportRetry {
    /// Total attempts per send, including the first
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Longest provider `retry_after` waited out in-process. Longer hints are
    /// handed back to the queue.
    pub max_wait: Duration,
}

impl Default for TransportRetry {
    fn default() -> Self {
        let backoff = BackoffPolicy::transport_default();
        Self {
            max_attempts: 3,
            backoff,
            max_wait: backoff.max(),
        }
    }
}

pub struct ResilientSender {
    inner: Arc<dyn ChannelSender>,
    breaker: Arc<CircuitBreaker>,
    retry: TransportRetry,
}

impl ResilientSender {
    pub fn new(inner: Arc<dyn ChannelSender>, breaker: Arc<CircuitBreaker>, retry: TransportRetry) -> Self {
        Self {
            inner,
            breaker,
            retry,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn send_with_retry(&self, job: &NotificationJob) -> SendOutcome {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let outcome = self.inner.send(job).await;
            attempt += 1;

            let retry_after = match &outcome {
                SendOutcome::Transient { retry_after, .. } => *retry_after,
                _ => return outcome,
            };
            if attempt >= attempts {
                return outcome;
            }

            let wait = match retry_after {
                Some(hint) if hint > self.retry.max_wait => return outcome,
                Some(hint) => hint,
                None => self.retry.backoff.delay(attempt - 1),
            };

            tracing::debug!(
                job_id = %job.id,
                channel = %job.channel,
                attempt,
                wait_ms = wait.as_millis() as u64,
                reason = outcome.reason().unwrap_or_default(),
                "Transient send failure, retrying"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl ChannelSender for ResilientSender {
    fn channel(&self) -> Channel {
        self.inner.channel()
    }

    fn validate(&self, job: &NotificationJob) -> Result<(), String> {
        self.inner.validate(job)
    }

    async fn send(&self, job: &NotificationJob) -> SendOutcome {
        if let Err(reason) = self.inner.validate(job) {
            return SendOutcome::rejected(reason);
        }

        if !self.breaker.allow() {
            tracing::warn!(
                job_id = %job.id,
                breaker = self.breaker.name(),
                "Circuit open, skipping send"
            );
            return SendOutcome::transient("circuit breaker open");
        }

        let outcome = self.send_with_retry(job).await;
        match &outcome {
            SendOutcome::Transient { .. } => self.breaker.record_failure(),
            SendOutcome::Delivered | SendOutcome::Permanent { .. } => self.breaker.record_success(),
            SendOutcome::Rejected { .. } => self.breaker.abandon_probe(),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerState;
    use crate::sender::telegram::{TelegramClient, TelegramSender};
    use crate::sender::testing::{ScriptedSender, job};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry(max_attempts: u32) -> TransportRetry {
        TransportRetry {
            max_attempts,
            backoff: BackoffPolicy::new(Duration::from_millis(1), 2, Duration::from_millis(5), 0.0),
            max_wait: Duration::from_secs(1),
        }
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("telegram", 5, Duration::from_secs(300)))
    }

    fn telegram_job() -> NotificationJob {
        job(Channel::Telegram, serde_json::json!({"chat_id": -100, "bot_token": "TOKEN"}))
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let inner = Arc::new(ScriptedSender::new(
            Channel::Telegram,
            vec![SendOutcome::transient("timeout"), SendOutcome::transient("timeout")],
            SendOutcome::Delivered,
        ));
        let sender = ResilientSender::new(inner.clone(), breaker(), fast_retry(3));
        assert_eq!(sender.send(&telegram_job()).await, SendOutcome::Delivered);
        assert_eq!(inner.calls(), 3);
        assert_eq!(sender.breaker().snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_permanent_is_not_retried() {
        let inner = Arc::new(ScriptedSender::always(
            Channel::Telegram,
            SendOutcome::permanent("chat not found"),
        ));
        let sender = ResilientSender::new(inner.clone(), breaker(), fast_retry(3));
        assert_eq!(sender.send(&telegram_job()).await.kind(), "permanent");
        assert_eq!(inner.calls(), 1);
        assert_eq!(sender.breaker().snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_long_retry_after_is_returned_to_queue() {
        let inner = Arc::new(ScriptedSender::always(
            Channel::Telegram,
            SendOutcome::Transient {
                reason: "rate limited".to_string(),
                retry_after: Some(Duration::from_secs(120)),
            },
        ));
        let sender = ResilientSender::new(inner.clone(), breaker(), fast_retry(3));
        match sender.send(&telegram_job()).await {
            SendOutcome::Transient { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(120)));
            }
            other => panic!("expected transient, got {:?}", other),
        }
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_job_is_rejected_without_io() {
        let inner = Arc::new(ScriptedSender::always(Channel::Telegram, SendOutcome::Delivered));
        let sender = ResilientSender::new(inner.clone(), breaker(), fast_retry(3));
        let mut empty = telegram_job();
        empty.message_content.clear();
        assert_eq!(sender.send(&empty).await.kind(), "rejected");
        assert_eq!(inner.calls(), 0);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast() {
        let inner = Arc::new(ScriptedSender::always(
            Channel::Telegram,
            SendOutcome::transient("connection refused"),
        ));
        let sender = ResilientSender::new(inner.clone(), breaker(), fast_retry(1));

        for _ in 0..5 {
            assert_eq!(sender.send(&telegram_job()).await.kind(), "transient");
        }
        assert_eq!(inner.calls(), 5);
        assert_eq!(sender.breaker().snapshot().state, BreakerState::Open);

        let outcome = sender.send(&telegram_job()).await;
        assert_eq!(outcome.reason(), Some("circuit breaker open"));
        assert_eq!(inner.calls(), 5);
    }

    #[tokio::test]
    async fn test_probe_allowed_after_recovery() {
        let inner = Arc::new(ScriptedSender::new(
            Channel::Telegram,
            vec![SendOutcome::transient("down"); 5],
            SendOutcome::Delivered,
        ));
        let breaker = Arc::new(CircuitBreaker::new("telegram", 5, Duration::from_millis(50)));
        let sender = ResilientSender::new(inner.clone(), breaker.clone(), fast_retry(1));

        for _ in 0..5 {
            sender.send(&telegram_job()).await;
        }
        assert_eq!(sender.send(&telegram_job()).await.reason(), Some("circuit breaker open"));
        assert_eq!(inner.calls(), 5);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sender.send(&telegram_job()).await, SendOutcome::Delivered);
        assert_eq!(inner.calls(), 6);
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_rate_limit_absorbed_by_transport_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests: retry after 0",
                "parameters": {"retry_after": 0}
            })))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"ok": true, "result": {"message_id": 1}})),
            )
            .mount(&server)
            .await;

        let client = TelegramClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let telegram = Arc::new(TelegramSender::new(client, None));
        let sender = ResilientSender::new(telegram, breaker(), fast_retry(4));

        assert_eq!(sender.send(&telegram_job()).await, SendOutcome::Delivered);
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 4);
        assert_eq!(sender.breaker().snapshot().state, BreakerState::Closed);
    }
}
