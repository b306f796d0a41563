use std::sync::Arc;
use std::time::Duration;

use feedback_common::config::AppConfig;
use feedback_common::db;
use feedback_common::redis_pool::create_redis_pool;
use feedback_notifier::alert::AlertEscalator;
use feedback_notifier::backoff::BackoffPolicy;
use feedback_notifier::circuit_breaker::CircuitBreaker;
use feedback_notifier::dispatcher::{DeliveryPolicy, Dispatcher};
use feedback_notifier::lock::{RedisLock, WorkerHeartbeat};
use feedback_notifier::metrics::DeliveryMetrics;
use feedback_notifier::queue::JobQueue;
use feedback_notifier::sender::SenderSet;
use feedback_notifier::sender::email::EmailSender;
use feedback_notifier::sender::resilient::{ResilientSender, TransportRetry};
use feedback_notifier::sender::telegram::{TelegramClient, TelegramSender};
use feedback_notifier::worker::{Worker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedback_worker=info,feedback_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Feedback notification worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;

    // Channel senders, each behind its own circuit breaker
    let retry = TransportRetry {
        max_attempts: config.sender_max_attempts,
        backoff: BackoffPolicy::new(
            Duration::from_millis(config.sender_retry_base_ms),
            2,
            Duration::from_millis(config.sender_retry_max_ms),
            0.25,
        ),
        max_wait: Duration::from_millis(config.sender_retry_max_ms),
    };
    let breaker = |name: &str| {
        Arc::new(CircuitBreaker::new(
            name,
            config.circuit_failure_threshold,
            Duration::from_secs(config.circuit_recovery_timeout_secs),
        ))
    };

    let telegram_client = TelegramClient::new(&config.telegram_api_base, config.http_timeout())?;
    let telegram = TelegramSender::new(telegram_client.clone(), config.telegram_bot_token.clone());
    let mut senders = SenderSet::new().with(Arc::new(ResilientSender::new(
        Arc::new(telegram),
        breaker("telegram"),
        retry,
    )));

    let email = match &config.smtp {
        Some(smtp) => Some(Arc::new(EmailSender::new(smtp, config.http_timeout())?)),
        None => {
            tracing::warn!("SMTP_HOST not set, email notifications cannot be delivered");
            None
        }
    };
    if let Some(email) = &email {
        senders = senders.with(Arc::new(ResilientSender::new(
            email.clone(),
            breaker("email"),
            retry,
        )));
    }

    let channels = senders.channels();
    let alerts = AlertEscalator::from_settings(&config.alerts, &telegram_client, email);

    let dispatcher = Arc::new(Dispatcher::new(
        JobQueue::new(pool, config.lease()),
        senders,
        DeliveryPolicy::from_config(&config),
        alerts,
        Arc::new(DeliveryMetrics::new()),
    ));

    tracing::info!(
        worker_id = %dispatcher.worker_id(),
        channels = ?channels,
        "Notification dispatcher ready"
    );

    let worker = Worker::new(
        dispatcher,
        Arc::new(RedisLock::new(redis.clone())),
        WorkerConfig::from_config(&config),
    )
    .with_heartbeat(WorkerHeartbeat::new(redis, config.poll_interval() * 3));

    // Run until Ctrl+C, letting the in-flight tick finish
    worker
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await;

    tracing::info!("Feedback notification worker stopped.");
    Ok(())
}
