//! Shared application state for the Axum API server.

use feedback_common::config::AppConfig;
use feedback_common::error::AppError;
use feedback_notifier::queue::JobQueue;
use feedback_notifier::sender::telegram::TelegramClient;
use redis::aio::ConnectionManager;
use sqlx::PgPool;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub queue: JobQueue,
    pub redis: ConnectionManager,
    pub telegram: TelegramClient,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(pool: PgPool, redis: ConnectionManager, config: AppConfig) -> Result<Self, AppError> {
        let telegram = TelegramClient::new(&config.telegram_api_base, config.http_timeout())?;
        Ok(Self {
            queue: JobQueue::new(pool, config.lease()),
            redis,
            telegram,
            config,
        })
    }
}
