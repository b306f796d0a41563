//! Distributed worker lock and heartbeat, both in Redis.
//!
//! The lock is `SET key token NX EX ttl`: acquiring never waits, and a holder
//! that dies simply lets the key expire. Release deletes the key only if it
//! still carries this process's token, so a worker whose TTL ran out cannot
//! release a lock that has since passed to someone else. A holder running a
//! long batch extends the TTL before every send, under the same ownership
//! check.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use uuid::Uuid;

use feedback_common::error::AppError;

/// Lock key shared by every worker draining the notification queue.
pub const QUEUE_LOCK_KEY: &str = "notifier:queue:lock";

/// Key the worker refreshes every tick; read by the health report.
pub const HEARTBEAT_KEY: &str = "notifier:worker:heartbeat";

/// Compare-and-delete: only the owner may release.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Compare-and-expire: only the owner may extend.
const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[async_trait]
pub trait QueueLock: Send + Sync {
    /// Try to take the lock for `ttl`. `false` means another holder is active.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, AppError>;

    /// Reset the TTL of a lock this holder still owns. `false` means it was
    /// lost (expired or taken over).
    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, AppError>;

    async fn release(&self, key: &str) -> Result<(), AppError>;
}

/// A lock the current tick has acquired.
pub struct HeldLock<'a> {
    lock: &'a dyn QueueLock,
    key: &'a str,
    ttl: Duration,
}

impl<'a> HeldLock<'a> {
    pub fn new(lock: &'a dyn QueueLock, key: &'a str, ttl: Duration) -> Self {
        Self { lock, key, ttl }
    }

    /// Push the expiry out by another TTL. Returns `false` when ownership
    /// can no longer be confirmed; the caller must stop draining.
    pub async fn extend(&self) -> bool {
        match self.lock.extend(self.key, self.ttl).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(key = self.key, "Queue lock lost during batch");
                false
            }
            Err(e) => {
                tracing::warn!(key = self.key, error = %e, "Could not extend queue lock");
                false
            }
        }
    }
}

pub struct RedisLock {
    redis: ConnectionManager,
    token: String,
}

impl RedisLock {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            token: Uuid::new_v4().to_string(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[async_trait]
impl QueueLock for RedisLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        let mut conn = self.redis.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&self.token)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        let acquired = result.is_some();
        if !acquired {
            tracing::debug!(key, "Lock held by another worker");
        }
        Ok(acquired)
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        let mut conn = self.redis.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(key)
            .arg(&self.token)
            .arg(millis)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            tracing::warn!(key, "Lock expired before release");
        }
        Ok(())
    }
}

/// Liveness marker written by the worker.
#[derive(Clone)]
pub struct WorkerHeartbeat {
    redis: ConnectionManager,
    ttl: Duration,
}

impl WorkerHeartbeat {
    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self { redis, ttl }
    }

    pub async fn beat(&self) -> Result<(), AppError> {
        write_heartbeat(&self.redis, Utc::now(), self.ttl).await
    }
}

pub async fn write_heartbeat(
    redis: &ConnectionManager,
    at: DateTime<Utc>,
    ttl: Duration,
) -> Result<(), AppError> {
    let mut conn = redis.clone();
    let _: () = redis::cmd("SET")
        .arg(HEARTBEAT_KEY)
        .arg(at.to_rfc3339())
        .arg("EX")
        .arg(ttl.as_secs().max(1))
        .query_async(&mut conn)
        .await?;
    Ok(())
}

/// Time of the last worker heartbeat, if one is still live.
pub async fn read_heartbeat(redis: &ConnectionManager) -> Result<Option<DateTime<Utc>>, AppError> {
    let mut conn = redis.clone();
    let raw: Option<String> = redis::cmd("GET")
        .arg(HEARTBEAT_KEY)
        .query_async(&mut conn)
        .await?;

    Ok(raw
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc)))
}
