use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Plain connection upgraded with STARTTLS (submission port 587).
    StartTls,
    /// Implicit TLS from the first byte (port 465).
    Tls,
    /// Unencrypted. Only for local relays and test servers.
    None,
}

impl FromStr for SmtpSecurity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "starttls" => Ok(SmtpSecurity::StartTls),
            "tls" | "ssl" => Ok(SmtpSecurity::Tls),
            "none" | "plain" => Ok(SmtpSecurity::None),
            other => Err(anyhow::anyhow!(
                "SMTP_SECURITY must be one of starttls, tls, none (got '{}')",
                other
            )),
        }
    }
}

/// Outbound mail transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub security: SmtpSecurity,
    /// Envelope and header sender address
    pub from: String,
}

impl SmtpSettings {
    /// Whether username/password authentication is configured.
    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
            && self.password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Destinations for critical alerts. Each side is enabled when its values are present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertSettings {
    pub email: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (distributed lock + worker heartbeat)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Address the API server binds to
    pub api_bind_addr: String,

    /// Worker poll interval in seconds (default: 30)
    pub queue_check_interval_secs: u64,

    /// Maximum jobs claimed per batch (default: 50)
    pub batch_size: i64,

    /// Default `max_retries` for newly enqueued jobs (default: 3)
    pub max_retries: i32,

    /// Queue-level backoff: delay before the first retry, in seconds (default: 300)
    pub retry_base_secs: u64,

    /// Queue-level backoff multiplier (default: 3 → 5, 15, 45 minutes)
    pub retry_factor: u32,

    /// Queue-level backoff cap in seconds (default: 3600)
    pub retry_max_secs: u64,

    /// Seconds after which a `processing` job is considered abandoned (default: 300)
    pub lease_secs: u64,

    /// Distributed lock TTL in seconds, extended before every send (default: lease)
    pub lock_ttl_secs: u64,

    /// Terminal jobs older than this many days are purged (default: 30)
    pub retention_days: u32,

    /// Fail jobs immediately on permanent remote errors instead of consuming retries
    pub skip_retry_on_permanent: bool,

    /// Consecutive failures before a channel's circuit opens (default: 5)
    pub circuit_failure_threshold: u32,

    /// Seconds an open circuit waits before letting a probe through (default: 300)
    pub circuit_recovery_timeout_secs: u64,

    /// Transport-level attempts per send (default: 3)
    pub sender_max_attempts: u32,

    /// Transport-level backoff base in milliseconds (default: 1000)
    pub sender_retry_base_ms: u64,

    /// Transport-level backoff cap in milliseconds (default: 60000)
    pub sender_retry_max_ms: u64,

    /// Timeout for every outbound HTTP / SMTP call, in seconds (default: 15)
    pub http_timeout_secs: u64,

    /// Telegram Bot API base URL
    pub telegram_api_base: String,

    /// Fallback bot token for jobs that don't carry one
    pub telegram_bot_token: Option<String>,

    /// Mail transport, present when `SMTP_HOST` is set
    pub smtp: Option<SmtpSettings>,

    /// Critical alert destinations
    pub alerts: AlertSettings,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let queue_check_interval_secs: u64 =
            parse_or(&get, "NOTIFICATION_QUEUE_CHECK_INTERVAL", 30)?;
        if queue_check_interval_secs == 0 {
            anyhow::bail!("NOTIFICATION_QUEUE_CHECK_INTERVAL must be greater than zero");
        }

        let batch_size: i64 = parse_or(&get, "NOTIFICATION_BATCH_SIZE", 50)?;
        if batch_size <= 0 {
            anyhow::bail!("NOTIFICATION_BATCH_SIZE must be greater than zero");
        }

        let max_retries: i32 = parse_or(&get, "NOTIFICATION_MAX_RETRIES", 3)?;
        if max_retries < 0 {
            anyhow::bail!("NOTIFICATION_MAX_RETRIES must not be negative");
        }

        let retry_factor: u32 = parse_or(&get, "NOTIFICATION_RETRY_FACTOR", 3)?;
        if retry_factor < 2 {
            anyhow::bail!("NOTIFICATION_RETRY_FACTOR must be at least 2");
        }

        let lease_secs: u64 = parse_or(&get, "NOTIFICATION_LEASE_SECS", 300)?;
        if lease_secs == 0 {
            anyhow::bail!("NOTIFICATION_LEASE_SECS must be greater than zero");
        }

        // The lock is extended before every send, so it only has to outlive
        // one send, which is what the lease is sized for.
        let lock_ttl_secs: u64 = parse_or(&get, "NOTIFICATION_LOCK_TTL_SECS", lease_secs)?;
        if lock_ttl_secs < lease_secs {
            anyhow::bail!(
                "NOTIFICATION_LOCK_TTL_SECS ({}) must not be shorter than NOTIFICATION_LEASE_SECS ({})",
                lock_ttl_secs,
                lease_secs
            );
        }

        let smtp = match get("SMTP_HOST") {
            Some(host) => {
                let username = get("SMTP_USERNAME");
                let from = get("EMAIL_FROM").or_else(|| username.clone()).ok_or_else(|| {
                    anyhow::anyhow!("EMAIL_FROM is required when SMTP_HOST is set")
                })?;
                Some(SmtpSettings {
                    host,
                    port: parse_or(&get, "SMTP_PORT", 587)?,
                    username,
                    password: get("SMTP_PASSWORD"),
                    security: parse_or(&get, "SMTP_SECURITY", SmtpSecurity::StartTls)?,
                    from,
                })
            }
            None => None,
        };

        Ok(Self {
            database_url: get("DATABASE_URL")
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: get("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            db_max_connections: parse_or(&get, "DB_MAX_CONNECTIONS", 20)?,
            api_bind_addr: get("API_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            queue_check_interval_secs,
            batch_size,
            max_retries,
            retry_base_secs: parse_or(&get, "NOTIFICATION_RETRY_BASE_SECS", 300)?,
            retry_factor,
            retry_max_secs: parse_or(&get, "NOTIFICATION_RETRY_MAX_SECS", 3600)?,
            lease_secs,
            lock_ttl_secs,
            retention_days: parse_or(&get, "NOTIFICATION_RETENTION_DAYS", 30)?,
            skip_retry_on_permanent: parse_or(&get, "NOTIFICATION_SKIP_RETRY_ON_PERMANENT", false)?,
            circuit_failure_threshold: parse_or(&get, "CIRCUIT_FAILURE_THRESHOLD", 5)?,
            circuit_recovery_timeout_secs: parse_or(&get, "CIRCUIT_RECOVERY_TIMEOUT_SECS", 300)?,
            sender_max_attempts: parse_or(&get, "SENDER_MAX_ATTEMPTS", 3)?,
            sender_retry_base_ms: parse_or(&get, "SENDER_RETRY_BASE_MS", 1000)?,
            sender_retry_max_ms: parse_or(&get, "SENDER_RETRY_MAX_MS", 60_000)?,
            http_timeout_secs: parse_or(&get, "HTTP_TIMEOUT_SECS", 15)?,
            telegram_api_base: get("TELEGRAM_API_BASE")
                .unwrap_or_else(|| "https://api.telegram.org".to_string()),
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN"),
            smtp,
            alerts: AlertSettings {
                email: get("ALERT_EMAIL"),
                telegram_bot_token: get("ALERT_TELEGRAM_BOT_TOKEN"),
                telegram_chat_id: get("ALERT_TELEGRAM_CHAT_ID"),
            },
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.queue_check_interval_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

/// Parse an optional variable, falling back to `default` when it is unset.
fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T> {
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                key,
                std::any::type_name::<T>().rsplit("::").next().unwrap_or("value")
            )
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/feedback")]).unwrap();
        assert_eq!(config.queue_check_interval_secs, 30);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.lease_secs, 300);
        assert_eq!(config.lock_ttl_secs, 300);
        assert_eq!(config.circuit_failure_threshold, 5);
        assert_eq!(config.circuit_recovery_timeout_secs, 300);
        assert_eq!(config.telegram_api_base, "https://api.telegram.org");
        assert!(!config.skip_retry_on_permanent);
        assert!(config.smtp.is_none());
        assert!(config.alerts.email.is_none());
    }

    #[test]
    fn test_database_url_required() {
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_lock_ttl_follows_lease() {
        let config = load(&[
            ("DATABASE_URL", "postgres://x"),
            ("NOTIFICATION_QUEUE_CHECK_INTERVAL", "10"),
            ("NOTIFICATION_LEASE_SECS", "120"),
        ])
        .unwrap();
        assert_eq!(config.lock_ttl_secs, 120);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_lock_ttl_shorter_than_lease_is_rejected() {
        let err = load(&[
            ("DATABASE_URL", "postgres://x"),
            ("NOTIFICATION_LEASE_SECS", "300"),
            ("NOTIFICATION_LOCK_TTL_SECS", "60"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("NOTIFICATION_LOCK_TTL_SECS"));
    }

    #[test]
    fn test_retry_factor_below_two_is_rejected() {
        let err = load(&[
            ("DATABASE_URL", "postgres://x"),
            ("NOTIFICATION_RETRY_FACTOR", "1"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("NOTIFICATION_RETRY_FACTOR"));

        let config = load(&[
            ("DATABASE_URL", "postgres://x"),
            ("NOTIFICATION_RETRY_FACTOR", "2"),
        ])
        .unwrap();
        assert_eq!(config.retry_factor, 2);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = load(&[
            ("DATABASE_URL", "postgres://x"),
            ("NOTIFICATION_BATCH_SIZE", "lots"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("NOTIFICATION_BATCH_SIZE"));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        assert!(
            load(&[
                ("DATABASE_URL", "postgres://x"),
                ("NOTIFICATION_QUEUE_CHECK_INTERVAL", "0"),
            ])
            .is_err()
        );
    }

    #[test]
    fn test_smtp_settings() {
        let config = load(&[
            ("DATABASE_URL", "postgres://x"),
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_USERNAME", "bot@example.com"),
            ("SMTP_PASSWORD", "secret"),
            ("SMTP_SECURITY", "tls"),
            ("SMTP_PORT", "465"),
        ])
        .unwrap();
        let smtp = config.smtp.unwrap();
        assert_eq!(smtp.port, 465);
        assert_eq!(smtp.security, SmtpSecurity::Tls);
        assert_eq!(smtp.from, "bot@example.com");
        assert!(smtp.has_credentials());
    }

    #[test]
    fn test_smtp_requires_sender() {
        let err = load(&[
            ("DATABASE_URL", "postgres://x"),
            ("SMTP_HOST", "smtp.example.com"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("EMAIL_FROM"));
    }

    #[test]
    fn test_blank_values_count_as_unset() {
        let config = load(&[("DATABASE_URL", "postgres://x"), ("TELEGRAM_BOT_TOKEN", "  ")]).unwrap();
        assert!(config.telegram_bot_token.is_none());
    }
}
