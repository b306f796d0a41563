//! Notification delivery for survey feedback.
//!
//! Jobs are persisted in `notification_jobs` and drained by a single active
//! worker (guarded by a Redis lock). Each job is delivered through a
//! channel sender (Telegram Bot API or SMTP) wrapped in a circuit breaker and
//! a short transport-level retry loop. Queue-level retries are scheduled with
//! exponential backoff; jobs that exhaust their budget are marked `failed` and
//! escalated through an out-of-band alert channel.

pub mod alert;
pub mod backoff;
pub mod circuit_breaker;
pub mod dispatcher;
pub mod health;
pub mod lock;
pub mod metrics;
pub mod queue;
pub mod sender;
pub mod survey;
pub mod worker;
