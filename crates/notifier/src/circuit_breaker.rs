//! Per-channel circuit breaker.
//!
//! `closed` lets every call through and counts consecutive failures. Once the
//! count reaches the threshold the breaker is `open` and calls fail fast
//! without I/O. After `recovery_timeout` since the last failure a single probe
//! is admitted (`half_open`): success closes the breaker, failure reopens it
//! and restarts the timer.
//!
//! State is process-local and resets on restart.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Read-only view for logging and health output.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call may proceed right now. Admitting a probe reserves it, so
    /// the caller must report back with `record_success`, `record_failure`
    /// or `abandon_probe`.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(breaker = %self.name, "Circuit half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!(breaker = %self.name, "Circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(now);
        inner.probe_in_flight = false;

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                tracing::warn!(breaker = %self.name, "Probe failed, circuit reopened");
            }
            BreakerState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = BreakerState::Open;
                tracing::warn!(
                    breaker = %self.name,
                    failure_count = inner.failure_count,
                    recovery_secs = self.recovery_timeout.as_secs(),
                    "Circuit opened"
                );
            }
            _ => {}
        }
    }

    /// Release a probe slot without judging the remote (e.g. the request never
    /// left the process).
    pub fn abandon_probe(&self) {
        self.lock().probe_in_flight = false;
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
