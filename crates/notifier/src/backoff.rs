//! Exponential backoff with jitter and a hard cap.
//!
//! Used at two levels: the queue (minutes between job attempts) and the
//! sender's transport retry loop (seconds between HTTP attempts).

use std::time::Duration;

use rand::Rng;

/// Delay calculator: `base * factor^attempt`, plus up to `jitter` of that as
/// random spread, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    factor: u32,
    max: Duration,
    jitter: f64,
}

impl BackoffPolicy {
    /// `factor` is clamped to at least 2 and `jitter` to `[0, 0.9]`. Together
    /// these keep consecutive delays strictly increasing until the cap.
    pub fn new(base: Duration, factor: u32, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            factor: factor.max(2),
            max,
            jitter: if jitter.is_finite() { jitter.clamp(0.0, 0.9) } else { 0.0 },
        }
    }

    /// Queue-level schedule: 5, 15, 45 minutes, capped at one hour.
    pub fn queue_default() -> Self {
        Self::new(Duration::from_secs(300), 3, Duration::from_secs(3600), 0.1)
    }

    /// Transport-level schedule: 1s, 2s, 4s ... capped at one minute.
    pub fn transport_default() -> Self {
        Self::new(Duration::from_secs(1), 2, Duration::from_secs(60), 0.25)
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `attempt` (0-based), with random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_with_sample(attempt, sample)
    }

    /// Deterministic form of [`delay`](Self::delay); `sample` is in `[0, 1)`.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let raw = self
            .base
            .checked_mul(self.factor.saturating_pow(attempt))
            .unwrap_or(Duration::MAX);
        if raw >= self.max {
            return self.max;
        }
        let spread = raw.mul_f64(self.jitter * sample.clamp(0.0, 1.0));
        raw.saturating_add(spread).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::queue_default()
    }
}
