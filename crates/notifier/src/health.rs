//! Health verdict over queue statistics and worker liveness.

use std::time::Duration;

use chrono::{DateTime, Utc};

use feedback_common::types::{HealthReport, HealthStatus, QueueStats};

const MAX_FAILED_JOBS: i64 = 100;
const MAX_BACKLOG: i64 = 500;
const MIN_SUCCESS_RATE: f64 = 90.0;
/// Completions needed before the success rate is trusted
const MIN_COMPLETIONS: i64 = 10;
/// Poll intervals without a heartbeat before the worker is considered gone
const HEARTBEAT_INTERVALS: u32 = 3;

pub fn assess_health(
    queue: QueueStats,
    smtp_configured: bool,
    last_heartbeat: Option<DateTime<Utc>>,
    poll_interval: Duration,
    now: DateTime<Utc>,
) -> HealthReport {
    let mut degraded = Vec::new();
    let mut unhealthy = Vec::new();

    if !smtp_configured {
        degraded.push("SMTP is not configured; email notifications cannot be delivered".to_string());
    }
    if queue.failed > MAX_FAILED_JOBS {
        degraded.push(format!("{} failed notifications", queue.failed));
    }
    if queue.backlog() > MAX_BACKLOG {
        degraded.push(format!("{} notifications waiting in the queue", queue.backlog()));
    }

    if let Some(rate) = queue.success_rate
        && queue.completed_last_day > MIN_COMPLETIONS
        && rate < MIN_SUCCESS_RATE
    {
        unhealthy.push(format!("Success rate {:.1}% over the last 24 hours", rate));
    }

    let max_silence = poll_interval.saturating_mul(HEARTBEAT_INTERVALS);
    match last_heartbeat {
        None => unhealthy.push("No worker heartbeat".to_string()),
        Some(at) => {
            let age = (now - at).to_std().unwrap_or_default();
            if age > max_silence {
                unhealthy.push(format!("Last worker heartbeat {}s ago", age.as_secs()));
            }
        }
    }

    let status = if !unhealthy.is_empty() {
        HealthStatus::Unhealthy
    } else if !degraded.is_empty() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    unhealthy.extend(degraded);
    HealthReport {
        status,
        issues: unhealthy,
        queue,
        last_worker_heartbeat: last_heartbeat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_secs(30);

    #[test]
    fn test_healthy() {
        let now = Utc::now();
        let report = assess_health(QueueStats::default(), true, Some(now), POLL, now);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_degraded_conditions() {
        let now = Utc::now();
        let report = assess_health(QueueStats::default(), false, Some(now), POLL, now);
        assert_eq!(report.status, HealthStatus::Degraded);

        let stats = QueueStats {
            pending: 400,
            retrying: 101,
            failed: 101,
            ..Default::default()
        };
        let report = assess_health(stats, true, Some(now), POLL, now);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.issues.len(), 2);
    }

    #[test]
    fn test_low_success_rate_needs_enough_samples() {
        let now = Utc::now();
        let few = QueueStats {
            success_rate: Some(50.0),
            completed_last_day: 10,
            ..Default::default()
        };
        assert_eq!(assess_health(few, true, Some(now), POLL, now).status, HealthStatus::Healthy);

        let many = QueueStats {
            success_rate: Some(85.0),
            completed_last_day: 40,
            ..Default::default()
        };
        assert_eq!(assess_health(many, true, Some(now), POLL, now).status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_stale_or_missing_heartbeat() {
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(91);
        let report = assess_health(QueueStats::default(), false, Some(stale), POLL, now);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.issues.len(), 2);

        let fresh = now - chrono::Duration::seconds(89);
        assert_eq!(
            assess_health(QueueStats::default(), true, Some(fresh), POLL, now).status,
            HealthStatus::Healthy
        );
        assert_eq!(
            assess_health(QueueStats::default(), true, None, POLL, now).status,
            HealthStatus::Unhealthy
        );
    }
}
