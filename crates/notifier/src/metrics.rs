//! In-process delivery counters, owned by the worker for its lifetime.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use feedback_common::types::{Channel, JobStatus};

#[derive(Debug, Default)]
struct Counters {
    sent: HashMap<Channel, u64>,
    failed: HashMap<Channel, u64>,
    retried: u64,
    errors: HashMap<&'static str, u64>,
    processed: u64,
    processing_time: Duration,
}

#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    counters: Mutex<Counters>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub sent: BTreeMap<String, u64>,
    pub failed: BTreeMap<String, u64>,
    pub retried: u64,
    /// Failed attempts by outcome kind (transient, permanent, rejected)
    pub errors: BTreeMap<String, u64>,
    pub avg_processing_ms: f64,
}

impl DeliveryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one processed job: the status it moved to, the outcome kind of
    /// the send and how long the send took.
    pub fn record(&self, channel: Channel, status: JobStatus, outcome_kind: &'static str, elapsed: Duration) {
        let mut c = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        c.processed += 1;
        c.processing_time += elapsed;
        match status {
            JobStatus::Sent => *c.sent.entry(channel).or_default() += 1,
            JobStatus::Failed => *c.failed.entry(channel).or_default() += 1,
            JobStatus::Retrying => c.retried += 1,
            JobStatus::Pending | JobStatus::Processing => {}
        }
        if outcome_kind != "delivered" {
            *c.errors.entry(outcome_kind).or_default() += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let by_channel = |m: &HashMap<Channel, u64>| {
            m.iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<_, _>>()
        };
        MetricsSnapshot {
            processed: c.processed,
            sent: by_channel(&c.sent),
            failed: by_channel(&c.failed),
            retried: c.retried,
            errors: c.errors.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            avg_processing_ms: if c.processed == 0 {
                0.0
            } else {
                c.processing_time.as_secs_f64() * 1000.0 / c.processed as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_average() {
        let metrics = DeliveryMetrics::new();
        metrics.record(Channel::Telegram, JobStatus::Sent, "delivered", Duration::from_millis(100));
        metrics.record(Channel::Telegram, JobStatus::Retrying, "transient", Duration::from_millis(300));
        metrics.record(Channel::Email, JobStatus::Failed, "permanent", Duration::from_millis(200));

        let snap = metrics.snapshot();
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.sent.get("telegram"), Some(&1));
        assert_eq!(snap.failed.get("email"), Some(&1));
        assert_eq!(snap.retried, 1);
        assert_eq!(snap.errors.get("transient"), Some(&1));
        assert_eq!(snap.errors.get("permanent"), Some(&1));
        assert!((snap.avg_processing_ms - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = DeliveryMetrics::new().snapshot();
        assert_eq!(snap, MetricsSnapshot::default());
    }
}
