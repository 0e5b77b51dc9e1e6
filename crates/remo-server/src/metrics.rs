//! Request counters. Totals are plain atomics; per-subdomain stats live in
//! a concurrent map so hot subdomains do not contend on a global lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

#[derive(Default)]
pub struct Metrics {
    requests: AtomicU64,
    errors: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    latency_sum_us: AtomicU64,
    subdomains: DashMap<String, SubdomainStats>,
}

#[derive(Default)]
pub struct SubdomainStats {
    pub requests: AtomicU64,
    pub errors: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub avg_latency_ms: f64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed public request (success or failure).
    pub fn record(&self, subdomain: &str, bytes_in: u64, bytes_out: u64, latency: Duration, failed: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        self.latency_sum_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);

        let stats = self.subdomains.entry(subdomain.to_string()).or_default();
        stats.requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
            stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.requests.load(Ordering::Relaxed);
        let avg_latency_ms = if total > 0 {
            self.latency_sum_us.load(Ordering::Relaxed) as f64 / total as f64 / 1000.0
        } else {
            0.0
        };
        MetricsSnapshot {
            total_requests: total,
            total_errors: self.errors.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            avg_latency_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_snapshot() {
        let metrics = Metrics::new();
        metrics.record("foo", 100, 200, Duration::from_millis(10), false);
        metrics.record("foo", 50, 100, Duration::from_millis(20), true);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.total_errors, 1);
        assert_eq!(snap.bytes_in, 150);
        assert_eq!(snap.bytes_out, 300);
        assert!((snap.avg_latency_ms - 15.0).abs() < 0.01);
    }

    #[test]
    fn empty_snapshot_has_zero_latency() {
        let snap = Metrics::new().snapshot();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.avg_latency_ms, 0.0);
    }

    #[test]
    fn per_subdomain_counters_are_isolated() {
        let metrics = Metrics::new();
        metrics.record("a", 0, 0, Duration::ZERO, true);
        metrics.record("b", 0, 0, Duration::ZERO, false);

        let a = metrics.subdomains.get("a").unwrap();
        assert_eq!(a.requests.load(Ordering::Relaxed), 1);
        assert_eq!(a.errors.load(Ordering::Relaxed), 1);
        drop(a);
        let b = metrics.subdomains.get("b").unwrap();
        assert_eq!(b.errors.load(Ordering::Relaxed), 0);
    }
}
