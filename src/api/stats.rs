// src/api/stats.rs
//! Request pipeline counters.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RequestStats {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    fallback_hits: AtomicU64,
    network_successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    cancelled: AtomicU64,
    dedup_reuses: AtomicU64,
}

impl RequestStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_hit(&self) {
        self.fallback_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_success(&self) {
        self.network_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dedup_reuse(&self) {
        self.dedup_reuses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, peak_in_flight: usize) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            fallback_hits: self.fallback_hits.load(Ordering::Relaxed),
            network_successes: self.network_successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            dedup_reuses: self.dedup_reuses.load(Ordering::Relaxed),
            peak_in_flight,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub fallback_hits: u64,
    pub network_successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub cancelled: u64,
    pub dedup_reuses: u64,
    pub peak_in_flight: usize,
}

impl StatsSnapshot {
    /// Share of requests answered from the cache, pre-flight or fallback.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        (self.cache_hits + self.fallback_hits) as f64 / self.requests as f64 * 100.0
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "📊 {} requests | {} network ok | {} cache hits | {} fallbacks | {} failures | {} retries | {} cancelled | peak {} in flight | hit rate {:.1}%",
            self.requests,
            self.network_successes,
            self.cache_hits,
            self.fallback_hits,
            self.failures,
            self.retries,
            self.cancelled,
            self.peak_in_flight,
            self.cache_hit_rate()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = RequestStats::default();
        for _ in 0..4 {
            stats.record_request();
        }
        stats.record_cache_hit();
        stats.record_fallback_hit();
        stats.record_network_success();
        stats.record_failure();
        stats.record_retry();

        let snapshot = stats.snapshot(3);
        assert_eq!(snapshot.requests, 4);
        assert_eq!(snapshot.peak_in_flight, 3);
        assert!((snapshot.cache_hit_rate() - 50.0).abs() < f64::EPSILON);
        assert!(snapshot.to_string().contains("4 requests"));
    }

    #[test]
    fn empty_snapshot_has_zero_hit_rate() {
        assert_eq!(StatsSnapshot::default().cache_hit_rate(), 0.0);
    }
}
