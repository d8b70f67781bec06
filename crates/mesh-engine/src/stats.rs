//! Per-model request statistics

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Weight of the newest sample in the latency moving average
const LATENCY_EWMA_ALPHA: f64 = 0.1;

/// Counters updated by the execution path
#[derive(Debug, Default)]
pub struct ModelStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    batches: AtomicU64,
    batched_items: AtomicU64,
    formations: AtomicU64,
    formation_wait_us: AtomicU64,
    avg_latency_ms: Mutex<Option<f64>>,
}

/// Point-in-time copy of [`ModelStats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub batches: u64,
    pub avg_batch_size: f64,
    pub avg_latency_ms: f64,
    /// Mean wait of the oldest request in each flushed batch
    pub avg_formation_wait_ms: f64,
}

impl ModelStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one executed batch and its latency
    pub fn record_batch(&self, succeeded: usize, failed: usize, latency: Duration) {
        let items = (succeeded + failed) as u64;
        self.total_requests.fetch_add(items, Ordering::Relaxed);
        self.successful_requests
            .fetch_add(succeeded as u64, Ordering::Relaxed);
        self.failed_requests.fetch_add(failed as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.batched_items.fetch_add(items, Ordering::Relaxed);

        let sample = latency.as_secs_f64() * 1000.0;
        let mut avg = self.avg_latency_ms.lock();
        *avg = Some(match *avg {
            Some(prev) => LATENCY_EWMA_ALPHA * sample + (1.0 - LATENCY_EWMA_ALPHA) * prev,
            None => sample,
        });
    }

    /// Record how long the oldest request of a flushed batch waited
    pub fn record_formation(&self, wait: Duration) {
        self.formations.fetch_add(1, Ordering::Relaxed);
        self.formation_wait_us
            .fetch_add(wait.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record requests that failed without reaching a backend
    pub fn record_failures(&self, count: usize) {
        self.total_requests.fetch_add(count as u64, Ordering::Relaxed);
        self.failed_requests.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ModelStatsSnapshot {
        let batches = self.batches.load(Ordering::Relaxed);
        let items = self.batched_items.load(Ordering::Relaxed);
        let formations = self.formations.load(Ordering::Relaxed);
        ModelStatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            batches,
            avg_batch_size: if batches == 0 {
                0.0
            } else {
                items as f64 / batches as f64
            },
            avg_latency_ms: self.avg_latency_ms.lock().unwrap_or(0.0),
            avg_formation_wait_ms: if formations == 0 {
                0.0
            } else {
                self.formation_wait_us.load(Ordering::Relaxed) as f64 / formations as f64 / 1000.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulate() {
        let stats = ModelStats::new();
        stats.record_batch(3, 1, Duration::from_millis(100));
        stats.record_batch(2, 0, Duration::from_millis(200));
        stats.record_failures(2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 8);
        assert_eq!(snapshot.successful_requests, 5);
        assert_eq!(snapshot.failed_requests, 3);
        assert_eq!(snapshot.batches, 2);
        assert!((snapshot.avg_batch_size - 3.0).abs() < 1e-9);
        // 0.1 * 200 + 0.9 * 100
        assert!((snapshot.avg_latency_ms - 110.0).abs() < 1e-6);
    }

    #[test]
    fn test_formation_wait_average() {
        let stats = ModelStats::new();
        stats.record_formation(Duration::from_millis(10));
        stats.record_formation(Duration::from_millis(30));
        assert!((stats.snapshot().avg_formation_wait_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = ModelStats::new().snapshot();
        assert_eq!(snapshot.batches, 0);
        assert_eq!(snapshot.avg_batch_size, 0.0);
        assert_eq!(snapshot.avg_latency_ms, 0.0);
        assert_eq!(snapshot.avg_formation_wait_ms, 0.0);
    }
}
