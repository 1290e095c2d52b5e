//! Lightweight send counters for the sink façade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free counters updated from delivery callbacks.
#[derive(Debug, Default)]
pub struct SinkMetrics {
    delivered: AtomicU64,
    failed: AtomicU64,
    /// Cumulative enqueue-to-acknowledgement latency
    latency_micros: AtomicU64,
}

impl SinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let delivered = self.delivered.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let latency_micros = self.latency_micros.load(Ordering::Relaxed);
        let total = delivered + failed;
        MetricsSnapshot {
            delivered,
            failed,
            average_latency: if total == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(latency_micros / total)
            },
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub delivered: u64,
    pub failed: u64,
    pub average_latency: Duration,
}
