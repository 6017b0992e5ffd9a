//! Windowed latency/throughput aggregation.
//!
//! Workers `record` a sample per acknowledged message; the scheduling loop
//! calls `snapshot` exactly once per class per window. A snapshot is a
//! destructive read: it returns the window's mean latency and count and
//! resets both, so nothing carries over into the next window.

use crate::domain::QueueClass;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// One latency observation, emitted at ack time
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSample {
    pub queue_class: QueueClass,
    pub latency: Duration,
    pub recorded_at: DateTime<Utc>,
    /// Envelope timestamp was ahead of our clock; latency clamped to 0
    pub clock_skew: bool,
}

/// Result of a destructive window read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSnapshot {
    pub avg_latency: Duration,
    pub throughput_count: u64,
}

impl WindowSnapshot {
    /// count / window seconds
    pub fn throughput_per_sec(&self, window: Duration) -> f64 {
        let secs = window.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.throughput_count as f64 / secs
    }
}

#[derive(Debug, Default)]
struct Window {
    total_latency_nanos: u128,
    count: u64,
    skewed: u64,
}

/// Thread-safe rolling store of per-class latency sums and counts
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    windows: Mutex<HashMap<String, Window>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a latency to the class window and bump its count
    pub fn record(&self, class: &QueueClass, latency: Duration) {
        self.record_inner(class, latency, false);
    }

    pub fn record_sample(&self, sample: &MetricsSample) {
        self.record_inner(&sample.queue_class, sample.latency, sample.clock_skew);
    }

    fn record_inner(&self, class: &QueueClass, latency: Duration, clock_skew: bool) {
        let mut windows = self.windows.lock();
        let window = windows.entry(class.name().to_string()).or_default();
        window.total_latency_nanos += latency.as_nanos();
        window.count += 1;
        if clock_skew {
            window.skewed += 1;
        }
    }

    /// Mean latency (zero if empty) and count for the window, then reset.
    ///
    /// Atomic with respect to concurrent `record` calls: every sample lands
    /// in exactly one window.
    pub fn snapshot(&self, class: &QueueClass) -> WindowSnapshot {
        let window = self
            .windows
            .lock()
            .remove(class.name())
            .unwrap_or_default();

        if window.count == 0 {
            return WindowSnapshot::default();
        }
        if window.skewed > 0 {
            tracing::debug!(
                queue = %class,
                skewed = window.skewed,
                "Window contains clock-skewed samples clamped to zero"
            );
        }

        let mean_nanos = window.total_latency_nanos / u128::from(window.count);
        WindowSnapshot {
            avg_latency: Duration::from_nanos(u64::try_from(mean_nanos).unwrap_or(u64::MAX)),
            throughput_count: window.count,
        }
    }
}

/// Per-class metrics line emitted at every flush
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsRecord {
    pub queue_class: QueueClass,
    pub avg_latency: Duration,
    /// orders/sec over the window
    pub throughput: f64,
    pub consumers: usize,
    pub backlog_depth: u64,
}

impl fmt::Display for MetricsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - Avg Latency: {:.2}s, Throughput: {:.2} orders/sec",
            self.queue_class,
            self.avg_latency.as_secs_f64(),
            self.throughput
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn snapshot_returns_mean_and_count_then_resets() {
        let metrics = MetricsAggregator::new();
        let class = QueueClass::priority();

        for ms in [1_000, 2_000, 3_000, 6_000] {
            metrics.record(&class, Duration::from_millis(ms));
        }

        let snap = metrics.snapshot(&class);
        assert_eq!(snap.avg_latency, Duration::from_millis(3_000));
        assert_eq!(snap.throughput_count, 4);

        let empty = metrics.snapshot(&class);
        assert_eq!(empty, WindowSnapshot::default());
    }

    #[test]
    fn classes_have_independent_windows() {
        let metrics = MetricsAggregator::new();
        metrics.record(&QueueClass::express(), Duration::from_millis(500));

        assert_eq!(metrics.snapshot(&QueueClass::standard()).throughput_count, 0);
        assert_eq!(metrics.snapshot(&QueueClass::express()).throughput_count, 1);
    }

    #[test]
    fn throughput_is_count_over_window() {
        let snap = WindowSnapshot {
            avg_latency: Duration::ZERO,
            throughput_count: 12,
        };
        assert_eq!(snap.throughput_per_sec(Duration::from_secs(5)), 2.4);
        assert_eq!(snap.throughput_per_sec(Duration::ZERO), 0.0);
    }

    #[test]
    fn record_line_format() {
        let record = MetricsRecord {
            queue_class: QueueClass::priority(),
            avg_latency: Duration::from_millis(2_346),
            throughput: 0.4,
            consumers: 2,
            backlog_depth: 7,
        };
        assert_eq!(
            record.to_string(),
            "priority_orders - Avg Latency: 2.35s, Throughput: 0.40 orders/sec"
        );
    }

    #[test]
    fn concurrent_records_are_neither_lost_nor_double_counted() {
        let metrics = Arc::new(MetricsAggregator::new());
        let class = QueueClass::standard();
        let mut seen = 0u64;

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                let class = class.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        metrics.record(&class, Duration::from_millis(1));
                    }
                })
            })
            .collect();

        while writers.iter().any(|w| !w.is_finished()) {
            seen += metrics.snapshot(&class).throughput_count;
        }
        for w in writers {
            w.join().unwrap();
        }
        seen += metrics.snapshot(&class).throughput_count;

        assert_eq!(seen, 4_000);
    }
}
