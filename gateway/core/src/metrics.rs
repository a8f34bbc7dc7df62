//! Metrics Primitives
//!
//! Lock-free counters, gauges and a latency histogram shared by the cache,
//! single-flight group and hedged executor. Every component exposes its
//! state as a [`MetricsSnapshot`]: a flat, sorted key/value map that an
//! external collector can scrape directly or render with [`to_prometheus`].

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Flat key/value metrics view
pub type MetricsSnapshot = BTreeMap<String, f64>;

// ============================================================================
// Counter
// ============================================================================

/// A monotonically increasing atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Gauge
// ============================================================================

/// A gauge (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement, saturating at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Latency Histogram
// ============================================================================

/// Histogram over latencies in milliseconds
#[derive(Debug)]
pub struct LatencyHistogram {
    /// Upper bucket bounds in milliseconds
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total: AtomicU64,
    /// Sum in microseconds, for a precise mean
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyHistogram {
    /// Create a histogram with the given bucket bounds (milliseconds)
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    /// Buckets suited to cache lookups and provider calls
    pub fn latency_default() -> Self {
        Self::new(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
            30000.0,
        ])
    }

    /// Record one observation
    pub fn record(&self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        let idx = self
            .buckets
            .iter()
            .position(|&b| ms <= b)
            .unwrap_or(self.buckets.len().saturating_sub(1));

        if let Some(count) = self.counts.get(idx) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.total.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Number of observations
    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Mean latency in milliseconds (0 when empty)
    pub fn mean_ms(&self) -> f64 {
        let total = self.count();
        if total == 0 {
            return 0.0;
        }
        self.sum_us.load(Ordering::Relaxed) as f64 / total as f64 / 1000.0
    }

    /// Largest observation in milliseconds
    pub fn max_ms(&self) -> f64 {
        self.max_us.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// Upper bound of the bucket holding the given quantile
    pub fn percentile_ms(&self, p: f64) -> f64 {
        let total = self.count();
        if total == 0 {
            return 0.0;
        }
        let target = ((total as f64) * p).ceil() as u64;
        let mut cumulative = 0u64;
        for (bound, count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            if cumulative >= target {
                return *bound;
            }
        }
        self.buckets.last().copied().unwrap_or(0.0)
    }

    /// Write mean/max/p50/p99 into a snapshot under `prefix`
    pub fn write_into(&self, prefix: &str, snapshot: &mut MetricsSnapshot) {
        snapshot.insert(format!("{prefix}_count"), self.count() as f64);
        snapshot.insert(format!("{prefix}_mean_ms"), self.mean_ms());
        snapshot.insert(format!("{prefix}_max_ms"), self.max_ms());
        snapshot.insert(format!("{prefix}_p50_ms"), self.percentile_ms(0.5));
        snapshot.insert(format!("{prefix}_p99_ms"), self.percentile_ms(0.99));
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// `numerator / denominator`, or 0 when the denominator is 0
pub fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Render a snapshot in Prometheus text exposition format
///
/// Keys are prefixed with `namespace_`; characters Prometheus does not
/// accept in metric names are replaced with `_`.
pub fn to_prometheus(namespace: &str, snapshot: &MetricsSnapshot) -> String {
    let mut output = String::new();
    for (key, value) in snapshot {
        let name: String = format!("{namespace}_{key}")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        let _ = writeln!(output, "# TYPE {name} gauge");
        let _ = writeln!(output, "{name} {value}");
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);

        let gauge = Gauge::new();
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
        gauge.dec();
        gauge.dec(); // Saturates
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_histogram() {
        let hist = LatencyHistogram::new(vec![10.0, 25.0, 50.0, 100.0]);

        hist.record(Duration::from_millis(5));
        hist.record(Duration::from_millis(15));
        hist.record(Duration::from_millis(75));
        hist.record(Duration::from_millis(200)); // Last bucket

        assert_eq!(hist.count(), 4);
        assert!((hist.max_ms() - 200.0).abs() < f64::EPSILON);
        assert!((hist.mean_ms() - 73.75).abs() < 0.01);
        assert!((hist.percentile_ms(0.5) - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_histogram() {
        let hist = LatencyHistogram::latency_default();
        assert_eq!(hist.count(), 0);
        assert_eq!(hist.mean_ms(), 0.0);
        assert_eq!(hist.percentile_ms(0.99), 0.0);
    }

    #[test]
    fn test_ratio() {
        assert_eq!(ratio(1, 0), 0.0);
        assert!((ratio(1, 4) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_to_prometheus() {
        let mut snap = MetricsSnapshot::new();
        snap.insert("hits.l1".to_string(), 3.0);
        snap.insert("misses".to_string(), 1.0);

        let text = to_prometheus("cache", &snap);
        assert!(text.contains("# TYPE cache_hits_l1 gauge\ncache_hits_l1 3\n"));
        assert!(text.contains("cache_misses 1\n"));
    }
}
