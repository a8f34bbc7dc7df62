//! Provider Statistics
//!
//! Per-provider exponentially weighted moving averages of latency, success
//! rate and cost. Entries are created lazily on first use and never
//! removed; the table is bounded by the provider set.
//!
//! # Thread Safety
//!
//! Each average is an `f64` stored in an `AtomicU64` and updated with a
//! compare-and-swap loop, so concurrent updates to one provider never lose
//! a sample and updates to different providers never contend.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::metrics::MetricsSnapshot;

// ============================================================================
// Provider Descriptors
// ============================================================================

/// A provider that can serve a request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Provider identifier passed to the origin
    pub id: String,

    /// Static preference weight (higher ranks earlier)
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Estimated cost of one call
    #[serde(default)]
    pub cost_per_call: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl ProviderSpec {
    /// A provider with weight 1 and no cost
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            weight: default_weight(),
            cost_per_call: 0.0,
        }
    }

    /// Set the static weight
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Set the per-call cost
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }
}

impl From<&str> for ProviderSpec {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// ============================================================================
// Atomic Moving Average
// ============================================================================

/// `f64` moving average in an atomic cell; NaN means "no samples yet"
#[derive(Debug)]
struct Ewma(AtomicU64);

impl Ewma {
    fn new() -> Self {
        Self(AtomicU64::new(f64::NAN.to_bits()))
    }

    fn get(&self) -> Option<f64> {
        let value = f64::from_bits(self.0.load(Ordering::Acquire));
        (!value.is_nan()).then_some(value)
    }

    /// Fold in a sample; the first sample seeds the average
    fn update(&self, sample: f64, alpha: f64) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let old = f64::from_bits(current);
            let new = if old.is_nan() {
                sample
            } else {
                alpha * sample + (1.0 - alpha) * old
            };
            match self.0.compare_exchange_weak(
                current,
                new.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

// ============================================================================
// Provider Stats
// ============================================================================

/// One completed launch, as seen by the statistics table
#[derive(Clone, Copy, Debug)]
pub struct LaunchSample {
    /// Time from launch to completion
    pub latency: Duration,
    /// Whether the launch produced a result
    pub success: bool,
    /// Cost attributed to the launch
    pub cost: f64,
}

/// Live statistics for one provider
#[derive(Debug)]
pub struct ProviderStats {
    id: String,
    latency_ms: Ewma,
    success_rate: Ewma,
    cost: Ewma,
    successes: AtomicU64,
    failures: AtomicU64,
    /// Unix millis of the last completed launch (0 = never)
    last_used_ms: AtomicI64,
}

impl ProviderStats {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            latency_ms: Ewma::new(),
            success_rate: Ewma::new(),
            cost: Ewma::new(),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_used_ms: AtomicI64::new(0),
        }
    }

    /// Fold a completed launch into the averages
    pub fn record(&self, sample: LaunchSample, alpha: f64) {
        self.latency_ms
            .update(sample.latency.as_secs_f64() * 1000.0, alpha);
        self.success_rate
            .update(if sample.success { 1.0 } else { 0.0 }, alpha);
        self.cost.update(sample.cost, alpha);

        if sample.success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.last_used_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Provider identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Smoothed latency in milliseconds (None before the first sample)
    #[must_use]
    pub fn latency_ms(&self) -> Option<f64> {
        self.latency_ms.get()
    }

    /// Smoothed success rate in `[0, 1]` (None before the first sample)
    #[must_use]
    pub fn success_rate(&self) -> Option<f64> {
        self.success_rate.get()
    }

    /// Smoothed cost per launch
    #[must_use]
    pub fn cost(&self) -> Option<f64> {
        self.cost.get()
    }

    /// Completed launches recorded
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.successes.load(Ordering::Relaxed) + self.failures.load(Ordering::Relaxed)
    }

    /// Wall-clock time of the last completed launch
    #[must_use]
    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        match self.last_used_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> ProviderMetrics {
        ProviderMetrics {
            id: self.id.clone(),
            latency_ms: self.latency_ms(),
            success_rate: self.success_rate(),
            cost: self.cost(),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_used: self.last_used(),
        }
    }
}

/// Immutable view of a provider's statistics
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProviderMetrics {
    /// Provider identifier
    pub id: String,
    /// Smoothed latency in milliseconds
    pub latency_ms: Option<f64>,
    /// Smoothed success rate
    pub success_rate: Option<f64>,
    /// Smoothed cost per launch
    pub cost: Option<f64>,
    /// Successful launches
    pub successes: u64,
    /// Failed launches
    pub failures: u64,
    /// Last completed launch
    pub last_used: Option<DateTime<Utc>>,
}

// ============================================================================
// Provider Table
// ============================================================================

/// Statistics for every provider seen so far
#[derive(Debug, Default)]
pub struct ProviderTable {
    providers: DashMap<String, Arc<ProviderStats>>,
}

impl ProviderTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stats for `id`, if it has been used
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<ProviderStats>> {
        self.providers.get(id).map(|s| Arc::clone(&s))
    }

    /// Stats for `id`, created on first use
    pub fn get_or_create(&self, id: &str) -> Arc<ProviderStats> {
        if let Some(stats) = self.get(id) {
            return stats;
        }
        Arc::clone(
            &self
                .providers
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(ProviderStats::new(id))),
        )
    }

    /// Snapshot of every provider, sorted by id
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProviderMetrics> {
        let mut all: Vec<ProviderMetrics> =
            self.providers.iter().map(|s| s.snapshot()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Flatten the table into `snap` as `provider_{id}_{metric}`
    pub fn write_into(&self, snap: &mut MetricsSnapshot) {
        for p in self.snapshot() {
            let prefix = format!("provider_{}", p.id);
            if let Some(latency) = p.latency_ms {
                snap.insert(format!("{prefix}_latency_ms"), latency);
            }
            if let Some(rate) = p.success_rate {
                snap.insert(format!("{prefix}_success_rate"), rate);
            }
            if let Some(cost) = p.cost {
                snap.insert(format!("{prefix}_cost"), cost);
            }
            snap.insert(format!("{prefix}_samples"), (p.successes + p.failures) as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ms: u64, success: bool) -> LaunchSample {
        LaunchSample {
            latency: Duration::from_millis(ms),
            success,
            cost: 0.5,
        }
    }

    #[test]
    fn test_first_sample_seeds_average() {
        let stats = ProviderStats::new("a");
        assert_eq!(stats.latency_ms(), None);

        stats.record(sample(200, true), 0.3);
        assert_eq!(stats.latency_ms(), Some(200.0));
        assert_eq!(stats.success_rate(), Some(1.0));
        assert!(stats.last_used().is_some());
    }

    #[test]
    fn test_snapshot_serializes_last_used_as_timestamp() {
        let stats = ProviderStats::new("a");
        let idle = serde_json::to_value(stats.snapshot()).unwrap();
        assert!(idle["last_used"].is_null());

        stats.record(sample(120, true), 0.3);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["id"], "a");
        assert_eq!(json["successes"], 1);
        let stamp = json["last_used"].as_str().unwrap();
        let parsed: DateTime<Utc> = stamp.parse().unwrap();
        assert_eq!(Some(parsed), stats.last_used());
    }

    #[test]
    fn test_ewma_smoothing() {
        let stats = ProviderStats::new("a");
        stats.record(sample(100, true), 0.5);
        stats.record(sample(300, false), 0.5);

        assert!((stats.latency_ms().unwrap() - 200.0).abs() < 1e-9);
        assert!((stats.success_rate().unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(stats.samples(), 2);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let stats = Arc::new(ProviderStats::new("a"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record(sample(10, true), 0.3);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.samples(), 8000);
        assert!((stats.latency_ms().unwrap() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_table_snapshot() {
        let table = ProviderTable::new();
        table.get_or_create("b").record(sample(10, true), 0.3);
        table.get_or_create("a").record(sample(20, false), 0.3);
        assert!(Arc::ptr_eq(&table.get_or_create("a"), &table.get("a").unwrap()));

        let ids: Vec<_> = table.snapshot().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let mut snap = MetricsSnapshot::new();
        table.write_into(&mut snap);
        assert_eq!(snap["provider_a_success_rate"], 0.0);
        assert_eq!(snap["provider_b_latency_ms"], 10.0);
    }

    #[test]
    fn test_spec_builders() {
        let spec = ProviderSpec::from("p").with_weight(2.0).with_cost(0.01);
        assert_eq!(spec.id, "p");
        assert_eq!(spec.weight, 2.0);
        assert_eq!(spec.cost_per_call, 0.01);
    }
}
