//! Tiered Cache Metrics

use super::Tier;
use crate::metrics::{ratio, Counter, LatencyHistogram, MetricsSnapshot};

/// Counters for the tiered cache
#[derive(Debug)]
pub struct CacheMetrics {
    /// Lookups started
    pub lookups: Counter,
    /// Hits per tier, indexed by [`Tier::index`]
    pub hits: [Counter; 4],
    /// Misses per tier
    pub misses: [Counter; 4],
    /// I/O failures per tier
    pub errors: [Counter; 4],
    /// Bytes saved by L3 compression
    pub bytes_saved: Counter,
    /// Values copied from L3/L4 into faster tiers
    pub promotions: Counter,
    /// L2 hits copied into L1
    pub l1_backfills: Counter,
    /// Local `invalidate` calls
    pub invalidations: Counter,
    /// Peer events applied to L1
    pub remote_invalidations: Counter,
    /// Background refreshes started for near-expiry L2 hits
    pub stale_refreshes: Counter,
    /// Background refreshes that failed
    pub refresh_failures: Counter,
    /// L4 rows removed by the expiry sweep
    pub expired_removed: Counter,
    /// Lookup latency
    pub lookup_latency: LatencyHistogram,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self {
            lookups: Counter::new(),
            hits: Default::default(),
            misses: Default::default(),
            errors: Default::default(),
            bytes_saved: Counter::new(),
            promotions: Counter::new(),
            l1_backfills: Counter::new(),
            invalidations: Counter::new(),
            remote_invalidations: Counter::new(),
            stale_refreshes: Counter::new(),
            refresh_failures: Counter::new(),
            expired_removed: Counter::new(),
            lookup_latency: LatencyHistogram::latency_default(),
        }
    }
}

impl CacheMetrics {
    /// Record a hit in `tier`
    pub fn hit(&self, tier: Tier) {
        self.hits[tier.index()].inc();
    }

    /// Record a miss in `tier`
    pub fn miss(&self, tier: Tier) {
        self.misses[tier.index()].inc();
    }

    /// Record an I/O failure in `tier`
    pub fn error(&self, tier: Tier) {
        self.errors[tier.index()].inc();
    }

    /// Hits recorded for `tier`
    #[must_use]
    pub fn hits_for(&self, tier: Tier) -> u64 {
        self.hits[tier.index()].get()
    }

    /// Misses recorded for `tier`
    #[must_use]
    pub fn misses_for(&self, tier: Tier) -> u64 {
        self.misses[tier.index()].get()
    }

    /// Failures recorded for `tier`
    #[must_use]
    pub fn errors_for(&self, tier: Tier) -> u64 {
        self.errors[tier.index()].get()
    }

    /// Flat view for scraping
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snap = MetricsSnapshot::new();
        let mut total_hits = 0;

        for tier in Tier::ALL {
            let hits = self.hits_for(tier);
            let misses = self.misses_for(tier);
            total_hits += hits;
            let label = tier.label();
            snap.insert(format!("{label}_hits"), hits as f64);
            snap.insert(format!("{label}_misses"), misses as f64);
            snap.insert(format!("{label}_errors"), self.errors_for(tier) as f64);
            snap.insert(format!("{label}_hit_rate"), ratio(hits, hits + misses));
        }

        let lookups = self.lookups.get();
        snap.insert("lookups".into(), lookups as f64);
        snap.insert("hit_rate".into(), ratio(total_hits, lookups));
        snap.insert("bytes_saved".into(), self.bytes_saved.get() as f64);
        snap.insert("promotions".into(), self.promotions.get() as f64);
        snap.insert("l1_backfills".into(), self.l1_backfills.get() as f64);
        snap.insert("invalidations".into(), self.invalidations.get() as f64);
        snap.insert(
            "remote_invalidations".into(),
            self.remote_invalidations.get() as f64,
        );
        snap.insert("stale_refreshes".into(), self.stale_refreshes.get() as f64);
        snap.insert("refresh_failures".into(), self.refresh_failures.get() as f64);
        snap.insert("expired_removed".into(), self.expired_removed.get() as f64);
        self.lookup_latency.write_into("lookup_latency", &mut snap);
        snap
    }
}
