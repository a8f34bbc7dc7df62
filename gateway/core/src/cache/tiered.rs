//! Tiered Cache Coordinator
//!
//! [`TieredCache`] owns the four tiers and implements the read path
//! (probe, backfill, promote, stale-while-revalidate), the write path
//! (L1 inline, shared tiers write-behind) and pattern invalidation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use super::compression::{unpack, Compressor};
use super::invalidation::{InvalidationEvent, InvalidationListener, InvalidationOp};
use super::key::{CacheKey, KeyPattern, DIGEST_LEN};
use super::local::LocalTier;
use super::stats::CacheMetrics;
use super::store::{
    InvalidationBus, KvStore, MemoryBus, MemoryKvStore, MemoryPersistentStore, PersistentStore,
};
use super::{CacheConfig, CacheEntry, Tier};
use crate::error::{GatewayResult, StoreError};
use crate::metrics::MetricsSnapshot;
use crate::tasks::{spawn_sweep, BackgroundTasks, ServiceHandle, TaskConfig};

/// Produces a fresh value for a near-expiry key
pub type RefreshFn = Box<dyn FnOnce() -> BoxFuture<'static, GatewayResult<Vec<u8>>> + Send>;

/// Storage behind the shared tiers
#[derive(Clone)]
pub struct CacheBackends {
    /// Hot key-value store
    pub l2: Arc<dyn KvStore>,
    /// Warm key-value store (compressed payloads)
    pub l3: Arc<dyn KvStore>,
    /// Persistent table
    pub l4: Arc<dyn PersistentStore>,
    /// Coherency channel; `None` disables publishing and listening
    pub bus: Option<Arc<dyn InvalidationBus>>,
}

impl CacheBackends {
    /// Single-process backends held entirely in memory
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            l2: Arc::new(MemoryKvStore::new()),
            l3: Arc::new(MemoryKvStore::new()),
            l4: Arc::new(MemoryPersistentStore::new()),
            bus: Some(Arc::new(MemoryBus::default())),
        }
    }
}

impl std::fmt::Debug for CacheBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBackends")
            .field("bus", &self.bus.is_some())
            .finish_non_exhaustive()
    }
}

/// Per-write TTL overrides; unset tiers use the configured default
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TtlOverrides {
    /// L1 TTL
    pub l1: Option<Duration>,
    /// L2 TTL
    pub l2: Option<Duration>,
    /// L3 TTL
    pub l3: Option<Duration>,
    /// L4 TTL
    pub l4: Option<Duration>,
}

impl TtlOverrides {
    /// The same TTL in every tier
    #[must_use]
    pub fn uniform(ttl: Duration) -> Self {
        Self {
            l1: Some(ttl),
            l2: Some(ttl),
            l3: Some(ttl),
            l4: Some(ttl),
        }
    }

    fn resolve(&self, config: &CacheConfig, tier: Tier) -> Duration {
        let override_ttl = match tier {
            Tier::L1 => self.l1,
            Tier::L2 => self.l2,
            Tier::L3 => self.l3,
            Tier::L4 => self.l4,
        };
        override_ttl.unwrap_or_else(|| config.ttl_for(tier))
    }
}

/// What an `invalidate` call removed, per tier
///
/// Shared-tier counts are zero when that tier failed (the failure is logged
/// and counted in metrics).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// L1 entries removed
    pub l1: usize,
    /// L2 keys removed
    pub l2: u64,
    /// L3 keys removed
    pub l3: u64,
    /// L4 rows removed
    pub l4: u64,
}

impl InvalidationReport {
    /// Total removed across tiers
    #[must_use]
    pub fn total(&self) -> u64 {
        self.l1 as u64 + self.l2 + self.l3 + self.l4
    }
}

// ============================================================================
// Pending Shared-Tier Writes
// ============================================================================

/// Shared-tier writes that are scheduled or running
///
/// `invalidate` waits for every matching write before deleting, so a
/// write-behind or promotion can never land after the delete and bring an
/// invalidated value back.
#[derive(Default)]
struct PendingWrites {
    next_id: AtomicU64,
    writes: DashMap<u64, (Arc<str>, watch::Receiver<()>)>,
}

/// Registration held by one write task
///
/// Dropping it (the task finished, was aborted, or was never spawned)
/// deregisters the write and wakes anyone settling it.
struct PendingWrite {
    registry: Arc<PendingWrites>,
    id: u64,
    _done: watch::Sender<()>,
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        self.registry.writes.remove(&self.id);
    }
}

impl PendingWrites {
    fn register(self: &Arc<Self>, key: &CacheKey) -> PendingWrite {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done, watcher) = watch::channel(());
        self.writes.insert(id, (Arc::from(key.logical()), watcher));
        PendingWrite {
            registry: Arc::clone(self),
            id,
            _done: done,
        }
    }

    /// Wait for every write whose logical key matches `pattern`; returns
    /// how many were waited on
    async fn settle(&self, pattern: &Regex) -> usize {
        let matching: Vec<watch::Receiver<()>> = self
            .writes
            .iter()
            .filter(|w| pattern.is_match(&w.value().0))
            .map(|w| w.value().1.clone())
            .collect();

        let count = matching.len();
        for mut watcher in matching {
            // Nothing is ever sent: this resolves once the sender drops
            while watcher.changed().await.is_ok() {}
        }
        count
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.writes.len()
    }
}

struct Inner {
    config: CacheConfig,
    instance_id: String,
    l1: Arc<LocalTier>,
    l2: Arc<dyn KvStore>,
    l3: Arc<dyn KvStore>,
    l4: Arc<dyn PersistentStore>,
    bus: Option<Arc<dyn InvalidationBus>>,
    compressor: Compressor,
    tasks: BackgroundTasks,
    metrics: Arc<CacheMetrics>,
    /// Keys with a stale refresh in flight
    refreshing: DashSet<[u8; DIGEST_LEN]>,
    pending: Arc<PendingWrites>,
}

impl Inner {
    fn ttl(&self, overrides: &TtlOverrides, tier: Tier) -> Duration {
        overrides.resolve(&self.config, tier)
    }

    fn storage_key(&self, key: &CacheKey, tier: Tier) -> String {
        key.storage_key(&self.config.namespace, tier)
    }

    /// Log and count a tier failure; the caller falls through
    fn tier_fault(&self, tier: Tier, key: &str, op: &'static str, err: &StoreError) {
        self.metrics.error(tier);
        tracing::warn!(tier = %tier, key, op, error = %err, "Cache tier failure, skipping");
    }

    fn absorb<T: Default>(
        &self,
        tier: Tier,
        key: &str,
        op: &'static str,
        result: Result<T, StoreError>,
    ) -> T {
        result.unwrap_or_else(|e| {
            self.tier_fault(tier, key, op, &e);
            T::default()
        })
    }

    async fn publish(&self, operation: InvalidationOp, pattern: &KeyPattern) {
        if !self.config.pubsub_enabled {
            return;
        }
        let Some(bus) = &self.bus else {
            return;
        };

        let event =
            InvalidationEvent::new(pattern.as_glob(), operation).with_origin(&self.instance_id);
        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode invalidation event");
                return;
            }
        };
        if let Err(e) = bus.publish(&self.config.invalidation_channel, &payload).await {
            tracing::warn!(
                channel = %self.config.invalidation_channel,
                pattern = %pattern,
                error = %e,
                "Failed to publish invalidation event"
            );
        }
    }

    /// Write a value to L2, L3 (packed) and L4, then announce it
    async fn write_behind(&self, key: CacheKey, value: Arc<Vec<u8>>, overrides: TtlOverrides) {
        let k2 = self.storage_key(&key, Tier::L2);
        let k3 = self.storage_key(&key, Tier::L3);
        let k4 = self.storage_key(&key, Tier::L4);
        let packed = self.compressor.pack(&value);

        let (r2, r3, r4) = tokio::join!(
            self.l2.set_ex(&k2, &value, self.ttl(&overrides, Tier::L2)),
            self.l3.set_ex(&k3, &packed.bytes, self.ttl(&overrides, Tier::L3)),
            self.l4.upsert(&k4, &value, self.ttl(&overrides, Tier::L4)),
        );

        self.absorb(Tier::L2, &k2, "set", r2);
        if r3.is_ok() {
            self.metrics.bytes_saved.add(packed.saved);
        }
        self.absorb(Tier::L3, &k3, "set", r3);
        self.absorb(Tier::L4, &k4, "upsert", r4);

        self.publish(InvalidationOp::Set, &KeyPattern::literal(key.logical()))
            .await;
    }

    /// Copy an L3 or L4 hit into the faster tiers
    ///
    /// L1 is filled inline (a map insert); the shared tiers are written on
    /// the background registry. Promoted copies never outlive the source.
    fn promote(
        self: &Arc<Self>,
        key: &CacheKey,
        value: &Arc<Vec<u8>>,
        from: Tier,
        ttl_left: Option<Duration>,
    ) {
        if ttl_left.is_some_and(|left| left.is_zero()) {
            return;
        }
        let cap = move |ttl: Duration| ttl_left.map_or(ttl, |left| left.min(ttl));

        self.metrics.promotions.inc();
        self.l1.insert(key, Arc::clone(value), cap(self.config.l1_ttl));

        let inner = Arc::clone(self);
        let pending = self.pending.register(key);
        let key = key.clone();
        let value = Arc::clone(value);
        self.tasks.spawn("cache.promote", async move {
            let _pending = pending;
            let k2 = inner.storage_key(&key, Tier::L2);
            let r2 = inner.l2.set_ex(&k2, &value, cap(inner.config.l2_ttl)).await;
            inner.absorb(Tier::L2, &k2, "promote", r2);

            if from == Tier::L4 {
                let k3 = inner.storage_key(&key, Tier::L3);
                let packed = inner.compressor.pack(&value);
                match inner.l3.set_ex(&k3, &packed.bytes, cap(inner.config.l3_ttl)).await {
                    Ok(()) => inner.metrics.bytes_saved.add(packed.saved),
                    Err(e) => inner.tier_fault(Tier::L3, &k3, "promote", &e),
                }
            }
            tracing::trace!(key = %key, from = %from, "Promoted cache entry");
        });
    }
}

/// Four-tier cache handle
///
/// Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct TieredCache {
    inner: Arc<Inner>,
}

impl TieredCache {
    /// Create a cache over the given backends
    ///
    /// Background work (promotion, write-behind, refresh) runs on `tasks`.
    #[must_use]
    pub fn new(config: CacheConfig, backends: CacheBackends, tasks: BackgroundTasks) -> Self {
        let instance_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(
            instance_id = %instance_id,
            namespace = %config.namespace,
            l1_capacity = config.l1_capacity,
            "Creating tiered cache"
        );

        Self {
            inner: Arc::new(Inner {
                l1: Arc::new(LocalTier::new(config.l1_capacity)),
                compressor: Compressor::new(
                    config.compression_enabled,
                    config.compression_threshold,
                    config.compression_level,
                ),
                instance_id,
                l2: backends.l2,
                l3: backends.l3,
                l4: backends.l4,
                bus: backends.bus,
                tasks,
                metrics: Arc::new(CacheMetrics::default()),
                refreshing: DashSet::new(),
                pending: Arc::new(PendingWrites::default()),
                config,
            }),
        }
    }

    /// Create a single-process cache with in-memory backends
    #[must_use]
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(
            config,
            CacheBackends::in_memory(),
            BackgroundTasks::new(&TaskConfig::default()),
        )
    }

    /// Identifier attached to events this instance publishes
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Cache counters
    #[must_use]
    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// The process-local tier
    #[must_use]
    pub fn l1(&self) -> &LocalTier {
        &self.inner.l1
    }

    /// Registry running this cache's background work
    #[must_use]
    pub fn tasks(&self) -> &BackgroundTasks {
        &self.inner.tasks
    }

    /// Wait for outstanding promotion, write-behind and refresh work
    pub async fn wait_background(&self) {
        self.inner.tasks.wait_idle().await;
    }

    // ========================================================================
    // Read Path
    // ========================================================================

    /// Look up and decode a value
    ///
    /// Values that fail to decode are reported as misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let key = CacheKey::new(key);
        let entry = self.get_entry(&key, None).await?;
        decode_or_log(&key, &entry)
    }

    /// Look up and decode a value, refreshing it in the background if the
    /// L2 copy is close to expiry
    ///
    /// `refresh` is only invoked when an L2 hit falls inside the grace
    /// window; its result is written back through [`set_bytes`](Self::set_bytes).
    pub async fn get_with_refresh<T, F, Fut>(&self, key: &str, refresh: F) -> Option<T>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = GatewayResult<Vec<u8>>> + Send + 'static,
    {
        let key = CacheKey::new(key);
        let refresh: RefreshFn = Box::new(move || Box::pin(refresh()));
        let entry = self.get_entry(&key, Some(refresh)).await?;
        decode_or_log(&key, &entry)
    }

    /// Probe the tiers in order and return the first hit
    ///
    /// Tier failures are logged, counted and treated as misses.
    pub async fn get_entry(
        &self,
        key: &CacheKey,
        refresh: Option<RefreshFn>,
    ) -> Option<CacheEntry> {
        let started = Instant::now();
        let inner = &self.inner;
        inner.metrics.lookups.inc();

        let found = self.probe(key, refresh).await;
        inner.metrics.lookup_latency.record(started.elapsed());
        if let Some(entry) = &found {
            tracing::trace!(key = %key, tier = %entry.tier, "Cache hit");
        }
        found
    }

    async fn probe(&self, key: &CacheKey, refresh: Option<RefreshFn>) -> Option<CacheEntry> {
        let inner = &self.inner;

        // L1
        if let Some(entry) = inner.l1.get(key) {
            inner.metrics.hit(Tier::L1);
            return Some(entry);
        }
        inner.metrics.miss(Tier::L1);

        // L2
        let k2 = inner.storage_key(key, Tier::L2);
        match inner.l2.get(&k2).await {
            Ok(Some(found)) => {
                inner.metrics.hit(Tier::L2);
                let value = Arc::new(found.bytes);
                let entry = CacheEntry::new(Arc::clone(&value), Tier::L2, found.ttl);

                let l1_ttl = found
                    .ttl
                    .map_or(inner.config.l1_ttl, |left| left.min(inner.config.l1_ttl));
                inner.l1.insert(key, value, l1_ttl);
                inner.metrics.l1_backfills.inc();

                if inner.config.swr_enabled && entry.is_near_expiry(inner.config.swr_grace) {
                    if let Some(refresh) = refresh {
                        self.schedule_refresh(key, refresh);
                    }
                }
                return Some(entry);
            }
            Ok(None) => inner.metrics.miss(Tier::L2),
            Err(e) => inner.tier_fault(Tier::L2, &k2, "get", &e),
        }

        // L3
        let k3 = inner.storage_key(key, Tier::L3);
        match inner.l3.get(&k3).await {
            Ok(Some(found)) => match unpack(&found.bytes) {
                Ok(raw) => {
                    inner.metrics.hit(Tier::L3);
                    let value = Arc::new(raw);
                    inner.promote(key, &value, Tier::L3, found.ttl);
                    let mut entry = CacheEntry::new(value, Tier::L3, found.ttl);
                    entry.promotion_count = 1;
                    return Some(entry);
                }
                Err(e) => inner.tier_fault(Tier::L3, &k3, "decode", &e),
            },
            Ok(None) => inner.metrics.miss(Tier::L3),
            Err(e) => inner.tier_fault(Tier::L3, &k3, "get", &e),
        }

        // L4
        let k4 = inner.storage_key(key, Tier::L4);
        match inner.l4.get(&k4).await {
            Ok(Some(row)) => {
                inner.metrics.hit(Tier::L4);
                let ttl_left = row.ttl_remaining();
                let value = Arc::new(row.value);
                inner.promote(key, &value, Tier::L4, Some(ttl_left));
                let mut entry = CacheEntry::new(value, Tier::L4, Some(ttl_left));
                entry.access_count = u64::try_from(row.access_count).unwrap_or(0);
                entry.promotion_count = 2;
                Some(entry)
            }
            Ok(None) => {
                inner.metrics.miss(Tier::L4);
                None
            }
            Err(e) => {
                inner.tier_fault(Tier::L4, &k4, "get", &e);
                None
            }
        }
    }

    fn schedule_refresh(&self, key: &CacheKey, refresh: RefreshFn) {
        let inner = &self.inner;
        let dedup = inner.config.swr_dedup;
        if dedup && !inner.refreshing.insert(*key.digest()) {
            tracing::trace!(key = %key, "Refresh already in flight");
            return;
        }
        inner.metrics.stale_refreshes.inc();

        let cache = self.clone();
        let key = key.clone();
        let digest = *key.digest();
        let spawned = inner.tasks.spawn("cache.refresh", async move {
            match refresh().await {
                Ok(bytes) => {
                    tracing::debug!(key = %key, "Refreshed near-expiry entry");
                    cache.set_bytes(&key, bytes, &TtlOverrides::default());
                }
                Err(e) => {
                    cache.inner.metrics.refresh_failures.inc();
                    tracing::warn!(key = %key, error = %e, "Background refresh failed");
                }
            }
            if dedup {
                cache.inner.refreshing.remove(key.digest());
            }
        });

        if dedup && !spawned {
            inner.refreshing.remove(&digest);
        }
    }

    // ========================================================================
    // Write Path
    // ========================================================================

    /// Serialize and store a value in every tier
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Serialization` if the value cannot be encoded.
    /// Tier write failures are absorbed.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: &TtlOverrides,
    ) -> GatewayResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set_bytes(&CacheKey::new(key), bytes, ttl);
        Ok(())
    }

    /// Store raw bytes in every tier
    ///
    /// L1 is written before returning. L2, L3 and L4 are written in the
    /// background, followed by a coherency event.
    pub fn set_bytes(&self, key: &CacheKey, value: Vec<u8>, ttl: &TtlOverrides) {
        let inner = &self.inner;
        let value = Arc::new(value);
        inner
            .l1
            .insert(key, Arc::clone(&value), inner.ttl(ttl, Tier::L1));

        let bg = Arc::clone(inner);
        let pending = inner.pending.register(key);
        let key = key.clone();
        let overrides = *ttl;
        let spawned = inner.tasks.spawn("cache.write_behind", async move {
            let _pending = pending;
            bg.write_behind(key, value, overrides).await;
        });
        if !spawned {
            tracing::warn!("Write-behind dropped; shared tiers not updated");
        }
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Remove every key matching a glob from all tiers and notify peers
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidPattern` if the glob cannot be compiled.
    /// Tier failures are absorbed and reported as zero removals.
    pub async fn invalidate(&self, pattern: &str) -> GatewayResult<InvalidationReport> {
        let inner = &self.inner;
        let pattern = KeyPattern::new(pattern);
        let regex = pattern.to_regex()?;
        let ns = &inner.config.namespace;

        let l1 = inner.l1.remove_matching(&regex);
        let settled = inner.pending.settle(&regex).await;
        if settled > 0 {
            tracing::debug!(pattern = %pattern, settled, "Waited for in-flight tier writes");
        }

        let p2 = pattern.for_tier(ns, Tier::L2);
        let p3 = pattern.for_tier(ns, Tier::L3);
        let p4 = pattern.for_tier(ns, Tier::L4);
        let (r2, r3, r4) = tokio::join!(
            inner.l2.delete_matching(p2.as_glob()),
            inner.l3.delete_matching(p3.as_glob()),
            inner.l4.delete_matching(&p4),
        );

        let report = InvalidationReport {
            l1,
            l2: inner.absorb(Tier::L2, p2.as_glob(), "invalidate", r2),
            l3: inner.absorb(Tier::L3, p3.as_glob(), "invalidate", r3),
            l4: inner.absorb(Tier::L4, p4.as_glob(), "invalidate", r4),
        };

        inner.metrics.invalidations.inc();
        inner.publish(InvalidationOp::Invalidate, &pattern).await;
        tracing::debug!(
            pattern = %pattern,
            l1 = report.l1,
            l2 = report.l2,
            l3 = report.l3,
            l4 = report.l4,
            "Invalidated cache entries"
        );
        Ok(report)
    }

    /// Delete expired L1 entries and L4 rows; returns the L4 rows removed
    pub async fn clear_expired(&self) -> u64 {
        let inner = &self.inner;
        let purged = inner.l1.purge_expired();
        match inner.l4.delete_expired().await {
            Ok(removed) => {
                inner.metrics.expired_removed.add(removed);
                tracing::debug!(l1 = purged, l4 = removed, "Cleared expired cache entries");
                removed
            }
            Err(e) => {
                inner.tier_fault(Tier::L4, "*", "delete_expired", &e);
                0
            }
        }
    }

    // ========================================================================
    // Services
    // ========================================================================

    /// Start applying peer invalidation events to L1
    ///
    /// Returns `None` when pub/sub is disabled or no bus is configured.
    #[must_use]
    pub fn start_invalidation_listener(&self) -> Option<ServiceHandle> {
        let inner = &self.inner;
        if !inner.config.pubsub_enabled {
            return None;
        }
        let listener = InvalidationListener {
            bus: inner.bus.clone()?,
            channel: inner.config.invalidation_channel.clone(),
            instance_id: inner.instance_id.clone(),
            l1: Arc::clone(&inner.l1),
            metrics: Arc::clone(&inner.metrics),
        };
        Some(ServiceHandle::spawn(
            "cache.invalidation_listener",
            listener.run(),
        ))
    }

    /// Start the periodic L4 expiry sweep
    ///
    /// The sweep holds a weak reference and stops doing work once every
    /// cache handle is dropped.
    #[must_use]
    pub fn start_expiry_sweep(&self) -> ServiceHandle {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        spawn_sweep(
            "cache.expiry_sweep",
            self.inner.config.l4_sweep_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        TieredCache { inner }.clear_expired().await;
                    }
                }
            },
        )
    }

    /// Cache metrics plus L1 occupancy
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snap = self.inner.metrics.snapshot();
        let l1 = self.inner.l1.stats();
        snap.insert("l1_entries".into(), l1.entries as f64);
        snap.insert("l1_capacity".into(), l1.capacity as f64);
        snap.insert("l1_size_bytes".into(), l1.size_bytes as f64);
        snap.insert("l1_evictions".into(), l1.evictions as f64);
        snap
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("instance_id", &self.inner.instance_id)
            .field("namespace", &self.inner.config.namespace)
            .field("l1_entries", &self.inner.l1.len())
            .finish()
    }
}

fn decode_or_log<T: DeserializeOwned>(key: &CacheKey, entry: &CacheEntry) -> Option<T> {
    match entry.decode() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key = %key, tier = %entry.tier, error = %e, "Cached value failed to decode");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Fixture {
        cache: TieredCache,
        l2: Arc<MemoryKvStore>,
        l3: Arc<MemoryKvStore>,
        l4: Arc<MemoryPersistentStore>,
    }

    fn fixture(config: CacheConfig) -> Fixture {
        let l2 = Arc::new(MemoryKvStore::new());
        let l3 = Arc::new(MemoryKvStore::new());
        let l4 = Arc::new(MemoryPersistentStore::new());
        let backends = CacheBackends {
            l2: l2.clone(),
            l3: l3.clone(),
            l4: l4.clone(),
            bus: None,
        };
        let cache = TieredCache::new(config, backends, BackgroundTasks::new(&TaskConfig::default()));
        Fixture { cache, l2, l3, l4 }
    }

    #[tokio::test]
    async fn test_set_then_get_from_l1() {
        let fx = fixture(CacheConfig::default());
        fx.cache.set("user:1", &"alice", &TtlOverrides::default()).unwrap();

        // Visible before write-behind finishes
        assert_eq!(fx.cache.get::<String>("user:1").await.as_deref(), Some("alice"));
        assert_eq!(fx.cache.metrics().hits_for(Tier::L1), 1);

        fx.cache.wait_background().await;
        assert!(fx.l2.contains("gw:l2:user:1"));
        assert!(fx.l3.contains("gw:l3:user:1"));
        assert!(fx.l4.peek("gw:l4:user:1").is_some());
        assert_eq!(fx.cache.metrics().promotions.get(), 0);
    }

    #[tokio::test]
    async fn test_l2_hit_backfills_l1() {
        let fx = fixture(CacheConfig::default());
        fx.l2
            .set_ex("gw:l2:k", br#""v""#, Duration::from_secs(120))
            .await
            .unwrap();

        assert_eq!(fx.cache.get::<String>("k").await.as_deref(), Some("v"));
        assert_eq!(fx.cache.metrics().hits_for(Tier::L2), 1);
        assert_eq!(fx.cache.metrics().l1_backfills.get(), 1);

        assert_eq!(fx.cache.get::<String>("k").await.as_deref(), Some("v"));
        assert_eq!(fx.l2.calls().reads(), 1);
    }

    #[tokio::test]
    async fn test_l3_hit_is_decompressed_and_promoted() {
        let fx = fixture(CacheConfig {
            compression_threshold: 8,
            ..CacheConfig::default()
        });

        let value = serde_json::to_vec(&"x".repeat(500)).unwrap();
        let packed = Compressor::new(true, 8, 6).pack(&value);
        assert!(packed.is_compressed());
        fx.l3
            .set_ex("gw:l3:big", &packed.bytes, Duration::from_secs(600))
            .await
            .unwrap();

        let got: String = fx.cache.get("big").await.unwrap();
        assert_eq!(got.len(), 500);
        assert_eq!(fx.cache.metrics().promotions.get(), 1);

        fx.cache.wait_background().await;
        assert!(fx.l2.contains("gw:l2:big"));
        assert!(!fx.cache.l1().is_empty());
    }

    #[tokio::test]
    async fn test_failing_tier_is_skipped() {
        let fx = fixture(CacheConfig::default());
        fx.l4.upsert("gw:l4:k", b"7", Duration::from_secs(600)).await.unwrap();
        fx.l2.set_failing(true);
        fx.l3.set_failing(true);

        assert_eq!(fx.cache.get::<u32>("k").await, Some(7));
        assert_eq!(fx.cache.metrics().errors_for(Tier::L2), 1);
        assert_eq!(fx.cache.metrics().errors_for(Tier::L3), 1);
        assert_eq!(fx.cache.metrics().hits_for(Tier::L4), 1);
    }

    #[tokio::test]
    async fn test_corrupt_l3_payload_falls_through() {
        let fx = fixture(CacheConfig::default());
        fx.l3
            .set_ex("gw:l3:k", &[0x7f, 1, 2], Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(fx.cache.get::<u32>("k").await, None);
        assert_eq!(fx.cache.metrics().errors_for(Tier::L3), 1);
        assert_eq!(fx.cache.metrics().misses_for(Tier::L4), 1);
    }

    #[tokio::test]
    async fn test_invalidate_reports_per_tier() {
        let fx = fixture(CacheConfig::default());
        for key in ["user:1", "user:2", "team:1"] {
            fx.cache.set(key, &1, &TtlOverrides::default()).unwrap();
        }
        fx.cache.wait_background().await;

        let report = fx.cache.invalidate("user:*").await.unwrap();
        assert_eq!(
            report,
            InvalidationReport { l1: 2, l2: 2, l3: 2, l4: 2 }
        );
        assert_eq!(report.total(), 8);
        assert_eq!(fx.cache.get::<u32>("user:1").await, None);
        assert_eq!(fx.cache.get::<u32>("team:1").await, Some(1));
    }

    #[tokio::test]
    async fn test_invalidate_wins_over_pending_write_behind() {
        let fx = fixture(CacheConfig::default());
        fx.cache.set("user:42", &"alice", &TtlOverrides::default()).unwrap();
        assert_eq!(fx.cache.inner.pending.len(), 1);

        // No wait_background between the write and the delete
        let report = fx.cache.invalidate("user:*").await.unwrap();
        assert_eq!(report, InvalidationReport { l1: 1, l2: 1, l3: 1, l4: 1 });
        assert_eq!(fx.cache.inner.pending.len(), 0);

        fx.cache.wait_background().await;
        assert_eq!(fx.cache.get::<String>("user:42").await, None);
        assert!(!fx.l2.contains("gw:l2:user:42"));
        assert!(!fx.l3.contains("gw:l3:user:42"));
        assert!(fx.l4.peek("gw:l4:user:42").is_none());
    }

    #[tokio::test]
    async fn test_invalidate_wins_over_pending_promotion() {
        let fx = fixture(CacheConfig::default());
        fx.l4
            .upsert("gw:l4:doc:1", br#""v""#, Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(fx.cache.get::<String>("doc:1").await.as_deref(), Some("v"));

        fx.cache.invalidate("doc:*").await.unwrap();
        fx.cache.wait_background().await;
        assert!(!fx.l2.contains("gw:l2:doc:1"));
        assert!(!fx.l3.contains("gw:l3:doc:1"));
        assert_eq!(fx.cache.get::<String>("doc:1").await, None);
    }

    #[tokio::test]
    async fn test_invalidate_ignores_unrelated_pending_writes() {
        let fx = fixture(CacheConfig::default());
        fx.cache.set("team:1", &1, &TtlOverrides::default()).unwrap();

        let report = fx.cache.invalidate("user:*").await.unwrap();
        assert_eq!(report.total(), 0);

        fx.cache.wait_background().await;
        assert!(fx.l4.peek("gw:l4:team:1").is_some());
    }

    async fn grace_window_hits(fx: &Fixture, hits: usize) -> u32 {
        fx.l2
            .set_ex("gw:l2:quote", br#""old""#, Duration::from_secs(10))
            .await
            .unwrap();
        let refreshes = Arc::new(std::sync::atomic::AtomicU32::new(0));
        for _ in 0..hits {
            let refreshes = refreshes.clone();
            let got = fx
                .cache
                .get_with_refresh::<String, _, _>("quote", move || async move {
                    refreshes.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(br#""new""#.to_vec())
                })
                .await;
            assert_eq!(got.as_deref(), Some("old"));
            fx.cache.l1().clear();
        }
        fx.cache.wait_background().await;
        refreshes.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_swr_dedup_collapses_refreshes_of_one_key() {
        let fx = fixture(CacheConfig {
            swr_dedup: true,
            ..CacheConfig::default()
        });

        assert_eq!(grace_window_hits(&fx, 3).await, 1);
        assert_eq!(fx.cache.metrics().stale_refreshes.get(), 1);
        assert!(fx.cache.inner.refreshing.is_empty());
        assert_eq!(fx.cache.get::<String>("quote").await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_swr_without_dedup_refreshes_on_every_hit() {
        let fx = fixture(CacheConfig::default());

        assert_eq!(grace_window_hits(&fx, 2).await, 2);
        assert_eq!(fx.cache.metrics().stale_refreshes.get(), 2);
        assert!(fx.cache.inner.refreshing.is_empty());
    }

    #[tokio::test]
    async fn test_ttl_overrides() {
        let fx = fixture(CacheConfig::default());
        let ttl = TtlOverrides {
            l4: Some(Duration::from_secs(10)),
            ..TtlOverrides::default()
        };
        fx.cache.set("k", &1, &ttl).unwrap();
        fx.cache.wait_background().await;

        let row = fx.l4.peek("gw:l4:k").unwrap();
        assert!(row.ttl_remaining() <= Duration::from_secs(10));
        let l2 = fx.l2.get("gw:l2:k").await.unwrap().unwrap();
        assert!(l2.ttl.unwrap() > Duration::from_secs(200));
    }

    #[tokio::test]
    async fn test_clear_expired() {
        let fx = fixture(CacheConfig::default());
        fx.l4.upsert("gw:l4:old", b"1", Duration::ZERO).await.unwrap();
        fx.l4.upsert("gw:l4:new", b"1", Duration::from_secs(60)).await.unwrap();

        assert_eq!(fx.cache.clear_expired().await, 1);
        assert_eq!(fx.cache.metrics().expired_removed.get(), 1);
        assert_eq!(fx.l4.len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_value_is_a_miss() {
        let fx = fixture(CacheConfig::default());
        fx.cache.set("k", &"text", &TtlOverrides::default()).unwrap();
        assert_eq!(fx.cache.get::<u64>("k").await, None);
    }
}
