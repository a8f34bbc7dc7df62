//! L1: Process-Local Tier
//!
//! An LRU map bounded by entry count, with a per-entry TTL. Entries are
//! indexed by key digest and remember their logical key so pattern
//! invalidation can match against it.
//!
//! All operations take one short `parking_lot` critical section; nothing
//! here awaits while holding the lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tokio::time::Instant;

use super::key::{CacheKey, DIGEST_LEN};
use super::{CacheEntry, Tier};

type Digest = [u8; DIGEST_LEN];

/// A single L1 slot
#[derive(Debug)]
struct LocalEntry {
    logical: Arc<str>,
    value: Arc<Vec<u8>>,
    expires_at: Instant,
    /// Recency tick; key into `LocalInner::recency`
    tick: u64,
    access_count: u64,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct LocalInner {
    entries: HashMap<Digest, LocalEntry>,
    /// Recency order: oldest tick first
    recency: BTreeMap<u64, Digest>,
    next_tick: u64,
    size_bytes: usize,
}

impl LocalInner {
    fn bump(&mut self) -> u64 {
        self.next_tick = self.next_tick.wrapping_add(1);
        self.next_tick
    }

    fn remove(&mut self, digest: &Digest) -> Option<LocalEntry> {
        let entry = self.entries.remove(digest)?;
        self.recency.remove(&entry.tick);
        self.size_bytes = self.size_bytes.saturating_sub(entry.value.len());
        Some(entry)
    }

    fn evict_lru(&mut self) -> bool {
        match self.recency.pop_first() {
            Some((_, digest)) => {
                if let Some(entry) = self.entries.remove(&digest) {
                    self.size_bytes = self.size_bytes.saturating_sub(entry.value.len());
                }
                true
            }
            None => false,
        }
    }
}

/// L1 statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalStats {
    /// Entries currently held (including not-yet-purged expired ones)
    pub entries: usize,
    /// Configured capacity
    pub capacity: usize,
    /// Bytes held across all values
    pub size_bytes: usize,
    /// Entries evicted to make room
    pub evictions: u64,
}

/// Process-local LRU tier
#[derive(Debug)]
pub struct LocalTier {
    inner: Mutex<LocalInner>,
    capacity: usize,
    evictions: AtomicU64,
}

impl LocalTier {
    /// Create an L1 tier holding at most `capacity` entries
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LocalInner::default()),
            capacity: capacity.max(1),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a live entry, refreshing its recency
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = inner.entries.get(key.digest())?.is_expired(now);
        if expired {
            inner.remove(key.digest());
            return None;
        }

        let tick = inner.bump();
        let (old_tick, entry) = {
            let entry = inner.entries.get_mut(key.digest())?;
            let old_tick = entry.tick;
            entry.tick = tick;
            entry.access_count = entry.access_count.saturating_add(1);
            (
                old_tick,
                CacheEntry {
                    value: Arc::clone(&entry.value),
                    tier: Tier::L1,
                    expires_at: Some(entry.expires_at),
                    access_count: entry.access_count,
                    promotion_count: 0,
                },
            )
        };
        inner.recency.remove(&old_tick);
        inner.recency.insert(tick, *key.digest());
        Some(entry)
    }

    /// Insert or replace an entry, evicting the least recently used on overflow
    pub fn insert(&self, key: &CacheKey, value: Arc<Vec<u8>>, ttl: Duration) {
        if ttl.is_zero() {
            self.remove(key);
            return;
        }

        let expires_at = Instant::now() + ttl;
        let mut inner = self.inner.lock();
        let access_count = inner.remove(key.digest()).map_or(0, |old| old.access_count);

        while inner.entries.len() >= self.capacity {
            if !inner.evict_lru() {
                break;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let tick = inner.bump();
        inner.size_bytes += value.len();
        inner.recency.insert(tick, *key.digest());
        inner.entries.insert(
            *key.digest(),
            LocalEntry {
                logical: Arc::from(key.logical()),
                value,
                expires_at,
                tick,
                access_count,
            },
        );
    }

    /// Remove one entry; returns whether it was present
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.inner.lock().remove(key.digest()).is_some()
    }

    /// Remove every entry whose logical key matches `pattern`
    pub fn remove_matching(&self, pattern: &Regex) -> usize {
        let mut inner = self.inner.lock();
        let doomed: Vec<Digest> = inner
            .entries
            .iter()
            .filter(|(_, entry)| pattern.is_match(&entry.logical))
            .map(|(digest, _)| *digest)
            .collect();

        for digest in &doomed {
            inner.remove(digest);
        }
        doomed.len()
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<Digest> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(digest, _)| *digest)
            .collect();

        for digest in &expired {
            inner.remove(digest);
        }
        expired.len()
    }

    /// Remove everything
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.size_bytes = 0;
    }

    /// Number of entries held
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether L1 is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> LocalStats {
        let inner = self.inner.lock();
        LocalStats {
            entries: inner.entries.len(),
            capacity: self.capacity,
            size_bytes: inner.size_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KeyPattern;

    fn value(s: &str) -> Arc<Vec<u8>> {
        Arc::new(s.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let l1 = LocalTier::new(10);
        let key = CacheKey::new("user:1");

        l1.insert(&key, value("alice"), Duration::from_secs(60));
        let entry = l1.get(&key).unwrap();

        assert_eq!(entry.value.as_slice(), b"alice");
        assert_eq!(entry.tier, Tier::L1);
        assert_eq!(entry.access_count, 1);
        assert_eq!(l1.stats().size_bytes, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let l1 = LocalTier::new(10);
        let key = CacheKey::new("user:1");
        l1.insert(&key, value("alice"), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(l1.get(&key).is_none());
        assert!(l1.is_empty());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let l1 = LocalTier::new(2);
        let a = CacheKey::new("a");
        let b = CacheKey::new("b");
        let c = CacheKey::new("c");

        l1.insert(&a, value("1"), Duration::from_secs(60));
        l1.insert(&b, value("2"), Duration::from_secs(60));
        // Touch `a` so `b` becomes least recently used
        assert!(l1.get(&a).is_some());
        l1.insert(&c, value("3"), Duration::from_secs(60));

        assert!(l1.get(&a).is_some());
        assert!(l1.get(&b).is_none());
        assert!(l1.get(&c).is_some());
        assert_eq!(l1.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_replace_keeps_single_slot() {
        let l1 = LocalTier::new(2);
        let key = CacheKey::new("k");
        l1.insert(&key, value("one"), Duration::from_secs(60));
        l1.insert(&key, value("three"), Duration::from_secs(60));

        assert_eq!(l1.len(), 1);
        assert_eq!(l1.stats().size_bytes, 5);
        assert_eq!(l1.get(&key).unwrap().value.as_slice(), b"three");
    }

    #[tokio::test]
    async fn test_remove_matching() {
        let l1 = LocalTier::new(10);
        for k in ["user:1", "user:2", "session:1"] {
            l1.insert(&CacheKey::new(k), value(k), Duration::from_secs(60));
        }

        let re = KeyPattern::new("user:*").to_regex().unwrap();
        assert_eq!(l1.remove_matching(&re), 2);
        assert!(l1.get(&CacheKey::new("user:1")).is_none());
        assert!(l1.get(&CacheKey::new("session:1")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let l1 = LocalTier::new(10);
        l1.insert(&CacheKey::new("short"), value("s"), Duration::from_secs(1));
        l1.insert(&CacheKey::new("long"), value("l"), Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(l1.purge_expired(), 1);
        assert_eq!(l1.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_removes() {
        let l1 = LocalTier::new(10);
        let key = CacheKey::new("k");
        l1.insert(&key, value("v"), Duration::from_secs(60));
        l1.insert(&key, value("v"), Duration::ZERO);
        assert!(l1.is_empty());
    }
}
