//! Backing Store Interfaces
//!
//! The shared tiers talk to their storage through three traits:
//!
//! - [`KvStore`]: L2/L3 key-value store with TTLs and pattern scans
//! - [`InvalidationBus`]: publish/subscribe channel for coherency events
//! - [`PersistentStore`]: L4 relational table with upsert and pattern delete
//!
//! In-memory implementations back single-node deployments and tests. They
//! count calls and can be switched into a failing mode to exercise the
//! cache's degradation paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use super::key::KeyPattern;
use crate::error::StoreError;

/// A value read from a [`KvStore`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvValue {
    /// Stored bytes
    pub bytes: Vec<u8>,
    /// Remaining time to live, if the key has one
    pub ttl: Option<Duration>,
}

/// Remote key-value store backing L2 and L3
#[async_trait]
pub trait KvStore: Send + Sync {
    /// `GET` plus the key's remaining TTL
    async fn get(&self, key: &str) -> Result<Option<KvValue>, StoreError>;

    /// `SETEX`: store bytes with a TTL
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// `SCAN MATCH`: every key matching a glob
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// `DEL`: returns how many keys existed
    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Scan then delete every key matching a glob
    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        let keys = self.scan(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.delete(&keys).await
    }
}

/// Publish/subscribe channel for invalidation events
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    /// Publish a payload to every subscriber of `channel`
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to `channel`; the stream ends when the subscription drops
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError>;
}

/// A row of the L4 table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedRow {
    /// Primary key
    pub key: String,
    /// Stored value
    pub value: Vec<u8>,
    /// First insert time
    pub created_at: DateTime<Utc>,
    /// Expiration time
    pub expires_at: DateTime<Utc>,
    /// Reads plus writes recorded against the row
    pub access_count: i64,
    /// Last read or write
    pub last_accessed: DateTime<Utc>,
}

impl PersistedRow {
    /// Time left before expiry (zero if already expired)
    #[must_use]
    pub fn ttl_remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or_default()
    }
}

/// Persistent relational store backing L4
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Read a live (unexpired) row, recording the access
    async fn get(&self, key: &str) -> Result<Option<PersistedRow>, StoreError>;

    /// Insert, or on conflict replace the value and bump `access_count`
    async fn upsert(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Delete rows whose key matches `pattern`
    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, StoreError>;

    /// Delete rows past their expiration
    async fn delete_expired(&self) -> Result<u64, StoreError>;
}

// ============================================================================
// In-Memory Key-Value Store
// ============================================================================

/// Call counters shared by the in-memory stores
#[derive(Debug, Default)]
pub struct StoreCalls {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl StoreCalls {
    /// Read calls so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Write calls so far
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Delete calls so far
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }
}

fn injected_fault() -> StoreError {
    StoreError::Connection("injected fault".to_string())
}

/// In-memory [`KvStore`] with TTL expiry
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, (Vec<u8>, Instant)>,
    failing: AtomicBool,
    calls: StoreCalls,
}

impl MemoryKvStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Call counters
    pub fn calls(&self) -> &StoreCalls {
        &self.calls
    }

    /// Whether `key` holds a live value (does not count as a call)
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.1 > Instant::now())
    }

    /// Number of live keys
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.1 > now).count()
    }

    /// Whether no live keys remain
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Acquire) {
            Err(injected_fault())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvValue>, StoreError> {
        self.calls.reads.fetch_add(1, Ordering::Relaxed);
        self.check()?;

        let now = Instant::now();
        let live = self.entries.get(key).and_then(|entry| {
            let (bytes, expires_at) = entry.value();
            (*expires_at > now).then(|| KvValue {
                bytes: bytes.clone(),
                ttl: Some(expires_at.saturating_duration_since(now)),
            })
        });
        if live.is_none() {
            self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        }
        Ok(live)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.calls.writes.fetch_add(1, Ordering::Relaxed);
        self.check()?;
        self.entries
            .insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.calls.reads.fetch_add(1, Ordering::Relaxed);
        self.check()?;
        let re = KeyPattern::new(pattern)
            .to_regex()
            .map_err(|e| StoreError::Command(e.to_string()))?;
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.value().1 > now && re.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.calls.deletes.fetch_add(1, Ordering::Relaxed);
        self.check()?;
        Ok(keys
            .iter()
            .filter(|k| self.entries.remove(k.as_str()).is_some())
            .count() as u64)
    }
}

// ============================================================================
// In-Memory Invalidation Bus
// ============================================================================

/// In-process [`InvalidationBus`] over tokio broadcast channels
///
/// Cloning shares the underlying channels, so two caches built from clones
/// of one bus see each other's events.
#[derive(Clone, Debug)]
pub struct MemoryBus {
    channels: std::sync::Arc<DashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MemoryBus {
    /// Create a bus whose channels buffer up to `capacity` messages per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: std::sync::Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl InvalidationBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        // No subscribers is not an error
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError> {
        let rx = self.sender(channel).subscribe();
        Ok(BroadcastStream::new(rx)
            .filter_map(|msg| futures::future::ready(msg.ok()))
            .boxed())
    }
}

// ============================================================================
// In-Memory Persistent Store
// ============================================================================

/// In-memory [`PersistentStore`] mirroring the L4 table semantics
#[derive(Debug, Default)]
pub struct MemoryPersistentStore {
    rows: DashMap<String, PersistedRow>,
    failing: AtomicBool,
    calls: StoreCalls,
}

impl MemoryPersistentStore {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Call counters
    pub fn calls(&self) -> &StoreCalls {
        &self.calls
    }

    /// Inspect a row without recording an access
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<PersistedRow> {
        self.rows.get(key).map(|r| r.clone())
    }

    /// Number of rows (expired included)
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Snapshot of all rows keyed by primary key
    #[must_use]
    pub fn rows(&self) -> HashMap<String, PersistedRow> {
        self.rows
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Acquire) {
            Err(injected_fault())
        } else {
            Ok(())
        }
    }
}

pub(crate) fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl PersistentStore for MemoryPersistentStore {
    async fn get(&self, key: &str) -> Result<Option<PersistedRow>, StoreError> {
        self.calls.reads.fetch_add(1, Ordering::Relaxed);
        self.check()?;

        let now = Utc::now();
        Ok(self.rows.get_mut(key).and_then(|mut row| {
            if row.expires_at <= now {
                return None;
            }
            row.access_count += 1;
            row.last_accessed = now;
            Some(row.clone())
        }))
    }

    async fn upsert(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.calls.writes.fetch_add(1, Ordering::Relaxed);
        self.check()?;

        let now = Utc::now();
        let expires_at = expiry_from(now, ttl);
        self.rows
            .entry(key.to_string())
            .and_modify(|row| {
                row.value = value.to_vec();
                row.expires_at = expires_at;
                row.access_count += 1;
                row.last_accessed = now;
            })
            .or_insert_with(|| PersistedRow {
                key: key.to_string(),
                value: value.to_vec(),
                created_at: now,
                expires_at,
                access_count: 1,
                last_accessed: now,
            });
        Ok(())
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, StoreError> {
        self.calls.deletes.fetch_add(1, Ordering::Relaxed);
        self.check()?;
        let re = pattern
            .to_regex()
            .map_err(|e| StoreError::Command(e.to_string()))?;
        let before = self.rows.len();
        self.rows.retain(|key, _| !re.is_match(key));
        Ok(before.saturating_sub(self.rows.len()) as u64)
    }

    async fn delete_expired(&self) -> Result<u64, StoreError> {
        self.calls.deletes.fetch_add(1, Ordering::Relaxed);
        self.check()?;
        let now = Utc::now();
        let before = self.rows.len();
        self.rows.retain(|_, row| row.expires_at > now);
        Ok(before.saturating_sub(self.rows.len()) as u64)
    }
}
