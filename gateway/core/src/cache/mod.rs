//! Tiered Cache
//!
//! Four ordered storage tiers of increasing latency and capacity, probed in
//! order on every lookup:
//!
//! ```text
//!   get(key)
//!      │
//!      ▼
//! ┌─────────┐ hit  ┌──────────────────────────────────────────────┐
//! │ L1 local├─────►│ return                                       │
//! └────┬────┘      └──────────────────────────────────────────────┘
//!      ▼ miss
//! ┌─────────┐ hit  ┌──────────────────────────────────────────────┐
//! │ L2 hot  ├─────►│ backfill L1; near expiry → background refresh│
//! └────┬────┘      └──────────────────────────────────────────────┘
//!      ▼ miss
//! ┌─────────┐ hit  ┌──────────────────────────────────────────────┐
//! │ L3 warm ├─────►│ decompress; promote → L2 + L1                │
//! └────┬────┘      └──────────────────────────────────────────────┘
//!      ▼ miss
//! ┌─────────┐ hit  ┌──────────────────────────────────────────────┐
//! │ L4 rows ├─────►│ promote → L3 (packed) + L2 + L1              │
//! └────┬────┘      └──────────────────────────────────────────────┘
//!      ▼
//!    miss
//! ```
//!
//! # Design Principles
//!
//! 1. **Graceful degradation**: a failing tier is logged, counted and
//!    skipped. Lookups never fail because one tier is down.
//! 2. **Bounded read path**: promotion and write-behind run on the
//!    background task registry; a lookup costs only the tiers it probed.
//! 3. **Local consistency**: `set` writes L1 before returning, so the next
//!    read in this process observes the value.
//! 4. **Coherency**: writes and invalidations are broadcast so peer
//!    instances drop their stale L1 copies.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod compression;
pub mod entry;
pub mod invalidation;
pub mod key;
pub mod local;
#[cfg(feature = "postgres")]
pub mod postgres_store;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod stats;
pub mod store;
pub mod tiered;

pub use compression::{Compressor, Packed};
pub use entry::CacheEntry;
pub use invalidation::{InvalidationEvent, InvalidationOp};
pub use key::{CacheKey, KeyPattern};
pub use local::LocalTier;
pub use stats::CacheMetrics;
pub use store::{
    InvalidationBus, KvStore, KvValue, MemoryBus, MemoryKvStore, MemoryPersistentStore,
    PersistedRow, PersistentStore,
};
pub use tiered::{CacheBackends, InvalidationReport, RefreshFn, TieredCache, TtlOverrides};

#[cfg(feature = "postgres")]
pub use postgres_store::PostgresStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

// ============================================================================
// Tier
// ============================================================================

/// Cache tier, ordered fastest to slowest
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Process-local memory
    L1,
    /// Hot shared key-value store
    L2,
    /// Warm shared key-value store, compressed
    L3,
    /// Persistent relational store (system of record)
    L4,
}

impl Tier {
    /// All tiers in probe order
    pub const ALL: [Tier; 4] = [Tier::L1, Tier::L2, Tier::L3, Tier::L4];

    /// Position in probe order
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::L1 => 0,
            Self::L2 => 1,
            Self::L3 => 2,
            Self::L4 => 3,
        }
    }

    /// Lowercase label used in storage keys and metric names
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::L3 => "l3",
            Self::L4 => "l4",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L1 => write!(f, "L1"),
            Self::L2 => write!(f, "L2"),
            Self::L3 => write!(f, "L3"),
            Self::L4 => write!(f, "L4"),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the tiered cache
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    /// Prefix for every shared-tier storage key
    pub namespace: String,

    /// Maximum entries held in L1
    pub l1_capacity: usize,

    /// Default L1 time-to-live
    pub l1_ttl: Duration,

    /// Default L2 time-to-live
    pub l2_ttl: Duration,

    /// Default L3 time-to-live
    pub l3_ttl: Duration,

    /// Default L4 time-to-live
    pub l4_ttl: Duration,

    /// Whether L3 payloads may be compressed
    pub compression_enabled: bool,

    /// Payloads larger than this (bytes) are compressed in L3
    pub compression_threshold: usize,

    /// gzip level (0-9)
    pub compression_level: u32,

    /// Whether writes and invalidations are broadcast to peers
    pub pubsub_enabled: bool,

    /// Channel carrying invalidation events
    pub invalidation_channel: String,

    /// Whether near-expiry L2 hits trigger a background refresh
    pub swr_enabled: bool,

    /// Remaining L2 TTL below which a hit counts as near expiry
    pub swr_grace: Duration,

    /// Skip grace-window hits while a refresh for the same key is running
    ///
    /// Off by default: every grace-window hit schedules its own refresh.
    pub swr_dedup: bool,

    /// How often expired L4 rows are deleted
    pub l4_sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "gw".to_string(),
            l1_capacity: 10_000,
            l1_ttl: Duration::from_secs(60),
            l2_ttl: Duration::from_secs(300),   // 5 minutes
            l3_ttl: Duration::from_secs(3600),  // 1 hour
            l4_ttl: Duration::from_secs(86400), // 1 day
            compression_enabled: true,
            compression_threshold: 1024,
            compression_level: 6,
            pubsub_enabled: true,
            invalidation_channel: "gateway:cache:invalidate".to_string(),
            swr_enabled: true,
            swr_grace: Duration::from_secs(30),
            swr_dedup: false,
            l4_sweep_interval: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    /// Default TTL for a tier
    #[must_use]
    pub fn ttl_for(&self, tier: Tier) -> Duration {
        match tier {
            Tier::L1 => self.l1_ttl,
            Tier::L2 => self.l2_ttl,
            Tier::L3 => self.l3_ttl,
            Tier::L4 => self.l4_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::L1 < Tier::L2);
        assert!(Tier::L3 < Tier::L4);
        assert_eq!(Tier::ALL.iter().map(|t| t.index()).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(Tier::L3.to_string(), "L3");
        assert_eq!(Tier::L3.label(), "l3");
    }

    #[test]
    fn test_ttl_for() {
        let config = CacheConfig::default();
        assert_eq!(config.ttl_for(Tier::L1), Duration::from_secs(60));
        assert_eq!(config.ttl_for(Tier::L4), Duration::from_secs(86400));
    }
}
