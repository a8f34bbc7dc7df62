//! Cache Entries
//!
//! [`CacheEntry`] is what a lookup returns: the value bytes together with
//! where they were found and how long they remain valid.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::Instant;

use super::Tier;
use crate::error::GatewayResult;

/// A value found in one of the cache tiers
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// Serialized value
    pub value: Arc<Vec<u8>>,

    /// Tier that produced the hit
    pub tier: Tier,

    /// When the entry expires in the tier that produced it (if known)
    pub expires_at: Option<Instant>,

    /// Accesses recorded by the producing tier
    pub access_count: u64,

    /// Times this value has been promoted into a faster tier
    pub promotion_count: u32,
}

impl CacheEntry {
    /// Create an entry found in `tier`
    #[must_use]
    pub fn new(value: Arc<Vec<u8>>, tier: Tier, ttl: Option<Duration>) -> Self {
        Self {
            value,
            tier,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
            access_count: 0,
            promotion_count: 0,
        }
    }

    /// Size of the serialized value in bytes
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.value.len()
    }

    /// Remaining time to live (None if the tier reported no expiry)
    #[must_use]
    pub fn ttl_remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether the remaining TTL has dropped below `grace`
    #[must_use]
    pub fn is_near_expiry(&self, grace: Duration) -> bool {
        self.ttl_remaining().is_some_and(|left| left < grace)
    }

    /// Deserialize the value
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Serialization` if the bytes are not valid JSON
    /// for `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> GatewayResult<T> {
        Ok(serde_json::from_slice(&self.value)?)
    }
}
