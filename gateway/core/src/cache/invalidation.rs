//! Cache Coherency Events
//!
//! Every `set` and `invalidate` publishes an [`InvalidationEvent`] so peer
//! instances can drop stale L1 copies. The wire format is JSON:
//!
//! ```json
//! {"pattern": "user:*", "operation": "invalidate", "timestamp": 1718000000.25}
//! ```
//!
//! Unknown fields are ignored on receipt. Events may carry an `origin`
//! (publishing instance id); listeners skip their own events so a local
//! `set` does not evict the value it just wrote.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::key::KeyPattern;
use super::local::LocalTier;
use super::stats::CacheMetrics;
use super::store::InvalidationBus;
use crate::error::GatewayResult;

/// What triggered an event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationOp {
    /// A key was written
    Set,
    /// A pattern was invalidated
    Invalidate,
}

/// A coherency event on the invalidation channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Glob over logical keys
    pub pattern: String,

    /// What triggered the event
    pub operation: InvalidationOp,

    /// Seconds since the Unix epoch
    pub timestamp: f64,

    /// Publishing instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl InvalidationEvent {
    /// Create an event stamped with the current time
    pub fn new(pattern: impl Into<String>, operation: InvalidationOp) -> Self {
        Self {
            pattern: pattern.into(),
            operation,
            timestamp: chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            origin: None,
        }
    }

    /// Tag the event with its publishing instance
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Encode for the wire
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Serialization` if encoding fails.
    pub fn to_json(&self) -> GatewayResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the wire
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Serialization` for malformed payloads.
    pub fn from_json(payload: &str) -> GatewayResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Whether this event was published by `instance_id`
    #[must_use]
    pub fn is_from(&self, instance_id: &str) -> bool {
        self.origin.as_deref() == Some(instance_id)
    }
}

/// Subscribes to the invalidation channel and applies peer events to L1
pub(crate) struct InvalidationListener {
    pub(crate) bus: Arc<dyn InvalidationBus>,
    pub(crate) channel: String,
    pub(crate) instance_id: String,
    pub(crate) l1: Arc<LocalTier>,
    pub(crate) metrics: Arc<CacheMetrics>,
}

impl InvalidationListener {
    /// Run forever, resubscribing with exponential backoff when the stream ends
    pub(crate) async fn run(self) {
        let mut backoff = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(60);

        loop {
            match self.bus.subscribe(&self.channel).await {
                Ok(mut stream) => {
                    tracing::info!(channel = %self.channel, "Subscribed to invalidation channel");
                    backoff = Duration::from_secs(1);
                    while let Some(payload) = stream.next().await {
                        self.apply(&payload);
                    }
                    tracing::warn!(channel = %self.channel, "Invalidation stream closed, resubscribing");
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Invalidation subscribe failed, retrying"
                    );
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Apply one payload; returns how many L1 entries were dropped
    pub(crate) fn apply(&self, payload: &str) -> usize {
        let event = match InvalidationEvent::from_json(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed invalidation event");
                return 0;
            }
        };

        if event.is_from(&self.instance_id) {
            return 0;
        }

        let regex = match KeyPattern::new(&event.pattern).to_regex() {
            Ok(re) => re,
            Err(e) => {
                tracing::warn!(pattern = %event.pattern, error = %e, "Ignoring invalidation with bad pattern");
                return 0;
            }
        };

        let removed = self.l1.remove_matching(&regex);
        self.metrics.remote_invalidations.inc();
        tracing::debug!(
            pattern = %event.pattern,
            operation = ?event.operation,
            removed,
            "Applied peer invalidation"
        );
        removed
    }
}
