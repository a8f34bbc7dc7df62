//! Error Types
//!
//! `GatewayError` is the terminal error surface of the execution core.
//! Tier faults never reach callers: backing stores return [`StoreError`],
//! which the tiered cache logs, counts and absorbs.
//!
//! `GatewayError` is `Clone` because a single-flight outcome is delivered
//! verbatim to every waiter on the same key.

use std::time::Duration;

use thiserror::Error;

use crate::cache::Tier;

/// Result alias for the execution core
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors surfaced by the execution core
#[derive(Clone, Debug, Error)]
pub enum GatewayError {
    /// A single cache tier's I/O failed
    #[error("Cache tier {tier} unavailable: {reason}")]
    TierUnavailable {
        /// The tier that failed
        tier: Tier,
        /// Underlying failure
        reason: String,
    },

    /// Every hedge launch failed, or the aggregate timeout elapsed
    #[error(
        "All providers failed after {attempts} attempt(s) in {elapsed:?} (last: {last_provider}): {last_error}"
    )]
    AllProvidersFailed {
        /// Last provider that reported an outcome
        last_provider: String,
        /// Provider calls made by failed launches, retries included
        attempts: u32,
        /// Time from first launch to giving up
        elapsed: Duration,
        /// Last observed failure
        last_error: String,
    },

    /// No provider survived the circuit-breaker filter
    #[error("No providers available")]
    NoProvidersAvailable,

    /// A waiter gave up before the owner assigned a result
    #[error("Timed out after {waited:?} waiting for in-flight request {key}")]
    FlightTimeout {
        /// Flight key
        key: String,
        /// How long the waiter waited
        waited: Duration,
    },

    /// A concurrency ceiling was hit
    #[error("Capacity exceeded for {resource} (limit {limit})")]
    CapacityExceeded {
        /// Which ceiling was hit
        resource: &'static str,
        /// Configured limit
        limit: usize,
    },

    /// The stuck-flight sweep force-failed an owner
    #[error("Flight {key} exceeded stuck threshold after running {running_for:?}")]
    StuckFlight {
        /// Flight key
        key: String,
        /// How long the owner had been running
        running_for: Duration,
    },

    /// The owning call was dropped before it produced a result
    #[error("Owner of flight {key} was cancelled")]
    FlightAbandoned {
        /// Flight key
        key: String,
    },

    /// A provider call failed
    #[error("Provider {provider} failed: {message}")]
    Provider {
        /// Provider identifier
        provider: String,
        /// Failure description
        message: String,
        /// Whether a retry may succeed
        transient: bool,
    },

    /// A single provider attempt exceeded the per-attempt timeout
    #[error("Provider {provider} timed out after {timeout:?}")]
    AttemptTimeout {
        /// Provider identifier
        provider: String,
        /// Configured per-attempt timeout
        timeout: Duration,
    },

    /// Value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An invalidation pattern could not be compiled
    #[error("Invalid key pattern: {0}")]
    InvalidPattern(String),
}

impl GatewayError {
    /// Create a transient provider error (eligible for retry)
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Create a permanent provider error (not retried)
    pub fn permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Whether the retry wrapper should try again
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider { transient, .. } => *transient,
            Self::AttemptTimeout { .. } | Self::TierUnavailable { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors reported by backing stores
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not reach the store
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store rejected or failed a command
    #[error("Command error: {0}")]
    Command(String),

    /// Stored bytes could not be decoded
    #[error("Codec error: {0}")]
    Codec(String),
}

impl StoreError {
    /// Convert into the tier-level error the cache logs and counts
    #[must_use]
    pub fn into_tier(self, tier: Tier) -> GatewayError {
        GatewayError::TierUnavailable {
            tier,
            reason: self.to_string(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::transient("a", "503").is_transient());
        assert!(!GatewayError::permanent("a", "400").is_transient());
        assert!(GatewayError::AttemptTimeout {
            provider: "a".into(),
            timeout: Duration::from_secs(1),
        }
        .is_transient());
        assert!(!GatewayError::NoProvidersAvailable.is_transient());
    }

    #[test]
    fn test_all_providers_failed_display_carries_context() {
        let err = GatewayError::AllProvidersFailed {
            last_provider: "openai".into(),
            attempts: 3,
            elapsed: Duration::from_millis(1500),
            last_error: "connection reset".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("openai"));
        assert!(msg.contains("3 attempt"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_store_error_into_tier() {
        let err = StoreError::Connection("refused".into()).into_tier(Tier::L2);
        assert!(matches!(err, GatewayError::TierUnavailable { tier: Tier::L2, .. }));
    }
}
