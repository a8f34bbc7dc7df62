//! Hedged Provider Execution
//!
//! Races a request across several providers to cut tail latency. The first
//! provider launches immediately; each later provider launches after a
//! hedge delay unless a result has already arrived. The first success wins
//! and every other in-flight launch is cancelled.
//!
//! ```text
//!  t=0          launch P0 ──────────────────────────────► (slow)
//!  t=d1         launch P1 ──────────► success ──► WINNER  (P0, P2 cancelled)
//!  t=d1+d2      launch P2 ─────────────────────────► (cancelled)
//! ```
//!
//! # Modules
//!
//! - [`provider`]: provider specs and EWMA statistics
//! - [`breaker`]: per-provider circuit breakers
//! - [`retry`]: bounded retry around a single launch
//! - [`executor`]: the hedged executor

use std::collections::BTreeMap;
use std::time::Duration;

pub mod breaker;
pub mod executor;
pub mod provider;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState};
pub use executor::{origin_fn, FnOrigin, HedgeMetrics, HedgeOutcome, HedgedExecutor, Origin};
pub use provider::{LaunchSample, ProviderMetrics, ProviderSpec, ProviderStats, ProviderTable};
pub use retry::RetryPolicy;

/// Configuration for the hedged executor
#[derive(Clone, Debug, PartialEq)]
pub struct HedgeConfig {
    /// Delay before the first hedge launch
    pub initial_delay: Duration,

    /// Maximum providers launched per request (including the first)
    pub max_hedges: usize,

    /// Timeout for each attempt against one provider
    pub attempt_timeout: Duration,

    /// Growth of the fixed delay between successive hedges
    pub backoff_multiplier: f64,

    /// Derive delays from the previous provider's observed latency
    pub adaptive_delays: bool,

    /// Fraction of the previous provider's EWMA latency to wait before
    /// hedging when adaptive delays are enabled
    pub adaptive_threshold: f64,

    /// EWMA smoothing factor in `(0, 1]`
    pub ewma_alpha: f64,

    /// Bound on the whole hedged operation (None = unbounded)
    pub aggregate_timeout: Option<Duration>,

    /// Maximum concurrent hedged operations
    pub max_concurrent: usize,

    /// Static weights by provider id, overriding [`ProviderSpec::weight`]
    pub provider_weights: BTreeMap<String, f64>,

    /// Retry wrapper applied to each launch
    pub retry: RetryPolicy,

    /// Circuit breaker thresholds
    pub breaker: BreakerConfig,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_hedges: 3,
            attempt_timeout: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            adaptive_delays: true,
            adaptive_threshold: 0.8,
            ewma_alpha: 0.3,
            aggregate_timeout: None,
            max_concurrent: 1000,
            provider_weights: BTreeMap::new(),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl HedgeConfig {
    /// Fixed delay before launch `index` (1 = first hedge)
    #[must_use]
    pub fn fixed_delay(&self, index: usize) -> Duration {
        let exponent = index.saturating_sub(1).min(32) as i32;
        self.initial_delay
            .mul_f64(self.backoff_multiplier.max(1.0).powi(exponent))
    }

    /// Delay before launch `index` given the previous provider's EWMA latency
    ///
    /// Adaptive delays are a fraction of that latency, capped at twice the
    /// fixed delay; without a latency sample the fixed delay applies.
    #[must_use]
    pub fn hedge_delay(&self, index: usize, previous_latency_ms: Option<f64>) -> Duration {
        let fixed = self.fixed_delay(index);
        match previous_latency_ms {
            Some(ms) if self.adaptive_delays && ms.is_finite() => {
                let adaptive = Duration::from_secs_f64((ms * self.adaptive_threshold).max(0.0) / 1000.0);
                adaptive.min(fixed * 2)
            }
            _ => fixed,
        }
    }
}
