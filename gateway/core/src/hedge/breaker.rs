//! Provider Circuit Breakers
//!
//! Each provider gets a breaker fed by hedge outcomes. An open breaker
//! removes the provider from the launch plan until it has had time to
//! recover.
//!
//! ```text
//! +--------+  failure_threshold   +------+   open_timeout   +-----------+
//! | Closed | -------------------> | Open | ---------------> | Half-Open |
//! +--------+     failures         +------+                  +-----------+
//!     ^                              ^                            |
//!     |   success_threshold          |        1 failure           |
//!     +------------------------------+----------------------------+
//! ```
//!
//! State lives in atomics; a breaker is never locked.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::metrics::MetricsSnapshot;

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,

    /// Rejecting launches
    Open,

    /// Letting a limited number of launches through to probe recovery
    HalfOpen,
}

impl CircuitState {
    fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    fn as_u32(self) -> u32 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

/// Breaker thresholds
#[derive(Clone, Debug, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,

    /// How long the breaker stays open before probing
    pub open_timeout: Duration,

    /// Launches allowed while half-open
    pub half_open_max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

/// Breaker for one provider
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    state: AtomicU32,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    half_open_requests: AtomicU32,
    /// Millis since `epoch` of the last transition
    last_transition_ms: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            state: AtomicU32::new(CircuitState::Closed.as_u32()),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            half_open_requests: AtomicU32::new(0),
            last_transition_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Whether a launch may go ahead
    ///
    /// An open breaker whose timeout has elapsed moves to half-open and
    /// admits up to `half_open_max_requests` launches.
    pub fn allows(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => self.try_half_open() && self.admit_half_open(),
            CircuitState::HalfOpen => self.admit_half_open(),
        }
    }

    fn admit_half_open(&self) -> bool {
        self.half_open_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.config.half_open_max_requests).then_some(n + 1)
            })
            .is_ok()
    }

    fn try_half_open(&self) -> bool {
        let elapsed = self
            .now_ms()
            .saturating_sub(self.last_transition_ms.load(Ordering::Acquire));
        if elapsed < self.config.open_timeout.as_millis() as u64 {
            return false;
        }

        if self
            .state
            .compare_exchange(
                CircuitState::Open.as_u32(),
                CircuitState::HalfOpen.as_u32(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.half_open_requests.store(0, Ordering::Release);
            self.consecutive_successes.store(0, Ordering::Release);
            self.last_transition_ms.store(self.now_ms(), Ordering::Release);
            tracing::info!(provider = %self.provider, "Circuit breaker half-open, probing provider");
        }
        // Another caller may have won the transition; half-open either way
        self.state() == CircuitState::HalfOpen
    }

    /// Record a successful launch
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;

        if self.state() == CircuitState::HalfOpen {
            let _ = self
                .half_open_requests
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            if successes >= self.config.success_threshold {
                self.transition(CircuitState::Closed);
                tracing::info!(provider = %self.provider, "Circuit breaker closed, provider recovered");
            }
        }
    }

    /// Record a failed launch
    pub fn record_failure(&self) {
        self.consecutive_successes.store(0, Ordering::Release);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                self.transition(CircuitState::Open);
                tracing::warn!(
                    provider = %self.provider,
                    consecutive_failures = failures,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                self.transition(CircuitState::Open);
                tracing::warn!(provider = %self.provider, "Probe failed, circuit breaker reopened");
            }
            _ => {}
        }
    }

    /// Force a state (operator override)
    pub fn force_state(&self, state: CircuitState) {
        self.transition(state);
        if state == CircuitState::Closed {
            self.consecutive_failures.store(0, Ordering::Release);
        }
    }

    fn transition(&self, state: CircuitState) {
        self.state.store(state.as_u32(), Ordering::Release);
        self.half_open_requests.store(0, Ordering::Release);
        self.last_transition_ms.store(self.now_ms(), Ordering::Release);
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Breakers for every provider, created on first use
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Create a registry whose breakers use `config`
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `provider`
    pub fn get_or_create(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(provider) {
            return Arc::clone(&breaker);
        }
        Arc::clone(
            &self
                .breakers
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(provider, self.config.clone()))),
        )
    }

    /// Whether `provider` may be launched (unknown providers are allowed)
    pub fn allows(&self, provider: &str) -> bool {
        match self.breakers.get(provider) {
            Some(breaker) => breaker.allows(),
            None => true,
        }
    }

    /// Current state for `provider`
    #[must_use]
    pub fn state(&self, provider: &str) -> CircuitState {
        self.breakers
            .get(provider)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    /// Record a launch outcome
    pub fn record(&self, provider: &str, success: bool) {
        let breaker = self.get_or_create(provider);
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    /// Flatten breaker states into `snap` (0 closed, 1 open, 2 half-open)
    pub fn write_into(&self, snap: &mut MetricsSnapshot) {
        for entry in &self.breakers {
            snap.insert(
                format!("provider_{}_breaker", entry.key()),
                f64::from(entry.state().as_u32()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_secs(10),
            half_open_max_requests: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("p", config());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allows());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allows());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_streak() {
        let breaker = CircuitBreaker::new("p", config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery() {
        let breaker = CircuitBreaker::new("p", config());
        breaker.force_state(CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.allows());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Only one probe at a time
        assert!(!breaker.allows());

        breaker.record_success();
        assert!(breaker.allows());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("p", config());
        breaker.force_state(CircuitState::Open);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.allows());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allows());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry() {
        let registry = BreakerRegistry::new(config());
        assert!(registry.allows("unknown"));

        for _ in 0..3 {
            registry.record("bad", false);
        }
        registry.record("good", true);
        assert!(!registry.allows("bad"));
        assert!(registry.allows("good"));

        let mut snap = MetricsSnapshot::new();
        registry.write_into(&mut snap);
        assert_eq!(snap["provider_bad_breaker"], 1.0);
        assert_eq!(snap["provider_good_breaker"], 0.0);
    }
}
