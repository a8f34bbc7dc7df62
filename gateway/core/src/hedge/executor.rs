//! Hedged Executor
//!
//! Per logical request:
//!
//! ```text
//! IDLE ─► plan (breaker filter, rank) ─► LAUNCH p0 ─► [delay d1] ─► LAUNCH p1 ─► ... ─► RACE
//!                                                                                      │
//!                                              first Ok ─► WINNER (cancel the rest) ◄──┤
//!                                      every launch failed ─► ALL_FAILED ◄─────────────┘
//! ```
//!
//! Identical requests are deduplicated through a single-flight group keyed
//! by a digest of `(key, request)`, so two bursts for the same request never
//! double-launch. Provider statistics are updated once per launch that
//! completes; launches cancelled because another provider won are not
//! recorded at all.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use super::breaker::BreakerRegistry;
use super::provider::{LaunchSample, ProviderSpec, ProviderTable};
use super::HedgeConfig;
use crate::cache::key::request_digest;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::{ratio, Counter, LatencyHistogram, MetricsSnapshot};
use crate::singleflight::{SingleFlight, SingleFlightConfig};

// ============================================================================
// Origin
// ============================================================================

/// The caller-supplied call into a provider
///
/// Transport, sessions and authentication live behind this trait; the
/// executor only decides which providers to call and when.
#[async_trait]
pub trait Origin<Req, Resp>: Send + Sync {
    /// Call `provider` with `request`
    async fn call(&self, provider: &str, request: &Req) -> GatewayResult<Resp>;
}

/// [`Origin`] backed by a closure taking the provider id and an owned request
pub struct FnOrigin<F>(F);

/// Wrap a closure as an [`Origin`]
pub fn origin_fn<F>(f: F) -> FnOrigin<F> {
    FnOrigin(f)
}

#[async_trait]
impl<Req, Resp, F, Fut> Origin<Req, Resp> for FnOrigin<F>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Send + 'static,
    F: Fn(String, Req) -> Fut + Send + Sync,
    Fut: Future<Output = GatewayResult<Resp>> + Send + 'static,
{
    async fn call(&self, provider: &str, request: &Req) -> GatewayResult<Resp> {
        (self.0)(provider.to_string(), request.clone()).await
    }
}

// ============================================================================
// Outcome and Metrics
// ============================================================================

/// Result of a hedged execution
#[derive(Clone, Debug)]
pub struct HedgeOutcome<Resp> {
    /// The winning provider's response
    pub value: Resp,
    /// Winning provider id
    pub provider: String,
    /// Position of the winner in launch order (0 = first launch)
    pub launch_index: usize,
    /// Winner's own latency, from its launch to its result
    pub latency: Duration,
    /// Time from the first launch to the result
    pub elapsed: Duration,
    /// How many providers were launched
    pub launched: usize,
    /// Whether a hedge (a later launch) beat the first provider
    pub hedge_won: bool,
}

/// Hedged executor counters
#[derive(Debug)]
pub struct HedgeMetrics {
    /// Hedged operations started (after deduplication)
    pub requests: Counter,
    /// Races won by a later launch
    pub wins: Counter,
    /// Races with hedges in flight that the first launch still won
    pub losses: Counter,
    /// Operations that ended in `AllProvidersFailed`
    pub failures: Counter,
    /// Operations rejected by the concurrency ceiling
    pub rejected: Counter,
    /// Provider launches
    pub launches: Counter,
    /// Launches cancelled because another provider won
    pub cancelled: Counter,
    /// Estimated latency saved by hedge wins, in microseconds
    pub latency_saved_us: Counter,
    /// Time from first launch to result
    pub latency: LatencyHistogram,
}

impl Default for HedgeMetrics {
    fn default() -> Self {
        Self {
            requests: Counter::new(),
            wins: Counter::new(),
            losses: Counter::new(),
            failures: Counter::new(),
            rejected: Counter::new(),
            launches: Counter::new(),
            cancelled: Counter::new(),
            latency_saved_us: Counter::new(),
            latency: LatencyHistogram::latency_default(),
        }
    }
}

/// A provider selected for launch, with the statistics it was ranked on
#[derive(Clone, Debug)]
struct Candidate {
    id: String,
    cost: f64,
    latency_ms: Option<f64>,
    score: f64,
}

// ============================================================================
// Executor
// ============================================================================

/// Races requests across ranked providers
pub struct HedgedExecutor<Resp> {
    config: HedgeConfig,
    flights: SingleFlight<HedgeOutcome<Resp>>,
    providers: ProviderTable,
    breakers: Arc<BreakerRegistry>,
    permits: Semaphore,
    metrics: HedgeMetrics,
}

impl<Resp> std::fmt::Debug for HedgedExecutor<Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HedgedExecutor")
            .field("config", &self.config)
            .field("flights", &self.flights)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl<Resp> HedgedExecutor<Resp>
where
    Resp: Clone + Send + Sync + 'static,
{
    /// Create an executor whose deduplication group uses `flights`
    #[must_use]
    pub fn new(config: HedgeConfig, flights: SingleFlightConfig) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        Self {
            permits: Semaphore::new(config.max_concurrent),
            config,
            flights: SingleFlight::new(flights),
            providers: ProviderTable::new(),
            breakers,
            metrics: HedgeMetrics::default(),
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &HedgeConfig {
        &self.config
    }

    /// Per-provider statistics
    #[must_use]
    pub fn providers(&self) -> &ProviderTable {
        &self.providers
    }

    /// Per-provider circuit breakers
    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// The deduplication group (for its stuck sweep and metrics)
    #[must_use]
    pub fn flights(&self) -> &SingleFlight<HedgeOutcome<Resp>> {
        &self.flights
    }

    /// Counters
    #[must_use]
    pub fn metrics(&self) -> &HedgeMetrics {
        &self.metrics
    }

    /// Hedged execution filtered by this executor's own circuit breakers
    ///
    /// # Errors
    ///
    /// See [`execute_hedged`](Self::execute_hedged).
    pub async fn execute<Req, O>(
        &self,
        origin: &O,
        request: &Req,
        providers: &[ProviderSpec],
        key: &str,
    ) -> GatewayResult<HedgeOutcome<Resp>>
    where
        Req: Serialize + Sync,
        O: Origin<Req, Resp> + ?Sized,
    {
        let breakers = Arc::clone(&self.breakers);
        let allow = move |provider: &str| breakers.allows(provider);
        self.execute_hedged(origin, request, providers, key, Some(&allow))
            .await
    }

    /// Race `request` across `providers`
    ///
    /// Concurrent calls with the same `key` and an equal `request` share
    /// one race. `allow`, when supplied, removes providers before ranking.
    ///
    /// # Errors
    ///
    /// - `NoProvidersAvailable` if no provider survives the filter
    /// - `CapacityExceeded` if the concurrency ceiling is reached
    /// - `AllProvidersFailed` if every launch failed or the aggregate
    ///   timeout elapsed
    /// - single-flight errors for deduplicated callers
    pub async fn execute_hedged<Req, O>(
        &self,
        origin: &O,
        request: &Req,
        providers: &[ProviderSpec],
        key: &str,
        allow: Option<&(dyn Fn(&str) -> bool + Sync)>,
    ) -> GatewayResult<HedgeOutcome<Resp>>
    where
        Req: Serialize + Sync,
        O: Origin<Req, Resp> + ?Sized,
    {
        let digest = request_digest(key, request)?;
        self.flights
            .run(&digest, || async {
                let plan = self.plan(providers, allow);
                self.race(origin, request, plan).await
            })
            .await
    }

    /// Filter and rank providers, best first, capped at `max_hedges`
    fn plan(
        &self,
        providers: &[ProviderSpec],
        allow: Option<&(dyn Fn(&str) -> bool + Sync)>,
    ) -> Vec<Candidate> {
        let mut plan: Vec<Candidate> = providers
            .iter()
            .filter(|spec| allow.map_or(true, |allow| allow(&spec.id)))
            .map(|spec| {
                let stats = self.providers.get(&spec.id);
                let latency_ms = stats.as_ref().and_then(|s| s.latency_ms());
                let success = stats.as_ref().and_then(|s| s.success_rate()).unwrap_or(1.0);
                let weight = self
                    .config
                    .provider_weights
                    .get(&spec.id)
                    .copied()
                    .unwrap_or(spec.weight);
                Candidate {
                    id: spec.id.clone(),
                    cost: spec.cost_per_call,
                    latency_ms,
                    score: weight * success * 1000.0 / (1000.0 + latency_ms.unwrap_or(0.0)),
                }
            })
            .collect();

        // Stable: equal scores keep the caller's order
        plan.sort_by(|a, b| b.score.total_cmp(&a.score));
        plan.truncate(self.config.max_hedges.max(1));
        plan
    }

    async fn race<Req, O>(
        &self,
        origin: &O,
        request: &Req,
        plan: Vec<Candidate>,
    ) -> GatewayResult<HedgeOutcome<Resp>>
    where
        Req: Sync,
        O: Origin<Req, Resp> + ?Sized,
    {
        if plan.is_empty() {
            return Err(GatewayError::NoProvidersAvailable);
        }

        let Ok(_permit) = self.permits.try_acquire() else {
            self.metrics.rejected.inc();
            tracing::warn!(limit = self.config.max_concurrent, "Hedge concurrency ceiling reached");
            return Err(GatewayError::CapacityExceeded {
                resource: "hedge",
                limit: self.config.max_concurrent,
            });
        };
        self.metrics.requests.inc();

        let retry = &self.config.retry;
        let attempt_timeout = self.config.attempt_timeout;
        let launch = |index: usize| {
            let provider = plan[index].id.as_str();
            let launched_at = Instant::now();
            self.metrics.launches.inc();
            tracing::debug!(provider, index, "Launching provider");
            async move {
                let mut calls: u32 = 0;
                let result = retry
                    .run(provider, attempt_timeout, || {
                        calls += 1;
                        origin.call(provider, request)
                    })
                    .await;
                (index, launched_at.elapsed(), result, calls)
            }
        };

        let started = Instant::now();
        let mut in_flight = FuturesUnordered::new();
        in_flight.push(launch(0));
        let mut next = 1;
        // Provider calls made by failed launches, retries included
        let mut failures: u32 = 0;
        let mut last_failure: Option<(usize, GatewayError)> = None;

        let hedge_timer = tokio::time::sleep(self.delay_before(&plan, next));
        tokio::pin!(hedge_timer);
        let bounded = self.config.aggregate_timeout.is_some();
        let aggregate = tokio::time::sleep(self.config.aggregate_timeout.unwrap_or(Duration::MAX));
        tokio::pin!(aggregate);

        loop {
            tokio::select! {
                biased;

                Some((index, latency, result, calls)) = in_flight.next() => {
                    let candidate = &plan[index];
                    self.record(candidate, latency, result.is_ok());

                    match result {
                        Ok(value) => {
                            let cancelled = in_flight.len();
                            self.metrics.cancelled.add(cancelled as u64);
                            return Ok(self.settle(&plan, index, next, value, latency, started.elapsed()));
                        }
                        Err(e) => {
                            failures = failures.saturating_add(calls);
                            tracing::debug!(provider = %candidate.id, error = %e, "Provider launch failed");
                            last_failure = Some((index, e));

                            // Nothing to wait for: hedge immediately
                            if next < plan.len() {
                                in_flight.push(launch(next));
                                next += 1;
                                hedge_timer.as_mut().reset(Instant::now() + self.delay_before(&plan, next));
                            } else if in_flight.is_empty() {
                                return Err(self.exhausted(&plan, last_failure, failures, started));
                            }
                        }
                    }
                }

                () = &mut hedge_timer, if next < plan.len() => {
                    in_flight.push(launch(next));
                    next += 1;
                    hedge_timer.as_mut().reset(Instant::now() + self.delay_before(&plan, next));
                }

                () = &mut aggregate, if bounded => {
                    self.metrics.cancelled.add(in_flight.len() as u64);
                    let timeout = self.config.aggregate_timeout.unwrap_or_default();
                    let provider = last_failure.as_ref().map_or(next - 1, |(i, _)| *i);
                    let last = GatewayError::AttemptTimeout {
                        provider: plan[provider].id.clone(),
                        timeout,
                    };
                    return Err(self.exhausted(&plan, Some((provider, last)), failures, started));
                }

                else => {
                    return Err(self.exhausted(&plan, last_failure, failures, started));
                }
            }
        }
    }

    /// Delay before launching `plan[index]`
    fn delay_before(&self, plan: &[Candidate], index: usize) -> Duration {
        let previous = index
            .checked_sub(1)
            .and_then(|i| plan.get(i))
            .and_then(|c| c.latency_ms);
        self.config.hedge_delay(index, previous)
    }

    fn record(&self, candidate: &Candidate, latency: Duration, success: bool) {
        self.providers.get_or_create(&candidate.id).record(
            LaunchSample {
                latency,
                success,
                cost: candidate.cost,
            },
            self.config.ewma_alpha,
        );
        self.breakers.record(&candidate.id, success);
    }

    fn settle(
        &self,
        plan: &[Candidate],
        index: usize,
        launched: usize,
        value: Resp,
        latency: Duration,
        elapsed: Duration,
    ) -> HedgeOutcome<Resp> {
        let hedge_won = launched > 1 && index > 0;
        if hedge_won {
            self.metrics.wins.inc();
            if let Some(first_ms) = plan[0].latency_ms {
                let saved_us = (first_ms * 1000.0 - latency.as_micros() as f64).max(0.0);
                self.metrics.latency_saved_us.add(saved_us.round() as u64);
            }
        } else if launched > 1 {
            self.metrics.losses.inc();
        }
        self.metrics.latency.record(elapsed);

        tracing::debug!(
            provider = %plan[index].id,
            launch_index = index,
            launched,
            hedge_won,
            latency_ms = latency.as_millis() as u64,
            "Hedged request resolved"
        );

        HedgeOutcome {
            value,
            provider: plan[index].id.clone(),
            launch_index: index,
            latency,
            elapsed,
            launched,
            hedge_won,
        }
    }

    fn exhausted(
        &self,
        plan: &[Candidate],
        last_failure: Option<(usize, GatewayError)>,
        attempts: u32,
        started: Instant,
    ) -> GatewayError {
        self.metrics.failures.inc();
        let (last_provider, last_error) = match last_failure {
            Some((index, e)) => (plan[index].id.clone(), e.to_string()),
            None => (plan[0].id.clone(), "no launch completed".to_string()),
        };
        let elapsed = started.elapsed();
        tracing::warn!(
            last_provider = %last_provider,
            attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            error = %last_error,
            "All providers failed"
        );
        GatewayError::AllProvidersFailed {
            last_provider,
            attempts,
            elapsed,
            last_error,
        }
    }

    /// Flat metrics view, including the provider table and breaker states
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let m = &self.metrics;
        let mut snap = MetricsSnapshot::new();
        let wins = m.wins.get();
        let losses = m.losses.get();
        snap.insert("hedge_requests".into(), m.requests.get() as f64);
        snap.insert("hedge_wins".into(), wins as f64);
        snap.insert("hedge_losses".into(), losses as f64);
        snap.insert("hedge_effectiveness".into(), ratio(wins, wins + losses));
        snap.insert(
            "hedge_latency_saved_ms".into(),
            m.latency_saved_us.get() as f64 / 1000.0,
        );
        snap.insert("hedge_failures".into(), m.failures.get() as f64);
        snap.insert("hedge_rejected".into(), m.rejected.get() as f64);
        snap.insert("hedge_launches".into(), m.launches.get() as f64);
        snap.insert("hedge_cancelled".into(), m.cancelled.get() as f64);
        m.latency.write_into("hedge_latency", &mut snap);
        for (key, value) in self.flights.snapshot() {
            snap.insert(format!("hedge_{key}"), value);
        }
        self.providers.write_into(&mut snap);
        self.breakers.write_into(&mut snap);
        snap
    }
}
