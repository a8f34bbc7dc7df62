//! Single-Flight Request Deduplication
//!
//! Collapses concurrent calls for the same key into one execution. The
//! first caller for a key becomes the **owner** and runs the work; callers
//! that arrive while it runs become **waiters** and receive the owner's
//! outcome (success or error, cloned verbatim).
//!
//! ```text
//!  caller A ──► registry miss ──► owner: run fn ──► assign slot ──► remove ──► return
//!  caller B ──► registry hit  ──► waiter ─────────► wait on slot ───────────► return
//!  caller C ──► registry hit  ──► waiter ──► timeout ──► FlightTimeout (owner unaffected)
//! ```
//!
//! # Guarantees
//!
//! - At most one flight per key exists at any instant
//! - The result slot is assigned once; every observer sees the same outcome
//! - The flight is removed from the registry before the owner returns
//! - The registry lock is held only to register or remove, never while
//!   the work runs
//!
//! Owners that run past the stuck threshold are force-failed by
//! [`SingleFlight::sweep_stuck`]; owners that are dropped mid-flight release
//! their waiters with `FlightAbandoned`.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::error::{GatewayError, GatewayResult};
use crate::metrics::{Counter, LatencyHistogram, MetricsSnapshot};
use crate::tasks::{spawn_sweep, ServiceHandle};

/// Configuration for a single-flight group
#[derive(Clone, Debug, PartialEq)]
pub struct SingleFlightConfig {
    /// How long a waiter waits for the owner's result
    pub default_timeout: Duration,

    /// Maximum simultaneously active keys
    pub max_flights: usize,

    /// Owners running longer than this are force-failed by the sweep
    pub stuck_threshold: Duration,

    /// How often the stuck sweep runs
    pub sweep_interval: Duration,
}

impl Default for SingleFlightConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_flights: 10_000,
            stuck_threshold: Duration::from_secs(300), // 5 minutes
            sweep_interval: Duration::from_secs(30),
        }
    }
}

type Slot<T> = Option<GatewayResult<T>>;

/// One in-progress call
struct Flight<T> {
    key: String,
    slot: watch::Sender<Slot<T>>,
    started_at: Instant,
    waiters: AtomicUsize,
    /// Signalled by the stuck sweep to stop the owner's work
    cancel: Notify,
}

impl<T: Clone> Flight<T> {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            slot: watch::Sender::new(None),
            started_at: Instant::now(),
            waiters: AtomicUsize::new(0),
            cancel: Notify::new(),
        }
    }

    /// Assign the outcome if the slot is still empty; returns whether it was
    fn assign(&self, outcome: GatewayResult<T>) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    fn outcome(&self) -> Option<GatewayResult<T>> {
        self.slot.borrow().clone()
    }
}

/// Single-flight counters
#[derive(Debug)]
pub struct FlightMetrics {
    /// Calls to `run`
    pub total: Counter,
    /// Calls that joined an existing flight
    pub deduplicated: Counter,
    /// Flights whose owner produced `Ok`
    pub completed: Counter,
    /// Flights that ended in an error (including stuck and abandoned)
    pub failed: Counter,
    /// Waiters that gave up before the owner finished
    pub timeouts: Counter,
    /// Flights force-failed by the sweep
    pub stuck: Counter,
    /// Calls rejected by the capacity ceiling
    pub rejected: Counter,
    /// How long waiters waited
    pub wait_latency: LatencyHistogram,
}

impl Default for FlightMetrics {
    fn default() -> Self {
        Self {
            total: Counter::new(),
            deduplicated: Counter::new(),
            completed: Counter::new(),
            failed: Counter::new(),
            timeouts: Counter::new(),
            stuck: Counter::new(),
            rejected: Counter::new(),
            wait_latency: LatencyHistogram::latency_default(),
        }
    }
}

struct Inner<T> {
    config: SingleFlightConfig,
    flights: DashMap<String, Arc<Flight<T>>>,
    active: AtomicUsize,
    metrics: FlightMetrics,
}

impl<T> Inner<T> {
    /// Remove `flight` if it is still the registered flight for its key
    fn remove(&self, flight: &Arc<Flight<T>>) {
        let removed = self
            .flights
            .remove_if(&flight.key, |_, current| Arc::ptr_eq(current, flight));
        if removed.is_some() {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Releases the flight however the owner exits
///
/// On the normal path the slot is already assigned and this only removes
/// the registry entry. If the owner's future is dropped first, waiters get
/// `FlightAbandoned`.
struct OwnerGuard<T: Clone> {
    inner: Arc<Inner<T>>,
    flight: Arc<Flight<T>>,
}

impl<T: Clone> Drop for OwnerGuard<T> {
    fn drop(&mut self) {
        let abandoned = self.flight.assign(Err(GatewayError::FlightAbandoned {
            key: self.flight.key.clone(),
        }));
        if abandoned {
            self.inner.metrics.failed.inc();
            tracing::debug!(key = %self.flight.key, "Flight owner dropped before completing");
        }
        self.inner.remove(&self.flight);
    }
}

enum Role<T> {
    Owner(Arc<Flight<T>>),
    Waiter(Arc<Flight<T>>),
}

/// Deduplicating call group
///
/// Cloning is cheap and shares the registry.
pub struct SingleFlight<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("active", &self.inner.active.load(Ordering::Acquire))
            .field("max_flights", &self.inner.config.max_flights)
            .finish()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a group
    #[must_use]
    pub fn new(config: SingleFlightConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                flights: DashMap::new(),
                active: AtomicUsize::new(0),
                metrics: FlightMetrics::default(),
            }),
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &SingleFlightConfig {
        &self.inner.config
    }

    /// Counters
    #[must_use]
    pub fn metrics(&self) -> &FlightMetrics {
        &self.inner.metrics
    }

    /// Number of keys currently in flight
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Waiters currently attached to `key`
    #[must_use]
    pub fn waiters(&self, key: &str) -> usize {
        self.inner
            .flights
            .get(key)
            .map_or(0, |f| f.waiters.load(Ordering::Acquire))
    }

    /// Run `work` for `key` unless a call for `key` is already in flight,
    /// waiting at most the configured default timeout for its result
    ///
    /// # Errors
    ///
    /// Returns the work's error (shared with every waiter), or
    /// `CapacityExceeded`, `FlightTimeout`, `StuckFlight` or
    /// `FlightAbandoned`.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.run_with_timeout(key, self.inner.config.default_timeout, work)
            .await
    }

    /// As [`run`](Self::run) with an explicit waiter timeout
    ///
    /// The timeout bounds how long a waiter waits. The owner is bounded only
    /// by the stuck threshold.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn run_with_timeout<F, Fut>(
        &self,
        key: &str,
        timeout: Duration,
        work: F,
    ) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.inner.metrics.total.inc();
        match self.join(key)? {
            Role::Owner(flight) => self.own(flight, work).await,
            Role::Waiter(flight) => self.wait(flight, timeout).await,
        }
    }

    fn join(&self, key: &str) -> GatewayResult<Role<T>> {
        let inner = &self.inner;
        match inner.flights.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                let flight = Arc::clone(entry.get());
                flight.waiters.fetch_add(1, Ordering::AcqRel);
                inner.metrics.deduplicated.inc();
                Ok(Role::Waiter(flight))
            }
            Entry::Vacant(entry) => {
                let limit = inner.config.max_flights;
                if inner.active.fetch_add(1, Ordering::AcqRel) >= limit {
                    inner.active.fetch_sub(1, Ordering::AcqRel);
                    inner.metrics.rejected.inc();
                    tracing::warn!(key, limit, "Single-flight capacity exceeded");
                    return Err(GatewayError::CapacityExceeded {
                        resource: "single_flight",
                        limit,
                    });
                }
                let flight = Arc::new(Flight::new(key));
                entry.insert(Arc::clone(&flight));
                Ok(Role::Owner(flight))
            }
        }
    }

    async fn own<F, Fut>(&self, flight: Arc<Flight<T>>, work: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let guard = OwnerGuard {
            inner: Arc::clone(&self.inner),
            flight: Arc::clone(&flight),
        };

        let result = tokio::select! {
            biased;
            () = flight.cancel.notified() => Err(GatewayError::StuckFlight {
                key: flight.key.clone(),
                running_for: flight.started_at.elapsed(),
            }),
            result = work() => result,
        };

        flight.assign(result.clone());
        // First assignment wins: the sweep may have failed the flight already
        let outcome = flight.outcome().unwrap_or(result);
        match &outcome {
            Ok(_) => self.inner.metrics.completed.inc(),
            Err(_) => self.inner.metrics.failed.inc(),
        }
        drop(guard);
        outcome
    }

    async fn wait(&self, flight: Arc<Flight<T>>, timeout: Duration) -> GatewayResult<T> {
        let started = Instant::now();
        let mut rx = flight.slot.subscribe();

        let outcome = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(slot)) => slot.clone().unwrap_or_else(|| {
                Err(GatewayError::FlightAbandoned {
                    key: flight.key.clone(),
                })
            }),
            Ok(Err(_)) => Err(GatewayError::FlightAbandoned {
                key: flight.key.clone(),
            }),
            Err(_) => {
                self.inner.metrics.timeouts.inc();
                tracing::debug!(key = %flight.key, timeout_ms = timeout.as_millis() as u64, "Waiter timed out");
                Err(GatewayError::FlightTimeout {
                    key: flight.key.clone(),
                    waited: started.elapsed(),
                })
            }
        };

        flight.waiters.fetch_sub(1, Ordering::AcqRel);
        self.inner.metrics.wait_latency.record(started.elapsed());
        outcome
    }

    // ========================================================================
    // Stuck Flights
    // ========================================================================

    /// Force-fail every flight whose owner has run past the stuck threshold
    ///
    /// Waiters are released with `StuckFlight`, the owner's work is
    /// cancelled and the key is freed. Returns how many flights were failed.
    pub fn sweep_stuck(&self) -> usize {
        let threshold = self.inner.config.stuck_threshold;
        let stuck: Vec<Arc<Flight<T>>> = self
            .inner
            .flights
            .iter()
            .filter(|entry| entry.started_at.elapsed() > threshold)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut failed = 0;
        for flight in stuck {
            let running_for = flight.started_at.elapsed();
            let assigned = flight.assign(Err(GatewayError::StuckFlight {
                key: flight.key.clone(),
                running_for,
            }));
            flight.cancel.notify_one();
            self.inner.remove(&flight);

            if assigned {
                failed += 1;
                self.inner.metrics.stuck.inc();
                tracing::warn!(
                    key = %flight.key,
                    running_secs = running_for.as_secs(),
                    waiters = flight.waiters.load(Ordering::Acquire),
                    "Force-failed stuck flight"
                );
            }
        }
        failed
    }

    /// Run [`sweep_stuck`](Self::sweep_stuck) every `sweep_interval`
    #[must_use]
    pub fn start_stuck_sweep(&self) -> ServiceHandle {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        spawn_sweep(
            "single_flight.stuck_sweep",
            self.inner.config.sweep_interval,
            move || {
                if let Some(inner) = weak.upgrade() {
                    SingleFlight { inner }.sweep_stuck();
                }
                std::future::ready(())
            },
        )
    }

    /// Flat metrics view
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let m = &self.inner.metrics;
        let mut snap = MetricsSnapshot::new();
        snap.insert("flights_total".into(), m.total.get() as f64);
        snap.insert("flights_deduplicated".into(), m.deduplicated.get() as f64);
        snap.insert("flights_active".into(), self.active() as f64);
        snap.insert("flights_completed".into(), m.completed.get() as f64);
        snap.insert("flights_failed".into(), m.failed.get() as f64);
        snap.insert("flights_timeouts".into(), m.timeouts.get() as f64);
        snap.insert("flights_stuck".into(), m.stuck.get() as f64);
        snap.insert("flights_rejected".into(), m.rejected.get() as f64);
        m.wait_latency.write_into("flight_wait", &mut snap);
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn group(config: SingleFlightConfig) -> SingleFlight<String> {
        SingleFlight::new(config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_run_once() {
        let sf = group(SingleFlightConfig::default());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let sf = sf.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                sf.run("k", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok("done".to_string())
                })
                .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "done");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sf.metrics().deduplicated.get(), 9);
        assert_eq!(sf.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_share_the_error() {
        let sf = group(SingleFlightConfig::default());
        let owner = {
            let sf = sf.clone();
            tokio::spawn(async move {
                sf.run("k", || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err(GatewayError::permanent("p", "boom"))
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let waiter = sf.run("k", || async { Ok("unused".to_string()) }).await;
        let owner = owner.await.unwrap();
        assert_eq!(owner.unwrap_err().to_string(), waiter.unwrap_err().to_string());
        assert_eq!(sf.metrics().failed.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_timeout_does_not_affect_owner() {
        let sf = group(SingleFlightConfig::default());
        let owner = {
            let sf = sf.clone();
            tokio::spawn(async move {
                sf.run("k", || async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok("slow".to_string())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let waited = sf
            .run_with_timeout("k", Duration::from_secs(1), || async { Ok(String::new()) })
            .await;
        assert!(matches!(waited, Err(GatewayError::FlightTimeout { .. })));
        assert_eq!(owner.await.unwrap().unwrap(), "slow");
        assert_eq!(sf.metrics().timeouts.get(), 1);
    }

    #[tokio::test]
    async fn test_flight_removed_before_return() {
        let sf = group(SingleFlightConfig::default());
        let calls = AtomicU32::new(0);
        for _ in 0..2 {
            sf.run("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("v".to_string())
            })
            .await
            .unwrap();
            assert_eq!(sf.active(), 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_ceiling() {
        let sf = group(SingleFlightConfig {
            max_flights: 1,
            ..SingleFlightConfig::default()
        });
        let _owner = {
            let sf = sf.clone();
            tokio::spawn(async move {
                sf.run("a", || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(String::new())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let rejected = sf.run("b", || async { Ok(String::new()) }).await;
        assert!(matches!(
            rejected,
            Err(GatewayError::CapacityExceeded { resource: "single_flight", limit: 1 })
        ));
        assert_eq!(sf.metrics().rejected.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_sweep_releases_waiters_and_owner() {
        let sf = group(SingleFlightConfig {
            stuck_threshold: Duration::from_secs(60),
            ..SingleFlightConfig::default()
        });
        let owner = {
            let sf = sf.clone();
            tokio::spawn(async move {
                sf.run("k", || std::future::pending::<GatewayResult<String>>())
                    .await
            })
        };
        tokio::task::yield_now().await;
        let waiter = {
            let sf = sf.clone();
            tokio::spawn(async move {
                sf.run_with_timeout("k", Duration::from_secs(600), || async { Ok(String::new()) })
                    .await
            })
        };
        tokio::task::yield_now().await;

        assert_eq!(sf.sweep_stuck(), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(sf.sweep_stuck(), 1);

        assert!(matches!(waiter.await.unwrap(), Err(GatewayError::StuckFlight { .. })));
        assert!(matches!(owner.await.unwrap(), Err(GatewayError::StuckFlight { .. })));
        assert_eq!(sf.active(), 0);
        assert_eq!(sf.metrics().stuck.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_owner_abandons_flight() {
        let sf = group(SingleFlightConfig::default());
        let owner = {
            let sf = sf.clone();
            tokio::spawn(async move {
                sf.run("k", || std::future::pending::<GatewayResult<String>>())
                    .await
            })
        };
        tokio::task::yield_now().await;
        let waiter = {
            let sf = sf.clone();
            tokio::spawn(async move { sf.run("k", || async { Ok(String::new()) }).await })
        };
        tokio::task::yield_now().await;

        owner.abort();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(GatewayError::FlightAbandoned { .. })
        ));
        assert_eq!(sf.active(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_keys() {
        let sf = group(SingleFlightConfig::default());
        sf.run("k", || async { Ok(String::new()) }).await.unwrap();
        let snap = sf.snapshot();
        assert_eq!(snap["flights_total"], 1.0);
        assert_eq!(snap["flights_completed"], 1.0);
        assert!(snap.contains_key("flight_wait_mean_ms"));
    }
}
