//! Request Pipeline
//!
//! End-to-end execution of one logical request:
//!
//! ```text
//! key ─► single-flight ─► owner: cache L1→L4 ─► hit ──────────────────────► value
//!                                           └─► miss ─► hedge providers ─► set ─► value
//!        waiters ◄──────────────────── same outcome ◄────────────────────────────┘
//! ```
//!
//! Entries found in L2 close to expiry are refreshed in the background by
//! re-running the hedge with the same request.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{CacheKey, RefreshFn, Tier, TieredCache, TtlOverrides};
use crate::error::{GatewayError, GatewayResult};
use crate::hedge::{HedgedExecutor, Origin, ProviderSpec};
use crate::metrics::MetricsSnapshot;
use crate::singleflight::{SingleFlight, SingleFlightConfig};
use crate::tasks::ServiceHandle;

/// Where a response came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServedFrom {
    /// A cache tier
    Cache(Tier),

    /// A provider race
    Provider {
        /// Winning provider
        provider: String,
        /// Whether a hedge beat the first launch
        hedge_won: bool,
        /// Providers launched
        launched: usize,
    },
}

/// A response and its origin
#[derive(Clone, Debug)]
pub struct Served<Resp> {
    /// The response
    pub value: Resp,
    /// Where it came from
    pub source: ServedFrom,
}

/// Single-flight, cache and hedged executor wired together
pub struct RequestPipeline<Resp> {
    cache: TieredCache,
    flights: SingleFlight<Served<Resp>>,
    executor: Arc<HedgedExecutor<Resp>>,
    ttl: TtlOverrides,
}

impl<Resp> RequestPipeline<Resp>
where
    Resp: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Wire the components; `flights` configures request-level deduplication
    #[must_use]
    pub fn new(
        cache: TieredCache,
        flights: SingleFlightConfig,
        executor: Arc<HedgedExecutor<Resp>>,
    ) -> Self {
        Self {
            cache,
            flights: SingleFlight::new(flights),
            executor,
            ttl: TtlOverrides::default(),
        }
    }

    /// Use `ttl` for values written back after a provider race
    #[must_use]
    pub fn with_ttl(mut self, ttl: TtlOverrides) -> Self {
        self.ttl = ttl;
        self
    }

    /// The cache
    #[must_use]
    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    /// The hedged executor
    #[must_use]
    pub fn executor(&self) -> &Arc<HedgedExecutor<Resp>> {
        &self.executor
    }

    /// Request-level deduplication group
    #[must_use]
    pub fn flights(&self) -> &SingleFlight<Served<Resp>> {
        &self.flights
    }

    /// Serve `request` for `key` from cache, or from the fastest provider
    ///
    /// Concurrent calls for the same key share one execution. A provider
    /// result is written back through every tier before it is returned.
    ///
    /// # Errors
    ///
    /// Returns the hedged executor's error on a full miss, or a
    /// single-flight error for deduplicated callers.
    pub async fn execute<Req, O>(
        &self,
        origin: &Arc<O>,
        key: &str,
        request: &Req,
        providers: &[ProviderSpec],
    ) -> GatewayResult<Served<Resp>>
    where
        Req: Serialize + Clone + Send + Sync + 'static,
        O: Origin<Req, Resp> + 'static,
    {
        self.flights
            .run(key, || self.serve(origin, key, request, providers))
            .await
    }

    async fn serve<Req, O>(
        &self,
        origin: &Arc<O>,
        key: &str,
        request: &Req,
        providers: &[ProviderSpec],
    ) -> GatewayResult<Served<Resp>>
    where
        Req: Serialize + Clone + Send + Sync + 'static,
        O: Origin<Req, Resp> + 'static,
    {
        let cache_key = CacheKey::new(key);
        let refresh = self.refresher(origin, key, request, providers);
        if let Some(entry) = self.cache.get_entry(&cache_key, Some(refresh)).await {
            match entry.decode::<Resp>() {
                Ok(value) => {
                    return Ok(Served {
                        value,
                        source: ServedFrom::Cache(entry.tier),
                    })
                }
                Err(e) => {
                    tracing::warn!(key, tier = %entry.tier, error = %e, "Discarding undecodable cache entry");
                }
            }
        }

        let outcome = self.executor.execute(origin.as_ref(), request, providers, key).await?;
        if let Err(e) = self.cache.set(key, &outcome.value, &self.ttl) {
            tracing::warn!(key, error = %e, "Provider result not cached");
        }

        Ok(Served {
            value: outcome.value,
            source: ServedFrom::Provider {
                provider: outcome.provider,
                hedge_won: outcome.hedge_won,
                launched: outcome.launched,
            },
        })
    }

    /// Background refresh that re-runs the race and re-encodes the winner
    fn refresher<Req, O>(
        &self,
        origin: &Arc<O>,
        key: &str,
        request: &Req,
        providers: &[ProviderSpec],
    ) -> RefreshFn
    where
        Req: Serialize + Clone + Send + Sync + 'static,
        O: Origin<Req, Resp> + 'static,
    {
        let executor = Arc::clone(&self.executor);
        let origin = Arc::clone(origin);
        let key = key.to_string();
        let request = request.clone();
        let providers = providers.to_vec();
        Box::new(move || {
            Box::pin(async move {
                let outcome = executor
                    .execute(origin.as_ref(), &request, &providers, &key)
                    .await?;
                let bytes = serde_json::to_vec(&outcome.value)?;
                Ok::<_, GatewayError>(bytes)
            })
        })
    }

    /// Start the cache listener and sweeps plus both stuck-flight sweeps
    #[must_use]
    pub fn start_services(&self) -> Vec<ServiceHandle> {
        let mut services = vec![
            self.cache.start_expiry_sweep(),
            self.flights.start_stuck_sweep(),
            self.executor.flights().start_stuck_sweep(),
        ];
        services.extend(self.cache.start_invalidation_listener());
        services
    }

    /// Every component's metrics in one map
    ///
    /// Cache keys are prefixed `cache_`, request-level flight keys
    /// `request_`; hedge and provider keys keep their own prefixes.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snap = MetricsSnapshot::new();
        for (key, value) in self.cache.snapshot() {
            snap.insert(format!("cache_{key}"), value);
        }
        for (key, value) in self.flights.snapshot() {
            snap.insert(format!("request_{key}"), value);
        }
        snap.extend(self.executor.snapshot());
        snap.extend(self.cache.tasks().snapshot());
        snap
    }
}

impl<Resp> std::fmt::Debug for RequestPipeline<Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("cache", &self.cache)
            .field("flights", &self.flights)
            .field("executor", &self.executor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::hedge::{HedgeConfig, RetryPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Counting {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl Origin<String, String> for Counting {
        async fn call(&self, provider: &str, request: &String) -> GatewayResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                Err(GatewayError::permanent(provider, "down"))
            } else {
                Ok(format!("{provider}:{request}"))
            }
        }
    }

    fn pipeline() -> RequestPipeline<String> {
        let hedge = HedgeConfig {
            retry: RetryPolicy::none(),
            ..HedgeConfig::default()
        };
        RequestPipeline::new(
            TieredCache::in_memory(CacheConfig::default()),
            SingleFlightConfig::default(),
            Arc::new(HedgedExecutor::new(hedge, SingleFlightConfig::default())),
        )
    }

    fn origin(fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicU32::new(0),
            fail,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_then_hit() {
        let pipeline = pipeline();
        let origin = origin(false);
        let providers = vec![ProviderSpec::new("p")];

        let first = pipeline
            .execute(&origin, "k", &"q".to_string(), &providers)
            .await
            .unwrap();
        assert_eq!(first.value, "p:q");
        assert!(matches!(first.source, ServedFrom::Provider { .. }));

        let second = pipeline
            .execute(&origin, "k", &"q".to_string(), &providers)
            .await
            .unwrap();
        assert_eq!(second.value, "p:q");
        assert_eq!(second.source, ServedFrom::Cache(Tier::L1));
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_not_cached() {
        let pipeline = pipeline();
        let origin = origin(true);
        let providers = vec![ProviderSpec::new("p")];

        for _ in 0..2 {
            let err = pipeline
                .execute(&origin, "k", &"q".to_string(), &providers)
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::AllProvidersFailed { .. }));
        }
        assert_eq!(origin.calls.load(Ordering::SeqCst), 2);
        assert!(pipeline.cache().get::<String>("k").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_merges_components() {
        let pipeline = pipeline();
        let origin = origin(false);
        pipeline
            .execute(&origin, "k", &"q".to_string(), &[ProviderSpec::new("p")])
            .await
            .unwrap();

        let snap = pipeline.snapshot();
        assert_eq!(snap["request_flights_total"], 1.0);
        assert_eq!(snap["hedge_requests"], 1.0);
        assert!(snap.contains_key("cache_lookups"));
        assert!(snap.contains_key("provider_p_latency_ms"));
    }
}
