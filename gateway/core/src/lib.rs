//! Gateway Core - Request Execution for the ai-gateway
//!
//! This crate decides how a request to a slow, unreliable, multi-provider
//! backend is executed: deduplicated, cached and raced against latency
//! tails. It carries no transport or HTTP surface of its own; callers plug
//! their provider calls in through the [`Origin`] trait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         RequestPipeline                          │
//! │                                                                  │
//! │   key ──► SingleFlight ──► TieredCache ──► HedgedExecutor        │
//! │            (dedup)          L1 → L4          (race providers)    │
//! │                               ▲                    │             │
//! │                               └──── write-back ◄───┘             │
//! └──────────────────────────────────────────────────────────────────┘
//!            │                  │                    │
//!            ▼                  ▼                    ▼
//!     BackgroundTasks    KvStore / Persistent   Origin (caller)
//!     (sweeps, promote)  Store / Invalidation
//!                        Bus
//! ```
//!
//! # Key Types
//!
//! - [`TieredCache`]: four-tier cache with promotion, stale-while-revalidate
//!   and coherent invalidation
//! - [`SingleFlight`]: collapses concurrent identical calls into one
//! - [`HedgedExecutor`]: staggered provider launches, first success wins
//! - [`RequestPipeline`]: the three wired together
//! - [`GatewayConfig`]: layered configuration (defaults, TOML, environment)
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use gateway_core::{
//!     CacheConfig, HedgeConfig, HedgedExecutor, ProviderSpec, RequestPipeline,
//!     SingleFlightConfig, TieredCache, origin_fn,
//! };
//!
//! let cache = TieredCache::in_memory(CacheConfig::default());
//! let executor = Arc::new(HedgedExecutor::new(
//!     HedgeConfig::default(),
//!     SingleFlightConfig::default(),
//! ));
//! let pipeline = RequestPipeline::new(cache, SingleFlightConfig::default(), executor);
//!
//! let origin = Arc::new(origin_fn(|provider: String, prompt: String| async move {
//!     call_provider(&provider, &prompt).await
//! }));
//! let providers = vec![ProviderSpec::new("primary"), ProviderSpec::new("backup")];
//! let served = pipeline.execute(&origin, "prompt:42", &prompt, &providers).await?;
//! ```
//!
//! # Module Overview
//!
//! - [`cache`]: tiers, keys, compression, backing stores, invalidation
//! - [`singleflight`]: request deduplication with a stuck-flight sweep
//! - [`hedge`]: hedged executor, provider statistics, breakers, retry
//! - [`pipeline`]: end-to-end request flow
//! - [`config`]: TOML and environment configuration
//! - [`metrics`]: counters, histograms and flat snapshots
//! - [`tasks`]: bounded background task registry and sweeps
//! - [`error`]: error taxonomy

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod cache;
pub mod config;
pub mod error;
pub mod hedge;
pub mod metrics;
pub mod pipeline;
pub mod singleflight;
pub mod tasks;

// Re-exports for convenience
pub use cache::{
    CacheBackends, CacheConfig, CacheEntry, CacheKey, InvalidationEvent, InvalidationOp,
    InvalidationReport, KeyPattern, Tier, TieredCache, TtlOverrides,
};
pub use error::{GatewayError, GatewayResult, StoreError};
pub use pipeline::{RequestPipeline, Served, ServedFrom};
pub use singleflight::{SingleFlight, SingleFlightConfig};
pub use tasks::{BackgroundTasks, ServiceHandle, TaskConfig};

// Hedge exports
pub use hedge::{
    origin_fn, BreakerConfig, CircuitState, HedgeConfig, HedgeOutcome, HedgedExecutor, Origin,
    ProviderSpec, RetryPolicy,
};

// Metrics exports
pub use metrics::{to_prometheus, MetricsSnapshot};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, BackendConfig, ConfigError,
    ConfigSource, GatewayConfig, GatewayToml,
};
