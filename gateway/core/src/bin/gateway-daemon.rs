//! Gateway Cache Daemon
//!
//! Standalone process hosting one request pipeline. It joins the
//! invalidation channel so peer gateways stay coherent, sweeps expired L4
//! rows and stuck flights, and logs metrics on an interval.
//!
//! # Usage
//!
//! ```bash
//! # In-memory backends, default config path
//! gateway-daemon
//!
//! # Shared backends
//! GATEWAY_REDIS_URL=redis://127.0.0.1:6379 GATEWAY_POSTGRES_URL=postgres://gw@localhost/gw gateway-daemon
//!
//! # With verbose logging (includes a Prometheus dump every interval)
//! RUST_LOG=debug gateway-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `GATEWAY_CONFIG`: Config file path (default: `$XDG_CONFIG_HOME/ai-gateway/gateway.toml`)
//! - `GATEWAY_METRICS_INTERVAL_SECS`: Metrics log interval (default: 60)
//! - `GATEWAY_REDIS_URL`: L2/L3 and pub/sub backend (requires the `redis` feature)
//! - `GATEWAY_POSTGRES_URL`: L4 backend (requires the `postgres` feature)
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGINT: Graceful shutdown (drains background writes)

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use gateway_core::cache::{MemoryBus, MemoryKvStore, MemoryPersistentStore};
use gateway_core::{
    load_config, to_prometheus, BackendConfig, BackgroundTasks, CacheBackends, GatewayConfig,
    HedgedExecutor, RequestPipeline, TieredCache,
};

const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(60);

fn metrics_interval() -> Duration {
    std::env::var("GATEWAY_METRICS_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map_or(DEFAULT_METRICS_INTERVAL, Duration::from_secs)
}

/// Build the storage behind L2-L4 from the configured URLs
///
/// Tiers without a URL (or without the matching feature) stay in memory.
async fn connect_backends(config: &BackendConfig) -> anyhow::Result<CacheBackends> {
    let mut backends = CacheBackends {
        l2: Arc::new(MemoryKvStore::new()),
        l3: Arc::new(MemoryKvStore::new()),
        l4: Arc::new(MemoryPersistentStore::new()),
        bus: Some(Arc::new(MemoryBus::default())),
    };

    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = Arc::new(gateway_core::cache::RedisStore::connect(url).await?);
            backends.l2 = store.clone();
            backends.l3 = store.clone();
            backends.bus = Some(store);
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => warn!("GATEWAY_REDIS_URL set but built without the `redis` feature; L2/L3 stay in memory"),
        None => info!("No Redis URL configured; L2/L3 in memory"),
    }

    match &config.postgres_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            let store = gateway_core::cache::PostgresStore::connect(
                url,
                config.postgres_pool_size,
                &config.postgres_table,
            )?;
            store.ensure_schema().await?;
            backends.l4 = Arc::new(store);
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => warn!("GATEWAY_POSTGRES_URL set but built without the `postgres` feature; L4 stays in memory"),
        None => info!("No Postgres URL configured; L4 in memory"),
    }

    Ok(backends)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gateway_daemon=info".parse()?)
                .add_directive("gateway_core=info".parse()?),
        )
        .with_target(true)
        .init();

    info!("Starting Gateway Daemon");
    info!("PID: {}", std::process::id());

    let config: GatewayConfig = load_config()?;
    info!(
        source = %config.source(),
        path = ?config.config_file_path,
        namespace = %config.cache.namespace,
        "Configuration loaded"
    );

    let backends = connect_backends(&config.backends).await?;
    let tasks = BackgroundTasks::new(&config.tasks);
    let cache = TieredCache::new(config.cache.clone(), backends, tasks.clone());
    info!(instance_id = %cache.instance_id(), "Tiered cache ready");

    let executor = Arc::new(HedgedExecutor::new(
        config.hedge.clone(),
        config.single_flight.clone(),
    ));
    let pipeline: RequestPipeline<serde_json::Value> =
        RequestPipeline::new(cache, config.single_flight.clone(), executor);

    let services = pipeline.start_services();
    for service in &services {
        debug!(service = service.name(), "Service started");
    }
    if !config.cache.pubsub_enabled {
        info!("Invalidation pub/sub disabled");
    }

    let period = metrics_interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snap = pipeline.snapshot();
                let read = |key: &str| snap.get(key).copied().unwrap_or_default();
                info!(
                    lookups = read("cache_lookups"),
                    hit_rate = read("cache_hit_rate"),
                    l1_entries = read("cache_l1_entries"),
                    flights_active = read("request_flights_active"),
                    hedge_effectiveness = read("hedge_effectiveness"),
                    tasks_active = read("tasks_active"),
                    "Gateway metrics"
                );
                debug!("\n{}", to_prometheus("gateway", &snap));
            }
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutdown signal received");
                break;
            }
        }
    }

    for service in &services {
        service.abort();
    }
    let report = tasks.shutdown(config.tasks.shutdown_grace).await;

    info!(abandoned = report.abandoned, "Gateway Daemon stopped");
    Ok(())
}
