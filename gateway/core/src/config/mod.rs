//! TOML Configuration File Support
//!
//! Centralized configuration loading for the gateway core, supporting a TOML
//! file at `~/.config/ai-gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. Environment variables (`GATEWAY_*`)
//! 2. TOML configuration file
//! 3. Default values
//!
//! The file path can be overridden with `GATEWAY_CONFIG`.
//!
//! # Example Configuration
//!
//! ```toml
//! [cache]
//! namespace = "gw"
//! l1_capacity = 10000
//! l2_ttl_secs = 300
//! compression_threshold = 1024
//! swr_grace_secs = 30
//!
//! [hedge]
//! initial_delay_ms = 100
//! max_hedges = 3
//! attempt_timeout_ms = 10000
//! ewma_alpha = 0.3
//!
//! [hedge.provider_weights]
//! primary = 2.0
//!
//! [single_flight]
//! default_timeout_ms = 30000
//! max_flights = 10000
//!
//! [backends]
//! redis_url = "redis://127.0.0.1:6379"
//! postgres_url = "postgres://gateway@localhost/gateway"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::hedge::HedgeConfig;
use crate::singleflight::SingleFlightConfig;
use crate::tasks::TaskConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration's last layer came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Cache section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    /// Storage key prefix
    pub namespace: Option<String>,

    /// Maximum L1 entries
    pub l1_capacity: Option<usize>,

    /// L1 TTL in seconds
    pub l1_ttl_secs: Option<u64>,

    /// L2 TTL in seconds
    pub l2_ttl_secs: Option<u64>,

    /// L3 TTL in seconds
    pub l3_ttl_secs: Option<u64>,

    /// L4 TTL in seconds
    pub l4_ttl_secs: Option<u64>,

    /// Whether L3 payloads may be compressed
    pub compression_enabled: Option<bool>,

    /// Compression threshold in bytes
    pub compression_threshold: Option<usize>,

    /// gzip level (0-9)
    pub compression_level: Option<u32>,

    /// Whether invalidation events are broadcast
    pub pubsub_enabled: Option<bool>,

    /// Invalidation channel name
    pub invalidation_channel: Option<String>,

    /// Whether stale-while-revalidate is enabled
    pub swr_enabled: Option<bool>,

    /// Stale-while-revalidate grace period in seconds
    pub swr_grace_secs: Option<u64>,

    /// Collapse concurrent refreshes of one key
    pub swr_dedup: Option<bool>,

    /// L4 expiry sweep interval in seconds
    pub l4_sweep_interval_secs: Option<u64>,
}

/// Hedge section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HedgeToml {
    /// Delay before the first hedge in milliseconds
    pub initial_delay_ms: Option<u64>,

    /// Maximum providers launched per request
    pub max_hedges: Option<usize>,

    /// Per-attempt timeout in milliseconds
    pub attempt_timeout_ms: Option<u64>,

    /// Growth of the fixed hedge delay
    pub backoff_multiplier: Option<f64>,

    /// EWMA smoothing factor
    pub ewma_alpha: Option<f64>,

    /// Whether hedge delays adapt to observed latency
    pub adaptive_delays: Option<bool>,

    /// Fraction of the previous provider's latency to wait
    pub adaptive_threshold: Option<f64>,

    /// Bound on the whole hedged operation in milliseconds
    pub aggregate_timeout_ms: Option<u64>,

    /// Maximum concurrent hedged operations
    pub max_concurrent: Option<usize>,

    /// Attempts per launch, including the first
    pub retry_attempts: Option<u32>,

    /// Backoff before the first retry in milliseconds
    pub retry_backoff_ms: Option<u64>,

    /// Consecutive failures that open a provider's breaker
    pub breaker_failure_threshold: Option<u32>,

    /// Seconds a breaker stays open before probing
    pub breaker_open_timeout_secs: Option<u64>,

    /// Static provider weights
    pub provider_weights: Option<BTreeMap<String, f64>>,
}

/// Single-flight section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SingleFlightToml {
    /// Waiter timeout in milliseconds
    pub default_timeout_ms: Option<u64>,

    /// Maximum concurrently active keys
    pub max_flights: Option<usize>,

    /// Stuck-owner threshold in seconds
    pub stuck_threshold_secs: Option<u64>,

    /// Stuck sweep interval in seconds
    pub sweep_interval_secs: Option<u64>,
}

/// Background task section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksToml {
    /// Maximum outstanding background tasks
    pub max_tasks: Option<usize>,

    /// Shutdown grace period in seconds
    pub shutdown_grace_secs: Option<u64>,
}

/// Backend section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsToml {
    /// Redis URL for L2/L3 and pub/sub
    pub redis_url: Option<String>,

    /// Postgres URL for L4
    pub postgres_url: Option<String>,

    /// Postgres pool size
    pub postgres_pool_size: Option<usize>,

    /// Postgres table name
    pub postgres_table: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Cache configuration section
    pub cache: CacheToml,

    /// Hedge configuration section
    pub hedge: HedgeToml,

    /// Single-flight configuration section
    pub single_flight: SingleFlightToml,

    /// Background task configuration section
    pub tasks: TasksToml,

    /// Backing store configuration section
    pub backends: BackendsToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Where the shared tiers live
///
/// Without URLs the daemon runs on in-memory stores.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendConfig {
    /// Redis URL for L2/L3 and invalidation pub/sub
    pub redis_url: Option<String>,

    /// Postgres URL for L4
    pub postgres_url: Option<String>,

    /// Postgres connection pool size
    pub postgres_pool_size: usize,

    /// Postgres cache table
    pub postgres_table: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            postgres_url: None,
            postgres_pool_size: 16,
            postgres_table: "gateway_cache".to_string(),
        }
    }
}

/// Centralized configuration for the gateway core
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Tiered cache
    pub cache: CacheConfig,

    /// Hedged executor
    pub hedge: HedgeConfig,

    /// Single-flight groups
    pub single_flight: SingleFlightConfig,

    /// Background task registry
    pub tasks: TaskConfig,

    /// Backing stores
    pub backends: BackendConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            hedge: HedgeConfig::default(),
            single_flight: SingleFlightConfig::default(),
            tasks: TaskConfig::default(),
            backends: BackendConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Reject values the components cannot run with
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.cache.l1_capacity == 0 {
            return invalid("cache.l1_capacity must be greater than 0");
        }
        if self.cache.compression_level > 9 {
            return invalid("cache.compression_level must be between 0 and 9");
        }
        if !(self.hedge.ewma_alpha > 0.0 && self.hedge.ewma_alpha <= 1.0) {
            return invalid("hedge.ewma_alpha must be in (0, 1]");
        }
        if self.hedge.max_hedges == 0 {
            return invalid("hedge.max_hedges must be at least 1");
        }
        if self.hedge.backoff_multiplier < 1.0 {
            return invalid("hedge.backoff_multiplier must be at least 1.0");
        }
        if self.hedge.adaptive_threshold <= 0.0 {
            return invalid("hedge.adaptive_threshold must be positive");
        }
        if self.hedge.max_concurrent == 0 {
            return invalid("hedge.max_concurrent must be greater than 0");
        }
        if self.hedge.retry.max_attempts == 0 {
            return invalid("hedge.retry_attempts must be at least 1");
        }
        if self.hedge.provider_weights.values().any(|w| *w < 0.0) {
            return invalid("hedge.provider_weights must not be negative");
        }
        if self.single_flight.max_flights == 0 {
            return invalid("single_flight.max_flights must be greater than 0");
        }
        if self.backends.postgres_pool_size == 0 {
            return invalid("backends.postgres_pool_size must be greater than 0");
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$GATEWAY_CONFIG` if set, otherwise
/// `$XDG_CONFIG_HOME/ai-gateway/gateway.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("GATEWAY_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|p| p.join("ai-gateway").join("gateway.toml"))
}

/// Load and validate configuration from all sources
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    let config = load_config_from_path(default_config_path())?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a specific path, then apply the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    let mut config = load_file_layer(path)?;
    apply_env_config(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

fn load_file_layer(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    let mut config = GatewayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: GatewayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut GatewayConfig, toml: &GatewayToml) {
    let secs = Duration::from_secs;
    let millis = Duration::from_millis;

    // Cache settings
    let c = &toml.cache;
    let cache = &mut config.cache;
    if let Some(ref namespace) = c.namespace {
        cache.namespace = namespace.clone();
    }
    if let Some(capacity) = c.l1_capacity {
        cache.l1_capacity = capacity;
    }
    if let Some(ttl) = c.l1_ttl_secs {
        cache.l1_ttl = secs(ttl);
    }
    if let Some(ttl) = c.l2_ttl_secs {
        cache.l2_ttl = secs(ttl);
    }
    if let Some(ttl) = c.l3_ttl_secs {
        cache.l3_ttl = secs(ttl);
    }
    if let Some(ttl) = c.l4_ttl_secs {
        cache.l4_ttl = secs(ttl);
    }
    if let Some(enabled) = c.compression_enabled {
        cache.compression_enabled = enabled;
    }
    if let Some(threshold) = c.compression_threshold {
        cache.compression_threshold = threshold;
    }
    if let Some(level) = c.compression_level {
        cache.compression_level = level;
    }
    if let Some(enabled) = c.pubsub_enabled {
        cache.pubsub_enabled = enabled;
    }
    if let Some(ref channel) = c.invalidation_channel {
        cache.invalidation_channel = channel.clone();
    }
    if let Some(enabled) = c.swr_enabled {
        cache.swr_enabled = enabled;
    }
    if let Some(grace) = c.swr_grace_secs {
        cache.swr_grace = secs(grace);
    }
    if let Some(dedup) = c.swr_dedup {
        cache.swr_dedup = dedup;
    }
    if let Some(interval) = c.l4_sweep_interval_secs {
        cache.l4_sweep_interval = secs(interval);
    }

    // Hedge settings
    let h = &toml.hedge;
    let hedge = &mut config.hedge;
    if let Some(delay) = h.initial_delay_ms {
        hedge.initial_delay = millis(delay);
    }
    if let Some(max) = h.max_hedges {
        hedge.max_hedges = max;
    }
    if let Some(timeout) = h.attempt_timeout_ms {
        hedge.attempt_timeout = millis(timeout);
    }
    if let Some(multiplier) = h.backoff_multiplier {
        hedge.backoff_multiplier = multiplier;
    }
    if let Some(alpha) = h.ewma_alpha {
        hedge.ewma_alpha = alpha;
    }
    if let Some(adaptive) = h.adaptive_delays {
        hedge.adaptive_delays = adaptive;
    }
    if let Some(threshold) = h.adaptive_threshold {
        hedge.adaptive_threshold = threshold;
    }
    if let Some(timeout) = h.aggregate_timeout_ms {
        hedge.aggregate_timeout = Some(millis(timeout));
    }
    if let Some(max) = h.max_concurrent {
        hedge.max_concurrent = max;
    }
    if let Some(attempts) = h.retry_attempts {
        hedge.retry.max_attempts = attempts;
    }
    if let Some(backoff) = h.retry_backoff_ms {
        hedge.retry.initial_backoff = millis(backoff);
    }
    if let Some(threshold) = h.breaker_failure_threshold {
        hedge.breaker.failure_threshold = threshold;
    }
    if let Some(timeout) = h.breaker_open_timeout_secs {
        hedge.breaker.open_timeout = secs(timeout);
    }
    if let Some(ref weights) = h.provider_weights {
        hedge.provider_weights = weights.clone();
    }

    // Single-flight settings
    let s = &toml.single_flight;
    let flights = &mut config.single_flight;
    if let Some(timeout) = s.default_timeout_ms {
        flights.default_timeout = millis(timeout);
    }
    if let Some(max) = s.max_flights {
        flights.max_flights = max;
    }
    if let Some(threshold) = s.stuck_threshold_secs {
        flights.stuck_threshold = secs(threshold);
    }
    if let Some(interval) = s.sweep_interval_secs {
        flights.sweep_interval = secs(interval);
    }

    // Task settings
    if let Some(max) = toml.tasks.max_tasks {
        config.tasks.max_tasks = max;
    }
    if let Some(grace) = toml.tasks.shutdown_grace_secs {
        config.tasks.shutdown_grace = secs(grace);
    }

    // Backends
    let b = &toml.backends;
    if b.redis_url.is_some() {
        config.backends.redis_url = b.redis_url.clone();
    }
    if b.postgres_url.is_some() {
        config.backends.postgres_url = b.postgres_url.clone();
    }
    if let Some(size) = b.postgres_pool_size {
        config.backends.postgres_pool_size = size;
    }
    if let Some(ref table) = b.postgres_table {
        config.backends.postgres_table = table.clone();
    }
}

/// Environment lookups that remember whether anything was applied
struct EnvLayer<L> {
    lookup: L,
    applied: bool,
}

impl<L> EnvLayer<L>
where
    L: Fn(&str) -> Option<String>,
{
    fn text(&mut self, name: &str) -> Option<String> {
        let value = (self.lookup)(name)?;
        self.applied = true;
        Some(value)
    }

    fn parse<T: FromStr>(&mut self, name: &str) -> Option<T> {
        let value = (self.lookup)(name)?.parse().ok()?;
        self.applied = true;
        Some(value)
    }

    fn flag(&mut self, name: &str) -> Option<bool> {
        self.text(name)
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
    }
}

/// Apply `GATEWAY_*` overrides read through `lookup`
///
/// Values that fail to parse are ignored.
fn apply_env_config<L>(config: &mut GatewayConfig, lookup: L)
where
    L: Fn(&str) -> Option<String>,
{
    let mut env = EnvLayer {
        lookup,
        applied: false,
    };

    // Cache settings from environment
    if let Some(namespace) = env.text("GATEWAY_NAMESPACE") {
        config.cache.namespace = namespace;
    }
    if let Some(n) = env.parse("GATEWAY_L1_CAPACITY") {
        config.cache.l1_capacity = n;
    }
    if let Some(s) = env.parse("GATEWAY_L1_TTL_SECS") {
        config.cache.l1_ttl = Duration::from_secs(s);
    }
    if let Some(s) = env.parse("GATEWAY_L2_TTL_SECS") {
        config.cache.l2_ttl = Duration::from_secs(s);
    }
    if let Some(s) = env.parse("GATEWAY_L3_TTL_SECS") {
        config.cache.l3_ttl = Duration::from_secs(s);
    }
    if let Some(s) = env.parse("GATEWAY_L4_TTL_SECS") {
        config.cache.l4_ttl = Duration::from_secs(s);
    }
    if let Some(enabled) = env.flag("GATEWAY_COMPRESSION") {
        config.cache.compression_enabled = enabled;
    }
    if let Some(n) = env.parse("GATEWAY_COMPRESSION_THRESHOLD") {
        config.cache.compression_threshold = n;
    }
    if let Some(enabled) = env.flag("GATEWAY_PUBSUB") {
        config.cache.pubsub_enabled = enabled;
    }
    if let Some(enabled) = env.flag("GATEWAY_SWR") {
        config.cache.swr_enabled = enabled;
    }
    if let Some(s) = env.parse("GATEWAY_SWR_GRACE_SECS") {
        config.cache.swr_grace = Duration::from_secs(s);
    }
    if let Some(dedup) = env.flag("GATEWAY_SWR_DEDUP") {
        config.cache.swr_dedup = dedup;
    }

    // Hedge settings from environment
    if let Some(ms) = env.parse("GATEWAY_HEDGE_INITIAL_DELAY_MS") {
        config.hedge.initial_delay = Duration::from_millis(ms);
    }
    if let Some(n) = env.parse("GATEWAY_HEDGE_MAX_HEDGES") {
        config.hedge.max_hedges = n;
    }
    if let Some(ms) = env.parse("GATEWAY_HEDGE_ATTEMPT_TIMEOUT_MS") {
        config.hedge.attempt_timeout = Duration::from_millis(ms);
    }
    if let Some(m) = env.parse("GATEWAY_HEDGE_BACKOFF_MULTIPLIER") {
        config.hedge.backoff_multiplier = m;
    }
    if let Some(a) = env.parse("GATEWAY_HEDGE_EWMA_ALPHA") {
        config.hedge.ewma_alpha = a;
    }
    if let Some(enabled) = env.flag("GATEWAY_HEDGE_ADAPTIVE") {
        config.hedge.adaptive_delays = enabled;
    }

    // Single-flight settings from environment
    if let Some(ms) = env.parse("GATEWAY_FLIGHT_TIMEOUT_MS") {
        config.single_flight.default_timeout = Duration::from_millis(ms);
    }
    if let Some(n) = env.parse("GATEWAY_MAX_FLIGHTS") {
        config.single_flight.max_flights = n;
    }

    // Backends from environment
    if let Some(url) = env.text("GATEWAY_REDIS_URL") {
        config.backends.redis_url = Some(url);
    }
    if let Some(url) = env.text("GATEWAY_POSTGRES_URL") {
        config.backends.postgres_url = Some(url);
    }

    if env.applied {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn toml_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();

        assert_eq!(config.cache.l1_capacity, 10_000);
        assert_eq!(config.hedge.max_hedges, 3);
        assert_eq!(config.single_flight.max_flights, 10_000);
        assert_eq!(config.backends, BackendConfig::default());
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if std::env::var("GATEWAY_CONFIG").is_err() {
            if let Some(path) = default_config_path() {
                assert!(path.ends_with("ai-gateway/gateway.toml"));
            }
        }
    }

    // =========================================================================
    // TOML Parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let file = toml_file(
            r#"
[cache]
namespace = "edge"
l1_capacity = 500
l2_ttl_secs = 120
compression_threshold = 2048
pubsub_enabled = false
swr_grace_secs = 10

[hedge]
initial_delay_ms = 50
max_hedges = 2
attempt_timeout_ms = 2000
ewma_alpha = 0.5
adaptive_delays = false
aggregate_timeout_ms = 5000
retry_attempts = 3
breaker_failure_threshold = 10

[hedge.provider_weights]
primary = 2.0
backup = 0.5

[single_flight]
default_timeout_ms = 1500
max_flights = 64
stuck_threshold_secs = 120

[tasks]
max_tasks = 32

[backends]
redis_url = "redis://cache:6379"
postgres_pool_size = 4
"#,
        );

        let config = load_file_layer(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.cache.namespace, "edge");
        assert_eq!(config.cache.l1_capacity, 500);
        assert_eq!(config.cache.l2_ttl, Duration::from_secs(120));
        assert_eq!(config.cache.compression_threshold, 2048);
        assert!(!config.cache.pubsub_enabled);
        assert_eq!(config.cache.swr_grace, Duration::from_secs(10));

        assert_eq!(config.hedge.initial_delay, Duration::from_millis(50));
        assert_eq!(config.hedge.max_hedges, 2);
        assert_eq!(config.hedge.attempt_timeout, Duration::from_secs(2));
        assert_eq!(config.hedge.ewma_alpha, 0.5);
        assert!(!config.hedge.adaptive_delays);
        assert_eq!(config.hedge.aggregate_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.hedge.retry.max_attempts, 3);
        assert_eq!(config.hedge.breaker.failure_threshold, 10);
        assert_eq!(config.hedge.provider_weights["primary"], 2.0);

        assert_eq!(config.single_flight.default_timeout, Duration::from_millis(1500));
        assert_eq!(config.single_flight.max_flights, 64);
        assert_eq!(config.single_flight.stuck_threshold, Duration::from_secs(120));
        assert_eq!(config.tasks.max_tasks, 32);
        assert_eq!(config.backends.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.backends.postgres_pool_size, 4);

        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_parse_partial_toml() {
        let file = toml_file("[hedge]\nmax_hedges = 5\n");
        let config = load_file_layer(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.hedge.max_hedges, 5);
        // Everything else keeps its default
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.hedge.initial_delay, HedgeConfig::default().initial_delay);
    }

    #[test]
    fn test_missing_file_graceful() {
        let config =
            load_file_layer(Some(PathBuf::from("/nonexistent/ai-gateway/gateway.toml"))).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = toml_file("[cache\nl1_capacity = \"lots\"\n");
        let result = load_file_layer(Some(file.path().to_path_buf()));
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    // =========================================================================
    // Environment Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = toml_file("[cache]\nl1_capacity = 500\n\n[hedge]\nmax_hedges = 2\n");
        let mut config = load_file_layer(Some(file.path().to_path_buf())).unwrap();

        apply_env_config(
            &mut config,
            env(&[
                ("GATEWAY_L1_CAPACITY", "42"),
                ("GATEWAY_SWR_GRACE_SECS", "5"),
                ("GATEWAY_SWR_DEDUP", "true"),
                ("GATEWAY_HEDGE_ADAPTIVE", "false"),
                ("GATEWAY_REDIS_URL", "redis://env:6379"),
            ]),
        );

        assert_eq!(config.cache.l1_capacity, 42);
        assert_eq!(config.cache.swr_grace, Duration::from_secs(5));
        assert!(config.cache.swr_dedup);
        assert!(!config.hedge.adaptive_delays);
        // File value not overridden by env
        assert_eq!(config.hedge.max_hedges, 2);
        assert_eq!(config.backends.redis_url.as_deref(), Some("redis://env:6379"));
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_backend_urls_use_gateway_prefix() {
        let mut config = GatewayConfig::default();
        apply_env_config(
            &mut config,
            env(&[
                ("REDIS_URL", "redis://bare:6379"),
                ("POSTGRES_URL", "postgres://bare/db"),
            ]),
        );
        assert!(config.backends.redis_url.is_none());
        assert!(config.backends.postgres_url.is_none());
        assert_eq!(config.source(), ConfigSource::Default);

        apply_env_config(
            &mut config,
            env(&[
                ("GATEWAY_REDIS_URL", "redis://gw:6379"),
                ("GATEWAY_POSTGRES_URL", "postgres://gw@localhost/gw"),
            ]),
        );
        assert_eq!(config.backends.redis_url.as_deref(), Some("redis://gw:6379"));
        assert_eq!(
            config.backends.postgres_url.as_deref(),
            Some("postgres://gw@localhost/gw")
        );
    }

    #[test]
    fn test_unparsable_env_ignored() {
        let mut config = GatewayConfig::default();
        apply_env_config(&mut config, env(&[("GATEWAY_HEDGE_MAX_HEDGES", "many")]));
        assert_eq!(config.hedge.max_hedges, 3);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_no_env_keeps_source() {
        let mut config = GatewayConfig::default();
        apply_env_config(&mut config, env(&[]));
        assert_eq!(config.source(), ConfigSource::Default);
    }

    // =========================================================================
    // Validation Tests
    // =========================================================================

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases: Vec<(&str, Box<dyn Fn(&mut GatewayConfig)>)> = vec![
            ("l1_capacity", Box::new(|c: &mut GatewayConfig| c.cache.l1_capacity = 0)),
            ("ewma_alpha", Box::new(|c: &mut GatewayConfig| c.hedge.ewma_alpha = 0.0)),
            ("ewma_alpha", Box::new(|c: &mut GatewayConfig| c.hedge.ewma_alpha = 1.5)),
            ("max_hedges", Box::new(|c: &mut GatewayConfig| c.hedge.max_hedges = 0)),
            ("backoff_multiplier", Box::new(|c: &mut GatewayConfig| c.hedge.backoff_multiplier = 0.5)),
            ("max_flights", Box::new(|c: &mut GatewayConfig| c.single_flight.max_flights = 0)),
            ("compression_level", Box::new(|c: &mut GatewayConfig| c.cache.compression_level = 12)),
        ];

        for (field, mutate) in cases {
            let mut config = GatewayConfig::default();
            mutate(&mut config);
            let err = config.validate().unwrap_err();
            assert!(
                err.to_string().contains(field),
                "expected {field} in: {err}"
            );
        }
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
