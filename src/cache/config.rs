//! Configuration for the cache system

use crate::cache::types::{Category, Priority};
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Defaults applied to every key of a category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPolicy {
    /// How long a value is served without revalidation
    pub ttl: Duration,

    /// Grace window after `ttl` during which the value is served while refreshing
    pub stale_tolerance: Duration,

    /// Eviction priority for entries of this category
    pub priority: Priority,
}

impl CategoryPolicy {
    pub fn new(ttl: Duration, stale_tolerance: Duration, priority: Priority) -> Self {
        Self {
            ttl,
            stale_tolerance,
            priority,
        }
    }

    /// Built-in defaults when the configuration has no explicit policy
    pub fn default_for(category: &Category) -> Self {
        match category {
            // Profiles change rarely and are expensive to refetch
            Category::Profile => Self::new(
                Duration::from_secs(30 * 60),
                Duration::from_secs(10 * 60),
                Priority::High,
            ),
            Category::Listing => Self::new(
                Duration::from_secs(5 * 60),
                Duration::from_secs(2 * 60),
                Priority::Normal,
            ),
            // Slots are booked continuously; keep the window short
            Category::Availability => Self::new(
                Duration::from_secs(30),
                Duration::from_secs(30),
                Priority::Normal,
            ),
            Category::Message => Self::new(
                Duration::from_secs(10),
                Duration::from_secs(5),
                Priority::Low,
            ),
            Category::General | Category::Custom(_) => Self::new(
                Duration::from_secs(60),
                Duration::from_secs(30),
                Priority::Normal,
            ),
        }
    }
}

/// How the engine treats a named remote operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPolicy {
    /// Category every key of this operation belongs to
    pub category: Category,

    /// Whether results depend on the caller's identity
    pub identity_scoped: bool,

    /// Minimum spacing between remote invocations of this operation
    pub min_interval: Option<Duration>,
}

impl OperationPolicy {
    /// Identity-scoped operation in the given category
    pub fn new(category: Category) -> Self {
        Self {
            category,
            identity_scoped: true,
            min_interval: None,
        }
    }

    /// Operation whose results are the same for every caller
    pub fn public(category: Category) -> Self {
        Self {
            identity_scoped: false,
            ..Self::new(category)
        }
    }

    /// Space remote invocations at least `interval` apart
    pub fn debounced(mut self, interval: Duration) -> Self {
        self.min_interval = Some(interval);
        self
    }
}

/// Limits for the in-process tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralConfig {
    /// Maximum number of entries
    pub max_entries: usize,

    /// Maximum approximate size of all values in bytes
    pub max_size_bytes: usize,

    /// Fraction of each ceiling a pruning pass shrinks the cache down to
    pub prune_target_ratio: f64,
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            max_size_bytes: 16 * 1024 * 1024,
            prune_target_ratio: 0.8,
        }
    }
}

/// Limits and layout for the durable tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentConfig {
    /// Prefix of every storage key owned by the cache
    pub namespace: String,

    /// Schema version of the envelopes this build writes
    pub schema_version: String,

    /// Stored item count that triggers a pruning pass
    pub max_entries: usize,

    /// Total storage budget in bytes
    pub max_size_bytes: usize,

    /// Largest single item, as a fraction of `max_size_bytes`
    pub max_item_fraction: f64,

    /// Fraction of the oldest items removed by a pruning pass
    pub prune_fraction: f64,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            namespace: "rpc-cache:".to_string(),
            schema_version: env!("CARGO_PKG_VERSION").to_string(),
            max_entries: 500,
            max_size_bytes: 5 * 1024 * 1024,
            max_item_fraction: 0.1,
            prune_fraction: 0.2,
        }
    }
}

impl PersistentConfig {
    /// Largest envelope `set` accepts
    pub fn max_item_bytes(&self) -> usize {
        (self.max_size_bytes as f64 * self.max_item_fraction) as usize
    }

    /// Storage key of the version marker record
    pub fn version_key(&self) -> String {
        format!("{}__schema_version", self.namespace)
    }
}

/// Configuration for the whole engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// In-process tier limits
    pub ephemeral: EphemeralConfig,

    /// Durable tier limits and layout
    pub persistent: PersistentConfig,

    /// Per-category overrides of the built-in defaults
    pub categories: HashMap<Category, CategoryPolicy>,

    /// Per-operation policies, resolved once per call by name
    pub operations: HashMap<String, OperationPolicy>,

    /// Category of operations without a policy
    pub default_category: Category,

    /// Debounce interval of operations without their own
    pub default_min_interval: Option<Duration>,

    /// Age after which an in-flight call is no longer joined by new callers
    pub pending_timeout: Duration,

    /// Upper bound on any entry's stale window
    pub max_stale_tolerance: Option<Duration>,

    /// Serve a cached value within its stale window when the remote call fails
    pub serve_stale_on_error: bool,

    /// TTL jitter factor (0.0 - 1.0) applied to category default TTLs
    pub ttl_jitter: f64,

    /// Enable the background maintenance task
    pub enable_auto_cleanup: bool,

    /// Interval for the background maintenance task
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ephemeral: EphemeralConfig::default(),
            persistent: PersistentConfig::default(),
            categories: HashMap::new(),
            operations: HashMap::new(),
            default_category: Category::General,
            default_min_interval: None,
            pending_timeout: Duration::from_secs(30),
            max_stale_tolerance: None,
            serve_stale_on_error: true,
            ttl_jitter: 0.1,
            enable_auto_cleanup: true,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.ephemeral.max_entries == 0 {
            return Err(CacheError::ConfigError(
                "ephemeral.max_entries must be greater than 0".to_string(),
            ));
        }

        if self.ephemeral.max_size_bytes == 0 {
            return Err(CacheError::ConfigError(
                "ephemeral.max_size_bytes must be greater than 0".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.ephemeral.prune_target_ratio) {
            return Err(CacheError::ConfigError(
                "ephemeral.prune_target_ratio must be in [0.0, 1.0)".to_string(),
            ));
        }

        if self.persistent.max_entries == 0 || self.persistent.max_size_bytes == 0 {
            return Err(CacheError::ConfigError(
                "persistent limits must be greater than 0".to_string(),
            ));
        }

        if self.persistent.max_item_fraction <= 0.0 || self.persistent.max_item_fraction > 1.0 {
            return Err(CacheError::ConfigError(
                "persistent.max_item_fraction must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.persistent.prune_fraction <= 0.0 || self.persistent.prune_fraction > 1.0 {
            return Err(CacheError::ConfigError(
                "persistent.prune_fraction must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.persistent.schema_version.is_empty() {
            return Err(CacheError::ConfigError(
                "persistent.schema_version must not be empty".to_string(),
            ));
        }

        if self.ttl_jitter < 0.0 || self.ttl_jitter > 1.0 {
            return Err(CacheError::ConfigError(
                "ttl_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.pending_timeout.is_zero() {
            return Err(CacheError::ConfigError(
                "pending_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Effective policy for a category
    pub fn category_policy(&self, category: &Category) -> CategoryPolicy {
        self.categories
            .get(category)
            .cloned()
            .unwrap_or_else(|| CategoryPolicy::default_for(category))
    }

    /// Effective policy for an operation
    pub fn operation_policy(&self, operation: &str) -> OperationPolicy {
        self.operations.get(operation).cloned().unwrap_or_else(|| OperationPolicy {
            category: self.default_category.clone(),
            identity_scoped: true,
            min_interval: self.default_min_interval,
        })
    }

    /// Calculate actual TTL with jitter applied
    pub fn ttl_with_jitter(&self, ttl: Duration) -> Duration {
        if self.ttl_jitter == 0.0 {
            return ttl;
        }

        let base_secs = ttl.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(0.001);

        Duration::from_secs_f64(final_secs)
    }

    /// Load configuration from the environment (and a `.env` file if present)
    ///
    /// Recognised variables: `RPC_CACHE_MAX_ENTRIES`, `RPC_CACHE_MAX_SIZE_BYTES`,
    /// `RPC_CACHE_PERSISTENT_MAX_ENTRIES`, `RPC_CACHE_PERSISTENT_MAX_SIZE_BYTES`,
    /// `RPC_CACHE_NAMESPACE`, `RPC_CACHE_SCHEMA_VERSION`, `RPC_CACHE_PENDING_TIMEOUT_MS`,
    /// `RPC_CACHE_TTL_JITTER`, `RPC_CACHE_SERVE_STALE_ON_ERROR`.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Some(v) = env_parse("RPC_CACHE_MAX_ENTRIES")? {
            config.ephemeral.max_entries = v;
        }
        if let Some(v) = env_parse("RPC_CACHE_MAX_SIZE_BYTES")? {
            config.ephemeral.max_size_bytes = v;
        }
        if let Some(v) = env_parse("RPC_CACHE_PERSISTENT_MAX_ENTRIES")? {
            config.persistent.max_entries = v;
        }
        if let Some(v) = env_parse("RPC_CACHE_PERSISTENT_MAX_SIZE_BYTES")? {
            config.persistent.max_size_bytes = v;
        }
        if let Some(v) = env_parse::<String>("RPC_CACHE_NAMESPACE")? {
            config.persistent.namespace = v;
        }
        if let Some(v) = env_parse::<String>("RPC_CACHE_SCHEMA_VERSION")? {
            config.persistent.schema_version = v;
        }
        if let Some(ms) = env_parse::<u64>("RPC_CACHE_PENDING_TIMEOUT_MS")? {
            config.pending_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = env_parse("RPC_CACHE_TTL_JITTER")? {
            config.ttl_jitter = v;
        }
        if let Some(v) = env_parse("RPC_CACHE_SERVE_STALE_ON_ERROR")? {
            config.serve_stale_on_error = v;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Read and parse an optional environment variable
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CacheError::ConfigError(format!("{}={:?}: {}", name, raw, e))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(CacheError::ConfigError(format!("{}: {}", name, e))),
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    max_entries: Option<usize>,
    max_size_bytes: Option<usize>,
    prune_target_ratio: Option<f64>,
    persistent: Option<PersistentConfig>,
    schema_version: Option<String>,
    persistent_max_entries: Option<usize>,
    persistent_max_size_bytes: Option<usize>,
    categories: HashMap<Category, CategoryPolicy>,
    operations: HashMap<String, OperationPolicy>,
    default_category: Option<Category>,
    default_min_interval: Option<Duration>,
    pending_timeout: Option<Duration>,
    max_stale_tolerance: Option<Duration>,
    serve_stale_on_error: Option<bool>,
    ttl_jitter: Option<f64>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
}

impl CacheConfigBuilder {
    /// Set maximum number of ephemeral entries
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Set maximum ephemeral size in bytes
    pub fn max_size_bytes(mut self, size: usize) -> Self {
        self.max_size_bytes = Some(size);
        self
    }

    /// Set the fraction of capacity a pruning pass shrinks down to
    pub fn prune_target_ratio(mut self, ratio: f64) -> Self {
        self.prune_target_ratio = Some(ratio);
        self
    }

    /// Replace the whole persistent tier configuration
    pub fn persistent(mut self, persistent: PersistentConfig) -> Self {
        self.persistent = Some(persistent);
        self
    }

    /// Set the expected persistent schema version
    pub fn schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = Some(version.into());
        self
    }

    /// Set the persistent item count that triggers pruning
    pub fn persistent_max_entries(mut self, max: usize) -> Self {
        self.persistent_max_entries = Some(max);
        self
    }

    /// Set the persistent storage budget in bytes
    pub fn persistent_max_size_bytes(mut self, size: usize) -> Self {
        self.persistent_max_size_bytes = Some(size);
        self
    }

    /// Override the defaults of one category
    pub fn category(mut self, category: Category, policy: CategoryPolicy) -> Self {
        self.categories.insert(category, policy);
        self
    }

    /// Register the policy of one operation
    pub fn operation(mut self, name: impl Into<String>, policy: OperationPolicy) -> Self {
        self.operations.insert(name.into(), policy);
        self
    }

    /// Set the category of operations without a policy
    pub fn default_category(mut self, category: Category) -> Self {
        self.default_category = Some(category);
        self
    }

    /// Set the debounce interval of operations without their own
    pub fn default_min_interval(mut self, interval: Duration) -> Self {
        self.default_min_interval = Some(interval);
        self
    }

    /// Set the age after which in-flight calls are released
    pub fn pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = Some(timeout);
        self
    }

    /// Cap every entry's stale window
    pub fn max_stale_tolerance(mut self, tolerance: Duration) -> Self {
        self.max_stale_tolerance = Some(tolerance);
        self
    }

    /// Enable or disable stale fallback on remote failure
    pub fn serve_stale_on_error(mut self, enable: bool) -> Self {
        self.serve_stale_on_error = Some(enable);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Enable or disable the maintenance task
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set maintenance interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        let mut persistent = self.persistent.unwrap_or(defaults.persistent);
        if let Some(version) = self.schema_version {
            persistent.schema_version = version;
        }
        if let Some(max) = self.persistent_max_entries {
            persistent.max_entries = max;
        }
        if let Some(size) = self.persistent_max_size_bytes {
            persistent.max_size_bytes = size;
        }

        CacheConfig {
            ephemeral: EphemeralConfig {
                max_entries: self.max_entries.unwrap_or(defaults.ephemeral.max_entries),
                max_size_bytes: self
                    .max_size_bytes
                    .unwrap_or(defaults.ephemeral.max_size_bytes),
                prune_target_ratio: self
                    .prune_target_ratio
                    .unwrap_or(defaults.ephemeral.prune_target_ratio),
            },
            persistent,
            categories: self.categories,
            operations: self.operations,
            default_category: self.default_category.unwrap_or(defaults.default_category),
            default_min_interval: self.default_min_interval.or(defaults.default_min_interval),
            pending_timeout: self.pending_timeout.unwrap_or(defaults.pending_timeout),
            max_stale_tolerance: self.max_stale_tolerance.or(defaults.max_stale_tolerance),
            serve_stale_on_error: self
                .serve_stale_on_error
                .unwrap_or(defaults.serve_stale_on_error),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
        }
    }
}

/// Preset configurations for common use cases
impl CacheConfig {
    /// Short-lived data that changes between page views
    pub fn realtime() -> Self {
        let mut config = Self {
            pending_timeout: Duration::from_secs(10),
            ttl_jitter: 0.15,
            cleanup_interval: Duration::from_secs(15),
            ..Default::default()
        };
        config.categories.insert(
            Category::Availability,
            CategoryPolicy::new(
                Duration::from_secs(10),
                Duration::from_secs(5),
                Priority::Normal,
            ),
        );
        config
    }

    /// Memory-constrained clients
    pub fn small() -> Self {
        Self {
            ephemeral: EphemeralConfig {
                max_entries: 100,
                max_size_bytes: 1024 * 1024,
                ..Default::default()
            },
            persistent: PersistentConfig {
                max_entries: 100,
                max_size_bytes: 1024 * 1024,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Long-running back-office sessions with large listings
    pub fn large() -> Self {
        Self {
            ephemeral: EphemeralConfig {
                max_entries: 50_000,
                max_size_bytes: 256 * 1024 * 1024,
                ..Default::default()
            },
            persistent: PersistentConfig {
                max_entries: 10_000,
                max_size_bytes: 100 * 1024 * 1024,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.ephemeral.max_entries, 1_000);
        assert_eq!(config.persistent.schema_version, env!("CARGO_PKG_VERSION"));
        assert!(config.enable_auto_cleanup);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut invalid_config = CacheConfig::default();
        invalid_config.ephemeral.max_entries = 0;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = CacheConfig::default();
        invalid_config.ttl_jitter = 1.5;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = CacheConfig::default();
        invalid_config.persistent.max_item_fraction = 0.0;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = CacheConfig::default();
        invalid_config.ephemeral.prune_target_ratio = 1.0;
        assert!(matches!(
            invalid_config.validate(),
            Err(CacheError::ConfigError(_))
        ));
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::builder()
            .max_entries(100)
            .max_size_bytes(50_000)
            .schema_version("1.0.0")
            .persistent_max_entries(10)
            .operation(
                "findDoctors",
                OperationPolicy::public(Category::Listing).debounced(Duration::from_millis(300)),
            )
            .build();

        assert_eq!(config.ephemeral.max_entries, 100);
        assert_eq!(config.ephemeral.max_size_bytes, 50_000);
        assert_eq!(config.persistent.schema_version, "1.0.0");
        assert_eq!(config.persistent.max_entries, 10);

        let policy = config.operation_policy("findDoctors");
        assert!(!policy.identity_scoped);
        assert_eq!(policy.category, Category::Listing);
        assert_eq!(policy.min_interval, Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_unknown_operation_falls_back_to_defaults() {
        let config = CacheConfig::builder()
            .default_category(Category::Message)
            .default_min_interval(Duration::from_millis(50))
            .build();

        let policy = config.operation_policy("listInbox");
        assert_eq!(policy.category, Category::Message);
        assert!(policy.identity_scoped);
        assert_eq!(policy.min_interval, Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_category_overrides() {
        let custom = CategoryPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(2),
            Priority::Low,
        );
        let config = CacheConfig::builder()
            .category(Category::Profile, custom.clone())
            .build();

        assert_eq!(config.category_policy(&Category::Profile), custom);
        assert_eq!(
            config.category_policy(&Category::Listing),
            CategoryPolicy::default_for(&Category::Listing)
        );
    }

    #[test]
    fn test_ttl_with_jitter() {
        let config = CacheConfig {
            ttl_jitter: 0.1,
            ..Default::default()
        };

        let ttl = config.ttl_with_jitter(Duration::from_secs(3600));
        let base_secs = 3600.0;
        let jitter_range = base_secs * 0.1;

        assert!(ttl.as_secs_f64() >= base_secs - jitter_range);
        assert!(ttl.as_secs_f64() <= base_secs + jitter_range);

        let no_jitter = CacheConfig {
            ttl_jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(
            no_jitter.ttl_with_jitter(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_max_item_bytes() {
        let persistent = PersistentConfig {
            max_size_bytes: 10_000,
            max_item_fraction: 0.25,
            ..Default::default()
        };
        assert_eq!(persistent.max_item_bytes(), 2_500);
        assert_eq!(persistent.version_key(), "rpc-cache:__schema_version");
    }

    #[test]
    fn test_env_parse() {
        std::env::set_var("RPC_CACHE_TEST_ENV_PARSE_OK", " 42 ");
        std::env::set_var("RPC_CACHE_TEST_ENV_PARSE_BAD", "forty-two");

        assert_eq!(env_parse::<usize>("RPC_CACHE_TEST_ENV_PARSE_OK").unwrap(), Some(42));
        assert!(env_parse::<usize>("RPC_CACHE_TEST_ENV_PARSE_BAD").is_err());
        assert_eq!(env_parse::<usize>("RPC_CACHE_TEST_ENV_PARSE_MISSING").unwrap(), None);
    }

    #[test]
    fn test_preset_configs() {
        let realtime = CacheConfig::realtime();
        assert_eq!(
            realtime.category_policy(&Category::Availability).ttl,
            Duration::from_secs(10)
        );

        let small = CacheConfig::small();
        assert_eq!(small.ephemeral.max_entries, 100);

        let large = CacheConfig::large();
        assert_eq!(large.ephemeral.max_entries, 50_000);

        for preset in [realtime, small, large] {
            assert!(preset.validate().is_ok());
        }
    }

    #[test]
    fn test_config_serializes_category_keys() {
        let config = CacheConfig::builder()
            .category(
                Category::Custom("reviews".to_string()),
                CategoryPolicy::default_for(&Category::General),
            )
            .build();

        let json = serde_json::to_string(&config).unwrap();
        let back: CacheConfig = serde_json::from_str(&json).unwrap();
        assert!(back
            .categories
            .contains_key(&Category::Custom("reviews".to_string())));
    }
}
