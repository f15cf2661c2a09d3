//! Limiter configuration: the process-wide constants of one rate-limit policy.
//!
//! A [`LimiterConfig`] is validated once and then treated as immutable. Hosts
//! that need several policies (per route, per tenant) build several configs
//! and one engine per config.

use serde::Deserialize;
use std::time::Duration;

/// Default refill rate, in tokens per second.
pub const DEFAULT_REFILL_RATE_PER_SECOND: f64 = 1.0;
/// Default bucket ceiling.
pub const DEFAULT_MAX_TOKENS: f64 = 10.0;
/// Default debit per admitted request.
pub const DEFAULT_COST_PER_REQUEST: f64 = 10.0;
/// Default expiry applied to every bucket write.
pub const DEFAULT_RECORD_TTL_SECS: u64 = 3600;
/// Default bound on one store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);
/// Default namespace for bucket keys.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";

/// Errors produced when validating limiter configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Refill rate must be finite and > 0.
    #[error("refill_rate_per_second must be finite and > 0 (got {0})")]
    InvalidRefillRate(f64),
    /// Ceiling must be finite and > 0.
    #[error("max_tokens must be finite and > 0 (got {0})")]
    InvalidMaxTokens(f64),
    /// Cost must be finite and > 0.
    #[error("cost_per_request must be finite and > 0 (got {0})")]
    InvalidCost(f64),
    /// TTL must be > 0.
    #[error("record_ttl_secs must be > 0")]
    InvalidTtl,
    /// Store timeout must be > 0.
    #[error("store_timeout must be > 0 (got {0:?})")]
    InvalidStoreTimeout(Duration),
    /// An environment variable was present but could not be parsed.
    #[error("environment variable {name} has unparsable value {value:?}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Raw value found.
        value: String,
    },
}

/// Validated configuration for one token-bucket policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawConfig")]
pub struct LimiterConfig {
    refill_rate_per_second: f64,
    max_tokens: f64,
    cost_per_request: f64,
    record_ttl_secs: u64,
    store_timeout: Duration,
    key_prefix: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            refill_rate_per_second: DEFAULT_REFILL_RATE_PER_SECOND,
            max_tokens: DEFAULT_MAX_TOKENS,
            cost_per_request: DEFAULT_COST_PER_REQUEST,
            record_ttl_secs: DEFAULT_RECORD_TTL_SECS,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl LimiterConfig {
    /// Create a config with validation, using defaults for the store timeout
    /// and key prefix.
    ///
    /// # Examples
    /// ```
    /// use tollgate::LimiterConfig;
    /// let cfg = LimiterConfig::new(1.0, 10.0, 10.0, 3600).unwrap();
    /// assert_eq!(cfg.max_tokens(), 10.0);
    /// ```
    pub fn new(
        refill_rate_per_second: f64,
        max_tokens: f64,
        cost_per_request: f64,
        record_ttl_secs: u64,
    ) -> Result<Self, ConfigError> {
        Self::builder()
            .refill_rate_per_second(refill_rate_per_second)
            .max_tokens(max_tokens)
            .cost_per_request(cost_per_request)
            .record_ttl_secs(record_ttl_secs)
            .build()
    }

    /// Start a builder seeded with the defaults.
    pub fn builder() -> LimiterConfigBuilder {
        LimiterConfigBuilder { config: Self::default() }
    }

    /// Load from `TOLLGATE_*` environment variables, defaulting unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(
            name: &'static str,
            raw: Option<String>,
        ) -> Result<Option<T>, ConfigError> {
            match raw {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidEnv { name, value }),
            }
        }

        let mut builder = Self::builder();
        if let Some(v) = parse("TOLLGATE_REFILL_RATE", lookup("TOLLGATE_REFILL_RATE"))? {
            builder = builder.refill_rate_per_second(v);
        }
        if let Some(v) = parse("TOLLGATE_MAX_TOKENS", lookup("TOLLGATE_MAX_TOKENS"))? {
            builder = builder.max_tokens(v);
        }
        if let Some(v) = parse("TOLLGATE_COST", lookup("TOLLGATE_COST"))? {
            builder = builder.cost_per_request(v);
        }
        if let Some(v) = parse("TOLLGATE_TTL_SECS", lookup("TOLLGATE_TTL_SECS"))? {
            builder = builder.record_ttl_secs(v);
        }
        if let Some(v) = parse::<u64>("TOLLGATE_STORE_TIMEOUT_MS", lookup("TOLLGATE_STORE_TIMEOUT_MS"))?
        {
            builder = builder.store_timeout(Duration::from_millis(v));
        }
        if let Some(prefix) = lookup("TOLLGATE_KEY_PREFIX") {
            builder = builder.key_prefix(prefix);
        }
        builder.build()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.refill_rate_per_second) {
            return Err(ConfigError::InvalidRefillRate(self.refill_rate_per_second));
        }
        if !positive(self.max_tokens) {
            return Err(ConfigError::InvalidMaxTokens(self.max_tokens));
        }
        if !positive(self.cost_per_request) {
            return Err(ConfigError::InvalidCost(self.cost_per_request));
        }
        if self.record_ttl_secs == 0 {
            return Err(ConfigError::InvalidTtl);
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::InvalidStoreTimeout(self.store_timeout));
        }
        Ok(())
    }

    /// Tokens granted per elapsed second.
    pub fn refill_rate_per_second(&self) -> f64 {
        self.refill_rate_per_second
    }

    /// Bucket ceiling.
    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    /// Tokens debited per admitted request.
    pub fn cost_per_request(&self) -> f64 {
        self.cost_per_request
    }

    /// Expiry applied to every bucket write, in seconds.
    pub fn record_ttl_secs(&self) -> u64 {
        self.record_ttl_secs
    }

    /// Upper bound on one store call.
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Namespace prepended to identities to form store keys.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Store key for `identity`.
    pub fn key_for(&self, identity: &str) -> String {
        format!("{}{}", self.key_prefix, identity)
    }
}

/// Builder for [`LimiterConfig`]; `build` validates.
#[derive(Debug, Clone)]
pub struct LimiterConfigBuilder {
    config: LimiterConfig,
}

impl LimiterConfigBuilder {
    pub fn refill_rate_per_second(mut self, rate: f64) -> Self {
        self.config.refill_rate_per_second = rate;
        self
    }

    pub fn max_tokens(mut self, max: f64) -> Self {
        self.config.max_tokens = max;
        self
    }

    pub fn cost_per_request(mut self, cost: f64) -> Self {
        self.config.cost_per_request = cost;
        self
    }

    pub fn record_ttl_secs(mut self, ttl: u64) -> Self {
        self.config.record_ttl_secs = ttl;
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.config.store_timeout = timeout;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    pub fn build(self) -> Result<LimiterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default = "default_rate")]
    refill_rate_per_second: f64,
    #[serde(default = "default_max")]
    max_tokens: f64,
    #[serde(default = "default_cost")]
    cost_per_request: f64,
    #[serde(default = "default_ttl", rename = "recordTTLSeconds", alias = "recordTtlSeconds")]
    record_ttl_secs: u64,
    #[serde(default = "default_timeout_ms")]
    store_timeout_ms: u64,
    #[serde(default = "default_prefix")]
    key_prefix: String,
}

fn default_rate() -> f64 {
    DEFAULT_REFILL_RATE_PER_SECOND
}
fn default_max() -> f64 {
    DEFAULT_MAX_TOKENS
}
fn default_cost() -> f64 {
    DEFAULT_COST_PER_REQUEST
}
fn default_ttl() -> u64 {
    DEFAULT_RECORD_TTL_SECS
}
fn default_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT.as_millis() as u64
}
fn default_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl TryFrom<RawConfig> for LimiterConfig {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        LimiterConfig::builder()
            .refill_rate_per_second(raw.refill_rate_per_second)
            .max_tokens(raw.max_tokens)
            .cost_per_request(raw.cost_per_request)
            .record_ttl_secs(raw.record_ttl_secs)
            .store_timeout(Duration::from_millis(raw.store_timeout_ms))
            .key_prefix(raw.key_prefix)
            .build()
    }
}
