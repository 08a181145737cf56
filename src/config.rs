//! Configuration management for cachelimit.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{LimiterError, Result};
use crate::ratelimit::{KeySpace, Limiter};
use crate::store::CounterStore;

/// Prefix of environment variable overrides, e.g. `CACHELIMIT__LIMITER__MAX_HITS_PER_MINUTE`.
pub const ENV_PREFIX: &str = "CACHELIMIT";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachelimitConfig {
    /// Limiter parameters
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging setup for the binary
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Parameters of one limiter instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Namespace prefix for every key this limiter writes
    #[serde(default = "default_description")]
    pub description: String,

    /// Threshold; an estimated rate above this mitigates
    #[serde(default = "default_max_hits_per_minute")]
    pub max_hits_per_minute: u64,

    /// Expiry of newly created minute buckets, in seconds
    #[serde(default = "default_bucket_ttl_secs")]
    pub bucket_ttl_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            description: default_description(),
            max_hits_per_minute: default_max_hits_per_minute(),
            bucket_ttl_secs: default_bucket_ttl_secs(),
        }
    }
}

fn default_description() -> String {
    "cachelimit".to_string()
}

fn default_max_hits_per_minute() -> u64 {
    60
}

fn default_bucket_ttl_secs() -> u64 {
    120
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl CachelimitConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LimiterError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: CachelimitConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, overridden by `CACHELIMIT__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: CachelimitConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the limiter parameters without building anything.
    pub fn validate(&self) -> Result<()> {
        KeySpace::new(self.limiter.description.as_str())?;
        Ok(())
    }
}

impl LimiterConfig {
    /// Bucket expiry as a `Duration`.
    pub fn bucket_ttl(&self) -> Duration {
        Duration::from_secs(self.bucket_ttl_secs)
    }

    /// Build a limiter over `store` on the given clock.
    pub fn build_limiter<S: CounterStore>(
        &self,
        store: S,
        clock: Arc<dyn Clock>,
    ) -> Result<Limiter<S>> {
        Ok(Limiter::new(self.description.clone(), self.max_hits_per_minute, store)?
            .with_clock(clock)
            .with_bucket_ttl(self.bucket_ttl()))
    }
}
