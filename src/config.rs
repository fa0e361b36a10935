//! Configuration schema for redup.
//!
//! YAML config: store, fingerprint, timeout, strategy.
//! Env overrides: REDUP_STORE_URL (then REDIS_HOST_URL when no url is configured),
//! REDUP_LOG_LEVEL, REDUP_LOG_FORMAT.

use crate::bloom::BloomOptions;
use crate::cuckoo::CuckooOptions;
use crate::expiring::MIN_WINDOW;
use crate::fingerprint::{Algorithm, Fingerprinter};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Root config (redup.yaml).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub fingerprint: FingerprintConfig,

    /// Per-call timeout; values under 5 ms are raised to 5 ms.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub strategy: StrategyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Log level (e.g. "info", "debug"). Env REDUP_LOG_LEVEL overrides when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty". Env REDUP_LOG_FORMAT or RUST_LOG_JSON=1 override.
    #[serde(default)]
    pub log_format: Option<String>,

    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: None,
            metrics: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_address() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// Process-local; state is lost on exit.
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// e.g. `redis://127.0.0.1/`. Env REDUP_STORE_URL overrides.
    #[serde(default)]
    pub url: Option<String>,
}

impl StoreConfig {
    /// Resolved store URL: REDUP_STORE_URL, then config, then REDIS_HOST_URL.
    pub fn resolved_url(&self) -> Option<String> {
        env_non_empty("REDUP_STORE_URL")
            .or_else(|| self.url.clone().filter(|u| !u.trim().is_empty()))
            .or_else(|| env_non_empty("REDIS_HOST_URL"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FingerprintConfig {
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Max leading bytes hashed. Unset hashes everything; values under 64 are raised to 64.
    #[serde(default)]
    pub read_limit: Option<u64>,
}

impl FingerprintConfig {
    pub fn fingerprinter(&self) -> Fingerprinter {
        Fingerprinter::new(self.algorithm, self.read_limit.unwrap_or(u64::MAX))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum StrategyConfig {
    ExpiringKey {
        #[serde(default = "default_window_ms")]
        window_ms: u64,
        #[serde(default)]
        key_prefix: Option<String>,
        /// Single SET NX round trip instead of exists-then-set.
        #[serde(default)]
        atomic: bool,
    },
    Bloom {
        filter_key: String,
        #[serde(default = "default_error_rate")]
        error_rate: f64,
        capacity: u64,
        #[serde(default = "default_expansion")]
        expansion: u32,
    },
    Cuckoo {
        filter_key: String,
        capacity: u64,
        #[serde(default = "default_bucket_size")]
        bucket_size: u32,
        #[serde(default = "default_window_ms")]
        window_ms: u64,
    },
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig::ExpiringKey {
            window_ms: default_window_ms(),
            key_prefix: None,
            atomic: false,
        }
    }
}

fn default_window_ms() -> u64 {
    300_000
}
fn default_error_rate() -> f64 {
    0.001
}
fn default_expansion() -> u32 {
    2
}
fn default_bucket_size() -> u32 {
    2
}

impl StrategyConfig {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyConfig::ExpiringKey { .. } => "expiring_key",
            StrategyConfig::Bloom { .. } => "bloom",
            StrategyConfig::Cuckoo { .. } => "cuckoo",
        }
    }

    pub fn bloom_options(&self) -> Option<BloomOptions> {
        match self {
            StrategyConfig::Bloom {
                filter_key,
                error_rate,
                capacity,
                expansion,
            } => Some(
                BloomOptions::new(filter_key.clone(), *error_rate, *capacity)
                    .with_expansion(*expansion),
            ),
            _ => None,
        }
    }

    pub fn cuckoo_options(&self) -> Option<CuckooOptions> {
        match self {
            StrategyConfig::Cuckoo {
                filter_key,
                capacity,
                bucket_size,
                window_ms,
            } => Some(
                CuckooOptions::new(filter_key.clone(), *capacity, Duration::from_millis(*window_ms))
                    .with_bucket_size(*bucket_size),
            ),
            _ => None,
        }
    }
}

impl Config {
    /// Load and parse config from path. Expands env vars (`$VAR`, `${VAR}`, `${VAR:-default}`) via shellexpand.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {:?}: {}", path, e))?;
        Self::from_yaml(&s)
    }

    pub fn from_yaml(s: &str) -> anyhow::Result<Self> {
        let expanded = expand_env_vars(s)?;
        let config: Config = serde_yaml_ng::from_str(&expanded)
            .map_err(|e| anyhow::anyhow!("parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Per-call timeout as configured; the deduplicator applies the floor.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Reject settings that would fail at repository construction.
    pub fn validate(&self) -> anyhow::Result<()> {
        match &self.strategy {
            StrategyConfig::ExpiringKey { window_ms, .. } => {
                if Duration::from_millis(*window_ms) < MIN_WINDOW {
                    anyhow::bail!(
                        "strategy.window_ms {} is below the {} ms minimum",
                        window_ms,
                        MIN_WINDOW.as_millis()
                    );
                }
            }
            StrategyConfig::Bloom { .. } => {
                if let Some(opts) = self.strategy.bloom_options() {
                    opts.validate()?;
                }
            }
            StrategyConfig::Cuckoo { .. } => {
                if let Some(opts) = self.strategy.cuckoo_options() {
                    opts.validate()?;
                }
            }
        }
        if self.store.backend == StoreBackend::Redis && self.store.resolved_url().is_none() {
            anyhow::bail!("store.url is required for the redis backend (or set REDUP_STORE_URL)");
        }
        Ok(())
    }
}

fn env_non_empty(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|s| !s.trim().is_empty())
}

/// Expand env vars in config: `$VAR`, `${VAR}`, `${VAR:-default}`. An unset var without a
/// default is an error, so a missing store URL or filter key is not silently emptied.
fn expand_env_vars(s: &str) -> anyhow::Result<String> {
    fn context(var: &str) -> Result<Option<std::borrow::Cow<'static, str>>, std::env::VarError> {
        std::env::var(var).map(|v| Some(v.into()))
    }
    shellexpand::env_with_context(s, context)
        .map(|cow| cow.into_owned())
        .map_err(|e| anyhow::anyhow!("config env expansion: {} ({})", e.var_name, e.cause))
}
