//! Engine settings: built-in defaults, then an optional file, then
//! `REBAC__*` environment variables (e.g. `REBAC__MAX_DEPTH=8`,
//! `REBAC__LOGGING__JSON=true`).

use crate::{
    check::DEFAULT_MAX_DEPTH,
    engine::DEFAULT_CACHE_CAPACITY,
    error::{RebacError, Result},
    store::DEFAULT_SHARD_COUNT,
};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Per-check deadline when none is configured
pub const DEFAULT_CHECK_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Depth budget handed to every check and expand
    pub max_depth: u32,
    pub shard_count: usize,
    pub check_timeout_ms: u64,
    pub cache_enabled: bool,
    /// Cached answers kept before the cache is cleared
    pub cache_capacity: usize,
    /// Reject tuples whose namespace has no configuration
    pub reject_unknown_namespaces: bool,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    /// JSON lines for production, human-readable otherwise
    pub json: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            shard_count: DEFAULT_SHARD_COUNT,
            check_timeout_ms: DEFAULT_CHECK_TIMEOUT_MS,
            cache_enabled: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            reject_unknown_namespaces: false,
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl EngineSettings {
    /// Load settings, reading `path` as an extra source when it exists
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Self::defaults()?;

        if let Some(path) = path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("REBAC").separator("__"));
        Self::finish(builder)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let defaults = Self::default();
        Ok(Config::builder()
            .set_default("max_depth", i64::from(defaults.max_depth))?
            .set_default("shard_count", widen(defaults.shard_count))?
            .set_default("check_timeout_ms", defaults.check_timeout_ms)?
            .set_default("cache_enabled", defaults.cache_enabled)?
            .set_default("cache_capacity", widen(defaults.cache_capacity))?
            .set_default("reject_unknown_namespaces", defaults.reject_unknown_namespaces)?
            .set_default("logging.level", defaults.logging.level)?
            .set_default("logging.json", defaults.logging.json)?)
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings: Self = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(RebacError::validation("max_depth must be at least 1"));
        }
        if self.shard_count == 0 {
            return Err(RebacError::validation("shard_count must be at least 1"));
        }
        if self.check_timeout_ms == 0 {
            return Err(RebacError::validation("check_timeout_ms must be at least 1"));
        }
        if self.cache_capacity == 0 {
            return Err(RebacError::validation("cache_capacity must be at least 1"));
        }
        Ok(())
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

fn widen(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
