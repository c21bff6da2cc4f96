//! Backend configuration.
//!
//! There is no process-wide configuration: every backend is constructed
//! from an explicit [`BackendConfig`]. Defaults are documented on the
//! constants below; `from_env` layers `STEPWISE_*` variables on top.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default size (bytes) above which scalar values are stored as blobs.
pub const DEFAULT_AUTO_BLOB_THRESHOLD: usize = 64 * 1024;

/// Default age after which an untouched job is swept: three days.
pub const DEFAULT_CLEANUP_AGE: Duration = Duration::from_secs(3 * 24 * 60 * 60);

pub const ENV_BASE_DIR: &str = "STEPWISE_BASE_DIR";
pub const ENV_AUTO_BLOB_THRESHOLD: &str = "STEPWISE_AUTO_BLOB_THRESHOLD";
pub const ENV_CLEANUP_AGE_SECS: &str = "STEPWISE_CLEANUP_AGE_SECS";
pub const ENV_DATABASE_URL: &str = "STEPWISE_DATABASE_URL";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Storage configuration shared by all backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Root directory of the filesystem backend.
    pub base_dir: PathBuf,
    /// Auto-blob threshold in bytes (0 disables).
    pub auto_blob_threshold: usize,
    /// Default age threshold of the cleanup sweep.
    pub cleanup_age: Duration,
    /// Connection string of the Postgres backend, when used.
    pub database_url: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("stepwise"),
            auto_blob_threshold: DEFAULT_AUTO_BLOB_THRESHOLD,
            cleanup_age: DEFAULT_CLEANUP_AGE,
            database_url: None,
        }
    }
}

impl BackendConfig {
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn with_auto_blob_threshold(mut self, threshold: usize) -> Self {
        self.auto_blob_threshold = threshold;
        self
    }

    pub fn with_cleanup_age(mut self, age: Duration) -> Self {
        self.cleanup_age = age;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Defaults overridden by `STEPWISE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_BASE_DIR).filter(|v| !v.trim().is_empty()) {
            config.base_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ENV_AUTO_BLOB_THRESHOLD) {
            config.auto_blob_threshold = parse_number(ENV_AUTO_BLOB_THRESHOLD, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CLEANUP_AGE_SECS) {
            config.cleanup_age = Duration::from_secs(parse_number(ENV_CLEANUP_AGE_SECS, &raw)?);
        }
        if let Some(url) = lookup(ENV_DATABASE_URL).filter(|v| !v.trim().is_empty()) {
            config.database_url = Some(url);
        }

        Ok(config)
    }
}

fn parse_number<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}
