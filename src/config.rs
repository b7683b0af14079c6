//! Engine configuration, read from `SLOTGUARD_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: {message}")]
    Invalid { var: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Business timezone used for local-day arithmetic (full-day exceptions,
    /// recurrences, working hours).
    pub timezone: Tz,
    /// Whole-call retries after the store reports a serialization failure.
    pub max_commit_retries: u32,
    pub default_page_size: u32,
    pub max_page_size: u32,
    /// Directory holding the WAL. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Compact once this many WAL records have been appended. 0 disables.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    /// Port for the Prometheus listener installed by [`crate::observability::init`].
    pub metrics_port: Option<u16>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            max_commit_retries: 3,
            default_page_size: 50,
            max_page_size: 500,
            data_dir: None,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(60),
            metrics_port: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(tz) = lookup("SLOTGUARD_TIMEZONE") {
            config.timezone = tz.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "SLOTGUARD_TIMEZONE",
                message: format!("unknown IANA timezone {tz:?}"),
            })?;
        }
        if let Some(v) = lookup("SLOTGUARD_MAX_COMMIT_RETRIES") {
            config.max_commit_retries = parse_number("SLOTGUARD_MAX_COMMIT_RETRIES", &v)?;
        }
        if let Some(v) = lookup("SLOTGUARD_DEFAULT_PAGE_SIZE") {
            config.default_page_size = parse_number("SLOTGUARD_DEFAULT_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("SLOTGUARD_MAX_PAGE_SIZE") {
            config.max_page_size = parse_number("SLOTGUARD_MAX_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("SLOTGUARD_DATA_DIR") {
            let v = v.trim();
            config.data_dir = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = lookup("SLOTGUARD_COMPACT_THRESHOLD") {
            config.compact_threshold = parse_number("SLOTGUARD_COMPACT_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("SLOTGUARD_COMPACT_INTERVAL_SECS") {
            let secs: u64 = parse_number("SLOTGUARD_COMPACT_INTERVAL_SECS", &v)?;
            config.compact_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(v) = lookup("SLOTGUARD_METRICS_PORT") {
            config.metrics_port = Some(parse_number("SLOTGUARD_METRICS_PORT", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_page_size == 0 {
            return Err(ConfigError::Invalid {
                var: "SLOTGUARD_MAX_PAGE_SIZE",
                message: "must be at least 1".into(),
            });
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(ConfigError::Invalid {
                var: "SLOTGUARD_DEFAULT_PAGE_SIZE",
                message: format!("must be between 1 and {}", self.max_page_size),
            });
        }
        Ok(())
    }

    /// WAL location inside `data_dir`.
    pub fn wal_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("slotguard.wal"))
    }
}

fn parse_number<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        message: format!("expected a non-negative integer, got {value:?}"),
    })
}
