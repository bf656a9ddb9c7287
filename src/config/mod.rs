//! Configuration module.
//!
//! Loads cache configuration from environment variables (and `.env`).

use std::env;

use crate::cache::CacheSettings;
use crate::error::ConfigError;
use crate::utils::{parse_bool, parse_duration};

/// Log filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "enriched_cache=info";

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub cache: CacheSettings,

    /// `tracing_subscriber::EnvFilter` directive.
    pub log_filter: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// | Variable                      | Default                     |
    /// |-------------------------------|-----------------------------|
    /// | `CACHE_ENABLED`               | `true`                      |
    /// | `CACHE_INSTANCE_NAME`         | `HOSTNAME`, else `default`  |
    /// | `CACHE_MAX_CAPACITY`          | unbounded                   |
    /// | `CACHE_USAGE_REPORT_INTERVAL` | `30m`                       |
    /// | `CACHE_SWEEP_INTERVAL`        | `60s`                       |
    /// | `RUST_LOG`                    | `enriched_cache=info`       |
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut cache = CacheSettings::default();

        if let Some(value) = var("CACHE_ENABLED") {
            cache.enabled = parse_bool(&value).ok_or(ConfigError::InvalidValue {
                name: "CACHE_ENABLED",
                value,
                reason: "expected a boolean",
            })?;
        }

        if let Some(name) = var("CACHE_INSTANCE_NAME").or_else(|| var("HOSTNAME")) {
            cache.instance_name = name.trim().to_string();
        }

        if let Some(value) = var("CACHE_MAX_CAPACITY") {
            let capacity = value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                name: "CACHE_MAX_CAPACITY",
                value: value.clone(),
                reason: "expected a whole number of entries",
            })?;
            cache.max_capacity = Some(capacity);
        }

        if let Some(value) = var("CACHE_USAGE_REPORT_INTERVAL") {
            cache.usage_report_interval =
                parse_interval("CACHE_USAGE_REPORT_INTERVAL", value)?;
        }

        if let Some(value) = var("CACHE_SWEEP_INTERVAL") {
            cache.sweep_interval = parse_interval("CACHE_SWEEP_INTERVAL", value)?;
        }

        let log_filter = var("RUST_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Ok(Self { cache, log_filter })
    }
}

fn parse_interval(name: &'static str, value: String) -> Result<std::time::Duration, ConfigError> {
    match parse_duration(&value) {
        Some(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(ConfigError::InvalidValue {
            name,
            value,
            reason: "expected a non-zero duration like 30s, 5m or 1h",
        }),
    }
}
