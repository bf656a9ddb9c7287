//! Cache configuration.

use std::time::Duration;

/// Default interval between usage reports.
pub const DEFAULT_USAGE_REPORT_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for an enriched cache instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// When false the cache is bypassed entirely: reads miss, writes are
    /// dropped, loaders always run and removals do nothing.
    pub enabled: bool,

    /// Name of this process within the fleet.
    /// Scopes the relay subscription so every instance receives every event.
    pub instance_name: String,

    /// Maximum number of entries. `None` leaves the store unbounded.
    pub max_capacity: Option<u64>,

    /// How often usage is aggregated by value type and logged.
    pub usage_report_interval: Duration,

    /// How often pending expirations are processed on an otherwise idle cache.
    pub sweep_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            instance_name: "default".to_string(),
            max_capacity: None,
            usage_report_interval: DEFAULT_USAGE_REPORT_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl CacheSettings {
    /// Settings for a named instance.
    pub fn for_instance(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            ..Default::default()
        }
    }

    /// Settings with the cache switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Enable or disable the cache (builder pattern).
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn instance_name(mut self, instance_name: impl Into<String>) -> Self {
        self.instance_name = instance_name.into();
        self
    }

    /// Bound the number of entries; the store evicts beyond it.
    #[must_use]
    pub fn max_capacity(mut self, max_capacity: u64) -> Self {
        self.max_capacity = Some(max_capacity);
        self
    }

    #[must_use]
    pub fn usage_report_interval(mut self, interval: Duration) -> Self {
        self.usage_report_interval = interval;
        self
    }

    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}
