//! Cache-wide settings that are not part of the scoped configuration.

use strata_core::ConfigError;

/// Settings fixed when the cache is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Buffered callback failures per receiver before the oldest are dropped.
    pub error_channel_capacity: usize,
    /// Start a background refresh when a subscribed entry is invalidated.
    pub refresh_on_invalidate: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            error_channel_capacity: 256,
            refresh_on_invalidate: true,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error_channel_capacity(mut self, capacity: usize) -> Self {
        self.error_channel_capacity = capacity;
        self
    }

    pub fn with_refresh_on_invalidate(mut self, enabled: bool) -> Self {
        self.refresh_on_invalidate = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.error_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "error_channel_capacity".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
