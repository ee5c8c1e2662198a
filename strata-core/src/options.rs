//! Serde-loadable scope option documents.
//!
//! The document shape is `{ "queries": { ... } }`:
//!
//! ```json
//! { "queries": { "retry": 2, "retryDelay": 250, "refetchOnWindowFocus": false,
//!                "staleTime": 60000, "suspense": true } }
//! ```
//!
//! Durations are milliseconds. A missing field leaves the outer scope's
//! value alone, `null` clears it. Fields that are not recognized are kept
//! in `extensions` untouched. Callbacks and fetch functions cannot be
//! expressed in a document; attach them to the resulting [`ConfigLayer`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::retry::{Retry, RetryDelay};
use crate::{ConfigError, ConfigLayer, Setting};

/// Upper bound for `retry` counts in documents.
pub const MAX_RETRY_COUNT: u32 = 1_000;

/// Upper bound for `retryDelay` in documents (one hour).
pub const MAX_RETRY_DELAY_MS: u64 = 3_600_000;

/// `retry` as it appears in a document: a flag or a count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryOption {
    Enabled(bool),
    Count(u32),
}

impl From<RetryOption> for Retry {
    fn from(value: RetryOption) -> Self {
        match value {
            RetryOption::Enabled(b) => Retry::Enabled(b),
            RetryOption::Count(n) => Retry::Count(n),
        }
    }
}

/// Top-level scope document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeOptions {
    #[serde(default)]
    pub queries: QueryOptions,
}

/// The `queries` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    #[serde(default, skip_serializing_if = "Setting::is_absent")]
    pub retry: Setting<RetryOption>,

    #[serde(default, skip_serializing_if = "Setting::is_absent")]
    pub retry_delay: Setting<u64>,

    #[serde(default, skip_serializing_if = "Setting::is_absent")]
    pub refetch_on_window_focus: Setting<bool>,

    #[serde(default, skip_serializing_if = "Setting::is_absent")]
    pub stale_time: Setting<u64>,

    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl ScopeOptions {
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(input).map_err(|e| ConfigError::Parse {
            format: "json",
            reason: e.to_string(),
        })
    }

    /// TOML has no `null`, so TOML documents can set fields but never clear them.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        toml::from_str(input).map_err(|e| ConfigError::Parse {
            format: "toml",
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queries.validate()
    }

    /// Validate, then convert into a layer with no callbacks attached.
    pub fn into_layer<V>(self) -> Result<ConfigLayer<V>, ConfigError> {
        self.queries.into_layer()
    }
}

impl QueryOptions {
    /// Validates:
    /// - `retry` counts do not exceed [`MAX_RETRY_COUNT`]
    /// - `retryDelay` does not exceed [`MAX_RETRY_DELAY_MS`]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Setting::Value(RetryOption::Count(n)) = self.retry {
            if n > MAX_RETRY_COUNT {
                return Err(ConfigError::InvalidValue {
                    field: "queries.retry".to_string(),
                    value: n.to_string(),
                    reason: format!("retry must be at most {MAX_RETRY_COUNT}"),
                });
            }
        }

        if let Setting::Value(ms) = self.retry_delay {
            if ms > MAX_RETRY_DELAY_MS {
                return Err(ConfigError::InvalidValue {
                    field: "queries.retryDelay".to_string(),
                    value: ms.to_string(),
                    reason: format!("retryDelay must be at most {MAX_RETRY_DELAY_MS}ms"),
                });
            }
        }

        Ok(())
    }

    pub fn into_layer<V>(self) -> Result<ConfigLayer<V>, ConfigError> {
        self.validate()?;

        let mut layer = ConfigLayer::new();
        layer.retry = self.retry.map(Retry::from);
        layer.retry_delay = self
            .retry_delay
            .map(|ms| RetryDelay::Fixed(Duration::from_millis(ms)));
        layer.refetch_on_window_focus = self.refetch_on_window_focus;
        layer.stale_time = self.stale_time.map(Duration::from_millis);
        layer.extensions = self.extensions;
        Ok(layer)
    }
}
