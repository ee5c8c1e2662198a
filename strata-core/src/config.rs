//! Configuration layers and the merger.
//!
//! A [`ConfigLayer`] is a partial configuration. Layers are folded outer to
//! inner by [`merge`]; [`resolve`] additionally applies the built-in
//! defaults and produces the [`QueryConfig`] the cache actually uses.

use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::retry::{Retry, RetryDelay, RetryPolicy, StandardRetry};
use crate::{FetchError, QueryFn, QueryKey, Setting, SharedQueryFn};

/// Outcome of a lifecycle callback. An `Err` is reported, never propagated.
pub type CallbackResult = Result<(), Box<dyn StdError + Send + Sync>>;

/// Called with the resolved value when an execution succeeds.
pub type SuccessCallback<V> = Arc<dyn Fn(&V, &QueryKey) -> CallbackResult + Send + Sync>;

/// Called with the final error when an execution exhausts its retries.
pub type ErrorCallback = Arc<dyn Fn(&FetchError, &QueryKey) -> CallbackResult + Send + Sync>;

/// A partial, immutable configuration.
pub struct ConfigLayer<V> {
    pub query_fn: Setting<SharedQueryFn<V>>,
    pub on_success: Setting<SuccessCallback<V>>,
    pub on_error: Setting<ErrorCallback>,
    pub retry: Setting<Retry>,
    pub retry_delay: Setting<RetryDelay>,
    pub refetch_on_window_focus: Setting<bool>,
    pub stale_time: Setting<Duration>,
    /// Fields this crate does not interpret. A `null` value removes the
    /// key from the effective configuration.
    pub extensions: BTreeMap<String, Value>,
}

impl<V> Default for ConfigLayer<V> {
    fn default() -> Self {
        Self {
            query_fn: Setting::Absent,
            on_success: Setting::Absent,
            on_error: Setting::Absent,
            retry: Setting::Absent,
            retry_delay: Setting::Absent,
            refetch_on_window_focus: Setting::Absent,
            stale_time: Setting::Absent,
            extensions: BTreeMap::new(),
        }
    }
}

impl<V> Clone for ConfigLayer<V> {
    fn clone(&self) -> Self {
        Self {
            query_fn: self.query_fn.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            retry: self.retry.clone(),
            retry_delay: self.retry_delay.clone(),
            refetch_on_window_focus: self.refetch_on_window_focus.clone(),
            stale_time: self.stale_time.clone(),
            extensions: self.extensions.clone(),
        }
    }
}

fn same_arc<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Function-valued fields compare by identity.
impl<V> PartialEq for ConfigLayer<V> {
    fn eq(&self, other: &Self) -> bool {
        self.query_fn.eq_by(&other.query_fn, same_arc)
            && self.on_success.eq_by(&other.on_success, same_arc)
            && self.on_error.eq_by(&other.on_error, same_arc)
            && self.retry == other.retry
            && self.retry_delay == other.retry_delay
            && self.refetch_on_window_focus == other.refetch_on_window_focus
            && self.stale_time == other.stale_time
            && self.extensions == other.extensions
    }
}

fn describe<T>(setting: &Setting<T>) -> &'static str {
    match setting {
        Setting::Absent => "absent",
        Setting::Cleared => "cleared",
        Setting::Value(_) => "set",
    }
}

impl<V> fmt::Debug for ConfigLayer<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigLayer")
            .field("query_fn", &describe(&self.query_fn))
            .field("on_success", &describe(&self.on_success))
            .field("on_error", &describe(&self.on_error))
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("refetch_on_window_focus", &self.refetch_on_window_focus)
            .field("stale_time", &self.stale_time)
            .field("extensions", &self.extensions)
            .finish()
    }
}

impl<V> ConfigLayer<V> {
    /// An empty layer: every field absent.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query_fn<Q>(mut self, f: Q) -> Self
    where
        Q: QueryFn<V> + 'static,
    {
        self.query_fn = Setting::Value(Arc::new(f));
        self
    }

    pub fn with_shared_query_fn(mut self, f: SharedQueryFn<V>) -> Self {
        self.query_fn = Setting::Value(f);
        self
    }

    pub fn clear_query_fn(mut self) -> Self {
        self.query_fn = Setting::Cleared;
        self
    }

    pub fn with_on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&V, &QueryKey) -> CallbackResult + Send + Sync + 'static,
    {
        self.on_success = Setting::Value(Arc::new(f));
        self
    }

    /// Suppress any outer `on_success` while this layer is active.
    pub fn clear_on_success(mut self) -> Self {
        self.on_success = Setting::Cleared;
        self
    }

    pub fn with_on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&FetchError, &QueryKey) -> CallbackResult + Send + Sync + 'static,
    {
        self.on_error = Setting::Value(Arc::new(f));
        self
    }

    pub fn clear_on_error(mut self) -> Self {
        self.on_error = Setting::Cleared;
        self
    }

    pub fn with_retry(mut self, retry: impl Into<Retry>) -> Self {
        self.retry = Setting::Value(retry.into());
        self
    }

    pub fn clear_retry(mut self) -> Self {
        self.retry = Setting::Cleared;
        self
    }

    pub fn with_retry_delay(mut self, delay: RetryDelay) -> Self {
        self.retry_delay = Setting::Value(delay);
        self
    }

    pub fn with_refetch_on_window_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_window_focus = Setting::Value(enabled);
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Setting::Value(stale_time);
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// `inner` shadows `self` field by field; absent fields fall through.
    pub fn overlay(&self, inner: &ConfigLayer<V>) -> ConfigLayer<V> {
        let mut extensions = self.extensions.clone();
        extensions.extend(inner.extensions.iter().map(|(k, v)| (k.clone(), v.clone())));

        ConfigLayer {
            query_fn: self.query_fn.overlay(&inner.query_fn),
            on_success: self.on_success.overlay(&inner.on_success),
            on_error: self.on_error.overlay(&inner.on_error),
            retry: self.retry.overlay(&inner.retry),
            retry_delay: self.retry_delay.overlay(&inner.retry_delay),
            refetch_on_window_focus: self
                .refetch_on_window_focus
                .overlay(&inner.refetch_on_window_focus),
            stale_time: self.stale_time.overlay(&inner.stale_time),
            extensions,
        }
    }
}

/// Fold layers outermost first.
pub fn merge<'a, V, I>(layers: I) -> ConfigLayer<V>
where
    V: 'a,
    I: IntoIterator<Item = &'a ConfigLayer<V>>,
{
    layers
        .into_iter()
        .fold(ConfigLayer::new(), |acc, layer| acc.overlay(layer))
}

/// Merge and apply built-in defaults.
pub fn resolve<'a, V, I>(layers: I) -> QueryConfig<V>
where
    V: 'a,
    I: IntoIterator<Item = &'a ConfigLayer<V>>,
{
    QueryConfig::from_layer(&merge(layers))
}

/// The effective configuration for one use (issue, retry, settlement).
///
/// Never stored; recomputed from the scope stack every time.
pub struct QueryConfig<V> {
    pub query_fn: Option<SharedQueryFn<V>>,
    /// `None` is the no-op callback.
    pub on_success: Option<SuccessCallback<V>>,
    pub on_error: Option<ErrorCallback>,
    pub retry: Arc<dyn RetryPolicy>,
    pub refetch_on_window_focus: bool,
    pub stale_time: Duration,
    pub extensions: BTreeMap<String, Value>,
}

impl<V> QueryConfig<V> {
    pub const DEFAULT_REFETCH_ON_WINDOW_FOCUS: bool = true;

    pub fn from_layer(layer: &ConfigLayer<V>) -> Self {
        let delay = layer
            .retry_delay
            .resolve_or(RetryDelay::default(), RetryDelay::Fixed(Duration::ZERO));
        let retry = match &layer.retry {
            Setting::Absent => Retry::default().into_policy(delay),
            Setting::Cleared => Arc::new(StandardRetry::never()),
            Setting::Value(retry) => retry.clone().into_policy(delay),
        };

        Self {
            query_fn: layer.query_fn.value().cloned(),
            on_success: layer.on_success.value().cloned(),
            on_error: layer.on_error.value().cloned(),
            retry,
            refetch_on_window_focus: layer
                .refetch_on_window_focus
                .resolve_or(Self::DEFAULT_REFETCH_ON_WINDOW_FOCUS, false),
            stale_time: layer.stale_time.resolve_or(Duration::ZERO, Duration::ZERO),
            extensions: layer
                .extensions
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn extension(&self, key: &str) -> Option<&Value> {
        self.extensions.get(key)
    }
}

impl<V> Default for QueryConfig<V> {
    fn default() -> Self {
        Self::from_layer(&ConfigLayer::new())
    }
}

impl<V> fmt::Debug for QueryConfig<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryConfig")
            .field("query_fn", &self.query_fn.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("retry", &self.retry)
            .field("refetch_on_window_focus", &self.refetch_on_window_focus)
            .field("stale_time", &self.stale_time)
            .field("extensions", &self.extensions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok(_: &String, _: &QueryKey) -> CallbackResult {
        Ok(())
    }

    #[test]
    fn test_defaults_apply_when_nothing_is_set() {
        let config: QueryConfig<String> = resolve(std::iter::empty());
        assert!(config.query_fn.is_none());
        assert!(config.on_success.is_none());
        assert!(config.refetch_on_window_focus);
        assert_eq!(config.stale_time, Duration::ZERO);
        let err = FetchError::msg("x");
        assert_eq!(config.retry.next_delay(1, &err), Some(Duration::from_secs(1)));
        assert_eq!(config.retry.next_delay(3, &err), Some(Duration::from_secs(4)));
        assert_eq!(config.retry.next_delay(4, &err), None);
    }

    #[test]
    fn test_absent_inner_field_falls_through() {
        let outer = ConfigLayer::<String>::new()
            .with_on_success(ok)
            .with_refetch_on_window_focus(false);
        let inner = ConfigLayer::<String>::new().with_retry(false);

        let config = resolve([&outer, &inner]);
        assert!(config.on_success.is_some());
        assert!(!config.refetch_on_window_focus);
        assert_eq!(config.retry.next_delay(1, &FetchError::msg("x")), None);
    }

    #[test]
    fn test_cleared_inner_field_overrides() {
        let outer = ConfigLayer::<String>::new()
            .with_on_success(ok)
            .with_query_fn(|_k: QueryKey| async { Ok::<_, FetchError>("outer".to_string()) });
        let inner = ConfigLayer::<String>::new().clear_on_success().clear_query_fn();

        let config = resolve([&outer, &inner]);
        assert!(config.on_success.is_none());
        assert!(config.query_fn.is_none());
    }

    #[test]
    fn test_cleared_retry_disables_retry() {
        let outer = ConfigLayer::<String>::new().with_retry(5u32);
        let inner = ConfigLayer::<String>::new().clear_retry();
        let config = resolve([&outer, &inner]);
        assert_eq!(config.retry.next_delay(1, &FetchError::msg("x")), None);
    }

    #[test]
    fn test_retry_delay_combines_with_outer_retry_count() {
        let outer = ConfigLayer::<String>::new().with_retry(1u32);
        let inner = ConfigLayer::<String>::new()
            .with_retry_delay(RetryDelay::Fixed(Duration::from_millis(20)));
        let config = resolve([&outer, &inner]);
        let err = FetchError::msg("x");
        assert_eq!(config.retry.next_delay(1, &err), Some(Duration::from_millis(20)));
        assert_eq!(config.retry.next_delay(2, &err), None);
    }

    #[test]
    fn test_extensions_merge_and_null_removes() {
        let outer = ConfigLayer::<String>::new()
            .with_extension("suspense", json!(true))
            .with_extension("tag", json!("outer"));
        let inner = ConfigLayer::<String>::new()
            .with_extension("tag", json!("inner"))
            .with_extension("suspense", Value::Null);

        let config = resolve([&outer, &inner]);
        assert_eq!(config.extension("tag"), Some(&json!("inner")));
        assert_eq!(config.extension("suspense"), None);
    }

    #[test]
    fn test_merge_is_left_fold() {
        let a = ConfigLayer::<String>::new().with_on_success(ok).with_retry(2u32);
        let b = ConfigLayer::<String>::new().clear_on_success();
        let c = ConfigLayer::<String>::new().with_stale_time(Duration::from_secs(5));

        let nested = merge([&merge([&a, &b]), &c]);
        let flat = merge([&a, &b, &c]);
        assert_eq!(nested, flat);
        assert!(flat.on_success.is_cleared());
        assert_eq!(flat.retry, Setting::Value(Retry::Count(2)));
    }

    #[test]
    fn test_merge_of_nothing_is_empty_layer() {
        let merged: ConfigLayer<String> = merge(std::iter::empty());
        assert_eq!(merged, ConfigLayer::new());
    }
}
