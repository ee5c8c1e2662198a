//! STRATA Test Utilities
//!
//! Shared test infrastructure for the STRATA workspace:
//! - Controllable fetchers (counting, failing, flaky, gated)
//! - A recorder for lifecycle callbacks and subscriber notifications
//! - Proptest generators for keys and option documents
//! - Fixtures and assertions for common scenarios

// Re-export core types for convenience
pub use strata_core::{
    query_fn, CacheError, CallbackResult, ConfigLayer, FetchError, QueryFn, QueryKey,
    QueryNotification, QueryOptions, QueryState, QueryStatus, RetryOption, ScopeOptions, Setting,
    SharedQueryFn, StrataError, StrataResult,
};
pub use strata_scope::ScopeStack;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Install a test-writer subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to debug output from the STRATA crates.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("strata_cache=debug,strata_scope=debug,warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MOCK FETCHERS
// ============================================================================

/// Returns a fixed value and counts invocations.
#[derive(Debug, Clone)]
pub struct CountingFetcher<V> {
    value: V,
    calls: Arc<AtomicUsize>,
    keys: Arc<Mutex<Vec<QueryKey>>>,
}

impl<V: Clone + Send + Sync + 'static> CountingFetcher<V> {
    pub fn new(value: V) -> Self {
        Self {
            value,
            calls: Arc::new(AtomicUsize::new(0)),
            keys: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Keys passed to the fetcher, in call order.
    pub fn seen_keys(&self) -> Vec<QueryKey> {
        lock(&self.keys).clone()
    }

    pub fn shared(&self) -> SharedQueryFn<V> {
        query_fn(self.clone())
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> QueryFn<V> for CountingFetcher<V> {
    async fn fetch(&self, key: &QueryKey) -> Result<V, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.keys).push(key.clone());
        Ok(self.value.clone())
    }
}

/// Always fails with the same message.
#[derive(Debug, Clone)]
pub struct FailingFetcher {
    message: String,
    calls: Arc<AtomicUsize>,
}

impl FailingFetcher {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn shared<V: Send + 'static>(&self) -> SharedQueryFn<V> {
        query_fn(self.clone())
    }
}

#[async_trait]
impl<V: Send + 'static> QueryFn<V> for FailingFetcher {
    async fn fetch(&self, _key: &QueryKey) -> Result<V, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FetchError::msg(self.message.clone()))
    }
}

/// Fails the first `failures` calls, then succeeds.
#[derive(Debug, Clone)]
pub struct FlakyFetcher<V> {
    failures: usize,
    value: V,
    calls: Arc<AtomicUsize>,
}

impl<V: Clone + Send + Sync + 'static> FlakyFetcher<V> {
    pub fn new(failures: usize, value: V) -> Self {
        Self {
            failures,
            value,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn shared(&self) -> SharedQueryFn<V> {
        query_fn(self.clone())
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> QueryFn<V> for FlakyFetcher<V> {
    async fn fetch(&self, _key: &QueryKey) -> Result<V, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(FetchError::msg(format!("flaky failure {call}")))
        } else {
            Ok(self.value.clone())
        }
    }
}

type Gate<V> = oneshot::Sender<Result<V, FetchError>>;

/// Every call blocks until the test releases it, oldest first.
#[derive(Debug)]
pub struct GatedFetcher<V> {
    pending: Arc<Mutex<VecDeque<Gate<V>>>>,
    calls: Arc<AtomicUsize>,
}

impl<V> Clone for GatedFetcher<V> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<V: Send + Sync + 'static> Default for GatedFetcher<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + Sync + 'static> GatedFetcher<V> {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls currently blocked.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Yield until at least `n` calls have started.
    pub async fn wait_for_calls(&self, n: usize) {
        while self.calls() < n {
            tokio::task::yield_now().await;
        }
    }

    /// Let the oldest blocked call succeed. `false` if none was blocked.
    pub fn release(&self, value: V) -> bool {
        self.open(Ok(value))
    }

    /// Let the newest blocked call succeed, leaving older ones blocked.
    pub fn release_last(&self, value: V) -> bool {
        let gate = lock(&self.pending).pop_back();
        match gate {
            Some(gate) => gate.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    /// Let the oldest blocked call fail.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.open(Err(FetchError::msg(message.into())))
    }

    fn open(&self, outcome: Result<V, FetchError>) -> bool {
        let gate = lock(&self.pending).pop_front();
        match gate {
            Some(gate) => gate.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn shared(&self) -> SharedQueryFn<V> {
        query_fn(self.clone())
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> QueryFn<V> for GatedFetcher<V> {
    async fn fetch(&self, _key: &QueryKey) -> Result<V, FetchError> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).push_back(tx);
        self.calls.fetch_add(1, Ordering::SeqCst);
        rx.await
            .unwrap_or_else(|_| Err(FetchError::msg("gate dropped")))
    }
}

// ============================================================================
// CALLBACK RECORDER
// ============================================================================

/// Collects everything the cache tells the outside world.
#[derive(Debug)]
pub struct CallbackRecorder<V> {
    successes: Arc<Mutex<Vec<(QueryKey, V)>>>,
    errors: Arc<Mutex<Vec<(QueryKey, String)>>>,
    notifications: Arc<Mutex<Vec<QueryNotification<V>>>>,
}

impl<V> Clone for CallbackRecorder<V> {
    fn clone(&self) -> Self {
        Self {
            successes: Arc::clone(&self.successes),
            errors: Arc::clone(&self.errors),
            notifications: Arc::clone(&self.notifications),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Default for CallbackRecorder<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> CallbackRecorder<V> {
    pub fn new() -> Self {
        Self {
            successes: Arc::new(Mutex::new(Vec::new())),
            errors: Arc::new(Mutex::new(Vec::new())),
            notifications: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn on_success(&self) -> impl Fn(&V, &QueryKey) -> CallbackResult + Send + Sync + 'static {
        let successes = Arc::clone(&self.successes);
        move |value: &V, key: &QueryKey| {
            lock(&successes).push((key.clone(), value.clone()));
            Ok(())
        }
    }

    pub fn on_error(&self) -> impl Fn(&FetchError, &QueryKey) -> CallbackResult + Send + Sync + 'static {
        let errors = Arc::clone(&self.errors);
        move |error: &FetchError, key: &QueryKey| {
            lock(&errors).push((key.clone(), error.to_string()));
            Ok(())
        }
    }

    pub fn subscriber(&self) -> impl Fn(&QueryNotification<V>) + Send + Sync + 'static {
        let notifications = Arc::clone(&self.notifications);
        move |notification: &QueryNotification<V>| {
            lock(&notifications).push(notification.clone());
        }
    }

    /// A layer carrying both lifecycle callbacks.
    pub fn layer(&self) -> ConfigLayer<V> {
        ConfigLayer::new()
            .with_on_success(self.on_success())
            .with_on_error(self.on_error())
    }

    pub fn successes(&self) -> Vec<(QueryKey, V)> {
        lock(&self.successes).clone()
    }

    pub fn errors(&self) -> Vec<(QueryKey, String)> {
        lock(&self.errors).clone()
    }

    pub fn notifications(&self) -> Vec<QueryNotification<V>> {
        lock(&self.notifications).clone()
    }

    /// Status carried by each notification; `None` for removals.
    pub fn statuses(&self) -> Vec<Option<QueryStatus>> {
        lock(&self.notifications)
            .iter()
            .map(|n| n.state().map(|s| s.status))
            .collect()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and option documents.

    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;
    use std::fmt::Debug;

    /// One scalar key segment.
    pub fn arb_key_part() -> impl Strategy<Value = Value> {
        prop_oneof![
            "[a-z]{1,8}".prop_map(Value::from),
            any::<i32>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
        ]
    }

    pub fn arb_query_key() -> impl Strategy<Value = QueryKey> {
        prop::collection::vec(arb_key_part(), 1..4).prop_map(|parts| QueryKey::new(Value::Array(parts)))
    }

    pub fn arb_setting<T, S>(inner: S) -> impl Strategy<Value = Setting<T>>
    where
        T: Debug + Clone + 'static,
        S: Strategy<Value = T> + 'static,
    {
        prop_oneof![
            Just(Setting::Absent),
            Just(Setting::Cleared),
            inner.prop_map(Setting::Value),
        ]
    }

    pub fn arb_retry_option() -> impl Strategy<Value = RetryOption> {
        prop_oneof![
            any::<bool>().prop_map(RetryOption::Enabled),
            (0u32..10).prop_map(RetryOption::Count),
        ]
    }

    /// Valid `queries` sections, without extensions.
    pub fn arb_query_options() -> impl Strategy<Value = QueryOptions> {
        (
            arb_setting(arb_retry_option()),
            arb_setting(0u64..5_000),
            arb_setting(any::<bool>()),
            arb_setting(0u64..600_000),
        )
            .prop_map(|(retry, retry_delay, refetch_on_window_focus, stale_time)| QueryOptions {
                retry,
                retry_delay,
                refetch_on_window_focus,
                stale_time,
                extensions: Default::default(),
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built stacks and layers for common scenarios.

    use super::*;

    /// Answers every key with `"{prefix}:{key}"`.
    pub fn echo_query_fn(prefix: &'static str) -> SharedQueryFn<String> {
        query_fn(move |key: QueryKey| async move {
            Ok::<_, FetchError>(format!("{prefix}:{}", key.canonical()))
        })
    }

    /// A layer that resolves queries with `fetcher` and never retries.
    pub fn no_retry_layer<V>(fetcher: SharedQueryFn<V>) -> ConfigLayer<V> {
        ConfigLayer::new()
            .with_shared_query_fn(fetcher)
            .with_retry(false)
    }

    /// A stack whose base layer answers with [`echo_query_fn`].
    pub fn echo_stack(prefix: &'static str) -> ScopeStack<String> {
        ScopeStack::with_base(no_retry_layer(echo_query_fn(prefix)))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for STRATA results and states.

    use super::*;

    #[track_caller]
    pub fn assert_status<V>(state: &QueryState<V>, expected: QueryStatus) {
        assert_eq!(
            state.status, expected,
            "Expected status {:?} for {}, got {:?}",
            expected, state.key, state.status
        );
    }

    /// Assert that a result failed because the fetch function failed.
    #[track_caller]
    pub fn assert_fetch_failed<T: std::fmt::Debug>(result: &StrataResult<T>, message: &str) {
        match result {
            Err(StrataError::Cache(CacheError::FetchExecution { source, .. })) => {
                assert_eq!(source.to_string(), message, "Wrong fetch error");
            }
            other => panic!("Expected FetchExecution error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_missing_fetch_function<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(e) if e.is_missing_fetch_function() => {}
            other => panic!("Expected MissingFetchFunction, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_counting_fetcher_records_keys() {
        let fetcher = CountingFetcher::new(5u32);
        let shared = fetcher.shared();
        assert_eq!(shared.fetch(&QueryKey::from("a")).await.unwrap(), 5);
        assert_eq!(shared.fetch(&QueryKey::from("b")).await.unwrap(), 5);
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(fetcher.seen_keys(), vec![QueryKey::from("a"), QueryKey::from("b")]);
    }

    #[tokio::test]
    async fn test_flaky_fetcher_recovers() {
        let fetcher = FlakyFetcher::new(2, "ok");
        let key = QueryKey::from("k");
        assert!(fetcher.fetch(&key).await.is_err());
        assert!(fetcher.fetch(&key).await.is_err());
        assert_eq!(fetcher.fetch(&key).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_gated_fetcher_releases_in_order() {
        let fetcher = GatedFetcher::<u32>::new();
        let first = tokio::spawn({
            let f = fetcher.clone();
            async move { f.fetch(&QueryKey::from("a")).await }
        });
        fetcher.wait_for_calls(1).await;
        assert_eq!(fetcher.pending(), 1);
        assert!(fetcher.release(1));
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert!(!fetcher.release(2));
    }

    #[test]
    fn test_recorder_layer_records_both_callbacks() {
        let recorder = CallbackRecorder::<u32>::new();
        let config = strata_core::resolve([&recorder.layer()]);
        let key = QueryKey::from("k");

        (config.on_success.as_ref().unwrap())(&3, &key).unwrap();
        (config.on_error.as_ref().unwrap())(&FetchError::msg("x"), &key).unwrap();

        assert_eq!(recorder.successes(), vec![(key.clone(), 3)]);
        assert_eq!(recorder.errors(), vec![(key, "x".to_string())]);
    }

    proptest! {
        #[test]
        fn prop_generated_options_are_valid(options in generators::arb_query_options()) {
            prop_assert!(options.validate().is_ok());
            prop_assert!(options.into_layer::<u32>().is_ok());
        }
    }
}
