//! The query cache facade.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use strata_core::{
    CacheError, CallbackError, ConfigLayer, QueryKey, QueryNotification, QueryState,
    SharedQueryFn, StrataError, StrataResult,
};
use strata_scope::ScopeStack;
use tokio::sync::broadcast;

use crate::dispatcher::Dispatcher;
use crate::entry::{Begin, ExecutionFuture, Mode, QueryEntry};
use crate::execution::Execution;
use crate::subscription::{Subscriber, Subscription};
use crate::CacheConfig;

/// Options for [`QueryCache::clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearOptions {
    /// Send `Removed` to subscribers of every cleared entry.
    pub notify: bool,
}

impl Default for ClearOptions {
    fn default() -> Self {
        Self { notify: true }
    }
}

impl ClearOptions {
    pub fn silent() -> Self {
        Self { notify: false }
    }
}

enum Start<V> {
    Pending(ExecutionFuture<V>),
    Fresh(V),
}

/// Keyed async-result cache with request deduplication.
///
/// Cloning is cheap; clones share entries, scopes, and the error channel.
/// Configuration for every issue, retry, and settlement is resolved from
/// [`QueryCache::scopes`] at that moment, never captured up front.
pub struct QueryCache<V> {
    entries: Arc<RwLock<HashMap<QueryKey, Arc<QueryEntry<V>>>>>,
    scopes: ScopeStack<V>,
    dispatcher: Dispatcher<V>,
    config: CacheConfig,
}

impl<V> Clone for QueryCache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            scopes: self.scopes.clone(),
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
        }
    }
}

impl<V> fmt::Debug for QueryCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.entries.read().map(|e| e.len()).ok())
            .field("scopes", &self.scopes)
            .field("config", &self.config)
            .finish()
    }
}

impl<V> Default for QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(ScopeStack::new())
    }
}

impl<V> QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// A cache over `scopes` with default settings.
    pub fn new(scopes: ScopeStack<V>) -> Self {
        Self::build(scopes, CacheConfig::default())
    }

    pub fn with_config(scopes: ScopeStack<V>, config: CacheConfig) -> StrataResult<Self> {
        config.validate()?;
        Ok(Self::build(scopes, config))
    }

    fn build(scopes: ScopeStack<V>, config: CacheConfig) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            dispatcher: Dispatcher::new(scopes.clone(), config.error_channel_capacity),
            scopes,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The stack every resolution reads from.
    pub fn scopes(&self) -> &ScopeStack<V> {
        &self.scopes
    }

    /// Failures of `on_success`, `on_error`, and subscriber callbacks.
    pub fn callback_errors(&self) -> broadcast::Receiver<CallbackError> {
        self.dispatcher.subscribe_errors()
    }

    fn read_entries(&self) -> StrataResult<RwLockReadGuard<'_, HashMap<QueryKey, Arc<QueryEntry<V>>>>> {
        self.entries
            .read()
            .map_err(|_| CacheError::LockPoisoned { resource: "entry map" }.into())
    }

    fn write_entries(&self) -> StrataResult<RwLockWriteGuard<'_, HashMap<QueryKey, Arc<QueryEntry<V>>>>> {
        self.entries
            .write()
            .map_err(|_| CacheError::LockPoisoned { resource: "entry map" }.into())
    }

    fn entry(&self, key: &QueryKey) -> StrataResult<Option<Arc<QueryEntry<V>>>> {
        Ok(self.read_entries()?.get(key).cloned())
    }

    fn entry_or_insert(&self, key: &QueryKey) -> StrataResult<Arc<QueryEntry<V>>> {
        if let Some(entry) = self.entry(key)? {
            return Ok(entry);
        }
        let mut entries = self.write_entries()?;
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(QueryEntry::new(key.clone())));
        Ok(Arc::clone(entry))
    }

    fn snapshot_entries(&self) -> StrataResult<Vec<Arc<QueryEntry<V>>>> {
        Ok(self.read_entries()?.values().cloned().collect())
    }

    fn start(
        &self,
        entry: &Arc<QueryEntry<V>>,
        mode: Mode,
        fetch_fn: Option<SharedQueryFn<V>>,
        options: Option<Arc<ConfigLayer<V>>>,
    ) -> StrataResult<Start<V>> {
        let config = self.scopes.resolve(options.as_deref())?;
        let begin = entry.begin(mode, fetch_fn, options, &config, |plan| {
            Execution {
                entry: Arc::clone(entry),
                plan,
                scopes: self.scopes.clone(),
                dispatcher: self.dispatcher.clone(),
            }
            .launch()
        })?;

        Ok(match begin {
            Begin::Joined(future) => Start::Pending(future),
            Begin::Fresh(value) => {
                tracing::debug!(key = %entry.key(), "Serving fresh cached data");
                Start::Fresh(value)
            }
            Begin::Started(future) => {
                self.dispatcher.flush(entry)?;
                Start::Pending(future)
            }
        })
    }

    /// Resolve `key`, joining an in-flight execution if there is one.
    ///
    /// `fetch_fn` wins over the effective default query function; `options`
    /// is layered innermost for every resolution this request makes.
    pub async fn fetch_query(
        &self,
        key: impl Into<QueryKey>,
        fetch_fn: Option<SharedQueryFn<V>>,
        options: Option<ConfigLayer<V>>,
    ) -> StrataResult<V> {
        let key = key.into();
        let entry = self.entry_or_insert(&key)?;
        match self.start(&entry, Mode::Join, fetch_fn, options.map(Arc::new))? {
            Start::Fresh(value) => Ok(value),
            Start::Pending(future) => future.await,
        }
    }

    /// Like [`fetch_query`](Self::fetch_query) but only warms the cache.
    ///
    /// A failing fetch is logged and left on the entry; only bookkeeping
    /// errors and a missing fetch function are returned.
    pub async fn prefetch_query(
        &self,
        key: impl Into<QueryKey>,
        fetch_fn: Option<SharedQueryFn<V>>,
        options: Option<ConfigLayer<V>>,
    ) -> StrataResult<()> {
        let key = key.into();
        match self.fetch_query(key.clone(), fetch_fn, options).await {
            Ok(_) => Ok(()),
            Err(StrataError::Cache(CacheError::FetchExecution { source, .. })) => {
                tracing::debug!(%key, error = %source, "Prefetch failed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Cached data if there is any, fetched otherwise.
    pub async fn ensure_query_data(
        &self,
        key: impl Into<QueryKey>,
        fetch_fn: Option<SharedQueryFn<V>>,
        options: Option<ConfigLayer<V>>,
    ) -> StrataResult<V> {
        let key = key.into();
        if let Some(data) = self.get_query_data(&key)? {
            return Ok(data);
        }
        self.fetch_query(key, fetch_fn, options).await
    }

    /// Start a new execution regardless of cached or in-flight state.
    ///
    /// Uses the last fetch function recorded for the key, falling back to
    /// the effective default. Without `options` the last options are reused.
    pub async fn refetch(
        &self,
        key: impl Into<QueryKey>,
        options: Option<ConfigLayer<V>>,
    ) -> StrataResult<V> {
        let key = key.into();
        let entry = self.entry_or_insert(&key)?;
        let options = match options {
            Some(layer) => Some(Arc::new(layer)),
            None => entry.last_options()?,
        };
        match self.start(&entry, Mode::Restart, None, options)? {
            Start::Fresh(value) => Ok(value),
            Start::Pending(future) => future.await,
        }
    }

    pub fn get_query_data(&self, key: impl Into<QueryKey>) -> StrataResult<Option<V>> {
        match self.entry(&key.into())? {
            Some(entry) => entry.data(),
            None => Ok(None),
        }
    }

    pub fn get_query_state(&self, key: impl Into<QueryKey>) -> StrataResult<Option<QueryState<V>>> {
        match self.entry(&key.into())? {
            Some(entry) => entry.snapshot().map(Some),
            None => Ok(None),
        }
    }

    /// Write `value` as if a fetch had succeeded, without running callbacks.
    pub fn set_query_data(&self, key: impl Into<QueryKey>, value: V) -> StrataResult<()> {
        let key = key.into();
        let entry = self.entry_or_insert(&key)?;
        entry.write(value)?;
        tracing::debug!(%key, "Wrote query data");
        self.dispatcher.flush(&entry)
    }

    /// Mark `key` stale. Returns `false` if there is no such entry.
    pub fn invalidate(&self, key: impl Into<QueryKey>) -> StrataResult<bool> {
        let key = key.into();
        let Some(entry) = self.entry(&key)? else {
            return Ok(false);
        };
        let refresh = entry.invalidate()?;
        tracing::debug!(%key, refresh, "Invalidated query");
        self.dispatcher.flush(&entry)?;

        if refresh && self.config.refresh_on_invalidate {
            let options = entry.last_options()?;
            self.start_background(&entry, options)?;
        }
        Ok(true)
    }

    /// Kick off a refresh nobody awaits. Failures settle on the entry.
    fn start_background(
        &self,
        entry: &Arc<QueryEntry<V>>,
        options: Option<Arc<ConfigLayer<V>>>,
    ) -> StrataResult<bool> {
        match self.start(entry, Mode::Restart, None, options) {
            Ok(_) => Ok(true),
            Err(StrataError::Cache(
                e @ (CacheError::MissingFetchFunction { .. } | CacheError::RuntimeUnavailable { .. }),
            )) => {
                tracing::debug!(key = %entry.key(), error = %e, "Skipping background refresh");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop one entry. Subscribers receive `Removed`.
    pub fn remove_query(&self, key: impl Into<QueryKey>) -> StrataResult<bool> {
        let key = key.into();
        let Some(entry) = self.write_entries()?.remove(&key) else {
            return Ok(false);
        };
        entry.mark_removed(true)?;
        tracing::debug!(%key, "Removed query");
        self.dispatcher.flush(&entry)?;
        Ok(true)
    }

    /// Drop every entry. In-flight executions finish but write nothing.
    pub fn clear(&self, options: ClearOptions) -> StrataResult<usize> {
        let drained: Vec<_> = self.write_entries()?.drain().collect();
        let count = drained.len();

        for (_, entry) in drained {
            entry.mark_removed(options.notify)?;
            self.dispatcher.flush(&entry)?;
        }
        tracing::debug!(count, notify = options.notify, "Cleared query cache");
        Ok(count)
    }

    /// Refetch subscribed, stale, idle-in-flight entries whose effective
    /// configuration enables focus refetching. Returns how many started.
    pub fn on_window_focus(&self) -> StrataResult<usize> {
        let mut started = 0;
        for entry in self.snapshot_entries()? {
            if !entry.has_subscribers()? || entry.is_fetching()? {
                continue;
            }
            let options = entry.last_options()?;
            let config = self.scopes.resolve(options.as_deref())?;
            if !config.refetch_on_window_focus || !entry.snapshot()?.is_stale(config.stale_time) {
                continue;
            }
            if self.start_background(&entry, options)? {
                started += 1;
            }
        }
        tracing::debug!(started, "Window focus refetch");
        Ok(started)
    }

    /// Observe every transition of `key` until unsubscribed.
    ///
    /// Notifications for one key arrive in transition order on every
    /// runtime flavor, possibly on whichever thread is delivering.
    pub fn subscribe<F>(&self, key: impl Into<QueryKey>, callback: F) -> StrataResult<Subscription>
    where
        F: Fn(&QueryNotification<V>) + Send + Sync + 'static,
    {
        let key = key.into();
        let entry = self.entry_or_insert(&key)?;
        let subscription = Subscription::new(key);
        entry.add_subscriber(Subscriber {
            id: subscription.id(),
            callback: Arc::new(callback),
        })?;
        Ok(subscription)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> StrataResult<bool> {
        match self.entry(subscription.key())? {
            Some(entry) => entry.remove_subscriber(subscription.id()),
            None => Ok(false),
        }
    }

    pub fn len(&self) -> StrataResult<usize> {
        Ok(self.read_entries()?.len())
    }

    pub fn is_empty(&self) -> StrataResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn is_fetching(&self, key: impl Into<QueryKey>) -> StrataResult<bool> {
        match self.entry(&key.into())? {
            Some(entry) => entry.is_fetching(),
            None => Ok(false),
        }
    }

    /// Keys currently held, in canonical order.
    pub fn keys(&self) -> StrataResult<Vec<QueryKey>> {
        let mut keys: Vec<_> = self.read_entries()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
