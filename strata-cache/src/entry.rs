//! Per-key entry and its state machine.
//!
//! ```text
//! Idle ──► Loading ──► Success
//!             │  ▲        │
//!             │  └ retry  │ refetch / invalidate
//!             ▼           ▼
//!           Error ─────► Loading
//! ```
//!
//! Every execution carries a sequence number. Only the execution whose
//! number is still current may write state; anything else is discarded.
//!
//! Each transition queues a [`Delivery`] on the entry's outbox while the
//! entry lock is held, so the queue order is the transition order. User
//! code never runs under the entry lock; the dispatcher drains the outbox
//! afterwards.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures_util::future::{BoxFuture, Shared};
use strata_core::{
    CacheError, ConfigLayer, FetchError, QueryConfig, QueryKey, QueryNotification, QueryState,
    QueryStatus, SharedQueryFn, StrataResult, SubscriptionId,
};

use crate::subscription::Subscriber;

/// Future shared by every caller attached to one execution.
pub(crate) type ExecutionFuture<V> = Shared<BoxFuture<'static, StrataResult<V>>>;

/// How a request treats an execution already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Attach to the in-flight execution if there is one.
    Join,
    /// Always start a new execution, superseding any in flight.
    Restart,
}

/// Everything an execution needs, decided at issue time.
pub(crate) struct Plan<V> {
    pub(crate) seq: u64,
    pub(crate) query_fn: SharedQueryFn<V>,
    pub(crate) options: Option<Arc<ConfigLayer<V>>>,
}

pub(crate) enum Begin<V> {
    /// Attached to an execution that was already running.
    Joined(ExecutionFuture<V>),
    /// Cached data is fresh enough; nothing was started.
    Fresh(V),
    /// A new execution was started and `Loading` was queued.
    Started(ExecutionFuture<V>),
}

/// What a settled execution produced.
pub(crate) enum Outcome<V> {
    Success(V),
    Failure(FetchError),
}

/// Settlement half of a delivery: selects `on_success` or `on_error`.
pub(crate) struct Settled<V> {
    pub(crate) outcome: Outcome<V>,
    pub(crate) options: Option<Arc<ConfigLayer<V>>>,
}

/// One queued transition.
pub(crate) struct Delivery<V> {
    pub(crate) notification: QueryNotification<V>,
    pub(crate) subscribers: Vec<Subscriber<V>>,
    pub(crate) settled: Option<Settled<V>>,
}

struct InFlight<V> {
    seq: u64,
    future: ExecutionFuture<V>,
}

struct EntryInner<V> {
    state: QueryState<V>,
    /// Last sequence number handed out.
    seq: u64,
    in_flight: Option<InFlight<V>>,
    last_fn: Option<SharedQueryFn<V>>,
    last_options: Option<Arc<ConfigLayer<V>>>,
    removed: bool,
    subscribers: Vec<Subscriber<V>>,
    outbox: VecDeque<Delivery<V>>,
    /// Someone is draining the outbox.
    draining: bool,
}

impl<V: Clone> EntryInner<V> {
    fn is_current(&self, seq: u64) -> bool {
        !self.removed && self.seq == seq
    }

    /// Queue the current state. Skipped when nobody would observe it.
    fn queue(&mut self, settled: Option<Settled<V>>) {
        if self.subscribers.is_empty() && settled.is_none() {
            return;
        }
        self.outbox.push_back(Delivery {
            notification: QueryNotification::Updated(self.state.clone()),
            subscribers: self.subscribers.clone(),
            settled,
        });
    }
}

pub(crate) struct QueryEntry<V> {
    key: QueryKey,
    inner: Mutex<EntryInner<V>>,
}

impl<V: Clone> QueryEntry<V> {
    pub(crate) fn new(key: QueryKey) -> Self {
        Self {
            inner: Mutex::new(EntryInner {
                state: QueryState::idle(key.clone()),
                seq: 0,
                in_flight: None,
                last_fn: None,
                last_options: None,
                removed: false,
                subscribers: Vec::new(),
                outbox: VecDeque::new(),
                draining: false,
            }),
            key,
        }
    }

    pub(crate) fn key(&self) -> &QueryKey {
        &self.key
    }

    fn lock(&self) -> StrataResult<MutexGuard<'_, EntryInner<V>>> {
        self.inner.lock().map_err(|_| {
            CacheError::LockPoisoned {
                resource: "query entry",
            }
            .into()
        })
    }

    pub(crate) fn snapshot(&self) -> StrataResult<QueryState<V>> {
        Ok(self.lock()?.state.clone())
    }

    pub(crate) fn data(&self) -> StrataResult<Option<V>> {
        Ok(self.lock()?.state.data.clone())
    }

    pub(crate) fn is_fetching(&self) -> StrataResult<bool> {
        Ok(self.lock()?.in_flight.is_some())
    }

    pub(crate) fn has_subscribers(&self) -> StrataResult<bool> {
        Ok(!self.lock()?.subscribers.is_empty())
    }

    pub(crate) fn last_options(&self) -> StrataResult<Option<Arc<ConfigLayer<V>>>> {
        Ok(self.lock()?.last_options.clone())
    }

    /// Join, short-circuit, or start an execution.
    ///
    /// `launch` spawns the execution for the plan; it runs under the entry
    /// lock, so it must not call back into this entry synchronously.
    pub(crate) fn begin(
        &self,
        mode: Mode,
        fetch_fn: Option<SharedQueryFn<V>>,
        options: Option<Arc<ConfigLayer<V>>>,
        config: &QueryConfig<V>,
        launch: impl FnOnce(Plan<V>) -> StrataResult<ExecutionFuture<V>>,
    ) -> StrataResult<Begin<V>> {
        let mut inner = self.lock()?;

        if mode == Mode::Join {
            if let Some(in_flight) = &inner.in_flight {
                tracing::debug!(key = %self.key, seq = in_flight.seq, "Joining in-flight execution");
                return Ok(Begin::Joined(in_flight.future.clone()));
            }
            if !config.stale_time.is_zero()
                && inner.state.is_success()
                && !inner.state.is_stale(config.stale_time)
            {
                if let Some(data) = &inner.state.data {
                    return Ok(Begin::Fresh(data.clone()));
                }
            }
        }

        let recorded = match mode {
            Mode::Restart => inner.last_fn.clone(),
            Mode::Join => None,
        };
        let query_fn = fetch_fn
            .or(recorded)
            .or_else(|| config.query_fn.clone())
            .ok_or_else(|| CacheError::MissingFetchFunction {
                key: self.key.clone(),
            })?;

        let seq = inner.seq + 1;
        let future = launch(Plan {
            seq,
            query_fn: Arc::clone(&query_fn),
            options: options.clone(),
        })?;

        if let Some(previous) = &inner.in_flight {
            tracing::debug!(key = %self.key, superseded = previous.seq, seq, "Superseding in-flight execution");
        }
        inner.seq = seq;
        inner.in_flight = Some(InFlight {
            seq,
            future: future.clone(),
        });
        inner.last_fn = Some(query_fn);
        inner.last_options = options;
        inner.state.status = QueryStatus::Loading;
        inner.state.failure_count = 0;
        // Queued before the spawned task can take the lock to settle.
        inner.queue(None);

        tracing::debug!(key = %self.key, seq, "Started execution");
        Ok(Begin::Started(future))
    }

    /// `Loading → Success`. `false` when the execution was superseded.
    pub(crate) fn settle_success(
        &self,
        seq: u64,
        value: V,
        options: Option<Arc<ConfigLayer<V>>>,
    ) -> StrataResult<bool> {
        let mut inner = self.lock()?;
        if !inner.is_current(seq) {
            return Ok(false);
        }
        inner.in_flight = None;
        let state = &mut inner.state;
        state.status = QueryStatus::Success;
        state.data = Some(value.clone());
        state.error = None;
        state.failure_count = 0;
        state.data_updated_at = Some(Utc::now());
        state.is_invalidated = false;
        inner.queue(Some(Settled {
            outcome: Outcome::Success(value),
            options,
        }));
        Ok(true)
    }

    /// `Loading → Loading`, counting one more failure.
    pub(crate) fn record_retry(&self, seq: u64, failure_count: u32) -> StrataResult<bool> {
        let mut inner = self.lock()?;
        if !inner.is_current(seq) {
            return Ok(false);
        }
        inner.state.failure_count = failure_count;
        inner.queue(None);
        Ok(true)
    }

    /// `Loading → Error`. Previously cached data is kept.
    pub(crate) fn settle_error(
        &self,
        seq: u64,
        error: FetchError,
        failure_count: u32,
        options: Option<Arc<ConfigLayer<V>>>,
    ) -> StrataResult<bool> {
        let mut inner = self.lock()?;
        if !inner.is_current(seq) {
            return Ok(false);
        }
        inner.in_flight = None;
        let state = &mut inner.state;
        state.status = QueryStatus::Error;
        state.error = Some(error.clone());
        state.failure_count = failure_count;
        state.error_updated_at = Some(Utc::now());
        inner.queue(Some(Settled {
            outcome: Outcome::Failure(error),
            options,
        }));
        Ok(true)
    }

    /// `Loading → Error` for an execution that died outside its fetch
    /// function. Settles like any other failure.
    pub(crate) fn abort(
        &self,
        seq: u64,
        reason: &str,
        options: Option<Arc<ConfigLayer<V>>>,
    ) -> StrataResult<bool> {
        let failure_count = self.lock()?.state.failure_count.saturating_add(1);
        let error = FetchError::msg(format!("execution aborted: {reason}"));
        self.settle_error(seq, error, failure_count, options)
    }

    /// Direct write; supersedes anything in flight. Runs no callbacks.
    pub(crate) fn write(&self, value: V) -> StrataResult<()> {
        let mut inner = self.lock()?;
        inner.seq += 1;
        inner.in_flight = None;
        let state = &mut inner.state;
        state.status = QueryStatus::Success;
        state.data = Some(value);
        state.error = None;
        state.failure_count = 0;
        state.data_updated_at = Some(Utc::now());
        state.is_invalidated = false;
        inner.queue(None);
        Ok(())
    }

    /// Mark stale. Returns whether a background refresh should start
    /// (someone is subscribed and nothing is in flight).
    pub(crate) fn invalidate(&self) -> StrataResult<bool> {
        let mut inner = self.lock()?;
        inner.state.is_invalidated = true;
        inner.queue(None);
        Ok(!inner.subscribers.is_empty() && inner.in_flight.is_none())
    }

    /// Detach from the cache. With `notify`, subscribers get `Removed`.
    pub(crate) fn mark_removed(&self, notify: bool) -> StrataResult<()> {
        let mut inner = self.lock()?;
        inner.removed = true;
        inner.in_flight = None;
        let subscribers = std::mem::take(&mut inner.subscribers);
        if notify && !subscribers.is_empty() {
            inner.outbox.push_back(Delivery {
                notification: QueryNotification::Removed(self.key.clone()),
                subscribers,
                settled: None,
            });
        }
        Ok(())
    }

    pub(crate) fn add_subscriber(&self, subscriber: Subscriber<V>) -> StrataResult<()> {
        self.lock()?.subscribers.push(subscriber);
        Ok(())
    }

    pub(crate) fn remove_subscriber(&self, id: SubscriptionId) -> StrataResult<bool> {
        let mut inner = self.lock()?;
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        Ok(inner.subscribers.len() != before)
    }

    /// Take ownership of the outbox. `false` if it is empty or another
    /// caller is already draining it.
    pub(crate) fn claim_outbox(&self) -> StrataResult<bool> {
        let mut inner = self.lock()?;
        if inner.draining || inner.outbox.is_empty() {
            return Ok(false);
        }
        inner.draining = true;
        Ok(true)
    }

    /// Next queued delivery for the owner. Releases ownership when empty.
    pub(crate) fn next_delivery(&self) -> StrataResult<Option<Delivery<V>>> {
        let mut inner = self.lock()?;
        let next = inner.outbox.pop_front();
        if next.is_none() {
            inner.draining = false;
        }
        Ok(next)
    }
}
