//! One execution of a fetch function, retries included.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use strata_core::{CacheError, FetchError, StrataResult};
use strata_scope::ScopeStack;
use tokio::runtime::Handle;

use crate::dispatcher::{panic_message, Dispatcher};
use crate::entry::{ExecutionFuture, Plan, QueryEntry};

pub(crate) struct Execution<V> {
    pub(crate) entry: Arc<QueryEntry<V>>,
    pub(crate) plan: Plan<V>,
    pub(crate) scopes: ScopeStack<V>,
    pub(crate) dispatcher: Dispatcher<V>,
}

impl<V> Execution<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Spawn onto the current runtime and return the shared handle.
    ///
    /// The task runs to completion even if every caller stops waiting.
    pub(crate) fn launch(self) -> StrataResult<ExecutionFuture<V>> {
        let key = self.entry.key().clone();
        let runtime = Handle::try_current()
            .map_err(|_| CacheError::RuntimeUnavailable { key: key.clone() })?;

        let entry = Arc::clone(&self.entry);
        let dispatcher = self.dispatcher.clone();
        let options = self.plan.options.clone();
        let seq = self.plan.seq;
        let task_key = key.clone();
        let task = runtime.spawn(async move {
            match AssertUnwindSafe(self.run()).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    tracing::error!(key = %task_key, seq, %reason, "Query execution panicked");
                    if entry.abort(seq, &reason, options)? {
                        dispatcher.flush(&entry)?;
                    }
                    Err(CacheError::ExecutionAborted {
                        key: task_key,
                        reason,
                    }
                    .into())
                }
            }
        });

        Ok(async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(CacheError::ExecutionAborted {
                    key,
                    reason: e.to_string(),
                }
                .into()),
            }
        }
        .boxed()
        .shared())
    }

    async fn run(self) -> StrataResult<V> {
        let Execution {
            entry,
            plan,
            scopes,
            dispatcher,
        } = self;
        let key = entry.key().clone();
        let seq = plan.seq;
        let mut failures = 0u32;

        loop {
            tracing::debug!(%key, seq, attempt = failures + 1, "Fetching query");

            // A panicking fetch function is a failed attempt like any other.
            let attempt = AssertUnwindSafe(plan.query_fn.fetch(&key))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(FetchError::msg(format!(
                        "fetch function {}",
                        panic_message(panic.as_ref())
                    )))
                });

            let error = match attempt {
                Ok(value) => {
                    if entry.settle_success(seq, value.clone(), plan.options.clone())? {
                        dispatcher.flush(&entry)?;
                    } else {
                        tracing::debug!(%key, seq, "Discarding superseded result");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            failures += 1;
            // Retry policy comes from whatever scopes are active now.
            let config = scopes.resolve(plan.options.as_deref())?;
            if let Some(delay) = config.retry.next_delay(failures, &error) {
                if !entry.record_retry(seq, failures)? {
                    tracing::debug!(%key, seq, "Execution superseded, abandoning retries");
                    return Err(CacheError::FetchExecution { key, source: error }.into());
                }
                dispatcher.flush(&entry)?;
                tracing::warn!(
                    %key,
                    seq,
                    failures,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Query failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if entry.settle_error(seq, error.clone(), failures, plan.options.clone())? {
                tracing::warn!(%key, seq, failures, error = %error, "Query failed");
                dispatcher.flush(&entry)?;
            } else {
                tracing::debug!(%key, seq, "Discarding superseded failure");
            }
            return Err(CacheError::FetchExecution { key, source: error }.into());
        }
    }
}
