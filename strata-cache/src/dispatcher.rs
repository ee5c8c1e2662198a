//! Delivers queued transitions to subscribers and settlements to callbacks.
//!
//! Deliveries for one entry go out strictly in transition order. Whoever
//! claims an entry's outbox delivers for everyone; a concurrent or
//! re-entrant caller returns at once and the current owner picks up what
//! it queued.
//!
//! Settlement order is fixed: subscribers see the new state first, then
//! configuration is resolved from the scope stack as it stands right now,
//! then exactly one of `on_success` / `on_error` runs. A callback that errors
//! or panics is reported on the error channel and never reaches the caller
//! of the query.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use strata_core::{
    CallbackError, CallbackKind, CallbackResult, QueryKey, QueryNotification, StrataResult,
};
use strata_scope::ScopeStack;
use tokio::sync::broadcast;

use crate::entry::{Delivery, Outcome, QueryEntry, Settled};
use crate::subscription::Subscriber;

pub(crate) struct Dispatcher<V> {
    scopes: ScopeStack<V>,
    errors: broadcast::Sender<CallbackError>,
}

impl<V> Clone for Dispatcher<V> {
    fn clone(&self) -> Self {
        Self {
            scopes: self.scopes.clone(),
            errors: self.errors.clone(),
        }
    }
}

impl<V: Clone> Dispatcher<V> {
    pub(crate) fn new(scopes: ScopeStack<V>, error_capacity: usize) -> Self {
        let (errors, _) = broadcast::channel(error_capacity.max(1));
        Self { scopes, errors }
    }

    pub(crate) fn subscribe_errors(&self) -> broadcast::Receiver<CallbackError> {
        self.errors.subscribe()
    }

    /// Deliver everything queued on `entry`.
    pub(crate) fn flush(&self, entry: &QueryEntry<V>) -> StrataResult<()> {
        if !entry.claim_outbox()? {
            return Ok(());
        }
        while let Some(delivery) = entry.next_delivery()? {
            self.deliver(entry.key(), delivery);
        }
        Ok(())
    }

    fn deliver(&self, key: &QueryKey, delivery: Delivery<V>) {
        self.notify(key, &delivery.subscribers, &delivery.notification);
        if let Some(settled) = delivery.settled {
            self.settle(key, settled);
        }
    }

    fn notify(&self, key: &QueryKey, subscribers: &[Subscriber<V>], notification: &QueryNotification<V>) {
        for subscriber in subscribers {
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(notification)));
            if let Err(panic) = outcome {
                self.report(CallbackError {
                    key: key.clone(),
                    kind: CallbackKind::Subscriber,
                    message: panic_message(panic.as_ref()),
                });
            }
        }
    }

    /// Resolve now, then run the one matching lifecycle callback.
    fn settle(&self, key: &QueryKey, settled: Settled<V>) {
        let config = match self.scopes.resolve(settled.options.as_deref()) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(%key, error = %e, "Could not resolve settlement configuration");
                return;
            }
        };
        match &settled.outcome {
            Outcome::Success(value) => {
                if let Some(on_success) = &config.on_success {
                    self.guard(key, CallbackKind::OnSuccess, || on_success(value, key));
                }
            }
            Outcome::Failure(error) => {
                if let Some(on_error) = &config.on_error {
                    self.guard(key, CallbackKind::OnError, || on_error(error, key));
                }
            }
        }
    }

    fn guard(&self, key: &QueryKey, kind: CallbackKind, callback: impl FnOnce() -> CallbackResult) {
        let message = match catch_unwind(AssertUnwindSafe(callback)) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };
        self.report(CallbackError {
            key: key.clone(),
            kind,
            message,
        });
    }

    fn report(&self, error: CallbackError) {
        tracing::error!(
            key = %error.key,
            kind = %error.kind,
            message = %error.message,
            "Callback failed"
        );
        // No receivers is fine; the failure is already logged.
        let _ = self.errors.send(error);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
