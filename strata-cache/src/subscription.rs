//! Subscriber bookkeeping.

use std::fmt;
use std::sync::Arc;

use strata_core::{QueryKey, QueryNotification, SubscriptionId};

/// Callback invoked on every transition of the subscribed entry.
pub type SubscriberFn<V> = Arc<dyn Fn(&QueryNotification<V>) + Send + Sync>;

/// Handle returned by [`QueryCache::subscribe`](crate::QueryCache::subscribe).
///
/// Dropping it does not unsubscribe; pass it to
/// [`QueryCache::unsubscribe`](crate::QueryCache::unsubscribe).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: SubscriptionId,
    key: QueryKey,
}

impl Subscription {
    pub(crate) fn new(key: QueryKey) -> Self {
        Self {
            id: SubscriptionId::new(),
            key,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

pub(crate) struct Subscriber<V> {
    pub(crate) id: SubscriptionId,
    pub(crate) callback: SubscriberFn<V>,
}

impl<V> Clone for Subscriber<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<V> fmt::Debug for Subscriber<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}
