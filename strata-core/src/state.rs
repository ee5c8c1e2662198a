//! Entry status and the snapshots handed to subscribers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{FetchError, QueryKey, Timestamp};

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryStatus {
    /// Created but never executed.
    Idle,
    /// An execution is in flight (including retry backoff).
    Loading,
    /// The last settled execution succeeded.
    Success,
    /// The last settled execution failed after exhausting retries.
    Error,
}

impl QueryStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// Point-in-time copy of an entry.
#[derive(Debug, Clone)]
pub struct QueryState<V> {
    pub key: QueryKey,
    pub status: QueryStatus,
    /// Last successful value; kept when a later execution fails.
    pub data: Option<V>,
    /// Last error; cleared by the next success.
    pub error: Option<FetchError>,
    /// Failures of the current (or last) execution.
    pub failure_count: u32,
    pub data_updated_at: Option<Timestamp>,
    pub error_updated_at: Option<Timestamp>,
    pub is_invalidated: bool,
}

impl<V> QueryState<V> {
    pub fn idle(key: QueryKey) -> Self {
        Self {
            key,
            status: QueryStatus::Idle,
            data: None,
            error: None,
            failure_count: 0,
            data_updated_at: None,
            error_updated_at: None,
            is_invalidated: false,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// Stale when there is no data, the entry was invalidated, or the data
    /// is older than `stale_time`.
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        if self.is_invalidated {
            return true;
        }
        match self.data_updated_at {
            None => true,
            Some(updated) => {
                let age = Utc::now()
                    .signed_duration_since(updated)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                age >= stale_time
            }
        }
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum QueryNotification<V> {
    /// The entry transitioned; carries the new state.
    Updated(QueryState<V>),
    /// The entry was removed from the cache.
    Removed(QueryKey),
}

impl<V> QueryNotification<V> {
    pub fn key(&self) -> &QueryKey {
        match self {
            Self::Updated(state) => &state.key,
            Self::Removed(key) => key,
        }
    }

    pub fn state(&self) -> Option<&QueryState<V>> {
        match self {
            Self::Updated(state) => Some(state),
            Self::Removed(_) => None,
        }
    }
}
