//! Error types for STRATA operations

use crate::{FetchError, QueryKey, ScopeHandle};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a scope exit was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchReason {
    /// The handle was never entered, or has already exited.
    NotPresent,
    /// Nested scopes opened under this handle are still active.
    HasLiveChildren { children: usize },
}

impl fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPresent => f.write_str("handle is not on the scope stack"),
            Self::HasLiveChildren { children } => {
                write!(f, "{children} nested scope(s) must exit first")
            }
        }
    }
}

/// Scope stack errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("Scope mismatch for {handle}: {reason}")]
    ScopeMismatch {
        handle: ScopeHandle,
        reason: MismatchReason,
    },

    #[error("Scope stack lock poisoned")]
    LockPoisoned,
}

/// Query cache errors.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("No fetch function available for query {key}")]
    MissingFetchFunction { key: QueryKey },

    #[error("Fetch failed for query {key}: {source}")]
    FetchExecution {
        key: QueryKey,
        #[source]
        source: FetchError,
    },

    #[error("Execution for query {key} aborted: {reason}")]
    ExecutionAborted { key: QueryKey, reason: String },

    #[error("No async runtime available to execute query {key}")]
    RuntimeUnavailable { key: QueryKey },

    #[error("Cache lock poisoned: {resource}")]
    LockPoisoned { resource: &'static str },
}

/// Configuration document errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse {format} configuration: {reason}")]
    Parse { format: &'static str, reason: String },
}

/// Which user callback failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallbackKind {
    OnSuccess,
    OnError,
    Subscriber,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OnSuccess => "on_success",
            Self::OnError => "on_error",
            Self::Subscriber => "subscriber",
        };
        f.write_str(name)
    }
}

/// A user callback returned an error or panicked.
///
/// Never returned from cache operations; delivered on the cache's
/// callback-error channel instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} callback failed for query {key}: {message}")]
pub struct CallbackError {
    pub key: QueryKey,
    pub kind: CallbackKind,
    pub message: String,
}

/// Master error type for all STRATA errors.
#[derive(Debug, Clone, Error)]
pub enum StrataError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Scope error: {0}")]
    Scope(#[from] ScopeError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl StrataError {
    /// The user fetch error behind a failed execution, if that is what this is.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            Self::Cache(CacheError::FetchExecution { source, .. }) => Some(source),
            _ => None,
        }
    }

    pub fn is_missing_fetch_function(&self) -> bool {
        matches!(self, Self::Cache(CacheError::MissingFetchFunction { .. }))
    }

    pub fn is_scope_mismatch(&self) -> bool {
        matches!(self, Self::Scope(ScopeError::ScopeMismatch { .. }))
    }
}

/// Result type alias for STRATA operations.
pub type StrataResult<T> = Result<T, StrataError>;

// =============================================================================
// TESTS
// =============================================================================
