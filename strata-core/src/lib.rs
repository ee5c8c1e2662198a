//! STRATA Core - Shared Types
//!
//! Pure data structures and pure functions used by every other crate in the
//! workspace. Nothing in here spawns tasks or holds locks.
//!
//! - [`QueryKey`]: canonical, hashable cache keys
//! - [`Setting`]: the absent / cleared / value tri-state
//! - [`ConfigLayer`] and [`merge`]/[`resolve`]: the configuration merger
//! - [`RetryPolicy`]: pluggable "retry, and after how long" decisions
//! - [`ScopeOptions`]: serde-loadable option documents
//! - [`QueryState`]: entry snapshots handed to subscribers

pub mod config;
pub mod error;
pub mod fetch;
pub mod identity;
pub mod key;
pub mod options;
pub mod retry;
pub mod setting;
pub mod state;

pub use config::{
    merge, resolve, CallbackResult, ConfigLayer, ErrorCallback, QueryConfig, SuccessCallback,
};
pub use error::{
    CacheError, CallbackError, CallbackKind, ConfigError, MismatchReason, ScopeError,
    StrataError, StrataResult,
};
pub use fetch::{query_fn, FetchError, QueryFn, SharedQueryFn};
pub use identity::{ScopeHandle, SubscriptionId, Timestamp};
pub use key::QueryKey;
pub use options::{QueryOptions, RetryOption, ScopeOptions};
pub use retry::{ExponentialBackoff, Retry, RetryDelay, RetryPolicy, StandardRetry};
pub use setting::Setting;
pub use state::{QueryNotification, QueryState, QueryStatus};
