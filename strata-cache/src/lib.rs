//! STRATA Cache - Scoped Query Cache
//!
//! [`QueryCache`] maps [`QueryKey`]s to entries. Concurrent requests for a
//! key share one execution; the fetch function runs once and every caller
//! receives its outcome. Retry decisions and lifecycle callbacks are looked
//! up in the cache's [`ScopeStack`] when they are needed, so scopes entered
//! or exited while a request is in flight change what happens at settlement.
//!
//! ```no_run
//! use strata_cache::QueryCache;
//! use strata_core::{ConfigLayer, FetchError, QueryKey};
//! use strata_scope::ScopeStack;
//!
//! # async fn demo() -> strata_core::StrataResult<()> {
//! let scopes = ScopeStack::with_base(
//!     ConfigLayer::new().with_query_fn(|key: QueryKey| async move {
//!         Ok::<_, FetchError>(format!("value for {key}"))
//!     }),
//! );
//! let cache = QueryCache::new(scopes);
//!
//! let _quiet = cache.scopes().scope(ConfigLayer::new().clear_retry())?;
//! let value = cache.fetch_query("todos", None, None).await?;
//! assert_eq!(cache.get_query_data("todos")?, Some(value));
//! # Ok(())
//! # }
//! ```
//!
//! [`QueryKey`]: strata_core::QueryKey
//! [`ScopeStack`]: strata_scope::ScopeStack

mod cache;
mod config;
mod dispatcher;
mod entry;
mod execution;
mod subscription;

pub use cache::{ClearOptions, QueryCache};
pub use config::CacheConfig;
pub use subscription::{Subscription, SubscriberFn};
