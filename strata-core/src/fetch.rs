//! The fetch-function seam and the error it produces.

use async_trait::async_trait;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::QueryKey;

/// Failure reported by a user fetch function.
///
/// Wraps the original error behind an `Arc` so it can be shared between
/// every caller attached to the same execution and handed to callbacks
/// unchanged. Use [`FetchError::downcast_ref`] to get the original back.
#[derive(Clone)]
pub struct FetchError {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

impl FetchError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// A failure that only carries a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }

    /// True when both values wrap the very same underlying error.
    pub fn same_as(&self, other: &FetchError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FetchError").field(&self.inner).finish()
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for FetchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

/// Produces the value for a key. Supplied by the caller or by a scope.
///
/// Closures `Fn(QueryKey) -> impl Future<Output = Result<V, FetchError>>`
/// implement this trait directly.
#[async_trait]
pub trait QueryFn<V>: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> Result<V, FetchError>;
}

#[async_trait]
impl<V, F, Fut> QueryFn<V> for F
where
    V: Send + 'static,
    F: Fn(QueryKey) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
{
    async fn fetch(&self, key: &QueryKey) -> Result<V, FetchError> {
        (self)(key.clone()).await
    }
}

/// Shared, type-erased fetch function.
pub type SharedQueryFn<V> = Arc<dyn QueryFn<V>>;

/// Wrap a closure or [`QueryFn`] implementation for use with the cache.
pub fn query_fn<V, Q>(f: Q) -> SharedQueryFn<V>
where
    Q: QueryFn<V> + 'static,
{
    Arc::new(f)
}
