//! RAII scopes.

use std::sync::Arc;

use strata_core::{ConfigLayer, ScopeHandle, StrataResult};

use crate::ScopeStack;

/// Exits its scope when dropped.
///
/// Nested guards created with [`ScopeGuard::nested`] are ordinary locals, so
/// normal drop order already exits children before parents. A failed exit
/// during drop is logged; call [`ScopeGuard::close`] to observe it instead.
#[must_use = "the scope exits as soon as the guard is dropped"]
pub struct ScopeGuard<V> {
    stack: ScopeStack<V>,
    handle: ScopeHandle,
    closed: bool,
}

impl<V> ScopeGuard<V> {
    pub(crate) fn new(stack: ScopeStack<V>, handle: ScopeHandle) -> Self {
        Self {
            stack,
            handle,
            closed: false,
        }
    }

    pub fn handle(&self) -> ScopeHandle {
        self.handle
    }

    /// Open a child scope under this one.
    pub fn nested(&self, layer: impl Into<Arc<ConfigLayer<V>>>) -> StrataResult<ScopeGuard<V>> {
        let handle = self.stack.enter_child(self.handle, layer)?;
        Ok(ScopeGuard::new(self.stack.clone(), handle))
    }

    /// Exit now and report the outcome.
    pub fn close(mut self) -> StrataResult<()> {
        self.closed = true;
        self.stack.exit(self.handle)
    }
}

impl<V> Drop for ScopeGuard<V> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.stack.exit(self.handle) {
            tracing::warn!(handle = %self.handle, error = %e, "Scope guard failed to exit scope");
        }
    }
}
