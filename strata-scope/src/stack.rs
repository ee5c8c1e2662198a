//! The scope stack itself.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use strata_core::{
    resolve, ConfigLayer, MismatchReason, QueryConfig, ScopeError, ScopeHandle, StrataResult,
};

use crate::ScopeGuard;

struct Frame<V> {
    handle: ScopeHandle,
    parent: Option<ScopeHandle>,
    layer: Arc<ConfigLayer<V>>,
}

/// Shared stack of configuration layers.
///
/// Cloning is cheap and every clone sees the same stack. Each enter/exit is
/// one atomic mutation under a write lock; readers always see a whole stack.
pub struct ScopeStack<V> {
    /// Outermost layer that is always present and never exits.
    base: Option<Arc<ConfigLayer<V>>>,
    frames: Arc<RwLock<Vec<Frame<V>>>>,
}

impl<V> Clone for ScopeStack<V> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            frames: Arc::clone(&self.frames),
        }
    }
}

impl<V> Default for ScopeStack<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for ScopeStack<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeStack")
            .field("has_base", &self.base.is_some())
            .field("depth", &self.depth().ok())
            .finish()
    }
}

impl<V> ScopeStack<V> {
    pub fn new() -> Self {
        Self {
            base: None,
            frames: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// A stack whose outermost layer is `base` (the client-wide defaults).
    pub fn with_base(base: impl Into<Arc<ConfigLayer<V>>>) -> Self {
        Self {
            base: Some(base.into()),
            frames: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn base(&self) -> Option<&Arc<ConfigLayer<V>>> {
        self.base.as_ref()
    }

    fn read(&self) -> StrataResult<RwLockReadGuard<'_, Vec<Frame<V>>>> {
        self.frames
            .read()
            .map_err(|_| ScopeError::LockPoisoned.into())
    }

    fn write(&self) -> StrataResult<RwLockWriteGuard<'_, Vec<Frame<V>>>> {
        self.frames
            .write()
            .map_err(|_| ScopeError::LockPoisoned.into())
    }

    /// Enter a new top-level scope.
    pub fn enter(&self, layer: impl Into<Arc<ConfigLayer<V>>>) -> StrataResult<ScopeHandle> {
        let handle = ScopeHandle::new();
        let mut frames = self.write()?;
        frames.push(Frame {
            handle,
            parent: None,
            layer: layer.into(),
        });
        tracing::debug!(%handle, depth = frames.len(), "Entered scope");
        Ok(handle)
    }

    /// Enter a scope nested under `parent`; it must exit before `parent` can.
    pub fn enter_child(
        &self,
        parent: ScopeHandle,
        layer: impl Into<Arc<ConfigLayer<V>>>,
    ) -> StrataResult<ScopeHandle> {
        let handle = ScopeHandle::new();
        let mut frames = self.write()?;
        if !frames.iter().any(|f| f.handle == parent) {
            return Err(ScopeError::ScopeMismatch {
                handle: parent,
                reason: MismatchReason::NotPresent,
            }
            .into());
        }
        frames.push(Frame {
            handle,
            parent: Some(parent),
            layer: layer.into(),
        });
        tracing::debug!(%handle, %parent, depth = frames.len(), "Entered nested scope");
        Ok(handle)
    }

    /// Remove exactly the layer entered under `handle`.
    pub fn exit(&self, handle: ScopeHandle) -> StrataResult<()> {
        let mut frames = self.write()?;
        let Some(index) = frames.iter().position(|f| f.handle == handle) else {
            return Err(ScopeError::ScopeMismatch {
                handle,
                reason: MismatchReason::NotPresent,
            }
            .into());
        };

        let children = frames
            .iter()
            .filter(|f| f.parent == Some(handle))
            .count();
        if children > 0 {
            return Err(ScopeError::ScopeMismatch {
                handle,
                reason: MismatchReason::HasLiveChildren { children },
            }
            .into());
        }

        frames.remove(index);
        tracing::debug!(%handle, depth = frames.len(), "Exited scope");
        Ok(())
    }

    /// Enter a top-level scope that exits when the guard drops.
    pub fn scope(&self, layer: impl Into<Arc<ConfigLayer<V>>>) -> StrataResult<ScopeGuard<V>> {
        let handle = self.enter(layer)?;
        Ok(ScopeGuard::new(self.clone(), handle))
    }

    /// Snapshot of every active layer, outermost (base) first.
    pub fn current_layers(&self) -> StrataResult<Vec<Arc<ConfigLayer<V>>>> {
        let frames = self.read()?;
        let mut layers = Vec::with_capacity(frames.len() + 1);
        layers.extend(self.base.iter().cloned());
        layers.extend(frames.iter().map(|f| Arc::clone(&f.layer)));
        Ok(layers)
    }

    /// Effective configuration right now, with `innermost` applied last.
    pub fn resolve(&self, innermost: Option<&ConfigLayer<V>>) -> StrataResult<QueryConfig<V>> {
        let layers = self.current_layers()?;
        Ok(resolve(
            layers.iter().map(|l| l.as_ref()).chain(innermost),
        ))
    }

    /// Number of entered scopes (the base layer is not counted).
    pub fn depth(&self) -> StrataResult<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> StrataResult<bool> {
        Ok(self.depth()? == 0)
    }

    pub fn contains(&self, handle: ScopeHandle) -> StrataResult<bool> {
        Ok(self.read()?.iter().any(|f| f.handle == handle))
    }
}
