//! STRATA Scope - Dynamically-Scoped Configuration
//!
//! A [`ScopeStack`] is a shared, ordered list of [`ConfigLayer`]s. Entering a
//! scope appends a layer and returns a [`ScopeHandle`]; exiting removes
//! exactly that layer. Whoever needs configuration asks the stack at the
//! moment of use, so a request issued under one set of scopes may settle
//! under another.
//!
//! Scopes form branches: a scope entered with [`ScopeStack::enter_child`]
//! must exit before its parent, while unrelated branches exit in any order.
//!
//! [`ConfigLayer`]: strata_core::ConfigLayer
//! [`ScopeHandle`]: strata_core::ScopeHandle

mod guard;
mod stack;

pub use guard::ScopeGuard;
pub use stack::ScopeStack;
