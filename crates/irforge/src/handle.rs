//! Shared handle plumbing
//!
//! Every public object is a cheap-to-clone handle carrying a
//! `valid | error` state next to a reference to its implementation
//! record. Owners hold the strong `Rc`; handles that must not keep an
//! implementation alive (types, modules, functions, sections) hold a
//! `Weak` and degrade to an error when the owner is gone.

use std::cell::Cell;
use std::rc::{Rc, Weak};

use crate::error::{ErrorContext, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleState {
    Valid,
    Error,
}

/// Weak back-reference handle used by cursor-owned objects.
pub(crate) struct WeakHandle<T> {
    state: Cell<HandleState>,
    inner: Weak<T>,
}

impl<T> WeakHandle<T> {
    pub fn valid(inner: &Rc<T>) -> Self {
        WeakHandle { state: Cell::new(HandleState::Valid), inner: Rc::downgrade(inner) }
    }

    pub fn null() -> Self {
        WeakHandle { state: Cell::new(HandleState::Error), inner: Weak::new() }
    }

    pub fn mark_error(&self) {
        self.state.set(HandleState::Error);
    }

    pub fn is_marked(&self) -> bool {
        self.state.get() == HandleState::Error
    }

    /// Marked state or a latched thread error both count.
    pub fn has_error(&self) -> bool {
        self.is_marked() || ErrorContext::has_error()
    }

    /// Upgrade without touching the error log.
    pub fn get(&self) -> Option<Rc<T>> {
        if self.is_marked() {
            None
        } else {
            self.inner.upgrade()
        }
    }

    /// Upgrade; an expired owner records `what already deleted` and marks
    /// this handle. A handle already in error stays silent.
    pub fn get_or_error(&self, kind: ErrorKind, what: &str) -> Option<Rc<T>> {
        if self.has_error() {
            return None;
        }
        match self.inner.upgrade() {
            Some(rc) => Some(rc),
            None => {
                ErrorContext::push_error(kind, format!("{} already deleted", what), file!(), line!());
                self.mark_error();
                None
            }
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self.inner.upgrade(), other.inner.upgrade()) {
            (Some(a), Some(b)) => Rc::ptr_eq(&a, &b),
            _ => false,
        }
    }

    pub fn downgrade_clone(&self) -> Weak<T> {
        self.inner.clone()
    }
}

impl<T> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        WeakHandle { state: Cell::new(self.state.get()), inner: self.inner.clone() }
    }
}

/// Owning handle used where the handle itself keeps the record alive
/// (cursors, value-graph nodes, runtime objects).
pub(crate) struct StrongHandle<T> {
    state: Cell<HandleState>,
    inner: Option<Rc<T>>,
}

impl<T> StrongHandle<T> {
    pub fn valid(inner: Rc<T>) -> Self {
        StrongHandle { state: Cell::new(HandleState::Valid), inner: Some(inner) }
    }

    pub fn null() -> Self {
        StrongHandle { state: Cell::new(HandleState::Error), inner: None }
    }

    pub fn mark_error(&self) {
        self.state.set(HandleState::Error);
    }

    pub fn is_marked(&self) -> bool {
        self.state.get() == HandleState::Error
    }

    pub fn has_error(&self) -> bool {
        self.is_marked() || ErrorContext::has_error()
    }

    pub fn get(&self) -> Option<&Rc<T>> {
        if self.is_marked() {
            None
        } else {
            self.inner.as_ref()
        }
    }

    /// Access regardless of the thread error flag; the per-handle mark
    /// still gates it. Used by operations that must stay readable while
    /// an unrelated error is latched (equality, null checks).
    pub fn raw(&self) -> Option<&Rc<T>> {
        self.inner.as_ref()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self.inner.as_ref(), other.inner.as_ref()) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<T> Clone for StrongHandle<T> {
    fn clone(&self) -> Self {
        StrongHandle { state: Cell::new(self.state.get()), inner: self.inner.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_handle_degrades_after_owner_drop() {
        ErrorContext::clear_error();
        let owner = Rc::new(7u32);
        let h = WeakHandle::valid(&owner);
        assert!(h.get().is_some());
        drop(owner);
        assert!(h.get().is_none());
        assert!(h.get_or_error(ErrorKind::Function, "function").is_none());
        assert!(h.is_marked());
        assert!(ErrorContext::has_error());
        ErrorContext::clear_error();
    }

    #[test]
    fn test_handle_equality_is_identity() {
        let a = Rc::new(1u32);
        let b = Rc::new(1u32);
        let ha = WeakHandle::valid(&a);
        let ha2 = WeakHandle::valid(&a);
        let hb = WeakHandle::valid(&b);
        assert!(ha.ptr_eq(&ha2));
        assert!(!ha.ptr_eq(&hb));
    }
}
