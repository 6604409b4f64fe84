//! Variable frames
//!
//! A thread-local chain of frames holding named bindings. Pointer
//! bindings (`mk_ptr`) are stack slots: `set` on such a name emits a
//! store, reading it emits a load. Plain value bindings shadow through
//! the chain. Exactly one frame is active; pushing a frame deactivates
//! its parent.

use rustc_hash::FxHashMap;
use std::cell::RefCell;

use crate::error::{fn_guard, push_error};
use crate::types::TypeInfo;
use crate::value::ValueInfo;

struct Frame {
    ptrs: FxHashMap<String, ValueInfo>,
    values: FxHashMap<String, ValueInfo>,
    parent: Option<Box<Frame>>,
    active: bool,
}

impl Frame {
    fn new(parent: Option<Box<Frame>>) -> Box<Frame> {
        Box::new(Frame { ptrs: FxHashMap::default(), values: FxHashMap::default(), parent, active: true })
    }

    fn try_get_ptr(&self, name: &str) -> ValueInfo {
        if let Some(p) = self.ptrs.get(name) {
            return p.clone();
        }
        match &self.parent {
            Some(parent) => parent.try_get_ptr(name),
            None => ValueInfo::null(),
        }
    }

    fn try_get_value(&self, name: &str) -> ValueInfo {
        let ptr = self.try_get_ptr(name);
        if !ptr.is_null() {
            return ptr.load();
        }
        if let Some(v) = self.values.get(name) {
            return v.clone();
        }
        match &self.parent {
            Some(parent) => parent.try_get_value(name),
            None => {
                push_error!(ValueError, "value not found: {}", name);
                ValueInfo::null()
            }
        }
    }
}

/// Thread-local stack of variable frames.
pub(crate) struct VariableStack {
    head: Option<Box<Frame>>,
    depth: u32,
}

thread_local! {
    static STACK: RefCell<VariableStack> = RefCell::new(VariableStack::new());
}

impl VariableStack {
    fn new() -> Self {
        // Starts with one implicit frame.
        VariableStack { head: Some(Frame::new(None)), depth: 1 }
    }

    pub fn with<R>(f: impl FnOnce(&mut VariableStack) -> R) -> R {
        STACK.with(|s| f(&mut s.borrow_mut()))
    }

    pub fn push_context(&mut self) {
        let parent = self.head.take();
        if let Some(p) = &parent {
            debug_assert!(p.active);
        }
        let mut parent = parent;
        if let Some(p) = parent.as_mut() {
            p.active = false;
        }
        self.head = Some(Frame::new(parent));
        self.depth += 1;
    }

    pub fn pop_context(&mut self) {
        if self.depth == 0 {
            return;
        }
        if let Some(head) = self.head.take() {
            self.head = head.parent;
            self.depth -= 1;
            if let Some(h) = self.head.as_mut() {
                h.active = true;
            }
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn mk_ptr(&mut self, name: &str, ty: &TypeInfo, default_value: Option<&ValueInfo>) {
        fn_guard!();
        let Some(head) = self.head.as_mut() else {
            return;
        };
        let ptr = ValueInfo::mk_pointer(ty);
        if ptr.has_error() {
            return;
        }
        head.ptrs.insert(name.to_string(), ptr.clone());
        if let Some(v) = default_value {
            ptr.store(v);
        }
    }

    /// Store through an existing pointer binding, or bind the value in
    /// the active frame.
    pub fn set(&mut self, name: &str, v: &ValueInfo) {
        fn_guard!();
        let Some(head) = self.head.as_mut() else {
            return;
        };
        let ptr = head.try_get_ptr(name);
        if ptr.is_null() {
            head.values.insert(name.to_string(), v.clone());
        } else {
            ptr.store(v);
        }
    }

    pub fn try_get_ptr(&self, name: &str) -> ValueInfo {
        match &self.head {
            Some(head) => head.try_get_ptr(name),
            None => ValueInfo::null(),
        }
    }

    pub fn try_get_value(&self, name: &str) -> ValueInfo {
        match &self.head {
            Some(head) => head.try_get_value(name),
            None => ValueInfo::null(),
        }
    }

    pub fn dump(&self, w: &mut dyn std::io::Write) {
        let _ = writeln!(w, "variable stack ({} frames):", self.depth);
        let mut frame = self.head.as_deref();
        let mut level = 0;
        while let Some(f) = frame {
            let mut ptrs: Vec<&String> = f.ptrs.keys().collect();
            let mut values: Vec<&String> = f.values.keys().collect();
            ptrs.sort();
            values.sort();
            let _ = writeln!(w, "  {} ptr:{:?} values:{:?}", level, ptrs, values);
            frame = f.parent.as_deref();
            level += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_keeps_single_active_frame() {
        VariableStack::with(|s| {
            let base = s.depth();
            s.push_context();
            assert_eq!(s.depth(), base + 1);
            assert!(s.head.as_ref().unwrap().active);
            assert!(!s.head.as_ref().unwrap().parent.as_ref().unwrap().active);
            s.pop_context();
            assert_eq!(s.depth(), base);
            assert!(s.head.as_ref().unwrap().active);
        });
    }

    #[test]
    fn test_pop_on_empty_stack_is_noop() {
        VariableStack::with(|s| {
            let base = s.depth();
            for _ in 0..(base + 3) {
                s.pop_context();
            }
            assert_eq!(s.depth(), 0);
            s.pop_context();
            assert_eq!(s.depth(), 0);
            // Restore the implicit frame for other tests on this thread.
            s.push_context();
        });
    }

    #[test]
    fn test_value_binding_shadows_through_chain() {
        crate::error::ErrorContext::clear_error();
        VariableStack::with(|s| {
            // Null values short-circuit stores, so chain lookup of plain
            // bindings is observable even without a cursor.
            let v = ValueInfo::null();
            s.push_context();
            s.head.as_mut().unwrap().values.insert("x".to_string(), v.clone());
            assert!(s.head.as_ref().unwrap().values.contains_key("x"));
            s.push_context();
            assert!(!s.head.as_ref().unwrap().values.contains_key("x"));
            s.pop_context();
            s.pop_context();
        });
        crate::error::ErrorContext::clear_error();
    }
}
