//! Namespaces and event functions
//!
//! After the JIT binds, each namespace is a directory of callable events
//! (and, for the global namespace, runtime struct shapes). An event is
//! initialized by resolving its canonical symbol through the JIT and
//! invoked against a frozen object.

use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::error::{fn_guard, push_error, ErrorContext};
use crate::handle::StrongHandle;
use crate::jit::{JitInner, RawEventFn};
use crate::types::TypeInfo;

use super::object::Object;
use super::shape::Struct;

pub(crate) struct EventFnInner {
    runner: Weak<JitInner>,
    symbol: String,
    fn_ptr: Cell<usize>,
    init: Cell<bool>,
}

/// A JIT-resolved event entry point.
pub struct EventFn {
    h: StrongHandle<EventFnInner>,
}

impl Clone for EventFn {
    fn clone(&self) -> Self {
        EventFn { h: self.h.clone() }
    }
}

impl PartialEq for EventFn {
    fn eq(&self, other: &Self) -> bool {
        if self.h.is_marked() && other.h.is_marked() {
            return true;
        }
        self.h.ptr_eq(&other.h)
    }
}

impl EventFn {
    pub(crate) fn create(runner: Weak<JitInner>, symbol: &str) -> EventFn {
        let inner = Rc::new(EventFnInner {
            runner,
            symbol: symbol.to_string(),
            fn_ptr: Cell::new(0),
            init: Cell::new(false),
        });
        EventFn { h: StrongHandle::valid(inner) }
    }

    pub fn null() -> EventFn {
        EventFn { h: StrongHandle::null() }
    }

    pub fn has_error(&self) -> bool {
        self.h.has_error()
    }

    pub fn is_null(&self) -> bool {
        self.h.is_marked()
    }

    fn get(&self) -> Option<&Rc<EventFnInner>> {
        self.h.raw().filter(|_| !self.h.is_marked())
    }

    pub fn symbol(&self) -> String {
        self.get().map(|e| e.symbol.clone()).unwrap_or_default()
    }

    pub fn is_init(&self) -> bool {
        self.get().map(|e| e.init.get()).unwrap_or(false)
    }

    /// Resolve the symbol address through the owning JIT.
    pub fn init(&self) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        let Some(inner) = self.get() else {
            return;
        };
        if inner.init.get() {
            return;
        }
        let Some(runner) = inner.runner.upgrade() else {
            push_error!(Jit, "jit runner gone while initializing event: {}", inner.symbol);
            return;
        };
        if let Some(ptr) = runner.symbol_address(&inner.symbol) {
            inner.fn_ptr.set(ptr as usize);
        }
        inner.init.set(true);
    }

    /// Invoke the event against a frozen object and return its result.
    pub fn on_event(&self, o: &Object) -> i32 {
        fn_guard!();
        if self.has_error() {
            push_error!(Jit, "can't run an invalid event");
            return -1;
        }
        if o.has_error() {
            push_error!(Jit, "can't run an event on an invalid object");
            return -1;
        }
        if ErrorContext::has_error() {
            push_error!(Jit, "can't run an event with outstanding errors");
            return -1;
        }
        if !o.is_frozen() {
            push_error!(Jit, "can't use an object that is not frozen yet");
            return -1;
        }
        let Some(inner) = self.get() else {
            return -1;
        };
        if !inner.init.get() {
            push_error!(Jit, "event not initialized: {}", inner.symbol);
            return -1;
        }
        if inner.runner.upgrade().is_none() {
            push_error!(Jit, "jit runner gone, event no longer callable: {}", inner.symbol);
            return -1;
        }
        let raw = inner.fn_ptr.get();
        if raw == 0 {
            push_error!(Jit, "event has no resolved address: {}", inner.symbol);
            return -1;
        }
        let f = unsafe { std::mem::transmute::<usize, RawEventFn>(raw) };
        unsafe { f(o.ref_ptr()) }
    }
}

pub(crate) struct NamespaceInner {
    runner: Weak<JitInner>,
    name: String,
    global: bool,
    structs: RefCell<FxHashMap<String, Struct>>,
    events: RefCell<FxHashMap<String, EventFn>>,
    bind: Cell<bool>,
}

/// A post-bind directory of events; the global namespace additionally
/// holds custom struct shapes.
pub struct Namespace {
    h: StrongHandle<NamespaceInner>,
}

impl Clone for Namespace {
    fn clone(&self) -> Self {
        Namespace { h: self.h.clone() }
    }
}

impl PartialEq for Namespace {
    fn eq(&self, other: &Self) -> bool {
        if self.h.is_marked() && other.h.is_marked() {
            return true;
        }
        self.h.ptr_eq(&other.h)
    }
}

impl Namespace {
    pub(crate) fn create(runner: Weak<JitInner>, name: &str) -> Namespace {
        let inner = Rc::new(NamespaceInner {
            runner,
            name: name.to_string(),
            global: name.is_empty(),
            structs: RefCell::new(FxHashMap::default()),
            events: RefCell::new(FxHashMap::default()),
            bind: Cell::new(false),
        });
        Namespace { h: StrongHandle::valid(inner) }
    }

    pub fn null() -> Namespace {
        Namespace { h: StrongHandle::null() }
    }

    pub fn has_error(&self) -> bool {
        self.h.has_error()
    }

    pub fn is_null(&self) -> bool {
        self.h.is_marked()
    }

    fn get(&self) -> Option<&Rc<NamespaceInner>> {
        self.h.raw().filter(|_| !self.h.is_marked())
    }

    fn mark_error(&self) {
        self.h.mark_error();
    }

    pub fn name(&self) -> String {
        self.get().map(|n| n.name.clone()).unwrap_or_default()
    }

    pub fn is_global(&self) -> bool {
        self.get().map(|n| n.global).unwrap_or(false)
    }

    pub fn is_bind(&self) -> bool {
        self.get().map(|n| n.bind.get()).unwrap_or(false)
    }

    /// Initialize every event; binding twice is a JIT error.
    pub fn bind(&self) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        let Some(inner) = self.get() else {
            return;
        };
        if inner.bind.get() {
            push_error!(Jit, "namespace already bound: {}", inner.name);
            self.mark_error();
            return;
        }
        for event in inner.events.borrow().values() {
            event.init();
        }
        inner.bind.set(true);
    }

    pub(crate) fn add_struct(&self, struct_type: &TypeInfo) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if struct_type.has_error() || !struct_type.is_struct() {
            push_error!(Jit, "can't add an invalid struct to a namespace");
            return;
        }
        let Some(inner) = self.get() else {
            return;
        };
        if inner.bind.get() {
            push_error!(Jit, "namespace already bound, can't add more structs");
            return;
        }
        if !inner.global {
            push_error!(Jit, "custom structs belong to the global namespace");
            return;
        }
        let name = struct_type.struct_name();
        let shape = Struct::from_type(struct_type);
        let mut structs = inner.structs.borrow_mut();
        if structs.contains_key(&name) {
            push_error!(Jit, "duplicate struct name found: {}", name);
            self.mark_error();
            return;
        }
        structs.insert(name, shape);
    }

    pub(crate) fn add_event(&self, short_name: &str, full_name: &str) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if short_name.is_empty() {
            push_error!(Jit, "can't add an event with an empty name");
            return;
        }
        let Some(inner) = self.get() else {
            return;
        };
        if inner.bind.get() {
            push_error!(Jit, "namespace already bound, can't add more events");
            return;
        }
        inner
            .events
            .borrow_mut()
            .entry(short_name.to_string())
            .or_insert_with(|| EventFn::create(inner.runner.clone(), full_name));
    }

    pub fn struct_info(&self, name: &str) -> Struct {
        fn_guard!();
        if self.has_error() || name.is_empty() {
            return Struct::null();
        }
        self.get()
            .and_then(|n| n.structs.borrow().get(name).cloned())
            .unwrap_or_else(Struct::null)
    }

    pub fn event_fn_info(&self, name: &str) -> EventFn {
        fn_guard!();
        if self.has_error() || name.is_empty() {
            return EventFn::null();
        }
        self.get()
            .and_then(|n| n.events.borrow().get(name).cloned())
            .unwrap_or_else(EventFn::null)
    }
}
