//! Just-in-time runner
//!
//! Takes bound cursors, packages their modules, lowers every function
//! into a `cranelift_jit::JITModule`, and routes public symbols into
//! runtime namespaces. `bind()` finalizes the generated code and then
//! binds namespaces in reverse insertion order, so leaf dependencies
//! initialize before their dependents.

pub mod optimize;

use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::FuncId;

use crate::backend::{isa, lowering};
use crate::cursor::{Cursor, CursorContext};
use crate::error::{fn_guard, push_error};
use crate::function::Function;
use crate::handle::StrongHandle;
use crate::module::PackagedModule;
use crate::runtime::Namespace;

use self::optimize::FunctionOptimizer;

/// ABI of every event entry point: `int32(void*)`.
pub type RawEventFn = unsafe extern "C" fn(*mut u8) -> i32;

pub(crate) struct JitInner {
    self_weak: Weak<JitInner>,
    module: RefCell<Option<JITModule>>,
    declared: RefCell<FxHashMap<String, FuncId>>,
    def_symbols: RefCell<Vec<String>>,
    decl_symbols: RefCell<Vec<String>>,
    ns_seq: RefCell<Vec<String>>,
    namespaces: RefCell<FxHashMap<String, Namespace>>,
    optimizer: RefCell<FunctionOptimizer>,
    bind: Cell<bool>,
}

impl JitInner {
    fn is_init(&self) -> bool {
        self.module.borrow().is_some()
    }

    /// Resolved host address of a finalized symbol; only valid after
    /// `bind`.
    pub(crate) fn symbol_address(&self, symbol: &str) -> Option<*const u8> {
        fn_guard!();
        if symbol.is_empty() {
            push_error!(Jit, "can't search an empty symbol");
            return None;
        }
        if !self.is_init() {
            push_error!(Jit, "jit not yet initialized for symbol: {}", symbol);
            return None;
        }
        if !self.bind.get() {
            push_error!(Jit, "jit not yet bound for symbol: {}", symbol);
            return None;
        }
        let known = self.def_symbols.borrow().iter().any(|s| s == symbol)
            || self.decl_symbols.borrow().iter().any(|s| s == symbol);
        if !known {
            push_error!(Jit, "symbol not found: {} (known: {:?})", symbol, self.def_symbols.borrow());
            return None;
        }
        let Some(&func_id) = self.declared.borrow().get(symbol) else {
            push_error!(Jit, "symbol was never defined: {}", symbol);
            return None;
        };
        let module = self.module.borrow();
        let ptr = module.as_ref()?.get_finalized_function(func_id);
        if ptr.is_null() {
            push_error!(Jit, "invalid address for symbol: {}", symbol);
            return None;
        }
        Some(ptr)
    }
}

/// Handle to the JIT runner. Construction requires a live cursor in
/// context.
pub struct JitRunner {
    h: StrongHandle<JitInner>,
}

impl Clone for JitRunner {
    fn clone(&self) -> Self {
        JitRunner { h: self.h.clone() }
    }
}

impl PartialEq for JitRunner {
    fn eq(&self, other: &Self) -> bool {
        if self.h.is_marked() && other.h.is_marked() {
            return true;
        }
        if self.h.is_marked() || other.h.is_marked() {
            return false;
        }
        self.h.ptr_eq(&other.h)
    }
}

impl Default for JitRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl JitRunner {
    pub fn new() -> JitRunner {
        fn_guard!();
        if !CursorContext::has_value() {
            push_error!(Jit, "jit runner requires a cursor in context");
            return JitRunner::null();
        }
        let host = match isa::host_isa() {
            Ok(isa) => isa,
            Err(e) => {
                push_error!(Jit, "failed to detect host target: {}", e);
                return JitRunner::null();
            }
        };
        let builder = JITBuilder::with_isa(host, cranelift_module::default_libcall_names());
        let module = JITModule::new(builder);
        let inner = Rc::new_cyclic(|weak: &Weak<JitInner>| JitInner {
            self_weak: weak.clone(),
            module: RefCell::new(Some(module)),
            declared: RefCell::new(FxHashMap::default()),
            def_symbols: RefCell::new(Vec::new()),
            decl_symbols: RefCell::new(Vec::new()),
            ns_seq: RefCell::new(Vec::new()),
            namespaces: RefCell::new(FxHashMap::default()),
            optimizer: RefCell::new(FunctionOptimizer::new()),
            bind: Cell::new(false),
        });
        JitRunner { h: StrongHandle::valid(inner) }
    }

    pub fn null() -> JitRunner {
        JitRunner { h: StrongHandle::null() }
    }

    pub fn has_error(&self) -> bool {
        self.h.has_error()
    }

    pub fn is_null(&self) -> bool {
        self.h.is_marked()
    }

    fn mark_error(&self) {
        self.h.mark_error();
    }

    fn get(&self) -> Option<&Rc<JitInner>> {
        self.h.get()
    }

    pub fn is_init(&self) -> bool {
        self.get().map(|j| j.is_init()).unwrap_or(false)
    }

    pub fn is_bind(&self) -> bool {
        if self.has_error() {
            return false;
        }
        self.get().map(|j| j.bind.get()).unwrap_or(false)
    }

    /// Install a tracing callback fired before every optimizer pass.
    pub fn on_before_pass(&self, cb: impl Fn(&str, &crate::ir::FuncIr) + 'static) {
        if let Some(j) = self.get() {
            j.optimizer.borrow_mut().on_before_pass(cb);
        }
    }

    /// Install a tracing callback fired after every optimizer pass.
    pub fn on_after_pass(&self, cb: impl Fn(&str, &crate::ir::FuncIr) + 'static) {
        if let Some(j) = self.get() {
            j.optimizer.borrow_mut().on_after_pass(cb);
        }
    }

    /// Run the optimization pipeline on one function's IR.
    pub fn process_module_fn(&self, func: &Function) -> bool {
        fn_guard!();
        if self.has_error() || func.has_error() {
            return false;
        }
        let Some(j) = self.get() else {
            return false;
        };
        let optimizer = j.optimizer.borrow();
        func.with_ir_mut(|ir| optimizer.run(ir)).is_some()
    }

    /// Package every module of a bound cursor into the JIT: lower and
    /// define each function, then route public symbols into namespaces.
    /// The cursor is cleaned up afterwards.
    pub fn add_module(&self, cursor: &Cursor) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if cursor.has_error() {
            push_error!(Jit, "can't add modules from an invalid cursor");
            return;
        }
        if !cursor.is_bind_called() {
            push_error!(Jit, "cursor must be bound before adding to the jit");
            self.mark_error();
            return;
        }
        let Some(j) = self.get() else {
            return;
        };
        if !j.is_init() {
            push_error!(Jit, "jit not yet initialized");
            self.mark_error();
            return;
        }
        if j.bind.get() {
            push_error!(Jit, "jit already bound");
            self.mark_error();
            return;
        }
        let mut packages = vec![cursor.main_module().package()];
        cursor.for_each_module(|m| packages.push(m.package()));
        for package in packages {
            self.add_package(package);
            if self.has_error() {
                return;
            }
        }
        cursor.cleanup();
    }

    fn add_package(&self, package: PackagedModule) {
        fn_guard!();
        let Some(j) = self.get() else {
            return;
        };
        if !package.is_valid() {
            push_error!(Jit, "invalid module can't be added");
            self.mark_error();
            return;
        }
        let Some(pkg) = package.inner().cloned() else {
            return;
        };
        {
            let mut module_slot = j.module.borrow_mut();
            let Some(module) = module_slot.as_mut() else {
                return;
            };
            let mut declared = j.declared.borrow_mut();
            for func in &pkg.funcs {
                if let Err(e) = lowering::define_function(module, &mut declared, func) {
                    push_error!(Jit, "failed to add function {} of module {}: {}", func.name, pkg.name, e);
                    self.mark_error();
                    return;
                }
            }
        }
        for symbol in &pkg.symbols {
            if !symbol.is_valid() {
                push_error!(Jit, "invalid symbol in module: {}", pkg.name);
                self.mark_error();
                return;
            }
            let sym_name = symbol.symbol_name();
            let ns_name =
                if sym_name.is_global() { String::new() } else { sym_name.namespace_name().to_string() };
            let namespace = {
                let mut namespaces = j.namespaces.borrow_mut();
                match namespaces.get(&ns_name) {
                    Some(ns) => ns.clone(),
                    None => {
                        let ns = Namespace::create(j.self_weak.clone(), &ns_name);
                        namespaces.insert(ns_name.clone(), ns.clone());
                        j.ns_seq.borrow_mut().push(ns_name.clone());
                        ns
                    }
                }
            };
            if namespace.is_bind() {
                push_error!(
                    Jit,
                    "namespace already frozen, can't add symbol: {}: {}",
                    namespace.name(),
                    sym_name.full_name()
                );
                self.mark_error();
                return;
            }
            // Declaration-only symbols are not produced yet; everything
            // packaged here carries a definition.
            j.def_symbols.borrow_mut().push(sym_name.full_name().to_string());
            if symbol.is_custom_struct() {
                let struct_type = package.struct_type(sym_name.short_name());
                namespace.add_struct(&struct_type);
            } else if symbol.is_function() {
                namespace.add_event(sym_name.short_name(), sym_name.full_name());
            }
        }
    }

    /// Finalize generated code, then bind namespaces in reverse
    /// insertion order.
    pub fn bind(&self) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        let Some(j) = self.get() else {
            return;
        };
        if !j.is_init() {
            push_error!(Jit, "jit not yet initialized");
            self.mark_error();
            return;
        }
        if j.bind.get() {
            push_error!(Jit, "jit already bound");
            self.mark_error();
            return;
        }
        {
            let mut module_slot = j.module.borrow_mut();
            let Some(module) = module_slot.as_mut() else {
                return;
            };
            if let Err(e) = module.finalize_definitions() {
                push_error!(Jit, "failed to finalize jit definitions: {}", e);
                self.mark_error();
                return;
            }
        }
        j.bind.set(true);
        let seq = j.ns_seq.borrow().clone();
        for name in seq.iter().rev() {
            let ns = j.namespaces.borrow().get(name).cloned();
            if let Some(ns) = ns {
                ns.bind();
            }
        }
    }

    pub fn contains_symbol_definition(&self, name: &str) -> bool {
        if self.has_error() || name.is_empty() {
            return false;
        }
        self.get()
            .map(|j| j.def_symbols.borrow().iter().any(|s| s == name))
            .unwrap_or(false)
    }

    /// Host entry point of a bound symbol.
    pub fn get_fn(&self, symbol: &str) -> Option<RawEventFn> {
        if self.has_error() {
            return None;
        }
        if symbol.is_empty() {
            push_error!(Jit, "function name can't be empty");
            self.mark_error();
            return None;
        }
        let j = self.get()?;
        let ptr = j.symbol_address(symbol)?;
        // The signature is fixed by construction: int32(void*).
        Some(unsafe { std::mem::transmute::<*const u8, RawEventFn>(ptr) })
    }

    /// Look up a bound namespace by name; the global namespace has the
    /// empty name.
    pub fn get_namespace(&self, name: &str) -> Namespace {
        fn_guard!();
        if self.has_error() {
            return Namespace::null();
        }
        let Some(j) = self.get() else {
            return Namespace::null();
        };
        if !j.bind.get() {
            push_error!(Jit, "jit not yet ready for namespace lookup, bind it first: {}", name);
            return Namespace::null();
        }
        match j.namespaces.borrow().get(name) {
            Some(ns) => ns.clone(),
            None => {
                let candidates: Vec<String> = j.namespaces.borrow().keys().cloned().collect();
                push_error!(Jit, "namespace not found: {} (candidates: {:?})", name, candidates);
                Namespace::null()
            }
        }
    }

    pub fn get_global_namespace(&self) -> Namespace {
        fn_guard!();
        self.get_namespace("")
    }
}
