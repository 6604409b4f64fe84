//! Cursors
//!
//! A cursor is a top-level compilation unit: it owns the type registry
//! with its interning caches, the module map, and every function record.
//! `bind()` creates the main module and runs the registered hooks inside
//! a module context; `gen_module()` mints additional numbered modules.
//! The thread-local [`CursorContext`] gives constructors their implicit
//! enclosing cursor, and the cursor carries the IR insertion point that
//! code sections save and restore.

use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::error::{fn_guard, push_error};
use crate::function::{Function, FunctionInner, FunctionSpec};
use crate::handle::StrongHandle;
use crate::ir::{BlockId, FuncIr, Instr, IrType, Reg};
use crate::link::{LinkSymbol, LinkSymbolName};
use crate::module::{Module, ModuleContext, ModuleInner};
use crate::track::{ObjectKind, Tracker};
use crate::types::{self, MemberField, TypeImpl, TypeInfo, TypeKind};
use crate::value::ValueInfo;

/// Where instruction emission currently lands.
#[derive(Clone)]
pub(crate) struct InsertPoint {
    pub func: Weak<FunctionInner>,
    pub block: BlockId,
}

struct Primitives {
    void_ty: TypeInfo,
    bool_ty: TypeInfo,
    int8: TypeInfo,
    int16: TypeInfo,
    int32: TypeInfo,
    int64: TypeInfo,
    uint8: TypeInfo,
    uint16: TypeInfo,
    uint32: TypeInfo,
    uint64: TypeInfo,
    float32: TypeInfo,
    float64: TypeInfo,
}

type MainModuleHook = Box<dyn FnOnce(&Module)>;

/// Implementation record of a cursor.
pub(crate) struct CursorInner {
    name: String,
    self_weak: Weak<CursorInner>,
    types: RefCell<Vec<Rc<TypeImpl>>>,
    prim: RefCell<Option<Primitives>>,
    event_fn_ty: RefCell<Option<TypeInfo>>,
    pointer_cache: RefCell<Vec<(TypeInfo, TypeInfo)>>,
    array_cache: RefCell<FxHashMap<u32, Vec<TypeInfo>>>,
    vector_cache: RefCell<FxHashMap<u32, Vec<TypeInfo>>>,
    struct_cache: RefCell<FxHashMap<String, TypeInfo>>,
    modules: RefCell<FxHashMap<String, Rc<ModuleInner>>>,
    module_order: RefCell<Vec<String>>,
    funcs: RefCell<Vec<Rc<FunctionInner>>>,
    main_module: RefCell<Option<Module>>,
    hooks: RefCell<Vec<MainModuleHook>>,
    bind: Cell<bool>,
    deleted: Cell<bool>,
    insert: RefCell<Option<InsertPoint>>,
}

impl Drop for CursorInner {
    fn drop(&mut self) {
        Tracker::on_delete(ObjectKind::Cursor, self as *const _ as u64, &self.name);
    }
}

impl CursorInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_valid(&self) -> bool {
        !self.deleted.get()
    }

    pub(crate) fn is_bind_called(&self) -> bool {
        self.bind.get()
    }

    fn register_type(&self, imp: TypeImpl) -> TypeInfo {
        let rc = Rc::new(imp);
        Tracker::on_new(ObjectKind::Type, Rc::as_ptr(&rc) as u64, "");
        let ty = TypeInfo::from_impl(&rc);
        self.types.borrow_mut().push(rc);
        ty
    }

    fn init_primitives(&self) {
        let w = || self.self_weak.clone();
        let prim = Primitives {
            void_ty: self.register_type(types::scalar_impl(TypeKind::Void, 0, false, w())),
            bool_ty: self.register_type(types::scalar_impl(TypeKind::Bool, 1, false, w())),
            int8: self.register_type(types::scalar_impl(TypeKind::Int, 1, true, w())),
            int16: self.register_type(types::scalar_impl(TypeKind::Int, 2, true, w())),
            int32: self.register_type(types::scalar_impl(TypeKind::Int, 4, true, w())),
            int64: self.register_type(types::scalar_impl(TypeKind::Int, 8, true, w())),
            uint8: self.register_type(types::scalar_impl(TypeKind::Int, 1, false, w())),
            uint16: self.register_type(types::scalar_impl(TypeKind::Int, 2, false, w())),
            uint32: self.register_type(types::scalar_impl(TypeKind::Int, 4, false, w())),
            uint64: self.register_type(types::scalar_impl(TypeKind::Int, 8, false, w())),
            float32: self.register_type(types::scalar_impl(TypeKind::Float, 4, false, w())),
            float64: self.register_type(types::scalar_impl(TypeKind::Float, 8, false, w())),
        };
        *self.prim.borrow_mut() = Some(prim);
    }

    fn with_prim(&self, f: impl FnOnce(&Primitives) -> TypeInfo) -> TypeInfo {
        if !self.is_valid() {
            push_error!(Module, "cursor already deleted: {}", self.name);
            return TypeInfo::null();
        }
        match self.prim.borrow().as_ref() {
            Some(p) => f(p),
            None => TypeInfo::null(),
        }
    }

    pub(crate) fn type_void(&self) -> TypeInfo {
        self.with_prim(|p| p.void_ty.clone())
    }

    pub(crate) fn type_bool(&self) -> TypeInfo {
        self.with_prim(|p| p.bool_ty.clone())
    }

    pub(crate) fn type_int(&self, bytes: u32, signed: bool) -> TypeInfo {
        self.with_prim(|p| match (bytes, signed) {
            (1, true) => p.int8.clone(),
            (2, true) => p.int16.clone(),
            (4, true) => p.int32.clone(),
            (8, true) => p.int64.clone(),
            (1, false) => p.uint8.clone(),
            (2, false) => p.uint16.clone(),
            (4, false) => p.uint32.clone(),
            (8, false) => p.uint64.clone(),
            _ => TypeInfo::null(),
        })
    }

    pub(crate) fn type_float(&self, bytes: u32) -> TypeInfo {
        self.with_prim(|p| match bytes {
            4 => p.float32.clone(),
            8 => p.float64.clone(),
            _ => TypeInfo::null(),
        })
    }

    pub(crate) fn type_event_fn(&self) -> TypeInfo {
        if !self.is_valid() {
            push_error!(Module, "cursor already deleted: {}", self.name);
            return TypeInfo::null();
        }
        if let Some(ty) = self.event_fn_ty.borrow().as_ref() {
            return ty.clone();
        }
        let ty = self.register_type(types::scalar_impl(TypeKind::Function, 0, false, self.self_weak.clone()));
        *self.event_fn_ty.borrow_mut() = Some(ty.clone());
        ty
    }

    pub(crate) fn type_pointer(&self, base: &TypeInfo) -> TypeInfo {
        if !self.is_valid() {
            push_error!(Module, "cursor already deleted: {}", self.name);
            return TypeInfo::null();
        }
        if base.has_error() {
            push_error!(Module, "can't define a pointer to an invalid type");
            return TypeInfo::null();
        }
        for (cached_base, cached_ptr) in self.pointer_cache.borrow().iter() {
            if *cached_base == *base {
                return cached_ptr.clone();
            }
        }
        let ty = self.register_type(types::pointer_impl(base.clone(), self.self_weak.clone()));
        self.pointer_cache.borrow_mut().push((base.clone(), ty.clone()));
        ty
    }

    pub(crate) fn type_array(&self, element: &TypeInfo, count: u32) -> TypeInfo {
        self.sequence_type(TypeKind::Array, element, count)
    }

    pub(crate) fn type_vector(&self, element: &TypeInfo, count: u32) -> TypeInfo {
        self.sequence_type(TypeKind::Vector, element, count)
    }

    fn sequence_type(&self, kind: TypeKind, element: &TypeInfo, count: u32) -> TypeInfo {
        if !self.is_valid() {
            push_error!(Module, "cursor already deleted: {}", self.name);
            return TypeInfo::null();
        }
        let cache = match kind {
            TypeKind::Array => &self.array_cache,
            _ => &self.vector_cache,
        };
        if let Some(bucket) = cache.borrow().get(&count) {
            for cached in bucket {
                if cached.base_type() == *element {
                    return cached.clone();
                }
            }
        }
        let ty = self.register_type(types::sequence_impl(kind, element.clone(), count, self.self_weak.clone()));
        cache.borrow_mut().entry(count).or_default().push(ty.clone());
        ty
    }

    pub(crate) fn type_struct(&self, name: &str, members: &[MemberField], packed: bool) -> TypeInfo {
        fn_guard!();
        if !self.is_valid() {
            push_error!(Module, "cursor already deleted: {}", self.name);
            return TypeInfo::null();
        }
        if self.is_bind_called() {
            push_error!(Module, "can't create a new type after binding cursor: {}", self.name);
            return TypeInfo::null();
        }
        {
            let mut seen = rustc_hash::FxHashSet::default();
            for m in members {
                if !seen.insert(m.name().to_string()) {
                    push_error!(TypeError, "duplicate field name in struct: {}.{}", name, m.name());
                    return TypeInfo::null();
                }
            }
        }
        if let Some(cached) = self.struct_cache.borrow().get(name) {
            if struct_shape_matches(cached, members, packed) {
                return cached.clone();
            }
            push_error!(TypeError, "struct {} already defined with a different shape", name);
            return TypeInfo::null();
        }
        let ty = self.register_type(types::struct_impl(name, members, packed, self.self_weak.clone()));
        self.struct_cache.borrow_mut().insert(name.to_string(), ty.clone());

        // Surface the struct as a public symbol of the main module.
        let hook_ty = ty.clone();
        let hook_name = name.to_string();
        self.hooks.borrow_mut().push(Box::new(move |module: &Module| {
            let symbol = LinkSymbol::custom_struct(LinkSymbolName::global(&hook_name), hook_ty.clone());
            module.register_symbol(&symbol);
            module.add_struct_definition(&hook_ty);
        }));
        ty
    }

    pub(crate) fn mk_function(&self, spec: FunctionSpec) -> Function {
        fn_guard!();
        if !self.is_valid() {
            push_error!(Module, "cursor already deleted: {}", self.name);
            return Function::null();
        }
        let full_name = spec.symbol.full_name().to_string();
        let (Some(ctx_ir), Some(ret_ir)) = (spec.context.ty().ir_type(), spec.return_type.ir_type())
        else {
            push_error!(Function, "function signature of {} is not representable", full_name);
            return Function::null();
        };
        if !spec.external {
            let Some(module) = spec.module.as_ref() else {
                push_error!(Function, "function {} needs a module", full_name);
                return Function::null();
            };
            if module.has_error() {
                return Function::null();
            }
            if module.contains(&full_name) {
                push_error!(Function, "duplicate function name: {}", full_name);
                return Function::null();
            }
        }
        let mut context = spec.context;
        context.set_value(ValueInfo::from_context(context.ty()));
        let mut link_symbol = LinkSymbol::function(spec.symbol, spec.return_type.clone());
        link_symbol.add_arg(context.ty(), "context");
        if link_symbol.has_error() {
            push_error!(Function, "function {} can't be defined correctly", full_name);
            return Function::null();
        }
        let parent = spec.module.clone().unwrap_or_else(Module::null);
        let inner = Rc::new(FunctionInner {
            parent: parent.clone(),
            name: full_name.clone(),
            external: spec.external,
            return_type: spec.return_type,
            context,
            link_symbol,
            ir: RefCell::new(FuncIr::new(full_name.clone(), ctx_ir, ret_ir)),
            sections: RefCell::new(Vec::new()),
        });
        Tracker::on_new(ObjectKind::Function, Rc::as_ptr(&inner) as u64, &full_name);
        let func = Function::from_inner(&inner);
        self.funcs.borrow_mut().push(inner);
        if !spec.external {
            parent.register_symbol(&func.link_symbol());
            parent.add_function(&func);
        }
        func
    }

    fn gen_module_named(&self, name: &str) -> Module {
        fn_guard!();
        if ModuleContext::has_value() {
            push_error!(Module, "can't generate a module while another is in context");
            return Module::null();
        }
        if self.modules.borrow().contains_key(name) {
            push_error!(Module, "module already exists: {}", name);
            return Module::null();
        }
        let inner = ModuleInner::new(name, self.self_weak.clone());
        let module = Module::from_inner(&inner);
        self.modules.borrow_mut().insert(name.to_string(), inner);
        self.module_order.borrow_mut().push(name.to_string());
        module.init_standard();
        module
    }

    pub(crate) fn main_module(&self) -> Module {
        if !self.is_valid() {
            push_error!(Module, "cursor already deleted: {}", self.name);
            return Module::null();
        }
        if !self.is_bind_called() {
            push_error!(Module, "bind not called for cursor: {}", self.name);
            return Module::null();
        }
        self.main_module.borrow().clone().unwrap_or_else(Module::null)
    }

    pub(crate) fn gen_module(&self) -> Module {
        if !self.is_valid() {
            push_error!(Module, "cursor already deleted: {}", self.name);
            return Module::null();
        }
        if !self.is_bind_called() {
            push_error!(Module, "bind not called for cursor: {}", self.name);
            return Module::null();
        }
        let name = format!("{}_{}", self.name, self.modules.borrow().len());
        self.gen_module_named(&name)
    }

    pub(crate) fn main_module_hook(&self, hook: MainModuleHook) {
        if !self.is_valid() {
            push_error!(Module, "cursor already deleted: {}", self.name);
            return;
        }
        if self.is_bind_called() {
            push_error!(Module, "can't register a main-module hook after binding cursor: {}", self.name);
            return;
        }
        self.hooks.borrow_mut().push(hook);
    }

    pub(crate) fn bind(&self) {
        fn_guard!();
        if self.is_bind_called() {
            push_error!(Module, "bind already called for cursor: {}", self.name);
            return;
        }
        self.bind.set(true);
        let main = self.gen_module_named(&self.name.clone());
        if main.has_error() {
            return;
        }
        *self.main_module.borrow_mut() = Some(main.clone());
        let hooks: Vec<MainModuleHook> = self.hooks.borrow_mut().drain(..).collect();
        let _module_ctx = ModuleContext::enter(&main);
        for hook in hooks {
            hook(&main);
        }
    }

    pub(crate) fn for_each_module(&self, mut f: impl FnMut(Module)) {
        fn_guard!();
        if !self.is_bind_called() {
            push_error!(Module, "modules not yet initialized for cursor: {}", self.name);
            return;
        }
        let order = self.module_order.borrow().clone();
        for name in order {
            if name == self.name {
                continue;
            }
            let module = self.modules.borrow().get(&name).map(Module::from_inner);
            if let Some(module) = module {
                f(module);
            }
        }
    }

    pub(crate) fn cleanup(&self) {
        self.modules.borrow_mut().clear();
        self.module_order.borrow_mut().clear();
        self.funcs.borrow_mut().clear();
        self.types.borrow_mut().clear();
        *self.prim.borrow_mut() = None;
        *self.event_fn_ty.borrow_mut() = None;
        self.pointer_cache.borrow_mut().clear();
        self.array_cache.borrow_mut().clear();
        self.vector_cache.borrow_mut().clear();
        self.struct_cache.borrow_mut().clear();
        *self.main_module.borrow_mut() = None;
        self.hooks.borrow_mut().clear();
        *self.insert.borrow_mut() = None;
        self.deleted.set(true);
    }
}

fn struct_shape_matches(cached: &TypeInfo, members: &[MemberField], packed: bool) -> bool {
    if cached.is_packed() != packed {
        return false;
    }
    if cached.num_elements() != members.len() as u32 {
        return false;
    }
    for (i, m) in members.iter().enumerate() {
        let entry = cached.field_at(i as u32);
        if entry.name() != m.name() || *entry.ty() != *m.ty() {
            return false;
        }
    }
    true
}

/// Handle owning a cursor.
pub struct Cursor {
    h: StrongHandle<CursorInner>,
}

impl Clone for Cursor {
    fn clone(&self) -> Self {
        Cursor { h: self.h.clone() }
    }
}

impl PartialEq for Cursor {
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

impl Cursor {
    pub fn new(name: &str) -> Cursor {
        fn_guard!();
        if name.is_empty() {
            push_error!(Context, "cursor name can't be empty");
            return Cursor::null();
        }
        let inner = Rc::new_cyclic(|weak: &Weak<CursorInner>| CursorInner {
            name: name.to_string(),
            self_weak: weak.clone(),
            types: RefCell::new(Vec::new()),
            prim: RefCell::new(None),
            event_fn_ty: RefCell::new(None),
            pointer_cache: RefCell::new(Vec::new()),
            array_cache: RefCell::new(FxHashMap::default()),
            vector_cache: RefCell::new(FxHashMap::default()),
            struct_cache: RefCell::new(FxHashMap::default()),
            modules: RefCell::new(FxHashMap::default()),
            module_order: RefCell::new(Vec::new()),
            funcs: RefCell::new(Vec::new()),
            main_module: RefCell::new(None),
            hooks: RefCell::new(Vec::new()),
            bind: Cell::new(false),
            deleted: Cell::new(false),
            insert: RefCell::new(None),
        });
        inner.init_primitives();
        Tracker::on_new(ObjectKind::Cursor, Rc::as_ptr(&inner) as u64, name);
        Cursor { h: StrongHandle::valid(inner) }
    }

    pub fn null() -> Cursor {
        Cursor { h: StrongHandle::null() }
    }

    pub fn has_error(&self) -> bool {
        self.h.has_error()
    }

    pub fn is_null(&self) -> bool {
        self.h.is_marked()
    }

    pub(crate) fn inner(&self) -> Option<Rc<CursorInner>> {
        self.h.raw().filter(|_| !self.h.is_marked()).cloned()
    }

    pub fn name(&self) -> String {
        fn_guard!();
        if self.has_error() {
            return "<ERROR_CURSOR>".to_string();
        }
        self.inner().map(|c| c.name().to_string()).unwrap_or_else(|| "<ERROR_CURSOR>".to_string())
    }

    pub fn main_module(&self) -> Module {
        fn_guard!();
        if self.has_error() {
            return Module::null();
        }
        self.inner().map(|c| c.main_module()).unwrap_or_else(Module::null)
    }

    pub fn gen_module(&self) -> Module {
        fn_guard!();
        if self.has_error() {
            return Module::null();
        }
        self.inner().map(|c| c.gen_module()).unwrap_or_else(Module::null)
    }

    /// Register a callback run on the main module during `bind`.
    pub fn main_module_hook_fn(&self, hook: impl FnOnce(&Module) + 'static) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if let Some(c) = self.inner() {
            c.main_module_hook(Box::new(hook));
        }
    }

    pub fn is_bind_called(&self) -> bool {
        fn_guard!();
        if self.has_error() {
            return false;
        }
        self.inner().map(|c| c.is_bind_called()).unwrap_or(false)
    }

    /// Create the main module and run the registered hooks on it.
    pub fn bind(&self) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if let Some(c) = self.inner() {
            c.bind();
        }
    }

    /// Drop all modules, functions and types; leftover handles degrade
    /// to errors.
    pub fn cleanup(&self) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if let Some(c) = self.inner() {
            if c.is_valid() {
                c.cleanup();
            } else {
                push_error!(Module, "cursor already deleted: {}", c.name());
            }
        }
    }

    /// Visit the generated modules (not the main module).
    pub fn for_each_module(&self, f: impl FnMut(Module)) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if let Some(c) = self.inner() {
            c.for_each_module(f);
        }
    }
}

thread_local! {
    static CURRENT_CURSOR: RefCell<Option<Cursor>> = const { RefCell::new(None) };
}

/// Scoped guard installing a cursor as the thread's implicit compilation
/// context; installing over an occupied context is an error.
pub struct CursorContext {
    owned: bool,
}

impl CursorContext {
    pub fn enter(cursor: &Cursor) -> CursorContext {
        fn_guard!();
        if cursor.has_error() {
            push_error!(Context, "can't install an invalid cursor as context");
            return CursorContext { owned: false };
        }
        let owned = CURRENT_CURSOR.with(|c| {
            let mut current = c.borrow_mut();
            if current.is_some() {
                push_error!(Context, "re-setting cursor context not allowed");
                false
            } else {
                *current = Some(cursor.clone());
                true
            }
        });
        CursorContext { owned }
    }

    pub fn has_value() -> bool {
        CURRENT_CURSOR.with(|c| c.borrow().is_some())
    }

    pub fn current() -> Option<Cursor> {
        CURRENT_CURSOR.with(|c| c.borrow().clone())
    }

    pub fn is_value(cursor: &Cursor) -> bool {
        CURRENT_CURSOR.with(|c| c.borrow().as_ref().map(|cur| cur == cursor).unwrap_or(false))
    }

    pub(crate) fn with_inner<R>(f: impl FnOnce(&CursorInner) -> R) -> Option<R> {
        let cursor = Self::current()?;
        let inner = cursor.inner()?;
        Some(f(&inner))
    }
}

impl Drop for CursorContext {
    fn drop(&mut self) {
        if self.owned {
            CURRENT_CURSOR.with(|c| c.borrow_mut().take());
        }
    }
}

// --- emission helpers ----------------------------------------------------

fn current_insert() -> Option<(Rc<FunctionInner>, BlockId)> {
    let cursor = CursorContext::current()?;
    let inner = cursor.inner()?;
    let ip = inner.insert.borrow().clone()?;
    let func = ip.func.upgrade()?;
    Some((func, ip.block))
}

/// Swap the insertion point; returns the previous one, or `None` when no
/// cursor is in context (an error is recorded).
pub(crate) fn set_insert(ip: Option<InsertPoint>) -> Option<Option<InsertPoint>> {
    let Some(cursor) = CursorContext::current() else {
        push_error!(Context, "no cursor in context");
        return None;
    };
    let Some(inner) = cursor.inner() else {
        push_error!(Context, "cursor no longer valid");
        return None;
    };
    let prev = inner.insert.borrow_mut().take();
    *inner.insert.borrow_mut() = ip;
    Some(prev)
}

/// Append an instruction at the insertion point.
pub(crate) fn emit(instr: Instr) -> bool {
    match current_insert() {
        Some((func, block)) => {
            func.ir.borrow_mut().block_mut(block).instrs.push(instr);
            true
        }
        None => {
            push_error!(ValueError, "no open code section to emit into");
            false
        }
    }
}

/// Allocate a result register of `ty` and append the instruction built
/// for it.
pub(crate) fn emit_value(ty: IrType, f: impl FnOnce(Reg) -> Instr) -> Option<Reg> {
    match current_insert() {
        Some((func, block)) => {
            let mut ir = func.ir.borrow_mut();
            let reg = ir.alloc_reg(ty);
            ir.block_mut(block).instrs.push(f(reg));
            Some(reg)
        }
        None => {
            push_error!(ValueError, "no open code section to emit into");
            None
        }
    }
}
