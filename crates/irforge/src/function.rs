//! Functions and the function builder
//!
//! Every function takes exactly one argument, the context value of its
//! [`FnContext`] (usually a pointer to a struct carrying inputs and
//! outputs), and returns a declared scalar type. Functions are minted
//! through [`FunctionBuilder`] against the cursor in context; calling a
//! function from another module declares it there first.

use std::cell::RefCell;
use std::io::Write;
use std::rc::{Rc, Weak};

use crate::cursor::{self, CursorContext};
use crate::error::{fn_guard, push_error, ErrorContext};
use crate::handle::WeakHandle;
use crate::ir::{BlockId, FuncIr, Instr, Reg, Terminator};
use crate::link::{LinkSymbol, LinkSymbolName};
use crate::module::{Module, ModuleContext};
use crate::section::{CodeSection, SectionInner};
use crate::track::{ObjectKind, Tracker};
use crate::types::TypeInfo;
use crate::value::ValueInfo;

/// The single-argument convention of a function: the context type must be
/// scalar or pointer.
#[derive(Clone)]
pub struct FnContext {
    err: bool,
    ty: TypeInfo,
    value: Option<ValueInfo>,
}

impl FnContext {
    pub fn new(ty: &TypeInfo) -> FnContext {
        fn_guard!();
        if ty.has_error() {
            push_error!(Function, "context type invalid");
            return FnContext::null();
        }
        if !ty.is_scalar() && !ty.is_pointer() {
            push_error!(Function, "function context type must be scalar or pointer");
            return FnContext::null();
        }
        FnContext { err: false, ty: ty.clone(), value: None }
    }

    pub fn null() -> FnContext {
        FnContext { err: true, ty: TypeInfo::null(), value: None }
    }

    pub fn has_error(&self) -> bool {
        self.err || ErrorContext::has_error()
    }

    pub fn is_valid(&self) -> bool {
        !self.err && self.ty.is_valid()
    }

    pub fn ty(&self) -> &TypeInfo {
        &self.ty
    }

    /// The argument as a value-graph node; set when the owning function
    /// is created.
    pub fn value(&self) -> ValueInfo {
        self.value.clone().unwrap_or_else(ValueInfo::null)
    }

    pub(crate) fn set_value(&mut self, value: ValueInfo) {
        if !self.err {
            self.value = Some(value);
        }
    }
}

/// Construction request handed to the cursor's function factory.
pub(crate) struct FunctionSpec {
    pub module: Option<Module>,
    pub symbol: LinkSymbolName,
    pub external: bool,
    pub return_type: TypeInfo,
    pub context: FnContext,
}

/// Implementation record; owned by the cursor's function registry.
pub(crate) struct FunctionInner {
    pub parent: Module,
    pub name: String,
    pub external: bool,
    pub return_type: TypeInfo,
    pub context: FnContext,
    pub link_symbol: LinkSymbol,
    pub ir: RefCell<FuncIr>,
    pub sections: RefCell<Vec<Rc<SectionInner>>>,
}

impl Drop for FunctionInner {
    fn drop(&mut self) {
        Tracker::on_delete(ObjectKind::Function, self as *const _ as u64, &self.name);
    }
}

/// Handle to a function.
pub struct Function {
    h: WeakHandle<FunctionInner>,
}

impl Clone for Function {
    fn clone(&self) -> Self {
        Function { h: self.h.clone() }
    }
}

impl PartialEq for Function {
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

impl Function {
    pub(crate) fn from_inner(inner: &Rc<FunctionInner>) -> Function {
        Function { h: WeakHandle::valid(inner) }
    }

    pub fn null() -> Function {
        Function { h: WeakHandle::null() }
    }

    pub fn has_error(&self) -> bool {
        self.h.has_error()
    }

    pub fn is_null(&self) -> bool {
        self.h.is_marked()
    }

    pub(crate) fn mark_error(&self) {
        self.h.mark_error();
    }

    fn get(&self) -> Option<Rc<FunctionInner>> {
        self.h.get_or_error(crate::error::ErrorKind::Function, "function")
    }

    pub(crate) fn inner_weak(&self) -> Weak<FunctionInner> {
        self.h.downgrade_clone()
    }

    pub fn is_valid(&self) -> bool {
        !self.has_error() && self.h.get().is_some()
    }

    pub fn name(&self) -> String {
        if self.has_error() {
            return String::new();
        }
        self.get().map(|f| f.name.clone()).unwrap_or_default()
    }

    pub fn parent_module(&self) -> Module {
        if self.has_error() {
            return Module::null();
        }
        self.get().map(|f| f.parent.clone()).unwrap_or_else(Module::null)
    }

    pub fn is_external(&self) -> bool {
        if self.has_error() {
            return false;
        }
        self.get().map(|f| f.external).unwrap_or(false)
    }

    pub fn return_type(&self) -> TypeInfo {
        if self.has_error() {
            return TypeInfo::null();
        }
        self.get().map(|f| f.return_type.clone()).unwrap_or_else(TypeInfo::null)
    }

    pub fn context(&self) -> FnContext {
        if self.has_error() {
            return FnContext::null();
        }
        self.get().map(|f| f.context.clone()).unwrap_or_else(FnContext::null)
    }

    /// The context argument as a value.
    pub fn context_value(&self) -> ValueInfo {
        self.context().value()
    }

    pub(crate) fn context_reg(&self) -> Option<Reg> {
        let inner = self.get()?;
        let reg = inner.ir.borrow().ctx_reg;
        Some(reg)
    }

    pub fn link_symbol(&self) -> LinkSymbol {
        if self.has_error() {
            return LinkSymbol::null();
        }
        self.get().map(|f| f.link_symbol.clone()).unwrap_or_else(LinkSymbol::null)
    }

    /// Mint a new section; duplicate names within one function are
    /// rejected.
    pub fn mk_section(&self, name: &str) -> CodeSection {
        fn_guard!();
        if self.has_error() {
            return CodeSection::null();
        }
        if name.is_empty() {
            push_error!(Function, "section name can't be empty");
            self.mark_error();
            return CodeSection::null();
        }
        let Some(inner) = self.get() else {
            return CodeSection::null();
        };
        {
            let sections = inner.sections.borrow();
            if sections.iter().any(|s| s.section_name() == name) {
                push_error!(CodeSection, "duplicate section name: {}", name);
                return CodeSection::null();
            }
        }
        CodeSection::create(name, self)
    }

    pub(crate) fn adopt_section(&self, section: Rc<SectionInner>) {
        if let Some(inner) = self.h.get() {
            inner.sections.borrow_mut().push(section);
        }
    }

    pub(crate) fn add_block(&self, name: &str) -> Option<BlockId> {
        let inner = self.get()?;
        let id = inner.ir.borrow_mut().add_block(name);
        Some(id)
    }

    pub(crate) fn set_terminator(&self, block: BlockId, term: Terminator) -> bool {
        let Some(inner) = self.get() else {
            return false;
        };
        inner.ir.borrow_mut().block_mut(block).terminator = term;
        true
    }

    pub(crate) fn with_ir_mut<R>(&self, f: impl FnOnce(&mut FuncIr) -> R) -> Option<R> {
        let inner = self.h.get()?;
        let mut ir = inner.ir.borrow_mut();
        Some(f(&mut ir))
    }

    /// Call this function with `arg` from the module currently in
    /// context. A cross-module call first declares the callee in the
    /// calling module.
    pub fn call_fn(&self, arg: &ValueInfo) -> ValueInfo {
        fn_guard!();
        if self.has_error() {
            return ValueInfo::null();
        }
        if arg.has_error() {
            push_error!(Function, "trying to call a function with an invalid context value");
            self.mark_error();
            return ValueInfo::null();
        }
        let Some(inner) = self.get() else {
            return ValueInfo::null();
        };
        if !inner.context.ty().check_sync(arg) {
            push_error!(
                Function,
                "expected argument type {}, found {}",
                inner.context.ty().short_name(),
                arg.ty().short_name()
            );
            self.mark_error();
            return ValueInfo::null();
        }
        let Some(current) = ModuleContext::current() else {
            push_error!(Function, "no module in context for call to {}", inner.name);
            self.mark_error();
            return ValueInfo::null();
        };
        if current != inner.parent {
            self.declare_in(&current);
        }
        let Some(arg_reg) = arg.materialize() else {
            return ValueInfo::null();
        };
        let (Some(ctx_ir), Some(ret_ir)) =
            (inner.context.ty().ir_type(), inner.return_type.ir_type())
        else {
            push_error!(Function, "call signature of {} is not representable", inner.name);
            self.mark_error();
            return ValueInfo::null();
        };
        let symbol = inner.name.clone();
        let reg = cursor::emit_value(ret_ir, |dest| Instr::Call {
            dest: Some(dest),
            symbol,
            params: vec![ctx_ir],
            ret: Some(ret_ir),
            args: vec![arg_reg],
        });
        match reg {
            Some(reg) => ValueInfo::call_result(&inner.return_type, reg),
            None => ValueInfo::null(),
        }
    }

    /// Record this function as declared in `dst`; idempotent.
    pub fn declare_in(&self, dst: &Module) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if dst.has_error() {
            push_error!(Function, "trying to declare a function in an invalid module");
            return;
        }
        let Some(inner) = self.get() else {
            return;
        };
        if *dst == inner.parent {
            return;
        }
        dst.add_import(&inner.name);
    }

    /// Diagnostic verification. Outstanding errors are fatal; a function
    /// whose sections do not all terminate reports to stderr.
    pub fn verify(&self) {
        if ErrorContext::has_error() {
            let mut stderr = std::io::stderr();
            ErrorContext::print(&mut stderr, 5);
        }
        if self.has_error() {
            panic!("function has outstanding errors");
        }
        let Some(inner) = self.get() else {
            panic!("function is a null object");
        };
        if let Err(msg) = inner.ir.borrow().verify() {
            eprintln!("{}", msg);
        };
    }

    /// Drop this function from its module's function list and clear its
    /// IR; later uses of the handle degrade to errors.
    pub fn remove_from_module(&self) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        let Some(inner) = self.get() else {
            return;
        };
        inner.parent.remove_function(self);
        *inner.ir.borrow_mut() = FuncIr::default();
        self.mark_error();
    }

    /// Write the function's IR text.
    pub fn write_to_stream(&self, w: &mut dyn Write) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        let Some(inner) = self.get() else {
            return;
        };
        let _ = write!(w, "{}", inner.ir.borrow());
    }
}

/// Fluent builder for functions. Consumed by `compile`; the return type
/// defaults to `int32` when unset.
pub struct FunctionBuilder {
    err: bool,
    module: Option<Module>,
    name: Option<String>,
    namespace: Option<String>,
    context: Option<FnContext>,
    external: bool,
    return_type: Option<TypeInfo>,
}

impl Default for FunctionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionBuilder {
    pub fn new() -> FunctionBuilder {
        FunctionBuilder {
            err: false,
            module: None,
            name: None,
            namespace: None,
            context: None,
            external: false,
            return_type: None,
        }
    }

    fn fail(mut self) -> Self {
        self.err = true;
        self
    }

    pub fn module(mut self, module: &Module) -> Self {
        fn_guard!();
        if self.err {
            return self;
        }
        if module.has_error() {
            push_error!(Function, "module not valid");
            return self.fail();
        }
        if self.module.is_some() {
            push_error!(Function, "module already set, can't change it");
            return self.fail();
        }
        self.module = Some(module.clone());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        fn_guard!();
        if self.err {
            return self;
        }
        if name.is_empty() {
            push_error!(Function, "can't set an empty function name");
            return self.fail();
        }
        if self.name.is_some() {
            push_error!(Function, "function name already set, can't rename");
            return self.fail();
        }
        self.name = Some(name.to_string());
        self
    }

    /// Place the function's symbol in a namespace (`ns_name` spelling).
    pub fn namespace(mut self, ns: &str) -> Self {
        fn_guard!();
        if self.err {
            return self;
        }
        if ns.is_empty() {
            push_error!(Function, "can't set an empty namespace");
            return self.fail();
        }
        self.namespace = Some(ns.to_string());
        self
    }

    pub fn context(mut self, context: FnContext) -> Self {
        fn_guard!();
        if self.err {
            return self;
        }
        if context.has_error() {
            push_error!(Function, "can't set an invalid function context");
            return self.fail();
        }
        self.context = Some(context);
        self
    }

    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    pub fn return_type(mut self, ty: &TypeInfo) -> Self {
        fn_guard!();
        if self.err {
            return self;
        }
        if ty.has_error() || !ty.is_scalar() {
            push_error!(Function, "function return type must be a valid scalar");
            return self.fail();
        }
        self.return_type = Some(ty.clone());
        self
    }

    /// Freeze the builder into a function.
    pub fn compile(self) -> Function {
        fn_guard!();
        if self.err {
            push_error!(Function, "trying to compile an invalid function builder");
            return Function::null();
        }
        if !CursorContext::has_value() {
            push_error!(Context, "function can't be compiled, no cursor in context");
            return Function::null();
        }
        let Some(name) = self.name else {
            push_error!(Function, "function name not set in function builder");
            return Function::null();
        };
        let Some(context) = self.context else {
            push_error!(Function, "function context not set in function builder");
            return Function::null();
        };
        if !context.is_valid() {
            push_error!(Function, "invalid function argument");
            return Function::null();
        }
        let return_type = self.return_type.unwrap_or_else(TypeInfo::mk_int32);
        if return_type.has_error() {
            push_error!(Function, "return type not defined for function {}", name);
            return Function::null();
        }
        let symbol = match &self.namespace {
            Some(ns) => LinkSymbolName::namespaced(ns, &name),
            None => LinkSymbolName::global(&name),
        };
        if symbol.has_error() {
            return Function::null();
        }
        let external = self.external || self.module.is_none();
        let spec = FunctionSpec { module: self.module, symbol, external, return_type, context };
        CursorContext::with_inner(|c| c.mk_function(spec)).unwrap_or_else(Function::null)
    }
}
