//! Modules
//!
//! A module is a named bag of functions with a public-symbol list and a
//! struct-type registry. It owns its functions' IR until `package()`
//! moves everything into a [`PackagedModule`] for the JIT, after which
//! the module reports `!is_init`.

use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::{Cell, RefCell};
use std::io::Write;
use std::rc::{Rc, Weak};

use crate::backend::isa;
use crate::cursor::CursorInner;
use crate::error::{fn_guard, push_error};
use crate::function::Function;
use crate::handle::WeakHandle;
use crate::ir::FuncIr;
use crate::link::{LinkSymbol, LinkSymbolName};
use crate::track::{ObjectKind, Tracker};
use crate::types::TypeInfo;

/// Implementation record; owned by the cursor's module registry.
pub(crate) struct ModuleInner {
    name: String,
    #[allow(dead_code)]
    cursor: Weak<CursorInner>,
    symbols: RefCell<Vec<LinkSymbol>>,
    structs: RefCell<FxHashMap<String, TypeInfo>>,
    funcs: RefCell<Vec<Function>>,
    imports: RefCell<FxHashSet<String>>,
    triple: RefCell<String>,
    init: Cell<bool>,
    taken: Cell<bool>,
}

impl ModuleInner {
    pub(crate) fn new(name: &str, cursor: Weak<CursorInner>) -> Rc<ModuleInner> {
        let inner = Rc::new(ModuleInner {
            name: name.to_string(),
            cursor,
            symbols: RefCell::new(Vec::new()),
            structs: RefCell::new(FxHashMap::default()),
            funcs: RefCell::new(Vec::new()),
            imports: RefCell::new(FxHashSet::default()),
            triple: RefCell::new(String::new()),
            init: Cell::new(false),
            taken: Cell::new(false),
        });
        Tracker::on_new(ObjectKind::Module, Rc::as_ptr(&inner) as u64, name);
        inner
    }
}

impl Drop for ModuleInner {
    fn drop(&mut self) {
        Tracker::on_delete(ObjectKind::Module, self as *const _ as u64, &self.name);
    }
}

/// Handle to a module.
pub struct Module {
    h: WeakHandle<ModuleInner>,
}

impl Clone for Module {
    fn clone(&self) -> Self {
        Module { h: self.h.clone() }
    }
}

impl PartialEq for Module {
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

impl Module {
    pub(crate) fn from_inner(inner: &Rc<ModuleInner>) -> Module {
        Module { h: WeakHandle::valid(inner) }
    }

    pub fn null() -> Module {
        Module { h: WeakHandle::null() }
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

    fn get(&self) -> Option<Rc<ModuleInner>> {
        self.h.get_or_error(crate::error::ErrorKind::Module, "module")
    }

    pub fn is_init(&self) -> bool {
        if self.has_error() {
            return false;
        }
        match self.get() {
            Some(m) => m.init.get() && !m.taken.get(),
            None => false,
        }
    }

    pub fn name(&self) -> String {
        fn_guard!();
        if self.has_error() {
            return String::new();
        }
        self.get().map(|m| m.name.clone()).unwrap_or_default()
    }

    pub fn public_symbols(&self) -> Vec<LinkSymbol> {
        fn_guard!();
        if self.has_error() {
            return vec![];
        }
        self.get().map(|m| m.symbols.borrow().clone()).unwrap_or_default()
    }

    pub fn struct_type(&self, name: &str) -> TypeInfo {
        fn_guard!();
        if self.has_error() {
            return TypeInfo::null();
        }
        if name.is_empty() {
            push_error!(Module, "can't search an empty struct name in a module");
            self.mark_error();
            return TypeInfo::null();
        }
        let Some(m) = self.get() else {
            return TypeInfo::null();
        };
        let result = match m.structs.borrow().get(name) {
            Some(ty) => ty.clone(),
            None => {
                push_error!(Module, "struct not found: {}", name);
                TypeInfo::null()
            }
        };
        result
    }

    /// Canonical full names of every public symbol.
    pub fn exported_symbol_names(&self) -> Vec<String> {
        self.transformed_public_symbols(|sym| sym.full_name().to_string())
    }

    pub fn transformed_public_symbols(&self, f: impl Fn(&LinkSymbol) -> String) -> Vec<String> {
        fn_guard!();
        if self.has_error() {
            return vec![];
        }
        let Some(m) = self.get() else {
            return vec![];
        };
        if !self.is_init() {
            push_error!(Module, "module not init: {}", m.name);
            return vec![];
        }
        let result = m.symbols.borrow().iter().map(f).collect();
        result
    }

    /// The full linker name of a registered symbol.
    pub fn public_symbol_name(&self, symbol: &str) -> String {
        fn_guard!();
        if self.has_error() {
            return String::new();
        }
        if symbol.is_empty() {
            push_error!(Module, "can't search for an empty symbol");
            self.mark_error();
            return String::new();
        }
        if self.contains(symbol) {
            LinkSymbolName::global(symbol).full_name().to_string()
        } else {
            push_error!(Module, "symbol not found: {}", symbol);
            String::new()
        }
    }

    pub fn contains(&self, symbol: &str) -> bool {
        fn_guard!();
        if self.has_error() {
            return false;
        }
        if symbol.is_empty() {
            push_error!(Module, "can't search for an empty symbol");
            self.mark_error();
            return false;
        }
        self.get()
            .map(|m| m.symbols.borrow().iter().any(|s| s.equals_name(symbol)))
            .unwrap_or(false)
    }

    /// Register a public symbol; duplicate full names are rejected.
    pub fn register_symbol(&self, link_symbol: &LinkSymbol) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if link_symbol.has_error() {
            push_error!(Module, "can't register an invalid symbol");
            self.mark_error();
            return;
        }
        if link_symbol.full_name().is_empty() {
            push_error!(Module, "can't register an empty symbol");
            self.mark_error();
            return;
        }
        if !link_symbol.is_valid() {
            push_error!(Module, "link symbol not valid: {}", link_symbol.full_name());
            self.mark_error();
            return;
        }
        let Some(m) = self.get() else {
            return;
        };
        if self.contains(link_symbol.full_name()) {
            push_error!(Module, "symbol already exists: {}", link_symbol.full_name());
            self.mark_error();
            return;
        }
        m.symbols.borrow_mut().push(link_symbol.clone());
    }

    /// Register a struct type under its name; duplicates are a type
    /// error.
    pub fn add_struct_definition(&self, struct_type: &TypeInfo) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if struct_type.has_error() {
            push_error!(TypeError, "struct type invalid");
            self.mark_error();
            return;
        }
        if !struct_type.is_struct() {
            push_error!(TypeError, "type is not a struct");
            self.mark_error();
            return;
        }
        let Some(m) = self.get() else {
            return;
        };
        let name = struct_type.struct_name();
        let mut structs = m.structs.borrow_mut();
        if structs.contains_key(&name) {
            push_error!(TypeError, "struct type already exists with name: {}", name);
            return;
        }
        structs.insert(name, struct_type.clone());
    }

    /// Adopt host defaults: target triple and data layout parameters.
    pub fn init_standard(&self) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        let Some(m) = self.get() else {
            return;
        };
        if m.init.get() {
            push_error!(Module, "module already init: {}", m.name);
            self.mark_error();
            return;
        }
        *m.triple.borrow_mut() = isa::host_triple();
        m.init.set(true);
    }

    pub fn target_triple(&self) -> String {
        self.get().map(|m| m.triple.borrow().clone()).unwrap_or_default()
    }

    pub(crate) fn add_function(&self, func: &Function) {
        if let Some(m) = self.h.get() {
            m.funcs.borrow_mut().push(func.clone());
        }
    }

    pub(crate) fn remove_function(&self, func: &Function) {
        if let Some(m) = self.h.get() {
            m.funcs.borrow_mut().retain(|f| f != func);
        }
    }

    pub(crate) fn add_import(&self, name: &str) {
        if let Some(m) = self.h.get() {
            m.imports.borrow_mut().insert(name.to_string());
        }
    }

    /// Symbols declared into this module by cross-module calls.
    pub fn declared_imports(&self) -> Vec<String> {
        self.get()
            .map(|m| {
                let mut names: Vec<String> = m.imports.borrow().iter().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default()
    }

    /// Find a function owned by this module by short or full name.
    pub fn get_function(&self, name: &str) -> Function {
        fn_guard!();
        if self.has_error() {
            return Function::null();
        }
        if name.is_empty() {
            push_error!(Module, "trying to search a function with an empty name");
            self.mark_error();
            return Function::null();
        }
        let Some(m) = self.get() else {
            return Function::null();
        };
        let full = LinkSymbolName::global(name).full_name().to_string();
        let funcs = m.funcs.borrow();
        for f in funcs.iter() {
            let fname = f.name();
            if fname == full || fname == name {
                return f.clone();
            }
        }
        push_error!(Module, "function not found in module {}: {}", m.name, name);
        Function::null()
    }

    /// Move the module's functions and symbol tables into a package for
    /// the JIT. The module is no longer `is_init` afterwards.
    pub fn package(&self) -> PackagedModule {
        fn_guard!();
        if self.has_error() {
            return PackagedModule::null();
        }
        if !self.is_init() {
            push_error!(Module, "packaged module can't be created: {}", self.name());
            self.mark_error();
            return PackagedModule::null();
        }
        let Some(m) = self.get() else {
            return PackagedModule::null();
        };
        let mut funcs = Vec::new();
        for f in m.funcs.borrow().iter() {
            if let Some(ir) = f.with_ir_mut(std::mem::take) {
                if !ir.is_empty() {
                    funcs.push(ir);
                }
            }
        }
        m.taken.set(true);
        let result = PackagedModule::build(
            &m.name,
            funcs,
            m.symbols.borrow().clone(),
            m.structs.borrow().clone(),
        );
        result
    }

    /// Serialize the module IR as text to `./{name}[_{suffix}].clif`.
    pub fn write_output(&self, suffix: &str) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if !self.is_init() {
            push_error!(Module, "module not yet init: {}", self.name());
            self.mark_error();
            return;
        }
        let path = if suffix.is_empty() {
            format!("./{}.clif", self.name())
        } else {
            format!("./{}_{}.clif", self.name(), suffix)
        };
        let mut text = Vec::new();
        self.write_to_stream(&mut text);
        if let Err(e) = std::fs::write(&path, text) {
            push_error!(Module, "failed to write module output {}: {}", path, e);
        }
    }

    pub fn write_to_file(&self) {
        fn_guard!();
        self.write_output("");
    }

    pub fn write_to_stream(&self, w: &mut dyn Write) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        let Some(m) = self.get() else {
            return;
        };
        let _ = writeln!(w, "; module {}", m.name);
        let _ = writeln!(w, "; triple {}", m.triple.borrow());
        for f in m.funcs.borrow().iter() {
            let _ = writeln!(w);
            f.write_to_stream(w);
        }
    }
}

thread_local! {
    static CURRENT_MODULE: RefCell<Option<Module>> = const { RefCell::new(None) };
}

/// Scoped guard making a module the implicit target of function calls
/// and hooks; only one module can be current at a time.
pub struct ModuleContext {
    owned: bool,
}

impl ModuleContext {
    pub fn enter(module: &Module) -> ModuleContext {
        fn_guard!();
        let owned = CURRENT_MODULE.with(|c| {
            let mut current = c.borrow_mut();
            if current.is_some() {
                push_error!(Context, "re-setting module context not allowed");
                false
            } else {
                *current = Some(module.clone());
                true
            }
        });
        ModuleContext { owned }
    }

    pub fn has_value() -> bool {
        CURRENT_MODULE.with(|c| c.borrow().is_some())
    }

    pub fn current() -> Option<Module> {
        CURRENT_MODULE.with(|c| c.borrow().clone())
    }
}

impl Drop for ModuleContext {
    fn drop(&mut self) {
        if self.owned {
            CURRENT_MODULE.with(|c| c.borrow_mut().take());
        }
    }
}

/// Inner state of a packaged module.
pub(crate) struct PackagedInner {
    pub name: String,
    pub funcs: Vec<FuncIr>,
    pub symbols: Vec<LinkSymbol>,
    pub structs: FxHashMap<String, TypeInfo>,
}

/// A module whose IR ownership moved out of the cursor, ready to hand to
/// the JIT.
pub struct PackagedModule {
    inner: Option<Rc<PackagedInner>>,
}

impl Clone for PackagedModule {
    fn clone(&self) -> Self {
        PackagedModule { inner: self.inner.clone() }
    }
}

impl PackagedModule {
    fn build(
        name: &str,
        funcs: Vec<FuncIr>,
        symbols: Vec<LinkSymbol>,
        structs: FxHashMap<String, TypeInfo>,
    ) -> PackagedModule {
        let inner = Rc::new(PackagedInner { name: name.to_string(), funcs, symbols, structs });
        Tracker::on_new(ObjectKind::PackagedModule, Rc::as_ptr(&inner) as u64, name);
        PackagedModule { inner: Some(inner) }
    }

    pub fn from_module(module: &Module) -> PackagedModule {
        module.package()
    }

    pub fn null() -> PackagedModule {
        PackagedModule { inner: None }
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn has_error(&self) -> bool {
        self.inner.is_none() || crate::error::ErrorContext::has_error()
    }

    pub fn name(&self) -> String {
        self.inner.as_ref().map(|i| i.name.clone()).unwrap_or_default()
    }

    pub fn public_symbols(&self) -> Vec<LinkSymbol> {
        self.inner.as_ref().map(|i| i.symbols.clone()).unwrap_or_default()
    }

    pub fn struct_type(&self, name: &str) -> TypeInfo {
        self.inner
            .as_ref()
            .and_then(|i| i.structs.get(name).cloned())
            .unwrap_or_else(TypeInfo::null)
    }

    pub(crate) fn inner(&self) -> Option<&Rc<PackagedInner>> {
        self.inner.as_ref()
    }
}

impl PartialEq for PackagedModule {
    fn eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}
