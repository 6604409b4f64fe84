//! Code sections
//!
//! A section is a labeled straight-line block of a function with an
//! explicit lifecycle: `closed -> open -> sealed -> committed`. Entering
//! a section saves the cursor's insertion point and redirects emission
//! into the section's block; emitting any terminator seals the section
//! and exits it, restoring the previous insertion point. A thread-local
//! section stack tracks nesting; detached sections survive the normal
//! scope discipline so branch helpers can leave a join block open.

use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::io::Write;
use std::rc::Rc;

use crate::cursor::{self, CursorContext, InsertPoint};
use crate::error::{fn_guard, push_error};
use crate::function::Function;
use crate::handle::WeakHandle;
use crate::ir::{BlockId, Reg, Terminator};
use crate::track::{ObjectKind, Tracker};
use crate::types::TypeInfo;
use crate::value::ValueInfo;
use crate::vars::VariableStack;

/// Implementation record; owned by the function's section list.
pub(crate) struct SectionInner {
    name: String,
    func: Function,
    block: BlockId,
    /// Insertion point active before `enter`; `None` until entered.
    saved_ip: RefCell<Option<Option<InsertPoint>>>,
    open: Cell<bool>,
    sealed: Cell<bool>,
    committed: Cell<bool>,
    eval_cache: RefCell<FxHashMap<usize, Reg>>,
}

impl SectionInner {
    pub(crate) fn section_name(&self) -> &str {
        &self.name
    }
}

impl Drop for SectionInner {
    fn drop(&mut self) {
        Tracker::on_delete(ObjectKind::CodeSection, self as *const _ as u64, &self.name);
    }
}

/// Handle to a code section.
pub struct CodeSection {
    h: WeakHandle<SectionInner>,
}

impl Clone for CodeSection {
    fn clone(&self) -> Self {
        CodeSection { h: self.h.clone() }
    }
}

impl PartialEq for CodeSection {
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

impl CodeSection {
    /// Mint a section inside `func`; called through `Function::mk_section`.
    pub(crate) fn create(name: &str, func: &Function) -> CodeSection {
        fn_guard!();
        if name.is_empty() {
            push_error!(CodeSection, "section name can't be empty");
            return CodeSection::null();
        }
        if func.has_error() {
            return CodeSection::null();
        }
        if func.is_external() {
            push_error!(CodeSection, "external functions can't have a section defined");
            return CodeSection::null();
        }
        if !CursorContext::has_value() {
            push_error!(Context, "no cursor in context");
            return CodeSection::null();
        }
        let Some(block) = func.add_block(name) else {
            return CodeSection::null();
        };
        let inner = Rc::new(SectionInner {
            name: name.to_string(),
            func: func.clone(),
            block,
            saved_ip: RefCell::new(None),
            open: Cell::new(false),
            sealed: Cell::new(false),
            committed: Cell::new(false),
            eval_cache: RefCell::new(FxHashMap::default()),
        });
        Tracker::on_new(ObjectKind::CodeSection, Rc::as_ptr(&inner) as u64, name);
        let section = CodeSection { h: WeakHandle::valid(&inner) };
        func.adopt_section(inner);
        section
    }

    pub fn null() -> CodeSection {
        CodeSection { h: WeakHandle::null() }
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

    fn get(&self) -> Option<Rc<SectionInner>> {
        self.h.get_or_error(crate::error::ErrorKind::CodeSection, "code section")
    }

    pub fn name(&self) -> String {
        if self.has_error() {
            return String::new();
        }
        self.get().map(|s| s.name.clone()).unwrap_or_default()
    }

    pub fn is_valid(&self) -> bool {
        !self.has_error() && self.h.get().is_some()
    }

    pub fn is_open(&self) -> bool {
        if self.has_error() {
            return false;
        }
        self.get().map(|s| s.open.get()).unwrap_or(false)
    }

    pub fn is_sealed(&self) -> bool {
        if self.has_error() {
            return false;
        }
        self.get().map(|s| s.sealed.get()).unwrap_or(false)
    }

    pub fn is_commit(&self) -> bool {
        if self.has_error() {
            return false;
        }
        self.get().map(|s| s.committed.get()).unwrap_or(false)
    }

    pub fn function(&self) -> Function {
        if self.has_error() {
            return Function::null();
        }
        self.get().map(|s| s.func.clone()).unwrap_or_else(Function::null)
    }

    pub(crate) fn block(&self) -> Option<BlockId> {
        self.h.get().map(|s| s.block)
    }

    /// Open the section: save the insertion point, redirect emission to
    /// this block, push onto the section stack, and bind the `context`
    /// variable of the enclosing function.
    pub fn enter(&self) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        let Some(inner) = self.get() else {
            return;
        };
        if inner.open.get() {
            push_error!(CodeSection, "section can't be opened again: {}", inner.name);
            self.mark_error();
            return;
        }
        if inner.sealed.get() || inner.committed.get() {
            push_error!(CodeSection, "section already closed: {}", inner.name);
            self.mark_error();
            return;
        }
        let ip = InsertPoint { func: inner.func.inner_weak(), block: inner.block };
        let Some(prev) = cursor::set_insert(Some(ip)) else {
            self.mark_error();
            return;
        };
        *inner.saved_ip.borrow_mut() = Some(prev);
        inner.open.set(true);

        CodeSectionContext::push_section(self);
        if !self.has_error() {
            let ctx_value = CodeSectionContext::current_context();
            if !ctx_value.has_error() {
                VariableStack::with(|vars| vars.set("context", &ctx_value));
            }
        }
    }

    fn exit_internal(&self) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        let Some(inner) = self.get() else {
            return;
        };
        if !inner.open.get() {
            push_error!(CodeSection, "section is not open: {}", inner.name);
            self.mark_error();
            return;
        }
        if !inner.sealed.get() {
            push_error!(CodeSection, "section is not sealed: {}", inner.name);
            self.mark_error();
            return;
        }
        if inner.committed.get() {
            push_error!(CodeSection, "section already committed: {}", inner.name);
            self.mark_error();
            return;
        }
        let saved = inner.saved_ip.borrow_mut().take().unwrap_or(None);
        cursor::set_insert(saved);
        inner.committed.set(true);
        CodeSectionContext::pop_section(self);
    }

    /// Seal with a `return` terminator; the value must match the
    /// function's declared return type.
    pub fn set_return_value(&self, value: &ValueInfo) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if value.has_error() {
            push_error!(CodeSection, "return value can't be an invalid value");
            self.mark_error();
            return;
        }
        let Some(inner) = self.get() else {
            return;
        };
        if !inner.open.get() {
            push_error!(CodeSection, "section not open: {}", inner.name);
            self.mark_error();
            return;
        }
        if inner.sealed.get() {
            push_error!(CodeSection, "section already sealed: {}", inner.name);
            self.mark_error();
            return;
        }
        let value_ty = value.ty();
        let fn_ty = inner.func.return_type();
        if value_ty != fn_ty {
            push_error!(
                CodeSection,
                "return value type does not match function return type: found {}, expected {}",
                value_ty.short_name(),
                fn_ty.short_name()
            );
            self.mark_error();
            return;
        }
        let Some(reg) = value.materialize() else {
            self.mark_error();
            return;
        };
        if !inner.func.set_terminator(inner.block, Terminator::Return(Some(reg))) {
            self.mark_error();
            return;
        }
        inner.sealed.set(true);
        self.exit_internal();
    }

    /// Seal with an unconditional jump.
    pub fn jump_to_section(&self, dst: &CodeSection) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if dst.has_error() {
            push_error!(CodeSection, "can't jump to an invalid section");
            self.mark_error();
            return;
        }
        if *self == *dst {
            push_error!(CodeSection, "section can't jump to itself: {}", self.name());
            self.mark_error();
            return;
        }
        let Some(inner) = self.get() else {
            return;
        };
        let Some(dst_block) = dst.block() else {
            self.mark_error();
            return;
        };
        if !inner.open.get() {
            push_error!(CodeSection, "section not open: {}", inner.name);
            self.mark_error();
            return;
        }
        if inner.sealed.get() {
            push_error!(CodeSection, "section already sealed: {}", inner.name);
            self.mark_error();
            return;
        }
        if !inner.func.set_terminator(inner.block, Terminator::Jump(dst_block)) {
            self.mark_error();
            return;
        }
        inner.sealed.set(true);
        self.exit_internal();
    }

    /// Seal with a conditional jump on a boolean value.
    pub fn conditional_jump(&self, cond: &ValueInfo, then_dst: &CodeSection, else_dst: &CodeSection) {
        fn_guard!();
        if self.has_error() {
            return;
        }
        if cond.has_error() || then_dst.has_error() || else_dst.has_error() {
            push_error!(CodeSection, "can't branch on invalid condition or destinations");
            self.mark_error();
            return;
        }
        if !cond.ty().is_boolean() {
            push_error!(BranchError, "branching can only be done over a boolean value");
            self.mark_error();
            return;
        }
        let Some(inner) = self.get() else {
            return;
        };
        let (Some(then_block), Some(else_block)) = (then_dst.block(), else_dst.block()) else {
            self.mark_error();
            return;
        };
        if !inner.open.get() {
            push_error!(CodeSection, "section not open: {}", inner.name);
            self.mark_error();
            return;
        }
        if inner.sealed.get() {
            push_error!(CodeSection, "section already sealed: {}", inner.name);
            self.mark_error();
            return;
        }
        let Some(cond_reg) = cond.materialize() else {
            self.mark_error();
            return;
        };
        let term = Terminator::Branch { cond: cond_reg, then_block, else_block };
        if !inner.func.set_terminator(inner.block, term) {
            self.mark_error();
            return;
        }
        inner.sealed.set(true);
        self.exit_internal();
    }

    /// Move this section into the persistent detached list so it stays
    /// open when enclosing scopes unwind.
    pub fn detach(&self) -> CodeSection {
        fn_guard!();
        if self.has_error() {
            return CodeSection::null();
        }
        if self.get().is_none() {
            return CodeSection::null();
        }
        CodeSectionContext::detach(self)
    }

    pub(crate) fn cached_eval(&self, key: usize) -> Option<Reg> {
        let inner = self.h.get()?;
        let cached = inner.eval_cache.borrow().get(&key).copied();
        cached
    }

    pub(crate) fn cache_eval(&self, key: usize, reg: Reg) {
        if let Some(inner) = self.h.get() {
            inner.eval_cache.borrow_mut().insert(key, reg);
        }
    }
}

thread_local! {
    static SECTIONS: RefCell<Vec<CodeSection>> = const { RefCell::new(Vec::new()) };
    static DETACHED: RefCell<Vec<CodeSection>> = const { RefCell::new(Vec::new()) };
}

/// Thread-local section bookkeeping plus variable-context operations.
pub struct CodeSectionContext;

impl CodeSectionContext {
    pub(crate) fn push_section(code: &CodeSection) {
        fn_guard!();
        if code.has_error() {
            push_error!(CodeSection, "can't push an invalid section");
            return;
        }
        SECTIONS.with(|s| {
            let mut stack = s.borrow_mut();
            for existing in stack.iter() {
                if *existing == *code {
                    push_error!(CodeSection, "section already entered, can't re-enter");
                    code.mark_error();
                    return;
                }
                if existing.function() != code.function() {
                    push_error!(CodeSection, "sections on the stack must belong to one function");
                    code.mark_error();
                    return;
                }
            }
            stack.push(code.clone());
        });
    }

    pub(crate) fn pop_section(code: &CodeSection) {
        fn_guard!();
        if code.has_error() {
            push_error!(CodeSection, "can't pop an invalid section");
            return;
        }
        SECTIONS.with(|s| {
            let mut stack = s.borrow_mut();
            match stack.last() {
                None => {
                    push_error!(CodeSection, "can't pop section, none open: {}", code.name());
                }
                Some(top) if *top != *code => {
                    push_error!(CodeSection, "section mismatch: {} <-> {}", code.name(), top.name());
                }
                Some(_) => {
                    stack.pop();
                }
            }
        });
    }

    pub(crate) fn detach(code: &CodeSection) -> CodeSection {
        fn_guard!();
        let is_top = SECTIONS.with(|s| s.borrow().last().map(|t| *t == *code).unwrap_or(false));
        if !is_top {
            push_error!(CodeSection, "only the current section can be detached: {}", code.name());
            return CodeSection::null();
        }
        DETACHED.with(|d| d.borrow_mut().push(code.clone()));
        code.clone()
    }

    pub fn current_section() -> CodeSection {
        SECTIONS.with(|s| s.borrow().last().cloned()).unwrap_or_else(CodeSection::null)
    }

    pub fn is_current_section(code: &CodeSection) -> bool {
        fn_guard!();
        if code.has_error() {
            push_error!(CodeSection, "can't use an invalid section");
            return false;
        }
        SECTIONS.with(|s| s.borrow().last().map(|t| *t == *code).unwrap_or(false))
    }

    pub fn current_function() -> Function {
        Self::current_section().function()
    }

    /// The enclosing function's context argument value.
    pub fn current_context() -> ValueInfo {
        Self::current_function().context_value()
    }

    /// Mint a section in the current function.
    pub fn mk_section(name: &str) -> CodeSection {
        fn_guard!();
        if name.is_empty() {
            push_error!(CodeSection, "can't make a section with an empty name");
            return CodeSection::null();
        }
        let func = Self::current_function();
        if func.has_error() {
            push_error!(CodeSection, "no function for the new section");
            return CodeSection::null();
        }
        func.mk_section(name)
    }

    /// Return from the current section.
    pub fn set_return_value(value: &ValueInfo) {
        fn_guard!();
        if value.has_error() {
            push_error!(CodeSection, "invalid value can't be returned");
            return;
        }
        let section = Self::current_section();
        if section.has_error() {
            push_error!(CodeSection, "no open section to return from");
            return;
        }
        section.set_return_value(value);
    }

    /// Jump from the current section.
    pub fn jump_to_section(dst: &CodeSection) {
        fn_guard!();
        let section = Self::current_section();
        if section.has_error() {
            push_error!(CodeSection, "no open section to jump from");
            return;
        }
        if dst.has_error() {
            push_error!(CodeSection, "can't jump to an invalid section");
            return;
        }
        section.jump_to_section(dst);
    }

    /// Open a fresh detached section and run `defn` inside it.
    pub fn define_section(name: &str, func: &Function, defn: impl FnOnce()) {
        fn_guard!();
        if name.is_empty() {
            push_error!(CodeSection, "can't make a section with an empty name");
            return;
        }
        if func.has_error() {
            push_error!(CodeSection, "can't make a section without a valid function");
            return;
        }
        let section = func.mk_section(name);
        section.enter();
        section.detach();
        defn();
    }

    /// End the current section with a jump into a freshly opened one.
    pub fn section_break(new_section_name: &str) {
        fn_guard!();
        if new_section_name.is_empty() {
            push_error!(CodeSection, "can't make a section with an empty name");
            return;
        }
        let section = Self::current_function().mk_section(new_section_name);
        Self::current_section().jump_to_section(&section);
        section.enter();
        section.detach();
    }

    // --- variable-context operations ---------------------------------

    pub fn push_var_context() {
        VariableStack::with(|vars| vars.push_context());
    }

    pub fn pop_var_context() {
        VariableStack::with(|vars| vars.pop_context());
    }

    /// Allocate a named pointer slot, optionally storing a default.
    pub fn mk_ptr(name: &str, ty: &TypeInfo, default_value: Option<&ValueInfo>) {
        fn_guard!();
        if name.is_empty() {
            push_error!(CodeSection, "can't make a variable with an empty name");
            return;
        }
        if ty.has_error() {
            push_error!(CodeSection, "can't make a pointer variable of an invalid type");
            return;
        }
        if let Some(v) = default_value {
            if v.has_error() {
                push_error!(CodeSection, "can't make a pointer variable with an invalid default");
                return;
            }
        }
        VariableStack::with(|vars| vars.mk_ptr(name, ty, default_value));
    }

    /// Bind `v` under `name`; stores through an existing pointer slot.
    pub fn set(name: &str, v: &ValueInfo) {
        fn_guard!();
        if name.is_empty() {
            push_error!(CodeSection, "can't store under an empty variable name");
            return;
        }
        if v.has_error() {
            push_error!(CodeSection, "can't store an invalid value");
            return;
        }
        VariableStack::with(|vars| vars.set(name, v));
    }

    /// Latest binding under `name`; loads through pointer slots.
    pub fn pop(name: &str) -> ValueInfo {
        fn_guard!();
        if name.is_empty() {
            push_error!(CodeSection, "can't read an empty variable name");
            return ValueInfo::null();
        }
        VariableStack::with(|vars| vars.try_get_value(name))
    }

    /// Require every stacked section to be sealed, then clear all section
    /// bookkeeping. Returns the number of sections that were stacked.
    pub fn clean_sealed_context() -> usize {
        fn_guard!();
        let count = SECTIONS.with(|s| s.borrow().len());
        let unsealed = SECTIONS.with(|s| {
            s.borrow().iter().find(|sec| !sec.is_sealed()).map(|sec| sec.name())
        });
        if let Some(name) = unsealed {
            push_error!(CodeSection, "section not sealed: {}", name);
            return count;
        }
        SECTIONS.with(|s| s.borrow_mut().clear());
        DETACHED.with(|d| d.borrow_mut().clear());
        count
    }

    pub fn section_stack_depth() -> usize {
        SECTIONS.with(|s| s.borrow().len())
    }

    pub fn print_section_stack(w: &mut dyn Write) {
        SECTIONS.with(|s| {
            let stack = s.borrow();
            let _ = writeln!(w, "number of sections: {}", stack.len());
            for sec in stack.iter() {
                let _ = writeln!(w, "  > {}:{}", sec.name(), sec.is_sealed());
            }
        });
    }

    pub fn print_variable_stack(w: &mut dyn Write) {
        VariableStack::with(|vars| vars.dump(w));
    }
}
