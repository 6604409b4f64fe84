//! Structured if/else over code sections
//!
//! `IfElseCond` mints three child sections (`{name}.then`, `{name}.else`,
//! `{name}.post`), runs user closures inside the branch sections, and on
//! `bind` emits the conditional jump from the enclosing section. An
//! unpopulated branch routes straight to the post section, which is left
//! entered and detached so subsequent code lands there.

use std::cell::Cell;

use crate::error::{fn_guard, push_error, ErrorContext};
use crate::section::{CodeSection, CodeSectionContext};
use crate::value::ValueInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchKind {
    None,
    Then,
    Else,
}

struct BranchSection {
    section: CodeSection,
}

impl BranchSection {
    fn new(name: String) -> BranchSection {
        if ErrorContext::has_error() {
            return BranchSection { section: CodeSection::null() };
        }
        let section = CodeSectionContext::current_function().mk_section(&name);
        BranchSection { section }
    }

    fn is_populated(&self) -> bool {
        self.section.is_open()
    }

    fn is_sealed(&self) -> bool {
        self.section.is_sealed()
    }
}

/// Builder for one conditional region.
pub struct IfElseCond {
    name: String,
    cond: ValueInfo,
    parent: CodeSection,
    then_branch: BranchSection,
    else_branch: BranchSection,
    post: CodeSection,
    inside: Cell<BranchKind>,
    sealed: Cell<bool>,
}

impl IfElseCond {
    /// The condition must be boolean and a section must be open.
    pub fn new(name: &str, cond: &ValueInfo) -> IfElseCond {
        fn_guard!();
        let parent = CodeSectionContext::current_section();
        let then_branch = BranchSection::new(format!("{}.then", name));
        let else_branch = BranchSection::new(format!("{}.else", name));
        let post = if ErrorContext::has_error() {
            CodeSection::null()
        } else {
            CodeSectionContext::current_function().mk_section(&format!("{}.post", name))
        };
        if name.is_empty() {
            push_error!(BranchError, "branching without a branch name");
        }
        if cond.has_error() {
            push_error!(BranchError, "branching with an invalid value");
        } else if !cond.ty().is_boolean() {
            push_error!(BranchError, "branching can only be done over a boolean value");
        }
        IfElseCond {
            name: name.to_string(),
            cond: cond.clone(),
            parent,
            then_branch,
            else_branch,
            post,
            inside: Cell::new(BranchKind::None),
            sealed: Cell::new(false),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.get()
    }

    /// Populate the then-branch.
    pub fn then_branch(&self, body: impl FnOnce()) {
        self.run_branch(BranchKind::Then, body);
    }

    /// Populate the else-branch.
    pub fn else_branch(&self, body: impl FnOnce()) {
        self.run_branch(BranchKind::Else, body);
    }

    fn run_branch(&self, kind: BranchKind, body: impl FnOnce()) {
        fn_guard!();
        if ErrorContext::has_error() {
            return;
        }
        if self.sealed.get() {
            push_error!(BranchError, "if-else already sealed: {}", self.name);
            return;
        }
        if self.inside.get() != BranchKind::None {
            push_error!(CodeSection, "can't enter a branch while inside another branch");
            return;
        }
        let branch = match kind {
            BranchKind::Then => &self.then_branch,
            BranchKind::Else => &self.else_branch,
            BranchKind::None => return,
        };
        branch.section.enter();
        if branch.section.has_error() {
            return;
        }
        self.inside.set(kind);
        body();
        // A branch body that did not terminate itself falls through to
        // the post section.
        if branch.section.is_open() && !branch.section.is_sealed() {
            branch.section.jump_to_section(&self.post);
        }
        self.inside.set(BranchKind::None);
    }

    /// Emit the conditional jump from the enclosing section and leave the
    /// post section open and detached.
    pub fn bind(&self) {
        fn_guard!();
        if ErrorContext::has_error() {
            return;
        }
        if self.sealed.get() {
            push_error!(BranchError, "if-else already sealed: {}", self.name);
            return;
        }
        if self.inside.get() != BranchKind::None {
            push_error!(CodeSection, "can't bind while inside a branch");
            return;
        }
        if !CodeSectionContext::is_current_section(&self.parent) {
            push_error!(CodeSection, "enclosing section is no longer current: {}", self.name);
            return;
        }
        let then_dst = if self.then_branch.is_populated() {
            self.then_branch.section.clone()
        } else {
            self.post.clone()
        };
        let else_dst = if self.else_branch.is_populated() {
            self.else_branch.section.clone()
        } else {
            self.post.clone()
        };
        self.parent.conditional_jump(&self.cond, &then_dst, &else_dst);
        self.post.enter();
        self.post.detach();
        self.sealed.set(true);
    }
}

impl Drop for IfElseCond {
    fn drop(&mut self) {
        if !self.then_branch.is_sealed() && !self.else_branch.is_sealed() {
            crate::error::ErrorContext::push_error(
                crate::error::ErrorKind::BranchError,
                format!("then/else branch not found for condition: {}", self.name),
                file!(),
                line!(),
            );
        }
        if !self.sealed.get() {
            crate::error::ErrorContext::push_error(
                crate::error::ErrorKind::BranchError,
                format!("if-else condition was never completed: {}", self.name),
                file!(),
                line!(),
            );
        }
    }
}
