//! Public symbol naming
//!
//! A symbol is either global (`name`) or namespaced (`ns` + `name`, with
//! the canonical linker spelling `ns_name`). The JIT routes namespaced
//! function symbols into their namespace's event directory and global
//! custom-struct symbols into the global namespace.

use crate::error::{fn_guard, push_error};
use crate::track::{ObjectKind, Tracker};
use crate::types::TypeInfo;

const NS_SEPARATOR: &str = "_";

/// Global or namespaced symbol name.
#[derive(Debug, Clone)]
pub struct LinkSymbolName {
    err: bool,
    namespace: String,
    name: String,
    global: bool,
    full: String,
}

impl LinkSymbolName {
    pub fn global(name: &str) -> Self {
        fn_guard!();
        if name.is_empty() {
            push_error!(ValueError, "name can't be empty in link symbol name");
            return Self::null();
        }
        LinkSymbolName {
            err: false,
            namespace: String::new(),
            name: name.to_string(),
            global: true,
            full: name.to_string(),
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        fn_guard!();
        if name.is_empty() {
            push_error!(ValueError, "name can't be empty in link symbol name");
            return Self::null();
        }
        if namespace.is_empty() {
            push_error!(ValueError, "namespace can't be empty in link symbol name");
            return Self::null();
        }
        LinkSymbolName {
            err: false,
            namespace: namespace.to_string(),
            name: name.to_string(),
            global: false,
            full: format!("{}{}{}", namespace, NS_SEPARATOR, name),
        }
    }

    pub fn null() -> Self {
        LinkSymbolName {
            err: true,
            namespace: String::new(),
            name: String::new(),
            global: false,
            full: String::new(),
        }
    }

    pub fn has_error(&self) -> bool {
        self.err
    }

    pub fn is_valid(&self) -> bool {
        !self.err && !self.name.is_empty() && (self.global || !self.namespace.is_empty())
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    pub fn short_name(&self) -> &str {
        &self.name
    }

    pub fn namespace_name(&self) -> &str {
        &self.namespace
    }

    pub fn full_name(&self) -> &str {
        &self.full
    }
}

impl PartialEq for LinkSymbolName {
    fn eq(&self, other: &Self) -> bool {
        if self.err && other.err {
            return true;
        }
        if self.err || other.err {
            return false;
        }
        self.global == other.global && self.namespace == other.namespace && self.name == other.name
    }
}

/// What a public symbol denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolClass {
    Function,
    CustomStruct,
}

/// A module's public symbol: name, carried type, class, and for functions
/// an argument list.
#[derive(Debug, Clone)]
pub struct LinkSymbol {
    err: bool,
    name: LinkSymbolName,
    ty: TypeInfo,
    class: SymbolClass,
    args: Vec<(TypeInfo, String)>,
}

impl LinkSymbol {
    pub fn function(name: LinkSymbolName, return_type: TypeInfo) -> Self {
        fn_guard!();
        let sym = LinkSymbol { err: false, name, ty: return_type, class: SymbolClass::Function, args: vec![] };
        let sym = sym.validated();
        Tracker::on_new(ObjectKind::LinkSymbol, &sym as *const _ as u64, sym.name.short_name());
        sym
    }

    pub fn custom_struct(name: LinkSymbolName, struct_type: TypeInfo) -> Self {
        fn_guard!();
        let sym =
            LinkSymbol { err: false, name, ty: struct_type, class: SymbolClass::CustomStruct, args: vec![] };
        let sym = sym.validated();
        Tracker::on_new(ObjectKind::LinkSymbol, &sym as *const _ as u64, sym.name.short_name());
        sym
    }

    fn validated(mut self) -> Self {
        if self.name.has_error() || self.ty.has_error() {
            self.err = true;
            return self;
        }
        if !self.name.is_valid() {
            push_error!(LinkSymbol, "link symbol name not valid");
            self.err = true;
        } else if self.class == SymbolClass::CustomStruct && !self.ty.is_struct() {
            push_error!(LinkSymbol, "custom-struct symbol carries a non-struct type");
            self.err = true;
        }
        self
    }

    pub fn null() -> Self {
        LinkSymbol {
            err: true,
            name: LinkSymbolName::null(),
            ty: TypeInfo::null(),
            class: SymbolClass::Function,
            args: vec![],
        }
    }

    pub fn has_error(&self) -> bool {
        self.err
    }

    pub fn is_valid(&self) -> bool {
        !self.err && self.name.is_valid()
    }

    pub fn add_arg(&mut self, ty: &TypeInfo, name: &str) {
        fn_guard!();
        if self.err {
            return;
        }
        if ty.has_error() {
            push_error!(LinkSymbol, "arg type can't be invalid");
            self.err = true;
            return;
        }
        if name.is_empty() {
            push_error!(LinkSymbol, "arg name can't be empty");
            self.err = true;
            return;
        }
        if self.class != SymbolClass::Function {
            push_error!(LinkSymbol, "not a function symbol, can't add arg");
            self.err = true;
            return;
        }
        self.args.push((ty.clone(), name.to_string()));
    }

    pub fn symbol_name(&self) -> &LinkSymbolName {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        self.name.full_name()
    }

    pub fn short_name(&self) -> &str {
        self.name.short_name()
    }

    pub fn equals_name(&self, name: &str) -> bool {
        self.name.full_name() == name
    }

    pub fn class(&self) -> SymbolClass {
        self.class
    }

    pub fn is_function(&self) -> bool {
        self.class == SymbolClass::Function
    }

    pub fn is_custom_struct(&self) -> bool {
        self.class == SymbolClass::CustomStruct
    }

    pub fn carried_type(&self) -> &TypeInfo {
        &self.ty
    }

    pub fn args(&self) -> &[(TypeInfo, String)] {
        &self.args
    }
}

impl PartialEq for LinkSymbol {
    fn eq(&self, other: &Self) -> bool {
        if self.err && other.err {
            return true;
        }
        if self.name != other.name {
            return false;
        }
        if self.is_function() {
            if self.args.len() != other.args.len() {
                return false;
            }
            for (a, b) in self.args.iter().zip(other.args.iter()) {
                if a.0 != b.0 || a.1 != b.1 {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorContext;

    #[test]
    fn test_full_name_forms() {
        ErrorContext::clear_error();
        let g = LinkSymbolName::global("run");
        assert!(g.is_global());
        assert_eq!(g.full_name(), "run");

        let n = LinkSymbolName::namespaced("engine", "run");
        assert!(!n.is_global());
        assert_eq!(n.full_name(), "engine_run");
        assert_eq!(n.short_name(), "run");
        assert_eq!(n.namespace_name(), "engine");
    }

    #[test]
    fn test_empty_name_is_error() {
        ErrorContext::clear_error();
        let g = LinkSymbolName::global("");
        assert!(g.has_error());
        assert!(ErrorContext::has_error());
        ErrorContext::clear_error();

        let n = LinkSymbolName::namespaced("", "x");
        assert!(n.has_error());
        ErrorContext::clear_error();
    }
}
