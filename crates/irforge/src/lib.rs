//! irforge: a builder-and-runtime facade over a Cranelift JIT
//!
//! Client code describes compilation units (cursors), modules, typed
//! values, functions, and control-flow regions, then hands the result to
//! a JIT runner that compiles, links, and exposes functions plus
//! runtime-reflectable structs, arrays and events callable from the
//! host. The pieces:
//! - Lazy value graphs materialized inside open code sections
//! - A strictly ordered lifecycle: cursor -> bind -> functions ->
//!   sections -> JIT
//! - Thread-local ambient contexts (cursor, module, section stack,
//!   variable frames)
//! - Pushed structured errors with source-location stacks; every handle
//!   short-circuits once an error is latched
//! - A runtime reflection layer whose objects are pointer-linked to
//!   live memory and frozen before event invocation
//!
//! Each cursor is single-threaded; two cursors on two threads coexist
//! because every ambient context is thread-local.

pub mod error;
pub mod track;

mod handle;
mod vars;

pub mod control_flow;
pub mod cursor;
pub mod function;
pub mod ir;
pub mod jit;
pub mod link;
pub mod module;
pub mod runtime;
pub mod section;
pub mod types;
pub mod value;

pub(crate) mod backend;

pub use control_flow::IfElseCond;
pub use cursor::{Cursor, CursorContext};
pub use error::{Error, ErrorContext, ErrorKind, SourceContext, SourceLoc};
pub use function::{FnContext, Function, FunctionBuilder};
pub use jit::{JitRunner, RawEventFn};
pub use link::{LinkSymbol, LinkSymbolName, SymbolClass};
pub use module::{Module, ModuleContext, PackagedModule};
pub use runtime::{Array, EventFn, Field, Namespace, Object, RtType, Struct};
pub use section::{CodeSection, CodeSectionContext};
pub use types::{FieldEntry, MemberField, TypeInfo, TypeKind};
pub use value::{ConstValue, TagInfo, ValueInfo};
