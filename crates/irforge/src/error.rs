//! Thread-local source-location stack and structured error log
//!
//! Every public operation installs a [`SourceContext`] guard on entry and
//! reports failures through [`ErrorContext::push_error`], which snapshots
//! the location stack into the recorded [`Error`]. The `has_error` flag is
//! sticky: once set, every subsequent public operation short-circuits
//! until [`ErrorContext::clear_error`] is called.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::Write;

/// Closed set of error categories reported by the builder and runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    None,
    Unknown,
    TypeError,
    ValueError,
    BranchError,
    LinkSymbol,
    Context,
    Module,
    Function,
    CodeSection,
    Jit,
}

impl ErrorKind {
    /// Stable display name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::None => "none",
            ErrorKind::Unknown => "unknown",
            ErrorKind::TypeError => "type-error",
            ErrorKind::ValueError => "value-error",
            ErrorKind::BranchError => "branch-error",
            ErrorKind::LinkSymbol => "link-symbol",
            ErrorKind::Context => "context",
            ErrorKind::Module => "module",
            ErrorKind::Function => "function",
            ErrorKind::CodeSection => "code-section",
            ErrorKind::Jit => "jit",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry on the source-location stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub file: &'static str,
    pub line: u32,
    pub section: Option<String>,
}

impl SourceLoc {
    pub fn new(file: &'static str, line: u32) -> Self {
        SourceLoc { file, line, section: None }
    }

    pub fn with_section(file: &'static str, line: u32, section: &str) -> Self {
        SourceLoc { file, line, section: Some(section.to_string()) }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.section {
            Some(s) => write!(f, "{}:{} [{}]", self.file, self.line, s),
            None => write!(f, "{}:{}", self.file, self.line),
        }
    }
}

thread_local! {
    static SOURCE_STACK: RefCell<Vec<SourceLoc>> = const { RefCell::new(Vec::new()) };
    static ERROR_LOG: RefCell<Vec<Error>> = const { RefCell::new(Vec::new()) };
    static HAS_ERROR: Cell<bool> = const { Cell::new(false) };
}

/// Scoped guard that pushes a location on construction and restores the
/// stack depth on drop.
pub struct SourceContext {
    restore_len: usize,
}

impl SourceContext {
    pub fn enter(file: &'static str, line: u32) -> Self {
        let restore_len = SOURCE_STACK.with(|s| {
            let mut s = s.borrow_mut();
            s.push(SourceLoc::new(file, line));
            s.len() - 1
        });
        SourceContext { restore_len }
    }

    pub fn enter_section(file: &'static str, line: u32, section: &str) -> Self {
        let restore_len = SOURCE_STACK.with(|s| {
            let mut s = s.borrow_mut();
            s.push(SourceLoc::with_section(file, line, section));
            s.len() - 1
        });
        SourceContext { restore_len }
    }

    /// Rewrite the top entry; used to mark the specific statement a
    /// builder call corresponds to inside a larger guarded scope.
    pub fn update_top(file: &'static str, line: u32) {
        SOURCE_STACK.with(|s| {
            if let Some(top) = s.borrow_mut().last_mut() {
                top.file = file;
                top.line = line;
            }
        });
    }

    pub fn depth() -> usize {
        SOURCE_STACK.with(|s| s.borrow().len())
    }

    pub fn snapshot() -> Vec<SourceLoc> {
        SOURCE_STACK.with(|s| s.borrow().clone())
    }

    pub fn for_each(mut f: impl FnMut(&SourceLoc)) {
        SOURCE_STACK.with(|s| {
            for loc in s.borrow().iter() {
                f(loc);
            }
        });
    }
}

impl Drop for SourceContext {
    fn drop(&mut self) {
        SOURCE_STACK.with(|s| s.borrow_mut().truncate(self.restore_len));
    }
}

/// A recorded error: kind, message, and the source stack at push time.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
    stack: Vec<SourceLoc>,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    pub fn stack(&self) -> &[SourceLoc] {
        &self.stack
    }

    pub fn is_valid(&self) -> bool {
        self.kind != ErrorKind::None
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] {}", self.kind, self.msg)?;
        for loc in self.stack.iter().rev() {
            writeln!(f, "    at {}", loc)?;
        }
        Ok(())
    }
}

/// Maximum number of retained error records; older pushes beyond the cap
/// are dropped on the floor (the sticky flag still latches).
const MAX_ERROR_LOG: usize = 1024;

/// Thread-local append-only error log with a sticky `has_error` flag.
pub struct ErrorContext;

impl ErrorContext {
    pub fn has_error() -> bool {
        HAS_ERROR.with(|e| e.get())
    }

    pub fn clear_error() {
        HAS_ERROR.with(|e| e.set(false));
        ERROR_LOG.with(|l| l.borrow_mut().clear());
    }

    pub fn push_error(kind: ErrorKind, msg: impl Into<String>, file: &'static str, line: u32) {
        HAS_ERROR.with(|e| e.set(true));
        ERROR_LOG.with(|l| {
            let mut log = l.borrow_mut();
            if log.len() >= MAX_ERROR_LOG {
                return;
            }
            let mut stack = SourceContext::snapshot();
            stack.push(SourceLoc::new(file, line));
            log.push(Error { kind, msg: msg.into(), stack });
        });
    }

    pub fn last_error() -> Option<Error> {
        ERROR_LOG.with(|l| l.borrow().last().cloned())
    }

    pub fn error_count() -> usize {
        ERROR_LOG.with(|l| l.borrow().len())
    }

    pub fn for_each(mut f: impl FnMut(&Error)) {
        ERROR_LOG.with(|l| {
            for e in l.borrow().iter() {
                f(e);
            }
        });
    }

    /// Dump the most recent `max` errors with their location stacks.
    pub fn print(w: &mut dyn Write, max: usize) {
        ERROR_LOG.with(|l| {
            let log = l.borrow();
            for e in log.iter().rev().take(max) {
                let _ = write!(w, "{}", e);
            }
        });
    }
}

/// Installs a [`SourceContext`] guard for the current function body.
macro_rules! fn_guard {
    () => {
        let _source_ctx = $crate::error::SourceContext::enter(file!(), line!());
    };
    ($section:expr) => {
        let _source_ctx = $crate::error::SourceContext::enter_section(file!(), line!(), $section);
    };
}

/// Records a structured error at the current location.
macro_rules! push_error {
    ($kind:ident, $($arg:tt)+) => {
        $crate::error::ErrorContext::push_error(
            $crate::error::ErrorKind::$kind,
            format!($($arg)+),
            file!(),
            line!(),
        )
    };
}

pub(crate) use fn_guard;
pub(crate) use push_error;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_stack_push_pop() {
        assert_eq!(SourceContext::depth(), 0);
        {
            let _a = SourceContext::enter("a.rs", 1);
            assert_eq!(SourceContext::depth(), 1);
            {
                let _b = SourceContext::enter_section("b.rs", 2, "body");
                assert_eq!(SourceContext::depth(), 2);
                let snap = SourceContext::snapshot();
                assert_eq!(snap[1].section.as_deref(), Some("body"));
            }
            assert_eq!(SourceContext::depth(), 1);
        }
        assert_eq!(SourceContext::depth(), 0);
    }

    #[test]
    fn test_update_top() {
        let _a = SourceContext::enter("a.rs", 1);
        SourceContext::update_top("a.rs", 99);
        assert_eq!(SourceContext::snapshot()[0].line, 99);
    }

    #[test]
    fn test_error_latches_until_cleared() {
        ErrorContext::clear_error();
        assert!(!ErrorContext::has_error());

        let _g = SourceContext::enter("caller.rs", 10);
        ErrorContext::push_error(ErrorKind::TypeError, "bad type", "callee.rs", 20);
        assert!(ErrorContext::has_error());

        let last = ErrorContext::last_error().unwrap();
        assert_eq!(last.kind(), ErrorKind::TypeError);
        assert_eq!(last.msg(), "bad type");
        // Snapshot holds the caller frame plus the push site.
        assert_eq!(last.stack().len(), 2);
        assert_eq!(last.stack()[0].file, "caller.rs");

        ErrorContext::push_error(ErrorKind::Jit, "later", "x.rs", 1);
        assert_eq!(ErrorContext::last_error().unwrap().kind(), ErrorKind::Jit);
        assert_eq!(ErrorContext::error_count(), 2);

        ErrorContext::clear_error();
        assert!(!ErrorContext::has_error());
        assert_eq!(ErrorContext::error_count(), 0);
    }

    #[test]
    fn test_print_bounded() {
        ErrorContext::clear_error();
        for i in 0..4 {
            ErrorContext::push_error(ErrorKind::Unknown, format!("e{}", i), "f.rs", i);
        }
        let mut buf = Vec::new();
        ErrorContext::print(&mut buf, 2);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("e3"));
        assert!(text.contains("e2"));
        assert!(!text.contains("e1"));
        ErrorContext::clear_error();
    }
}
