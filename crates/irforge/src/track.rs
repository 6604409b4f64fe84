//! Object-lifecycle tracking
//!
//! A process-wide registry of callbacks invoked when builder objects are
//! created and destroyed. Used for leak diagnostics in long-lived hosts;
//! the registry is empty unless a callback is installed.

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Kinds of tracked objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Cursor,
    Module,
    PackagedModule,
    LinkSymbol,
    Function,
    CodeSection,
    Type,
    Value,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Cursor => "cursor",
            ObjectKind::Module => "module",
            ObjectKind::PackagedModule => "packaged-module",
            ObjectKind::LinkSymbol => "link-symbol",
            ObjectKind::Function => "function",
            ObjectKind::CodeSection => "code-section",
            ObjectKind::Type => "type",
            ObjectKind::Value => "value",
        }
    }
}

/// Callback notified on object creation and destruction.
pub trait TrackCallback: Send {
    fn on_new(&self, kind: ObjectKind, id: u64, name: &str);
    fn on_delete(&self, kind: ObjectKind, id: u64, name: &str);
}

static REGISTRY: Lazy<Mutex<Vec<Box<dyn TrackCallback>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Global tracking registry.
pub struct Tracker;

impl Tracker {
    pub fn add_callback(cb: Box<dyn TrackCallback>) {
        REGISTRY.lock().push(cb);
    }

    pub fn callback_count() -> usize {
        REGISTRY.lock().len()
    }

    pub(crate) fn on_new(kind: ObjectKind, id: u64, name: &str) {
        let reg = REGISTRY.lock();
        for cb in reg.iter() {
            cb.on_new(kind, id, name);
        }
    }

    pub(crate) fn on_delete(kind: ObjectKind, id: u64, name: &str) {
        let reg = REGISTRY.lock();
        for cb in reg.iter() {
            cb.on_delete(kind, id, name);
        }
    }
}

/// Stderr logger for object churn.
#[cfg(feature = "debug-events")]
pub struct StderrTracker;

#[cfg(feature = "debug-events")]
impl TrackCallback for StderrTracker {
    fn on_new(&self, kind: ObjectKind, id: u64, name: &str) {
        eprintln!("+ {} {:#x} {}", kind.as_str(), id, name);
    }

    fn on_delete(&self, kind: ObjectKind, id: u64, name: &str) {
        eprintln!("- {} {:#x} {}", kind.as_str(), id, name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting(Arc<AtomicUsize>, Arc<AtomicUsize>);

    impl TrackCallback for Counting {
        fn on_new(&self, _kind: ObjectKind, _id: u64, _name: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn on_delete(&self, _kind: ObjectKind, _id: u64, _name: &str) {
            self.1.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_callbacks_observe_events() {
        let news = Arc::new(AtomicUsize::new(0));
        let dels = Arc::new(AtomicUsize::new(0));
        Tracker::add_callback(Box::new(Counting(news.clone(), dels.clone())));

        Tracker::on_new(ObjectKind::Type, 1, "int32");
        Tracker::on_new(ObjectKind::Module, 2, "m");
        Tracker::on_delete(ObjectKind::Type, 1, "int32");

        assert!(news.load(Ordering::SeqCst) >= 2);
        assert!(dels.load(Ordering::SeqCst) >= 1);
    }
}
