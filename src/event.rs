use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use serde_json::Value;

/// The kind of change an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Update,
    DeleteById,
    DeleteAll,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Create => "Create",
            EventKind::Update => "Update",
            EventKind::DeleteById => "DeleteByID",
            EventKind::DeleteAll => "DeleteAll",
        };
        f.write_str(name)
    }
}

/// Tagged payload of an event.
///
/// `DeleteById` carries an entity shell; only its ID field is meaningful.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Create(Value),
    Update(Value),
    DeleteById(Value),
    DeleteAll,
}

impl Change {
    pub fn kind(&self) -> EventKind {
        match self {
            Change::Create(_) => EventKind::Create,
            Change::Update(_) => EventKind::Update,
            Change::DeleteById(_) => EventKind::DeleteById,
            Change::DeleteAll => EventKind::DeleteAll,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Change::Create(v) | Change::Update(v) | Change::DeleteById(v) => Some(v),
            Change::DeleteAll => None,
        }
    }
}

/// Where an event was produced.
///
/// The backtrace is only resolved when `RUST_BACKTRACE` is set.
#[derive(Clone)]
pub struct Trace {
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

impl Trace {
    #[track_caller]
    pub fn capture() -> Self {
        Self {
            location: Location::caller(),
            backtrace: Arc::new(Backtrace::capture()),
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.backtrace.status() {
            BacktraceStatus::Captured => Some(&self.backtrace),
            _ => None,
        }
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Trace({})", self.location)
    }
}

/// One entry of the event log.
#[derive(Debug, Clone)]
pub struct Event {
    /// Logical store the event belongs to.
    pub namespace: String,
    pub change: Change,
    pub trace: Trace,
}

impl Event {
    #[track_caller]
    pub fn new(namespace: impl Into<String>, change: Change) -> Self {
        Self {
            namespace: namespace.into(),
            change,
            trace: Trace::capture(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.change.kind()
    }

    pub fn value(&self) -> Option<&Value> {
        self.change.value()
    }

    pub fn belongs_to(&self, namespace: &str) -> bool {
        self.namespace == namespace
    }
}

/// Events compare by content; the trace is debugging metadata only.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.change == other.change
    }
}
