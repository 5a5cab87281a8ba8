//! Request context - cancellation, deadlines and scoped values.
//!
//! Every I/O-ish operation of the log, repositories and the cache manager takes
//! a `&Context`. Contexts form a chain: children inherit cancellation and
//! deadlines from their ancestors and can shadow values by key. The event log
//! stores its open transaction in the context under a log-local key.
//!
//! ```
//! use sourced_cache::Context;
//!
//! let (ctx, cancel) = Context::background().with_cancel();
//! assert!(ctx.check().is_ok());
//!
//! cancel.cancel();
//! assert!(ctx.check().is_err());
//! ```

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// A cheap-to-clone request scope.
#[derive(Clone)]
pub struct Context {
    node: Arc<Node>,
}

struct Node {
    parent: Option<Context>,
    kind: NodeKind,
}

enum NodeKind {
    Root,
    Cancel(Arc<AtomicBool>),
    Deadline(Instant),
    Value {
        key: String,
        value: Arc<dyn Any + Send + Sync>,
    },
}

/// Cancels the context it was created with, and every context derived from it.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// The root context. Never cancelled, carries no values.
    pub fn background() -> Self {
        Self {
            node: Arc::new(Node {
                parent: None,
                kind: NodeKind::Root,
            }),
        }
    }

    fn child(&self, kind: NodeKind) -> Self {
        Self {
            node: Arc::new(Node {
                parent: Some(self.clone()),
                kind,
            }),
        }
    }

    /// Derive a context that is cancelled when the returned handle fires.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = self.child(NodeKind::Cancel(Arc::clone(&flag)));
        (ctx, CancelHandle { flag })
    }

    /// Derive a context that expires at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.child(NodeKind::Deadline(deadline))
    }

    /// Derive a context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let now = Instant::now();
        self.with_deadline(now.checked_add(timeout).unwrap_or(now))
    }

    /// Derive a context carrying `value` under `key`.
    pub fn with_value<T>(&self, key: impl Into<String>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.child(NodeKind::Value {
            key: key.into(),
            value: Arc::new(value),
        })
    }

    /// Look up the nearest value stored under `key` with type `T`.
    pub fn value<T>(&self, key: &str) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        let mut current = Some(self);
        while let Some(ctx) = current {
            if let NodeKind::Value { key: k, value } = &ctx.node.kind {
                if k == key {
                    return value.downcast_ref::<T>();
                }
            }
            current = ctx.node.parent.as_ref();
        }
        None
    }

    /// The cancellation cause, if this context or an ancestor is done.
    pub fn err(&self) -> Option<Error> {
        let mut current = Some(self);
        while let Some(ctx) = current {
            match &ctx.node.kind {
                NodeKind::Cancel(flag) if flag.load(Ordering::SeqCst) => {
                    return Some(Error::Cancelled)
                }
                NodeKind::Deadline(deadline) if Instant::now() >= *deadline => {
                    return Some(Error::DeadlineExceeded)
                }
                _ => {}
            }
            current = ctx.node.parent.as_ref();
        }
        None
    }

    /// `Err` with the cancellation cause when the context is done.
    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut depth = 0usize;
        let mut current = self.node.parent.as_ref();
        while let Some(ctx) = current {
            depth += 1;
            current = ctx.node.parent.as_ref();
        }
        f.debug_struct("Context")
            .field("depth", &depth)
            .field("done", &self.is_done())
            .finish()
    }
}
