//! Event Log - ordered, append-only, in-memory event sequence and the
//! transaction substrate for repositories built on top of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     EventLog (shared)                        │
//! │  - events: RwLock<Vec<Event>>   (committed, append order)    │
//! │  - dispatcher: one drainer at a time, FIFO by append seq     │
//! │  - registry: Mutex<Vec<subscription>>                        │
//! └─────────────────────────────────────────────────────────────┘
//!          ▲                                   │
//!          │ commit replays staged events      ▼
//! ┌─────────────────┐              ┌───────────────────────────┐
//! │  Transaction    │              │ Subscription (per sub)    │
//! │  parent: log or │              │ sync: Handle inline       │
//! │  enclosing tx   │              │ async: queue + 1 worker   │
//! └─────────────────┘              └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use sourced_cache::{Change, Context, Event, EventLog};
//!
//! let log = EventLog::new();
//! let ctx = log.begin_tx(&Context::background()).unwrap();
//! log.append(&ctx, Event::new("todos", Change::DeleteAll)).unwrap();
//! assert!(log.events().unwrap().is_empty());
//!
//! log.commit_tx(&ctx).unwrap();
//! assert_eq!(log.events().unwrap().len(), 1);
//! ```

mod log;
mod subscription;
mod transaction;

use serde::Deserialize;

pub use log::EventLog;
pub use subscription::LogSubscription;
pub use transaction::{Transaction, TxStatus};

/// Options for an `EventLog`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Deliver to subscribers on a dedicated worker per subscription.
    /// When false, subscribers run inline on the appending thread.
    pub async_subscriptions: bool,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            async_subscriptions: true,
        }
    }
}

impl EventLogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inline delivery on the appending thread.
    pub fn synchronous() -> Self {
        Self {
            async_subscriptions: false,
        }
    }

    pub fn with_async_subscriptions(mut self, enabled: bool) -> Self {
        self.async_subscriptions = enabled;
        self
    }
}
