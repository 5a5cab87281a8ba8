//! Read-through cache manager over an event-sourced, in-memory repository
//! with one-phase commit transactions.
//!
//! - [`EventLog`]: ordered append-only log, nested transactions, subscriptions
//! - [`EventLogRepository`]: namespaced CRUD store folded from the log
//! - [`cache::Manager`]: read-through/write-through cache over any [`cache::Source`]

// Lets `#[derive(Entity)]` expand to `::sourced_cache::..` inside this crate too.
extern crate self as sourced_cache;

pub mod cache;
mod context;
pub mod crud;
mod error;
mod event;
pub mod event_log;
mod id;
pub mod repository;

pub use context::{CancelHandle, Context};
pub use error::{Error, Result};
pub use event::{Change, Event, EventKind, Trace};
pub use event_log::{EventLog, EventLogConfig, LogSubscription, Transaction, TxStatus};
pub use id::{Entity, EntityId, IdAccessor, IdGenerator};
pub use repository::{EventLogRepository, Storable};

pub use sourced_cache_macros::Entity;

/// Everything needed to define entities and work with repositories and caches.
pub mod prelude {
    pub use crate::cache::{CacheStorage, InMemoryCacheStorage, Manager};
    pub use crate::crud::{
        AllDeleter, AllFinder, ByIdDeleter, ByIdFinder, ByIdsFinder, CreateEvent, Creator,
        CreatorPublisher, DeleteEvent, DeleterPublisher, OnePhaseCommit, Purger, Saver,
        Subscriber, Subscription, UpdateEvent, Updater, UpdaterPublisher, Upserter,
    };
    pub use crate::{Context, Entity, EntityId, Error, EventLog, EventLogRepository, Result};
}
