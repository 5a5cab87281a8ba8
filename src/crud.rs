//! CRUD capability traits.
//!
//! Each capability is its own object-safe trait so collaborators can be
//! composed from exactly the operations they support. The cache manager
//! selects optional capabilities (such as `Updater`) when it is built,
//! never by probing at request time.

use std::iter;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};

/// Lazy sequence of results.
pub type ResultIter<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

/// A sequence that yields `err` and ends.
pub fn error_iter<T: Send + 'static>(err: Error) -> ResultIter<T> {
    Box::new(iter::once(Err(err)))
}

/// A sequence over already materialised values.
pub fn vec_iter<T: Send + 'static>(items: Vec<T>) -> ResultIter<T> {
    Box::new(items.into_iter().map(Ok))
}

pub trait Creator<E>: Send + Sync {
    /// Store a new entity, assigning its ID when absent.
    fn create(&self, ctx: &Context, entity: &mut E) -> Result<()>;
}

pub trait ByIdFinder<E, ID>: Send + Sync {
    fn find_by_id(&self, ctx: &Context, id: &ID) -> Result<Option<E>>;
}

pub trait AllFinder<E>: Send + Sync {
    fn find_all(&self, ctx: &Context) -> ResultIter<E>;
}

pub trait ByIdsFinder<E, ID>: Send + Sync {
    /// Yields entities in input order; a missing ID ends the stream with `NotFound`.
    fn find_by_ids(&self, ctx: &Context, ids: &[ID]) -> ResultIter<E>;
}

pub trait Updater<E>: Send + Sync {
    fn update(&self, ctx: &Context, entity: &E) -> Result<()>;
}

pub trait Saver<E>: Send + Sync {
    /// Create when the entity is new, update otherwise.
    fn save(&self, ctx: &Context, entity: &mut E) -> Result<()>;
}

pub trait Upserter<E>: Send + Sync {
    fn upsert(&self, ctx: &Context, entities: &mut [E]) -> Result<()>;
}

pub trait ByIdDeleter<ID>: Send + Sync {
    fn delete_by_id(&self, ctx: &Context, id: &ID) -> Result<()>;
}

pub trait AllDeleter: Send + Sync {
    fn delete_all(&self, ctx: &Context) -> Result<()>;
}

/// Remove all stored state without emitting change events.
pub trait Purger: Send + Sync {
    fn purge(&self, ctx: &Context) -> Result<()>;
}

/// One-phase commit protocol scoped through the context.
pub trait OnePhaseCommit: Send + Sync {
    fn begin_tx(&self, ctx: &Context) -> Result<Context>;
    fn commit_tx(&self, ctx: &Context) -> Result<()>;
    fn rollback_tx(&self, ctx: &Context) -> Result<()>;
}

// ============================================================================
// Publishers
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CreateEvent<E> {
    pub entity: E,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent<E> {
    pub entity: E,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeleteEvent<ID> {
    ById { id: ID },
    All,
}

/// Receives events from a subscription, one call at a time.
pub trait Subscriber<Ev>: Send + Sync {
    fn handle(&self, ctx: &Context, event: Ev) -> Result<()>;

    /// Called with errors raised while delivering to this subscriber.
    fn error(&self, ctx: &Context, err: Error) -> Result<()>;
}

/// Handle to an active subscription.
pub trait Subscription: Send + Sync {
    /// Stop delivery and release the subscription. Idempotent.
    fn close(&self) -> Result<()>;
}

pub trait CreatorPublisher<E>: Send + Sync {
    fn subscribe_to_creator_events(
        &self,
        ctx: &Context,
        subscriber: Arc<dyn Subscriber<CreateEvent<E>>>,
    ) -> Result<Box<dyn Subscription>>;
}

pub trait UpdaterPublisher<E>: Send + Sync {
    fn subscribe_to_updater_events(
        &self,
        ctx: &Context,
        subscriber: Arc<dyn Subscriber<UpdateEvent<E>>>,
    ) -> Result<Box<dyn Subscription>>;
}

pub trait DeleterPublisher<ID>: Send + Sync {
    fn subscribe_to_deleter_events(
        &self,
        ctx: &Context,
        subscriber: Arc<dyn Subscriber<DeleteEvent<ID>>>,
    ) -> Result<Box<dyn Subscription>>;
}
