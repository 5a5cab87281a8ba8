use std::fmt;
use std::sync::Arc;

use tracing::warn;

use super::hit::Hit;
use crate::context::Context;
use crate::crud::{
    AllDeleter, AllFinder, ByIdDeleter, ByIdFinder, ByIdsFinder, Creator, OnePhaseCommit, Purger,
    Saver, Upserter,
};
use crate::error::Result;
use crate::event_log::EventLog;
use crate::id::{Entity, EntityId, IdAccessor};
use crate::repository::{EventLogRepository, Storable};

/// Entity-level cache storage.
pub trait EntityStore<E, ID>:
    Creator<E>
    + ByIdFinder<E, ID>
    + ByIdsFinder<E, ID>
    + AllFinder<E>
    + Upserter<E>
    + ByIdDeleter<ID>
    + AllDeleter
    + Purger
{
}

impl<T, E, ID> EntityStore<E, ID> for T where
    T: Creator<E>
        + ByIdFinder<E, ID>
        + ByIdsFinder<E, ID>
        + AllFinder<E>
        + Upserter<E>
        + ByIdDeleter<ID>
        + AllDeleter
        + Purger
        + ?Sized
{
}

/// Query-result cache storage, keyed by query fingerprint.
pub trait HitStore<ID>:
    ByIdFinder<Hit<ID>, String>
    + AllFinder<Hit<ID>>
    + Saver<Hit<ID>>
    + ByIdDeleter<String>
    + AllDeleter
    + Purger
{
}

impl<T, ID> HitStore<ID> for T where
    T: ByIdFinder<Hit<ID>, String>
        + AllFinder<Hit<ID>>
        + Saver<Hit<ID>>
        + ByIdDeleter<String>
        + AllDeleter
        + Purger
        + ?Sized
{
}

/// Where the cache manager keeps entities and hits.
///
/// A transaction begun through `OnePhaseCommit` must cover writes to both
/// stores made with the returned context.
pub trait CacheStorage<E, ID>: OnePhaseCommit {
    fn cache_entity(&self, ctx: &Context) -> Result<Arc<dyn EntityStore<E, ID>>>;

    fn cache_hit(&self, ctx: &Context) -> Result<Arc<dyn HitStore<ID>>>;
}

/// Run `f` inside a storage transaction: commit on `Ok`, roll back on `Err`.
pub(crate) fn atomic<T, S, F>(storage: &S, ctx: &Context, f: F) -> Result<T>
where
    S: OnePhaseCommit + ?Sized,
    F: FnOnce(&Context) -> Result<T>,
{
    let tx = storage.begin_tx(ctx)?;
    match f(&tx) {
        Ok(value) => match storage.commit_tx(&tx) {
            Ok(()) => Ok(value),
            Err(err) => {
                if let Err(rollback_err) = storage.rollback_tx(&tx) {
                    warn!(error = %rollback_err, "rollback after failed commit failed");
                }
                Err(err)
            }
        },
        Err(err) => {
            if let Err(rollback_err) = storage.rollback_tx(&tx) {
                warn!(error = %rollback_err, "rollback after failed storage write failed");
            }
            Err(err)
        }
    }
}

/// Cache storage on a private event log.
///
/// Entities and hits live in two namespaces of the same log, so one log
/// transaction spans both. Entities are stored under the ID the source gave
/// them; the cache never assigns IDs. Both namespaces are compressed after every
/// outermost commit, which keeps the log proportional to the live cache.
pub struct InMemoryCacheStorage<E, ID> {
    log: EventLog,
    entities: Arc<EventLogRepository<E, ID>>,
    hits: Arc<EventLogRepository<Hit<ID>, String>>,
}

impl<E> InMemoryCacheStorage<E, E::Id>
where
    E: Entity + Storable,
{
    pub fn new() -> Self {
        Self::with_accessor(IdAccessor::of())
    }
}

impl<E> Default for InMemoryCacheStorage<E, E::Id>
where
    E: Entity + Storable,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E, ID> InMemoryCacheStorage<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    pub fn with_accessor(ids: IdAccessor<E, ID>) -> Self {
        let log = EventLog::new();
        let entities = EventLogRepository::with_accessor(log.clone(), ids)
            .with_id_assignment(false)
            .with_compression(true);
        let hits = EventLogRepository::<Hit<ID>, String>::new(log.clone())
            .with_namespace(format!("{}#hits", entities.namespace()))
            .with_id_assignment(false)
            .with_compression(true);
        Self {
            log,
            entities: Arc::new(entities),
            hits: Arc::new(hits),
        }
    }

    /// The log backing both stores.
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn entities(&self) -> &EventLogRepository<E, ID> {
        &self.entities
    }

    pub fn hits(&self) -> &EventLogRepository<Hit<ID>, String> {
        &self.hits
    }
}

impl<E, ID> fmt::Debug for InMemoryCacheStorage<E, ID> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCacheStorage")
            .field("entities", &self.entities)
            .field("hits", &self.hits)
            .finish()
    }
}

impl<E, ID> OnePhaseCommit for InMemoryCacheStorage<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn begin_tx(&self, ctx: &Context) -> Result<Context> {
        self.log.begin_tx(ctx)
    }

    fn commit_tx(&self, ctx: &Context) -> Result<()> {
        self.log.commit_tx(ctx)?;
        if self.log.lookup_tx(ctx).is_some_and(|tx| tx.depth() == 1) {
            self.entities.compress()?;
            self.hits.compress()?;
        }
        Ok(())
    }

    fn rollback_tx(&self, ctx: &Context) -> Result<()> {
        self.log.rollback_tx(ctx)
    }
}

impl<E, ID> CacheStorage<E, ID> for InMemoryCacheStorage<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn cache_entity(&self, ctx: &Context) -> Result<Arc<dyn EntityStore<E, ID>>> {
        ctx.check()?;
        let entities: Arc<dyn EntityStore<E, ID>> = self.entities.clone();
        Ok(entities)
    }

    fn cache_hit(&self, ctx: &Context) -> Result<Arc<dyn HitStore<ID>>> {
        ctx.check()?;
        let hits: Arc<dyn HitStore<ID>> = self.hits.clone();
        Ok(hits)
    }
}
