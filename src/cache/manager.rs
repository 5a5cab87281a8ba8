use std::any::type_name;
use std::fmt;
use std::slice;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::hit::Hit;
use super::invalidation::{Generation, Invalidator};
use super::lock::QueryLocks;
use super::storage::{atomic, CacheStorage};
use crate::context::Context;
use crate::crud::{
    error_iter, vec_iter, AllDeleter, AllFinder, ByIdDeleter, ByIdFinder, Creator,
    CreatorPublisher, DeleterPublisher, Purger, ResultIter, Saver, Subscription, Updater,
    UpdaterPublisher,
};
use crate::error::{Error, Result};
use crate::id::{Entity, EntityId, IdAccessor};
use crate::repository::Storable;

/// What the manager needs from the system of record.
pub trait Source<E, ID>:
    Creator<E>
    + ByIdFinder<E, ID>
    + AllFinder<E>
    + ByIdDeleter<ID>
    + AllDeleter
    + CreatorPublisher<E>
    + DeleterPublisher<ID>
{
}

impl<T, E, ID> Source<E, ID> for T where
    T: Creator<E>
        + ByIdFinder<E, ID>
        + AllFinder<E>
        + ByIdDeleter<ID>
        + AllDeleter
        + CreatorPublisher<E>
        + DeleterPublisher<ID>
        + ?Sized
{
}

/// Optional update capability of a source.
pub trait UpdateSource<E>: Updater<E> + UpdaterPublisher<E> {}

impl<T, E> UpdateSource<E> for T where T: Updater<E> + UpdaterPublisher<E> + ?Sized {}

enum Startup {
    Pending,
    Running(Vec<Box<dyn Subscription>>),
    Closed,
}

/// Read-through, write-through cache over a [`Source`].
///
/// Reads consult the entity store first, then the memoised query results
/// ([`Hit`]s), and only then the source. Writes go to the source and are
/// applied to the cache storage before returning. Source events received
/// through the subscriptions opened on first use invalidate the cache for
/// mutations made by other writers.
pub struct Manager<E, ID> {
    source: Arc<dyn Source<E, ID>>,
    updater: Option<Arc<dyn UpdateSource<E>>>,
    storage: Arc<dyn CacheStorage<E, ID>>,
    ids: IdAccessor<E, ID>,
    locks: QueryLocks,
    generation: Arc<Generation>,
    startup: Mutex<Startup>,
}

impl<E> Manager<E, E::Id>
where
    E: Entity + Storable,
{
    /// Manager over a source without update support.
    pub fn new(source: Arc<dyn Source<E, E::Id>>, storage: Arc<dyn CacheStorage<E, E::Id>>) -> Self {
        Self::with_accessor(source, storage, IdAccessor::of())
    }

    /// Manager over a source that also supports updates.
    pub fn extended<S>(source: Arc<S>, storage: Arc<dyn CacheStorage<E, E::Id>>) -> Self
    where
        S: Source<E, E::Id> + UpdateSource<E> + 'static,
    {
        let updater: Arc<dyn UpdateSource<E>> = source.clone();
        Self::new(source, storage).with_update_source(updater)
    }
}

impl<E, ID> Manager<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    pub fn with_accessor(
        source: Arc<dyn Source<E, ID>>,
        storage: Arc<dyn CacheStorage<E, ID>>,
        ids: IdAccessor<E, ID>,
    ) -> Self {
        Self {
            source,
            updater: None,
            storage,
            ids,
            locks: QueryLocks::new(),
            generation: Arc::default(),
            startup: Mutex::new(Startup::Pending),
        }
    }

    /// Enable `update` and subscribe to the updater's events on first use.
    pub fn with_update_source(mut self, updater: Arc<dyn UpdateSource<E>>) -> Self {
        self.updater = Some(updater);
        self
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage<E, ID>> {
        &self.storage
    }

    /// Fingerprint of the query `name`: `"0:<entity type>/<name>"`.
    ///
    /// The leading `0:` is the version epoch; bumping it orphans every hit.
    pub fn query_id(&self, name: &str) -> String {
        format!("0:{}/{}", type_name::<E>(), name)
    }

    /// Subscribe to the source's events. Runs once, on first use.
    pub fn init(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        let mut startup = self
            .startup
            .lock()
            .map_err(|_| Error::LockPoisoned("cache manager startup"))?;
        if !matches!(*startup, Startup::Pending) {
            return Ok(());
        }

        let subscriptions = self.subscribe_to_source()?;
        debug!(
            entity = type_name::<E>(),
            subscriptions = subscriptions.len(),
            "cache manager started"
        );
        *startup = Startup::Running(subscriptions);
        Ok(())
    }

    fn subscribe_to_source(&self) -> Result<Vec<Box<dyn Subscription>>> {
        let mut subscriptions = Vec::with_capacity(3);
        if let Err(err) = self.open_subscriptions(&mut subscriptions) {
            for sub in &subscriptions {
                if let Err(close_err) = sub.close() {
                    warn!(error = %close_err, "failed to close subscription after startup failure");
                }
            }
            return Err(err);
        }
        Ok(subscriptions)
    }

    fn open_subscriptions(&self, opened: &mut Vec<Box<dyn Subscription>>) -> Result<()> {
        // Subscriptions outlive the request that triggered startup.
        let ctx = Context::background();
        let invalidator = Arc::new(self.invalidator());

        opened.push(
            self.source
                .subscribe_to_creator_events(&ctx, invalidator.clone())?,
        );
        opened.push(
            self.source
                .subscribe_to_deleter_events(&ctx, invalidator.clone())?,
        );
        if let Some(updater) = &self.updater {
            opened.push(updater.subscribe_to_updater_events(&ctx, invalidator)?);
        }
        Ok(())
    }

    /// Close every source subscription. The manager keeps serving requests
    /// but no longer sees source events.
    pub fn close(&self) -> Result<()> {
        let previous = {
            let mut startup = self
                .startup
                .lock()
                .map_err(|_| Error::LockPoisoned("cache manager startup"))?;
            std::mem::replace(&mut *startup, Startup::Closed)
        };

        let mut first_err = None;
        if let Startup::Running(subscriptions) = previous {
            for sub in subscriptions {
                if let Err(err) = sub.close() {
                    warn!(error = %err, "failed to close source subscription");
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Memoise the results of `produce` under the query `name`.
    ///
    /// At most one caller runs `produce` for a given query at a time; callers
    /// that waited reuse the hit it stored.
    pub fn cache_query_many<F>(&self, ctx: &Context, name: &str, produce: F) -> ResultIter<E>
    where
        F: FnOnce(&Context) -> ResultIter<E>,
    {
        match self.query_many(ctx, name, produce) {
            Ok(values) => vec_iter(values),
            Err(err) => error_iter(err),
        }
    }

    /// [`cache_query_many`](Self::cache_query_many) for queries yielding at most one entity.
    pub fn cache_query_one<F>(&self, ctx: &Context, name: &str, produce: F) -> Result<Option<E>>
    where
        F: FnOnce(&Context) -> Result<Option<E>>,
    {
        let mut values = self.cache_query_many(ctx, name, |ctx| match produce(ctx) {
            Ok(Some(entity)) => vec_iter(vec![entity]),
            Ok(None) => vec_iter(Vec::new()),
            Err(err) => error_iter(err),
        });
        values.next().transpose()
    }

    fn query_many<F>(&self, ctx: &Context, name: &str, produce: F) -> Result<Vec<E>>
    where
        F: FnOnce(&Context) -> ResultIter<E>,
    {
        ctx.check()?;
        self.init(ctx)?;

        let query_id = self.query_id(name);
        if let Some(values) = self.resolve_hit(ctx, &query_id)? {
            debug!(query = %query_id, "cache hit");
            return Ok(values);
        }

        let _guard = self.locks.acquire(&query_id)?;
        if let Some(values) = self.resolve_hit(ctx, &query_id)? {
            debug!(query = %query_id, "cache hit after wait");
            return Ok(values);
        }

        debug!(query = %query_id, "cache miss");
        let seen = self.generation.current()?;
        let mut values = produce(ctx).collect::<Result<Vec<E>>>()?;
        if !self.memoize(ctx, &query_id, seen, &mut values)? {
            debug!(query = %query_id, "cache invalidated while producing, result not memoised");
        }
        Ok(values)
    }

    /// Entities of the stored hit, or `None` when there is no usable hit.
    ///
    /// A hit referencing an entity no longer cached is dropped.
    fn resolve_hit(&self, ctx: &Context, query_id: &str) -> Result<Option<Vec<E>>> {
        let hits = self.storage.cache_hit(ctx)?;
        let key = query_id.to_string();
        let hit = match hits.find_by_id(ctx, &key)? {
            Some(hit) => hit,
            None => return Ok(None),
        };

        let entities = self.storage.cache_entity(ctx)?;
        match entities
            .find_by_ids(ctx, &hit.entity_ids)
            .collect::<Result<Vec<E>>>()
        {
            Ok(values) => Ok(Some(values)),
            Err(err) if err.is_not_found() => {
                debug!(query = %query_id, error = %err, "stale hit dropped");
                match hits.delete_by_id(ctx, &key) {
                    Err(err) if !err.is_not_found() => Err(err),
                    _ => Ok(None),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Store `values` and their hit, unless the cache was invalidated since
    /// generation `seen`. Returns whether anything was stored.
    fn memoize(&self, ctx: &Context, query_id: &str, seen: u64, values: &mut [E]) -> Result<bool> {
        self.generation.run_if_unchanged(seen, || {
            atomic(self.storage.as_ref(), ctx, |tx| {
                self.storage.cache_entity(tx)?.upsert(tx, values)?;
                let entity_ids = values.iter().map(|v| self.ids.get(v)).collect();
                self.storage
                    .cache_hit(tx)?
                    .save(tx, &mut Hit::new(query_id, entity_ids))
            })
        })
    }

    fn invalidator(&self) -> Invalidator<E, ID> {
        Invalidator::new(
            Arc::clone(&self.storage),
            self.ids.clone(),
            Arc::clone(&self.generation),
        )
    }

    fn updater(&self) -> Result<&Arc<dyn UpdateSource<E>>> {
        self.updater
            .as_ref()
            .ok_or(Error::NotImplemented("source does not support updates"))
    }
}

impl<E, ID> fmt::Debug for Manager<E, ID> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("entity", &type_name::<E>())
            .field("extended", &self.updater.is_some())
            .finish()
    }
}

impl<E, ID> ByIdFinder<E, ID> for Manager<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn find_by_id(&self, ctx: &Context, id: &ID) -> Result<Option<E>> {
        ctx.check()?;
        self.init(ctx)?;
        if let Some(entity) = self.storage.cache_entity(ctx)?.find_by_id(ctx, id)? {
            return Ok(Some(entity));
        }
        self.cache_query_one(ctx, &format!("FindByID#{}", id), |ctx| {
            self.source.find_by_id(ctx, id)
        })
    }
}

impl<E, ID> AllFinder<E> for Manager<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn find_all(&self, ctx: &Context) -> ResultIter<E> {
        self.cache_query_many(ctx, "FindAll", |ctx| self.source.find_all(ctx))
    }
}

impl<E, ID> Creator<E> for Manager<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn create(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        self.init(ctx)?;
        self.source.create(ctx, entity)?;
        atomic(self.storage.as_ref(), ctx, |tx| {
            self.storage.cache_entity(tx)?.create(tx, entity)?;
            self.invalidator().drop_hits(tx)
        })
    }
}

impl<E, ID> Updater<E> for Manager<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn update(&self, ctx: &Context, entity: &E) -> Result<()> {
        let updater = self.updater()?;
        self.init(ctx)?;
        updater.update(ctx, entity)?;
        let mut cached = entity.clone();
        atomic(self.storage.as_ref(), ctx, |tx| {
            self.storage.cache_entity(tx)?.upsert(tx, slice::from_mut(&mut cached))?;
            self.invalidator().drop_hits(tx)
        })
    }
}

impl<E, ID> Saver<E> for Manager<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn save(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        ctx.check()?;
        let id = self.ids.get(entity);
        if self.source.find_by_id(ctx, &id)?.is_none() {
            self.create(ctx, entity)
        } else {
            self.update(ctx, entity)
        }
    }
}

impl<E, ID> ByIdDeleter<ID> for Manager<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn delete_by_id(&self, ctx: &Context, id: &ID) -> Result<()> {
        self.init(ctx)?;
        self.source.delete_by_id(ctx, id)?;
        self.invalidator().drop_entity(ctx, id)
    }
}

impl<E, ID> AllDeleter for Manager<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn delete_all(&self, ctx: &Context) -> Result<()> {
        self.init(ctx)?;
        self.source.delete_all(ctx)?;
        self.invalidator().drop_everything(ctx)
    }
}

impl<E, ID> Purger for Manager<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    /// Wipe the local cache. The source is untouched.
    fn purge(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        self.invalidator().purge(ctx)
    }
}

impl<E, ID> Drop for Manager<E, ID> {
    fn drop(&mut self) {
        let startup = match self.startup.get_mut() {
            Ok(startup) => std::mem::replace(startup, Startup::Closed),
            Err(_) => return,
        };
        if let Startup::Running(subscriptions) = startup {
            for sub in subscriptions {
                if let Err(err) = sub.close() {
                    warn!(error = %err, "failed to close source subscription on drop");
                }
            }
        }
    }
}
