//! Source-event-driven invalidation.
//!
//! ```text
//!   source create        -> drop every hit
//!   source update(id)    -> drop every hit + cached entity `id`
//!   source delete(id)    -> drop every hit + cached entity `id`
//!   source delete all    -> drop every hit + every cached entity
//!   subscription error   -> best-effort purge of both stores
//! ```
//!
//! These handlers are the only invalidation for writes the manager did not
//! make. For its own writes the manager invalidates before returning, and the
//! echoed source event finds nothing left to drop.
//!
//! Every invalidation advances a [`Generation`]. A miss that was being
//! produced meanwhile is not memoised.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::storage::{atomic, CacheStorage};
use crate::context::Context;
use crate::crud::{CreateEvent, DeleteEvent, Subscriber, UpdateEvent};
use crate::error::{Error, Result};
use crate::id::{EntityId, IdAccessor};

/// Invalidation counter shared by a manager and its invalidators.
#[derive(Debug, Default)]
pub(crate) struct Generation(Mutex<u64>);

impl Generation {
    pub(crate) fn current(&self) -> Result<u64> {
        self.0
            .lock()
            .map(|generation| *generation)
            .map_err(|_| Error::LockPoisoned("cache generation"))
    }

    /// Advance the generation and run the invalidation `f`.
    fn advance<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut generation = self
            .0
            .lock()
            .map_err(|_| Error::LockPoisoned("cache generation"))?;
        *generation = generation.wrapping_add(1);
        f()
    }

    /// Run `f` unless the generation moved past `seen`. Returns whether `f` ran.
    pub(crate) fn run_if_unchanged(&self, seen: u64, f: impl FnOnce() -> Result<()>) -> Result<bool> {
        let generation = self
            .0
            .lock()
            .map_err(|_| Error::LockPoisoned("cache generation"))?;
        if *generation != seen {
            return Ok(false);
        }
        f()?;
        Ok(true)
    }
}

pub(crate) struct Invalidator<E, ID> {
    storage: Arc<dyn CacheStorage<E, ID>>,
    ids: IdAccessor<E, ID>,
    generation: Arc<Generation>,
}

impl<E, ID> Invalidator<E, ID>
where
    E: 'static,
    ID: EntityId,
{
    pub(crate) fn new(
        storage: Arc<dyn CacheStorage<E, ID>>,
        ids: IdAccessor<E, ID>,
        generation: Arc<Generation>,
    ) -> Self {
        Self {
            storage,
            ids,
            generation,
        }
    }

    pub(crate) fn drop_hits(&self, ctx: &Context) -> Result<()> {
        self.generation.advance(|| self.clear_hits(ctx))
    }

    /// Drop every hit and the cached entity `id`, if it is cached.
    pub(crate) fn drop_entity(&self, ctx: &Context, id: &ID) -> Result<()> {
        self.generation.advance(|| {
            atomic(self.storage.as_ref(), ctx, |tx| {
                match self.storage.cache_entity(tx)?.delete_by_id(tx, id) {
                    Err(err) if err.is_not_found() => {}
                    other => other?,
                }
                self.clear_hits(tx)
            })
        })
    }

    pub(crate) fn drop_everything(&self, ctx: &Context) -> Result<()> {
        self.generation.advance(|| {
            atomic(self.storage.as_ref(), ctx, |tx| {
                self.storage.cache_entity(tx)?.delete_all(tx)?;
                self.clear_hits(tx)
            })
        })
    }

    /// Wipe both stores without going through transactions.
    pub(crate) fn purge(&self, ctx: &Context) -> Result<()> {
        self.generation.advance(|| {
            self.storage.cache_entity(ctx)?.purge(ctx)?;
            self.storage.cache_hit(ctx)?.purge(ctx)
        })
    }

    fn clear_hits(&self, ctx: &Context) -> Result<()> {
        self.storage.cache_hit(ctx)?.delete_all(ctx)
    }

    fn on_error(&self, ctx: &Context, err: Error) -> Result<()> {
        warn!(error = %err, "source subscription failed, purging cache");
        if let Err(purge_err) = self.purge(ctx) {
            warn!(error = %purge_err, "cache purge after subscription error failed");
        }
        Ok(())
    }
}

impl<E, ID> Subscriber<CreateEvent<E>> for Invalidator<E, ID>
where
    E: Send + Sync + 'static,
    ID: EntityId,
{
    fn handle(&self, ctx: &Context, event: CreateEvent<E>) -> Result<()> {
        debug!(id = %self.ids.get(&event.entity), "source create, invalidating hits");
        self.drop_hits(ctx)
    }

    fn error(&self, ctx: &Context, err: Error) -> Result<()> {
        self.on_error(ctx, err)
    }
}

impl<E, ID> Subscriber<UpdateEvent<E>> for Invalidator<E, ID>
where
    E: Send + Sync + 'static,
    ID: EntityId,
{
    fn handle(&self, ctx: &Context, event: UpdateEvent<E>) -> Result<()> {
        let id = self.ids.get(&event.entity);
        debug!(%id, "source update, invalidating");
        self.drop_entity(ctx, &id)
    }

    fn error(&self, ctx: &Context, err: Error) -> Result<()> {
        self.on_error(ctx, err)
    }
}

impl<E, ID> Subscriber<DeleteEvent<ID>> for Invalidator<E, ID>
where
    E: Send + Sync + 'static,
    ID: EntityId,
{
    fn handle(&self, ctx: &Context, event: DeleteEvent<ID>) -> Result<()> {
        match event {
            DeleteEvent::ById { id } => {
                debug!(%id, "source delete, invalidating");
                self.drop_entity(ctx, &id)
            }
            DeleteEvent::All => {
                debug!("source delete all, invalidating everything");
                self.drop_everything(ctx)
            }
        }
    }

    fn error(&self, ctx: &Context, err: Error) -> Result<()> {
        self.on_error(ctx, err)
    }
}
