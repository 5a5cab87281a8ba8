use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::iter;

use tracing::debug;

use super::projection::project;
use super::Storable;
use crate::context::Context;
use crate::crud::{
    error_iter, vec_iter, AllDeleter, AllFinder, ByIdDeleter, ByIdFinder, ByIdsFinder, Creator,
    OnePhaseCommit, Purger, ResultIter, Saver, Updater, Upserter,
};
use crate::error::{Error, Result};
use crate::event::{Change, Event};
use crate::event_log::EventLog;
use crate::id::{Entity, EntityId, IdAccessor, IdGenerator};

/// Namespaced CRUD store whose state is a fold over an [`EventLog`].
///
/// Several repositories may share one log; each only sees the events of its
/// own namespace.
pub struct EventLogRepository<E, ID> {
    log: EventLog,
    namespace: String,
    ids: IdAccessor<E, ID>,
    generator: Option<IdGenerator<ID>>,
    assign_ids: bool,
    compress: bool,
}

impl<E, ID> Clone for EventLogRepository<E, ID> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            namespace: self.namespace.clone(),
            ids: self.ids.clone(),
            generator: self.generator.clone(),
            assign_ids: self.assign_ids,
            compress: self.compress,
        }
    }
}

impl<E> EventLogRepository<E, E::Id>
where
    E: Entity + Storable,
{
    /// Repository using the entity's `Entity` impl for identity and namespace.
    pub fn new(log: EventLog) -> Self {
        let namespace = E::NAMESPACE.unwrap_or_else(type_name::<E>).to_string();
        Self::with_accessor(log, IdAccessor::of()).with_namespace(namespace)
    }
}

impl<E, ID> EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    /// Repository with an explicit ID accessor. The namespace defaults to the
    /// fully qualified type name of `E`.
    pub fn with_accessor(log: EventLog, ids: IdAccessor<E, ID>) -> Self {
        Self {
            log,
            namespace: type_name::<E>().to_string(),
            ids,
            generator: None,
            assign_ids: true,
            compress: false,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Generator used by `create` for entities without an ID.
    pub fn with_id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&Context) -> Result<ID> + Send + Sync + 'static,
    {
        self.generator = Some(std::sync::Arc::new(generator));
        self
    }

    /// Whether `create` assigns an ID to an entity carrying a zero ID.
    ///
    /// Disabled, entities are stored under the ID they carry, zero included.
    /// Stores mirroring another system of record want this.
    pub fn with_id_assignment(mut self, enabled: bool) -> Self {
        self.assign_ids = enabled;
        self
    }

    /// Compress the log after every append made outside a transaction.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn id_accessor(&self) -> &IdAccessor<E, ID> {
        &self.ids
    }

    /// Replace this namespace's events with one `Create` per live entity.
    ///
    /// Events of other namespaces keep their relative order and come first.
    pub fn compress(&self) -> Result<()> {
        let namespace = self.namespace.as_str();
        self.log.rewrite(|events| {
            let view = project(events, namespace, &self.ids)?;
            let mut compressed: Vec<Event> = events
                .iter()
                .filter(|event| !event.belongs_to(namespace))
                .cloned()
                .collect();
            compressed.reserve(view.len());
            for entity in view.values() {
                compressed.push(Event::new(namespace, Change::Create(serde_json::to_value(entity)?)));
            }
            Ok(compressed)
        })
    }

    /// Current view as seen from `ctx`.
    fn view(&self, ctx: &Context) -> Result<HashMap<ID, E>> {
        let events = self.log.events_in(ctx)?;
        project(&events, &self.namespace, &self.ids)
    }

    #[track_caller]
    fn append(&self, ctx: &Context, change: Change) -> Result<()> {
        self.log.append(ctx, Event::new(self.namespace.as_str(), change))?;
        if self.compress && self.log.lookup_tx(ctx).is_none() {
            self.compress()?;
        }
        Ok(())
    }

    fn next_id(&self, ctx: &Context) -> Result<ID> {
        match &self.generator {
            Some(generator) => generator(ctx),
            None => ID::generate().ok_or_else(|| Error::MissingId(self.namespace.clone())),
        }
    }

    fn exists(&self, ctx: &Context, id: &ID) -> Result<bool> {
        Ok(self.view(ctx)?.contains_key(id))
    }
}

impl<E, ID> fmt::Debug for EventLogRepository<E, ID> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLogRepository")
            .field("namespace", &self.namespace)
            .field("log", &self.log)
            .field("assign_ids", &self.assign_ids)
            .field("compress", &self.compress)
            .finish()
    }
}

impl<E, ID> Creator<E> for EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn create(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        if self.assign_ids && self.ids.is_absent(entity) {
            let id = self.next_id(ctx)?;
            self.ids.set(entity, id);
        }
        ctx.check()?;

        let id = self.ids.get(entity);
        if self.view(ctx)?.contains_key(&id) {
            return Err(Error::already_exists(&self.namespace, &id));
        }
        self.append(ctx, Change::Create(serde_json::to_value(&*entity)?))?;
        debug!(namespace = %self.namespace, %id, "entity created");
        Ok(())
    }
}

impl<E, ID> Updater<E> for EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn update(&self, ctx: &Context, entity: &E) -> Result<()> {
        ctx.check()?;
        let id = self.ids.get(entity);
        if !self.exists(ctx, &id)? {
            return Err(Error::not_found(&self.namespace, &id));
        }
        self.append(ctx, Change::Update(serde_json::to_value(entity)?))?;
        debug!(namespace = %self.namespace, %id, "entity updated");
        Ok(())
    }
}

impl<E, ID> Saver<E> for EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn save(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        self.log.atomic(ctx, |tx| {
            let id = self.ids.get(entity);
            if self.exists(tx, &id)? {
                self.update(tx, entity)
            } else {
                self.create(tx, entity)
            }
        })?;
        if self.compress && self.log.lookup_tx(ctx).is_none() {
            self.compress()?;
        }
        Ok(())
    }
}

impl<E, ID> Upserter<E> for EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn upsert(&self, ctx: &Context, entities: &mut [E]) -> Result<()> {
        self.log.atomic(ctx, |tx| {
            for entity in entities.iter_mut() {
                let id = self.ids.get(entity);
                if self.exists(tx, &id)? {
                    self.update(tx, entity)?;
                } else {
                    self.create(tx, entity)?;
                }
            }
            Ok(())
        })?;
        if self.compress && self.log.lookup_tx(ctx).is_none() {
            self.compress()?;
        }
        Ok(())
    }
}

impl<E, ID> ByIdDeleter<ID> for EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn delete_by_id(&self, ctx: &Context, id: &ID) -> Result<()> {
        ctx.check()?;
        if !self.exists(ctx, id)? {
            return Err(Error::not_found(&self.namespace, id));
        }
        let mut shell = E::default();
        self.ids.set(&mut shell, id.clone());
        self.append(ctx, Change::DeleteById(serde_json::to_value(&shell)?))?;
        debug!(namespace = %self.namespace, %id, "entity deleted");
        Ok(())
    }
}

impl<E, ID> AllDeleter for EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn delete_all(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        self.append(ctx, Change::DeleteAll)?;
        debug!(namespace = %self.namespace, "all entities deleted");
        Ok(())
    }
}

impl<E, ID> Purger for EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    /// Drop this namespace's committed events without emitting an event.
    fn purge(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        let namespace = self.namespace.as_str();
        self.log.rewrite(|events| {
            Ok(events
                .iter()
                .filter(|event| !event.belongs_to(namespace))
                .cloned()
                .collect())
        })?;
        debug!(namespace = %self.namespace, "namespace purged");
        Ok(())
    }
}

impl<E, ID> ByIdFinder<E, ID> for EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn find_by_id(&self, ctx: &Context, id: &ID) -> Result<Option<E>> {
        let mut view = self.view(ctx)?;
        Ok(view.remove(id))
    }
}

impl<E, ID> AllFinder<E> for EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn find_all(&self, ctx: &Context) -> ResultIter<E> {
        match self.view(ctx) {
            Ok(view) => vec_iter(view.into_values().collect()),
            Err(err) => error_iter(err),
        }
    }
}

impl<E, ID> ByIdsFinder<E, ID> for EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn find_by_ids(&self, ctx: &Context, ids: &[ID]) -> ResultIter<E> {
        let view = match self.view(ctx) {
            Ok(view) => view,
            Err(err) => return error_iter(err),
        };

        let namespace = self.namespace.clone();
        let mut pending = ids.to_vec().into_iter();
        let mut done = false;
        Box::new(iter::from_fn(move || {
            if done {
                return None;
            }
            let id = pending.next()?;
            match view.get(&id) {
                Some(entity) => Some(Ok(entity.clone())),
                None => {
                    done = true;
                    Some(Err(Error::not_found(&namespace, &id)))
                }
            }
        }))
    }
}

impl<E, ID> OnePhaseCommit for EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn begin_tx(&self, ctx: &Context) -> Result<Context> {
        self.log.begin_tx(ctx)
    }

    fn commit_tx(&self, ctx: &Context) -> Result<()> {
        self.log.commit_tx(ctx)?;
        if self.compress && self.log.lookup_tx(ctx).is_some_and(|tx| tx.depth() == 1) {
            self.compress()?;
        }
        Ok(())
    }

    fn rollback_tx(&self, ctx: &Context) -> Result<()> {
        self.log.rollback_tx(ctx)
    }
}
