//! Typed, per-kind views over a repository's log subscription.

use std::sync::Arc;

use super::log_repository::EventLogRepository;
use super::Storable;
use crate::context::Context;
use crate::crud::{
    CreateEvent, CreatorPublisher, DeleteEvent, DeleterPublisher, Subscriber, Subscription,
    UpdateEvent, UpdaterPublisher,
};
use crate::error::{Error, Result};
use crate::event::{Change, Event};
use crate::id::EntityId;

/// Maps a raw log event to a typed one. `None` means "not for this subscriber".
type Decode<Ev> = Box<dyn Fn(&Event) -> Option<Result<Ev>> + Send + Sync>;

struct Filtered<Ev> {
    namespace: String,
    decode: Decode<Ev>,
    subscriber: Arc<dyn Subscriber<Ev>>,
}

impl<Ev> Subscriber<Event> for Filtered<Ev>
where
    Ev: Send + Sync,
{
    fn handle(&self, ctx: &Context, event: Event) -> Result<()> {
        if !event.belongs_to(&self.namespace) {
            return Ok(());
        }
        match (self.decode)(&event) {
            None => Ok(()),
            Some(Ok(typed)) => self.subscriber.handle(ctx, typed),
            Some(Err(err)) => self.subscriber.error(ctx, err),
        }
    }

    fn error(&self, ctx: &Context, err: Error) -> Result<()> {
        self.subscriber.error(ctx, err)
    }
}

impl<E, ID> EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn subscribe_filtered<Ev>(
        &self,
        ctx: &Context,
        subscriber: Arc<dyn Subscriber<Ev>>,
        decode: Decode<Ev>,
    ) -> Result<Box<dyn Subscription>>
    where
        Ev: Send + Sync + 'static,
    {
        let filtered = Filtered {
            namespace: self.namespace().to_string(),
            decode,
            subscriber,
        };
        let subscription = self.log().subscribe(ctx, Arc::new(filtered))?;
        Ok(Box::new(subscription))
    }
}

impl<E, ID> CreatorPublisher<E> for EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn subscribe_to_creator_events(
        &self,
        ctx: &Context,
        subscriber: Arc<dyn Subscriber<CreateEvent<E>>>,
    ) -> Result<Box<dyn Subscription>> {
        self.subscribe_filtered(
            ctx,
            subscriber,
            Box::new(|event: &Event| match &event.change {
                Change::Create(value) => Some(
                    serde_json::from_value(value.clone())
                        .map(|entity| CreateEvent { entity })
                        .map_err(Error::from),
                ),
                _ => None,
            }),
        )
    }
}

impl<E, ID> UpdaterPublisher<E> for EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn subscribe_to_updater_events(
        &self,
        ctx: &Context,
        subscriber: Arc<dyn Subscriber<UpdateEvent<E>>>,
    ) -> Result<Box<dyn Subscription>> {
        self.subscribe_filtered(
            ctx,
            subscriber,
            Box::new(|event: &Event| match &event.change {
                Change::Update(value) => Some(
                    serde_json::from_value(value.clone())
                        .map(|entity| UpdateEvent { entity })
                        .map_err(Error::from),
                ),
                _ => None,
            }),
        )
    }
}

impl<E, ID> DeleterPublisher<ID> for EventLogRepository<E, ID>
where
    E: Storable,
    ID: EntityId,
{
    fn subscribe_to_deleter_events(
        &self,
        ctx: &Context,
        subscriber: Arc<dyn Subscriber<DeleteEvent<ID>>>,
    ) -> Result<Box<dyn Subscription>> {
        let ids = self.id_accessor().clone();
        self.subscribe_filtered(
            ctx,
            subscriber,
            Box::new(move |event: &Event| match &event.change {
                Change::DeleteById(value) => Some(
                    serde_json::from_value::<E>(value.clone())
                        .map(|shell| DeleteEvent::ById { id: ids.get(&shell) })
                        .map_err(Error::from),
                ),
                Change::DeleteAll => Some(Ok(DeleteEvent::All)),
                _ => None,
            }),
        )
    }
}
