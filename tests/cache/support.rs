//! Source stub and polling helpers for the cache manager tests.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use sourced_cache::crud::ResultIter;
use sourced_cache::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Entity)]
#[entity(namespace = "widgets")]
pub struct Widget {
    pub id: u64,
    pub v: String,
}

pub fn widget(id: u64, v: &str) -> Widget {
    Widget { id, v: v.into() }
}

/// Event-log repository that counts the reads reaching it.
pub struct CountingSource {
    pub inner: EventLogRepository<Widget, u64>,
    find_by_id_calls: AtomicUsize,
    find_all_calls: AtomicUsize,
    /// Artificial latency of `find_all`.
    pub find_all_delay: Duration,
}

impl CountingSource {
    pub fn new(log: EventLog) -> Arc<Self> {
        Self::with_delay(log, Duration::ZERO)
    }

    pub fn with_delay(log: EventLog, find_all_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: EventLogRepository::new(log),
            find_by_id_calls: AtomicUsize::new(0),
            find_all_calls: AtomicUsize::new(0),
            find_all_delay,
        })
    }

    pub fn find_by_id_calls(&self) -> usize {
        self.find_by_id_calls.load(Ordering::SeqCst)
    }

    pub fn find_all_calls(&self) -> usize {
        self.find_all_calls.load(Ordering::SeqCst)
    }

    pub fn seed(&self, widgets: &[Widget]) {
        let ctx = Context::background();
        for w in widgets {
            self.inner.create(&ctx, &mut w.clone()).unwrap();
        }
    }
}

impl Creator<Widget> for CountingSource {
    fn create(&self, ctx: &Context, entity: &mut Widget) -> Result<()> {
        self.inner.create(ctx, entity)
    }
}

impl ByIdFinder<Widget, u64> for CountingSource {
    fn find_by_id(&self, ctx: &Context, id: &u64) -> Result<Option<Widget>> {
        self.find_by_id_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.find_by_id(ctx, id)
    }
}

impl AllFinder<Widget> for CountingSource {
    fn find_all(&self, ctx: &Context) -> ResultIter<Widget> {
        self.find_all_calls.fetch_add(1, Ordering::SeqCst);
        if !self.find_all_delay.is_zero() {
            thread::sleep(self.find_all_delay);
        }
        self.inner.find_all(ctx)
    }
}

impl Updater<Widget> for CountingSource {
    fn update(&self, ctx: &Context, entity: &Widget) -> Result<()> {
        self.inner.update(ctx, entity)
    }
}

impl ByIdDeleter<u64> for CountingSource {
    fn delete_by_id(&self, ctx: &Context, id: &u64) -> Result<()> {
        self.inner.delete_by_id(ctx, id)
    }
}

impl AllDeleter for CountingSource {
    fn delete_all(&self, ctx: &Context) -> Result<()> {
        self.inner.delete_all(ctx)
    }
}

impl CreatorPublisher<Widget> for CountingSource {
    fn subscribe_to_creator_events(
        &self,
        ctx: &Context,
        subscriber: Arc<dyn Subscriber<CreateEvent<Widget>>>,
    ) -> Result<Box<dyn Subscription>> {
        self.inner.subscribe_to_creator_events(ctx, subscriber)
    }
}

impl UpdaterPublisher<Widget> for CountingSource {
    fn subscribe_to_updater_events(
        &self,
        ctx: &Context,
        subscriber: Arc<dyn Subscriber<UpdateEvent<Widget>>>,
    ) -> Result<Box<dyn Subscription>> {
        self.inner.subscribe_to_updater_events(ctx, subscriber)
    }
}

impl DeleterPublisher<u64> for CountingSource {
    fn subscribe_to_deleter_events(
        &self,
        ctx: &Context,
        subscriber: Arc<dyn Subscriber<DeleteEvent<u64>>>,
    ) -> Result<Box<dyn Subscription>> {
        self.inner.subscribe_to_deleter_events(ctx, subscriber)
    }
}

/// Poll `cond` until it holds, panicking after five seconds.
pub fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for: {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}
