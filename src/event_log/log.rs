use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

use super::subscription::{LogSubscription, SubscriptionInner};
use super::transaction::{Transaction, TxParent};
use super::EventLogConfig;
use crate::context::Context;
use crate::crud::Subscriber;
use crate::error::{Error, Result};
use crate::event::Event;

static NEXT_LOG_ID: AtomicU64 = AtomicU64::new(1);

/// Notification queue shared by all appenders.
///
/// Events enter the queue in append order while the events lock is held,
/// and exactly one thread (the drainer) delivers them at a time.
struct Dispatch {
    queue: VecDeque<Event>,
    /// Sequence number handed to the next appended event.
    next_seq: u64,
    /// Every event with a sequence below this has been delivered.
    done_seq: u64,
    drainer: Option<ThreadId>,
}

struct LogInner {
    id: u64,
    /// Context key under which this log's transactions live.
    tx_key: String,
    config: EventLogConfig,
    events: RwLock<Vec<Event>>,
    subscriptions: Mutex<Vec<Arc<SubscriptionInner>>>,
    dispatch: Mutex<Dispatch>,
    dispatched: Condvar,
    next_subscription_id: AtomicU64,
}

/// In-memory, append-only event log.
///
/// Cloning shares the underlying log.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<LogInner>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_config(EventLogConfig::default())
    }

    pub fn with_config(config: EventLogConfig) -> Self {
        let id = NEXT_LOG_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(LogInner {
                id,
                tx_key: format!("event-log-{}", id),
                config,
                events: RwLock::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                dispatch: Mutex::new(Dispatch {
                    queue: VecDeque::new(),
                    next_seq: 0,
                    done_seq: 0,
                    drainer: None,
                }),
                dispatched: Condvar::new(),
                next_subscription_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &EventLogConfig {
        &self.inner.config
    }

    /// Append an event, staging it in the context's transaction if there is one.
    pub fn append(&self, ctx: &Context, event: Event) -> Result<()> {
        ctx.check()?;
        match self.lookup_tx(ctx) {
            Some(tx) => tx.stage(vec![event]),
            None => self.append_committed(vec![event]),
        }
    }

    /// Snapshot of the committed events in append order.
    pub fn events(&self) -> Result<Vec<Event>> {
        let events = self
            .inner
            .events
            .read()
            .map_err(|_| Error::LockPoisoned("event log read"))?;
        Ok(events.clone())
    }

    /// Events visible from `ctx`: committed events, plus staged events of the
    /// context's transaction chain.
    pub fn events_in(&self, ctx: &Context) -> Result<Vec<Event>> {
        ctx.check()?;
        match self.lookup_tx(ctx) {
            Some(tx) => tx.events(),
            None => self.events(),
        }
    }

    pub fn len(&self) -> Result<usize> {
        let events = self
            .inner
            .events
            .read()
            .map_err(|_| Error::LockPoisoned("event log read"))?;
        Ok(events.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Replace the committed events with `f(events)`. Subscribers are not notified.
    pub fn rewrite<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&[Event]) -> Result<Vec<Event>>,
    {
        let mut events = self
            .inner
            .events
            .write()
            .map_err(|_| Error::LockPoisoned("event log write"))?;
        let rewritten = f(&events)?;
        debug!(
            log = self.inner.id,
            before = events.len(),
            after = rewritten.len(),
            "event log rewritten"
        );
        *events = rewritten;
        Ok(())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// The transaction of this log carried by `ctx`, if any.
    pub fn lookup_tx(&self, ctx: &Context) -> Option<Transaction> {
        ctx.value::<Transaction>(&self.inner.tx_key).cloned()
    }

    /// Derive a context carrying a new transaction.
    ///
    /// The parent is the nearest enclosing open transaction of this log, or
    /// the log itself.
    pub fn begin_tx(&self, ctx: &Context) -> Result<Context> {
        ctx.check()?;
        let parent = match self.lookup_tx(ctx).and_then(nearest_open) {
            Some(tx) => TxParent::Tx(tx),
            None => TxParent::Log(self.clone()),
        };
        let tx = Transaction::new(parent);
        debug!(log = self.inner.id, tx = tx.id(), depth = tx.depth(), "transaction begun");
        Ok(ctx.with_value(self.inner.tx_key.clone(), tx))
    }

    /// Commit the context's transaction into its parent.
    ///
    /// A cancelled context fails the commit and leaves the transaction open.
    pub fn commit_tx(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        let tx = self.lookup_tx(ctx).ok_or(Error::NoTransaction)?;
        tx.commit()?;
        debug!(log = self.inner.id, tx = tx.id(), "transaction committed");
        Ok(())
    }

    pub fn rollback_tx(&self, ctx: &Context) -> Result<()> {
        let tx = self.lookup_tx(ctx).ok_or(Error::NoTransaction)?;
        tx.rollback()?;
        debug!(log = self.inner.id, tx = tx.id(), "transaction rolled back");
        Ok(())
    }

    /// Run `f` in a transaction: commit on `Ok`, roll back on `Err`.
    pub fn atomic<T, F>(&self, ctx: &Context, f: F) -> Result<T>
    where
        F: FnOnce(&Context) -> Result<T>,
    {
        let tx_ctx = self.begin_tx(ctx)?;
        let result = f(&tx_ctx).and_then(|value| self.commit_tx(&tx_ctx).map(|()| value));
        if result.is_err() && self.lookup_tx(&tx_ctx).is_some_and(|tx| tx.is_open()) {
            if let Err(rollback_err) = self.rollback_tx(&tx_ctx) {
                warn!(error = %rollback_err, "rollback after failed atomic block failed");
            }
        }
        result
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Register a subscriber for every event that reaches this log.
    ///
    /// `ctx` is handed to the subscriber on every delivery.
    pub fn subscribe(
        &self,
        ctx: &Context,
        subscriber: Arc<dyn Subscriber<Event>>,
    ) -> Result<LogSubscription> {
        ctx.check()?;
        let id = self
            .inner
            .next_subscription_id
            .fetch_add(1, Ordering::Relaxed);
        let inner = SubscriptionInner::start(
            id,
            ctx.clone(),
            subscriber,
            self.inner.config.async_subscriptions,
        )?;

        self.inner
            .subscriptions
            .lock()
            .map_err(|_| Error::LockPoisoned("subscription registry"))?
            .push(Arc::clone(&inner));

        debug!(
            log = self.inner.id,
            subscription = id,
            async_delivery = self.inner.config.async_subscriptions,
            "subscribed"
        );
        Ok(LogSubscription::new(self.clone(), inner))
    }

    pub(crate) fn unregister(&self, subscription_id: u64) -> Result<()> {
        let mut subscriptions = self
            .inner
            .subscriptions
            .lock()
            .map_err(|_| Error::LockPoisoned("subscription registry"))?;
        subscriptions.retain(|sub| sub.id() != subscription_id);
        debug!(log = self.inner.id, subscription = subscription_id, "unsubscribed");
        Ok(())
    }

    // ========================================================================
    // Append + dispatch
    // ========================================================================

    /// Append events to the committed log and notify subscribers in order.
    pub(crate) fn append_committed(&self, batch: Vec<Event>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let last_seq = {
            let mut events = self
                .inner
                .events
                .write()
                .map_err(|_| Error::LockPoisoned("event log write"))?;
            let mut dispatch = self
                .inner
                .dispatch
                .lock()
                .map_err(|_| Error::LockPoisoned("event log dispatch"))?;

            events.extend(batch.iter().cloned());
            dispatch.next_seq += batch.len() as u64;
            dispatch.queue.extend(batch);
            dispatch.next_seq - 1
        };

        self.dispatch_through(last_seq)
    }

    /// Block until the event with sequence `seq` has been delivered.
    ///
    /// The calling thread becomes the drainer when nobody else is. A call made
    /// by the drainer itself (an append from inside a sync handler) returns at
    /// once; its events are delivered when the current handler returns.
    fn dispatch_through(&self, seq: u64) -> Result<()> {
        let me = thread::current().id();
        let mut state = self
            .inner
            .dispatch
            .lock()
            .map_err(|_| Error::LockPoisoned("event log dispatch"))?;

        loop {
            if state.done_seq > seq {
                return Ok(());
            }

            let drainer = state.drainer;
            match drainer {
                Some(current) if current == me => return Ok(()),
                Some(_) => {
                    state = self
                        .inner
                        .dispatched
                        .wait(state)
                        .map_err(|_| Error::LockPoisoned("event log dispatch"))?;
                }
                None => {
                    state.drainer = Some(me);
                    while let Some(event) = state.queue.pop_front() {
                        drop(state);
                        self.notify(&event);
                        state = self
                            .inner
                            .dispatch
                            .lock()
                            .map_err(|_| Error::LockPoisoned("event log dispatch"))?;
                        state.done_seq += 1;
                        self.inner.dispatched.notify_all();
                    }
                    state.drainer = None;
                    self.inner.dispatched.notify_all();
                }
            }
        }
    }

    fn notify(&self, event: &Event) {
        let subscriptions = match self.inner.subscriptions.lock() {
            Ok(subscriptions) => subscriptions.clone(),
            Err(_) => {
                warn!(log = self.inner.id, "subscription registry poisoned, dropping notification");
                return;
            }
        };

        for subscription in subscriptions {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| subscription.publish(event)));
            if outcome.is_err() {
                warn!(
                    log = self.inner.id,
                    subscription = subscription.id(),
                    "subscriber panicked while handling event"
                );
            }
        }
    }
}

fn nearest_open(tx: Transaction) -> Option<Transaction> {
    let mut current = tx;
    loop {
        if current.is_open() {
            return Some(current);
        }
        let parent = match current.parent() {
            TxParent::Tx(parent) => parent.clone(),
            TxParent::Log(_) => return None,
        };
        current = parent;
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .finish()
    }
}
