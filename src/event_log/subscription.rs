//! Per-subscription delivery: inline (sync) or one queue + one worker (async).

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, warn};

use super::log::EventLog;
use crate::context::{CancelHandle, Context};
use crate::crud::{Subscriber, Subscription};
use crate::error::{Error, Result};
use crate::event::Event;

enum Delivery {
    Inline,
    Queued(Sender<Event>),
    Closed,
}

pub(crate) struct SubscriptionInner {
    id: u64,
    /// Handed to the subscriber on every delivery.
    ctx: Context,
    /// Blocks publishes once close starts.
    publish_ctx: Context,
    cancel: CancelHandle,
    subscriber: Arc<dyn Subscriber<Event>>,
    /// Guards the publish/close race; held for the whole of a publish.
    delivery: Mutex<Delivery>,
    /// Thread running an inline delivery, if any.
    inline_thread: Mutex<Option<ThreadId>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SubscriptionInner {
    pub(crate) fn start(
        id: u64,
        ctx: Context,
        subscriber: Arc<dyn Subscriber<Event>>,
        async_delivery: bool,
    ) -> Result<Arc<Self>> {
        let (publish_ctx, cancel) = ctx.with_cancel();

        let (delivery, worker) = if async_delivery {
            let (tx, rx) = channel();
            let handle = spawn_worker(id, ctx.clone(), Arc::clone(&subscriber), rx)?;
            (Delivery::Queued(tx), Some(handle))
        } else {
            (Delivery::Inline, None)
        };

        Ok(Arc::new(Self {
            id,
            ctx,
            publish_ctx,
            cancel,
            subscriber,
            delivery: Mutex::new(delivery),
            inline_thread: Mutex::new(None),
            worker: Mutex::new(worker),
            closed: AtomicBool::new(false),
        }))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn publish(&self, event: &Event) {
        let delivery = match self.delivery.lock() {
            Ok(delivery) => delivery,
            Err(_) => {
                warn!(subscription = self.id, "subscription lock poisoned, event dropped");
                return;
            }
        };
        if self.publish_ctx.is_done() {
            return;
        }

        match &*delivery {
            Delivery::Inline => {
                self.set_inline_thread(Some(thread::current().id()));
                deliver(self.id, &self.ctx, self.subscriber.as_ref(), event.clone());
                self.set_inline_thread(None);
            }
            Delivery::Queued(tx) => {
                if tx.send(event.clone()).is_err() {
                    warn!(subscription = self.id, "subscription worker gone, event dropped");
                }
            }
            Delivery::Closed => {}
        }
    }

    fn set_inline_thread(&self, thread: Option<ThreadId>) {
        match self.inline_thread.lock() {
            Ok(mut current) => *current = thread,
            Err(_) => warn!(subscription = self.id, "subscription lock poisoned"),
        }
    }

    fn close(&self) -> Result<()> {
        self.cancel.cancel();

        let in_own_handler = self
            .inline_thread
            .lock()
            .map_err(|_| Error::LockPoisoned("subscription close"))?
            .is_some_and(|id| id == thread::current().id());
        if in_own_handler {
            // The publish in progress holds `delivery`; the cancelled publish
            // context already blocks every later event.
            return Ok(());
        }

        // Waits for an in-flight publish to finish.
        let previous = {
            let mut delivery = self
                .delivery
                .lock()
                .map_err(|_| Error::LockPoisoned("subscription close"))?;
            std::mem::replace(&mut *delivery, Delivery::Closed)
        };
        // Dropping the sender lets the worker drain the queue and exit.
        drop(previous);

        let worker = self
            .worker
            .lock()
            .map_err(|_| Error::LockPoisoned("subscription close"))?
            .take();
        if let Some(handle) = worker {
            if handle.thread().id() == thread::current().id() {
                // Closed from inside its own handler; the worker exits once drained.
                return Ok(());
            }
            handle
                .join()
                .map_err(|_| Error::Subscription(format!("worker of subscription {} panicked", self.id)))?;
        }
        Ok(())
    }
}

fn spawn_worker(
    id: u64,
    ctx: Context,
    subscriber: Arc<dyn Subscriber<Event>>,
    rx: Receiver<Event>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("event-log-subscription-{}", id))
        .spawn(move || {
            for event in rx {
                deliver(id, &ctx, subscriber.as_ref(), event);
            }
            debug!(subscription = id, "subscription worker drained");
        })
        .map_err(|e| Error::Subscription(format!("failed to spawn worker: {}", e)))
}

/// Hand one event to the subscriber. Handler errors go to `error`; neither
/// unregisters the subscription.
fn deliver(id: u64, ctx: &Context, subscriber: &dyn Subscriber<Event>, event: Event) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| subscriber.handle(ctx, event)));
    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(_) => Error::Subscription("subscriber panicked".into()),
    };

    warn!(subscription = id, error = %err, "subscriber failed to handle event");
    if let Err(report_err) = subscriber.error(ctx, err) {
        warn!(subscription = id, error = %report_err, "subscriber error callback failed");
    }
}

/// Handle returned by `EventLog::subscribe`.
pub struct LogSubscription {
    log: EventLog,
    inner: Arc<SubscriptionInner>,
}

impl LogSubscription {
    pub(crate) fn new(log: EventLog, inner: Arc<SubscriptionInner>) -> Self {
        Self { log, inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Subscription for LogSubscription {
    fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.log.unregister(self.inner.id)?;
        self.inner.close()
    }
}
