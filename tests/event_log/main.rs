//! Integration tests for the event log: transactions, isolation and delivery order.

use proptest::prelude::*;
use serde_json::json;
use sourced_cache::prelude::*;
use sourced_cache::{Change, Event, EventLogConfig};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn create(ns: &str, id: u64) -> Event {
    Event::new(ns, Change::Create(json!({ "id": id })))
}

fn ids(events: &[Event]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| e.value().and_then(|v| v["id"].as_u64()))
        .collect()
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<u64>>,
}

impl Subscriber<Event> for Recorder {
    fn handle(&self, _ctx: &Context, event: Event) -> Result<()> {
        if let Some(id) = event.value().and_then(|v| v["id"].as_u64()) {
            self.seen.lock().unwrap().push(id);
        }
        Ok(())
    }

    fn error(&self, _ctx: &Context, _err: Error) -> Result<()> {
        Ok(())
    }
}

fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for: {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn sibling_transactions_are_isolated() {
    let log = EventLog::new();
    let root = Context::background();
    let a = log.begin_tx(&root).unwrap();
    let b = log.begin_tx(&root).unwrap();

    log.append(&a, create("x", 1)).unwrap();
    log.append(&b, create("x", 2)).unwrap();

    assert_eq!(ids(&log.events_in(&a).unwrap()), vec![1]);
    assert_eq!(ids(&log.events_in(&b).unwrap()), vec![2]);
    assert!(log.events().unwrap().is_empty());

    log.commit_tx(&b).unwrap();
    assert_eq!(ids(&log.events_in(&a).unwrap()), vec![2, 1]);
    log.commit_tx(&a).unwrap();
    assert_eq!(ids(&log.events().unwrap()), vec![2, 1]);
}

#[test]
fn staged_order_is_kept_on_commit() {
    let log = EventLog::with_config(EventLogConfig::synchronous());
    let ctx = Context::background();
    let recorder = Arc::new(Recorder::default());
    let _sub = log.subscribe(&ctx, recorder.clone()).unwrap();

    log.append(&ctx, create("x", 1)).unwrap();
    let tx = log.begin_tx(&ctx).unwrap();
    for id in 2..=5 {
        log.append(&tx, create("x", id)).unwrap();
    }
    log.append(&ctx, create("x", 6)).unwrap();
    log.commit_tx(&tx).unwrap();

    assert_eq!(ids(&log.events().unwrap()), vec![1, 6, 2, 3, 4, 5]);
    assert_eq!(*recorder.seen.lock().unwrap(), vec![1, 6, 2, 3, 4, 5]);
}

#[test]
fn async_subscribers_follow_append_order_under_contention() {
    let log = EventLog::new();
    let ctx = Context::background();
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    let sub_a = log.subscribe(&ctx, first.clone()).unwrap();
    let sub_b = log.subscribe(&ctx, second.clone()).unwrap();

    let writers: Vec<_> = (0..4u64)
        .map(|w| {
            let log = log.clone();
            thread::spawn(move || {
                let ctx = Context::background();
                for i in 0..50u64 {
                    if i % 10 == 0 {
                        let tx = log.begin_tx(&ctx).unwrap();
                        log.append(&tx, create("x", w * 1000 + i)).unwrap();
                        log.commit_tx(&tx).unwrap();
                    } else {
                        log.append(&ctx, create("x", w * 1000 + i)).unwrap();
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let appended = ids(&log.events().unwrap());
    assert_eq!(appended.len(), 200);
    eventually("both subscribers drained", || {
        first.seen.lock().unwrap().len() == 200 && second.seen.lock().unwrap().len() == 200
    });
    assert_eq!(*first.seen.lock().unwrap(), appended);
    assert_eq!(*second.seen.lock().unwrap(), appended);

    sub_a.close().unwrap();
    sub_b.close().unwrap();
}

#[test]
fn subscription_ctx_cancellation_blocks_delivery() {
    let log = EventLog::with_config(EventLogConfig::synchronous());
    let (sub_ctx, cancel) = Context::background().with_cancel();
    let recorder = Arc::new(Recorder::default());
    let _sub = log.subscribe(&sub_ctx, recorder.clone()).unwrap();

    log.append(&Context::background(), create("x", 1)).unwrap();
    cancel.cancel();
    log.append(&Context::background(), create("x", 2)).unwrap();
    assert_eq!(*recorder.seen.lock().unwrap(), vec![1]);
}

#[test]
fn subscribe_and_begin_check_the_context() {
    let log = EventLog::new();
    let (ctx, cancel) = Context::background().with_cancel();
    cancel.cancel();

    assert!(matches!(
        log.subscribe(&ctx, Arc::new(Recorder::default())),
        Err(Error::Cancelled)
    ));
    assert_eq!(log.begin_tx(&ctx).err(), Some(Error::Cancelled));
    let expired = Context::background().with_deadline(Instant::now());
    assert_eq!(log.events_in(&expired).err(), Some(Error::DeadlineExceeded));
}

#[derive(Debug, Clone)]
enum Op {
    Append(u64),
    Nested(Vec<u64>, bool),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..100u64).prop_map(Op::Append),
        (prop::collection::vec(0..100u64, 0..5), any::<bool>())
            .prop_map(|(ids, commit)| Op::Nested(ids, commit)),
    ]
}

fn apply(log: &EventLog, ctx: &Context, ops: &[Op]) {
    for op in ops {
        match op {
            Op::Append(id) => log.append(ctx, create("p", *id)).unwrap(),
            Op::Nested(ids, commit) => {
                let inner = log.begin_tx(ctx).unwrap();
                for id in ids {
                    log.append(&inner, create("p", *id)).unwrap();
                }
                if *commit {
                    log.commit_tx(&inner).unwrap();
                } else {
                    log.rollback_tx(&inner).unwrap();
                }
            }
        }
    }
}

proptest! {
    #[test]
    fn commit_equals_direct_replay(ops in prop::collection::vec(op(), 0..12)) {
        let direct = EventLog::new();
        apply(&direct, &Context::background(), &ops);

        let staged = EventLog::new();
        let tx = staged.begin_tx(&Context::background()).unwrap();
        apply(&staged, &tx, &ops);
        prop_assert!(staged.events().unwrap().is_empty());
        staged.commit_tx(&tx).unwrap();

        prop_assert_eq!(staged.events().unwrap(), direct.events().unwrap());
    }

    #[test]
    fn rollback_is_a_no_op(ops in prop::collection::vec(op(), 0..12), seed in 0..100u64) {
        let log = EventLog::new();
        log.append(&Context::background(), create("p", seed)).unwrap();
        let before = log.events().unwrap();

        let tx = log.begin_tx(&Context::background()).unwrap();
        apply(&log, &tx, &ops);
        log.rollback_tx(&tx).unwrap();

        prop_assert_eq!(log.events().unwrap(), before);
    }
}
