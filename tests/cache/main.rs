//! Integration tests for the read-through cache manager.

mod support;

use sourced_cache::cache::{Hit, Source};
use sourced_cache::crud::vec_iter;
use sourced_cache::prelude::*;
use sourced_cache::{Change, Event, EventLogConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use support::{eventually, widget, CountingSource, Widget};

struct Fixture {
    source: Arc<CountingSource>,
    storage: Arc<InMemoryCacheStorage<Widget, u64>>,
    manager: Arc<Manager<Widget, u64>>,
}

fn fixture_with(config: EventLogConfig, seed: &[Widget]) -> Fixture {
    let source = CountingSource::new(EventLog::with_config(config));
    source.seed(seed);
    let storage = Arc::new(InMemoryCacheStorage::<Widget, u64>::new());
    let manager = Arc::new(Manager::<Widget, u64>::extended(source.clone(), storage.clone()));
    Fixture {
        source,
        storage,
        manager,
    }
}

fn fixture(seed: &[Widget]) -> Fixture {
    fixture_with(EventLogConfig::default(), seed)
}

impl Fixture {
    fn cached_entities(&self) -> usize {
        self.storage
            .entities()
            .find_all(&Context::background())
            .count()
    }

    fn cached_hits(&self) -> usize {
        self.storage.hits().find_all(&Context::background()).count()
    }

    fn all(&self) -> Vec<Widget> {
        let mut all: Vec<Widget> = self
            .manager
            .find_all(&Context::background())
            .collect::<Result<_>>()
            .unwrap();
        all.sort_by_key(|w| w.id);
        all
    }
}

// ============================================================================
// Read path
// ============================================================================

#[test]
fn miss_then_hit_reaches_source_once() {
    let f = fixture(&[widget(7, "x")]);
    let ctx = Context::background();

    assert_eq!(f.manager.find_by_id(&ctx, &7).unwrap(), Some(widget(7, "x")));
    assert_eq!(f.source.find_by_id_calls(), 1);

    assert_eq!(f.manager.find_by_id(&ctx, &7).unwrap(), Some(widget(7, "x")));
    assert_eq!(f.source.find_by_id_calls(), 1);
}

#[test]
fn read_through_populates_entity_store() {
    let f = fixture(&[widget(3, "c")]);
    let ctx = Context::background();
    assert_eq!(f.storage.entities().find_by_id(&ctx, &3).unwrap(), None);

    f.manager.find_by_id(&ctx, &3).unwrap();
    assert_eq!(
        f.storage.entities().find_by_id(&ctx, &3).unwrap(),
        Some(widget(3, "c"))
    );
}

#[test]
fn missing_entity_is_memoised_as_empty_hit() {
    let f = fixture(&[]);
    let ctx = Context::background();

    assert_eq!(f.manager.find_by_id(&ctx, &42).unwrap(), None);
    assert_eq!(f.manager.find_by_id(&ctx, &42).unwrap(), None);
    assert_eq!(f.source.find_by_id_calls(), 1);

    let query_id = f.manager.query_id("FindByID#42");
    let hit = f.storage.hits().find_by_id(&ctx, &query_id).unwrap();
    assert_eq!(hit, Some(Hit::new(query_id, Vec::new())));
}

#[test]
fn query_is_produced_once_while_cache_is_unchanged() {
    let f = fixture(&[widget(1, "a"), widget(2, "b")]);
    let ctx = Context::background();
    let produced = AtomicUsize::new(0);
    let produce = |ctx: &Context| {
        produced.fetch_add(1, Ordering::SeqCst);
        f.source.inner.find_all(ctx)
    };

    let mut first: Vec<Widget> = f
        .manager
        .cache_query_many(&ctx, "Everything", produce)
        .collect::<Result<_>>()
        .unwrap();
    let mut second: Vec<Widget> = f
        .manager
        .cache_query_many(&ctx, "Everything", produce)
        .collect::<Result<_>>()
        .unwrap();
    first.sort_by_key(|w| w.id);
    second.sort_by_key(|w| w.id);

    assert_eq!(produced.load(Ordering::SeqCst), 1);
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
}

#[test]
fn fingerprint_carries_epoch_and_type() {
    let f = fixture(&[]);
    let query_id = f.manager.query_id("FindAll");
    assert!(query_id.starts_with("0:"));
    assert!(query_id.ends_with("Widget/FindAll"));
}

#[test]
fn concurrent_misses_share_one_source_query() {
    let source = CountingSource::with_delay(EventLog::new(), Duration::from_millis(30));
    source.seed(&[widget(1, "a"), widget(2, "b")]);
    let storage = Arc::new(InMemoryCacheStorage::<Widget, u64>::new());
    let manager = Arc::new(Manager::<Widget, u64>::extended(source.clone(), storage));
    manager.init(&Context::background()).unwrap();

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                manager
                    .find_all(&Context::background())
                    .collect::<Result<Vec<_>>>()
                    .unwrap()
                    .len()
            })
        })
        .collect();
    for reader in readers {
        assert_eq!(reader.join().unwrap(), 2);
    }
    assert_eq!(source.find_all_calls(), 1);
}

#[test]
fn stale_hit_is_dropped_and_recomputed() {
    let f = fixture(&[widget(1, "a"), widget(2, "b")]);
    let ctx = Context::background();
    assert_eq!(f.all().len(), 2);
    assert_eq!(f.source.find_all_calls(), 1);

    // Evict one entity behind the manager's back.
    f.storage.entities().delete_by_id(&ctx, &2).unwrap();

    assert_eq!(f.all(), vec![widget(1, "a"), widget(2, "b")]);
    assert_eq!(f.source.find_all_calls(), 2);
}

#[test]
fn zero_id_from_source_is_cached_under_zero() {
    let f = fixture(&[]);
    let ctx = Context::background();
    let payload = serde_json::to_value(widget(0, "zero")).unwrap();
    f.source
        .inner
        .log()
        .append(&ctx, Event::new("widgets", Change::Create(payload)))
        .unwrap();

    for _ in 0..3 {
        assert_eq!(f.all(), vec![widget(0, "zero")]);
    }
    assert_eq!(f.source.find_all_calls(), 1);
    assert_eq!(f.cached_entities(), 1);
    assert_eq!(f.manager.find_by_id(&ctx, &0).unwrap(), Some(widget(0, "zero")));
    assert_eq!(f.source.find_by_id_calls(), 0);
}

#[test]
fn source_write_during_produce_is_not_memoised() {
    let f = fixture_with(EventLogConfig::synchronous(), &[widget(1, "a")]);
    let ctx = Context::background();

    let produced: Vec<Widget> = f
        .manager
        .cache_query_many(&ctx, "FindAll", |ctx| {
            let snapshot: Vec<Widget> = f.source.inner.find_all(ctx).collect::<Result<_>>().unwrap();
            f.source.create(ctx, &mut widget(2, "b")).unwrap();
            vec_iter(snapshot)
        })
        .collect::<Result<_>>()
        .unwrap();

    assert_eq!(produced, vec![widget(1, "a")]);
    assert_eq!(f.cached_hits(), 0);
    assert_eq!(f.all(), vec![widget(1, "a"), widget(2, "b")]);
    assert_eq!(f.source.find_all_calls(), 1);
}

#[test]
fn cancelled_context_yields_error_sequence() {
    let f = fixture(&[widget(1, "a")]);
    let (ctx, cancel) = Context::background().with_cancel();
    cancel.cancel();

    let results: Vec<_> = f.manager.find_all(&ctx).collect();
    assert_eq!(results, vec![Err(Error::Cancelled)]);
    assert_eq!(f.manager.find_by_id(&ctx, &1), Err(Error::Cancelled));
    assert_eq!(f.source.find_all_calls(), 0);
}

// ============================================================================
// Write path
// ============================================================================

#[test]
fn local_writes_are_visible_immediately() {
    let f = fixture_with(EventLogConfig::synchronous(), &[widget(100, "a")]);
    let ctx = Context::background();
    assert_eq!(f.all().len(), 1);

    let mut created = widget(0, "new");
    f.manager.create(&ctx, &mut created).unwrap();
    assert!(!created.id.is_zero());
    assert_eq!(f.all().len(), 2);

    f.manager.update(&ctx, &widget(100, "a2")).unwrap();
    assert_eq!(f.manager.find_by_id(&ctx, &100).unwrap(), Some(widget(100, "a2")));

    f.manager.delete_by_id(&ctx, &100).unwrap();
    assert_eq!(f.manager.find_by_id(&ctx, &100).unwrap(), None);
    assert_eq!(f.all(), vec![created]);

    f.manager.delete_all(&ctx).unwrap();
    assert!(f.all().is_empty());
    assert_eq!(f.source.inner.find_all(&ctx).count(), 0);
}

#[test]
fn save_creates_or_updates_through_the_source() {
    let f = fixture_with(EventLogConfig::synchronous(), &[]);
    let ctx = Context::background();

    let mut w = widget(0, "first");
    f.manager.save(&ctx, &mut w).unwrap();
    assert_eq!(f.source.inner.find_by_id(&ctx, &w.id).unwrap(), Some(w.clone()));

    w.v = "second".into();
    f.manager.save(&ctx, &mut w).unwrap();
    assert_eq!(f.source.inner.find_by_id(&ctx, &w.id).unwrap(), Some(w.clone()));
    assert_eq!(f.manager.find_by_id(&ctx, &w.id).unwrap(), Some(w));
}

#[test]
fn update_without_updater_is_not_implemented() {
    let source = CountingSource::new(EventLog::new());
    source.seed(&[widget(1, "a")]);
    let plain: Arc<dyn Source<Widget, u64>> = source.clone();
    let manager = Manager::<Widget, u64>::new(plain, Arc::new(InMemoryCacheStorage::<Widget, u64>::new()));

    let err = manager
        .update(&Context::background(), &widget(1, "b"))
        .unwrap_err();
    assert!(matches!(err, Error::NotImplemented(_)));
    assert_eq!(
        source.inner.find_by_id(&Context::background(), &1).unwrap(),
        Some(widget(1, "a"))
    );
}

#[test]
fn source_errors_propagate_and_leave_cache_alone() {
    let f = fixture(&[widget(1, "a")]);
    let ctx = Context::background();
    f.manager.find_by_id(&ctx, &1).unwrap();

    let err = f.manager.create(&ctx, &mut widget(1, "dup")).unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));
    assert!(f.manager.delete_by_id(&ctx, &9).unwrap_err().is_not_found());
    assert_eq!(f.manager.find_by_id(&ctx, &1).unwrap(), Some(widget(1, "a")));
}

#[test]
fn purge_only_touches_the_cache() {
    let f = fixture(&[widget(1, "a")]);
    let ctx = Context::background();
    f.all();
    assert_eq!(f.cached_entities(), 1);

    f.manager.purge(&ctx).unwrap();
    assert_eq!(f.cached_entities(), 0);
    assert_eq!(f.cached_hits(), 0);
    assert_eq!(f.all(), vec![widget(1, "a")]);
}

// ============================================================================
// Source-event invalidation
// ============================================================================

#[test]
fn source_create_drops_every_hit() {
    let f = fixture(&[widget(1, "a")]);
    let ctx = Context::background();
    f.all();
    assert_eq!(f.cached_hits(), 1);

    f.source.create(&ctx, &mut widget(2, "b")).unwrap();
    eventually("hits dropped after source create", || f.cached_hits() == 0);
    assert_eq!(f.all().len(), 2);
}

#[test]
fn source_update_invalidates_cached_entity() {
    let f = fixture(&[widget(9, "old")]);
    let ctx = Context::background();
    assert_eq!(f.manager.find_by_id(&ctx, &9).unwrap(), Some(widget(9, "old")));

    f.source.update(&ctx, &widget(9, "new")).unwrap();
    eventually("manager sees the update", || {
        f.manager.find_by_id(&ctx, &9).unwrap() == Some(widget(9, "new"))
    });
}

#[test]
fn source_delete_drops_entity_and_hits() {
    let f = fixture(&[widget(1, "a"), widget(2, "b")]);
    let ctx = Context::background();
    f.all();
    assert_eq!(f.cached_entities(), 2);

    f.source.delete_by_id(&ctx, &2).unwrap();
    eventually("entity 2 evicted", || {
        f.storage.entities().find_by_id(&ctx, &2).unwrap().is_none() && f.cached_hits() == 0
    });
    assert_eq!(f.all(), vec![widget(1, "a")]);
}

#[test]
fn source_delete_all_empties_the_cache() {
    let seed: Vec<Widget> = (1..=5).map(|id| widget(id, &id.to_string())).collect();
    let f = fixture(&seed);
    let ctx = Context::background();
    assert_eq!(f.all().len(), 5);
    assert_eq!(f.cached_entities(), 5);

    f.source.delete_all(&ctx).unwrap();
    eventually("cache emptied", || f.cached_entities() == 0 && f.cached_hits() == 0);
    assert!(f.all().is_empty());
}

#[test]
fn closed_manager_stops_listening() {
    let f = fixture_with(EventLogConfig::synchronous(), &[widget(1, "a")]);
    let ctx = Context::background();
    f.all();
    f.manager.close().unwrap();
    f.manager.close().unwrap();

    f.source.create(&ctx, &mut widget(2, "b")).unwrap();
    assert_eq!(f.cached_hits(), 1);
    assert_eq!(f.all(), vec![widget(1, "a")]);
}
