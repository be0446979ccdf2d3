use spark_reactor::Runtime;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

#[test]
fn test_batch_runs_each_effect_once_on_exit() {
    let rt = Runtime::new();
    let first = rt.source("Ada");
    let last = rt.source("Lovelace");
    let log = Rc::new(RefCell::new(Vec::new()));

    let (f, l, log2) = (first.clone(), last.clone(), log.clone());
    let _fx = rt.effect(move || log2.borrow_mut().push(format!("{} {}", f.get(), l.get())));

    rt.batch(|| {
        first.set("Grace");
        last.set("Hopper");
    });

    // Drained on exit, without waiting for a tick.
    assert_eq!(*log.borrow(), vec!["Ada Lovelace", "Grace Hopper"]);
}

#[test]
fn test_nested_batches_drain_at_outermost() {
    let rt = Runtime::new();
    let s = rt.source(0);
    let runs = Rc::new(Cell::new(0));

    let (s2, r) = (s.clone(), runs.clone());
    let _fx = rt.effect(move || {
        s2.get();
        r.set(r.get() + 1);
    });

    let rt2 = rt.clone();
    rt.batch(|| {
        s.set(1);
        rt2.batch(|| s.set(2));
        assert_eq!(runs.get(), 1, "inner batch exit must not drain");
        assert!(rt2.is_batching());
    });
    assert_eq!(runs.get(), 2);
    assert!(!rt.is_batching());
}

#[test]
fn test_batch_returns_value() {
    let rt = Runtime::new();
    let s = rt.source(2);
    let out = rt.try_batch(|| {
        s.set(3);
        s.peek() * 7
    });
    assert_eq!(out.unwrap(), 21);
}

#[test]
fn test_reads_inside_batch_see_new_values() {
    let rt = Runtime::new();
    let s = rt.source(1);
    let s2 = s.clone();
    let doubled = rt.derived(move || s2.get() * 2);

    rt.batch(|| {
        s.set(5);
        assert_eq!(doubled.get(), 10);
    });
}

#[test]
fn test_unwound_batch_discards_queue_and_rearms() {
    let rt = Runtime::new();
    let s = rt.source(0);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let (s2, log) = (s.clone(), seen.clone());
    let _fx = rt.effect(move || log.borrow_mut().push(s2.get()));

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        rt.batch(|| -> () {
            s.set(1);
            panic!("abandon the batch");
        })
    }));
    assert!(result.is_err());
    assert!(!rt.is_batching());

    rt.tick().unwrap();
    assert_eq!(*seen.borrow(), vec![0], "queued work was discarded");

    s.set(2);
    rt.tick().unwrap();
    assert_eq!(*seen.borrow(), vec![0, 2], "the next write schedules the effect again");
}

#[test]
fn test_untrack_hides_reads() {
    let rt = Runtime::new();
    let tracked = rt.source(0);
    let hidden = rt.source(0);
    let runs = Rc::new(Cell::new(0));

    let (rt2, t, h, r) = (rt.clone(), tracked.clone(), hidden.clone(), runs.clone());
    let fx = rt.effect(move || {
        t.get();
        rt2.untrack(|| h.get());
        r.set(r.get() + 1);
    });
    assert_eq!(fx.dep_count(), 1);

    hidden.set(1);
    rt.tick().unwrap();
    assert_eq!(runs.get(), 1);

    tracked.set(1);
    rt.tick().unwrap();
    assert_eq!(runs.get(), 2);
}
