use spark_reactor::{Derived, Effect, ReactiveError, Runtime, RuntimeOptions, SchedulerMode};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn sync_runtime() -> Runtime {
    Runtime::with_options(RuntimeOptions::default().with_scheduler(SchedulerMode::Sync))
}

#[test]
fn test_effects_wait_for_tick() {
    let rt = Runtime::new();
    let count = rt.source(0);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let (c, s) = (count.clone(), seen.clone());
    let _fx = rt.effect(move || s.borrow_mut().push(c.get()));

    count.set(1);
    count.set(2);
    assert_eq!(*seen.borrow(), vec![0], "writes alone never run effects");

    rt.tick().unwrap();
    assert_eq!(*seen.borrow(), vec![0, 2], "one run per flush, with the final value");
}

#[test]
fn test_write_then_revert_is_verified_clean() {
    let rt = Runtime::new();
    let count = rt.source(1);
    let runs = Rc::new(Cell::new(0));

    let c = count.clone();
    let parity = rt.derived(move || c.get() % 2);
    let (p, r) = (parity.clone(), runs.clone());
    let _fx = rt.effect(move || {
        p.get();
        r.set(r.get() + 1);
    });

    count.set(3);
    rt.tick().unwrap();
    assert_eq!(runs.get(), 1, "derived value unchanged, effect verified clean");
}

#[test]
fn test_diamond_runs_effect_once() {
    let rt = sync_runtime();
    let root = rt.source(1);
    let runs = Rc::new(Cell::new(0));

    let r1 = root.clone();
    let left = rt.derived(move || r1.get() + 1);
    let r2 = root.clone();
    let right = rt.derived(move || r2.get() * 2);

    let (l, r, n) = (left.clone(), right.clone(), runs.clone());
    let seen = Rc::new(Cell::new(0));
    let s = seen.clone();
    let _fx = rt.effect(move || {
        s.set(l.get() + r.get());
        n.set(n.get() + 1);
    });
    assert_eq!(seen.get(), 4);

    root.set(5);
    assert_eq!(runs.get(), 2);
    assert_eq!(seen.get(), 16);
}

#[test]
fn test_parent_runs_before_child_and_child_is_recreated() {
    let rt = Runtime::new();
    let outer = rt.source(0);
    let inner = rt.source(0);
    let log = Rc::new(RefCell::new(Vec::new()));

    let (rt2, o, i, l) = (rt.clone(), outer.clone(), inner.clone(), log.clone());
    let parent = rt.effect(move || {
        let v = o.get();
        l.borrow_mut().push(format!("parent {v}"));
        let (i2, l2) = (i.clone(), l.clone());
        let _ = rt2.effect(move || {
            let w = i2.get();
            l2.borrow_mut().push(format!("child {w}"));
        });
    });
    assert_eq!(*log.borrow(), vec!["parent 0", "child 0"]);
    assert_eq!(parent.child_count(), 1);

    log.borrow_mut().clear();
    inner.set(1);
    rt.tick().unwrap();
    assert_eq!(*log.borrow(), vec!["child 1"]);

    log.borrow_mut().clear();
    outer.set(1);
    inner.set(2);
    rt.tick().unwrap();
    assert_eq!(
        *log.borrow(),
        vec!["parent 1", "child 2"],
        "the old child is destroyed by the parent rerun, not run"
    );
    assert_eq!(parent.child_count(), 1);
}

#[test]
fn test_branch_skipped_unless_marked() {
    let rt = Runtime::new();
    let a = rt.source(0);
    let b = rt.source(0);
    let log = Rc::new(RefCell::new(Vec::new()));

    let (rt2, a2, b2, l) = (rt.clone(), a.clone(), b.clone(), log.clone());
    let _root = rt.effect_root(move || {
        let (rt3, a3, l2) = (rt2.clone(), a2.clone(), l.clone());
        let _ = rt2.branch(move || {
            let _ = rt3.effect(move || {
                a3.get();
                l2.borrow_mut().push("a");
            });
        });
        let (rt3, b3, l2) = (rt2.clone(), b2.clone(), l.clone());
        let _ = rt2.branch(move || {
            let _ = rt3.effect(move || {
                b3.get();
                l2.borrow_mut().push("b");
            });
        });
    });
    log.borrow_mut().clear();

    b.set(1);
    rt.tick().unwrap();
    assert_eq!(*log.borrow(), vec!["b"]);
}

#[test]
fn test_sync_mode_nested_writes_drain_in_one_call() {
    let rt = sync_runtime();
    let a = rt.source(0);
    let b = rt.source(0);
    let seen = Rc::new(Cell::new(0));

    let (a2, b2) = (a.clone(), b.clone());
    let _forward = rt.effect(move || {
        let v = a2.get();
        b2.set(v * 10);
    });
    let (b3, s) = (b.clone(), seen.clone());
    let _sink = rt.effect(move || s.set(b3.get()));

    a.set(4);
    assert_eq!(seen.get(), 40);
}

#[test]
fn test_loop_guard_reports_and_recovers() {
    let rt = Runtime::with_options(RuntimeOptions::default().with_max_update_depth(20));
    let a = rt.source(0u32);
    let b = rt.source(0u32);

    let (a2, b2) = (a.clone(), b.clone());
    let _ping = rt.effect(move || {
        let v = a2.get();
        b2.set(v + 1);
    });
    let (a3, b3) = (a.clone(), b.clone());
    let _pong = rt.effect(move || {
        let v = b3.get();
        a3.set(v + 1);
    });

    let err = rt.tick().unwrap_err();
    assert!(matches!(err, ReactiveError::MaxUpdateDepth { limit: 20 }));
    assert!(err.is_fatal());

    // A fresh, bounded write works normally afterwards.
    let c = rt.source(0);
    let seen = Rc::new(Cell::new(0));
    let (c2, s) = (c.clone(), seen.clone());
    let _fx = rt.effect(move || s.set(c2.get()));
    c.set(9);
    rt.flush_sync().ok();
    assert_eq!(seen.get(), 9);
}

#[test]
fn test_effect_failure_is_contained() {
    let rt = Runtime::new();
    let s = rt.source(0);
    let good_runs = Rc::new(Cell::new(0));

    let s2 = s.clone();
    let _bad = rt.effect(move || {
        if s2.get() > 0 {
            panic!("effect body failed");
        }
    });
    let (s3, g) = (s.clone(), good_runs.clone());
    let _good = rt.effect(move || {
        s3.get();
        g.set(g.get() + 1);
    });

    s.set(1);
    rt.tick().unwrap();
    assert_eq!(good_runs.get(), 2);

    s.set(2);
    rt.tick().unwrap();
    assert_eq!(good_runs.get(), 3, "the failing effect stays subscribed and contained");
}

#[test]
fn test_fatal_error_leaves_siblings_schedulable() {
    let rt = Runtime::new();
    let trigger = rt.source(0);
    let t = rt.source(0);
    let seen = Rc::new(Cell::new(0));

    let slot: Rc<RefCell<Option<Derived<i32>>>> = Rc::default();
    let (s, trig) = (slot.clone(), trigger.clone());
    let looped = rt.derived(move || {
        if trig.get() == 1 {
            s.borrow().as_ref().map_or(0, |me| me.get())
        } else {
            0
        }
    });
    *slot.borrow_mut() = Some(looped.clone());

    let (rt2, t2, out) = (rt.clone(), t.clone(), seen.clone());
    let _root = rt.effect_root(move || {
        let d = looped.clone();
        let _ = rt2.effect(move || {
            d.get();
        });
        let (t3, o) = (t2.clone(), out.clone());
        let _ = rt2.effect(move || o.set(t3.get()));
    });

    trigger.set(1);
    t.set(5);
    let err = rt.tick().unwrap_err();
    assert!(matches!(err, ReactiveError::CircularDependency { .. }));

    t.set(6);
    rt.tick().unwrap();
    t.set(7);
    rt.tick().unwrap();
    assert_eq!(seen.get(), 7);
    slot.borrow_mut().take();
}

#[test]
fn test_render_effect_disposing_later_sibling() {
    let rt = Runtime::new();
    let s = rt.source(0);
    let seen = Rc::new(Cell::new(0));
    let victim: Rc<RefCell<Option<Effect>>> = Rc::default();

    let (rt2, s2, v, out) = (rt.clone(), s.clone(), victim.clone(), seen.clone());
    let _root = rt.effect_root(move || {
        let (s3, v2) = (s2.clone(), v.clone());
        let _ = rt2.render_effect(move || {
            if s3.get() == 1 {
                if let Some(fx) = v2.borrow().as_ref() {
                    fx.dispose();
                }
            }
        });
        let s3 = s2.clone();
        let middle = rt2.render_effect(move || {
            s3.get();
        });
        *v.borrow_mut() = Some(middle);
        let (s3, o) = (s2.clone(), out.clone());
        let _ = rt2.render_effect(move || o.set(s3.get()));
    });

    s.set(1);
    rt.flush_sync().unwrap();
    assert_eq!(seen.get(), 1);
    assert!(victim.borrow().as_ref().is_some_and(|fx| fx.is_destroyed()));
}
