// ============================================================================
// spark-reactor - A Push/Pull Reactive Engine for Rust
// ============================================================================
//
// Sources, lazily verified deriveds and an owned tree of effects over one
// explicit runtime. Writes push dirty marks downstream; reads and flushes
// pull by comparing write versions, so only work whose inputs actually
// changed is redone.
// ============================================================================

pub mod collections;
pub mod core;
pub mod primitives;
mod reactivity;
pub mod runtime;

// Re-export the public surface at crate root
pub use crate::core::error::ReactiveError;
pub use crate::core::flags::{DirtyState, EffectKind, NodeKind};
pub use crate::core::options::{DerivedOptions, RuntimeOptions, SchedulerMode};
pub use crate::core::types::{EqualsFn, NodeId};
pub use crate::runtime::Runtime;

pub use primitives::async_derived::AsyncDerived;
pub use primitives::derived::Derived;
pub use primitives::effect::{CleanupFn, DisposeFn, Effect};
pub use primitives::signal::Source;

pub use reactivity::equality;

pub use collections::{ReactiveMap, ReactiveRecord, ReactiveSet, ReactiveVec};

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::convert::Infallible;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn derived_follows_its_source() {
        let rt = Runtime::new();
        let s = rt.source(0);
        let s2 = s.clone();
        let d = rt.derived(move || s2.get() * 2);

        assert_eq!(d.get(), 0);
        s.set(5);
        assert_eq!(d.get(), 10);
    }

    #[test]
    fn nested_deriveds_and_owner_teardown() {
        let rt = Runtime::new();
        let s = rt.source(1);
        let s2 = s.clone();
        let a = rt.derived(move || s2.get());
        let a2 = a.clone();
        let b = rt.derived(move || a2.get() * 2);

        s.set(3);
        assert_eq!(b.get(), 6);

        // b owned by an effect; a is its only upstream and has no other observer
        let held = Rc::new(std::cell::RefCell::new(None));
        let (rt2, a3, h) = (rt.clone(), a.clone(), held.clone());
        let fx = rt.effect(move || {
            let a4 = a3.clone();
            let owned = rt2.derived(move || a4.get() * 2);
            owned.get();
            *h.borrow_mut() = Some(owned);
        });
        assert_eq!(s.reaction_count(), 1);
        assert!(!a.is_disconnected());

        fx.dispose();
        let owned = held.borrow_mut().take().unwrap();
        assert!(owned.is_destroyed());
        assert!(a.is_disconnected());
        assert_eq!(s.reaction_count(), 0);
        assert_eq!(a.reaction_count(), 0);
    }

    #[test]
    fn disposed_effect_never_runs_again() {
        let rt = Runtime::new();
        let x = rt.source(1);
        let y = rt.source(2);
        let runs = Rc::new(Cell::new(0));

        let (x2, y2, r) = (x.clone(), y.clone(), runs.clone());
        let fx = rt.effect(move || {
            let _ = x2.get() + y2.get();
            r.set(r.get() + 1);
        });
        assert_eq!(runs.get(), 1);

        fx.dispose();
        x.set(10);
        y.set(20);
        rt.tick().unwrap();
        assert_eq!(runs.get(), 1);
        assert_eq!(x.reaction_count(), 0);
    }

    #[test]
    fn rejected_async_derived_rereports_until_fixed() {
        #[derive(Debug, thiserror::Error)]
        #[error("third read fails")]
        struct ThirdRead;

        let rt = Runtime::new();
        let n = rt.source(1);
        let n2 = n.clone();
        let d = rt.async_derived(move || {
            let n = n2.get();
            async move { if n == 3 { Err(ThirdRead) } else { Ok(n) } }
        });

        assert_eq!(d.get().unwrap(), 1);
        n.set(3);
        for _ in 0..3 {
            assert!(matches!(d.get(), Err(ReactiveError::AsyncRejected(_))));
        }
        assert!(d.has_error());

        n.set(4);
        assert_eq!(d.get().unwrap(), 4);
        assert!(!d.has_error());
    }

    #[test]
    fn runaway_effect_trips_loop_guard_once() {
        let rt = Runtime::new();
        let s = rt.source(0u32);
        let other = rt.source(0u32);

        let s2 = s.clone();
        let o2 = other.clone();
        let fx = rt.effect(move || {
            let v = s2.get();
            o2.get();
            s2.set(v + 1);
        });

        let err = rt.tick().unwrap_err();
        assert!(matches!(err, ReactiveError::MaxUpdateDepth { limit: 1000 }));
        rt.tick().unwrap();

        // Edges intact: one reaction per source, two deps on the effect.
        assert_eq!(s.reaction_count(), 1);
        assert_eq!(other.reaction_count(), 1);
        assert_eq!(fx.dep_count(), 2);

        // The graph still works after the abort.
        fx.dispose();
        assert_eq!(s.reaction_count(), 0);
    }

    #[test]
    fn unchanged_final_value_keeps_version() {
        let rt = Runtime::new();
        let s = rt.source(1);
        let v = s.write_version();
        s.set(1);
        s.set(1);
        assert_eq!(s.write_version(), v);
        assert_eq!(s.get(), 1);
    }

    #[test]
    fn clean_derived_is_not_recomputed() {
        let rt = Runtime::new();
        let runs = Rc::new(Cell::new(0));
        let s = rt.source(2);
        let (s2, r) = (s.clone(), runs.clone());
        let d = rt.derived(move || {
            r.set(r.get() + 1);
            s2.get() + 1
        });
        assert_eq!(d.get(), 3);
        assert_eq!(d.get(), 3);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn infallible_async_derived_reads_immediately() {
        let rt = Runtime::new();
        let d = rt.async_derived(|| async { Ok::<_, Infallible>("ready") });
        assert_eq!(d.get().unwrap(), "ready");
    }
}
