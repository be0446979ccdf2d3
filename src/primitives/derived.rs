// ============================================================================
// spark-reactor - Derived Values
// Lazy computed values that cache and update when dependencies change
// ============================================================================
//
// A Derived is BOTH a Source (can be read, has reactions) AND a Reaction
// (has deps, can be marked dirty, recomputes). Pushes only ever mark it
// MAYBE_DIRTY; the next read resolves that by comparing versions, and its
// own write version moves only if the recomputed value differs.
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::core::error::ReactiveError;
use crate::core::flags::{DirtyState, NodeFlags, NodeKind, RunningGuard};
use crate::core::options::DerivedOptions;
use crate::core::types::{
    AnyDerived, AnyReaction, AnySource, EqualsFn, Node, NodeId, ReactionCore, SourceCore,
    default_equals,
};
use crate::reactivity::tracking::{check_dirtiness, run_tracked, track_read, unsubscribe};
use crate::runtime::Runtime;

// =============================================================================
// OWNERSHIP
// =============================================================================

/// Attach a new derived to whoever is creating it: the derived currently
/// computing, else the active effect. Returns true if nobody owns it.
pub(crate) fn register_owner(rt: &Runtime, derived: Rc<dyn AnyDerived>) -> bool {
    let ctx = rt.ctx();
    if let Some(parent) = ctx.current_reaction().and_then(|r| r.as_derived()) {
        let unowned = parent.flags().is_unowned();
        parent.own_child(derived);
        return unowned;
    }
    match ctx.active_effect() {
        Some(effect) => {
            effect.own_derived(derived);
            false
        }
        None => true,
    }
}

/// Whether a derived computed right now should appear in its dependencies'
/// reaction lists.
///
/// An unowned derived read outside any effect, with nobody subscribed to it,
/// stays out of the graph so it can be dropped like a plain value.
pub(crate) fn should_subscribe<D: AnyDerived + ?Sized>(rt: &Runtime, derived: &D) -> bool {
    !derived.flags().is_unowned() || rt.ctx().has_active_effect() || derived.reaction_count() > 0
}

/// Destroy owned child deriveds.
pub(crate) fn destroy_children(children: &RefCell<Vec<Rc<dyn AnyDerived>>>) {
    let children = std::mem::take(&mut *children.borrow_mut());
    for child in children {
        child.destroy();
    }
}

// =============================================================================
// ADAPTIVE CACHE
// =============================================================================

/// Timing of the last computation, for the adaptive cache window.
#[derive(Default)]
struct ComputeStats {
    last_duration: Cell<Duration>,
    finished_at: Cell<Option<Instant>>,
    /// A push was answered with the cached value
    stale: Cell<bool>,
}

impl ComputeStats {
    fn record(&self, started: Instant) {
        self.last_duration.set(started.elapsed());
        self.finished_at.set(Some(Instant::now()));
        self.stale.set(false);
    }

    /// Stale value whose window has since closed.
    fn expired(&self, rt: &Runtime) -> bool {
        self.stale.get() && !self.window_open(rt)
    }

    fn window_open(&self, rt: &Runtime) -> bool {
        let Some(finished) = self.finished_at.get() else {
            return false;
        };
        finished.elapsed() < rt.options().cache_window(self.last_duration.get())
    }
}

// =============================================================================
// DERIVED INNER
// =============================================================================

/// The internal data for a derived.
pub struct DerivedInner<T> {
    id: NodeId,
    flags: NodeFlags,
    source: SourceCore,
    reaction: ReactionCore,

    /// Cloned out before each call so the computation never runs under a borrow
    func: RefCell<Option<Rc<dyn Fn() -> T>>>,

    /// Cached value (None = never computed)
    value: RefCell<Option<T>>,

    equals: EqualsFn<T>,

    /// Deriveds created while this one computed
    children: RefCell<Vec<Rc<dyn AnyDerived>>>,

    /// Present when the adaptive cache window is enabled
    stats: Option<ComputeStats>,

    self_weak: Weak<DerivedInner<T>>,
}

impl<T: 'static> DerivedInner<T> {
    fn new(func: Rc<dyn Fn() -> T>, equals: EqualsFn<T>, adaptive_cache: bool) -> Rc<Self> {
        Rc::new_cyclic(|self_weak| Self {
            id: NodeId::next(),
            flags: NodeFlags::new(DirtyState::Dirty),
            source: SourceCore::default(),
            reaction: ReactionCore::default(),
            func: RefCell::new(Some(func)),
            value: RefCell::new(None),
            equals,
            children: RefCell::new(Vec::new()),
            stats: adaptive_cache.then(ComputeStats::default),
            self_weak: self_weak.clone(),
        })
    }

    /// Recompute and cache. Returns whether the value changed.
    fn compute(&self, rt: &Runtime) -> Result<bool, ReactiveError> {
        let flags = &self.flags;
        if flags.is_destroyed() {
            return Err(ReactiveError::Destroyed { node: self.id });
        }
        if flags.is_running() {
            return Err(ReactiveError::CircularDependency { node: self.id });
        }
        if let Some(stats) = &self.stats {
            if flags.is_initialized() && stats.window_open(rt) {
                debug!(derived = %self.id, "serving cached value inside the cache window");
                stats.stale.set(true);
                // Observed version stays behind so the next check still
                // sees newer deps. A connected derived must be Clean again
                // or later pushes stop at it.
                if !flags.is_disconnected() {
                    flags.set_state(DirtyState::Clean);
                }
                return Ok(false);
            }
        }

        let Some(func) = self.func.borrow().clone() else {
            return Err(ReactiveError::Destroyed { node: self.id });
        };
        let Some(me) = self.self_weak.upgrade() else {
            return Err(ReactiveError::Destroyed { node: self.id });
        };

        destroy_children(&self.children);
        let subscribe = should_subscribe(rt, self);
        let started = Instant::now();

        let outcome = {
            let _running = RunningGuard::enter(flags);
            let reaction: Rc<dyn AnyReaction> = me;
            run_tracked(rt, reaction, subscribe, || {
                panic::catch_unwind(AssertUnwindSafe(|| func()))
            })
            .value
        };
        let value = match outcome {
            Ok(value) => value,
            Err(payload) => match payload.downcast::<ReactiveError>() {
                Ok(err) => return Err(*err),
                Err(payload) => panic::resume_unwind(payload),
            },
        };
        if let Some(stats) = &self.stats {
            stats.record(started);
        }

        let changed = match self.value.borrow().as_ref() {
            Some(old) => !(self.equals)(old, &value),
            None => true,
        };
        let ctx = rt.ctx();
        if changed {
            *self.value.borrow_mut() = Some(value);
            self.source.set_write_version(ctx.increment_write_version());
        }
        self.reaction.set_observed_version(ctx.write_version());
        flags.set_initialized(true);
        flags.set_disconnected(!subscribe);
        flags.set_state(if subscribe {
            DirtyState::Clean
        } else {
            DirtyState::MaybeDirty
        });

        trace!(derived = %self.id, changed, subscribed = subscribe, "derived recomputed");
        Ok(changed)
    }
}

impl<T: 'static> Node for DerivedInner<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Derived
    }

    fn flags(&self) -> &NodeFlags {
        &self.flags
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_derived(&self) -> Option<Rc<dyn AnyDerived>> {
        self.self_weak
            .upgrade()
            .map(|rc| rc as Rc<dyn AnyDerived>)
    }
}

impl<T: 'static> AnySource for DerivedInner<T> {
    fn source_core(&self) -> &SourceCore {
        &self.source
    }
}

impl<T: 'static> AnyReaction for DerivedInner<T> {
    fn reaction_core(&self) -> &ReactionCore {
        &self.reaction
    }

    fn self_reaction(&self) -> Option<Rc<dyn AnyReaction>> {
        self.self_weak
            .upgrade()
            .map(|rc| rc as Rc<dyn AnyReaction>)
    }
}

impl<T: 'static> AnyDerived for DerivedInner<T> {
    fn recompute(&self, rt: &Runtime) -> Result<(), ReactiveError> {
        self.compute(rt).map(|_| ())
    }

    fn destroy(&self) {
        if self.flags.is_destroyed() {
            return;
        }
        self.flags.set_destroyed(true);
        destroy_children(&self.children);

        unsubscribe(self, 0, &[]);
        self.reaction.deps_mut().clear();

        self.func.borrow_mut().take();
        self.value.borrow_mut().take();
        self.flags.set_state(DirtyState::Clean);
        trace!(derived = %self.id, "derived destroyed");
    }

    fn self_source(&self) -> Option<Rc<dyn AnySource>> {
        self.self_weak
            .upgrade()
            .map(|rc| rc as Rc<dyn AnySource>)
    }

    fn own_child(&self, child: Rc<dyn AnyDerived>) {
        self.children.borrow_mut().push(child);
    }
}

// =============================================================================
// DERIVED<T> - The public derived handle
// =============================================================================

/// A cached value computed from other reactive values.
///
/// Lazy by default: nothing is computed until the first read, and a read
/// recomputes only if some dependency actually changed since the last one.
///
/// # Example
///
/// ```
/// use spark_reactor::Runtime;
///
/// let rt = Runtime::new();
/// let count = rt.source(2);
/// let c = count.clone();
/// let doubled = rt.derived(move || c.get() * 2);
///
/// assert_eq!(doubled.get(), 4);
/// count.set(5);
/// assert_eq!(doubled.get(), 10);
/// ```
pub struct Derived<T> {
    inner: Rc<DerivedInner<T>>,
    rt: Runtime,
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            rt: self.rt.clone(),
        }
    }
}

impl<T: 'static> Derived<T> {
    pub(crate) fn new(
        rt: &Runtime,
        func: Rc<dyn Fn() -> T>,
        equals: EqualsFn<T>,
        eager: bool,
        adaptive_cache: bool,
    ) -> Self {
        let inner = DerivedInner::new(func, equals, adaptive_cache);
        let unowned = register_owner(rt, inner.clone());
        inner.flags.set_unowned(unowned);

        let derived = Self {
            inner,
            rt: rt.clone(),
        };
        if eager {
            if let Err(err) = derived.inner.compute(rt) {
                err.raise();
            }
        }
        derived
    }

    pub(crate) fn with_options(rt: &Runtime, func: Rc<dyn Fn() -> T>, options: DerivedOptions<T>) -> Self
    where
        T: PartialEq,
    {
        let equals = options.equals.unwrap_or(default_equals);
        Self::new(rt, func, equals, options.eager, options.adaptive_cache)
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Rc<DerivedInner<T>> {
        &self.inner
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Bring the value up to date and track the read.
    pub fn try_get(&self) -> Result<T, ReactiveError>
    where
        T: Clone,
    {
        self.try_with(T::clone)
    }

    /// Like `try_get`, panicking with the `ReactiveError` on failure.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => err.raise(),
        }
    }

    /// Borrow the up-to-date value.
    pub fn try_with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, ReactiveError> {
        let inner = &self.inner;
        if inner.flags.is_destroyed() {
            return Err(ReactiveError::Destroyed { node: inner.id });
        }
        if inner.flags.is_running() {
            return Err(ReactiveError::CircularDependency { node: inner.id });
        }

        let expired = inner.stats.as_ref().is_some_and(|s| s.expired(&self.rt));
        if check_dirtiness(&self.rt, &**inner)? || expired {
            inner.compute(&self.rt)?;
        }
        track_read(&self.rt, self.as_any_source());

        let value = inner.value.borrow();
        match value.as_ref() {
            Some(value) => Ok(f(value)),
            None => Err(ReactiveError::NotInitialized { node: inner.id }),
        }
    }

    /// Read without tracking.
    pub fn peek(&self) -> T
    where
        T: Clone,
    {
        self.rt.untrack(|| self.get())
    }

    /// Detach this derived from the graph. Later reads fail with `Destroyed`.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.flags.is_destroyed()
    }

    /// Not owned by any effect or derived.
    pub fn is_unowned(&self) -> bool {
        self.inner.flags.is_unowned()
    }

    /// Currently absent from its dependencies' reaction lists.
    pub fn is_disconnected(&self) -> bool {
        self.inner.flags.is_disconnected()
    }

    pub fn state(&self) -> DirtyState {
        self.inner.flags.state()
    }

    pub fn write_version(&self) -> u64 {
        self.inner.write_version()
    }

    pub fn reaction_count(&self) -> usize {
        self.inner.reaction_count()
    }

    pub fn dep_count(&self) -> usize {
        self.inner.dep_count()
    }

    pub fn as_any_source(&self) -> Rc<dyn AnySource> {
        self.inner.clone()
    }
}

impl<T> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derived")
            .field("id", &self.inner.id)
            .field("state", &self.inner.flags.state())
            .field("destroyed", &self.inner.flags.is_destroyed())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use super::*;
    use crate::core::options::RuntimeOptions;

    fn counted<T: 'static>(
        rt: &Runtime,
        runs: &Rc<Cell<u32>>,
        f: impl Fn() -> T + 'static,
    ) -> Derived<T>
    where
        T: PartialEq,
    {
        let runs = runs.clone();
        rt.derived(move || {
            runs.set(runs.get() + 1);
            f()
        })
    }

    #[test]
    fn lazy_until_first_read() {
        let rt = Runtime::new();
        let runs = Rc::new(Cell::new(0));
        let count = rt.source(1);

        let c = count.clone();
        let doubled = counted(&rt, &runs, move || c.get() * 2);
        assert_eq!(runs.get(), 0);

        assert_eq!(doubled.get(), 2);
        assert_eq!(doubled.get(), 2);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn eager_computes_at_creation() {
        let rt = Runtime::new();
        let runs = Rc::new(Cell::new(0));
        let r = runs.clone();
        let d = rt.derived_with_options(
            move || {
                r.set(r.get() + 1);
                7
            },
            DerivedOptions::default().eager(),
        );
        assert_eq!(runs.get(), 1);
        assert_eq!(d.get(), 7);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn unowned_derived_stays_out_of_the_graph() {
        let rt = Runtime::new();
        let count = rt.source(1);
        let c = count.clone();
        let doubled = rt.derived(move || c.get() * 2);

        assert_eq!(doubled.get(), 2);
        assert!(doubled.is_unowned());
        assert!(doubled.is_disconnected());
        assert_eq!(count.reaction_count(), 0);
        assert_eq!(doubled.state(), DirtyState::MaybeDirty);

        count.set(4);
        assert_eq!(doubled.get(), 8);
    }

    #[test]
    fn reading_inside_an_effect_connects_it() {
        let rt = Runtime::new();
        let count = rt.source(1);
        let c = count.clone();
        let doubled = rt.derived(move || c.get() * 2);
        assert_eq!(doubled.get(), 2);

        let d = doubled.clone();
        let fx = rt.effect(move || {
            d.get();
        });
        assert!(!doubled.is_disconnected());
        assert_eq!(count.reaction_count(), 1);
        assert_eq!(doubled.reaction_count(), 1);

        fx.dispose();
        assert!(doubled.is_disconnected());
        assert_eq!(count.reaction_count(), 0);
    }

    #[test]
    fn equal_recompute_does_not_bump_version() {
        let rt = Runtime::new();
        let count = rt.source(2);
        let c = count.clone();
        let parity = rt.derived(move || c.get() % 2);

        assert_eq!(parity.get(), 0);
        let v = parity.write_version();

        count.set(4);
        assert_eq!(parity.get(), 0);
        assert_eq!(parity.write_version(), v);

        count.set(5);
        assert_eq!(parity.get(), 1);
        assert!(parity.write_version() > v);
    }

    #[test]
    fn self_read_is_a_circular_dependency() {
        let rt = Runtime::new();
        let slot: Rc<RefCell<Option<Derived<i32>>>> = Rc::new(RefCell::new(None));
        let s = slot.clone();
        let d = rt.derived(move || match s.borrow().as_ref() {
            Some(me) => me.get() + 1,
            None => 0,
        });
        *slot.borrow_mut() = Some(d.clone());

        let err = d.try_get().unwrap_err();
        assert!(matches!(err, ReactiveError::CircularDependency { node } if node == d.id()));
        assert!(!d.inner().flags().is_running());
        slot.borrow_mut().take();
    }

    #[test]
    fn destroyed_derived_cannot_be_read() {
        let rt = Runtime::new();
        let d = rt.derived(|| 1);
        assert_eq!(d.get(), 1);
        d.destroy();
        assert!(d.is_destroyed());
        assert!(matches!(d.try_get(), Err(ReactiveError::Destroyed { .. })));
    }

    #[test]
    fn nested_derived_is_owned_by_its_parent() {
        let rt = Runtime::new();
        let count = rt.source(1);
        let captured: Rc<RefCell<Vec<Derived<i32>>>> = Rc::new(RefCell::new(Vec::new()));

        let (rt2, c, cap) = (rt.clone(), count.clone(), captured.clone());
        let outer = rt.derived(move || {
            let c2 = c.clone();
            let inner = rt2.derived(move || c2.get() + 1);
            let value = inner.get();
            cap.borrow_mut().push(inner);
            value * 10
        });

        assert_eq!(outer.get(), 20);
        count.set(2);
        assert_eq!(outer.get(), 30);

        let list = captured.borrow();
        assert_eq!(list.len(), 2);
        assert!(list[0].is_destroyed());
        assert!(!list[1].is_destroyed());
    }

    #[test]
    fn adaptive_cache_serves_stale_inside_window() {
        let rt = Runtime::with_options(
            RuntimeOptions::default().with_min_cache_window(Duration::from_secs(60)),
        );
        let count = rt.source(1);
        let c = count.clone();
        let d = rt.derived_with_options(move || c.get(), DerivedOptions::default().adaptive_cache());

        assert_eq!(d.get(), 1);
        count.set(2);
        assert_eq!(d.get(), 1, "stale inside the window");
        assert_ne!(d.state(), DirtyState::Clean);
    }

    #[test]
    fn adaptive_cache_recomputes_after_window() {
        let rt = Runtime::with_options(
            RuntimeOptions::default()
                .with_min_cache_window(Duration::ZERO)
                .with_cache_window_factor(0),
        );
        let count = rt.source(1);
        let c = count.clone();
        let d = rt.derived_with_options(move || c.get(), DerivedOptions::default().adaptive_cache());

        assert_eq!(d.get(), 1);
        count.set(2);
        assert_eq!(d.get(), 2);
    }

    #[test]
    fn adaptive_cache_keeps_propagating_after_stale_serve() {
        let rt = Runtime::with_options(
            RuntimeOptions::default()
                .with_min_cache_window(Duration::from_millis(30))
                .with_cache_window_factor(2),
        );
        let count = rt.source(1);
        let c = count.clone();
        let d = rt.derived_with_options(move || c.get(), DerivedOptions::default().adaptive_cache());
        let seen = Rc::new(Cell::new(0));
        let (d2, out) = (d.clone(), seen.clone());
        let _fx = rt.effect(move || out.set(d2.get()));
        assert_eq!(seen.get(), 1);

        count.set(2);
        rt.flush_sync().unwrap();
        assert_eq!(seen.get(), 1, "stale inside the window");
        assert_eq!(d.state(), DirtyState::Clean);

        std::thread::sleep(Duration::from_millis(80));
        count.set(3);
        rt.flush_sync().unwrap();
        assert_eq!(seen.get(), 3);

        std::thread::sleep(Duration::from_millis(80));
        count.set(4);
        rt.flush_sync().unwrap();
        assert_eq!(seen.get(), 4);
    }

    #[test]
    fn adaptive_cache_direct_read_refreshes_once_window_closes() {
        let rt = Runtime::with_options(
            RuntimeOptions::default()
                .with_min_cache_window(Duration::from_millis(30))
                .with_cache_window_factor(2),
        );
        let count = rt.source(1);
        let c = count.clone();
        let d = rt.derived_with_options(move || c.get(), DerivedOptions::default().adaptive_cache());
        let d2 = d.clone();
        let _fx = rt.effect(move || {
            d2.get();
        });

        count.set(2);
        rt.flush_sync().unwrap();
        assert_eq!(d.get(), 1);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(d.get(), 2);
    }

    #[test]
    fn custom_equality_suppresses_propagation() {
        let rt = Runtime::new();
        let runs = Rc::new(Cell::new(0));
        let count = rt.source(1.0_f64);

        fn close(a: &f64, b: &f64) -> bool {
            (a - b).abs() < 0.5
        }
        let c = count.clone();
        let rounded = rt.derived_with_options(move || c.get(), DerivedOptions::default().equals(close));
        let (d, r) = (rounded.clone(), runs.clone());
        let _fx = rt.effect(move || {
            d.get();
            r.set(r.get() + 1);
        });

        count.set(1.2);
        rt.flush_sync().unwrap();
        assert_eq!(runs.get(), 1);

        count.set(3.0);
        rt.flush_sync().unwrap();
        assert_eq!(runs.get(), 2);
    }
}
