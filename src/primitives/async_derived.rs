// ============================================================================
// spark-reactor - Async Derived
// A derived whose value arrives later, from a future
// ============================================================================
//
// The factory runs tracked, like any derived, and returns a future. That
// future is shared, spawned on the runtime's task pool and polled once right
// away, so a future that is already ready settles before `get` returns.
//
// Settling stores the value (or the error) and, if the observable result
// changed, bumps the write version and pushes DIRTY downstream. A newer
// computation supersedes an older one still in flight: stale results are
// dropped by generation.
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use futures_util::FutureExt;
use futures_util::future::{self, LocalBoxFuture, Shared};
use tracing::{debug, error, trace};

use crate::core::error::ReactiveError;
use crate::core::flags::{DirtyState, NodeFlags, NodeKind, RunningGuard};
use crate::core::types::{
    AnyDerived, AnyReaction, AnySource, EqualsFn, Node, NodeId, ReactionCore, SourceCore,
};
use crate::primitives::derived::{destroy_children, register_owner, should_subscribe};
use crate::reactivity::tracking::{check_dirtiness, mark_reactions, run_tracked, track_read, unsubscribe};
use crate::runtime::Runtime;

pub(crate) type AsyncFn<T> = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<T, ReactiveError>>>;

type Pending<T> = Shared<LocalBoxFuture<'static, Result<T, ReactiveError>>>;

// =============================================================================
// ASYNC DERIVED INNER
// =============================================================================

pub struct AsyncDerivedInner<T: Clone + 'static> {
    id: NodeId,
    flags: NodeFlags,
    source: SourceCore,
    reaction: ReactionCore,

    func: RefCell<Option<AsyncFn<T>>>,
    value: RefCell<Option<T>>,

    /// Set by a rejection, cleared by the next successful settle
    error: RefCell<Option<ReactiveError>>,

    /// The computation in flight, if any
    pending: RefCell<Option<Pending<T>>>,

    /// Bumped by every start; a settle from an older start is ignored
    generation: Cell<u64>,

    /// Settling during the first poll inside `start`
    settling_inline: Cell<bool>,

    equals: EqualsFn<T>,
    children: RefCell<Vec<Rc<dyn AnyDerived>>>,
    self_weak: Weak<AsyncDerivedInner<T>>,
}

impl<T: Clone + 'static> AsyncDerivedInner<T> {
    fn new(func: AsyncFn<T>, equals: EqualsFn<T>) -> Rc<Self> {
        Rc::new_cyclic(|self_weak| Self {
            id: NodeId::next(),
            flags: NodeFlags::new(DirtyState::Dirty),
            source: SourceCore::default(),
            reaction: ReactionCore::default(),
            func: RefCell::new(Some(func)),
            value: RefCell::new(None),
            error: RefCell::new(None),
            pending: RefCell::new(None),
            generation: Cell::new(0),
            settling_inline: Cell::new(false),
            equals,
            children: RefCell::new(Vec::new()),
            self_weak: self_weak.clone(),
        })
    }

    /// Run the factory tracked and launch the future it returns.
    fn start(&self, rt: &Runtime) -> Result<Pending<T>, ReactiveError> {
        let flags = &self.flags;
        if flags.is_destroyed() {
            return Err(ReactiveError::Destroyed { node: self.id });
        }
        if flags.is_running() {
            return Err(ReactiveError::CircularDependency { node: self.id });
        }
        let Some(func) = self.func.borrow().clone() else {
            return Err(ReactiveError::Destroyed { node: self.id });
        };
        let Some(me) = self.self_weak.upgrade() else {
            return Err(ReactiveError::Destroyed { node: self.id });
        };

        destroy_children(&self.children);
        let subscribe = should_subscribe(rt, self);

        let outcome = {
            let _running = RunningGuard::enter(flags);
            let reaction: Rc<dyn AnyReaction> = me;
            run_tracked(rt, reaction, subscribe, || {
                panic::catch_unwind(AssertUnwindSafe(|| func()))
            })
            .value
        };
        let fut = match outcome {
            Ok(fut) => fut,
            Err(payload) => match payload.downcast::<ReactiveError>() {
                Ok(err) => return Err(*err),
                Err(payload) => panic::resume_unwind(payload),
            },
        };

        let ctx = rt.ctx();
        self.reaction.set_observed_version(ctx.write_version());
        flags.set_disconnected(!subscribe);
        flags.set_state(if subscribe {
            DirtyState::Clean
        } else {
            DirtyState::MaybeDirty
        });

        let generation = self.generation.get() + 1;
        self.generation.set(generation);

        let weak = self.self_weak.clone();
        let weak_rt = rt.downgrade();
        let pending: Pending<T> = async move {
            let result = fut.await;
            if let (Some(inner), Some(rt)) = (weak.upgrade(), weak_rt.upgrade()) {
                inner.settle(&rt, generation, result.clone());
            }
            result
        }
        .boxed_local()
        .shared();

        *self.pending.borrow_mut() = Some(pending.clone());
        ctx.spawn(pending.clone().map(|_| ()).boxed_local());
        trace!(derived = %self.id, generation, "async derived started");

        // Reads made while polling belong to the future, not to whoever is
        // reading this derived.
        self.settling_inline.set(true);
        rt.untrack(|| pending.clone().now_or_never());
        self.settling_inline.set(false);

        Ok(pending)
    }

    fn settle(&self, rt: &Runtime, generation: u64, result: Result<T, ReactiveError>) {
        if generation != self.generation.get() || self.flags.is_destroyed() {
            trace!(derived = %self.id, generation, "stale async result dropped");
            return;
        }
        self.pending.borrow_mut().take();

        let changed = match result {
            Ok(value) => {
                let had_error = self.error.borrow_mut().take().is_some();
                self.flags.set_has_error(false);
                let differs = match self.value.borrow().as_ref() {
                    Some(old) => !(self.equals)(old, &value),
                    None => true,
                };
                if differs {
                    *self.value.borrow_mut() = Some(value);
                }
                differs || had_error
            }
            Err(err) => {
                debug!(derived = %self.id, error = %err, "async derived rejected");
                *self.error.borrow_mut() = Some(err);
                self.flags.set_has_error(true);
                true
            }
        };
        self.flags.set_initialized(true);

        if !changed {
            return;
        }
        let version = rt.ctx().increment_write_version();
        self.source.set_write_version(version);
        trace!(derived = %self.id, version, "async derived settled");

        // Inline settles happen inside a read that already sees the new
        // version; dependents were marked by the push that got us here.
        if self.settling_inline.get() {
            return;
        }
        if let Err(err) = mark_reactions(rt, self, DirtyState::Dirty) {
            error!(derived = %self.id, error = %err, "flush after async settle failed");
        }
    }

    fn current(&self) -> Result<T, ReactiveError> {
        if let Some(err) = self.error.borrow().as_ref() {
            return Err(err.clone());
        }
        self.value
            .borrow()
            .clone()
            .ok_or(ReactiveError::NotInitialized { node: self.id })
    }
}

impl<T: Clone + 'static> Node for AsyncDerivedInner<T> {
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
        self.self_weak.upgrade().map(|rc| rc as Rc<dyn AnyDerived>)
    }
}

impl<T: Clone + 'static> AnySource for AsyncDerivedInner<T> {
    fn source_core(&self) -> &SourceCore {
        &self.source
    }
}

impl<T: Clone + 'static> AnyReaction for AsyncDerivedInner<T> {
    fn reaction_core(&self) -> &ReactionCore {
        &self.reaction
    }

    fn self_reaction(&self) -> Option<Rc<dyn AnyReaction>> {
        self.self_weak.upgrade().map(|rc| rc as Rc<dyn AnyReaction>)
    }
}

impl<T: Clone + 'static> AnyDerived for AsyncDerivedInner<T> {
    fn recompute(&self, rt: &Runtime) -> Result<(), ReactiveError> {
        self.start(rt).map(|_| ())
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
        self.pending.borrow_mut().take();
        self.value.borrow_mut().take();
        self.error.borrow_mut().take();
        self.flags.set_state(DirtyState::Clean);
        trace!(derived = %self.id, "async derived destroyed");
    }

    fn self_source(&self) -> Option<Rc<dyn AnySource>> {
        self.self_weak.upgrade().map(|rc| rc as Rc<dyn AnySource>)
    }

    fn own_child(&self, child: Rc<dyn AnyDerived>) {
        self.children.borrow_mut().push(child);
    }
}

// =============================================================================
// ASYNC DERIVED<T>
// =============================================================================

/// A derived computed by a future.
///
/// # Example
///
/// ```
/// use std::convert::Infallible;
/// use spark_reactor::Runtime;
///
/// let rt = Runtime::new();
/// let id = rt.source(7);
/// let i = id.clone();
/// let name = rt.async_derived(move || {
///     let id = i.get();
///     async move { Ok::<_, Infallible>(format!("user-{id}")) }
/// });
///
/// assert_eq!(name.get().unwrap(), "user-7");
/// ```
pub struct AsyncDerived<T: Clone + 'static> {
    inner: Rc<AsyncDerivedInner<T>>,
    rt: Runtime,
}

impl<T: Clone + 'static> Clone for AsyncDerived<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            rt: self.rt.clone(),
        }
    }
}

impl<T: Clone + 'static> AsyncDerived<T> {
    pub(crate) fn new(rt: &Runtime, func: AsyncFn<T>, equals: EqualsFn<T>) -> Self {
        let inner = AsyncDerivedInner::new(func, equals);
        let unowned = register_owner(rt, inner.clone());
        inner.flags.set_unowned(unowned);
        Self {
            inner,
            rt: rt.clone(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// The latest settled value, tracking the read.
    ///
    /// Starts a computation if a dependency changed. Fails with
    /// `NotInitialized` until the first result arrives and with the stored
    /// rejection until a later computation succeeds.
    pub fn get(&self) -> Result<T, ReactiveError> {
        self.refresh()?;
        track_read(&self.rt, self.inner.clone());
        self.inner.current()
    }

    /// Wait for the computation in flight, starting one if the value is stale.
    pub fn resolve(&self) -> LocalBoxFuture<'static, Result<T, ReactiveError>> {
        if let Err(err) = self.refresh() {
            return future::ready(Err(err)).boxed_local();
        }
        let pending = self.inner.pending.borrow().clone();
        match pending {
            Some(pending) => pending.boxed_local(),
            None => future::ready(self.inner.current()).boxed_local(),
        }
    }

    /// A computation is in flight.
    pub fn is_pending(&self) -> bool {
        self.inner.pending.borrow().is_some()
    }

    pub fn has_error(&self) -> bool {
        self.inner.flags.has_error()
    }

    pub fn destroy(&self) {
        self.inner.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.flags.is_destroyed()
    }

    pub fn write_version(&self) -> u64 {
        self.inner.write_version()
    }

    pub fn reaction_count(&self) -> usize {
        self.inner.reaction_count()
    }

    fn refresh(&self) -> Result<(), ReactiveError> {
        let inner = &self.inner;
        if inner.flags.is_destroyed() {
            return Err(ReactiveError::Destroyed { node: inner.id });
        }
        if inner.flags.is_running() {
            return Err(ReactiveError::CircularDependency { node: inner.id });
        }
        if check_dirtiness(&self.rt, &**inner)? {
            let _pending = inner.start(&self.rt)?;
        }
        Ok(())
    }
}

impl<T: Clone + 'static> fmt::Debug for AsyncDerived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncDerived")
            .field("id", &self.inner.id)
            .field("pending", &self.is_pending())
            .field("has_error", &self.has_error())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("lookup failed")]
    struct LookupFailed;

    #[test]
    fn ready_future_settles_on_first_read() {
        let rt = Runtime::new();
        let a = rt.source(2);
        let a2 = a.clone();
        let d = rt.async_derived(move || {
            let v = a2.get();
            async move { Ok::<_, Infallible>(v * 10) }
        });

        assert_eq!(d.get().unwrap(), 20);
        assert!(!d.is_pending());

        a.set(3);
        assert_eq!(d.get().unwrap(), 30);
    }

    #[test]
    fn rejection_sticks_until_success() {
        let rt = Runtime::new();
        let ok = rt.source(false);
        let o = ok.clone();
        let d = rt.async_derived(move || {
            let ok = o.get();
            async move { if ok { Ok(1) } else { Err(LookupFailed) } }
        });

        assert!(matches!(d.get(), Err(ReactiveError::AsyncRejected(_))));
        assert!(matches!(d.get(), Err(ReactiveError::AsyncRejected(_))));
        assert!(d.has_error());

        ok.set(true);
        assert_eq!(d.get().unwrap(), 1);
        assert!(!d.has_error());
    }

    #[test]
    fn destroyed_async_derived_is_unreadable() {
        let rt = Runtime::new();
        let d = rt.async_derived(|| async { Ok::<_, Infallible>(1) });
        d.destroy();
        assert!(matches!(d.get(), Err(ReactiveError::Destroyed { .. })));
    }
}
