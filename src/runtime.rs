// ============================================================================
// spark-reactor - Runtime
// The handle that owns one reactive graph and exposes its whole API
// ============================================================================

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use futures_util::FutureExt;

use crate::core::context::ReactiveContext;
use crate::core::error::ReactiveError;
use crate::core::flags::EffectKind;
use crate::core::options::{DerivedOptions, RuntimeOptions};
use crate::core::types::{EqualsFn, default_equals};
use crate::primitives::async_derived::{AsyncDerived, AsyncFn};
use crate::primitives::derived::Derived;
use crate::primitives::effect::{CleanupFn, Effect, EffectBody, create_effect};
use crate::primitives::signal::Source;
use crate::reactivity::{batching, scheduling};

/// An independent reactive graph.
///
/// Cheap to clone; every clone refers to the same graph. Handles created
/// through a runtime keep a clone of it, so they can be read and written
/// without passing the runtime around.
///
/// # Example
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use spark_reactor::Runtime;
///
/// let rt = Runtime::new();
/// let count = rt.source(1);
/// let seen = Rc::new(Cell::new(0));
///
/// let (c, s) = (count.clone(), seen.clone());
/// let _fx = rt.effect(move || s.set(c.get()));
/// assert_eq!(seen.get(), 1);
///
/// count.set(2);
/// assert_eq!(seen.get(), 1);
/// rt.tick().unwrap();
/// assert_eq!(seen.get(), 2);
/// ```
#[derive(Clone, Default)]
pub struct Runtime {
    ctx: Rc<ReactiveContext>,
}

/// Non-owning runtime handle, held by spawned tasks.
#[derive(Clone)]
pub(crate) struct WeakRuntime(Weak<ReactiveContext>);

impl WeakRuntime {
    pub(crate) fn upgrade(&self) -> Option<Runtime> {
        self.0.upgrade().map(|ctx| Runtime { ctx })
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: RuntimeOptions) -> Self {
        Self {
            ctx: Rc::new(ReactiveContext::new(options)),
        }
    }

    pub(crate) fn ctx(&self) -> &ReactiveContext {
        &self.ctx
    }

    pub(crate) fn downgrade(&self) -> WeakRuntime {
        WeakRuntime(Rc::downgrade(&self.ctx))
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.ctx.options
    }

    // =========================================================================
    // SOURCES
    // =========================================================================

    /// Create a writable source compared with `PartialEq`.
    pub fn source<T: PartialEq + 'static>(&self, value: T) -> Source<T> {
        Source::new(self, value, default_equals)
    }

    /// Create a source with a custom equality predicate.
    pub fn source_with_equals<T: 'static>(&self, value: T, equals: EqualsFn<T>) -> Source<T> {
        Source::new(self, value, equals)
    }

    // =========================================================================
    // DERIVEDS
    // =========================================================================

    /// Create a lazy derived.
    pub fn derived<T, F>(&self, f: F) -> Derived<T>
    where
        T: PartialEq + 'static,
        F: Fn() -> T + 'static,
    {
        Derived::new(self, Rc::new(f), default_equals, false, false)
    }

    pub fn derived_with_equals<T, F>(&self, f: F, equals: EqualsFn<T>) -> Derived<T>
    where
        T: 'static,
        F: Fn() -> T + 'static,
    {
        Derived::new(self, Rc::new(f), equals, false, false)
    }

    pub fn derived_with_options<T, F>(&self, f: F, options: DerivedOptions<T>) -> Derived<T>
    where
        T: PartialEq + 'static,
        F: Fn() -> T + 'static,
    {
        Derived::with_options(self, Rc::new(f), options)
    }

    /// Create a derived computed by a future.
    ///
    /// Reads made by `f` itself (before it returns the future) are the
    /// dependencies. An `Err` from the future is stored as
    /// `ReactiveError::AsyncRejected`.
    pub fn async_derived<T, E, Fut, F>(&self, f: F) -> AsyncDerived<T>
    where
        T: Clone + PartialEq + 'static,
        E: Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
        F: Fn() -> Fut + 'static,
    {
        let func: AsyncFn<T> =
            Rc::new(move || f().map(|result| result.map_err(ReactiveError::rejected)).boxed_local());
        AsyncDerived::new(self, func, default_equals)
    }

    // =========================================================================
    // EFFECTS
    // =========================================================================

    /// Create an effect. It runs once now, then again after any dependency
    /// changes, once per flush.
    pub fn effect(&self, mut f: impl FnMut() + 'static) -> Effect {
        create_effect(
            self,
            EffectKind::Effect,
            EffectBody::Repeat(Box::new(move || {
                f();
                None
            })),
        )
    }

    /// Create an effect whose body may return a cleanup, run before the next
    /// run and on disposal.
    pub fn effect_with_cleanup(&self, f: impl FnMut() -> Option<CleanupFn> + 'static) -> Effect {
        create_effect(self, EffectKind::Effect, EffectBody::Repeat(Box::new(f)))
    }

    /// Create a render effect: rerun inline while the flush walks the tree,
    /// before the plain effects of the same tree.
    pub fn render_effect(&self, mut f: impl FnMut() + 'static) -> Effect {
        create_effect(
            self,
            EffectKind::Render,
            EffectBody::Repeat(Box::new(move || {
                f();
                None
            })),
        )
    }

    /// Create an effect whose body builds a future. Reads made while building
    /// it are tracked; the future itself runs on the task pool.
    pub fn effect_async<Fut, F>(&self, mut f: F) -> Effect
    where
        Fut: Future<Output = ()> + 'static,
        F: FnMut() -> Fut + 'static,
    {
        create_effect(
            self,
            EffectKind::Effect,
            EffectBody::Async(Box::new(move || f().boxed_local())),
        )
    }

    /// Create a detached root scope. `f` runs once, untracked; everything it
    /// creates is disposed with the root.
    pub fn effect_root(&self, f: impl FnOnce() + 'static) -> Effect {
        create_effect(self, EffectKind::Root, EffectBody::Once(Some(Box::new(f))))
    }

    /// Create a branch under the active effect. `f` runs once, untracked.
    pub fn branch(&self, f: impl FnOnce() + 'static) -> Effect {
        create_effect(self, EffectKind::Branch, EffectBody::Once(Some(Box::new(f))))
    }

    // =========================================================================
    // CONTROL
    // =========================================================================

    /// Run `f` with flushing suspended; every effect it dirties runs once
    /// afterwards. Panics with the `ReactiveError` if draining hits a fatal
    /// error.
    pub fn batch<T>(&self, f: impl FnOnce() -> T) -> T {
        match batching::try_batch(self, f) {
            Ok(value) => value,
            Err(err) => err.raise(),
        }
    }

    pub fn try_batch<T>(&self, f: impl FnOnce() -> T) -> Result<T, ReactiveError> {
        batching::try_batch(self, f)
    }

    /// Run `f` without recording dependencies.
    pub fn untrack<T>(&self, f: impl FnOnce() -> T) -> T {
        batching::untrack(self, f)
    }

    /// Run every pending flush pass now. A no-op inside a flush.
    pub fn flush_sync(&self) -> Result<(), ReactiveError> {
        scheduling::flush_sync(self)
    }

    /// Drain the microtask queue and poll spawned tasks until idle.
    pub fn tick(&self) -> Result<(), ReactiveError> {
        scheduling::tick(self)
    }

    /// Queue `f` to run on the next `tick`.
    pub fn queue_microtask(&self, f: impl FnOnce() + 'static) {
        self.ctx.push_microtask(Box::new(move |_| {
            f();
            Ok(())
        }));
    }

    /// Spawn a future on this runtime's local task pool, polled by `tick`.
    pub fn spawn_local(&self, fut: impl Future<Output = ()> + 'static) {
        self.ctx.spawn(fut.boxed_local());
    }

    /// Inside a running reaction, with tracking on.
    pub fn is_tracking(&self) -> bool {
        self.ctx.is_tracking()
    }

    pub fn is_batching(&self) -> bool {
        self.ctx.is_batching()
    }

    /// Current global write version.
    pub fn write_version(&self) -> u64 {
        self.ctx.write_version()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("options", &self.ctx.options)
            .field("write_version", &self.ctx.write_version())
            .field("batch_depth", &self.ctx.batch_depth.get())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
