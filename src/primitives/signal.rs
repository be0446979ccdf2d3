// ============================================================================
// spark-reactor - Source Primitive
// The writable leaf of the reactive graph
// ============================================================================

use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::core::error::ReactiveError;
use crate::core::flags::DirtyState;
use crate::core::types::{AnySource, EqualsFn, Node, NodeId, SourceInner};
use crate::reactivity::tracking::{check_write, mark_reactions, record_write, track_read};
use crate::runtime::Runtime;

// =============================================================================
// SOURCE<T> - The public source handle
// =============================================================================

/// A writable reactive value.
///
/// Reading a source inside a derived or effect makes it a dependency.
/// Writing a value that differs (per the source's equality function) bumps
/// its write version and invalidates everything downstream.
///
/// # Example
///
/// ```
/// use spark_reactor::Runtime;
///
/// let rt = Runtime::new();
/// let count = rt.source(0);
/// assert_eq!(count.get(), 0);
///
/// assert!(count.set(5));
/// assert!(!count.set(5));
/// assert_eq!(count.get(), 5);
/// ```
pub struct Source<T> {
    inner: Rc<SourceInner<T>>,
    rt: Runtime,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            rt: self.rt.clone(),
        }
    }
}

impl<T: 'static> Source<T> {
    pub(crate) fn new(rt: &Runtime, value: T, equals: EqualsFn<T>) -> Self {
        Self {
            inner: Rc::new(SourceInner::new_with_equals(value, equals)),
            rt: rt.clone(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id()
    }

    /// Get the current value (cloning), tracking the read.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.track();
        self.inner.get()
    }

    /// Borrow the current value, tracking the read.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track();
        self.inner.with(f)
    }

    /// Get the current value without tracking.
    pub fn peek(&self) -> T
    where
        T: Clone,
    {
        self.inner.get()
    }

    /// Write a value. Returns whether it differed from the current one.
    ///
    /// Fails if called while a derived is computing, or if a synchronous
    /// flush triggered by the write hits a fatal error.
    pub fn try_set(&self, value: T) -> Result<bool, ReactiveError> {
        check_write(&self.rt, self.inner.id())?;

        if !self.inner.replace(value) {
            return Ok(false);
        }

        let ctx = self.rt.ctx();
        let version = ctx.increment_write_version();
        self.inner.source_core().set_write_version(version);
        trace!(source = %self.inner.id(), version, "source written");

        record_write(&self.rt, self.as_any_source());
        mark_reactions(&self.rt, &*self.inner, DirtyState::Dirty)?;
        Ok(true)
    }

    /// Write a value, panicking with the `ReactiveError` on failure.
    pub fn set(&self, value: T) -> bool {
        match self.try_set(value) {
            Ok(changed) => changed,
            Err(err) => err.raise(),
        }
    }

    /// Modify a copy of the value and write it back.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool
    where
        T: Clone,
    {
        let mut next = self.inner.get();
        f(&mut next);
        self.set(next)
    }

    pub fn write_version(&self) -> u64 {
        self.inner.write_version()
    }

    /// Number of reactions currently subscribed to this source.
    pub fn reaction_count(&self) -> usize {
        self.inner.reaction_count()
    }

    /// Get as a type-erased `Rc<dyn AnySource>`.
    pub fn as_any_source(&self) -> Rc<dyn AnySource> {
        self.inner.clone()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    fn track(&self) {
        track_read(&self.rt, self.as_any_source());
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.with(|value| {
            f.debug_struct("Source")
                .field("id", &self.inner.id())
                .field("value", value)
                .finish()
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
