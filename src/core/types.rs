// ============================================================================
// spark-reactor - Type Definitions
// Node identity, type-erased graph traits and the bookkeeping they share
// ============================================================================

use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use super::error::ReactiveError;
use super::flags::{DirtyState, NodeFlags, NodeKind};
use crate::primitives::effect::EffectInner;
use crate::runtime::Runtime;

// =============================================================================
// NODE IDENTITY
// =============================================================================

/// Process-unique identity of a node, used for logging and identity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Allocate the next id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        NodeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// TYPE-ERASED TRAITS
// =============================================================================
//
// Graph operations (mark dirty, compare versions, track deps) never need the
// value type T. Only reading and writing values does. So the graph stores
// Rc<dyn AnySource> as dependencies and Weak<dyn AnyReaction> as reactions,
// and the typed handles (Source<T>, Derived<T>) sit on top.
//
// A derived is both a source and a reaction; AnyDerived ties the two views
// together so propagation can walk through it in either direction.
// =============================================================================

/// Shared identity of every node in the graph.
pub trait Node: Any {
    fn id(&self) -> NodeId;

    fn kind(&self) -> NodeKind;

    fn flags(&self) -> &NodeFlags;

    /// Upcast to Any for downcasting
    fn as_any(&self) -> &dyn Any;

    /// The derived view of this node, if it is one.
    fn as_derived(&self) -> Option<Rc<dyn AnyDerived>> {
        None
    }

    fn is_derived(&self) -> bool {
        self.kind() == NodeKind::Derived
    }
}

/// Something reactions can depend on: sources and deriveds.
pub trait AnySource: Node {
    fn source_core(&self) -> &SourceCore;

    /// Global write version stamped the last time this value changed.
    fn write_version(&self) -> u64 {
        self.source_core().write_version()
    }

    /// Number of live reactions subscribed to this source.
    fn reaction_count(&self) -> usize {
        self.source_core().reaction_count()
    }
}

/// Something that depends on sources: deriveds and effects.
pub trait AnyReaction: Node {
    fn reaction_core(&self) -> &ReactionCore;

    /// A strong, type-erased handle to this same reaction.
    ///
    /// Returns None once the last strong reference is gone.
    fn self_reaction(&self) -> Option<Rc<dyn AnyReaction>>;

    /// The effect view of this node, if it is one.
    fn as_effect(&self) -> Option<Rc<EffectInner>> {
        None
    }

    fn dep_count(&self) -> usize {
        self.reaction_core().dep_count()
    }
}

/// Both views of a derived, plus the operations the graph drives on it.
pub trait AnyDerived: AnySource + AnyReaction {
    /// Bring the cached value up to date. Bumps the write version only if the
    /// value actually changed.
    fn recompute(&self, rt: &Runtime) -> Result<(), ReactiveError>;

    /// Detach from the graph and drop nested deriveds.
    fn destroy(&self);

    /// A strong, type-erased source handle to this same derived.
    fn self_source(&self) -> Option<Rc<dyn AnySource>>;

    /// Take ownership of a derived created while this one was computing.
    /// Owned children are destroyed before every recompute.
    fn own_child(&self, child: Rc<dyn AnyDerived>);
}

// =============================================================================
// SHARED BOOKKEEPING
// =============================================================================

/// Dependency list of a reaction. Most reactions read only a handful of nodes.
pub type DepList = SmallVec<[Rc<dyn AnySource>; 4]>;

/// Producer-side state shared by sources and deriveds.
#[derive(Default)]
pub struct SourceCore {
    /// Global write version at the last value change
    write_version: Cell<u64>,

    /// Read version of the last tracking frame that read this node
    read_version: Cell<u64>,

    /// Reactions that depend on this source (weak refs to avoid cycles)
    reactions: RefCell<Vec<Weak<dyn AnyReaction>>>,
}

impl SourceCore {
    pub fn new(write_version: u64) -> Self {
        let core = Self::default();
        core.write_version.set(write_version);
        core
    }

    #[inline]
    pub fn write_version(&self) -> u64 {
        self.write_version.get()
    }

    #[inline]
    pub fn set_write_version(&self, version: u64) {
        self.write_version.set(version);
    }

    #[inline]
    pub fn read_version(&self) -> u64 {
        self.read_version.get()
    }

    #[inline]
    pub fn set_read_version(&self, version: u64) {
        self.read_version.set(version);
    }

    pub fn add_reaction(&self, reaction: Weak<dyn AnyReaction>) {
        self.reactions.borrow_mut().push(reaction);
    }

    pub fn has_reaction(&self, id: NodeId) -> bool {
        self.reactions
            .borrow()
            .iter()
            .any(|weak| weak.upgrade().is_some_and(|r| r.id() == id))
    }

    /// Remove the reaction with the given id. Dead entries are pruned on the way.
    pub fn remove_reaction(&self, id: NodeId) -> bool {
        let mut removed = false;
        self.reactions.borrow_mut().retain(|weak| match weak.upgrade() {
            Some(reaction) if !removed && reaction.id() == id => {
                removed = true;
                false
            }
            Some(_) => true,
            None => false,
        });
        removed
    }

    pub fn reaction_count(&self) -> usize {
        self.reactions
            .borrow()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Snapshot of the live reactions. Callers iterate the snapshot so the
    /// list can be mutated while they walk it.
    pub fn reactions(&self) -> Vec<Rc<dyn AnyReaction>> {
        self.reactions
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

/// Consumer-side state shared by deriveds and effects.
#[derive(Default)]
pub struct ReactionCore {
    /// Sources read during the last run, in first-read order
    deps: RefCell<DepList>,

    /// Global write version when this reaction last ran or was verified clean
    observed_version: Cell<u64>,
}

impl ReactionCore {
    #[inline]
    pub fn observed_version(&self) -> u64 {
        self.observed_version.get()
    }

    #[inline]
    pub fn set_observed_version(&self, version: u64) {
        self.observed_version.set(version);
    }

    pub fn dep_count(&self) -> usize {
        self.deps.borrow().len()
    }

    /// Snapshot of the dependency list.
    pub fn deps(&self) -> DepList {
        self.deps.borrow().clone()
    }

    pub fn has_dep(&self, id: NodeId) -> bool {
        self.deps.borrow().iter().any(|dep| dep.id() == id)
    }

    pub(crate) fn deps_ref(&self) -> Ref<'_, DepList> {
        self.deps.borrow()
    }

    pub(crate) fn deps_mut(&self) -> RefMut<'_, DepList> {
        self.deps.borrow_mut()
    }
}

// =============================================================================
// SOURCE INNER (the data behind Source<T>)
// =============================================================================

/// Equality function type for comparing values
pub type EqualsFn<T> = fn(&T, &T) -> bool;

/// Default equality using PartialEq
pub fn default_equals<T: PartialEq>(a: &T, b: &T) -> bool {
    a == b
}

/// The internal data for a writable source.
///
/// Separate from `Source<T>` so it can be stored as `Rc<dyn AnySource>`.
pub struct SourceInner<T> {
    id: NodeId,
    flags: NodeFlags,
    core: SourceCore,

    /// The current value
    value: RefCell<T>,

    /// Equality function for comparing values
    equals: EqualsFn<T>,
}

impl<T> SourceInner<T> {
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::new_with_equals(value, default_equals)
    }

    pub fn new_with_equals(value: T, equals: EqualsFn<T>) -> Self {
        Self {
            id: NodeId::next(),
            flags: NodeFlags::new(DirtyState::Clean),
            core: SourceCore::default(),
            value: RefCell::new(value),
            equals,
        }
    }

    /// Get the current value (cloning)
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.value.borrow().clone()
    }

    /// Get the current value with a closure (avoids clone)
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.borrow())
    }

    /// Store `value` unless it equals the current one. Returns true if stored.
    ///
    /// Versions are stamped by the runtime, not here.
    pub fn replace(&self, value: T) -> bool {
        let changed = {
            let current = self.value.borrow();
            !(self.equals)(&current, &value)
        };

        if changed {
            *self.value.borrow_mut() = value;
        }
        changed
    }

    pub fn equals_fn(&self) -> EqualsFn<T> {
        self.equals
    }
}

impl<T: 'static> Node for SourceInner<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Source
    }

    fn flags(&self) -> &NodeFlags {
        &self.flags
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T: 'static> AnySource for SourceInner<T> {
    fn source_core(&self) -> &SourceCore {
        &self.core
    }
}

// =============================================================================
// TESTS
// =============================================================================
