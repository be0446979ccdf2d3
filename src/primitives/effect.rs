// ============================================================================
// spark-reactor - Effect System
// Side effects, the ownership tree they form, and their lifecycle
// ============================================================================
//
// Effects are reactions that run side effects when their dependencies change.
// Unlike deriveds, effects don't produce values - they just run code.
//
// Every effect created while another effect runs becomes its child, linked
// through parent/first/last/prev/next pointers. Rerunning or destroying an
// effect destroys its children and the deriveds it owns first.
//
// Strong links point down and forward (first_child, next_sibling); links
// pointing up and back are Weak, so a tree is freed from its top.
// ============================================================================

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use futures_util::future::LocalBoxFuture;
use tracing::trace;

use crate::core::context::{ActiveEffectGuard, FrameGuard};
use crate::core::error::ReactiveError;
use crate::core::flags::{DirtyState, EffectKind, NodeFlags, NodeKind, RunningGuard};
use crate::core::types::{AnyDerived, AnyReaction, Node, NodeId, ReactionCore};
use crate::reactivity::scheduling::schedule_effect;
use crate::reactivity::tracking::{run_tracked, unsubscribe};
use crate::runtime::Runtime;

// =============================================================================
// TYPE ALIASES
// =============================================================================

/// Cleanup function returned by effects, runs before next execution
pub type CleanupFn = Box<dyn FnOnce()>;

/// Effect function signature - returns optional cleanup
pub type EffectFn = Box<dyn FnMut() -> Option<CleanupFn>>;

/// Dispose function returned by `Effect::into_dispose_fn`
pub type DisposeFn = Box<dyn FnOnce()>;

/// What an effect runs.
pub(crate) enum EffectBody {
    /// Root and branch bodies: run once, untracked.
    Once(Option<Box<dyn FnOnce()>>),
    Repeat(EffectFn),
    /// Tracked while building the future; the future runs on the task pool.
    Async(Box<dyn FnMut() -> LocalBoxFuture<'static, ()>>),
}

// =============================================================================
// EFFECT INNER
// =============================================================================

/// The inner effect implementation.
///
/// Implements AnyReaction but not AnySource: nothing depends on an effect.
pub struct EffectInner {
    id: NodeId,
    kind: EffectKind,
    flags: NodeFlags,
    core: ReactionCore,

    /// Taken out while running so the body may touch its own effect
    body: RefCell<Option<EffectBody>>,

    /// Teardown/cleanup function from last run
    teardown: RefCell<Option<CleanupFn>>,

    /// Deriveds created while this effect ran; destroyed with the next run
    deriveds: RefCell<Vec<Rc<dyn AnyDerived>>>,

    // =========================================================================
    // Effect tree (parent/children/siblings)
    // =========================================================================
    parent: RefCell<Option<Weak<EffectInner>>>,
    first_child: RefCell<Option<Rc<EffectInner>>>,
    last_child: RefCell<Option<Weak<EffectInner>>>,
    prev_sibling: RefCell<Option<Weak<EffectInner>>>,
    next_sibling: RefCell<Option<Rc<EffectInner>>>,

    self_weak: Weak<EffectInner>,
}

impl EffectInner {
    pub(crate) fn new(kind: EffectKind, body: EffectBody) -> Rc<Self> {
        Rc::new_cyclic(|self_weak| Self {
            id: NodeId::next(),
            kind,
            flags: NodeFlags::new(DirtyState::Dirty),
            core: ReactionCore::default(),
            body: RefCell::new(Some(body)),
            teardown: RefCell::new(None),
            deriveds: RefCell::new(Vec::new()),
            parent: RefCell::new(None),
            first_child: RefCell::new(None),
            last_child: RefCell::new(None),
            prev_sibling: RefCell::new(None),
            next_sibling: RefCell::new(None),
            self_weak: self_weak.clone(),
        })
    }

    pub fn effect_kind(&self) -> EffectKind {
        self.kind
    }

    pub fn parent(&self) -> Option<Rc<EffectInner>> {
        self.parent.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub fn first_child(&self) -> Option<Rc<EffectInner>> {
        self.first_child.borrow().clone()
    }

    pub fn last_child(&self) -> Option<Rc<EffectInner>> {
        self.last_child.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub fn next_sibling(&self) -> Option<Rc<EffectInner>> {
        self.next_sibling.borrow().clone()
    }

    pub fn prev_sibling(&self) -> Option<Rc<EffectInner>> {
        self.prev_sibling.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Direct children in creation order.
    pub fn children(&self) -> Vec<Rc<EffectInner>> {
        let mut children = Vec::new();
        let mut child = self.first_child();
        while let Some(c) = child {
            child = c.next_sibling();
            children.push(c);
        }
        children
    }

    #[cfg(test)]
    pub fn owned_derived_count(&self) -> usize {
        self.deriveds.borrow().len()
    }

    /// Take ownership of a derived created during this effect's run.
    pub(crate) fn own_derived(&self, derived: Rc<dyn AnyDerived>) {
        self.deriveds.borrow_mut().push(derived);
    }
}

impl Drop for EffectInner {
    fn drop(&mut self) {
        if let Some(cleanup) = self.teardown.get_mut().take() {
            cleanup();
        }
    }
}

impl Node for EffectInner {
    fn id(&self) -> NodeId {
        self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Effect(self.kind)
    }

    fn flags(&self) -> &NodeFlags {
        &self.flags
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl AnyReaction for EffectInner {
    fn reaction_core(&self) -> &ReactionCore {
        &self.core
    }

    fn self_reaction(&self) -> Option<Rc<dyn AnyReaction>> {
        self.self_weak
            .upgrade()
            .map(|rc| rc as Rc<dyn AnyReaction>)
    }

    fn as_effect(&self) -> Option<Rc<EffectInner>> {
        self.self_weak.upgrade()
    }
}

// =============================================================================
// EFFECT WRAPPER
// =============================================================================

/// Handle to an effect.
///
/// Dropping the handle of a top-level effect (one with no parent) disposes
/// it. Handles of child effects do not own them: the parent does.
#[must_use = "a top-level effect is disposed as soon as its handle is dropped"]
pub struct Effect {
    inner: Rc<EffectInner>,
    rt: Runtime,
}

impl Effect {
    pub(crate) fn from_inner(rt: Runtime, inner: Rc<EffectInner>) -> Self {
        Self { inner, rt }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Rc<EffectInner> {
        &self.inner
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn kind(&self) -> EffectKind {
        self.inner.kind
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.flags.is_destroyed()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.flags.is_inert()
    }

    /// Number of nodes read during the last run
    pub fn dep_count(&self) -> usize {
        self.inner.core.dep_count()
    }

    pub fn child_count(&self) -> usize {
        self.inner.children().len()
    }

    /// Destroy this effect, its children and the deriveds it owns, running
    /// every pending teardown. Idempotent.
    pub fn dispose(&self) {
        destroy_effect(&self.inner, true);
    }

    /// Stop this effect and its subtree from running until `resume`.
    pub fn pause(&self) {
        pause_effect(&self.inner);
    }

    /// Undo `pause`, rescheduling anything invalidated meanwhile.
    pub fn resume(&self) -> Result<(), ReactiveError> {
        resume_effect(&self.rt, &self.inner)
    }

    /// Convert into a plain dispose callback.
    pub fn into_dispose_fn(self) -> DisposeFn {
        Box::new(move || self.dispose())
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        if self.inner.parent().is_none() {
            destroy_effect(&self.inner, false);
        }
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.inner.flags.state())
            .field("destroyed", &self.inner.flags.is_destroyed())
            .finish()
    }
}

// =============================================================================
// TREE LINKS
// =============================================================================

/// Append an effect to its parent's child list
pub(crate) fn push_effect(effect: &Rc<EffectInner>, parent: &Rc<EffectInner>) {
    *effect.parent.borrow_mut() = Some(Rc::downgrade(parent));

    match parent.last_child() {
        None => {
            *parent.first_child.borrow_mut() = Some(effect.clone());
        }
        Some(last) => {
            *last.next_sibling.borrow_mut() = Some(effect.clone());
            *effect.prev_sibling.borrow_mut() = Some(Rc::downgrade(&last));
        }
    }
    *parent.last_child.borrow_mut() = Some(Rc::downgrade(effect));
}

/// Remove an effect from its parent's child list
fn unlink_effect(effect: &Rc<EffectInner>) {
    let prev = effect.prev_sibling();
    let next = effect.next_sibling.borrow_mut().take();

    if let Some(prev) = &prev {
        *prev.next_sibling.borrow_mut() = next.clone();
    }
    if let Some(next) = &next {
        *next.prev_sibling.borrow_mut() = prev.as_ref().map(Rc::downgrade);
    }

    if let Some(parent) = effect.parent() {
        let is_first = parent
            .first_child
            .borrow()
            .as_ref()
            .is_some_and(|first| Rc::ptr_eq(first, effect));
        if is_first {
            *parent.first_child.borrow_mut() = next.clone();
        }

        let is_last = parent
            .last_child()
            .is_some_and(|last| Rc::ptr_eq(&last, effect));
        if is_last {
            *parent.last_child.borrow_mut() = prev.as_ref().map(Rc::downgrade);
        }
    }

    *effect.prev_sibling.borrow_mut() = None;
}

// =============================================================================
// TEARDOWN AND DESTRUCTION
// =============================================================================

pub(crate) fn execute_teardown(effect: &EffectInner) {
    let teardown = effect.teardown.borrow_mut().take();
    if let Some(cleanup) = teardown {
        cleanup();
    }
}

/// Destroy all children of an effect
pub(crate) fn destroy_effect_children(effect: &EffectInner) {
    let mut child = effect.first_child.borrow_mut().take();
    *effect.last_child.borrow_mut() = None;

    // Detach the whole chain before running any teardown, so a teardown that
    // touches the tree sees it already empty.
    let mut children = Vec::new();
    while let Some(c) = child {
        child = c.next_sibling.borrow_mut().take();
        *c.prev_sibling.borrow_mut() = None;
        children.push(c);
    }

    for child in children {
        destroy_effect(&child, false);
    }
}

/// Destroy the deriveds an effect owns
pub(crate) fn destroy_effect_deriveds(effect: &EffectInner) {
    let deriveds = std::mem::take(&mut *effect.deriveds.borrow_mut());
    for derived in deriveds {
        derived.destroy();
    }
}

/// Destroy an effect and everything it owns.
///
/// Order: children, owned deriveds, dependency edges, teardown, tree links.
pub(crate) fn destroy_effect(effect: &Rc<EffectInner>, remove_from_parent: bool) {
    if effect.flags.is_destroyed() {
        return;
    }
    effect.flags.set_destroyed(true);

    destroy_effect_children(effect);
    destroy_effect_deriveds(effect);

    unsubscribe(&**effect, 0, &[]);
    effect.core.deps_mut().clear();

    execute_teardown(effect);

    if remove_from_parent {
        unlink_effect(effect);
    }

    *effect.parent.borrow_mut() = None;
    *effect.body.borrow_mut() = None;
    *effect.teardown.borrow_mut() = None;
    *effect.next_sibling.borrow_mut() = None;
    *effect.prev_sibling.borrow_mut() = None;
    effect.flags.set_state(DirtyState::Clean);

    trace!(effect = %effect.id, kind = ?effect.kind, "effect destroyed");
}

// =============================================================================
// PAUSE / RESUME
// =============================================================================

pub(crate) fn pause_effect(effect: &Rc<EffectInner>) {
    let mut stack = vec![effect.clone()];
    while let Some(e) = stack.pop() {
        e.flags.set_inert(true);
        stack.extend(e.children());
    }
}

pub(crate) fn resume_effect(rt: &Runtime, effect: &Rc<EffectInner>) -> Result<(), ReactiveError> {
    let mut stack = vec![effect.clone()];
    let mut stale = Vec::new();
    while let Some(e) = stack.pop() {
        e.flags.set_inert(false);
        if !e.flags.is_clean() && !e.flags.is_destroyed() {
            stale.push(e.clone());
        }
        stack.extend(e.children());
    }

    for e in stale {
        if e.kind.is_structural() {
            // Let the walk descend into it again.
            e.flags.set_state(DirtyState::Clean);
            for child in e.children() {
                if !child.flags.is_clean() {
                    schedule_effect(rt, child)?;
                }
            }
        } else {
            schedule_effect(rt, e)?;
        }
    }
    Ok(())
}

// =============================================================================
// UPDATE EFFECT - Run an effect
// =============================================================================

/// Puts the body back after a run, unless the run destroyed the effect.
struct BodySlot<'a> {
    effect: &'a EffectInner,
    body: Option<EffectBody>,
}

impl<'a> BodySlot<'a> {
    fn take(effect: &'a EffectInner) -> Self {
        let body = effect.body.borrow_mut().take();
        Self { effect, body }
    }

    fn invoke(&mut self, rt: &Runtime) -> Option<CleanupFn> {
        match self.body.as_mut()? {
            EffectBody::Once(f) => {
                if let Some(f) = f.take() {
                    f();
                }
                None
            }
            EffectBody::Repeat(f) => f(),
            EffectBody::Async(f) => {
                rt.ctx().spawn(f());
                None
            }
        }
    }
}

impl Drop for BodySlot<'_> {
    fn drop(&mut self) {
        if !self.effect.flags.is_destroyed() {
            *self.effect.body.borrow_mut() = self.body.take();
        }
    }
}

/// Run an effect and track its dependencies.
///
/// 1. Destroys owned deriveds and child effects from the previous run
/// 2. Runs the previous teardown
/// 3. Executes the body, tracked (root and branch bodies run untracked)
/// 4. Stores the new teardown
///
/// If the body wrote a source it depends on, the effect is rescheduled.
pub(crate) fn update_effect(rt: &Runtime, effect: &Rc<EffectInner>) -> Result<(), ReactiveError> {
    let flags = &effect.flags;
    if flags.is_destroyed() {
        return Ok(());
    }
    if flags.is_running() {
        return Err(ReactiveError::CircularDependency { node: effect.id });
    }
    flags.set_state(DirtyState::Clean);

    let ctx = rt.ctx();
    let _active = ActiveEffectGuard::enter(ctx, Some(effect));
    let _running = RunningGuard::enter(flags);

    destroy_effect_deriveds(effect);
    destroy_effect_children(effect);
    execute_teardown(effect);

    let mut body = BodySlot::take(effect);
    let (teardown, self_invalidated) = if effect.kind.is_structural() {
        let _untracked = FrameGuard::enter(ctx, None);
        (body.invoke(rt), false)
    } else {
        let reaction: Rc<dyn AnyReaction> = effect.clone();
        let tracked = run_tracked(rt, reaction, true, || body.invoke(rt));
        (tracked.value, tracked.self_invalidated)
    };
    drop(body);

    effect.core.set_observed_version(ctx.write_version());

    if flags.is_destroyed() {
        if let Some(cleanup) = teardown {
            cleanup();
        }
        return Ok(());
    }
    *effect.teardown.borrow_mut() = teardown;

    trace!(
        effect = %effect.id,
        kind = ?effect.kind,
        deps = effect.core.dep_count(),
        "effect ran"
    );

    if self_invalidated {
        flags.raise(DirtyState::Dirty);
        schedule_effect(rt, effect.clone())?;
    }
    Ok(())
}

// =============================================================================
// CREATE EFFECT
// =============================================================================

/// Create an effect under the active effect (roots stay detached) and run it
/// once right away.
pub(crate) fn create_effect(rt: &Runtime, kind: EffectKind, body: EffectBody) -> Effect {
    let effect = EffectInner::new(kind, body);

    if kind != EffectKind::Root {
        if let Some(parent) = rt.ctx().active_effect() {
            push_effect(&effect, &parent);
        }
    }
    trace!(effect = %effect.id, kind = ?kind, "effect created");

    let handle = Effect::from_inner(rt.clone(), effect);
    if let Err(err) = update_effect(rt, &handle.inner) {
        err.raise();
    }
    handle
}

// =============================================================================
// TESTS
// =============================================================================
