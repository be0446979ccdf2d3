// ============================================================================
// spark-reactor - Reactive Context
// All mutable runtime state: tracking frame, versions, queues and task pool
// ============================================================================

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use futures_util::future::LocalBoxFuture;
use futures_util::stream::FuturesUnordered;
use indexmap::IndexMap;

use super::error::ReactiveError;
use super::options::RuntimeOptions;
use super::types::{AnyReaction, AnySource, Node, NodeId};
use crate::primitives::effect::EffectInner;
use crate::runtime::Runtime;

/// A unit of deferred work on the runtime's microtask queue.
pub(crate) type Microtask = Box<dyn FnOnce(&Runtime) -> Result<(), ReactiveError>>;

// =============================================================================
// TRACKING FRAME
// =============================================================================

/// Dependency collection state for the reaction currently running.
///
/// One frame exists per running reaction; nested runs swap frames in and out
/// through `FrameGuard`.
pub(crate) struct Frame {
    pub reaction: Rc<dyn AnyReaction>,

    /// Read version stamped onto every source this run reads
    pub read_version: u64,

    /// Dependencies read that differ from the previous run, in read order
    pub new_deps: Option<Vec<Rc<dyn AnySource>>>,

    /// Length of the prefix of the previous deps that matched this run
    pub skipped: usize,

    /// Sources written by the running effect
    pub untracked_writes: Vec<Rc<dyn AnySource>>,
}

impl Frame {
    pub fn new(reaction: Rc<dyn AnyReaction>, read_version: u64) -> Self {
        Self {
            reaction,
            read_version,
            new_deps: None,
            skipped: 0,
            untracked_writes: Vec::new(),
        }
    }

    /// Whether `id` was already recorded by this run.
    pub fn has_tracked(&self, id: NodeId) -> bool {
        let deps = self.reaction.reaction_core().deps_ref();
        deps.iter().take(self.skipped).any(|dep| dep.id() == id)
            || self
                .new_deps
                .as_ref()
                .is_some_and(|new| new.iter().any(|dep| dep.id() == id))
    }
}

// =============================================================================
// REACTIVE CONTEXT
// =============================================================================

/// Per-runtime reactive state. Everything that would otherwise be a global.
pub(crate) struct ReactiveContext {
    pub options: RuntimeOptions,

    // =========================================================================
    // REACTION TRACKING
    // =========================================================================
    /// Frame of the currently running reaction (effect or derived)
    pub frame: RefCell<Option<Frame>>,

    /// Currently executing effect (owner of new effects and deriveds)
    pub active_effect: RefCell<Option<Weak<EffectInner>>>,

    /// Whether reads are currently untracked
    pub untracking: Cell<bool>,

    // =========================================================================
    // VERSION COUNTERS
    // =========================================================================
    /// Global write version - incremented on every value change
    pub write_version: Cell<u64>,

    /// Global read version - incremented on every reaction run
    pub read_version: Cell<u64>,

    // =========================================================================
    // BATCHING
    // =========================================================================
    pub batch_depth: Cell<u32>,

    /// Effects dirtied inside a batch, deduplicated, in first-dirtied order
    pub batch_queue: RefCell<IndexMap<NodeId, Rc<EffectInner>>>,

    // =========================================================================
    // SCHEDULING
    // =========================================================================
    /// Top-level effects whose subtrees need a flush
    pub queued_root_effects: RefCell<Vec<Rc<EffectInner>>>,

    pub is_flushing: Cell<bool>,

    /// A flush microtask is already on the queue
    pub microtask_queued: Cell<bool>,

    /// Consecutive chained flush passes (loop guard)
    pub flush_count: Cell<u32>,

    pub microtasks: RefCell<VecDeque<Microtask>>,

    /// Spawned local futures (async effects, async deriveds)
    pub tasks: RefCell<FuturesUnordered<LocalBoxFuture<'static, ()>>>,
}

impl Default for ReactiveContext {
    fn default() -> Self {
        Self::new(RuntimeOptions::default())
    }
}

impl ReactiveContext {
    pub fn new(options: RuntimeOptions) -> Self {
        Self {
            options,
            frame: RefCell::new(None),
            active_effect: RefCell::new(None),
            untracking: Cell::new(false),
            write_version: Cell::new(1),
            read_version: Cell::new(0),
            batch_depth: Cell::new(0),
            batch_queue: RefCell::new(IndexMap::new()),
            queued_root_effects: RefCell::new(Vec::new()),
            is_flushing: Cell::new(false),
            microtask_queued: Cell::new(false),
            flush_count: Cell::new(0),
            microtasks: RefCell::new(VecDeque::new()),
            tasks: RefCell::new(FuturesUnordered::new()),
        }
    }

    // =========================================================================
    // REACTION TRACKING
    // =========================================================================

    pub fn current_reaction(&self) -> Option<Rc<dyn AnyReaction>> {
        self.frame.borrow().as_ref().map(|frame| frame.reaction.clone())
    }

    /// Inside a reaction and not untracking
    pub fn is_tracking(&self) -> bool {
        !self.untracking.get() && self.frame.borrow().is_some()
    }

    pub fn active_effect(&self) -> Option<Rc<EffectInner>> {
        self.active_effect.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub fn has_active_effect(&self) -> bool {
        self.active_effect
            .borrow()
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    // =========================================================================
    // VERSION COUNTERS
    // =========================================================================

    pub fn write_version(&self) -> u64 {
        self.write_version.get()
    }

    /// Increment and return the write version
    pub fn increment_write_version(&self) -> u64 {
        let v = self.write_version.get() + 1;
        self.write_version.set(v);
        v
    }

    /// Increment and return the read version
    pub fn next_read_version(&self) -> u64 {
        let v = self.read_version.get() + 1;
        self.read_version.set(v);
        v
    }

    // =========================================================================
    // BATCHING
    // =========================================================================

    pub fn enter_batch(&self) -> u32 {
        let depth = self.batch_depth.get() + 1;
        self.batch_depth.set(depth);
        depth
    }

    pub fn exit_batch(&self) -> u32 {
        let depth = self.batch_depth.get().saturating_sub(1);
        self.batch_depth.set(depth);
        depth
    }

    pub fn is_batching(&self) -> bool {
        self.batch_depth.get() > 0
    }

    pub fn queue_batched(&self, effect: Rc<EffectInner>) {
        self.batch_queue
            .borrow_mut()
            .entry(effect.id())
            .or_insert(effect);
    }

    pub fn take_batch_queue(&self) -> IndexMap<NodeId, Rc<EffectInner>> {
        std::mem::take(&mut *self.batch_queue.borrow_mut())
    }

    // =========================================================================
    // SCHEDULING
    // =========================================================================

    /// Queue a top-level effect for the next flush, once.
    pub fn queue_root(&self, effect: Rc<EffectInner>) {
        let mut roots = self.queued_root_effects.borrow_mut();
        if !roots.iter().any(|queued| Rc::ptr_eq(queued, &effect)) {
            roots.push(effect);
        }
    }

    pub fn take_queued_roots(&self) -> Vec<Rc<EffectInner>> {
        std::mem::take(&mut *self.queued_root_effects.borrow_mut())
    }

    pub fn push_microtask(&self, task: Microtask) {
        self.microtasks.borrow_mut().push_back(task);
    }

    pub fn pop_microtask(&self) -> Option<Microtask> {
        self.microtasks.borrow_mut().pop_front()
    }

    pub fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        self.tasks.borrow_mut().push(task);
    }
}

// =============================================================================
// GUARDS
// =============================================================================
//
// Each guard swaps a piece of context state in and restores the previous
// value when dropped, so a panicking reaction never leaves the runtime
// believing it is still inside that reaction.
// =============================================================================

/// Installs a tracking frame for the duration of a reaction run.
pub(crate) struct FrameGuard<'a> {
    ctx: &'a ReactiveContext,
    prev: Option<Option<Frame>>,
    prev_untracking: bool,
}

impl<'a> FrameGuard<'a> {
    pub fn enter(ctx: &'a ReactiveContext, frame: Option<Frame>) -> Self {
        let prev = ctx.frame.replace(frame);
        let prev_untracking = ctx.untracking.replace(false);
        Self {
            ctx,
            prev: Some(prev),
            prev_untracking,
        }
    }

    /// Restore the previous frame and hand back the one this guard installed.
    pub fn finish(mut self) -> Option<Frame> {
        let prev = self.prev.take().unwrap_or_default();
        self.ctx.untracking.set(self.prev_untracking);
        self.ctx.frame.replace(prev)
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if let Some(prev) = self.prev.take() {
            self.ctx.frame.replace(prev);
            self.ctx.untracking.set(self.prev_untracking);
        }
    }
}

/// Makes an effect the active owner for the duration of its run.
pub(crate) struct ActiveEffectGuard<'a> {
    ctx: &'a ReactiveContext,
    prev: Option<Weak<EffectInner>>,
}

impl<'a> ActiveEffectGuard<'a> {
    pub fn enter(ctx: &'a ReactiveContext, effect: Option<&Rc<EffectInner>>) -> Self {
        let prev = ctx.active_effect.replace(effect.map(Rc::downgrade));
        Self { ctx, prev }
    }
}

impl Drop for ActiveEffectGuard<'_> {
    fn drop(&mut self) {
        self.ctx.active_effect.replace(self.prev.take());
    }
}

pub(crate) struct UntrackGuard<'a> {
    ctx: &'a ReactiveContext,
    prev: bool,
}

impl<'a> UntrackGuard<'a> {
    pub fn enter(ctx: &'a ReactiveContext) -> Self {
        let prev = ctx.untracking.replace(true);
        Self { ctx, prev }
    }
}

impl Drop for UntrackGuard<'_> {
    fn drop(&mut self) {
        self.ctx.untracking.set(self.prev);
    }
}

pub(crate) struct FlushingGuard<'a> {
    ctx: &'a ReactiveContext,
    prev: bool,
}

impl<'a> FlushingGuard<'a> {
    pub fn enter(ctx: &'a ReactiveContext) -> Self {
        let prev = ctx.is_flushing.replace(true);
        Self { ctx, prev }
    }
}

impl Drop for FlushingGuard<'_> {
    fn drop(&mut self) {
        self.ctx.is_flushing.set(self.prev);
    }
}

// =============================================================================
// TESTS
// =============================================================================
