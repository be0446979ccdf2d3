// ============================================================================
// spark-reactor - Dependency Tracking
// Tracking reads, installing dependencies and propagating dirty state
// ============================================================================
//
// Push/pull in two halves:
//   push - a write marks downstream reactions DIRTY or MAYBE_DIRTY and
//          schedules affected effects (mark_reactions)
//   pull - before a reaction reruns, MAYBE_DIRTY is resolved by comparing
//          dependency write versions against what the reaction last observed
//          (check_dirtiness)
//
// RefCell borrows are never held across user code or across a walk that may
// touch the same node again: walks iterate snapshots ("collect-then-mutate").
// ============================================================================

use std::rc::Rc;

use tracing::trace;

use crate::core::context::{Frame, FrameGuard};
use crate::core::error::ReactiveError;
use crate::core::flags::{DirtyState, NodeKind};
use crate::core::types::{AnyReaction, AnySource, NodeId};
use crate::primitives::effect::EffectInner;
use crate::reactivity::scheduling::schedule_effect;
use crate::runtime::Runtime;

// =============================================================================
// TRACK READ - Register dependency when reading a node
// =============================================================================

/// Record `source` as a dependency of the running reaction.
///
/// Deduplicated per run through the source's read version. Reads that repeat
/// the previous run's dependency order only advance the skipped-prefix
/// counter, so a reaction with a stable dependency set allocates nothing.
pub(crate) fn track_read(rt: &Runtime, source: Rc<dyn AnySource>) {
    let ctx = rt.ctx();
    if ctx.untracking.get() {
        return;
    }

    let mut slot = ctx.frame.borrow_mut();
    let Some(frame) = slot.as_mut() else {
        return;
    };

    let core = source.source_core();
    let rv = core.read_version();
    if rv == frame.read_version {
        return;
    }
    // A newer read version means a nested run has stamped the source since
    // this run read it; fall back to a scan.
    if rv > frame.read_version && frame.has_tracked(source.id()) {
        core.set_read_version(frame.read_version);
        return;
    }
    core.set_read_version(frame.read_version);

    if frame.new_deps.is_none() {
        let matches_previous = frame
            .reaction
            .reaction_core()
            .deps_ref()
            .get(frame.skipped)
            .is_some_and(|dep| dep.id() == source.id());
        if matches_previous {
            frame.skipped += 1;
            return;
        }
    }

    frame.new_deps.get_or_insert_with(Vec::new).push(source);
}

/// Reject a write made while a derived is computing.
pub(crate) fn check_write(rt: &Runtime, target: NodeId) -> Result<(), ReactiveError> {
    match rt.ctx().frame.borrow().as_ref() {
        Some(frame) if frame.reaction.kind() == NodeKind::Derived => {
            Err(ReactiveError::UnsafeMutation {
                target,
                derived: frame.reaction.id(),
            })
        }
        _ => Ok(()),
    }
}

/// Remember a value change made by the running effect, so the effect can be
/// rescheduled if it wrote one of its own dependencies.
pub(crate) fn record_write(rt: &Runtime, source: Rc<dyn AnySource>) {
    if let Some(frame) = rt.ctx().frame.borrow_mut().as_mut() {
        frame.untracked_writes.push(source);
    }
}

// =============================================================================
// RUN TRACKED - Execute a reaction body while collecting dependencies
// =============================================================================

/// Result of a tracked run.
pub(crate) struct Tracked<R> {
    pub value: R,

    /// The reaction wrote a source it now depends on
    pub self_invalidated: bool,
}

/// Run `f` as the body of `reaction`, then install the dependencies it read.
///
/// With `subscribe == false` the reaction keeps its dependency list but is
/// left out of every dependency's reaction list.
pub(crate) fn run_tracked<R>(
    rt: &Runtime,
    reaction: Rc<dyn AnyReaction>,
    subscribe: bool,
    f: impl FnOnce() -> R,
) -> Tracked<R> {
    let ctx = rt.ctx();
    let frame = Frame::new(reaction.clone(), ctx.next_read_version());

    let guard = FrameGuard::enter(ctx, Some(frame));
    let value = f();
    let Some(frame) = guard.finish() else {
        return Tracked {
            value,
            self_invalidated: false,
        };
    };

    install_dependencies(&reaction, frame.new_deps, frame.skipped, subscribe);
    if !subscribe {
        unsubscribe(&*reaction, 0, &[]);
    }

    let core = reaction.reaction_core();
    let self_invalidated = frame
        .untracked_writes
        .iter()
        .any(|written| core.has_dep(written.id()));

    Tracked {
        value,
        self_invalidated,
    }
}

// =============================================================================
// INSTALL DEPENDENCIES - Wire up deps after a run
// =============================================================================

/// Replace everything after the skipped prefix with `new_deps`.
///
/// When the run read exactly the previous prefix, the list is truncated in
/// place.
pub(crate) fn install_dependencies(
    reaction: &Rc<dyn AnyReaction>,
    new_deps: Option<Vec<Rc<dyn AnySource>>>,
    skipped: usize,
    subscribe: bool,
) {
    let core = reaction.reaction_core();

    match new_deps {
        Some(new_deps) => {
            unsubscribe(&**reaction, skipped, &new_deps);
            {
                let mut deps = core.deps_mut();
                deps.truncate(skipped);
                deps.extend(new_deps.iter().cloned());
            }
            if subscribe {
                resubscribe_prefix(reaction, skipped);
                let weak = Rc::downgrade(reaction);
                for dep in &new_deps {
                    dep.source_core().add_reaction(weak.clone());
                }
            }
        }
        None => {
            if skipped < core.dep_count() {
                unsubscribe(&**reaction, skipped, &[]);
                core.deps_mut().truncate(skipped);
            }
            if subscribe {
                resubscribe_prefix(reaction, skipped);
            }
        }
    }
}

/// A reaction that ran disconnected last time is missing from the reaction
/// lists of its kept prefix.
fn resubscribe_prefix(reaction: &Rc<dyn AnyReaction>, skipped: usize) {
    if !reaction.flags().is_disconnected() {
        return;
    }
    let weak = Rc::downgrade(reaction);
    let prefix: Vec<Rc<dyn AnySource>> = reaction
        .reaction_core()
        .deps_ref()
        .iter()
        .take(skipped)
        .cloned()
        .collect();
    for dep in prefix {
        let core = dep.source_core();
        if !core.has_reaction(reaction.id()) {
            core.add_reaction(weak.clone());
        }
    }
}

// =============================================================================
// UNSUBSCRIBE - Remove a reaction from its dependencies' reaction lists
// =============================================================================

/// Remove `reaction` from the reaction lists of `deps[start..]`.
///
/// A derived left with no reactions (and not in `keep`) is disconnected: it
/// goes MAYBE_DIRTY, keeps its dependency list for later verification, and
/// recursively leaves its own dependencies. The dependency list of `reaction`
/// itself is not touched.
pub(crate) fn unsubscribe<R: AnyReaction + ?Sized>(
    reaction: &R,
    start: usize,
    keep: &[Rc<dyn AnySource>],
) {
    let id = reaction.id();
    let deps: Vec<Rc<dyn AnySource>> = {
        let deps = reaction.reaction_core().deps_ref();
        deps.get(start..).map(|tail| tail.to_vec()).unwrap_or_default()
    };

    for dep in deps {
        let core = dep.source_core();
        core.remove_reaction(id);
        if core.reaction_count() > 0 || keep.iter().any(|k| k.id() == dep.id()) {
            continue;
        }
        let Some(derived) = dep.as_derived() else {
            continue;
        };
        let flags = derived.flags();
        if flags.is_destroyed() || flags.is_disconnected() {
            continue;
        }
        trace!(derived = %dep.id(), "derived lost its last reaction; disconnecting");
        flags.raise(DirtyState::MaybeDirty);
        flags.set_disconnected(true);
        unsubscribe(&*derived, 0, &[]);
    }
}

/// Put a disconnected derived back into its dependencies' reaction lists.
fn reconnect<R: AnyReaction + ?Sized>(reaction: &R) {
    let Some(me) = reaction.self_reaction() else {
        return;
    };
    let weak = Rc::downgrade(&me);
    for dep in reaction.reaction_core().deps() {
        let core = dep.source_core();
        if !core.has_reaction(me.id()) {
            core.add_reaction(weak.clone());
        }
    }
    reaction.flags().set_disconnected(false);
    trace!(derived = %me.id(), "derived reconnected");
}

// =============================================================================
// MARK REACTIONS - Push dirty state through the graph
// =============================================================================

/// Mark every reaction downstream of `source`.
///
/// Direct reactions get `status`; everything reached through a derived gets
/// MAYBE_DIRTY. Nodes already at least that dirty are not revisited. Effects
/// that changed state are handed to the scheduler once the walk is done.
///
/// Uses an explicit stack so deep derived chains cannot overflow.
pub(crate) fn mark_reactions<S: AnySource + ?Sized>(
    rt: &Runtime,
    source: &S,
    status: DirtyState,
) -> Result<(), ReactiveError> {
    let mut to_schedule: Vec<Rc<EffectInner>> = Vec::new();
    let mut stack: Vec<(Vec<Rc<dyn AnyReaction>>, DirtyState)> =
        vec![(source.source_core().reactions(), status)];

    while let Some((reactions, status)) = stack.pop() {
        for reaction in reactions {
            let flags = reaction.flags();
            if flags.is_destroyed() {
                continue;
            }

            match reaction.kind() {
                NodeKind::Derived => {
                    if !flags.raise(DirtyState::MaybeDirty) {
                        continue;
                    }
                    if let Some(derived) = reaction.as_derived() {
                        stack.push((derived.source_core().reactions(), DirtyState::MaybeDirty));
                    }
                }
                NodeKind::Effect(_) => {
                    if !flags.raise(status) {
                        continue;
                    }
                    if let Some(effect) = reaction.as_effect() {
                        to_schedule.push(effect);
                    }
                }
                NodeKind::Source => {}
            }
        }
    }

    for effect in to_schedule {
        schedule_effect(rt, effect)?;
    }
    Ok(())
}

// =============================================================================
// CHECK DIRTINESS - Pull-side verification
// =============================================================================

/// Decide whether `reaction` must rerun.
///
/// DIRTY is always stale and CLEAN never is. MAYBE_DIRTY walks the
/// dependencies in order, bringing derived dependencies up to date first, and
/// reports stale as soon as one has a write version newer than what the
/// reaction last observed. If none does, the reaction is verified clean
/// (disconnected deriveds stay MAYBE_DIRTY so the next read verifies again).
pub(crate) fn check_dirtiness<R: AnyReaction + ?Sized>(
    rt: &Runtime,
    reaction: &R,
) -> Result<bool, ReactiveError> {
    let flags = reaction.flags();
    match flags.state() {
        DirtyState::Dirty => return Ok(true),
        DirtyState::Clean => return Ok(false),
        DirtyState::MaybeDirty => {}
    }

    let ctx = rt.ctx();
    if flags.is_disconnected() {
        let wanted = reaction
            .as_derived()
            .is_some_and(|derived| ctx.has_active_effect() || derived.reaction_count() > 0);
        if wanted {
            reconnect(reaction);
        }
    }

    let core = reaction.reaction_core();
    let observed = core.observed_version();
    for dep in core.deps() {
        if let Some(derived) = dep.as_derived() {
            if check_dirtiness(rt, &*derived)? {
                derived.recompute(rt)?;
            }
        }
        if dep.write_version() > observed {
            return Ok(true);
        }
    }

    core.set_observed_version(ctx.write_version());
    if !flags.is_disconnected() {
        flags.set_state(DirtyState::Clean);
    }
    Ok(false)
}

// =============================================================================
// TESTS
// =============================================================================
