// ============================================================================
// spark-reactor - Effect Scheduling
// Coalesced flushes over the effect tree, the loop guard and the task pool
// ============================================================================
//
// A dirty effect is never run from inside the write that dirtied it. Instead
// schedule_effect marks the path from the effect up to its top-level ancestor
// and queues that ancestor. One flush microtask per turn then walks every
// queued tree:
//
//   - branch effects are descended only if marked
//   - render effects rerun inline during the walk, then their children
//   - plain effects are collected and run after their subtree is walked
//
// Rust has no ambient microtask loop, so the runtime owns a queue that the
// host drains with tick(). flush_sync() runs the pending pass directly.
// ============================================================================

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::task::{Context, Poll};

use futures_util::StreamExt;
use futures_util::task::noop_waker_ref;
use tracing::{debug, error, trace};

use crate::core::error::{ReactiveError, panic_message};
use crate::core::flags::{DirtyState, EffectKind};
use crate::core::options::SchedulerMode;
use crate::core::types::Node;
use crate::primitives::effect::{EffectInner, update_effect};
use crate::reactivity::tracking::check_dirtiness;
use crate::runtime::Runtime;

// =============================================================================
// SCHEDULE EFFECT
// =============================================================================

/// Schedule a dirty effect for the next flush.
///
/// Inside a batch the effect goes to the batch queue instead. Otherwise every
/// root/branch ancestor is marked so the walk descends into it, and the
/// top-level ancestor is queued. An ancestor that is already marked means the
/// path is already scheduled.
pub(crate) fn schedule_effect(rt: &Runtime, effect: Rc<EffectInner>) -> Result<(), ReactiveError> {
    let ctx = rt.ctx();

    if ctx.is_batching() {
        trace!(effect = %effect.id(), "effect deferred to batch");
        ctx.queue_batched(effect);
        return Ok(());
    }

    if ctx.options.scheduler == SchedulerMode::Microtask && !ctx.microtask_queued.replace(true) {
        ctx.push_microtask(Box::new(process_deferred));
    }

    let mut top = effect;
    while let Some(parent) = top.parent() {
        top = parent;
        if top.effect_kind().is_structural() && !top.flags().raise(DirtyState::Dirty) {
            return Ok(());
        }
    }
    ctx.queue_root(top);

    if ctx.options.scheduler == SchedulerMode::Sync && !ctx.is_flushing.get() {
        flush_sync(rt)?;
    }
    Ok(())
}

/// The flush microtask.
fn process_deferred(rt: &Runtime) -> Result<(), ReactiveError> {
    let ctx = rt.ctx();
    ctx.microtask_queued.set(false);

    let roots = ctx.take_queued_roots();
    let result = flush_queued_root_effects(rt, roots);

    // Only a pass that queued another pass counts toward the loop guard.
    if result.is_err() || !ctx.microtask_queued.get() {
        ctx.flush_count.set(0);
    }
    result
}

// =============================================================================
// FLUSH
// =============================================================================

/// Run every pending flush pass right now.
///
/// A no-op when called from inside a flush.
pub(crate) fn flush_sync(rt: &Runtime) -> Result<(), ReactiveError> {
    let ctx = rt.ctx();
    if ctx.is_flushing.get() {
        return Ok(());
    }

    let result = loop {
        let roots = ctx.take_queued_roots();
        if roots.is_empty() {
            break Ok(());
        }
        if let Err(err) = flush_queued_root_effects(rt, roots) {
            break Err(err);
        }
    };

    ctx.flush_count.set(0);
    result
}

/// One flush pass over the given top-level effects.
fn flush_queued_root_effects(rt: &Runtime, roots: Vec<Rc<EffectInner>>) -> Result<(), ReactiveError> {
    if roots.is_empty() {
        return Ok(());
    }
    infinite_loop_guard(rt, &roots)?;

    let ctx = rt.ctx();
    let _flushing = crate::core::context::FlushingGuard::enter(ctx);
    debug!(roots = roots.len(), pass = ctx.flush_count.get(), "flushing effect trees");

    for (i, root) in roots.iter().enumerate() {
        if let Err(err) = flush_root(rt, root) {
            // The failing tree may still hold collected, unrun effects.
            abort_roots(&roots[i..]);
            return Err(err);
        }
    }
    Ok(())
}

fn infinite_loop_guard(rt: &Runtime, roots: &[Rc<EffectInner>]) -> Result<(), ReactiveError> {
    let ctx = rt.ctx();
    let limit = ctx.options.max_update_depth;
    let count = ctx.flush_count.get();

    if count >= limit {
        ctx.flush_count.set(0);
        abort_roots(roots);
        let pending = ctx.take_queued_roots();
        abort_roots(&pending);
        error!(limit, "maximum update depth exceeded; pending effects dropped");
        return Err(ReactiveError::MaxUpdateDepth { limit });
    }

    ctx.flush_count.set(count + 1);
    Ok(())
}

/// Drop pending work under `roots`, leaving every effect clean so the next
/// write to one of its dependencies schedules it again.
fn abort_roots(roots: &[Rc<EffectInner>]) {
    let mut stack: Vec<Rc<EffectInner>> = roots.to_vec();
    while let Some(effect) = stack.pop() {
        effect.flags().set_state(DirtyState::Clean);
        stack.extend(effect.children());
    }
}

fn flush_root(rt: &Runtime, root: &Rc<EffectInner>) -> Result<(), ReactiveError> {
    let flags = root.flags();
    if flags.is_destroyed() || flags.is_inert() {
        return Ok(());
    }

    let mut collected = Vec::new();
    if root.effect_kind().is_structural() {
        flags.set_state(DirtyState::Clean);
        process_effects(rt, root, &mut collected)?;
    } else {
        let mut plain = Vec::new();
        visit(rt, root, &mut plain)?;
        for effect in plain {
            collected.push(effect.clone());
            process_effects(rt, &effect, &mut collected)?;
        }
    }

    flush_queued_effects(rt, &collected)
}

/// Walk the children of `parent`, then recurse into every plain effect found,
/// appending plain effects to `collected` in run order.
fn process_effects(
    rt: &Runtime,
    parent: &Rc<EffectInner>,
    collected: &mut Vec<Rc<EffectInner>>,
) -> Result<(), ReactiveError> {
    let mut plain = Vec::new();
    walk_children(rt, parent, &mut plain)?;

    for effect in plain {
        collected.push(effect.clone());
        process_effects(rt, &effect, collected)?;
    }
    Ok(())
}

fn walk_children(
    rt: &Runtime,
    parent: &Rc<EffectInner>,
    plain: &mut Vec<Rc<EffectInner>>,
) -> Result<(), ReactiveError> {
    // A render effect may destroy any of its siblings while it runs.
    for effect in parent.children() {
        if effect.flags().is_destroyed() {
            continue;
        }
        visit(rt, &effect, plain)?;
    }
    Ok(())
}

fn visit(
    rt: &Runtime,
    effect: &Rc<EffectInner>,
    plain: &mut Vec<Rc<EffectInner>>,
) -> Result<(), ReactiveError> {
    let flags = effect.flags();
    if flags.is_inert() || flags.is_destroyed() {
        return Ok(());
    }

    match effect.effect_kind() {
        EffectKind::Root => Ok(()),
        EffectKind::Branch => {
            if flags.is_clean() {
                return Ok(());
            }
            flags.set_state(DirtyState::Clean);
            walk_children(rt, effect, plain)
        }
        EffectKind::Render => {
            run_isolated(rt, effect)?;
            if effect.flags().is_destroyed() {
                return Ok(());
            }
            walk_children(rt, effect, plain)
        }
        EffectKind::Effect => {
            plain.push(effect.clone());
            Ok(())
        }
    }
}

fn flush_queued_effects(rt: &Runtime, effects: &[Rc<EffectInner>]) -> Result<(), ReactiveError> {
    for effect in effects {
        let flags = effect.flags();
        if flags.is_destroyed() || flags.is_inert() {
            continue;
        }
        run_isolated(rt, effect)?;
    }
    Ok(())
}

/// Verify and, if stale, rerun one effect with failures contained to it.
///
/// Panics and non-fatal errors are logged and swallowed so sibling effects
/// still run. Fatal errors (cycles, a tripped loop guard) are returned.
pub(crate) fn run_isolated(rt: &Runtime, effect: &Rc<EffectInner>) -> Result<(), ReactiveError> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), ReactiveError> {
        if check_dirtiness(rt, &**effect)? {
            update_effect(rt, effect)?;
        }
        Ok(())
    }));

    let err = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => err,
        Err(payload) => match payload.downcast::<ReactiveError>() {
            Ok(err) => *err,
            Err(payload) => {
                error!(
                    effect = %effect.id(),
                    panic = %panic_message(&*payload),
                    "effect panicked"
                );
                return Ok(());
            }
        },
    };

    if err.is_fatal() {
        return Err(err);
    }
    error!(effect = %effect.id(), error = %err, "effect failed");
    Ok(())
}

// =============================================================================
// MICROTASKS AND LOCAL TASKS
// =============================================================================

/// Drain the microtask queue and poll spawned tasks until neither makes
/// progress. Returns the first error raised by a flush pass.
pub(crate) fn tick(rt: &Runtime) -> Result<(), ReactiveError> {
    let ctx = rt.ctx();
    let mut first_err: Option<ReactiveError> = None;

    loop {
        while let Some(task) = ctx.pop_microtask() {
            if let Err(err) = task(rt) {
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    debug!(error = %err, "additional flush error in the same tick");
                }
            }
        }

        let progressed = poll_tasks(rt);
        if !progressed && ctx.microtasks.borrow().is_empty() {
            break;
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Poll every ready spawned task once. Returns true if any completed or new
/// tasks were spawned meanwhile.
fn poll_tasks(rt: &Runtime) -> bool {
    let ctx = rt.ctx();
    let mut tasks = mem::take(&mut *ctx.tasks.borrow_mut());
    if tasks.is_empty() {
        return false;
    }

    let mut cx = Context::from_waker(noop_waker_ref());
    let mut progressed = false;
    while let Poll::Ready(Some(())) = tasks.poll_next_unpin(&mut cx) {
        progressed = true;
    }

    let mut slot = ctx.tasks.borrow_mut();
    let spawned = mem::replace(&mut *slot, tasks);
    if !spawned.is_empty() {
        progressed = true;
        slot.extend(spawned);
    }
    trace!(pending = slot.len(), progressed, "polled local tasks");
    progressed
}

// =============================================================================
// TESTS
// =============================================================================
