// ============================================================================
// spark-reactor - Batching
// Group multiple updates into a single reaction cycle
// ============================================================================
//
// Inside a batch, schedule_effect parks dirty effects in the batch queue
// instead of the flush queue. When the outermost batch exits, the queue is
// drained directly: each effect is verified and rerun once, bypassing the
// tree walk. A batch that unwinds discards its queue.
// ============================================================================

use tracing::{debug, warn};

use crate::core::context::UntrackGuard;
use crate::core::error::ReactiveError;
use crate::core::flags::DirtyState;
use crate::core::types::Node;
use crate::reactivity::scheduling::run_isolated;
use crate::runtime::Runtime;

// =============================================================================
// BATCH
// =============================================================================

/// Exits the batch on drop. Dropped without `finish` means `f` unwound.
struct BatchGuard<'a> {
    rt: &'a Runtime,
    finished: bool,
}

impl BatchGuard<'_> {
    fn finish(mut self) -> Result<(), ReactiveError> {
        self.finished = true;
        if self.rt.ctx().exit_batch() == 0 {
            drain(self.rt)
        } else {
            Ok(())
        }
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let ctx = self.rt.ctx();
        if ctx.exit_batch() > 0 {
            return;
        }
        let discarded = ctx.take_batch_queue();
        // Queued effects are flagged dirty; clear that so the next write
        // re-arms them instead of being swallowed by the dedupe in marking.
        for effect in discarded.values() {
            effect.flags().set_state(DirtyState::Clean);
        }
        warn!(discarded = discarded.len(), "batch unwound; queued effects discarded");
    }
}

/// Run `f` with flushing suspended, then run every effect it dirtied once.
///
/// Re-entrant: only the outermost batch drains. Returns the first fatal error
/// raised while draining.
pub(crate) fn try_batch<T>(rt: &Runtime, f: impl FnOnce() -> T) -> Result<T, ReactiveError> {
    rt.ctx().enter_batch();
    let guard = BatchGuard { rt, finished: false };
    let value = f();
    guard.finish()?;
    Ok(value)
}

/// Run every queued effect, in first-dirtied order.
fn drain(rt: &Runtime) -> Result<(), ReactiveError> {
    let queue = rt.ctx().take_batch_queue();
    if queue.is_empty() {
        return Ok(());
    }
    debug!(effects = queue.len(), "draining batch");

    let mut first_err = None;
    for effect in queue.into_values() {
        let flags = effect.flags();
        if flags.is_destroyed() || flags.is_inert() {
            continue;
        }
        if let Err(err) = run_isolated(rt, &effect) {
            first_err.get_or_insert(err);
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

// =============================================================================
// UNTRACK
// =============================================================================

/// Run `f` without recording any reads as dependencies.
pub(crate) fn untrack<T>(rt: &Runtime, f: impl FnOnce() -> T) -> T {
    let _guard = UntrackGuard::enter(rt.ctx());
    f()
}

// =============================================================================
// TESTS
// =============================================================================
