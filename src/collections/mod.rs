// ============================================================================
// spark-reactor - Reactive Collections
// Keyed containers built on per-key sources
// ============================================================================
//
// Each collection has up to three levels of reactivity:
//
// 1. Per-key/item sources: only triggers when that specific element changes
// 2. Version source: triggers on structural changes (add/remove)
// 3. Size source: triggers when the count changes
//
// Values may themselves be collections. A nested one carries its own
// per-key sources, so writes inside it never touch the outer container.
// ============================================================================

mod map;
mod record;
mod set;
mod vec;

pub use map::ReactiveMap;
pub use record::ReactiveRecord;
pub use set::ReactiveSet;
pub use vec::ReactiveVec;
