// ============================================================================
// spark-reactor - Reactivity Module
// Dependency tracking, dirty propagation, scheduling and batching
// ============================================================================

pub(crate) mod batching;
pub mod equality;
pub(crate) mod scheduling;
pub(crate) mod tracking;
