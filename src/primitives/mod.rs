// ============================================================================
// spark-reactor - Primitives Module
// Sources, deriveds, async deriveds and effects
// ============================================================================

pub mod async_derived;
pub mod derived;
pub mod effect;
pub mod signal;

// Re-export for convenience
pub use async_derived::AsyncDerived;
pub use derived::Derived;
pub use effect::{CleanupFn, DisposeFn, Effect, EffectFn, EffectInner};
pub use signal::Source;
