// ============================================================================
// spark-reactor - Core Module
// Fundamental types, traits, errors, options and runtime state
// ============================================================================

pub mod context;
pub mod error;
pub mod flags;
pub mod options;
pub mod types;

// Re-export commonly used items
pub use error::ReactiveError;
pub use flags::{DirtyState, EffectKind, NodeFlags, NodeKind};
pub use options::{DerivedOptions, RuntimeOptions, SchedulerMode};
pub use types::{
    AnyDerived, AnyReaction, AnySource, EqualsFn, Node, NodeId, SourceInner, default_equals,
};
