// ============================================================================
// spark-reactor - Node Flags
// Node kinds, dirty states and lifecycle flags for the reactive graph
// ============================================================================

use std::cell::Cell;
use std::fmt;

// =============================================================================
// KINDS
// =============================================================================

/// Which flavor of effect a node is. Decides how the flush walk treats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    /// Top of an ownership tree. Runs its body once and is never re-run.
    Root,
    /// Structural container. Dirtied only so the flush descends into it.
    Branch,
    /// Re-runs inline during the tree walk, before plain effects.
    Render,
    /// Plain side effect, run after its render subtree has settled.
    Effect,
}

impl EffectKind {
    /// Root and branch effects run once, untracked, and only structure the tree.
    pub fn is_structural(self) -> bool {
        matches!(self, EffectKind::Root | EffectKind::Branch)
    }
}

/// What a node in the graph is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Source,
    Derived,
    Effect(EffectKind),
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Source => f.write_str("source"),
            NodeKind::Derived => f.write_str("derived"),
            NodeKind::Effect(EffectKind::Root) => f.write_str("root effect"),
            NodeKind::Effect(EffectKind::Branch) => f.write_str("branch effect"),
            NodeKind::Effect(EffectKind::Render) => f.write_str("render effect"),
            NodeKind::Effect(EffectKind::Effect) => f.write_str("effect"),
        }
    }
}

// =============================================================================
// DIRTY STATE
// =============================================================================

/// Dirty state of a reaction, ordered by strength.
///
/// `Clean < MaybeDirty < Dirty`, so "already at least this dirty" is a plain
/// comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DirtyState {
    #[default]
    Clean,
    /// An upstream derived may have changed; verify by version before rerunning.
    MaybeDirty,
    /// A direct dependency changed.
    Dirty,
}

// =============================================================================
// NODE FLAGS
// =============================================================================

macro_rules! bool_flag {
    ($get:ident, $set:ident, $field:ident) => {
        #[inline]
        pub fn $get(&self) -> bool {
            self.$field.get()
        }

        #[inline]
        pub fn $set(&self, value: bool) {
            self.$field.set(value);
        }
    };
}

/// Dirty state plus the orthogonal lifecycle booleans of one node.
///
/// All fields are `Cell`s so flags can be flipped through shared references
/// while the graph is being walked.
#[derive(Debug, Default)]
pub struct NodeFlags {
    state: Cell<DirtyState>,
    unowned: Cell<bool>,
    disconnected: Cell<bool>,
    destroyed: Cell<bool>,
    inert: Cell<bool>,
    running: Cell<bool>,
    initialized: Cell<bool>,
    has_error: Cell<bool>,
}

impl NodeFlags {
    /// Flags for a node starting in the given state.
    pub fn new(state: DirtyState) -> Self {
        let flags = Self::default();
        flags.state.set(state);
        flags
    }

    #[inline]
    pub fn state(&self) -> DirtyState {
        self.state.get()
    }

    #[inline]
    pub fn set_state(&self, state: DirtyState) {
        self.state.set(state);
    }

    /// Raise the state to at least `state`. Returns false if it already was.
    pub fn raise(&self, state: DirtyState) -> bool {
        if self.state.get() >= state {
            return false;
        }
        self.state.set(state);
        true
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        self.state.get() == DirtyState::Clean
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.state.get() == DirtyState::Dirty
    }

    #[inline]
    pub fn is_maybe_dirty(&self) -> bool {
        self.state.get() == DirtyState::MaybeDirty
    }

    // Created with no owning effect.
    bool_flag!(is_unowned, set_unowned, unowned);
    // Not present in its dependencies' reaction lists.
    bool_flag!(is_disconnected, set_disconnected, disconnected);
    bool_flag!(is_destroyed, set_destroyed, destroyed);
    // Paused: skipped by the flush walk.
    bool_flag!(is_inert, set_inert, inert);
    // Currently executing its body.
    bool_flag!(is_running, set_running, running);
    bool_flag!(is_initialized, set_initialized, initialized);
    bool_flag!(has_error, set_has_error, has_error);
}

/// Clears the running flag when dropped, including on unwind.
pub(crate) struct RunningGuard<'a> {
    flags: &'a NodeFlags,
}

impl<'a> RunningGuard<'a> {
    pub(crate) fn enter(flags: &'a NodeFlags) -> Self {
        flags.set_running(true);
        Self { flags }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flags.set_running(false);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_states_are_ordered() {
        assert!(DirtyState::Clean < DirtyState::MaybeDirty);
        assert!(DirtyState::MaybeDirty < DirtyState::Dirty);
        assert_eq!(DirtyState::default(), DirtyState::Clean);
    }

    #[test]
    fn raise_never_lowers() {
        let flags = NodeFlags::new(DirtyState::Clean);
        assert!(flags.raise(DirtyState::MaybeDirty));
        assert!(flags.is_maybe_dirty());

        assert!(flags.raise(DirtyState::Dirty));
        assert!(!flags.raise(DirtyState::MaybeDirty));
        assert!(flags.is_dirty());
    }

    #[test]
    fn lifecycle_flags_are_independent() {
        let flags = NodeFlags::new(DirtyState::Dirty);
        flags.set_unowned(true);
        flags.set_inert(true);

        assert!(flags.is_unowned());
        assert!(flags.is_inert());
        assert!(!flags.is_destroyed());
        assert!(!flags.is_disconnected());
        assert!(flags.is_dirty());
    }

    #[test]
    fn running_guard_resets_on_panic() {
        let flags = NodeFlags::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = RunningGuard::enter(&flags);
            assert!(flags.is_running());
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(!flags.is_running());
    }

    #[test]
    fn structural_kinds() {
        assert!(EffectKind::Root.is_structural());
        assert!(EffectKind::Branch.is_structural());
        assert!(!EffectKind::Render.is_structural());
        assert!(!EffectKind::Effect.is_structural());
        assert_eq!(NodeKind::Effect(EffectKind::Render).to_string(), "render effect");
    }
}
