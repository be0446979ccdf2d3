// ============================================================================
// spark-reactor - Options
// Runtime and derived configuration
// ============================================================================

use std::time::Duration;

use super::types::EqualsFn;

/// How scheduled effects get flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerMode {
    /// Coalesce every scheduling request of a turn into one flush microtask.
    /// The host drains microtasks with `Runtime::tick`.
    #[default]
    Microtask,
    /// Flush as soon as an effect is scheduled, unless a flush or a batch is
    /// already in progress.
    Sync,
}

/// Configuration for a `Runtime`.
///
/// # Example
///
/// ```
/// use spark_reactor::{Runtime, RuntimeOptions, SchedulerMode};
///
/// let rt = Runtime::with_options(
///     RuntimeOptions::default()
///         .with_scheduler(SchedulerMode::Sync)
///         .with_max_update_depth(100),
/// );
/// assert_eq!(rt.options().max_update_depth, 100);
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub scheduler: SchedulerMode,

    /// Consecutive chained flush passes allowed before the loop guard trips
    pub max_update_depth: u32,

    /// Lower bound of the adaptive cache window
    pub min_cache_window: Duration,

    /// The cache window is this many times the last computation time
    pub cache_window_factor: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            scheduler: SchedulerMode::Microtask,
            max_update_depth: 1000,
            min_cache_window: Duration::from_millis(50),
            cache_window_factor: 2,
        }
    }
}

impl RuntimeOptions {
    pub fn with_scheduler(mut self, scheduler: SchedulerMode) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_max_update_depth(mut self, depth: u32) -> Self {
        self.max_update_depth = depth;
        self
    }

    pub fn with_min_cache_window(mut self, window: Duration) -> Self {
        self.min_cache_window = window;
        self
    }

    pub fn with_cache_window_factor(mut self, factor: u32) -> Self {
        self.cache_window_factor = factor;
        self
    }

    /// How long a derived that took `last_compute` may serve its cached value.
    pub fn cache_window(&self, last_compute: Duration) -> Duration {
        self.min_cache_window
            .max(last_compute.saturating_mul(self.cache_window_factor))
    }
}

/// Options for creating a derived.
pub struct DerivedOptions<T> {
    /// Custom equality; `None` uses `PartialEq`
    pub equals: Option<EqualsFn<T>>,

    /// Compute once at creation instead of on first read
    pub eager: bool,

    /// Serve a stale value until the adaptive cache window has elapsed
    pub adaptive_cache: bool,
}

impl<T> Default for DerivedOptions<T> {
    fn default() -> Self {
        Self {
            equals: None,
            eager: false,
            adaptive_cache: false,
        }
    }
}

impl<T> DerivedOptions<T> {
    pub fn equals(mut self, equals: EqualsFn<T>) -> Self {
        self.equals = Some(equals);
        self
    }

    pub fn eager(mut self) -> Self {
        self.eager = true;
        self
    }

    pub fn adaptive_cache(mut self) -> Self {
        self.adaptive_cache = true;
        self
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = RuntimeOptions::default();
        assert_eq!(opts.scheduler, SchedulerMode::Microtask);
        assert_eq!(opts.max_update_depth, 1000);
        assert_eq!(opts.min_cache_window, Duration::from_millis(50));
        assert_eq!(opts.cache_window_factor, 2);

        let derived: DerivedOptions<i32> = DerivedOptions::default();
        assert!(derived.equals.is_none());
        assert!(!derived.eager);
        assert!(!derived.adaptive_cache);
    }

    #[test]
    fn cache_window_has_a_floor() {
        let opts = RuntimeOptions::default();
        assert_eq!(opts.cache_window(Duration::from_millis(1)), Duration::from_millis(50));
        assert_eq!(opts.cache_window(Duration::from_millis(40)), Duration::from_millis(80));

        let opts = opts.with_cache_window_factor(3).with_min_cache_window(Duration::ZERO);
        assert_eq!(opts.cache_window(Duration::from_millis(10)), Duration::from_millis(30));
    }
}
