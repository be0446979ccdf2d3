// ============================================================================
// spark-reactor - ReactiveVec
// A Vec with fine-grained per-index reactivity
// ============================================================================

use std::fmt;
use std::slice::Iter;

use crate::primitives::signal::Source;
use crate::runtime::Runtime;

// =============================================================================
// REACTIVE VEC
// =============================================================================

/// A reactive Vec with per-index granularity.
///
/// Three levels of reactivity:
/// 1. Per-index counters: `vec.get(i)` tracks only that index
/// 2. Version: any change at all, for iteration
/// 3. Length: the number of elements, kept in sync by every write
///
/// Index counters are never dropped, so a reader of an index past the end
/// sees a later push that fills it.
///
/// # Example
///
/// ```
/// use spark_reactor::{ReactiveVec, Runtime};
///
/// let rt = Runtime::new();
/// let mut items = ReactiveVec::new(&rt);
/// items.push("first");
/// items.push("second");
///
/// assert_eq!(items.get(0), Some(&"first"));
/// assert_eq!(items.len(), 2);
///
/// items.set(0, "updated");
/// assert_eq!(items.get(0), Some(&"updated"));
/// ```
pub struct ReactiveVec<T> {
    data: Vec<T>,

    /// One change counter per index that has ever held an element
    slots: Vec<Source<u64>>,

    version: Source<u64>,
    length: Source<usize>,
    rt: Runtime,
}

impl<T: 'static> ReactiveVec<T> {
    pub fn new(rt: &Runtime) -> Self {
        Self::from_iter(rt, [])
    }

    pub fn from_iter<I: IntoIterator<Item = T>>(rt: &Runtime, iter: I) -> Self {
        let data: Vec<T> = iter.into_iter().collect();
        let slots = (0..data.len()).map(|_| rt.source(0)).collect();
        Self {
            length: rt.source(data.len()),
            data,
            slots,
            version: rt.source(0),
            rt: rt.clone(),
        }
    }

    fn bump(counter: &Source<u64>) {
        counter.update(|v| *v += 1);
    }

    fn grow_slots(&mut self) {
        while self.slots.len() < self.data.len() {
            self.slots.push(self.rt.source(0));
        }
    }

    /// Notify readers of every index from `start`, including vacated ones.
    fn notify_from(&self, start: usize) {
        for counter in self.slots.iter().skip(start) {
            Self::bump(counter);
        }
    }

    fn finish_write(&self) {
        self.length.set(self.data.len());
        Self::bump(&self.version);
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Number of elements. Tracks the length.
    pub fn len(&self) -> usize {
        self.length.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tracks the index if it has ever held an element, otherwise the version.
    pub fn get(&self, index: usize) -> Option<&T> {
        match self.slots.get(index) {
            Some(counter) => {
                counter.get();
            }
            None => {
                self.version.get();
            }
        }
        self.data.get(index)
    }

    pub fn first(&self) -> Option<&T> {
        self.get(0)
    }

    /// Tracks the length and then the last index.
    pub fn last(&self) -> Option<&T> {
        match self.len() {
            0 => None,
            n => self.get(n - 1),
        }
    }

    /// Iterate elements. Tracks the version.
    pub fn iter(&self) -> Iter<'_, T> {
        self.version.get();
        self.data.iter()
    }

    /// The underlying data, untracked.
    pub fn raw(&self) -> &[T] {
        &self.data
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Write at `index`, returning the replaced value. Writing at `len()`
    /// appends. An equal value is not written and notifies nobody.
    ///
    /// # Panics
    /// Panics if `index > len`.
    pub fn set(&mut self, index: usize, value: T) -> Option<T>
    where
        T: PartialEq,
    {
        if index == self.data.len() {
            self.push(value);
            return None;
        }
        if self.data[index] == value {
            return None;
        }
        let old = std::mem::replace(&mut self.data[index], value);
        Self::bump(&self.slots[index]);
        Self::bump(&self.version);
        Some(old)
    }

    pub fn push(&mut self, value: T) {
        self.data.push(value);
        self.grow_slots();
        Self::bump(&self.slots[self.data.len() - 1]);
        self.finish_write();
    }

    pub fn pop(&mut self) -> Option<T> {
        let value = self.data.pop()?;
        self.notify_from(self.data.len());
        self.finish_write();
        Some(value)
    }

    /// Insert at `index`, shifting later elements right.
    ///
    /// # Panics
    /// Panics if `index > len`.
    pub fn insert(&mut self, index: usize, value: T) {
        self.data.insert(index, value);
        self.grow_slots();
        self.notify_from(index);
        self.finish_write();
    }

    /// Remove at `index`, shifting later elements left.
    ///
    /// # Panics
    /// Panics if `index >= len`.
    pub fn remove(&mut self, index: usize) -> T {
        let value = self.data.remove(index);
        self.notify_from(index);
        self.finish_write();
        value
    }

    /// Shorten to `len` elements. No-op if already that short.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.data.len() {
            return;
        }
        self.data.truncate(len);
        self.notify_from(len);
        self.finish_write();
    }

    pub fn clear(&mut self) {
        self.truncate(0);
    }
}

impl<T: fmt::Debug> fmt::Debug for ReactiveVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveVec")
            .field("data", &self.data)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
