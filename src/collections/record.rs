// ============================================================================
// spark-reactor - ReactiveRecord
// Lazily created per-key sources over a shared, keyed record
// ============================================================================
//
// Each key observed (or written) gets its own Source<Option<V>>; `None` marks
// an absent key. Deleting a key writes `None` rather than dropping its
// source, so a reader of a deleted key still sees it come back. A separate
// version source changes whenever the key set changes.
// ============================================================================

use std::cell::RefCell;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::primitives::signal::Source;
use crate::runtime::Runtime;

struct RecordInner<K, V: 'static> {
    rt: Runtime,
    entries: RefCell<IndexMap<K, Source<Option<V>>>>,
    version: Source<u64>,
}

/// A keyed record whose reads are tracked per key.
///
/// Cloning shares the record. All operations take `&self`.
///
/// # Example
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use spark_reactor::{ReactiveRecord, Runtime};
///
/// let rt = Runtime::new();
/// let user = ReactiveRecord::new(&rt);
/// user.insert("name", String::from("Ada"));
///
/// let seen = Rc::new(Cell::new(0));
/// let (u, s) = (user.clone(), seen.clone());
/// let _fx = rt.effect(move || {
///     u.get(&"name");
///     s.set(s.get() + 1);
/// });
///
/// user.insert("email", String::from("ada@example.com"));
/// rt.tick().unwrap();
/// assert_eq!(seen.get(), 1);
/// ```
pub struct ReactiveRecord<K, V: 'static> {
    inner: Rc<RecordInner<K, V>>,
}

impl<K, V> Clone for ReactiveRecord<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Records compare by identity, so one can be stored as a value in another.
impl<K, V> PartialEq for ReactiveRecord<K, V> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<K, V> ReactiveRecord<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    pub fn new(rt: &Runtime) -> Self {
        Self {
            inner: Rc::new(RecordInner {
                rt: rt.clone(),
                entries: RefCell::new(IndexMap::new()),
                version: rt.source(0),
            }),
        }
    }

    pub fn from_iter<I: IntoIterator<Item = (K, V)>>(rt: &Runtime, iter: I) -> Self {
        let record = Self::new(rt);
        {
            let mut entries = record.inner.entries.borrow_mut();
            for (key, value) in iter {
                entries.insert(key, rt.source(Some(value)));
            }
        }
        record
    }

    fn existing(&self, key: &K) -> Option<Source<Option<V>>> {
        self.inner.entries.borrow().get(key).cloned()
    }

    /// The source for `key`, created absent if the read is being tracked.
    fn observe(&self, key: &K) -> Option<Source<Option<V>>> {
        if let Some(source) = self.existing(key) {
            return Some(source);
        }
        if !self.inner.rt.is_tracking() {
            return None;
        }
        let source = self.inner.rt.source(None);
        self.inner
            .entries
            .borrow_mut()
            .insert(key.clone(), source.clone());
        Some(source)
    }

    /// Read one key, tracking that key only.
    pub fn get(&self, key: &K) -> Option<V> {
        self.observe(key).and_then(|source| source.get())
    }

    /// Whether `key` is present, tracking that key only.
    pub fn has(&self, key: &K) -> bool {
        self.observe(key)
            .is_some_and(|source| source.with(Option::is_some))
    }

    /// Write one key. Returns the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let source = match self.existing(&key) {
            Some(source) => source,
            None => {
                let source = self.inner.rt.source(None);
                self.inner
                    .entries
                    .borrow_mut()
                    .insert(key, source.clone());
                source
            }
        };
        let previous = source.peek();
        source.set(Some(value));
        if previous.is_none() {
            self.bump_version();
        }
        previous
    }

    /// Delete one key. Returns the removed value.
    pub fn remove(&self, key: &K) -> Option<V> {
        let source = self.existing(key)?;
        let previous = source.peek()?;
        source.set(None);
        self.bump_version();
        Some(previous)
    }

    /// Present keys in first-insertion order. Tracks the key set.
    pub fn keys(&self) -> Vec<K> {
        self.inner.version.get();
        self.inner
            .entries
            .borrow()
            .iter()
            .filter(|(_, source)| source.peek().is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of present keys. Tracks the key set.
    pub fn len(&self) -> usize {
        self.inner.version.get();
        self.inner
            .entries
            .borrow()
            .values()
            .filter(|source| source.peek().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of per-key sources, absent keys included.
    pub fn source_count(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    fn bump_version(&self) {
        self.inner.version.update(|v| *v += 1);
    }
}

impl<K: fmt::Debug, V: fmt::Debug + Clone + 'static> fmt::Debug for ReactiveRecord<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.inner.entries.borrow();
        f.debug_map()
            .entries(
                entries
                    .iter()
                    .filter_map(|(k, source)| source.peek().map(|v| (k, v))),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn absent_key_becomes_present() {
        let rt = Runtime::new();
        let record: ReactiveRecord<&str, i32> = ReactiveRecord::new(&rt);
        let seen = Rc::new(Cell::new(None));

        let (r, s) = (record.clone(), seen.clone());
        let _fx = rt.effect(move || s.set(r.get(&"x")));
        assert_eq!(seen.get(), None);
        assert_eq!(record.source_count(), 1, "tracked read created the key");

        record.insert("x", 3);
        rt.tick().unwrap();
        assert_eq!(seen.get(), Some(3));

        record.remove(&"x");
        rt.tick().unwrap();
        assert_eq!(seen.get(), None);
        assert_eq!(record.source_count(), 1, "deletion keeps the source");
    }

    #[test]
    fn untracked_reads_do_not_allocate() {
        let rt = Runtime::new();
        let record: ReactiveRecord<u32, u32> = ReactiveRecord::new(&rt);
        assert!(!record.has(&1));
        assert_eq!(record.get(&1), None);
        assert_eq!(record.source_count(), 0);
    }

    #[test]
    fn keys_follow_structure_only() {
        let rt = Runtime::new();
        let record = ReactiveRecord::from_iter(&rt, [("a", 1), ("b", 2)]);
        let runs = Rc::new(Cell::new(0));

        let (r, n) = (record.clone(), runs.clone());
        let _fx = rt.effect(move || {
            r.keys();
            n.set(n.get() + 1);
        });

        record.insert("a", 10);
        rt.tick().unwrap();
        assert_eq!(runs.get(), 1, "value change is not a key-set change");

        record.insert("c", 3);
        rt.tick().unwrap();
        assert_eq!(runs.get(), 2);
        assert_eq!(record.keys(), vec!["a", "b", "c"]);
        assert_eq!(record.len(), 3);
    }
}
