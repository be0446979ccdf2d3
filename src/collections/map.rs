// ============================================================================
// spark-reactor - ReactiveMap
// A HashMap with fine-grained per-key reactivity
// ============================================================================

use std::borrow::Borrow;
use std::collections::HashMap;
use std::collections::hash_map::Iter;
use std::fmt;
use std::hash::Hash;

use crate::primitives::signal::Source;
use crate::runtime::Runtime;

// =============================================================================
// REACTIVE MAP
// =============================================================================

/// A reactive HashMap with per-key granularity.
///
/// Three levels of reactivity:
/// 1. Per-key counters: `map.get(&k)` tracks only that key once it is known.
///    A counter outlives removal of its key.
/// 2. Version: structural changes (insert of a new key, remove, clear)
/// 3. Size: the number of entries
///
/// Mutations take `&mut self`; share the map through your own `Rc<RefCell<_>>`
/// if several closures need to write it.
///
/// # Example
///
/// ```
/// use spark_reactor::{ReactiveMap, Runtime};
///
/// let rt = Runtime::new();
/// let mut ages: ReactiveMap<&str, u32> = ReactiveMap::new(&rt);
/// ages.insert("alice", 25);
/// ages.insert("bob", 30);
///
/// assert_eq!(ages.get("alice"), Some(&25));
/// assert_eq!(ages.len(), 2);
/// ```
pub struct ReactiveMap<K, V>
where
    K: Eq + Hash + Clone + 'static,
{
    data: HashMap<K, V>,

    /// Change counter per key, bumped whenever that key's value changes.
    /// Every key ever present has one.
    key_versions: HashMap<K, Source<u64>>,

    version: Source<u64>,
    size: Source<usize>,
    rt: Runtime,
}

impl<K, V> ReactiveMap<K, V>
where
    K: Eq + Hash + Clone + 'static,
{
    pub fn new(rt: &Runtime) -> Self {
        Self::from_iter(rt, [])
    }

    pub fn from_iter<I: IntoIterator<Item = (K, V)>>(rt: &Runtime, iter: I) -> Self {
        let data: HashMap<K, V> = iter.into_iter().collect();
        let len = data.len();
        let key_versions = data.keys().map(|k| (k.clone(), rt.source(0))).collect();
        Self {
            data,
            key_versions,
            version: rt.source(0),
            size: rt.source(len),
            rt: rt.clone(),
        }
    }

    fn bump(counter: &Source<u64>) {
        counter.update(|v| *v += 1);
    }

    fn key_version(&mut self, key: &K) -> Source<u64> {
        let rt = &self.rt;
        self.key_versions
            .entry(key.clone())
            .or_insert_with(|| rt.source(0))
            .clone()
    }

    fn structural_change(&self) {
        self.size.set(self.data.len());
        Self::bump(&self.version);
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Number of entries. Tracks the size.
    pub fn len(&self) -> usize {
        self.size.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tracks the key if it has a counter, otherwise the version (so a later
    /// insert of this key is seen).
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.track_key(key);
        self.data.contains_key(key)
    }

    /// Same tracking as `contains_key`.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.track_key(key);
        self.data.get(key)
    }

    fn track_key<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.key_versions.get(key) {
            Some(counter) => {
                counter.get();
            }
            None => {
                self.version.get();
            }
        }
    }

    /// Iterate entries. Tracks the version and every present key.
    pub fn iter(&self) -> Iter<'_, K, V> {
        self.version.get();
        for key in self.data.keys() {
            self.track_key(key);
        }
        self.data.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }

    /// The underlying data, untracked.
    pub fn raw(&self) -> &HashMap<K, V> {
        &self.data
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Insert or replace. Dependents of the key rerun only if the value
    /// changed; a new key also bumps size and version.
    pub fn insert(&mut self, key: K, value: V) -> Option<V>
    where
        V: PartialEq,
    {
        let counter = self.key_version(&key);
        let changed = self.data.get(&key).is_none_or(|current| *current != value);
        let old = self.data.insert(key, value);
        if changed {
            Self::bump(&counter);
        }
        if old.is_none() {
            self.structural_change();
        }
        old
    }

    /// Remove a key. Bumps its counter, the size and the version.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let value = self.data.remove(key)?;
        if let Some(counter) = self.key_versions.get(key) {
            Self::bump(&counter);
        }
        self.structural_change();
        Some(value)
    }

    pub fn clear(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.data.clear();
        for counter in self.key_versions.values() {
            Self::bump(counter);
        }
        self.structural_change();
    }
}

impl<K, V> fmt::Debug for ReactiveMap<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + 'static,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveMap")
            .field("data", &self.data)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::{ReactiveMap, Runtime};

    #[test]
    fn insert_get_remove() {
        let rt = Runtime::new();
        let mut map: ReactiveMap<String, i32> = ReactiveMap::new(&rt);

        assert_eq!(map.insert("a".into(), 1), None);
        assert_eq!(map.insert("a".into(), 2), Some(1));
        assert_eq!(map.get("a"), Some(&2));
        assert_eq!(map.len(), 1);

        assert_eq!(map.remove("a"), Some(2));
        assert_eq!(map.remove("a"), None);
        assert!(map.is_empty());
    }

    #[test]
    fn per_key_granularity() {
        let rt = Runtime::new();
        let map = Rc::new(RefCell::new(ReactiveMap::new(&rt)));
        map.borrow_mut().insert("a", 1);
        map.borrow_mut().insert("b", 2);

        let runs = Rc::new(Cell::new(0));
        let (m, r) = (map.clone(), runs.clone());
        let _fx = rt.effect(move || {
            m.borrow().get("a");
            r.set(r.get() + 1);
        });

        map.borrow_mut().insert("b", 20);
        rt.tick().unwrap();
        assert_eq!(runs.get(), 1);

        map.borrow_mut().insert("a", 1);
        rt.tick().unwrap();
        assert_eq!(runs.get(), 1, "same value");

        map.borrow_mut().insert("a", 10);
        rt.tick().unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn missing_key_sees_later_insert() {
        let rt = Runtime::new();
        let map: Rc<RefCell<ReactiveMap<&str, i32>>> = Rc::new(RefCell::new(ReactiveMap::new(&rt)));
        let seen = Rc::new(Cell::new(None));

        let (m, s) = (map.clone(), seen.clone());
        let _fx = rt.effect(move || s.set(m.borrow().get("x").copied()));
        assert_eq!(seen.get(), None);

        map.borrow_mut().insert("x", 5);
        rt.tick().unwrap();
        assert_eq!(seen.get(), Some(5));
    }

    #[test]
    fn initial_keys_track_updates() {
        let rt = Runtime::new();
        let map = Rc::new(RefCell::new(ReactiveMap::from_iter(&rt, [("a", 1), ("b", 2)])));
        let seen = Rc::new(Cell::new(None));
        let runs = Rc::new(Cell::new(0));

        let (m, s, r) = (map.clone(), seen.clone(), runs.clone());
        let _fx = rt.effect(move || {
            s.set(m.borrow().get("a").copied());
            r.set(r.get() + 1);
        });

        map.borrow_mut().insert("a", 2);
        rt.tick().unwrap();
        assert_eq!(seen.get(), Some(2));

        map.borrow_mut().insert("b", 3);
        rt.tick().unwrap();
        assert_eq!(runs.get(), 2, "other keys stay independent");
    }

    #[test]
    fn key_reader_sees_remove_then_reinsert() {
        let rt = Runtime::new();
        let map = Rc::new(RefCell::new(ReactiveMap::new(&rt)));
        map.borrow_mut().insert("a", 1);
        map.borrow_mut().insert("b", 1);
        let seen = Rc::new(RefCell::new(Vec::new()));

        let (m, s) = (map.clone(), seen.clone());
        let _fx = rt.effect(move || s.borrow_mut().push(m.borrow().get("a").copied()));

        map.borrow_mut().remove("a");
        rt.tick().unwrap();
        map.borrow_mut().insert("a", 5);
        rt.tick().unwrap();
        map.borrow_mut().clear();
        rt.tick().unwrap();
        map.borrow_mut().insert("a", 6);
        rt.tick().unwrap();

        assert_eq!(*seen.borrow(), vec![Some(1), None, Some(5), None, Some(6)]);
    }

    #[test]
    fn iteration_sees_value_changes() {
        let rt = Runtime::new();
        let map = Rc::new(RefCell::new(ReactiveMap::from_iter(&rt, [("a", 1), ("b", 2)])));
        let total = Rc::new(Cell::new(0));

        let (m, t) = (map.clone(), total.clone());
        let _fx = rt.effect(move || t.set(m.borrow().values().sum::<i32>()));
        assert_eq!(total.get(), 3);

        map.borrow_mut().insert("b", 5);
        rt.tick().unwrap();
        assert_eq!(total.get(), 6);
    }

    #[test]
    fn clear_notifies_size() {
        let rt = Runtime::new();
        let map = Rc::new(RefCell::new(ReactiveMap::from_iter(&rt, [(1, 'a'), (2, 'b')])));
        let size = Rc::new(Cell::new(0));

        let (m, s) = (map.clone(), size.clone());
        let _fx = rt.effect(move || s.set(m.borrow().len()));
        assert_eq!(size.get(), 2);

        map.borrow_mut().clear();
        rt.tick().unwrap();
        assert_eq!(size.get(), 0);
    }
}
