// ============================================================================
// spark-reactor - ReactiveSet
// A HashSet with fine-grained per-item reactivity
// ============================================================================

use std::borrow::Borrow;
use std::collections::hash_set::Iter;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use crate::primitives::signal::Source;
use crate::runtime::Runtime;

/// A reactive HashSet with per-item granularity.
///
/// Membership of an item is a `Source<bool>`, created the first time that
/// item is inserted. `contains` tracks it when it exists and the version
/// otherwise. Iteration tracks the version; `len` tracks the size.
///
/// # Example
///
/// ```
/// use spark_reactor::{ReactiveSet, Runtime};
///
/// let rt = Runtime::new();
/// let mut tags = ReactiveSet::new(&rt);
/// assert!(tags.insert("todo"));
/// assert!(!tags.insert("todo"));
/// assert!(tags.contains("todo"));
/// assert_eq!(tags.len(), 1);
/// ```
pub struct ReactiveSet<T>
where
    T: Eq + Hash + Clone + 'static,
{
    data: HashSet<T>,
    members: HashMap<T, Source<bool>>,
    version: Source<u64>,
    size: Source<usize>,
}

impl<T> ReactiveSet<T>
where
    T: Eq + Hash + Clone + 'static,
{
    pub fn new(rt: &Runtime) -> Self {
        Self::from_iter(rt, [])
    }

    pub fn from_iter<I: IntoIterator<Item = T>>(rt: &Runtime, iter: I) -> Self {
        let data: HashSet<T> = iter.into_iter().collect();
        let members = data.iter().map(|item| (item.clone(), rt.source(true))).collect();
        let len = data.len();
        Self {
            data,
            members,
            version: rt.source(0),
            size: rt.source(len),
        }
    }

    fn structural_change(&self) {
        self.size.set(self.data.len());
        self.version.update(|v| *v += 1);
    }

    pub fn len(&self) -> usize {
        self.size.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains<Q>(&self, item: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.members.get(item) {
            Some(member) => member.get(),
            None => {
                self.version.get();
                false
            }
        }
    }

    pub fn iter(&self) -> Iter<'_, T> {
        self.version.get();
        self.data.iter()
    }

    /// Add an item. Returns whether it was new.
    pub fn insert(&mut self, item: T) -> bool {
        if !self.data.insert(item.clone()) {
            return false;
        }
        let size = &self.size;
        match self.members.get(&item) {
            Some(member) => {
                member.set(true);
            }
            None => {
                let member = size.runtime().source(true);
                self.members.insert(item, member);
            }
        }
        self.structural_change();
        true
    }

    /// Remove an item. Returns whether it was present.
    ///
    /// The membership source is kept so readers of this item see a later
    /// re-insert.
    pub fn remove<Q>(&mut self, item: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if !self.data.remove(item) {
            return false;
        }
        if let Some(member) = self.members.get(item) {
            member.set(false);
        }
        self.structural_change();
        true
    }

    pub fn clear(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.data.clear();
        for member in self.members.values() {
            member.set(false);
        }
        self.structural_change();
    }

    /// The underlying data, untracked.
    pub fn raw(&self) -> &HashSet<T> {
        &self.data
    }
}

impl<T> fmt::Debug for ReactiveSet<T>
where
    T: Eq + Hash + Clone + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.data.iter()).finish()
    }
}
