use std::cmp::Ordering;
use std::fmt;

use crate::SkipTreeMap;

/// A lock-free concurrent ordered set.
///
/// This is a thin wrapper over a [`SkipTreeMap`] configured with a value
/// proxy, so members cost no value storage at all. Like the map, the set is
/// `Send` but not `Sync`: clone the handle to share it between threads.
///
/// # Examples
///
/// ```
/// let set = skip_tree::SkipTreeSet::<u64>::default();
///
/// assert!(set.insert(2));
/// assert!(set.insert(1));
/// assert!(!set.insert(2));
///
/// assert!(set.contains(&1));
/// assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 2]);
/// assert_eq!(set.pop_first(), Some(1));
/// ```
pub struct SkipTreeSet<K>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    map: SkipTreeMap<K, ()>,
}

impl<K> Clone for SkipTreeSet<K>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    fn clone(&self) -> SkipTreeSet<K> {
        SkipTreeSet {
            map: self.map.clone(),
        }
    }
}

impl<K> Default for SkipTreeSet<K>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    fn default() -> SkipTreeSet<K> {
        SkipTreeSet {
            map: SkipTreeMap::with_value_proxy(()),
        }
    }
}

impl<K> fmt::Debug for SkipTreeSet<K>
where
    K: 'static + fmt::Debug + Clone + Ord + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SkipTreeSet ")?;
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<K> FromIterator<K> for SkipTreeSet<K>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let set = SkipTreeSet::default();
        for key in iter {
            set.insert(key);
        }
        set
    }
}

impl<K> SkipTreeSet<K>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    /// Creates a new empty set ordered by `Ord`.
    pub fn new() -> SkipTreeSet<K> {
        SkipTreeSet::default()
    }

    /// Creates a new empty set ordered by the provided total ordering.
    pub fn with_comparator(
        comparator: impl Fn(&K, &K) -> Ordering + Send + Sync + 'static,
    ) -> SkipTreeSet<K> {
        let map = SkipTreeMap::with_comparator(comparator);
        SkipTreeSet { map }
    }

    /// Adds a member, returning whether it was newly inserted.
    pub fn insert(&self, key: K) -> bool {
        self.map.insert_if_absent(key, ()).is_none()
    }

    /// Removes a member, returning whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        self.map.remove(key).is_some()
    }

    /// Whether the set contains `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// The smallest member.
    pub fn first(&self) -> Option<K> {
        self.map.first_key()
    }

    /// The largest member.
    pub fn last(&self) -> Option<K> {
        self.map.last_key()
    }

    /// Atomically removes and returns the smallest member.
    pub fn pop_first(&self) -> Option<K> {
        self.map.pop_first().map(|(k, ())| k)
    }

    /// Atomically removes and returns the largest member.
    pub fn pop_last(&self) -> Option<K> {
        self.map.pop_last().map(|(k, ())| k)
    }

    /// The greatest member strictly less than `key`.
    pub fn get_lt(&self, key: &K) -> Option<K> {
        self.map.get_lt(key).map(|(k, ())| k)
    }

    /// The greatest member at most `key`.
    pub fn get_lte(&self, key: &K) -> Option<K> {
        self.map.get_lte(key).map(|(k, ())| k)
    }

    /// The least member strictly greater than `key`.
    pub fn get_gt(&self, key: &K) -> Option<K> {
        self.map.get_gt(key).map(|(k, ())| k)
    }

    /// The least member at least `key`.
    pub fn get_gte(&self, key: &K) -> Option<K> {
        self.map.get_gte(key).map(|(k, ())| k)
    }

    /// The number of members, by scanning the leaf level.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the set has no members.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Removes all members.
    pub fn clear(&self) {
        self.map.clear()
    }

    /// Iterate over the members in ascending order, weakly consistently.
    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        self.map.keys()
    }
}

#[test]
fn basic_set() {
    let set = SkipTreeSet::<u32>::default();

    for i in (0..100).rev() {
        assert!(set.insert(i));
    }
    for i in 0..100 {
        assert!(!set.insert(i));
        assert!(set.contains(&i));
    }

    assert_eq!(set.len(), 100);
    assert_eq!(set.first(), Some(0));
    assert_eq!(set.last(), Some(99));
    assert_eq!(set.get_gt(&10), Some(11));
    assert_eq!(set.get_lt(&0), None);

    let members: Vec<u32> = set.iter().collect();
    assert_eq!(members, (0..100).collect::<Vec<u32>>());

    assert_eq!(set.pop_first(), Some(0));
    assert_eq!(set.pop_last(), Some(99));
    assert!(set.remove(&50));
    assert!(!set.remove(&50));
    assert_eq!(set.len(), 97);

    set.clear();
    assert!(set.is_empty());
}
