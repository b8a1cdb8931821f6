#![cfg_attr(
    test,
    deny(
        missing_docs,
        future_incompatible,
        nonstandard_style,
        rust_2018_idioms,
        unused_qualifications,
    )
)]
#![cfg_attr(
    test,
    deny(
        clippy::cast_lossless,
        clippy::decimal_literal_representation,
        clippy::explicit_into_iter_loop,
        clippy::explicit_iter_loop,
        clippy::fallible_impl_from,
        clippy::filter_map_next,
        clippy::manual_find_map,
        clippy::map_flatten,
        clippy::maybe_infinite_iter,
        clippy::mem_forget,
        clippy::needless_continue,
        clippy::string_add,
        clippy::string_add_assign,
        clippy::unicode_not_nfc,
        clippy::unimplemented,
        clippy::unseparated_literal_suffix,
        clippy::wildcard_dependencies,
    )
)]

//! A lock-free concurrent skip tree: an ordered map in the same family as a
//! skip list, but cache-conscious. Where a skip list stacks towers of
//! single-key links, the skip tree stacks linked lists of *multi-key* nodes,
//! so a descent touches a handful of small sorted arrays instead of a long
//! pointer chain.
//!
//! Every node holds exactly one atomic slot with an immutable snapshot of
//! its keys, values (in leaves), child pointers (in routers), and its right
//! sibling link. All mutation is compare-and-swap of whole snapshots, and
//! readers that race with a structural change simply chase right links until
//! they land on the node that covers their key. Stale routing left behind by
//! splits and removals is repaired cooperatively: every writer performs a
//! bounded amount of neighbor cleaning on its way down, so no background
//! maintenance thread is needed.
//!
//! Note that this structure is `Send` but NOT `Sync`, despite being a
//! lock-free tree. The inner reclamation system, provided by the `ebr`
//! crate, avoids atomic operations in its hot path by keeping per-handle
//! state. To share a [`SkipTreeMap`] between threads, clone it; each clone
//! also carries its own seed for the geometric level generator.
//!
//! Iterators are weakly consistent: they observe every key that was present
//! for the whole lifetime of the iterator, may or may not observe concurrent
//! insertions and removals, and never fail.
//!
//! `get` returns a cloned value rather than a reference, so that no lock
//! needs to be held across the call; wrap expensive values in an `Arc` if
//! cloning is a concern.

use std::cell::Cell;
use std::cmp::Ordering;
use std::fmt;
use std::sync::{
    atomic::{
        AtomicPtr,
        Ordering::{AcqRel, Acquire, Release},
    },
    Arc,
};

use ebr::{Ebr, Guard};

mod node;
mod registry;
mod set;
mod submap;

#[cfg(feature = "serde")]
mod serde;

pub use set::SkipTreeSet;
pub use submap::{SubIter, SubMap};

use node::{
    insert_at, left_of, remove_at, right_of, Contents, Deferred, HeadNode, Item, NodeRef,
    SearchResults,
};
use registry::NodeRegistry;

#[cfg(not(feature = "fault_injection"))]
#[inline]
const fn debug_delay() -> bool {
    false
}

/// This function is useful for inducing random jitter into
/// our atomic operations, shaking out more possible
/// interleavings quickly. It gets fully eliminated by the
/// compiler in non-test code.
#[cfg(feature = "fault_injection")]
fn debug_delay() -> bool {
    use std::thread;

    use rand::{thread_rng, Rng};

    let mut rng = thread_rng();

    match rng.gen_range(0..100) {
        0..=98 => false,
        _ => {
            thread::yield_now();
            true
        }
    }
}

// log2 of the average node length. Node lengths are not bounded by this; it
// parameterizes the geometric level distribution and the bulk loader, so
// that nodes average out at AVG_LENGTH keys.
const LOG_AVG_LENGTH: usize = 5;
const AVG_LENGTH: usize = 1 << LOG_AVG_LENGTH;
const AVG_LENGTH_MASK: u32 = (AVG_LENGTH - 1) as u32;

pub(crate) const LOCAL_GC_BUFFER_SIZE: usize = 128;

pub(crate) type MapEbr<K, V> = Ebr<Deferred<K, V>, LOCAL_GC_BUFFER_SIZE>;
pub(crate) type MapGuard<'a, K, V> = Guard<'a, Deferred<K, V>, LOCAL_GC_BUFFER_SIZE>;

pub(crate) type KeyComparator<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

// Relations for nearest-neighbor searches, OR'ed together. GT is implicit:
// it is checked as "not LT".
pub(crate) const EQ: u8 = 1;
pub(crate) const LT: u8 = 2;
pub(crate) const GT: u8 = 0;

fn random_seed() -> u32 {
    // the xor-shift generator degenerates on a zero seed
    rand::random::<u32>() | 0x100
}

/// A lock-free concurrent ordered map built on a skip tree.
///
/// Keys are ordered by `Ord`, or by a comparator supplied at construction
/// time with [`SkipTreeMap::with_comparator`]. Lookups, insertions,
/// removals, and nearest-neighbor queries all run in expected logarithmic
/// time without ever blocking, and may be performed from many threads at
/// once by cloning the handle.
///
/// # Examples
///
/// ```
/// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
///
/// // insert and remove atomically return the previous value,
/// // if it was set, similarly to a BTreeMap
/// assert_eq!(map.insert(1, 10), None);
/// assert_eq!(map.insert(1, 11), Some(10));
/// assert_eq!(map.remove(&1), Some(11));
///
/// map.insert(2, 20);
/// map.insert(4, 40);
///
/// // navigable queries
/// assert_eq!(map.get_gte(&3), Some((4, 40)));
/// assert_eq!(map.get_lt(&3), Some((2, 20)));
/// assert_eq!(map.first_key_value(), Some((2, 20)));
///
/// // ordered iteration
/// let entries: Vec<_> = map.iter().collect();
/// assert_eq!(entries, vec![(2, 20), (4, 40)]);
/// ```
pub struct SkipTreeMap<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    // epoch-based reclamation
    ebr: MapEbr<K, V>,
    // the tree structure, shared by all clones of this handle
    inner: Arc<Inner<K, V>>,
    // seed for the per-handle xor-shift level generator; torn updates would
    // not matter, but sharing one seed across threads would contend
    seed: Cell<u32>,
}

impl<K, V> Clone for SkipTreeMap<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    fn clone(&self) -> SkipTreeMap<K, V> {
        SkipTreeMap {
            ebr: self.ebr.clone(),
            inner: self.inner.clone(),
            seed: Cell::new(random_seed()),
        }
    }
}

impl<K, V> Default for SkipTreeMap<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    fn default() -> SkipTreeMap<K, V> {
        SkipTreeMap::with_config(None, None)
    }
}

impl<K, V> fmt::Debug for SkipTreeMap<K, V>
where
    K: 'static + fmt::Debug + Clone + Ord + Send + Sync,
    V: 'static + fmt::Debug + Clone + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SkipTreeMap ")?;
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> PartialEq for SkipTreeMap<K, V>
where
    K: 'static + Clone + Ord + Send + Sync + PartialEq,
    V: 'static + Clone + Send + Sync + PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        let literally_the_same = Arc::as_ptr(&self.inner) == Arc::as_ptr(&other.inner);
        if literally_the_same {
            return true;
        }

        let self_iter = self.iter();
        let mut other_iter = other.iter();

        for self_kv in self_iter {
            let other_kv = other_iter.next();
            if !Some(self_kv).eq(&other_kv) {
                return false;
            }
        }

        other_iter.next().is_none()
    }
}

impl<K, V> FromIterator<(K, V)> for SkipTreeMap<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = SkipTreeMap::default();

        for (k, v) in iter {
            map.insert(k, v);
        }

        map
    }
}

impl<'a, K, V> IntoIterator for &'a SkipTreeMap<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V> SkipTreeMap<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    /// Creates a new empty `SkipTreeMap` ordered by `Ord`.
    ///
    /// # Examples
    /// ```
    /// use skip_tree::SkipTreeMap;
    ///
    /// let map: SkipTreeMap<u64, String> = SkipTreeMap::new();
    /// assert!(map.is_empty());
    /// ```
    pub fn new() -> SkipTreeMap<K, V> {
        SkipTreeMap::default()
    }

    /// Creates a new empty map whose keys are ordered by the provided total
    /// ordering instead of `Ord`.
    ///
    /// # Examples
    /// ```
    /// let map = skip_tree::SkipTreeMap::<i32, i32>::with_comparator(|a, b| b.cmp(a));
    ///
    /// map.insert(1, 1);
    /// map.insert(2, 2);
    /// map.insert(3, 3);
    ///
    /// // the comparator reverses the order, so 3 is now first
    /// assert_eq!(map.first_key_value(), Some((3, 3)));
    /// ```
    pub fn with_comparator(
        comparator: impl Fn(&K, &K) -> Ordering + Send + Sync + 'static,
    ) -> SkipTreeMap<K, V> {
        SkipTreeMap::with_config(Some(Arc::new(comparator)), None)
    }

    /// Creates a new empty map that stores no per-entry values at all, and
    /// instead returns a clone of `proxy` wherever a stored value would be
    /// returned. This turns the map into an ordered set without paying for
    /// value storage; [`SkipTreeSet`] is a thin wrapper over this mode.
    pub fn with_value_proxy(proxy: V) -> SkipTreeMap<K, V> {
        SkipTreeMap::with_config(None, Some(proxy))
    }

    fn with_config(comparator: Option<KeyComparator<K>>, value_proxy: Option<V>) -> Self {
        SkipTreeMap {
            ebr: Ebr::default(),
            inner: Arc::new(Inner::new(comparator, value_proxy)),
            seed: Cell::new(random_seed()),
        }
    }

    /// Builds a map from entries that are already in ascending key order,
    /// laying out full leaves directly instead of performing a descent per
    /// key. A router key is raised for each completed leaf, so the result
    /// has the same steady-state shape as a map grown by insertion.
    ///
    /// # Examples
    /// ```
    /// let map = skip_tree::SkipTreeMap::from_sorted_iter((0..200_u32).map(|k| (k, k * 2)));
    ///
    /// assert_eq!(map.len(), 200);
    /// assert_eq!(map.get(&77), Some(154));
    /// let keys: Vec<u32> = map.iter().map(|(k, _v)| k).collect();
    /// assert_eq!(keys, (0..200).collect::<Vec<u32>>());
    /// ```
    pub fn from_sorted_iter(iter: impl IntoIterator<Item = (K, V)>) -> SkipTreeMap<K, V> {
        let map = SkipTreeMap::default();
        {
            let mut guard = map.ebr.pin();
            map.inner.extend_sorted(iter, &mut guard);
        }
        map
    }

    /// The average node length the level generator is tuned for. Nodes may
    /// temporarily grow past this between splits.
    pub fn expected_node_size(&self) -> usize {
        AVG_LENGTH
    }

    /// The comparator this map was constructed with, if any.
    pub fn comparator(&self) -> Option<&(dyn Fn(&K, &K) -> Ordering + Send + Sync)> {
        self.inner.comparator.as_deref()
    }

    /// Atomically get the value associated with this key.
    ///
    /// # Examples
    /// ```
    /// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
    ///
    /// map.insert(1, 1);
    ///
    /// assert_eq!(map.get(&0), None);
    /// assert_eq!(map.get(&1), Some(1));
    /// ```
    pub fn get(&self, key: &K) -> Option<V> {
        let guard = self.ebr.pin();
        let results = self.inner.lookup(key, &guard);
        if let Ok(index) = results.index {
            Some(self.inner.value_at(results.contents(), index))
        } else {
            None
        }
    }

    /// Returns `true` if the map contains the specified key.
    ///
    /// # Examples
    /// ```
    /// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
    ///
    /// map.insert(1, 1);
    ///
    /// assert!(map.contains_key(&1));
    /// assert!(!map.contains_key(&2));
    /// ```
    pub fn contains_key(&self, key: &K) -> bool {
        let guard = self.ebr.pin();
        self.inner.lookup(key, &guard).index.is_ok()
    }

    /// Returns `true` if some key maps to `value`. This scans the whole
    /// leaf level and takes time linear in the size of the map.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = self.ebr.pin();
        self.inner.contains_value(value, &guard)
    }

    /// Atomically insert a key-value pair, returning the previous value
    /// associated with this key if one existed.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
    ///
    /// assert_eq!(map.insert(1, 1), None);
    /// assert_eq!(map.insert(1, 2), Some(1));
    /// ```
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.do_put(key, value, false)
    }

    /// Insert only if the key has no current mapping. Returns the existing
    /// value if one was present, in which case the map is unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
    ///
    /// assert_eq!(map.insert_if_absent(1, 1), None);
    /// assert_eq!(map.insert_if_absent(1, 2), Some(1));
    /// assert_eq!(map.get(&1), Some(1));
    /// ```
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<V> {
        self.do_put(key, value, true)
    }

    fn do_put(&self, key: K, value: V, only_if_absent: bool) -> Option<V> {
        let mut guard = self.ebr.pin();
        let height = self.random_level();
        if height == 0 {
            let results = self.inner.descend_to_leaf(&key, false, &mut guard);
            self.inner
                .insert_leaf_level(&key, &value, results, only_if_absent, &mut guard)
        } else {
            let mut results: Vec<Option<SearchResults<K, V>>> = vec![None; height + 1];
            self.inner
                .descend_collecting(&key, height, &mut results, &mut guard);
            let previous = self.inner.begin_insert_one_level(
                &key,
                &value,
                &mut results,
                only_if_absent,
                &mut guard,
            );
            if previous.is_some() {
                return previous;
            }
            for level in 0..height {
                let right = self.inner.split_one_level(
                    &key,
                    results[level].expect("descent did not reach this level"),
                    &mut guard,
                );
                self.inner
                    .insert_one_level(&key, &mut results, right, level + 1, &mut guard);
            }
            None
        }
    }

    /// Unconditionally replace the value under an existing key, returning
    /// the previous value. The map is unchanged if the key is absent.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
    ///
    /// assert_eq!(map.replace(&1, 10), None);
    /// map.insert(1, 1);
    /// assert_eq!(map.replace(&1, 10), Some(1));
    /// assert_eq!(map.get(&1), Some(10));
    /// ```
    pub fn replace(&self, key: &K, value: V) -> Option<V> {
        let mut guard = self.ebr.pin();
        self.inner.do_replace(key, &|_| true, &value, &mut guard)
    }

    /// Replace the value under `key` only if it currently equals
    /// `expected`. Returns whether the replacement happened.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
    ///
    /// map.insert(1, 1);
    ///
    /// assert!(!map.replace_if(&1, &9, 10));
    /// assert!(map.replace_if(&1, &1, 10));
    /// assert_eq!(map.get(&1), Some(10));
    /// ```
    pub fn replace_if(&self, key: &K, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        let mut guard = self.ebr.pin();
        self.inner
            .do_replace(key, &|current| current == expected, &value, &mut guard)
            .is_some()
    }

    /// Atomically remove the value associated with this key, returning the
    /// previous value if one existed.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
    ///
    /// assert_eq!(map.remove(&1), None);
    /// assert_eq!(map.insert(1, 1), None);
    /// assert_eq!(map.remove(&1), Some(1));
    /// ```
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut guard = self.ebr.pin();
        self.inner.do_remove(key, None, &mut guard)
    }

    /// Remove the mapping only if its value currently equals `expected`.
    /// Returns whether a mapping was removed.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
    ///
    /// map.insert(1, 1);
    ///
    /// assert!(!map.remove_if(&1, &9));
    /// assert!(map.remove_if(&1, &1));
    /// assert_eq!(map.get(&1), None);
    /// ```
    pub fn remove_if(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let mut guard = self.ebr.pin();
        self.inner
            .do_remove(key, Some(&|current: &V| current == expected), &mut guard)
            .is_some()
    }

    /// Get the minimum entry stored in this map.
    pub fn first_key_value(&self) -> Option<(K, V)> {
        let guard = self.ebr.pin();
        let results = self.inner.find_first(&guard)?;
        Some(self.inner.entry_of(&results))
    }

    /// Get the minimum key stored in this map.
    pub fn first_key(&self) -> Option<K> {
        self.first_key_value().map(|(k, _v)| k)
    }

    /// Get the maximum entry stored in this map.
    pub fn last_key_value(&self) -> Option<(K, V)> {
        let guard = self.ebr.pin();
        let results = self.inner.find_last(&guard)?;
        Some(self.inner.entry_of(&results))
    }

    /// Get the maximum key stored in this map.
    pub fn last_key(&self) -> Option<K> {
        self.last_key_value().map(|(k, _v)| k)
    }

    /// Atomically remove and return the minimum entry.
    ///
    /// # Examples
    /// ```
    /// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
    ///
    /// map.insert(1, 1);
    /// map.insert(2, 2);
    ///
    /// assert_eq!(map.pop_first(), Some((1, 1)));
    /// assert_eq!(map.pop_first(), Some((2, 2)));
    /// assert_eq!(map.pop_first(), None);
    /// ```
    pub fn pop_first(&self) -> Option<(K, V)> {
        let mut guard = self.ebr.pin();
        self.inner.remove_first_entry(&mut guard)
    }

    /// Atomically remove and return the maximum entry.
    ///
    /// # Examples
    /// ```
    /// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
    ///
    /// map.insert(1, 1);
    /// map.insert(2, 2);
    ///
    /// assert_eq!(map.pop_last(), Some((2, 2)));
    /// assert_eq!(map.pop_last(), Some((1, 1)));
    /// assert_eq!(map.pop_last(), None);
    /// ```
    pub fn pop_last(&self) -> Option<(K, V)> {
        let mut guard = self.ebr.pin();
        self.inner.remove_last_entry(&mut guard)
    }

    /// Get the entry with the greatest key strictly less than the provided
    /// key.
    ///
    /// # Examples
    /// ```
    /// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
    ///
    /// map.insert(1, 1);
    ///
    /// assert_eq!(map.get_lt(&1), None);
    /// assert_eq!(map.get_lt(&2), Some((1, 1)));
    /// ```
    pub fn get_lt(&self, key: &K) -> Option<(K, V)> {
        let mut guard = self.ebr.pin();
        let results = self.inner.find_near(key, LT, &mut guard)?;
        Some(self.inner.entry_of(&results))
    }

    /// Get the entry with the greatest key less than or equal to the
    /// provided key.
    ///
    /// # Examples
    /// ```
    /// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
    ///
    /// map.insert(1, 1);
    ///
    /// assert_eq!(map.get_lte(&0), None);
    /// assert_eq!(map.get_lte(&1), Some((1, 1)));
    /// assert_eq!(map.get_lte(&2), Some((1, 1)));
    /// ```
    pub fn get_lte(&self, key: &K) -> Option<(K, V)> {
        let mut guard = self.ebr.pin();
        let results = self.inner.find_near(key, LT | EQ, &mut guard)?;
        Some(self.inner.entry_of(&results))
    }

    /// Get the entry with the least key strictly greater than the provided
    /// key.
    ///
    /// # Examples
    /// ```
    /// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
    ///
    /// map.insert(1, 1);
    ///
    /// assert_eq!(map.get_gt(&0), Some((1, 1)));
    /// assert_eq!(map.get_gt(&1), None);
    /// ```
    pub fn get_gt(&self, key: &K) -> Option<(K, V)> {
        let mut guard = self.ebr.pin();
        let results = self.inner.find_near(key, GT, &mut guard)?;
        Some(self.inner.entry_of(&results))
    }

    /// Get the entry with the least key greater than or equal to the
    /// provided key.
    ///
    /// # Examples
    /// ```
    /// let map = skip_tree::SkipTreeMap::<usize, usize>::default();
    ///
    /// map.insert(1, 1);
    ///
    /// assert_eq!(map.get_gte(&1), Some((1, 1)));
    /// assert_eq!(map.get_gte(&2), None);
    /// ```
    pub fn get_gte(&self, key: &K) -> Option<(K, V)> {
        let mut guard = self.ebr.pin();
        let results = self.inner.find_near(key, GT | EQ, &mut guard)?;
        Some(self.inner.entry_of(&results))
    }

    /// The number of entries in the map. This is not a constant-time
    /// operation: it scans the leaf level, compacting empty leading nodes
    /// out of the way as it goes.
    pub fn len(&self) -> usize {
        let guard = self.ebr.pin();
        self.inner.len(&guard)
    }

    /// Returns `true` if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        let guard = self.ebr.pin();
        self.inner.find_first(&guard).is_none()
    }

    /// Resets the map to empty. This is not atomic with respect to
    /// concurrent writers: an insert racing with `clear` may land in either
    /// the old or the new tree, and is lost in the former case.
    pub fn clear(&self) {
        let mut guard = self.ebr.pin();
        self.inner.clear(&mut guard);
    }

    /// Iterate over the map in ascending key order.
    ///
    /// The iterator is weakly consistent. It will observe every entry that
    /// was present for its entire lifetime, may or may not observe
    /// concurrent insertions and removals, and never fails. It holds an
    /// epoch guard, so the map cannot reclaim replaced memory until the
    /// iterator is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use skip_tree::SkipTreeMap;
    ///
    /// let data = vec![(1, "one"), (2, "two"), (3, "three")];
    ///
    /// let map: SkipTreeMap<i32, &'static str> = data.iter().copied().collect();
    ///
    /// let r: Vec<_> = map.iter().collect();
    ///
    /// assert_eq!(&data, &r);
    /// ```
    pub fn iter(&self) -> Iter<'_, K, V> {
        let guard = self.ebr.pin();
        let mut iter = Iter {
            inner: &self.inner,
            guard,
            position: None,
            index: 0,
            next_entry: None,
            previous: None,
        };
        if let Some(results) = iter.inner.find_first(&iter.guard) {
            let contents = results.contents();
            iter.position = Some((results.node, contents as *const Contents<K, V>));
            iter.next_entry = Some((
                contents.keys[0].key().clone(),
                iter.inner.value_at(contents, 0),
            ));
        }
        iter
    }

    /// Iterate over the keys of the map in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.iter().map(|(k, _v)| k)
    }

    /// Iterate over the values of the map in ascending key order.
    pub fn values(&self) -> impl Iterator<Item = V> + '_ {
        self.iter().map(|(_k, v)| v)
    }

    /// A bounded view of this map. The view rejects mutations outside its
    /// bounds, and all of its queries and iterators are clipped to the
    /// bounds.
    ///
    /// # Panics
    ///
    /// Panics if `lo` is greater than `hi`.
    ///
    /// # Examples
    ///
    /// ```
    /// use skip_tree::SkipTreeMap;
    ///
    /// let map: SkipTreeMap<i32, i32> = (0..10).map(|k| (k, k)).collect();
    ///
    /// let sub = map.sub_map(Some(2), true, Some(5), false);
    /// let keys: Vec<i32> = sub.iter().map(|(k, _v)| k).collect();
    /// assert_eq!(keys, vec![2, 3, 4]);
    /// ```
    pub fn sub_map(
        &self,
        lo: Option<K>,
        lo_inclusive: bool,
        hi: Option<K>,
        hi_inclusive: bool,
    ) -> SubMap<K, V> {
        SubMap::new(self.clone(), lo, lo_inclusive, hi, hi_inclusive, false)
    }

    /// A view of the entries with keys below `hi`.
    pub fn head_map(&self, hi: K, inclusive: bool) -> SubMap<K, V> {
        SubMap::new(self.clone(), None, false, Some(hi), inclusive, false)
    }

    /// A view of the entries with keys above `lo`.
    pub fn tail_map(&self, lo: K, inclusive: bool) -> SubMap<K, V> {
        SubMap::new(self.clone(), Some(lo), inclusive, None, false, false)
    }

    /// An unbounded view of this map in descending key order.
    ///
    /// # Examples
    ///
    /// ```
    /// use skip_tree::SkipTreeMap;
    ///
    /// let map: SkipTreeMap<i32, i32> = (0..4).map(|k| (k, k)).collect();
    ///
    /// let keys: Vec<i32> = map.descending_map().iter().map(|(k, _v)| k).collect();
    /// assert_eq!(keys, vec![3, 2, 1, 0]);
    /// ```
    pub fn descending_map(&self) -> SubMap<K, V> {
        SubMap::new(self.clone(), None, false, None, false, true)
    }

    /// Samples the level for a fresh insertion from a geometric
    /// distribution with success probability 1/AVG_LENGTH, using the
    /// per-handle xor-shift generator.
    fn random_level(&self) -> usize {
        let mut x = self.seed.get();
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.seed.set(x);
        let mut level = 1;
        while x & AVG_LENGTH_MASK == 0 {
            if level % 6 == 0 {
                x = self.seed.get();
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                self.seed.set(x);
            } else {
                x >>= LOG_AVG_LENGTH;
            }
            level += 1;
        }
        level - 1
    }

    /// Validates the structural invariants of a quiescent tree: strictly
    /// ascending keys per level with exactly one trailing top sentinel, and
    /// matching array lengths inside every node.
    #[doc(hidden)]
    pub fn check_invariants(&self) {
        let _guard = self.ebr.pin();
        let head = self.inner.head();
        let mut level_head = head.node;
        let mut height = head.height;
        loop {
            let mut next_head: Option<NodeRef<K, V>> = None;
            let mut cursor = Some(level_head);
            let mut previous: Option<&K> = None;
            let mut tops = 0;
            while let Some(node) = cursor {
                let contents = node.contents();
                if height > 0 {
                    assert!(contents.values.is_none());
                    assert_eq!(contents.children().len(), contents.keys.len());
                    if next_head.is_none() && !contents.children().is_empty() {
                        next_head = Some(contents.children()[0]);
                    }
                } else {
                    assert!(contents.children.is_none());
                    if let Some(values) = &contents.values {
                        let real_keys = contents.keys.iter().filter(|k| !k.is_top()).count();
                        assert_eq!(values.len(), real_keys);
                    }
                }
                for item in &contents.keys[..] {
                    match item {
                        Item::Top => tops += 1,
                        Item::Key(key) => {
                            assert_eq!(tops, 0, "key stored after the top sentinel");
                            if let Some(previous) = previous {
                                assert_eq!(
                                    self.inner.compare_keys(previous, key),
                                    Ordering::Less,
                                    "keys out of order within a level"
                                );
                            }
                            previous = Some(key);
                        }
                    }
                }
                if contents.link.is_none() {
                    assert!(matches!(contents.keys.last(), Some(Item::Top)));
                }
                cursor = contents.link;
            }
            assert_eq!(tops, 1, "each level carries exactly one top sentinel");
            if height == 0 {
                break;
            }
            level_head = next_head.expect("router level routed nowhere");
            height -= 1;
        }
    }
}

struct Inner<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    root: AtomicPtr<HeadNode<K, V>>,
    leaf_head: AtomicPtr<node::Node<K, V>>,
    registry: NodeRegistry<K, V>,
    comparator: Option<KeyComparator<K>>,
    value_proxy: Option<V>,
}

impl<K, V> Drop for Inner<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    fn drop(&mut self) {
        let head = self.root.swap(std::ptr::null_mut(), AcqRel);
        if !head.is_null() {
            drop(unsafe { Box::from_raw(head) });
        }

        // Every node shell ever allocated is in the registry, and each owns
        // its current snapshot; replaced snapshots went through the epoch
        // system when they were swapped out.
        for node in self.registry.drain() {
            let contents = node.raw_contents();
            drop(unsafe { Box::from_raw(contents) });
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
    }
}

impl<K, V> Inner<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    fn new(comparator: Option<KeyComparator<K>>, value_proxy: Option<V>) -> Inner<K, V> {
        let inner = Inner {
            root: AtomicPtr::default(),
            leaf_head: AtomicPtr::default(),
            registry: NodeRegistry::default(),
            comparator,
            value_proxy,
        };
        let node = inner.allocate_node(inner.empty_leaf());
        let head = Box::into_raw(Box::new(HeadNode { node, height: 0 }));
        inner.root.store(head, Release);
        inner.leaf_head.store(node.as_ptr(), Release);
        inner
    }

    /// A leaf holding nothing but the top sentinel: the initial state of
    /// the whole tree.
    fn empty_leaf(&self) -> Contents<K, V> {
        let keys = vec![Item::Top].into_boxed_slice();
        let values = if self.value_proxy.is_none() {
            Some(Vec::new().into_boxed_slice())
        } else {
            None
        };
        Contents::new(keys, values, None, None)
    }

    fn allocate_node(&self, contents: Contents<K, V>) -> NodeRef<K, V> {
        let node = NodeRef::alloc(contents);
        self.registry.push(node);
        node
    }

    fn head<'a>(&self) -> &'a HeadNode<K, V> {
        unsafe { &*self.root.load(Acquire) }
    }

    fn leaf_head(&self) -> NodeRef<K, V> {
        NodeRef::from_ptr(self.leaf_head.load(Acquire))
    }

    fn compare_keys(&self, a: &K, b: &K) -> Ordering {
        if let Some(comparator) = &self.comparator {
            comparator(a, b)
        } else {
            a.cmp(b)
        }
    }

    /// Compares a stored slot against a probe key. The top sentinel is
    /// greater than every key.
    fn compare_item(&self, item: &Item<K>, key: &K) -> Ordering {
        match item {
            Item::Top => Ordering::Greater,
            Item::Key(stored) => self.compare_keys(stored, key),
        }
    }

    /// Binary search within one node. A trailing top sentinel is excluded
    /// from the search range, so an `Err` equal to `keys.len()` can only
    /// mean "strictly past everything stored here, chase the link".
    fn search(&self, keys: &[Item<K>], key: &K) -> Result<usize, usize> {
        let mut limit = keys.len();
        if let Some(last) = keys.last() {
            if last.is_top() {
                limit -= 1;
            }
        }
        keys[..limit].binary_search_by(|item| self.compare_item(item, key))
    }

    fn value_at(&self, contents: &Contents<K, V>, index: usize) -> V {
        if let Some(proxy) = &self.value_proxy {
            proxy.clone()
        } else if let Some(values) = &contents.values {
            values[index].clone()
        } else {
            unreachable!("a leaf without a value proxy always stores values")
        }
    }

    fn entry_of(&self, results: &SearchResults<K, V>) -> (K, V) {
        let contents = results.contents();
        let index = results.position();
        (
            contents.keys[index].key().clone(),
            self.value_at(contents, index),
        )
    }

    /* ----------------  read path  -------------- */

    /// Pure read descent: routers are traversed with in-node binary search,
    /// links are chased whenever the key lies strictly past a node, and no
    /// cleaning is performed.
    fn lookup(&self, key: &K, _guard: &MapGuard<'_, K, V>) -> SearchResults<K, V> {
        let mut node = self.head().node;
        let mut contents = node.contents();
        let mut index = self.search(&contents.keys, key);
        while contents.is_router() {
            node = if index == Err(contents.keys.len()) {
                contents.link.unwrap()
            } else {
                let routing = match index {
                    Ok(i) | Err(i) => i,
                };
                contents.children()[routing]
            };
            contents = node.contents();
            index = self.search(&contents.keys, key);
        }
        loop {
            if index != Err(contents.keys.len()) {
                return SearchResults::new(node, contents, index);
            }
            node = contents.link.unwrap();
            contents = node.contents();
            index = self.search(&contents.keys, key);
        }
    }

    fn contains_value(&self, value: &V, guard: &MapGuard<'_, K, V>) -> bool
    where
        V: PartialEq,
    {
        if let Some(proxy) = &self.value_proxy {
            return proxy == value && self.find_first(guard).is_some();
        }
        let mut cursor = Some(self.leaf_head());
        while let Some(node) = cursor {
            let contents = node.contents();
            if let Some(values) = &contents.values {
                if values.iter().any(|stored| stored == value) {
                    return true;
                }
            }
            cursor = contents.link;
        }
        false
    }

    fn len(&self, _guard: &MapGuard<'_, K, V>) -> usize {
        let mut node = self.leaf_head();
        let mut contents = node.contents();
        while contents.keys.is_empty() {
            let link = contents.link.unwrap();
            node = if self
                .leaf_head
                .compare_exchange(node.as_ptr(), link.as_ptr(), AcqRel, Acquire)
                .is_ok()
            {
                link
            } else {
                self.leaf_head()
            };
            contents = node.contents();
        }
        let mut count = 0;
        let mut cursor = Some(node);
        while let Some(node) = cursor {
            let contents = node.contents();
            count += contents.keys.len();
            cursor = contents.link;
        }
        // the top sentinel is not an entry
        count - 1
    }

    /* ----------------  descents  -------------- */

    /// Mutator descent to the leaf that covers `key`. While moving through
    /// routers it tracks the last key passed on the left, which bounds how
    /// far a child pointer may be pushed right during cleaning.
    fn descend_to_leaf(
        &self,
        key: &K,
        clean: bool,
        guard: &mut MapGuard<'_, K, V>,
    ) -> SearchResults<K, V> {
        let mut node = self.head().node;
        let mut contents = node.contents();
        let mut index = self.search(&contents.keys, key);
        let mut left_barrier: Option<&K> = None;
        while contents.is_router() {
            if index == Err(contents.keys.len()) {
                if let Some(last) = contents.keys.last() {
                    left_barrier = Some(last.key());
                }
                contents = self.clean_link(node, contents, guard);
                node = contents.link.unwrap();
            } else {
                let routing = match index {
                    Ok(i) | Err(i) => i,
                };
                if clean {
                    self.clean_node(key, node, contents, routing, left_barrier, guard);
                }
                node = contents.children()[routing];
                left_barrier = None;
            }
            contents = node.contents();
            index = self.search(&contents.keys, key);
        }
        loop {
            if index != Err(contents.keys.len()) {
                return SearchResults::new(node, contents, index);
            }
            contents = self.clean_link(node, contents, guard);
            node = contents.link.unwrap();
            contents = node.contents();
            index = self.search(&contents.keys, key);
        }
    }

    /// Multi-level descent for an insertion that drew height `target`:
    /// records where `key` lands on every level from `target` down to the
    /// leaf, growing the root first if the tree is not yet that tall. Along
    /// the way each router passed gets the chance to push a key into its
    /// right neighbor, concentrating routers back towards their expected
    /// size.
    fn descend_collecting(
        &self,
        key: &K,
        target: usize,
        results: &mut [Option<SearchResults<K, V>>],
        guard: &mut MapGuard<'_, K, V>,
    ) {
        let mut head = self.head();
        if head.height < target {
            head = self.increase_root_height(target, guard);
        }
        let mut height = head.height;
        let mut node = head.node;
        loop {
            let contents = node.contents();
            let index = self.search(&contents.keys, key);
            if index == Err(contents.keys.len()) {
                node = contents.link.unwrap();
            } else if height == 0 {
                results[0] = Some(SearchResults::new(node, contents, index));
                return;
            } else {
                let mut level_results = SearchResults::new(node, contents, index);
                level_results = self.clean_right_neighbor(key, level_results, guard);
                if height <= target {
                    results[height] = Some(level_results);
                }
                let routing = match index {
                    Ok(i) | Err(i) => i,
                };
                node = contents.children()[routing];
                height -= 1;
            }
        }
    }

    /// Re-anchors after a lost CAS: walk right from `node` until reaching
    /// the node that contains, or would contain, the key.
    fn move_forward(&self, mut node: NodeRef<K, V>, key: &K) -> SearchResults<K, V> {
        loop {
            let contents = node.contents();
            let index = self.search(&contents.keys, key);
            if index != Err(contents.keys.len()) {
                return SearchResults::new(node, contents, index);
            }
            node = contents.link.unwrap();
        }
    }

    /// The first node in the tail set of `node` whose last key lies
    /// strictly past `left_barrier`. With no barrier this just skips empty
    /// nodes. Rightmost nodes always qualify since they end in the top
    /// sentinel.
    fn push_right(&self, mut node: NodeRef<K, V>, left_barrier: Option<&K>) -> NodeRef<K, V> {
        loop {
            let contents = node.contents();
            let length = contents.keys.len();
            if length == 0 {
                node = contents.link.unwrap();
                continue;
            }
            let keeps_keys = match left_barrier {
                None => true,
                Some(barrier) => {
                    self.compare_item(&contents.keys[length - 1], barrier) == Ordering::Greater
                }
            };
            if keeps_keys {
                return node;
            }
            node = contents.link.unwrap();
        }
    }

    /* ----------------  online compaction  -------------- */

    /// Advances a node's link past empty right siblings. Returns the
    /// snapshot to continue from, whether or not the CAS went through.
    fn clean_link<'a>(
        &self,
        node: NodeRef<K, V>,
        mut contents: &'a Contents<K, V>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> &'a Contents<K, V> {
        loop {
            let link = contents.link.unwrap();
            let new_link = self.push_right(link, None);
            if new_link == link {
                return contents;
            }
            let update = Contents::new(
                contents.keys.clone(),
                contents.values.clone(),
                contents.children.clone(),
                Some(new_link),
            );
            match node.cas_contents(contents, update, guard) {
                Ok(installed) => return installed,
                Err(()) => contents = node.contents(),
            }
        }
    }

    /// Refreshes a router whose children may have been absorbed to the
    /// right. Retries with a fresh snapshot until one cleaning step
    /// succeeds or the key moves out of this node.
    fn clean_node(
        &self,
        key: &K,
        node: NodeRef<K, V>,
        mut contents: &Contents<K, V>,
        mut index: usize,
        left_barrier: Option<&K>,
        guard: &mut MapGuard<'_, K, V>,
    ) {
        loop {
            let done = match contents.keys.len() {
                0 => return,
                1 => self.clean_single(node, contents, left_barrier, guard),
                2 => self.clean_pair(node, contents, left_barrier, guard),
                _ => self.clean_interior(node, contents, index, left_barrier, guard),
            };
            if done {
                return;
            }
            contents = node.contents();
            match self.search(&contents.keys, key) {
                Err(i) if i == contents.keys.len() => return,
                Ok(i) | Err(i) => index = i,
            }
        }
    }

    /// Single-key router: try to slide its key into the right neighbor,
    /// otherwise push its only child past anything absorbed on the left.
    fn clean_single(
        &self,
        node: NodeRef<K, V>,
        contents: &Contents<K, V>,
        mut left_barrier: Option<&K>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> bool {
        if self.attempt_slide_key(node, contents, guard) {
            return true;
        }
        if let Some(barrier) = left_barrier {
            if self.compare_item(&contents.keys[0], barrier) != Ordering::Greater {
                left_barrier = None;
            }
        }
        let child = contents.children()[0];
        let adjusted = self.push_right(child, left_barrier);
        if adjusted == child {
            return true;
        }
        self.shift_child(node, contents, 0, adjusted, guard)
    }

    /// Two-key router: try the slide, otherwise push both children past
    /// their respective barriers and install them together.
    fn clean_pair(
        &self,
        node: NodeRef<K, V>,
        contents: &Contents<K, V>,
        mut left_barrier: Option<&K>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> bool {
        if self.attempt_slide_key(node, contents, guard) {
            return true;
        }
        if let Some(barrier) = left_barrier {
            if self.compare_item(&contents.keys[0], barrier) != Ordering::Greater {
                left_barrier = None;
            }
        }
        let children = contents.children();
        let adjusted_first = self.push_right(children[0], left_barrier);
        let adjusted_second = self.push_right(children[1], Some(contents.keys[0].key()));
        if adjusted_first == children[0] && adjusted_second == children[1] {
            return true;
        }
        self.shift_children(node, contents, adjusted_first, adjusted_second, guard)
    }

    /// Interior position of a longer router: push the indexed child right;
    /// if it meets the next child, the separator between them no longer
    /// routes to anything and is dropped together with the duplicate child.
    fn clean_interior<'a>(
        &self,
        node: NodeRef<K, V>,
        contents: &'a Contents<K, V>,
        index: usize,
        mut left_barrier: Option<&'a K>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> bool {
        if index > 0 {
            left_barrier = Some(contents.keys[index - 1].key());
        } else if let Some(barrier) = left_barrier {
            if self.compare_item(&contents.keys[0], barrier) != Ordering::Greater {
                left_barrier = None;
            }
        }
        let children = contents.children();
        let child = children[index];
        let adjusted = self.push_right(child, left_barrier);
        if index == 0 || index == children.len() - 1 {
            if adjusted == child {
                return true;
            }
            return self.shift_child(node, contents, index, adjusted, guard);
        }
        let adjusted_neighbor =
            self.push_right(children[index + 1], Some(contents.keys[index].key()));
        if adjusted_neighbor == adjusted {
            self.drop_child(node, contents, index, adjusted, guard)
        } else if adjusted != child {
            self.shift_child(node, contents, index, adjusted, guard)
        } else {
            true
        }
    }

    /// Pushes this router's last key into its right sibling. The move only
    /// happens when the sibling's first child, pushed past our last key,
    /// turns out to be our own last child; then the key is first inserted
    /// over there and afterwards deleted here. Losing the second CAS leaves
    /// the key briefly duplicated across the two nodes, which routing
    /// tolerates and a later descent cleans. Returning `true` means "do not
    /// retry this cleaning step now", not "the slide committed".
    fn attempt_slide_key(
        &self,
        node: NodeRef<K, V>,
        contents: &Contents<K, V>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> bool {
        let Some(link) = contents.link else {
            return false;
        };
        let length = contents.keys.len();
        let slide_key = contents.keys[length - 1].key();
        let child = contents.children()[length - 1];
        let sibling = self.push_right(link, None);
        let sibling_contents = sibling.contents();
        if sibling_contents.children().is_empty() {
            return false;
        }
        let nephew = sibling_contents.children()[0];
        let adjusted_nephew =
            if self.compare_item(&sibling_contents.keys[0], slide_key) == Ordering::Greater {
                self.push_right(nephew, Some(slide_key))
            } else {
                self.push_right(nephew, None)
            };
        if adjusted_nephew != child {
            return false;
        }
        if self.slide_to_neighbor(sibling, sibling_contents, slide_key, child, guard) {
            self.delete_slid_key(node, contents, slide_key, guard);
        }
        true
    }

    fn slide_to_neighbor(
        &self,
        sibling: NodeRef<K, V>,
        sibling_contents: &Contents<K, V>,
        slide_key: &K,
        child: NodeRef<K, V>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> bool {
        match self.search(&sibling_contents.keys, slide_key) {
            // already slid by a helper
            Ok(_) => true,
            Err(insertion) if insertion > 0 => false,
            Err(_) => {
                let keys = insert_at(&sibling_contents.keys, 0, Item::Key(slide_key.clone()));
                let children = insert_at(sibling_contents.children(), 0, child);
                let update = Contents::new(keys, None, Some(children), sibling_contents.link);
                sibling
                    .cas_contents(sibling_contents, update, guard)
                    .is_ok()
            }
        }
    }

    fn delete_slid_key<'a>(
        &self,
        node: NodeRef<K, V>,
        contents: &'a Contents<K, V>,
        slide_key: &K,
        guard: &mut MapGuard<'_, K, V>,
    ) -> &'a Contents<K, V> {
        let Ok(index) = self.search(&contents.keys, slide_key) else {
            return contents;
        };
        let keys = remove_at(&contents.keys, index);
        let children = remove_at(contents.children(), index);
        let update = Contents::new(keys, None, Some(children), contents.link);
        match node.cas_contents(contents, update, guard) {
            Ok(installed) => installed,
            Err(()) => contents,
        }
    }

    /// Merges out a separator whose two children converged on the same
    /// node.
    fn drop_child(
        &self,
        node: NodeRef<K, V>,
        contents: &Contents<K, V>,
        index: usize,
        adjusted: NodeRef<K, V>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> bool {
        let keys = remove_at(&contents.keys, index);
        let mut children = contents.children().to_vec();
        children[index] = adjusted;
        children.remove(index + 1);
        let update = Contents::new(keys, None, Some(children.into_boxed_slice()), contents.link);
        node.cas_contents(contents, update, guard).is_ok()
    }

    fn shift_child(
        &self,
        node: NodeRef<K, V>,
        contents: &Contents<K, V>,
        index: usize,
        adjusted: NodeRef<K, V>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> bool {
        let mut children = contents.children().to_vec();
        children[index] = adjusted;
        let update = Contents::new(
            contents.keys.clone(),
            None,
            Some(children.into_boxed_slice()),
            contents.link,
        );
        node.cas_contents(contents, update, guard).is_ok()
    }

    fn shift_children(
        &self,
        node: NodeRef<K, V>,
        contents: &Contents<K, V>,
        first: NodeRef<K, V>,
        second: NodeRef<K, V>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> bool {
        let children = vec![first, second].into_boxed_slice();
        let update = Contents::new(contents.keys.clone(), None, Some(children), contents.link);
        node.cas_contents(contents, update, guard).is_ok()
    }

    /// Descent-time help for the right neighbor of a router: if the
    /// neighbor emptied out, advance our link past it; if it starts with
    /// our own last child, slide our last key over to it. Either way later
    /// descents converge without a dedicated maintenance thread.
    fn clean_right_neighbor(
        &self,
        key: &K,
        results: SearchResults<K, V>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> SearchResults<K, V> {
        let node = results.node;
        let contents = results.contents();
        let Some(link) = contents.link else {
            return results;
        };
        let length = contents.keys.len();
        let barrier = contents.keys[length - 1].key();
        let child = contents.children()[length - 1];
        let sibling = self.push_right(link, None);
        let sibling_contents = sibling.contents();
        if sibling_contents.children().is_empty() {
            let contents = self.clean_link(node, node.contents(), guard);
            let index = self.search(&contents.keys, key);
            return SearchResults::new(node, contents, index);
        }
        let nephew = sibling_contents.children()[0];
        let adjusted_nephew =
            if self.compare_item(&sibling_contents.keys[0], barrier) == Ordering::Greater {
                self.push_right(nephew, Some(barrier))
            } else {
                self.push_right(nephew, None)
            };
        if nephew != child {
            if adjusted_nephew != nephew {
                let _ = self.shift_child(sibling, sibling_contents, 0, adjusted_nephew, guard);
            }
        } else if self.slide_to_neighbor(sibling, sibling_contents, barrier, child, guard) {
            let contents = self.delete_slid_key(node, contents, barrier, guard);
            let index = self.search(&contents.keys, key);
            return SearchResults::new(node, contents, index);
        }
        results
    }

    /* ----------------  write path  -------------- */

    fn insert_leaf_level(
        &self,
        key: &K,
        value: &V,
        mut results: SearchResults<K, V>,
        only_if_absent: bool,
        guard: &mut MapGuard<'_, K, V>,
    ) -> Option<V> {
        loop {
            let node = results.node;
            let contents = results.contents();
            match results.index {
                Ok(index) => {
                    let previous = self.value_at(contents, index);
                    if only_if_absent {
                        return Some(previous);
                    }
                    let values = contents.values.as_ref().map(|values| {
                        let mut values = values.to_vec();
                        values[index] = value.clone();
                        values.into_boxed_slice()
                    });
                    let update = Contents::new(contents.keys.clone(), values, None, contents.link);
                    if node.cas_contents(contents, update, guard).is_ok() {
                        return Some(previous);
                    }
                    results = self.move_forward(node, key);
                }
                Err(index) => {
                    let keys = insert_at(&contents.keys, index, Item::Key(key.clone()));
                    let values = contents
                        .values
                        .as_ref()
                        .map(|values| insert_at(values, index, value.clone()));
                    let update = Contents::new(keys, values, None, contents.link);
                    if node.cas_contents(contents, update, guard).is_ok() {
                        return None;
                    }
                    results = self.move_forward(node, key);
                }
            }
        }
    }

    /// Leaf insertion for a tower that will also be raised into routers:
    /// identical to `insert_leaf_level`, except that the post-insert
    /// location is written back so the upward cascade can split there.
    fn begin_insert_one_level(
        &self,
        key: &K,
        value: &V,
        results_store: &mut [Option<SearchResults<K, V>>],
        only_if_absent: bool,
        guard: &mut MapGuard<'_, K, V>,
    ) -> Option<V> {
        let mut results = results_store[0].expect("descent did not reach the leaf level");
        loop {
            let node = results.node;
            let contents = results.contents();
            match results.index {
                Ok(index) => {
                    let previous = self.value_at(contents, index);
                    if only_if_absent {
                        return Some(previous);
                    }
                    let values = contents.values.as_ref().map(|values| {
                        let mut values = values.to_vec();
                        values[index] = value.clone();
                        values.into_boxed_slice()
                    });
                    let update = Contents::new(contents.keys.clone(), values, None, contents.link);
                    if node.cas_contents(contents, update, guard).is_ok() {
                        return Some(previous);
                    }
                    results = self.move_forward(node, key);
                }
                Err(index) => {
                    let keys = insert_at(&contents.keys, index, Item::Key(key.clone()));
                    let values = contents
                        .values
                        .as_ref()
                        .map(|values| insert_at(values, index, value.clone()));
                    let update = Contents::new(keys, values, None, contents.link);
                    match node.cas_contents(contents, update, guard) {
                        Ok(installed) => {
                            results_store[0] = Some(SearchResults::new(node, installed, Ok(index)));
                            return None;
                        }
                        Err(()) => results = self.move_forward(node, key),
                    }
                }
            }
        }
    }

    /// Splits one level's node at `key`. The split happens only when the
    /// key is present, the node holds at least two elements, and the key is
    /// not the last one; the left half keeps everything up to and including
    /// the key and gains a link to the freshly allocated right half, all in
    /// one CAS. Returns the right node, or `None` when no split applies,
    /// which also aborts the cascade above this level.
    fn split_one_level(
        &self,
        key: &K,
        mut results: SearchResults<K, V>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> Option<NodeRef<K, V>> {
        loop {
            let node = results.node;
            let contents = results.contents();
            let length = contents.keys.len();
            let Ok(index) = results.index else {
                return None;
            };
            if length < 2 || index == length - 1 {
                return None;
            }
            let left_keys = left_of(&contents.keys, index);
            let right_keys = right_of(&contents.keys, index);
            let left_values = contents
                .values
                .as_ref()
                .map(|values| left_of(values, index));
            let right_values = contents
                .values
                .as_ref()
                .map(|values| right_of(values, index));
            let left_children = contents
                .children
                .as_ref()
                .map(|children| left_of(children, index));
            let right_children = contents
                .children
                .as_ref()
                .map(|children| right_of(children, index));
            let right = self.allocate_node(Contents::new(
                right_keys,
                right_values,
                right_children,
                contents.link,
            ));
            let left = Contents::new(left_keys, left_values, left_children, Some(right));
            if node.cas_contents(contents, left, guard).is_ok() {
                return Some(right);
            }
            results = self.move_forward(node, key);
        }
    }

    /// Installs a router key and the child produced by the split one level
    /// below. A `None` child means the split below did not happen, so this
    /// level needs no router either.
    fn insert_one_level(
        &self,
        key: &K,
        results_store: &mut [Option<SearchResults<K, V>>],
        child: Option<NodeRef<K, V>>,
        target: usize,
        guard: &mut MapGuard<'_, K, V>,
    ) {
        assert!(target > 0);
        let Some(child) = child else {
            return;
        };
        let mut results = results_store[target].expect("descent did not reach this level");
        loop {
            let node = results.node;
            let contents = results.contents();
            match results.index {
                // someone else already raised this key here
                Ok(_) => return,
                Err(index) if index < contents.keys.len() => {
                    let keys = insert_at(&contents.keys, index, Item::Key(key.clone()));
                    let children = insert_at(contents.children(), index + 1, child);
                    let update = Contents::new(keys, None, Some(children), contents.link);
                    match node.cas_contents(contents, update, guard) {
                        Ok(installed) => {
                            results_store[target] =
                                Some(SearchResults::new(node, installed, Ok(index)));
                            return;
                        }
                        Err(()) => results = self.move_forward(node, key),
                    }
                }
                Err(_) => results = self.move_forward(node, key),
            }
        }
    }

    fn do_replace(
        &self,
        key: &K,
        check: &dyn Fn(&V) -> bool,
        value: &V,
        guard: &mut MapGuard<'_, K, V>,
    ) -> Option<V> {
        let mut results = self.descend_to_leaf(key, true, guard);
        loop {
            let node = results.node;
            let contents = results.contents();
            let Ok(index) = results.index else {
                return None;
            };
            let previous = self.value_at(contents, index);
            if !check(&previous) {
                return None;
            }
            let values = contents.values.as_ref().map(|values| {
                let mut values = values.to_vec();
                values[index] = value.clone();
                values.into_boxed_slice()
            });
            let update = Contents::new(contents.keys.clone(), values, None, contents.link);
            if node.cas_contents(contents, update, guard).is_ok() {
                return Some(previous);
            }
            results = self.move_forward(node, key);
        }
    }

    fn do_remove(
        &self,
        key: &K,
        check: Option<&dyn Fn(&V) -> bool>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> Option<V> {
        let results = self.descend_to_leaf(key, true, guard);
        self.remove_from_node(key, check, results, guard)
    }

    fn remove_from_node(
        &self,
        key: &K,
        check: Option<&dyn Fn(&V) -> bool>,
        mut results: SearchResults<K, V>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> Option<V> {
        loop {
            let node = results.node;
            let contents = results.contents();
            let Ok(index) = results.index else {
                return None;
            };
            let value = self.value_at(contents, index);
            if let Some(check) = check {
                if !check(&value) {
                    return None;
                }
            }
            let keys = remove_at(&contents.keys, index);
            let values = contents
                .values
                .as_ref()
                .map(|values| remove_at(values, index));
            let update = Contents::new(keys, values, None, contents.link);
            if node.cas_contents(contents, update, guard).is_ok() {
                return Some(value);
            }
            results = self.move_forward(node, key);
        }
    }

    /* ----------------  growing the root  -------------- */

    /// Raises the tree until it is at least `target` levels tall. Each step
    /// wraps the current root in a one-key router holding only the top
    /// sentinel; a lost race just re-reads and keeps going.
    fn increase_root_height<'a>(
        &self,
        target: usize,
        guard: &mut MapGuard<'_, K, V>,
    ) -> &'a HeadNode<K, V> {
        let mut head = self.head();
        while head.height < target {
            let keys = vec![Item::Top].into_boxed_slice();
            let children = vec![head.node].into_boxed_slice();
            let contents = Contents::new(keys, None, Some(children), None);
            let node = self.allocate_node(contents);
            let update = Box::into_raw(Box::new(HeadNode {
                node,
                height: head.height + 1,
            }));
            let expected = head as *const HeadNode<K, V> as *mut HeadNode<K, V>;
            match self.root.compare_exchange(expected, update, AcqRel, Acquire) {
                Ok(previous) => {
                    guard.defer_drop(Deferred::Head(unsafe { Box::from_raw(previous) }));
                }
                Err(_) => {
                    drop(unsafe { Box::from_raw(update) });
                }
            }
            head = self.head();
        }
        head
    }

    /* ----------------  first / last / poll  -------------- */

    /// The first live leaf position. Empty nodes at the front of the leaf
    /// list are compacted away by advancing the leaf head. `None` means the
    /// first key is the top sentinel, in other words the map is empty.
    fn find_first(&self, _guard: &MapGuard<'_, K, V>) -> Option<SearchResults<K, V>> {
        loop {
            let node = self.leaf_head();
            let contents = node.contents();
            if contents.keys.is_empty() {
                let link = contents.link.unwrap();
                let _ = self
                    .leaf_head
                    .compare_exchange(node.as_ptr(), link.as_ptr(), AcqRel, Acquire);
            } else if contents.keys[0].is_top() {
                return None;
            } else {
                return Some(SearchResults::new(node, contents, Ok(0)));
            }
        }
    }

    fn remove_first_entry(&self, guard: &mut MapGuard<'_, K, V>) -> Option<(K, V)> {
        let mut node = self.leaf_head();
        loop {
            let contents = node.contents();
            if contents.keys.is_empty() {
                let link = contents.link.unwrap();
                node = if self
                    .leaf_head
                    .compare_exchange(node.as_ptr(), link.as_ptr(), AcqRel, Acquire)
                    .is_ok()
                {
                    link
                } else {
                    self.leaf_head()
                };
            } else {
                if contents.keys[0].is_top() {
                    return None;
                }
                let key = contents.keys[0].key().clone();
                let value = self.value_at(contents, 0);
                let keys = remove_at(&contents.keys, 0);
                let values = contents.values.as_ref().map(|values| remove_at(values, 0));
                let update = Contents::new(keys, values, None, contents.link);
                if node.cas_contents(contents, update, guard).is_ok() {
                    return Some((key, value));
                }
            }
        }
    }

    /// Descent that prefers links over children, so it lands on the
    /// rightmost subtree of every level. Routers passed on the way down are
    /// remembered so the search can back up one level and take the
    /// next-rightmost child if the bottom ran empty.
    fn last_descend(&self, stack: &mut Vec<SearchResults<K, V>>) -> Option<SearchResults<K, V>> {
        let mut node = self.head().node;
        let mut contents = node.contents();
        while contents.is_router() {
            if let Some(link) = contents.link {
                node = link;
            } else {
                stack.push(SearchResults::new(node, contents, Ok(0)));
                node = contents.children()[contents.children().len() - 1];
            }
            contents = node.contents();
        }
        self.leaf_find_last(node, contents)
    }

    fn last_retry_from(&self, initial: SearchResults<K, V>) -> Option<SearchResults<K, V>> {
        let mut node = initial.node;
        let mut contents = initial.contents();
        while contents.is_router() {
            let children = contents.children();
            if children.len() < 2 {
                return None;
            }
            node = children[children.len() - 2];
            contents = node.contents();
        }
        self.leaf_find_last(node, contents)
    }

    /// Walks a leaf's tail set to the end. The rightmost leaf always ends
    /// in the top sentinel, so the last mapping sits one slot before it; if
    /// the rightmost leaf holds nothing else, the answer is the last key of
    /// the nearest non-empty leaf passed on the way.
    fn leaf_find_last(
        &self,
        mut node: NodeRef<K, V>,
        mut contents: &Contents<K, V>,
    ) -> Option<SearchResults<K, V>> {
        let mut previous: Option<(NodeRef<K, V>, &Contents<K, V>)> = None;
        loop {
            if let Some(link) = contents.link {
                if !contents.keys.is_empty() {
                    previous = Some((node, contents));
                }
                node = link;
                contents = node.contents();
            } else if contents.keys.len() == 1 {
                let (previous_node, previous_contents) = previous?;
                return Some(SearchResults::new(
                    previous_node,
                    previous_contents,
                    Ok(previous_contents.keys.len() - 1),
                ));
            } else {
                return Some(SearchResults::new(
                    node,
                    contents,
                    Ok(contents.keys.len() - 2),
                ));
            }
        }
    }

    fn find_last(&self, _guard: &MapGuard<'_, K, V>) -> Option<SearchResults<K, V>> {
        let mut stack = Vec::new();
        let mut predecessor = self.last_descend(&mut stack);
        while predecessor.is_none() {
            let Some(frame) = stack.pop() else {
                break;
            };
            predecessor = self.last_retry_from(frame);
        }
        if predecessor.is_none() {
            let node = self.leaf_head();
            return self.leaf_find_last(node, node.contents());
        }
        predecessor
    }

    fn remove_last_entry(&self, guard: &mut MapGuard<'_, K, V>) -> Option<(K, V)> {
        loop {
            let last = self.find_last(guard)?;
            let node = last.node;
            let contents = last.contents();
            let index = last.position();
            let key = contents.keys[index].key().clone();
            let value = self.value_at(contents, index);
            let keys = remove_at(&contents.keys, index);
            let values = contents
                .values
                .as_ref()
                .map(|values| remove_at(values, index));
            let update = Contents::new(keys, values, None, contents.link);
            if node.cas_contents(contents, update, guard).is_ok() {
                return Some((key, value));
            }
        }
    }

    /* ----------------  nearest-neighbor navigation  -------------- */

    /// The next live leaf position after `start`, or the very first one
    /// when no start is given. Stops at the top sentinel.
    fn immediate_successor(
        &self,
        start: Option<SearchResults<K, V>>,
        guard: &MapGuard<'_, K, V>,
    ) -> Option<SearchResults<K, V>> {
        let Some(start) = start else {
            return self.find_first(guard);
        };
        let mut node = start.node;
        let mut contents = start.contents();
        let mut index = start.position() + 1;
        loop {
            if index < contents.keys.len() {
                if contents.keys[index].is_top() {
                    return None;
                }
                return Some(SearchResults::new(node, contents, Ok(index)));
            }
            let Some(link) = contents.link else {
                return None;
            };
            node = link;
            contents = node.contents();
            index = 0;
        }
    }

    /// Stack-based predecessor descent. Router children can turn out to be
    /// absorbed or empty; each level passed is remembered, so the search
    /// backs up and retries from the previous router slot, and as a last
    /// resort walks the whole leaf level.
    fn find_predecessor(&self, key: &K, _guard: &MapGuard<'_, K, V>) -> Option<SearchResults<K, V>> {
        let mut stack: Vec<SearchResults<K, V>> = Vec::new();
        let node = self.head().node;
        let contents = node.contents();
        let index = self.search(&contents.keys, key);
        let mut predecessor = self.descend_predecessor(
            key,
            SearchResults::new(node, contents, index),
            Some(&mut stack),
        );
        while predecessor.is_none() {
            let Some(frame) = stack.pop() else {
                break;
            };
            let index = frame.position();
            if index == 0 {
                continue;
            }
            predecessor = self.descend_predecessor(
                key,
                SearchResults::new(frame.node, frame.contents(), Ok(index - 1)),
                None,
            );
        }
        if predecessor.is_none() {
            let node = self.leaf_head();
            let contents = node.contents();
            let index = self.search(&contents.keys, key);
            return self.leaf_predecessor(key, SearchResults::new(node, contents, index));
        }
        predecessor
    }

    fn descend_predecessor(
        &self,
        key: &K,
        start: SearchResults<K, V>,
        mut stack: Option<&mut Vec<SearchResults<K, V>>>,
    ) -> Option<SearchResults<K, V>> {
        let mut node = start.node;
        let mut contents = start.contents();
        let mut index = start.index;
        while contents.is_router() {
            if index == Err(contents.keys.len()) {
                node = contents.link.unwrap();
            } else {
                let routing = match index {
                    Ok(i) | Err(i) => i,
                };
                if let Some(stack) = stack.as_deref_mut() {
                    stack.push(SearchResults::new(node, contents, Ok(routing)));
                }
                node = contents.children()[routing];
            }
            contents = node.contents();
            index = self.search(&contents.keys, key);
        }
        self.leaf_predecessor(key, SearchResults::new(node, contents, index))
    }

    fn leaf_predecessor(
        &self,
        key: &K,
        start: SearchResults<K, V>,
    ) -> Option<SearchResults<K, V>> {
        let mut node = start.node;
        let mut contents = start.contents();
        let mut index = start.index;
        let mut previous: Option<(NodeRef<K, V>, &Contents<K, V>)> = None;
        loop {
            if index == Err(contents.keys.len()) {
                if !contents.keys.is_empty() {
                    previous = Some((node, contents));
                }
                node = contents.link.unwrap();
            } else {
                return match index {
                    Ok(0) | Err(0) => {
                        let (previous_node, previous_contents) = previous?;
                        Some(SearchResults::new(
                            previous_node,
                            previous_contents,
                            Ok(previous_contents.keys.len() - 1),
                        ))
                    }
                    Ok(i) | Err(i) => Some(SearchResults::new(node, contents, Ok(i - 1))),
                };
            }
            contents = node.contents();
            index = self.search(&contents.keys, key);
        }
    }

    /// Finds the entry nearest to `key` under `rel`, an OR of [`LT`] and
    /// [`EQ`] (their absence meaning strictly greater): locate a
    /// predecessor, then walk successors until one satisfies the relation,
    /// falling back to the predecessor itself for LT relations.
    fn find_near(
        &self,
        key: &K,
        rel: u8,
        guard: &mut MapGuard<'_, K, V>,
    ) -> Option<SearchResults<K, V>> {
        let mut before = self.find_predecessor(key, guard);
        let mut current = self.immediate_successor(before, guard);
        loop {
            let Some(now) = current else {
                return if rel & LT == 0 { None } else { before };
            };
            let following = self.immediate_successor(Some(now), guard);
            let c = self.compare_keys(key, now.contents().keys[now.position()].key());
            if (c == Ordering::Equal && rel & EQ != 0) || (c == Ordering::Less && rel & LT == 0) {
                return Some(now);
            }
            if c != Ordering::Greater && rel & LT != 0 {
                return before;
            }
            before = Some(now);
            current = following;
        }
    }

    /* ----------------  wholesale operations  -------------- */

    fn clear(&self, guard: &mut MapGuard<'_, K, V>) {
        let node = self.allocate_node(self.empty_leaf());
        let head = Box::into_raw(Box::new(HeadNode { node, height: 0 }));
        let previous = self.root.swap(head, AcqRel);
        self.leaf_head.store(node.as_ptr(), Release);
        guard.defer_drop(Deferred::Head(unsafe { Box::from_raw(previous) }));
    }

    /// Streamlined bulk load from ascending entries: leaves are emitted at
    /// exactly the expected node size and appended to the leaf list, and a
    /// router key is raised whenever the running count crosses a power of
    /// the node size. Only run on a freshly initialized tree.
    fn extend_sorted(
        &self,
        iter: impl IntoIterator<Item = (K, V)>,
        guard: &mut MapGuard<'_, K, V>,
    ) {
        let mut keys: Vec<Item<K>> = Vec::with_capacity(AVG_LENGTH);
        let mut values: Vec<V> = Vec::with_capacity(AVG_LENGTH);
        let mut current: Option<NodeRef<K, V>> = None;
        let mut total = 0_usize;
        for (key, value) in iter {
            if self.value_proxy.is_none() {
                values.push(value);
            }
            keys.push(Item::Key(key));
            total += 1;
            if keys.len() == AVG_LENGTH {
                let pivot = keys[keys.len() - 1].key().clone();
                current = Some(self.append_sorted_leaf(
                    std::mem::take(&mut keys),
                    std::mem::take(&mut values),
                    current,
                    guard,
                ));
                self.raise_sorted_routers(total, &pivot, guard);
                keys.reserve(AVG_LENGTH);
                values.reserve(AVG_LENGTH);
            }
        }
        if !keys.is_empty() {
            self.append_sorted_leaf(keys, values, current, guard);
        }
    }

    fn append_sorted_leaf(
        &self,
        keys: Vec<Item<K>>,
        values: Vec<V>,
        current: Option<NodeRef<K, V>>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> NodeRef<K, V> {
        let values = if self.value_proxy.is_none() {
            Some(values.into_boxed_slice())
        } else {
            None
        };
        match current {
            None => {
                // the first leaf becomes the new head of the leaf list,
                // keeping the sentinel-only initial node as its tail
                let old_head = self.leaf_head();
                let contents = Contents::new(keys.into_boxed_slice(), values, None, Some(old_head));
                let node = self.allocate_node(contents);
                let head = Box::into_raw(Box::new(HeadNode { node, height: 0 }));
                self.leaf_head.store(node.as_ptr(), Release);
                let previous = self.root.swap(head, AcqRel);
                guard.defer_drop(Deferred::Head(unsafe { Box::from_raw(previous) }));
                node
            }
            Some(current) => {
                let contents = current.contents();
                let appended = Contents::new(keys.into_boxed_slice(), values, None, contents.link);
                let node = self.allocate_node(appended);
                let replace = Contents::new(
                    contents.keys.clone(),
                    contents.values.clone(),
                    None,
                    Some(node),
                );
                let installed = current.cas_contents(contents, replace, guard);
                assert!(installed.is_ok(), "bulk load raced with another writer");
                node
            }
        }
    }

    fn raise_sorted_routers(&self, total: usize, pivot: &K, guard: &mut MapGuard<'_, K, V>) {
        let mut count = total;
        let mut height = 0;
        while count & (AVG_LENGTH_MASK as usize) == 0 {
            count >>= LOG_AVG_LENGTH;
            height += 1;
        }
        let mut results: Vec<Option<SearchResults<K, V>>> = vec![None; height + 1];
        self.descend_collecting(pivot, height, &mut results, guard);
        let mut right = Some(
            results[0]
                .expect("descent did not reach the leaf level")
                .node,
        );
        for level in 1..height {
            self.insert_one_level(pivot, &mut results, right, level, guard);
            right = self.split_one_level(
                pivot,
                results[level].expect("descent did not reach this level"),
                guard,
            );
        }
        self.insert_one_level(pivot, &mut results, right, height, guard);
    }
}

/// A weakly consistent ascending iterator over a [`SkipTreeMap`].
///
/// The iterator caches the next entry as it moves, so removing the entry it
/// just yielded (with [`Iter::remove`]) never strands it. It holds an epoch
/// guard for its whole lifetime, which delays memory reclamation for the
/// map until it is dropped.
pub struct Iter<'a, K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    inner: &'a Inner<K, V>,
    guard: MapGuard<'a, K, V>,
    position: Option<(NodeRef<K, V>, *const Contents<K, V>)>,
    index: usize,
    next_entry: Option<(K, V)>,
    previous: Option<SearchResults<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let entry = self.next_entry.take()?;
        self.advance();
        Some(entry)
    }
}

impl<'a, K, V> Iter<'a, K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    /// Steps the cursor: first through the node snapshot it is on, then
    /// across links, skipping emptied nodes, stopping for good at the top
    /// sentinel.
    fn advance(&mut self) {
        let Some((node, contents_ptr)) = self.position else {
            return;
        };
        let contents: &Contents<K, V> = unsafe { &*contents_ptr };
        self.previous = Some(SearchResults::new(node, contents, Ok(self.index)));
        self.index += 1;
        let index = self.index;
        if index + 1 == contents.keys.len() && contents.keys[index].is_top() {
            self.position = None;
        } else if index == contents.keys.len() {
            let mut node = contents.link.unwrap();
            let mut contents = node.contents();
            while contents.keys.is_empty() {
                node = contents.link.unwrap();
                contents = node.contents();
            }
            if contents.keys[0].is_top() {
                self.position = None;
            } else {
                self.position = Some((node, contents as *const Contents<K, V>));
                self.index = 0;
                self.next_entry = Some((
                    contents.keys[0].key().clone(),
                    self.inner.value_at(contents, 0),
                ));
            }
        } else {
            self.next_entry = Some((
                contents.keys[index].key().clone(),
                self.inner.value_at(contents, index),
            ));
        }
    }

    /// Removes the entry most recently yielded by `next` through the
    /// standard delete path. The removal does not require the iterator's
    /// snapshot to still be current.
    ///
    /// # Panics
    ///
    /// Panics if called before any entry has been yielded, or twice for the
    /// same entry.
    pub fn remove(&mut self) {
        let previous = self
            .previous
            .take()
            .expect("Iter::remove called before an entry was yielded");
        let key = previous.contents().keys[previous.position()].key().clone();
        let _ = self
            .inner
            .remove_from_node(&key, None, previous, &mut self.guard);
    }
}

#[test]
fn basic_map() {
    let map = SkipTreeMap::<usize, usize>::default();

    let n = 1024;
    for i in 0..=n {
        assert_eq!(map.get(&i), None);
        map.insert(i, i);
        assert_eq!(map.get(&i), Some(i), "failed to get key {i}");
    }

    for (i, (k, v)) in map.iter().enumerate() {
        assert_eq!(i, k);
        assert_eq!(i, v);
    }

    assert_eq!(map.len(), n + 1);
    map.check_invariants();

    for i in 0..=n {
        assert_eq!(map.get(&i), Some(i), "failed to get key {i}");
    }

    for i in (0..=n).step_by(2) {
        assert_eq!(map.remove(&i), Some(i));
        assert_eq!(map.remove(&i), None);
    }

    map.check_invariants();

    let expected: Vec<usize> = (0..=n).filter(|i| i % 2 == 1).collect();
    let actual: Vec<usize> = map.keys().collect();
    assert_eq!(expected, actual);
}

#[test]
fn navigation() {
    let map = SkipTreeMap::<i32, &'static str>::default();

    map.insert(3, "a");
    map.insert(1, "b");
    map.insert(4, "c");

    assert_eq!(map.first_key(), Some(1));
    assert_eq!(map.last_key(), Some(4));
    assert_eq!(map.get_gte(&2), Some((3, "a")));
    assert_eq!(map.get_lte(&2), Some((1, "b")));
    assert_eq!(map.get_gt(&4), None);
    assert_eq!(map.get_lt(&1), None);

    let entries: Vec<_> = map.iter().collect();
    assert_eq!(entries, vec![(1, "b"), (3, "a"), (4, "c")]);

    map.insert(3, "z");
    assert_eq!(map.get(&3), Some("z"));
    assert_eq!(map.insert_if_absent(3, "!"), Some("z"));
    assert_eq!(map.get(&3), Some("z"));

    assert_eq!(map.remove(&3), Some("z"));
    assert!(!map.contains_key(&3));
    let entries: Vec<_> = map.iter().collect();
    assert_eq!(entries, vec![(1, "b"), (4, "c")]);
}

#[test]
fn polling_drains_in_order() {
    let n = 10_000;
    let map = SkipTreeMap::<usize, usize>::default();
    for i in 0..n {
        map.insert(i, i);
    }

    for i in 0..n {
        assert_eq!(map.pop_first(), Some((i, i)));
    }
    assert!(map.is_empty());
    assert_eq!(map.first_key_value(), None);
    assert_eq!(map.last_key_value(), None);

    for i in 0..n {
        map.insert(i, i);
    }
    for i in (0..n).rev() {
        assert_eq!(map.pop_last(), Some((i, i)));
    }
    assert!(map.is_empty());
}

#[test]
fn bulk_build_matches_insertion() {
    let map = SkipTreeMap::<u32, u32>::from_sorted_iter((0..200).map(|k| (k, k + 1)));

    assert_eq!(map.len(), 200);
    map.check_invariants();

    let entries: Vec<_> = map.iter().collect();
    let expected: Vec<_> = (0..200).map(|k| (k, k + 1)).collect();
    assert_eq!(entries, expected);

    // the tree built in bulk behaves like any other afterwards
    map.insert(500, 0);
    assert_eq!(map.remove(&500), Some(0));
    assert_eq!(map.get(&137), Some(138));
}

#[test]
fn value_proxy_mode() {
    let map = SkipTreeMap::<u64, &'static str>::with_value_proxy("present");

    assert_eq!(map.insert(1, "ignored"), None);
    assert_eq!(map.get(&1), Some("present"));
    assert_eq!(map.insert(1, "also ignored"), Some("present"));
    assert!(map.contains_value(&"present"));
    assert!(!map.contains_value(&"absent"));
    assert_eq!(map.remove(&1), Some("present"));
    assert!(map.is_empty());
}

#[test]
fn clear_resets() {
    let map = SkipTreeMap::<usize, usize>::default();
    for i in 0..100 {
        map.insert(i, i);
    }
    map.clear();
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
    map.insert(7, 7);
    assert_eq!(map.get(&7), Some(7));
}

#[test]
fn iterator_removal() {
    let map = SkipTreeMap::<usize, usize>::default();
    for i in 0..100 {
        map.insert(i, i);
    }

    let mut iter = map.iter();
    while let Some((k, _v)) = iter.next() {
        if k % 3 == 0 {
            iter.remove();
        }
    }
    drop(iter);

    let survivors: Vec<usize> = map.keys().collect();
    let expected: Vec<usize> = (0..100).filter(|k| k % 3 != 0).collect();
    assert_eq!(survivors, expected);
}

#[test]
fn descending_and_random_insertion_orders() {
    use rand::seq::SliceRandom;

    let descending = SkipTreeMap::<i64, i64>::default();
    for i in (0..2048).rev() {
        descending.insert(i, i);
    }
    descending.check_invariants();
    assert_eq!(descending.len(), 2048);
    let keys: Vec<i64> = descending.keys().collect();
    assert_eq!(keys, (0..2048).collect::<Vec<i64>>());

    let shuffled = SkipTreeMap::<i64, i64>::default();
    let mut order: Vec<i64> = (0..2048).collect();
    order.shuffle(&mut rand::thread_rng());
    for i in order {
        shuffled.insert(i, i * 10);
    }
    shuffled.check_invariants();
    let keys: Vec<i64> = shuffled.keys().collect();
    assert_eq!(keys, (0..2048).collect::<Vec<i64>>());
}

#[test]
fn comparator_ordering() {
    let map = SkipTreeMap::<u32, u32>::with_comparator(|a, b| b.cmp(a));

    for i in 0..100 {
        map.insert(i, i);
    }
    map.check_invariants();

    let keys: Vec<u32> = map.keys().collect();
    assert_eq!(keys, (0..100).rev().collect::<Vec<u32>>());
    assert_eq!(map.first_key(), Some(99));
    assert_eq!(map.last_key(), Some(0));
    assert!(map.comparator().is_some());
}

#[test]
fn level_generator_is_geometric() {
    let map = SkipTreeMap::<usize, usize>::default();
    let samples = 100_000;
    let mut raised = 0_usize;
    for _ in 0..samples {
        if map.random_level() > 0 {
            raised += 1;
        }
    }
    // one in AVG_LENGTH towers gets raised; allow generous slack
    let expected = samples / AVG_LENGTH;
    assert!(raised > expected / 2, "raised only {raised} towers");
    assert!(raised < expected * 2, "raised {raised} towers");
}
