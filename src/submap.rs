use std::cmp::Ordering;
use std::fmt;

use crate::node::SearchResults;
use crate::{MapGuard, SkipTreeMap, EQ, GT, LT};

/// A bounded (and possibly reversed) view over a [`SkipTreeMap`].
///
/// The view holds a handle to the underlying map, so it is `'static` and
/// can be sent to other threads; all reads and writes go straight through
/// to the shared tree. Queries are clipped to the bounds, mutations outside
/// the bounds panic, and when the view is descending every relational
/// operation has its direction flipped.
pub struct SubMap<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    map: SkipTreeMap<K, V>,
    lo: Option<K>,
    lo_inclusive: bool,
    hi: Option<K>,
    hi_inclusive: bool,
    descending: bool,
}

impl<K, V> Clone for SubMap<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    fn clone(&self) -> SubMap<K, V> {
        SubMap {
            map: self.map.clone(),
            lo: self.lo.clone(),
            lo_inclusive: self.lo_inclusive,
            hi: self.hi.clone(),
            hi_inclusive: self.hi_inclusive,
            descending: self.descending,
        }
    }
}

impl<K, V> fmt::Debug for SubMap<K, V>
where
    K: 'static + fmt::Debug + Clone + Ord + Send + Sync,
    V: 'static + fmt::Debug + Clone + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SubMap ")?;
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> SubMap<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    pub(crate) fn new(
        map: SkipTreeMap<K, V>,
        lo: Option<K>,
        lo_inclusive: bool,
        hi: Option<K>,
        hi_inclusive: bool,
        descending: bool,
    ) -> SubMap<K, V> {
        if let (Some(lo), Some(hi)) = (&lo, &hi) {
            assert!(
                map.inner.compare_keys(lo, hi) != Ordering::Greater,
                "inconsistent range"
            );
        }
        SubMap {
            map,
            lo,
            lo_inclusive,
            hi,
            hi_inclusive,
            descending,
        }
    }

    /* ----------------  bound arithmetic  -------------- */

    fn too_low(&self, key: &K) -> bool {
        if let Some(lo) = &self.lo {
            let c = self.map.inner.compare_keys(key, lo);
            if c == Ordering::Less || (c == Ordering::Equal && !self.lo_inclusive) {
                return true;
            }
        }
        false
    }

    fn too_high(&self, key: &K) -> bool {
        if let Some(hi) = &self.hi {
            let c = self.map.inner.compare_keys(key, hi);
            if c == Ordering::Greater || (c == Ordering::Equal && !self.hi_inclusive) {
                return true;
            }
        }
        false
    }

    fn in_bounds(&self, key: &K) -> bool {
        !self.too_low(key) && !self.too_high(key)
    }

    fn check_key_bounds(&self, key: &K) {
        assert!(self.in_bounds(key), "key out of range");
    }

    /// Whether this position still lies below the view's upper bound.
    fn is_before_end(&self, results: &SearchResults<K, V>) -> bool {
        if let Some(hi) = &self.hi {
            let contents = results.contents();
            let key = contents.keys[results.position()].key();
            let c = self.map.inner.compare_keys(key, hi);
            !(c == Ordering::Greater || (c == Ordering::Equal && !self.hi_inclusive))
        } else {
            true
        }
    }

    /// Lowest position of the underlying map that could be in range. The
    /// caller still needs to check the upper bound.
    fn lo_node(&self, guard: &mut MapGuard<'_, K, V>) -> Option<SearchResults<K, V>> {
        match &self.lo {
            None => self.map.inner.find_first(guard),
            Some(lo) if self.lo_inclusive => self.map.inner.find_near(lo, GT | EQ, guard),
            Some(lo) => self.map.inner.find_near(lo, GT, guard),
        }
    }

    /// Highest position of the underlying map that could be in range. The
    /// caller still needs to check both bounds.
    fn hi_node(&self, guard: &mut MapGuard<'_, K, V>) -> Option<SearchResults<K, V>> {
        match &self.hi {
            None => self.map.inner.find_last(guard),
            Some(hi) if self.hi_inclusive => self.map.inner.find_near(hi, LT | EQ, guard),
            Some(hi) => self.map.inner.find_near(hi, LT, guard),
        }
    }

    fn lowest_entry(&self) -> Option<(K, V)> {
        let mut guard = self.map.ebr.pin();
        let results = self.lo_node(&mut guard)?;
        if !self.is_before_end(&results) {
            return None;
        }
        Some(self.map.inner.entry_of(&results))
    }

    fn highest_entry(&self) -> Option<(K, V)> {
        let mut guard = self.map.ebr.pin();
        let results = self.hi_node(&mut guard)?;
        let entry = self.map.inner.entry_of(&results);
        if !self.in_bounds(&entry.0) {
            return None;
        }
        Some(entry)
    }

    fn remove_lowest(&self) -> Option<(K, V)> {
        let mut guard = self.map.ebr.pin();
        loop {
            let results = self.lo_node(&mut guard)?;
            let (key, _observed) = self.map.inner.entry_of(&results);
            if !self.in_bounds(&key) {
                return None;
            }
            if let Some(value) = self.map.inner.do_remove(&key, None, &mut guard) {
                return Some((key, value));
            }
        }
    }

    fn remove_highest(&self) -> Option<(K, V)> {
        let mut guard = self.map.ebr.pin();
        loop {
            let results = self.hi_node(&mut guard)?;
            let (key, _observed) = self.map.inner.entry_of(&results);
            if !self.in_bounds(&key) {
                return None;
            }
            if let Some(value) = self.map.inner.do_remove(&key, None, &mut guard) {
                return Some((key, value));
            }
        }
    }

    /// Relational lookup with the relation flipped for descending views and
    /// the result clipped to the bounds.
    fn near_entry(&self, key: &K, mut rel: u8) -> Option<(K, V)> {
        if self.descending {
            if rel & LT == 0 {
                rel |= LT;
            } else {
                rel &= !LT;
            }
        }
        if self.too_low(key) {
            return if rel & LT != 0 {
                None
            } else {
                self.lowest_entry()
            };
        }
        if self.too_high(key) {
            return if rel & LT != 0 {
                self.highest_entry()
            } else {
                None
            };
        }
        let mut guard = self.map.ebr.pin();
        let results = self.map.inner.find_near(key, rel, &mut guard)?;
        let entry = self.map.inner.entry_of(&results);
        if !self.in_bounds(&entry.0) {
            return None;
        }
        Some(entry)
    }

    /* ----------------  queries  -------------- */

    /// Get the value for `key` if it lies within the view's bounds.
    pub fn get(&self, key: &K) -> Option<V> {
        if !self.in_bounds(key) {
            return None;
        }
        self.map.get(key)
    }

    /// Whether `key` is within bounds and present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.in_bounds(key) && self.map.contains_key(key)
    }

    /// Whether some in-range key maps to `value`. Linear in the size of the
    /// view.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let mut guard = self.map.ebr.pin();
        let mut cursor = self.lo_node(&mut guard);
        while let Some(results) = cursor {
            if !self.is_before_end(&results) {
                break;
            }
            let (_key, stored) = self.map.inner.entry_of(&results);
            if &stored == value {
                return true;
            }
            cursor = self.map.inner.immediate_successor(Some(results), &guard);
        }
        false
    }

    /// The number of entries inside the bounds. This walks the view and is
    /// linear in its size.
    pub fn len(&self) -> usize {
        let mut guard = self.map.ebr.pin();
        let mut count = 0;
        let mut cursor = self.lo_node(&mut guard);
        while let Some(results) = cursor {
            if !self.is_before_end(&results) {
                break;
            }
            count += 1;
            cursor = self.map.inner.immediate_successor(Some(results), &guard);
        }
        count
    }

    /// Whether no entry lies inside the bounds.
    pub fn is_empty(&self) -> bool {
        let mut guard = self.map.ebr.pin();
        match self.lo_node(&mut guard) {
            Some(results) => !self.is_before_end(&results),
            None => true,
        }
    }

    /* ----------------  mutation  -------------- */

    /// Insert through the view.
    ///
    /// # Panics
    ///
    /// Panics if `key` lies outside the view's bounds.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.check_key_bounds(&key);
        self.map.insert(key, value)
    }

    /// Insert through the view only if the key is absent.
    ///
    /// # Panics
    ///
    /// Panics if `key` lies outside the view's bounds.
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<V> {
        self.check_key_bounds(&key);
        self.map.insert_if_absent(key, value)
    }

    /// Replace the value under an in-range existing key.
    ///
    /// # Panics
    ///
    /// Panics if `key` lies outside the view's bounds.
    pub fn replace(&self, key: &K, value: V) -> Option<V> {
        self.check_key_bounds(key);
        self.map.replace(key, value)
    }

    /// Replace the value under an in-range key if it currently equals
    /// `expected`.
    ///
    /// # Panics
    ///
    /// Panics if `key` lies outside the view's bounds.
    pub fn replace_if(&self, key: &K, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        self.check_key_bounds(key);
        self.map.replace_if(key, expected, value)
    }

    /// Remove an in-range key. Out-of-range keys are simply reported as
    /// absent.
    pub fn remove(&self, key: &K) -> Option<V> {
        if !self.in_bounds(key) {
            return None;
        }
        self.map.remove(key)
    }

    /// Remove an in-range key whose value currently equals `expected`.
    pub fn remove_if(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        self.in_bounds(key) && self.map.remove_if(key, expected)
    }

    /// Remove every entry inside the bounds, one at a time.
    pub fn clear(&self) {
        let mut guard = self.map.ebr.pin();
        let mut cursor = self.lo_node(&mut guard);
        while let Some(results) = cursor {
            if !self.is_before_end(&results) {
                break;
            }
            let (key, _value) = self.map.inner.entry_of(&results);
            let _ = self.map.inner.do_remove(&key, None, &mut guard);
            cursor = self.map.inner.immediate_successor(Some(results), &guard);
        }
    }

    /* ----------------  endpoints  -------------- */

    /// The first entry of the view, honoring its direction.
    pub fn first_key_value(&self) -> Option<(K, V)> {
        if self.descending {
            self.highest_entry()
        } else {
            self.lowest_entry()
        }
    }

    /// The last entry of the view, honoring its direction.
    pub fn last_key_value(&self) -> Option<(K, V)> {
        if self.descending {
            self.lowest_entry()
        } else {
            self.highest_entry()
        }
    }

    /// The first key of the view, honoring its direction.
    pub fn first_key(&self) -> Option<K> {
        self.first_key_value().map(|(k, _v)| k)
    }

    /// The last key of the view, honoring its direction.
    pub fn last_key(&self) -> Option<K> {
        self.last_key_value().map(|(k, _v)| k)
    }

    /// Remove and return the first entry of the view.
    pub fn pop_first(&self) -> Option<(K, V)> {
        if self.descending {
            self.remove_highest()
        } else {
            self.remove_lowest()
        }
    }

    /// Remove and return the last entry of the view.
    pub fn pop_last(&self) -> Option<(K, V)> {
        if self.descending {
            self.remove_lowest()
        } else {
            self.remove_highest()
        }
    }

    /* ----------------  relational lookups  -------------- */

    /// The in-range entry with the greatest key strictly less than `key`
    /// in the view's own direction.
    pub fn get_lt(&self, key: &K) -> Option<(K, V)> {
        self.near_entry(key, LT)
    }

    /// The in-range entry with the greatest key at most `key` in the
    /// view's own direction.
    pub fn get_lte(&self, key: &K) -> Option<(K, V)> {
        self.near_entry(key, LT | EQ)
    }

    /// The in-range entry with the least key strictly greater than `key`
    /// in the view's own direction.
    pub fn get_gt(&self, key: &K) -> Option<(K, V)> {
        self.near_entry(key, GT)
    }

    /// The in-range entry with the least key at least `key` in the view's
    /// own direction.
    pub fn get_gte(&self, key: &K) -> Option<(K, V)> {
        self.near_entry(key, GT | EQ)
    }

    /* ----------------  re-subviewing  -------------- */

    fn new_sub_map(
        &self,
        mut from: Option<K>,
        mut from_inclusive: bool,
        mut to: Option<K>,
        mut to_inclusive: bool,
    ) -> SubMap<K, V> {
        if self.descending {
            // flip senses: the caller speaks in view order
            std::mem::swap(&mut from, &mut to);
            std::mem::swap(&mut from_inclusive, &mut to_inclusive);
        }
        let (from, from_inclusive) = match (&self.lo, from) {
            (Some(lo), None) => (Some(lo.clone()), self.lo_inclusive),
            (Some(lo), Some(from)) => {
                let c = self.map.inner.compare_keys(&from, lo);
                assert!(
                    !(c == Ordering::Less
                        || (c == Ordering::Equal && !self.lo_inclusive && from_inclusive)),
                    "key out of range"
                );
                (Some(from), from_inclusive)
            }
            (None, from) => (from, from_inclusive),
        };
        let (to, to_inclusive) = match (&self.hi, to) {
            (Some(hi), None) => (Some(hi.clone()), self.hi_inclusive),
            (Some(hi), Some(to)) => {
                let c = self.map.inner.compare_keys(&to, hi);
                assert!(
                    !(c == Ordering::Greater
                        || (c == Ordering::Equal && !self.hi_inclusive && to_inclusive)),
                    "key out of range"
                );
                (Some(to), to_inclusive)
            }
            (None, to) => (to, to_inclusive),
        };
        SubMap::new(
            self.map.clone(),
            from,
            from_inclusive,
            to,
            to_inclusive,
            self.descending,
        )
    }

    /// A narrower view. Bounds are given in this view's direction and are
    /// intersected with the current bounds.
    ///
    /// # Panics
    ///
    /// Panics if the requested bounds widen the view.
    pub fn sub_map(
        &self,
        from: K,
        from_inclusive: bool,
        to: K,
        to_inclusive: bool,
    ) -> SubMap<K, V> {
        self.new_sub_map(Some(from), from_inclusive, Some(to), to_inclusive)
    }

    /// A narrower view keeping this view's lower bound.
    ///
    /// # Panics
    ///
    /// Panics if the requested bound widens the view.
    pub fn head_map(&self, to: K, inclusive: bool) -> SubMap<K, V> {
        self.new_sub_map(None, false, Some(to), inclusive)
    }

    /// A narrower view keeping this view's upper bound.
    ///
    /// # Panics
    ///
    /// Panics if the requested bound widens the view.
    pub fn tail_map(&self, from: K, inclusive: bool) -> SubMap<K, V> {
        self.new_sub_map(Some(from), inclusive, None, false)
    }

    /// The same bounds, walked in the opposite direction.
    pub fn descending_map(&self) -> SubMap<K, V> {
        SubMap {
            map: self.map.clone(),
            lo: self.lo.clone(),
            lo_inclusive: self.lo_inclusive,
            hi: self.hi.clone(),
            hi_inclusive: self.hi_inclusive,
            descending: !self.descending,
        }
    }

    /// Iterate over the view in its own direction. Weakly consistent, like
    /// [`SkipTreeMap::iter`].
    pub fn iter(&self) -> SubIter<'_, K, V> {
        let mut guard = self.map.ebr.pin();
        let next = if self.descending {
            self.hi_node(&mut guard)
        } else {
            self.lo_node(&mut guard)
        };
        let mut iter = SubIter {
            sub: self,
            guard,
            next,
            next_value: None,
            last_key: None,
        };
        if let Some(results) = iter.next {
            let (key, value) = iter.sub.map.inner.entry_of(&results);
            if iter.sub.in_bounds(&key) {
                iter.next_value = Some(value);
            } else {
                iter.next = None;
            }
        }
        iter
    }
}

impl<'a, K, V> IntoIterator for &'a SubMap<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    type Item = (K, V);
    type IntoIter = SubIter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A weakly consistent iterator over a [`SubMap`], ascending or descending
/// according to the view's direction.
pub struct SubIter<'a, K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    sub: &'a SubMap<K, V>,
    guard: MapGuard<'a, K, V>,
    next: Option<SearchResults<K, V>>,
    next_value: Option<V>,
    last_key: Option<K>,
}

impl<'a, K, V> Iterator for SubIter<'a, K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let results = self.next?;
        let value = self.next_value.take()?;
        let key = results.contents().keys[results.position()].key().clone();
        self.last_key = Some(key.clone());
        if self.sub.descending {
            self.step_down(&key);
        } else {
            self.step_up(results);
        }
        Some((key, value))
    }
}

impl<'a, K, V> SubIter<'a, K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    fn step_up(&mut self, from: SearchResults<K, V>) {
        self.next = self
            .sub
            .map
            .inner
            .immediate_successor(Some(from), &self.guard);
        if let Some(results) = self.next {
            let (key, value) = self.sub.map.inner.entry_of(&results);
            if self.sub.too_high(&key) {
                self.next = None;
            } else {
                self.next_value = Some(value);
            }
        }
    }

    fn step_down(&mut self, from_key: &K) {
        self.next = self.sub.map.inner.find_near(from_key, LT, &mut self.guard);
        if let Some(results) = self.next {
            let (key, value) = self.sub.map.inner.entry_of(&results);
            if self.sub.too_low(&key) {
                self.next = None;
            } else {
                self.next_value = Some(value);
            }
        }
    }

    /// Removes the entry most recently yielded by `next` from the
    /// underlying map.
    ///
    /// # Panics
    ///
    /// Panics if called before any entry has been yielded, or twice for the
    /// same entry.
    pub fn remove(&mut self) {
        let key = self
            .last_key
            .take()
            .expect("SubIter::remove called before an entry was yielded");
        let _ = self.sub.map.inner.do_remove(&key, None, &mut self.guard);
    }
}
