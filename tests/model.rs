//! Deterministic tests comparing the skip tree against a BTreeMap oracle,
//! plus end-to-end scenarios exercising the navigable surface with literal
//! values.

use skip_tree::SkipTreeMap;
use std::collections::BTreeMap;

fn map_model(items: &[u64]) -> (SkipTreeMap<u64, u64>, BTreeMap<u64, u64>) {
    let map = SkipTreeMap::default();
    let mut model = BTreeMap::new();

    for item in items {
        map.insert(*item, *item);
        model.insert(*item, *item);
    }

    (map, model)
}

fn prop_iter_matches(map: &SkipTreeMap<u64, u64>, model: &BTreeMap<u64, u64>) {
    let expected = model.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
    let actual = map.iter().collect::<Vec<_>>();
    assert_eq!(expected, actual);
}

fn prop_rev_iter_matches(map: &SkipTreeMap<u64, u64>, model: &BTreeMap<u64, u64>) {
    let expected = model
        .iter()
        .rev()
        .map(|(k, v)| (*k, *v))
        .collect::<Vec<_>>();
    let actual = map.descending_map().iter().collect::<Vec<_>>();
    assert_eq!(expected, actual);
}

fn prop_range_matches(
    map: &SkipTreeMap<u64, u64>,
    model: &BTreeMap<u64, u64>,
    bounds: std::ops::Range<u64>,
) {
    let expected = model
        .range(bounds.clone())
        .map(|(k, _v)| *k)
        .collect::<Vec<_>>();
    let sub = map.sub_map(Some(bounds.start), true, Some(bounds.end), false);
    let actual = sub.iter().map(|(k, _v)| k).collect::<Vec<_>>();
    assert_eq!(expected, actual);
}

fn prop_near_matches(map: &SkipTreeMap<u64, u64>, model: &BTreeMap<u64, u64>, probe: u64) {
    use std::ops::Bound;

    let lt = model
        .range((Bound::Unbounded, Bound::Excluded(probe)))
        .next_back()
        .map(|(k, v)| (*k, *v));
    assert_eq!(map.get_lt(&probe), lt, "get_lt({probe})");

    let lte = model
        .range((Bound::Unbounded, Bound::Included(probe)))
        .next_back()
        .map(|(k, v)| (*k, *v));
    assert_eq!(map.get_lte(&probe), lte, "get_lte({probe})");

    let gt = model
        .range((Bound::Excluded(probe), Bound::Unbounded))
        .next()
        .map(|(k, v)| (*k, *v));
    assert_eq!(map.get_gt(&probe), gt, "get_gt({probe})");

    let gte = model
        .range((Bound::Included(probe), Bound::Unbounded))
        .next()
        .map(|(k, v)| (*k, *v));
    assert_eq!(map.get_gte(&probe), gte, "get_gte({probe})");
}

#[test]
fn oracle_small() {
    let items = [95, 126, 2, 73, 0, 106, 54];

    let (map, model) = map_model(&items);

    prop_iter_matches(&map, &model);
    prop_rev_iter_matches(&map, &model);
    prop_range_matches(&map, &model, 81..124);
    prop_range_matches(&map, &model, 0..128);
    for probe in 0..128 {
        prop_near_matches(&map, &model, probe);
    }
}

#[test]
fn oracle_multi_node() {
    // enough keys to force several leaves and router levels
    let items: Vec<u64> = (0..4096).map(|i| (i * 2654435761) % 65536).collect();

    let (map, mut model) = map_model(&items);
    map.check_invariants();

    prop_iter_matches(&map, &model);
    prop_rev_iter_matches(&map, &model);
    prop_range_matches(&map, &model, 1000..50_000);

    for probe in (0..65_536).step_by(997) {
        prop_near_matches(&map, &model, probe);
    }

    // remove a third, then re-verify
    for key in items.iter().step_by(3) {
        assert_eq!(map.remove(key), model.remove(key));
    }
    map.check_invariants();
    prop_iter_matches(&map, &model);
    for probe in (0..65_536).step_by(991) {
        prop_near_matches(&map, &model, probe);
    }
}

#[test]
fn scenario_insert_and_navigate() {
    let map = SkipTreeMap::<i32, &'static str>::default();
    map.insert(3, "a");
    map.insert(1, "b");
    map.insert(4, "c");

    assert_eq!(map.first_key(), Some(1));
    assert_eq!(map.last_key(), Some(4));
    assert_eq!(map.get_gte(&2).map(|(k, _)| k), Some(3));
    assert_eq!(map.get_lte(&2).map(|(k, _)| k), Some(1));
    assert_eq!(
        map.iter().collect::<Vec<_>>(),
        vec![(1, "b"), (3, "a"), (4, "c")]
    );

    // overwrite, then conditional insert observes the overwrite
    map.insert(3, "z");
    assert_eq!(map.get(&3), Some("z"));
    assert_eq!(map.insert_if_absent(3, "!"), Some("z"));
    assert_eq!(map.get(&3), Some("z"));

    // removal
    map.remove(&3);
    assert!(!map.contains_key(&3));
    assert_eq!(map.iter().collect::<Vec<_>>(), vec![(1, "b"), (4, "c")]);

    // bounded views over what is left
    let low = map.sub_map(Some(1), true, Some(4), false);
    assert_eq!(low.iter().collect::<Vec<_>>(), vec![(1, "b")]);
    let high = map.sub_map(Some(1), false, Some(4), true);
    assert_eq!(high.iter().collect::<Vec<_>>(), vec![(4, "c")]);
}

#[test]
fn scenario_single_key_lifecycle() {
    let map = SkipTreeMap::<u8, u8>::default();
    map.insert(7, 7);
    assert_eq!(map.remove(&7), Some(7));
    assert!(map.is_empty());
    assert_eq!(map.first_key_value(), None);
    assert_eq!(map.last_key_value(), None);
    assert_eq!(map.len(), 0);
}

#[test]
fn scenario_bulk_build_then_drain() {
    let map = SkipTreeMap::<u32, char>::from_sorted_iter(
        (1..=200).map(|k| (k, char::from_u32('a' as u32 + (k - 1) % 26).unwrap())),
    );

    map.check_invariants();
    let entries: Vec<_> = map.iter().collect();
    assert_eq!(entries.len(), 200);
    for (i, (k, _)) in entries.iter().enumerate() {
        assert_eq!(*k, i as u32 + 1);
    }

    for k in 1..=200 {
        let popped = map.pop_first().unwrap();
        assert_eq!(popped.0, k);
    }
    assert!(map.is_empty());
}

#[test]
fn duplicate_values_under_distinct_keys() {
    let map = SkipTreeMap::<u32, &'static str>::default();
    map.insert(1, "same");
    map.insert(2, "same");
    map.insert(3, "other");

    assert!(map.contains_value(&"same"));
    assert!(map.contains_value(&"other"));
    assert!(!map.contains_value(&"missing"));

    map.remove(&1);
    assert!(map.contains_value(&"same"));
    map.remove(&2);
    assert!(!map.contains_value(&"same"));
}

#[test]
fn replace_family() {
    let map = SkipTreeMap::<u32, u32>::default();

    assert_eq!(map.replace(&1, 10), None);
    assert!(!map.replace_if(&1, &0, 10));

    map.insert(1, 1);
    assert_eq!(map.replace(&1, 10), Some(1));
    assert!(map.replace_if(&1, &10, 20));
    assert!(!map.replace_if(&1, &10, 30));
    assert_eq!(map.get(&1), Some(20));

    assert!(!map.remove_if(&1, &10));
    assert!(map.remove_if(&1, &20));
    assert_eq!(map.get(&1), None);
}

#[test]
fn sub_map_views() {
    let map: SkipTreeMap<i64, i64> = (0..100).map(|k| (k, k * 10)).collect();

    let sub = map.sub_map(Some(10), true, Some(20), false);
    assert_eq!(sub.len(), 10);
    assert!(!sub.is_empty());
    assert_eq!(sub.first_key(), Some(10));
    assert_eq!(sub.last_key(), Some(19));
    assert_eq!(sub.get(&15), Some(150));
    assert_eq!(sub.get(&25), None);
    assert!(sub.contains_value(&150));
    assert!(!sub.contains_value(&250));

    // relational lookups clip at the bounds
    assert_eq!(sub.get_lt(&10), None);
    assert_eq!(sub.get_lt(&5), None);
    assert_eq!(sub.get_gte(&19), Some((19, 190)));
    assert_eq!(sub.get_gt(&19), None);
    assert_eq!(sub.get_gt(&5), Some((10, 100)));
    assert_eq!(sub.get_lte(&50), Some((19, 190)));

    // a descending view of the same bounds
    let descending = sub.descending_map();
    let keys: Vec<i64> = descending.iter().map(|(k, _v)| k).collect();
    assert_eq!(keys, (10..20).rev().collect::<Vec<i64>>());
    assert_eq!(descending.first_key(), Some(19));
    assert_eq!(descending.last_key(), Some(10));
    assert_eq!(descending.get_gt(&15), Some((14, 140)));
    assert_eq!(descending.get_lt(&15), Some((16, 160)));

    // re-subviewing intersects
    let narrower = sub.sub_map(12, true, 15, false);
    assert_eq!(
        narrower.iter().map(|(k, _v)| k).collect::<Vec<_>>(),
        vec![12, 13, 14]
    );

    // mutation through the view
    assert_eq!(sub.remove(&12), Some(120));
    assert_eq!(map.get(&12), None);
    sub.insert(12, 999);
    assert_eq!(map.get(&12), Some(999));

    // out-of-range keys are invisible rather than reachable
    assert_eq!(sub.remove(&50), None);
    assert_eq!(map.get(&50), Some(500));

    // pops honor direction
    assert_eq!(sub.pop_first(), Some((10, 100)));
    assert_eq!(sub.pop_last(), Some((19, 190)));
    assert_eq!(descending.pop_first(), Some((18, 180)));

    // head and tail views
    let head = map.head_map(5, false);
    assert_eq!(head.iter().map(|(k, _v)| k).collect::<Vec<_>>(), vec![
        0, 1, 2, 3, 4
    ]);
    let tail = map.tail_map(97, true);
    assert_eq!(tail.iter().map(|(k, _v)| k).collect::<Vec<_>>(), vec![
        97, 98, 99
    ]);
}

#[test]
#[should_panic(expected = "key out of range")]
fn sub_map_rejects_out_of_bounds_insert() {
    let map: SkipTreeMap<i64, i64> = (0..10).map(|k| (k, k)).collect();
    let sub = map.sub_map(Some(2), true, Some(5), false);
    sub.insert(7, 7);
}

#[test]
#[should_panic(expected = "key out of range")]
fn sub_map_rejects_widening() {
    let map: SkipTreeMap<i64, i64> = (0..10).map(|k| (k, k)).collect();
    let sub = map.sub_map(Some(2), true, Some(5), false);
    let _ = sub.sub_map(0, true, 5, false);
}

#[test]
#[should_panic(expected = "inconsistent range")]
fn sub_map_rejects_inverted_bounds() {
    let map: SkipTreeMap<i64, i64> = (0..10).map(|k| (k, k)).collect();
    let _ = map.sub_map(Some(5), true, Some(2), false);
}

#[test]
fn sub_map_iterator_removal() {
    let map: SkipTreeMap<i64, i64> = (0..30).map(|k| (k, k)).collect();
    let sub = map.sub_map(Some(10), true, Some(20), false);

    let mut iter = sub.iter();
    while let Some((k, _v)) = iter.next() {
        if k % 2 == 0 {
            iter.remove();
        }
    }
    drop(iter);

    let survivors: Vec<i64> = map.keys().collect();
    let expected: Vec<i64> = (0..30).filter(|k| *k < 10 || *k >= 20 || k % 2 == 1).collect();
    assert_eq!(survivors, expected);
}

#[test]
fn sub_map_clear_only_clears_range() {
    let map: SkipTreeMap<i64, i64> = (0..30).map(|k| (k, k)).collect();
    map.sub_map(Some(10), true, Some(20), false).clear();

    let survivors: Vec<i64> = map.keys().collect();
    let expected: Vec<i64> = (0..30).filter(|k| *k < 10 || *k >= 20).collect();
    assert_eq!(survivors, expected);
}

#[test]
fn map_equality() {
    let a: SkipTreeMap<u32, u32> = (0..100).map(|k| (k, k)).collect();
    let b: SkipTreeMap<u32, u32> = (0..100).rev().map(|k| (k, k)).collect();
    assert_eq!(a, b);

    b.insert(100, 100);
    assert_ne!(a, b);
}

#[cfg(feature = "serde")]
#[test]
fn serde_round_trip() {
    let map: SkipTreeMap<u32, String> = (0..100).map(|k| (k, format!("v{k}"))).collect();

    let serialized = serde_json::to_string(&map).unwrap();
    let restored: SkipTreeMap<u32, String> = serde_json::from_str(&serialized).unwrap();

    assert_eq!(map, restored);
}
