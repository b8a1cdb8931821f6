//! Property-based tests driving randomized operation sequences against a
//! `BTreeMap` oracle.

use proptest::prelude::*;
use skip_tree::SkipTreeMap;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Op {
    Insert(u16, u16),
    InsertIfAbsent(u16, u16),
    Remove(u16),
    Replace(u16, u16),
    PopFirst,
    PopLast,
    Lookup(u16),
    Near(u16),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (any::<u16>(), any::<u16>()).prop_map(|(k, v)| Op::Insert(k % 512, v)),
            (any::<u16>(), any::<u16>()).prop_map(|(k, v)| Op::InsertIfAbsent(k % 512, v)),
            any::<u16>().prop_map(|k| Op::Remove(k % 512)),
            (any::<u16>(), any::<u16>()).prop_map(|(k, v)| Op::Replace(k % 512, v)),
            Just(Op::PopFirst),
            Just(Op::PopLast),
            any::<u16>().prop_map(|k| Op::Lookup(k % 512)),
            any::<u16>().prop_map(|k| Op::Near(k % 512)),
        ],
        0..max_ops,
    )
}

fn apply(map: &SkipTreeMap<u16, u16>, model: &mut BTreeMap<u16, u16>, op: &Op) {
    match op {
        Op::Insert(k, v) => {
            assert_eq!(map.insert(*k, *v), model.insert(*k, *v));
        }
        Op::InsertIfAbsent(k, v) => {
            let expected = model.get(k).copied();
            if expected.is_none() {
                model.insert(*k, *v);
            }
            assert_eq!(map.insert_if_absent(*k, *v), expected);
        }
        Op::Remove(k) => {
            assert_eq!(map.remove(k), model.remove(k));
        }
        Op::Replace(k, v) => {
            let expected = model.get(k).copied();
            if expected.is_some() {
                model.insert(*k, *v);
            }
            assert_eq!(map.replace(k, *v), expected);
        }
        Op::PopFirst => {
            let expected = model.first_key_value().map(|(k, v)| (*k, *v));
            if let Some((k, _)) = expected {
                model.remove(&k);
            }
            assert_eq!(map.pop_first(), expected);
        }
        Op::PopLast => {
            let expected = model.last_key_value().map(|(k, v)| (*k, *v));
            if let Some((k, _)) = expected {
                model.remove(&k);
            }
            assert_eq!(map.pop_last(), expected);
        }
        Op::Lookup(k) => {
            assert_eq!(map.get(k), model.get(k).copied());
        }
        Op::Near(k) => {
            use std::ops::Bound;
            let lt = model
                .range((Bound::Unbounded, Bound::Excluded(*k)))
                .next_back()
                .map(|(k, v)| (*k, *v));
            assert_eq!(map.get_lt(k), lt);
            let gte = model
                .range((Bound::Included(*k), Bound::Unbounded))
                .next()
                .map(|(k, v)| (*k, *v));
            assert_eq!(map.get_gte(k), gte);
        }
    }
}

proptest! {
    /// Random operation sequences agree with the oracle step by step, and
    /// the final structure satisfies the tree's ordering invariants.
    #[test]
    fn matches_oracle(ops in operations(300)) {
        let map = SkipTreeMap::default();
        let mut model = BTreeMap::new();

        for op in &ops {
            apply(&map, &mut model, op);
        }

        map.check_invariants();
        let expected: Vec<(u16, u16)> = model.iter().map(|(k, v)| (*k, *v)).collect();
        let actual: Vec<(u16, u16)> = map.iter().collect();
        prop_assert_eq!(expected, actual);
        prop_assert_eq!(map.len(), model.len());
    }

    /// Bounded views yield exactly the oracle's range, in both directions.
    #[test]
    fn ranges_match_oracle(
        keys in prop::collection::btree_set(any::<u16>(), 0..400),
        lo in any::<u16>(),
        span in 0_u16..2000,
    ) {
        let hi = lo.saturating_add(span);

        let map: SkipTreeMap<u16, u16> = keys.iter().map(|k| (*k, *k)).collect();
        let model: BTreeMap<u16, u16> = keys.iter().map(|k| (*k, *k)).collect();

        let sub = map.sub_map(Some(lo), true, Some(hi), false);
        let expected: Vec<u16> = model.range(lo..hi).map(|(k, _v)| *k).collect();
        let actual: Vec<u16> = sub.iter().map(|(k, _v)| k).collect();
        prop_assert_eq!(&expected, &actual);

        let reversed: Vec<u16> = sub.descending_map().iter().map(|(k, _v)| k).collect();
        let mut expected_rev = expected;
        expected_rev.reverse();
        prop_assert_eq!(expected_rev, reversed);

        prop_assert_eq!(sub.len(), model.range(lo..hi).count());
    }

    /// A map built from sorted input is indistinguishable from one built by
    /// per-key insertion.
    #[test]
    fn bulk_build_matches_oracle(keys in prop::collection::btree_set(any::<u16>(), 0..600)) {
        let sorted: Vec<(u16, u16)> = keys.iter().map(|k| (*k, k.wrapping_mul(3))).collect();
        let bulk = SkipTreeMap::from_sorted_iter(sorted.iter().copied());
        let inserted: SkipTreeMap<u16, u16> = sorted.iter().copied().collect();

        bulk.check_invariants();
        prop_assert_eq!(bulk.iter().collect::<Vec<_>>(), inserted.iter().collect::<Vec<_>>());
        prop_assert_eq!(bulk.first_key_value(), inserted.first_key_value());
        prop_assert_eq!(bulk.last_key_value(), inserted.last_key_value());
    }
}
