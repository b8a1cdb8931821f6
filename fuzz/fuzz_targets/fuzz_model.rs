#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate arbitrary;
extern crate skip_tree;

use arbitrary::Arbitrary;

const KEYSPACE: u64 = 255;

#[derive(Debug)]
enum Op {
    Insert { key: u64, value: u64 },
    Remove { key: u64 },
    PopFirst,
    PopLast,
}

impl<'a> Arbitrary<'a> for Op {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(match u.int_in_range(0..=3).unwrap_or(0) {
            0 | 1 => Op::Insert {
                key: u.int_in_range(0..=KEYSPACE).unwrap_or(0),
                value: u.int_in_range(0..=KEYSPACE).unwrap_or(0),
            },
            2 => Op::Remove {
                key: u.int_in_range(0..=KEYSPACE).unwrap_or(0),
            },
            _ => {
                if bool::arbitrary(u).unwrap_or(true) {
                    Op::PopFirst
                } else {
                    Op::PopLast
                }
            }
        })
    }
}

fuzz_target!(|ops: Vec<Op>| {
    let tree = skip_tree::SkipTreeMap::default();
    let mut model = std::collections::BTreeMap::new();

    for op in ops {
        match op {
            Op::Insert { key, value } => {
                assert_eq!(tree.insert(key, value), model.insert(key, value));
            }
            Op::Remove { key } => {
                assert_eq!(tree.remove(&key), model.remove(&key));
            }
            Op::PopFirst => {
                let expected = model.first_key_value().map(|(k, v)| (*k, *v));
                if let Some((k, _)) = expected {
                    model.remove(&k);
                }
                assert_eq!(tree.pop_first(), expected);
            }
            Op::PopLast => {
                let expected = model.last_key_value().map(|(k, v)| (*k, *v));
                if let Some((k, _)) = expected {
                    model.remove(&k);
                }
                assert_eq!(tree.pop_last(), expected);
            }
        };

        for (key, value) in &model {
            assert_eq!(tree.get(key), Some(*value));
        }
    }

    tree.check_invariants();
});
