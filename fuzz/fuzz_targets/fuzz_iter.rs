#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate arbitrary;
extern crate skip_tree;

use arbitrary::Arbitrary;

#[derive(Debug, Arbitrary)]
struct Input {
    keys: Vec<u16>,
    lo: u16,
    span: u8,
}

fuzz_target!(|input: Input| {
    let tree: skip_tree::SkipTreeMap<u16, u16> =
        input.keys.iter().map(|k| (*k, k.wrapping_add(1))).collect();
    let model: std::collections::BTreeMap<u16, u16> =
        input.keys.iter().map(|k| (*k, k.wrapping_add(1))).collect();

    let expected: Vec<(u16, u16)> = model.iter().map(|(k, v)| (*k, *v)).collect();
    let actual: Vec<(u16, u16)> = tree.iter().collect();
    assert_eq!(expected, actual);

    let hi = input.lo.saturating_add(u16::from(input.span));
    let sub = tree.sub_map(Some(input.lo), true, Some(hi), false);
    let expected_range: Vec<u16> = model.range(input.lo..hi).map(|(k, _v)| *k).collect();
    let actual_range: Vec<u16> = sub.iter().map(|(k, _v)| k).collect();
    assert_eq!(expected_range, actual_range);

    let mut descending: Vec<u16> = sub.descending_map().iter().map(|(k, _v)| k).collect();
    descending.reverse();
    assert_eq!(expected_range, descending);
});
