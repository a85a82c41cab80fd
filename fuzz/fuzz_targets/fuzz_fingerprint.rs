#![no_main]
use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use std::collections::BTreeSet;

#[derive(Debug, Arbitrary)]
struct Input {
    q: u8,
    r: u8,
    ops: Vec<(bool, u16)>,
}

fuzz_target!(|input: Input| {
    let Input { q, r, ops } = input;
    let q = 1 + q % 10;
    let r = 1 + r % 16;
    let mut f = quotient_filter::Filter::new(q, r).unwrap();
    let p_mask = (1u64 << (q + r)) - 1;

    let mut model: BTreeSet<u64> = BTreeSet::new();
    for (add, item) in ops {
        let hash = item as u64 & p_mask;
        if add {
            match f.insert_fingerprint(hash) {
                Ok(added) => assert_eq!(added, model.insert(hash)),
                Err(_) => assert_eq!(f.len(), f.capacity()),
            }
        } else {
            assert!(f.remove_fingerprint(hash));
            model.remove(&hash);
        }
    }

    f.check_consistency();
    for &h in &model {
        assert!(f.contains_fingerprint(h));
    }
    let mut got: Vec<u64> = f.fingerprints().collect();
    got.sort_unstable();
    let expect: Vec<u64> = model.iter().copied().collect();
    assert_eq!(got, expect);

    // Merging the filter with itself keeps every fingerprint reachable.
    let out = f.merge(&f).unwrap();
    out.check_consistency();
    assert_eq!(out.len(), f.len());
    for h in f.fingerprints() {
        assert!(out.contains_fingerprint(h));
    }
});
