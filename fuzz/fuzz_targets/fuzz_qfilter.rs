#![no_main]
use libfuzzer_sys::fuzz_target;

use std::collections::BTreeSet;

const CHECK_EVERY: usize = 8;

fuzz_target!(|data: Vec<u16>| {
    if data.len() < 2 {
        return;
    }
    let q = 3 + (data[0] % 8) as u8; // 3..=10
    let r = 1 + (data[1] % 6) as u8; // 1..=6
    let mut f = quotient_filter::Filter::new(q, r).unwrap();
    let p_mask = (1u64 << (q + r)) - 1;

    // The "Model", under hashes restricted to q + r bits the filter must
    // behave exactly like a set.
    let mut model: BTreeSet<u64> = BTreeSet::new();
    for (i, word) in data.iter().copied().enumerate().skip(2) {
        let hash = (word & 0x7FFF) as u64 & p_mask;
        if word & 0x8000 == 0 {
            match f.insert_fingerprint(hash) {
                Ok(added) => assert_eq!(added, model.insert(hash)),
                Err(_) => assert_eq!(f.len(), f.capacity()),
            }
        } else {
            assert!(f.remove_fingerprint(hash));
            model.remove(&hash);
            assert!(!f.contains_fingerprint(hash));
        }
        assert_eq!(f.len(), model.len() as u64);

        if i % CHECK_EVERY == 0 {
            f.check_consistency();
            for &h in &model {
                assert!(f.contains_fingerprint(h));
            }
        }
    }

    f.check_consistency();
    let mut got: Vec<u64> = f.fingerprints().collect();
    got.sort_unstable();
    let expect: Vec<u64> = model.iter().copied().collect();
    assert_eq!(got, expect);
});
