//! Approximate Membership Query Filter ([AMQ-Filter](https://en.wikipedia.org/wiki/Approximate_Membership_Query_Filter))
//! based on the classic [quotient filter](https://en.wikipedia.org/wiki/Quotient_filter).
//!
//! Like a bloom filter it admits false positives but never false negatives, while
//! storing each fingerprint contiguously in a single linear table. That layout gives
//! good cache locality and additionally supports deletions, merging without rehashing
//! and enumeration of the stored fingerprints.
//!
//! ### Example
//!
//! ```rust
//! let mut f = quotient_filter::Filter::with_capacity(1000, 0.01).unwrap();
//! for i in 0..1000 {
//!     f.insert(i).unwrap();
//! }
//! for i in 0..1000 {
//!     assert!(f.contains(i));
//! }
//! ```
//!
//! ### Hasher
//!
//! The hashing algorithm used is [xxhash3](https://crates.io/crates/xxhash-rust)
//! which offers both high performance and stability across platforms.
//!
//! ### Hash widths
//!
//! A filter built with quotient width `q` and remainder width `r` stores the low
//! `p = q + r` bits of each hash. Two distinct hashes that agree on those low bits
//! collapse into a single stored fingerprint, so removing one of them would produce
//! a false negative for the other. For that reason [`Filter::remove_fingerprint`]
//! refuses hashes with bits set above the fingerprint width, and callers that feed
//! the fingerprint API directly should mask their inputs to `p` bits.
//!
//! ### Filter size
//!
//! Each of the `2^q` slots takes `r + 3` bits, three of which are metadata flags.
//! The false positive rate when holding `n` fingerprints is approximately
//! `1 - e^(-n / 2^(q + r))`.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::{
    cmp::Ordering,
    hash::{Hash, Hasher},
    num::{NonZeroU64, NonZeroU8},
};

#[cfg(feature = "jsonschema")]
use schemars::JsonSchema;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use stable_hasher::StableHasher;

mod stable_hasher;

/// Space efficient approximate membership set for 64 bit hashes.
///
/// The filter is a hash table that stores fingerprints in a very compact way.
/// A fingerprint is the low `q + r` bit projection of a hash, split into a q bit
/// quotient used as the canonical slot index and an r bit remainder stored in the
/// slot. Fingerprints that share a quotient are kept as a sorted run, and runs
/// that overflow their canonical slot are shifted right into neighboring slots,
/// with three metadata bits per slot encoding the displaced structure.
///
/// False positives stem from distinct hashes sharing a fingerprint. Restricted
/// to hashes of the fingerprint width `p = q + r` the filter behaves exactly
/// like a set, which is what makes deletions sound.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "jsonschema", derive(JsonSchema))]
pub struct Filter {
    #[cfg_attr(
        feature = "serde",
        serde(
            rename = "b",
            serialize_with = "serde_bytes::serialize",
            deserialize_with = "serde_bytes::deserialize"
        )
    )]
    buffer: Box<[u8]>,
    #[cfg_attr(feature = "serde", serde(rename = "l"))]
    len: u64,
    #[cfg_attr(feature = "serde", serde(rename = "q"))]
    qbits: NonZeroU8,
    #[cfg_attr(feature = "serde", serde(rename = "r"))]
    rbits: NonZeroU8,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The filter cannot fit another fingerprint
    CapacityExceeded,
    /// The quotient or remainder widths are zero or don't fit 64 bit hashes
    InvalidFingerprintBits,
    /// The slot table would not be addressable with 64 bit positions
    CapacityTooLarge,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

const OCCUPIED: u64 = 1;
const CONTINUATION: u64 = 1 << 1;
const SHIFTED: u64 = 1 << 2;
const FLAGS: u64 = OCCUPIED | CONTINUATION | SHIFTED;
/// Metadata bits per slot, stored below the remainder.
const FLAG_BITS: usize = 3;

/// Flag and remainder accessors for a slot value held in the low `r + 3` bits
/// of a word.
///
/// `occupied` is keyed to the slot index and answers whether any stored
/// fingerprint has that index as its quotient. `continuation` and `shifted` are
/// keyed to the payload currently in the slot and travel with it when runs are
/// shifted around.
trait SlotExt: Sized {
    fn is_occupied(&self) -> bool;
    fn set_occupied(self) -> Self;
    fn clear_occupied(self) -> Self;
    fn is_continuation(&self) -> bool;
    fn set_continuation(self) -> Self;
    fn clear_continuation(self) -> Self;
    fn is_shifted(&self) -> bool;
    fn set_shifted(self) -> Self;
    fn clear_shifted(self) -> Self;
    fn remainder(&self) -> u64;
    fn is_empty(&self) -> bool;
    fn is_cluster_start(&self) -> bool;
    fn is_run_start(&self) -> bool;
}

impl SlotExt for u64 {
    #[inline]
    fn is_occupied(&self) -> bool {
        *self & OCCUPIED != 0
    }

    #[inline]
    fn set_occupied(self) -> Self {
        self | OCCUPIED
    }

    #[inline]
    fn clear_occupied(self) -> Self {
        self & !OCCUPIED
    }

    #[inline]
    fn is_continuation(&self) -> bool {
        *self & CONTINUATION != 0
    }

    #[inline]
    fn set_continuation(self) -> Self {
        self | CONTINUATION
    }

    #[inline]
    fn clear_continuation(self) -> Self {
        self & !CONTINUATION
    }

    #[inline]
    fn is_shifted(&self) -> bool {
        *self & SHIFTED != 0
    }

    #[inline]
    fn set_shifted(self) -> Self {
        self | SHIFTED
    }

    #[inline]
    fn clear_shifted(self) -> Self {
        self & !SHIFTED
    }

    #[inline]
    fn remainder(&self) -> u64 {
        self >> FLAG_BITS
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self & FLAGS == 0
    }

    #[inline]
    fn is_cluster_start(&self) -> bool {
        self.is_occupied() && !self.is_continuation() && !self.is_shifted()
    }

    #[inline]
    fn is_run_start(&self) -> bool {
        !self.is_continuation() && (self.is_occupied() || self.is_shifted())
    }
}

trait CastNonZeroU8 {
    fn u64(&self) -> u64;
    fn usize(&self) -> usize;
}

impl CastNonZeroU8 for NonZeroU8 {
    #[inline]
    fn u64(&self) -> u64 {
        self.get() as u64
    }

    #[inline]
    fn usize(&self) -> usize {
        self.get() as usize
    }
}

/// Mask selecting the low `bits` bits of a word.
#[inline]
fn low_mask(bits: u32) -> u64 {
    !u64::MAX.checked_shl(bits).unwrap_or(0)
}

/// An iterator over the fingerprints of a `Filter`.
///
/// Yields each stored fingerprint exactly once, in table order starting from
/// the first cluster. The shared borrow prevents the filter from being mutated
/// while the iterator is alive.
pub struct FingerprintIter<'a> {
    filter: &'a Filter,
    index: u64,
    quotient: u64,
    remaining: u64,
}

impl<'a> FingerprintIter<'a> {
    fn new(filter: &'a Filter) -> Self {
        let mut iter = FingerprintIter {
            filter,
            index: 0,
            quotient: 0,
            remaining: filter.len,
        };
        if !filter.is_empty() {
            while !filter.get_slot(iter.index).is_cluster_start() {
                iter.index += 1;
            }
            iter.quotient = iter.index;
        }
        iter
    }
}

impl Iterator for FingerprintIter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(r) = self.remaining.checked_sub(1) {
            self.remaining = r;
        } else {
            return None;
        }
        loop {
            let elem = self.filter.get_slot(self.index);

            // Track the quotient of the run the cursor is in. Runs appear in
            // the same order as the occupied bits of their quotients.
            if elem.is_cluster_start() {
                self.quotient = self.index;
            } else if elem.is_run_start() {
                loop {
                    self.quotient = self.filter.incr(self.quotient);
                    if self.filter.get_slot(self.quotient).is_occupied() {
                        break;
                    }
                }
            }

            self.index = self.filter.incr(self.index);

            if !elem.is_empty() {
                return Some((self.quotient << self.filter.rbits.get()) | elem.remainder());
            }
        }
    }
}

impl Filter {
    /// Creates a filter with `2^q` slots storing `r` bit remainders.
    ///
    /// Errors if `q` or `r` is zero, if a fingerprint would exceed 64 bits
    /// (`q + r > 64`), if a slot would exceed a 64 bit word (`r + 3 > 64`),
    /// or if the table size would overflow the address space.
    pub fn new(q: u8, r: u8) -> Result<Self, Error> {
        let qbits = NonZeroU8::new(q).ok_or(Error::InvalidFingerprintBits)?;
        let rbits = NonZeroU8::new(r).ok_or(Error::InvalidFingerprintBits)?;
        if q as u32 + r as u32 > 64 || r as usize + FLAG_BITS > 64 {
            return Err(Error::InvalidFingerprintBits);
        }
        let bits = (rbits.u64() as u128 + FLAG_BITS as u128) << q;
        if bits > u64::MAX as u128 {
            return Err(Error::CapacityTooLarge);
        }
        let buffer_bytes =
            usize::try_from(bits.div_ceil(64) * 8).map_err(|_| Error::CapacityTooLarge)?;
        let buffer = vec![0u8; buffer_bytes].into_boxed_slice();
        Ok(Self {
            buffer,
            len: 0,
            qbits,
            rbits,
        })
    }

    /// Creates a filter that can hold at least `capacity` items with a desired
    /// error rate of `fp_rate` (clamped to (0, 0.5]).
    ///
    /// Errors if the required table cannot be represented.
    pub fn with_capacity(capacity: u64, fp_rate: f64) -> Result<Self, Error> {
        let fp_rate = fp_rate.clamp(f64::MIN_POSITIVE, 0.5);
        // Size for the requested capacity at up to 95% occupancy.
        // 19/20 == 0.95
        let slots = (capacity.checked_mul(20).ok_or(Error::CapacityTooLarge)? / 19)
            .next_power_of_two()
            .max(2);
        let q = slots.trailing_zeros() as u8;
        let r = (-fp_rate.log2()).round().max(1.0) as u8;
        Self::new(q, r)
    }

    /// The fingerprint size in bits (`q + r`).
    #[inline]
    pub fn fingerprint_size(&self) -> u8 {
        self.qbits.get() + self.rbits.get()
    }

    /// Whether the filter is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current number of fingerprints admitted to the filter.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Total slot count (`2^q`). Inserts fail once `len` reaches it.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.total_slots().get()
    }

    /// Resets/Clears the filter without releasing the table.
    pub fn clear(&mut self) {
        self.buffer.fill(0);
        self.len = 0;
    }

    /// Size in bytes of the packed slot table for the given widths.
    pub fn table_size(q: u8, r: u8) -> u64 {
        debug_assert!(q >= 1 && r >= 1 && q as u32 + r as u32 <= 64);
        let bits = (r as u128 + FLAG_BITS as u128) << q;
        bits.div_ceil(8) as u64
    }

    /// Estimated false positive rate at the current occupancy, in `[0, 1)`.
    pub fn false_positive_rate(&self) -> f64 {
        let p = self.fingerprint_size() as i32;
        1.0 - std::f64::consts::E.powf(-(self.len as f64) / 2f64.powi(p))
    }

    #[inline]
    fn total_slots(&self) -> NonZeroU64 {
        NonZeroU64::new(1 << self.qbits.get()).unwrap()
    }

    #[inline]
    fn index_mask(&self) -> u64 {
        low_mask(self.qbits.get() as u32)
    }

    #[inline]
    fn remainder_mask(&self) -> u64 {
        low_mask(self.rbits.get() as u32)
    }

    #[inline]
    fn fingerprint_mask(&self) -> u64 {
        low_mask(self.fingerprint_size() as u32)
    }

    #[inline]
    fn slot_bits(&self) -> usize {
        self.rbits.usize() + FLAG_BITS
    }

    #[inline]
    fn slot_mask(&self) -> u64 {
        u64::MAX >> (64 - self.slot_bits())
    }

    /// The slot index space is cyclic modulo `2^q`.
    #[inline]
    fn incr(&self, idx: u64) -> u64 {
        (idx + 1) & self.index_mask()
    }

    #[inline]
    fn decr(&self, idx: u64) -> u64 {
        idx.wrapping_sub(1) & self.index_mask()
    }

    #[inline]
    fn get_word(&self, word: usize) -> u64 {
        u64::from_le_bytes(self.buffer[word * 8..][..8].try_into().unwrap())
    }

    #[inline]
    fn set_word(&mut self, word: usize, value: u64) {
        self.buffer[word * 8..][..8].copy_from_slice(&value.to_le_bytes());
    }

    /// Returns the `r + 3` bit slot at `idx` in the low bits of the result.
    #[inline]
    fn get_slot(&self, idx: u64) -> u64 {
        debug_assert!(idx < self.total_slots().get());
        let slot_bits = self.slot_bits();
        let bitpos = idx * slot_bits as u64;
        let word = (bitpos / 64) as usize;
        let offset = (bitpos % 64) as usize;
        let mut elem = (self.get_word(word) >> offset) & self.slot_mask();
        let end = offset + slot_bits;
        if end > 64 {
            // The slot straddles a word boundary, pull the high part from the
            // next word.
            let spill = end - 64;
            elem |= (self.get_word(word + 1) & low_mask(spill as u32)) << (slot_bits - spill);
        }
        elem
    }

    /// Stores the low `r + 3` bits of `elem` into the slot at `idx`.
    #[inline]
    fn set_slot(&mut self, idx: u64, elem: u64) {
        debug_assert!(idx < self.total_slots().get());
        let slot_bits = self.slot_bits();
        let mask = self.slot_mask();
        let elem = elem & mask;
        let bitpos = idx * slot_bits as u64;
        let word = (bitpos / 64) as usize;
        let offset = (bitpos % 64) as usize;
        let mut low = self.get_word(word);
        low &= !(mask << offset);
        low |= elem << offset;
        self.set_word(word, low);
        let end = offset + slot_bits;
        if end > 64 {
            let spill = end - 64;
            let mut high = self.get_word(word + 1);
            high &= !low_mask(spill as u32);
            high |= elem >> (slot_bits - spill);
            self.set_word(word + 1, high);
        }
    }

    #[inline]
    fn hash<T: Hash>(&self, item: T) -> u64 {
        let mut hasher = StableHasher::new();
        item.hash(&mut hasher);
        hasher.finish()
    }

    #[inline]
    fn calc_qr(&self, hash: u64) -> (u64, u64) {
        let quotient = (hash >> self.rbits.get()) & self.index_mask();
        let remainder = hash & self.remainder_mask();
        (quotient, remainder)
    }

    /// Locates the first slot of the run whose quotient is `fq`.
    ///
    /// The caller must have verified that the run exists, i.e. that the
    /// occupied bit of slot `fq` is set.
    fn find_run_index(&self, fq: u64) -> u64 {
        // Walk back to the start of the cluster containing fq.
        let mut b = fq;
        while self.get_slot(b).is_shifted() {
            b = self.decr(b);
        }

        // Within a cluster the k-th occupied quotient owns the k-th run, so
        // advance run starts and occupied quotients in lockstep until the
        // quotient cursor reaches fq.
        let mut s = b;
        while b != fq {
            loop {
                s = self.incr(s);
                if !self.get_slot(s).is_continuation() {
                    break;
                }
            }
            loop {
                b = self.incr(b);
                if self.get_slot(b).is_occupied() {
                    break;
                }
            }
        }
        s
    }

    /// Writes `elem` into slot `s`, shifting the displaced tail of the cluster
    /// right by one slot until an empty slot absorbs it.
    fn insert_into(&mut self, mut s: u64, mut elem: u64) {
        loop {
            let mut prev = self.get_slot(s);
            let empty = prev.is_empty();

            // Every displaced payload leaves its canonical slot. Emptiness is
            // judged before the occupied transfer below, a displaced cluster
            // start carries no other flag.
            if !empty {
                prev = prev.set_shifted();
            }

            // The occupied bit belongs to the slot index, not to the payload
            // moving through it.
            if prev.is_occupied() {
                elem = elem.set_occupied();
                prev = prev.clear_occupied();
            }

            self.set_slot(s, elem);
            if empty {
                break;
            }
            elem = prev;
            s = self.incr(s);
        }
    }

    /// Returns whether `item` is present (probabilistically) in the filter.
    pub fn contains<T: Hash>(&self, item: T) -> bool {
        self.contains_fingerprint(self.hash(item))
    }

    /// Returns whether the fingerprint is present (probabilistically) in the
    /// filter. Only the low `q + r` bits of `hash` take part in the query.
    pub fn contains_fingerprint(&self, hash: u64) -> bool {
        let (fq, fr) = self.calc_qr(hash);
        if !self.get_slot(fq).is_occupied() {
            return false;
        }
        // Scan the sorted run for the remainder.
        let mut s = self.find_run_index(fq);
        loop {
            let rem = self.get_slot(s).remainder();
            match rem.cmp(&fr) {
                Ordering::Equal => return true,
                Ordering::Greater => return false,
                Ordering::Less => {}
            }
            s = self.incr(s);
            if !self.get_slot(s).is_continuation() {
                return false;
            }
        }
    }

    /// Inserts `item` in the filter if it's not already present
    /// (probabilistically).
    ///
    /// Returns `Ok(true)` if the item was added, `Ok(false)` if an equal
    /// fingerprint was already stored and `Err(Error::CapacityExceeded)` if
    /// every slot is in use.
    pub fn insert<T: Hash>(&mut self, item: T) -> Result<bool, Error> {
        self.insert_fingerprint(self.hash(item))
    }

    /// Inserts the fingerprint specified by the low `q + r` bits of `hash`.
    ///
    /// Equal fingerprints collapse into a single entry, so a duplicate insert
    /// returns `Ok(false)` and leaves the filter untouched. A full filter
    /// refuses any insert, duplicate or not.
    pub fn insert_fingerprint(&mut self, hash: u64) -> Result<bool, Error> {
        if self.len >= self.total_slots().get() {
            return Err(Error::CapacityExceeded);
        }

        let (fq, fr) = self.calc_qr(hash);
        let t_fq = self.get_slot(fq);
        let mut entry = fr << FLAG_BITS;

        // An empty canonical slot takes the fingerprint directly.
        if t_fq.is_empty() {
            self.set_slot(fq, entry.set_occupied());
            self.len += 1;
            return Ok(true);
        }

        if !t_fq.is_occupied() {
            self.set_slot(fq, t_fq.set_occupied());
        }

        let start = self.find_run_index(fq);
        let mut s = start;

        if t_fq.is_occupied() {
            // Move the cursor to the insert position in the sorted run.
            loop {
                let rem = self.get_slot(s).remainder();
                match rem.cmp(&fr) {
                    Ordering::Equal => return Ok(false),
                    Ordering::Greater => break,
                    Ordering::Less => {}
                }
                s = self.incr(s);
                if !self.get_slot(s).is_continuation() {
                    break;
                }
            }

            if s == start {
                // The old start of the run becomes a continuation.
                let old_head = self.get_slot(start);
                self.set_slot(start, old_head.set_continuation());
            } else {
                // The new entry is not the first of its run.
                entry = entry.set_continuation();
            }
        }

        if s != fq {
            entry = entry.set_shifted();
        }

        self.insert_into(s, entry);
        self.len += 1;
        Ok(true)
    }

    /// Removes `item` from the filter.
    ///
    /// The hash is masked to the fingerprint width before removal. Note that
    /// removing an item that wasn't previously added may remove the
    /// fingerprint of a colliding item and thereby introduce **false
    /// negatives**.
    pub fn remove<T: Hash>(&mut self, item: T) -> bool {
        self.remove_fingerprint(self.hash(item) & self.fingerprint_mask())
    }

    /// Removes the fingerprint specified by `hash` from the filter.
    ///
    /// Removal of an absent fingerprint is a successful no-op, so this returns
    /// `true` even when nothing was stored under `hash`. It returns `false`
    /// only when `hash` has bits set above the fingerprint width: such a hash
    /// cannot have been inserted as given, and deleting its truncated
    /// projection could remove the fingerprint of a different hash.
    pub fn remove_fingerprint(&mut self, hash: u64) -> bool {
        let p = self.fingerprint_size();
        if p < 64 && hash >> p != 0 {
            return false;
        }

        let (fq, fr) = self.calc_qr(hash);
        let t_fq = self.get_slot(fq);
        if !t_fq.is_occupied() || self.len == 0 {
            return true;
        }

        // Scan the sorted run for the remainder, or conclude it was absent.
        let start = self.find_run_index(fq);
        let mut s = start;
        loop {
            let rem = self.get_slot(s).remainder();
            match rem.cmp(&fr) {
                Ordering::Equal => break,
                Ordering::Greater => return true,
                Ordering::Less => {}
            }
            s = self.incr(s);
            if !self.get_slot(s).is_continuation() {
                return true;
            }
        }

        let kill = self.get_slot(s);
        let replace_run_start = kill.is_run_start();

        if replace_run_start {
            let next = self.get_slot(self.incr(s));
            if !next.is_continuation() {
                // Deleting the only entry of the run, the quotient loses its
                // occupied bit.
                self.set_slot(fq, t_fq.clear_occupied());
            }
        }

        self.delete_entry(s, fq);

        if replace_run_start {
            let next = self.get_slot(s);
            let mut updated = next;
            if updated.is_continuation() {
                // The second entry of the run is now its first.
                updated = updated.clear_continuation();
            }
            if s == fq && updated.is_run_start() {
                // The new run start sits in its canonical slot.
                updated = updated.clear_shifted();
            }
            if updated != next {
                self.set_slot(s, updated);
            }
        }

        self.len -= 1;
        true
    }

    /// Vacates slot `s` by sliding the rest of the cluster back one slot,
    /// stopping at an empty slot, at a cluster start or after a full wrap.
    ///
    /// `quot` must be the quotient of the entry being removed. A virtual
    /// quotient cursor advances over the occupied indices so that entries
    /// sliding into their canonical slot drop their shifted bit.
    fn delete_entry(&mut self, mut s: u64, mut quot: u64) {
        let orig = s;
        let mut curr = self.get_slot(s);
        let mut sp = self.incr(s);

        loop {
            let next = self.get_slot(sp);
            let curr_occupied = curr.is_occupied();

            if next.is_empty() || next.is_cluster_start() || sp == orig {
                // The vacated slot at the end of the slide must read as
                // empty, including its remainder bits.
                self.set_slot(s, 0);
                return;
            }

            let mut updated_next = next;
            if next.is_run_start() {
                loop {
                    quot = self.incr(quot);
                    if self.get_slot(quot).is_occupied() {
                        break;
                    }
                }
                if curr_occupied && quot == s {
                    updated_next = updated_next.clear_shifted();
                }
            }

            // The occupied bit stays with the slot being overwritten.
            self.set_slot(
                s,
                if curr_occupied {
                    updated_next.set_occupied()
                } else {
                    updated_next.clear_occupied()
                },
            );
            s = sp;
            sp = self.incr(sp);
            curr = next;
        }
    }

    /// Merges `self` and `other` into a new filter.
    ///
    /// The output is created with one more quotient bit than the wider of the
    /// two inputs and the larger of the two remainder widths, which guarantees
    /// room for every fingerprint of both. Equal fingerprints collapse.
    ///
    /// Errors if the output widths are not representable (`q + r` of the
    /// output exceeding 64 bits).
    pub fn merge(&self, other: &Self) -> Result<Self, Error> {
        let q = 1 + self.qbits.get().max(other.qbits.get());
        let r = self.rbits.get().max(other.rbits.get());
        let mut out = Self::new(q, r)?;
        for hash in self.fingerprints() {
            out.insert_fingerprint(hash)?;
        }
        for hash in other.fingerprints() {
            out.insert_fingerprint(hash)?;
        }
        Ok(out)
    }

    /// Returns an iterator over the fingerprints stored in the filter.
    ///
    /// Fingerprints are returned in table order, not in insertion order.
    pub fn fingerprints(&self) -> FingerprintIter {
        FingerprintIter::new(self)
    }

    #[doc(hidden)]
    #[cfg(any(fuzzing, test))]
    pub fn printout(&self) {
        eprintln!(
            "=== q {} r {} len {} cap {} ===",
            self.qbits,
            self.rbits,
            self.len(),
            self.capacity()
        );
        for idx in 0..self.total_slots().get() {
            let elem = self.get_slot(idx);
            eprintln!(
                "{:5} | occupied {} | continuation {} | shifted {} | remainder {}",
                idx,
                elem.is_occupied() as u8,
                elem.is_continuation() as u8,
                elem.is_shifted() as u8,
                elem.remainder()
            );
        }
        eprintln!("===");
    }

    /// Walks the whole table and asserts the structural invariants.
    #[doc(hidden)]
    #[cfg(any(fuzzing, test))]
    pub fn check_consistency(&self) {
        let size = self.total_slots().get();
        assert!(self.len <= size);

        if self.len == 0 {
            for idx in 0..size {
                assert_eq!(self.get_slot(idx), 0, "dirty slot {idx} in empty filter");
            }
            return;
        }

        let mut start = 0;
        while !self.get_slot(start).is_cluster_start() {
            start += 1;
            assert!(start < size, "no cluster start in non-empty filter");
        }

        let mut idx = start;
        let mut visited = 0;
        let mut run_starts = 0;
        let mut occupied = 0;
        let mut last_rem = 0;
        loop {
            let elem = self.get_slot(idx);

            if elem.is_empty() {
                assert_eq!(elem, 0, "dirty empty slot {idx}");
            } else {
                if elem.is_continuation() {
                    assert!(elem.is_shifted(), "unshifted continuation at {idx}");
                    let prev = self.get_slot(self.decr(idx));
                    assert!(!prev.is_empty(), "continuation at {idx} after empty slot");
                    assert!(elem.remainder() > last_rem, "unsorted run at {idx}");
                }
                last_rem = elem.remainder();
                visited += 1;
                if elem.is_run_start() {
                    run_starts += 1;
                }
            }
            if elem.is_occupied() {
                occupied += 1;
            }

            idx = self.incr(idx);
            if idx == start {
                break;
            }
        }

        assert_eq!(self.len, visited, "len does not match stored entries");
        assert_eq!(run_starts, occupied, "runs do not match occupied quotients");
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("buffer", &"[..]")
            .field("len", &self.len)
            .field("qbits", &self.qbits)
            .field("rbits", &self.rbits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::BTreeSet;

    fn random_fill(f: &mut Filter, rng: &mut StdRng) {
        let p_mask = low_mask(f.fingerprint_size() as u32);
        let target = rng.gen_range(0..=f.capacity());
        let mut tries = 0;
        while f.len() < target && tries < 10_000 {
            let _ = f.insert_fingerprint(rng.gen::<u64>() & p_mask);
            tries += 1;
        }
        f.check_consistency();
    }

    #[test]
    fn slot_codec_round_trip() {
        let mut rng = StdRng::seed_from_u64(0x5107);
        for (q, r) in [(3, 1), (5, 5), (4, 13), (3, 28), (2, 61)] {
            let mut f = Filter::new(q, r).unwrap();
            let slots = f.capacity();
            for idx in 0..slots {
                assert_eq!(f.get_slot(idx), 0);
                f.set_slot(idx, idx & f.slot_mask());
            }
            for idx in 0..slots {
                assert_eq!(f.get_slot(idx), idx & f.slot_mask());
            }
            f.clear();

            let mut expect = vec![0u64; slots as usize];
            for _ in 0..slots * 4 {
                let idx = rng.gen_range(0..slots);
                let val = rng.gen::<u64>() & f.slot_mask();
                f.set_slot(idx, val);
                expect[idx as usize] = val;
            }
            for idx in 0..slots {
                assert_eq!(f.get_slot(idx), expect[idx as usize]);
            }
        }
    }

    #[test]
    fn constructor_validates_widths() {
        assert!(matches!(Filter::new(0, 4), Err(Error::InvalidFingerprintBits)));
        assert!(matches!(Filter::new(4, 0), Err(Error::InvalidFingerprintBits)));
        assert!(matches!(Filter::new(32, 33), Err(Error::InvalidFingerprintBits)));
        assert!(matches!(Filter::new(2, 62), Err(Error::InvalidFingerprintBits)));
        assert!(matches!(Filter::new(63, 1), Err(Error::CapacityTooLarge)));
        assert!(Filter::new(1, 61).is_ok());
        assert!(Filter::new(16, 48).is_ok());
    }

    #[test]
    fn table_size_values() {
        assert_eq!(Filter::table_size(1, 1), 1);
        assert_eq!(Filter::table_size(3, 3), 6);
        assert_eq!(Filter::table_size(4, 4), 14);
        assert_eq!(Filter::table_size(6, 1), 32);
        assert_eq!(Filter::table_size(16, 13), 131072);
    }

    #[test]
    fn cluster_starts_at_canonical_slots() {
        let mut f = Filter::new(4, 4).unwrap();
        for hash in [0x00u64, 0x10, 0x20] {
            assert!(f.insert_fingerprint(hash).unwrap());
        }
        assert_eq!(f.len(), 3);
        for idx in 0..3 {
            assert!(f.get_slot(idx).is_cluster_start());
        }
        for hash in [0x00u64, 0x10, 0x20] {
            assert!(f.contains_fingerprint(hash));
        }
        assert!(!f.contains_fingerprint(0x30));
        f.check_consistency();
    }

    #[test]
    fn run_metadata_bits() {
        let mut f = Filter::new(3, 3).unwrap();
        for hash in 0..4u64 {
            assert!(f.insert_fingerprint(hash).unwrap());
        }
        for idx in 0..8u64 {
            let elem = f.get_slot(idx);
            assert_eq!(elem.is_occupied(), idx == 0, "occupied at {idx}");
            assert_eq!(
                elem.is_continuation(),
                (1..4).contains(&idx),
                "continuation at {idx}"
            );
            assert_eq!(elem.is_shifted(), (1..4).contains(&idx), "shifted at {idx}");
            if idx < 4 {
                assert_eq!(elem.remainder(), idx);
            } else {
                assert_eq!(elem, 0);
            }
        }
        f.check_consistency();
    }

    #[test]
    fn remove_slides_runs_into_canonical_slots() {
        let mut f = Filter::new(3, 3).unwrap();
        for hash in [0x00u64, 0x01, 0x08] {
            assert!(f.insert_fingerprint(hash).unwrap());
        }
        // The run for quotient 1 is pushed out of its canonical slot.
        assert!(f.get_slot(2).is_shifted());

        assert!(f.remove_fingerprint(0x01));
        assert_eq!(f.len(), 2);
        assert!(f.contains_fingerprint(0x00));
        assert!(f.contains_fingerprint(0x08));
        assert!(!f.contains_fingerprint(0x01));
        // It slid back into slot 1 and is no longer shifted.
        assert!(f.get_slot(1).is_cluster_start());
        assert_eq!(f.get_slot(2), 0);
        f.check_consistency();
    }

    #[test]
    fn insert_fails_when_full() {
        let mut f = Filter::new(4, 4).unwrap();
        for i in 0..16u64 {
            assert!(f.insert_fingerprint(i << 4 | i).unwrap());
        }
        assert_eq!(f.len(), 16);
        let snapshot = f.buffer.clone();
        assert!(matches!(
            f.insert_fingerprint(0x01),
            Err(Error::CapacityExceeded)
        ));
        assert_eq!(f.len(), 16);
        assert_eq!(f.buffer, snapshot);
        f.check_consistency();
    }

    #[test]
    fn merge_disjoint_union() {
        let mut a = Filter::new(4, 4).unwrap();
        let mut b = Filter::new(4, 4).unwrap();
        let left = [0x13u64, 0x27, 0x42, 0x81, 0xF0];
        let right = [0x05u64, 0x3C, 0x66, 0x9A, 0xD1];
        for h in left {
            assert!(a.insert_fingerprint(h).unwrap());
        }
        for h in right {
            assert!(b.insert_fingerprint(h).unwrap());
        }

        let out = a.merge(&b).unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(out.fingerprint_size(), 9);
        out.check_consistency();

        let mut got: Vec<u64> = out.fingerprints().collect();
        got.sort_unstable();
        let mut expect: Vec<u64> = left.iter().chain(&right).copied().collect();
        expect.sort_unstable();
        assert_eq!(got, expect);
    }

    #[test]
    fn remove_rejects_out_of_domain_hashes() {
        let mut f = Filter::new(4, 4).unwrap();
        assert!(f.insert_fingerprint(0x12).unwrap());
        let snapshot = f.buffer.clone();

        assert!(!f.remove_fingerprint(0x112));
        assert_eq!(f.len(), 1);
        assert_eq!(f.buffer, snapshot);
        assert!(f.contains_fingerprint(0x12));

        assert!(f.remove_fingerprint(0x12));
        assert!(!f.contains_fingerprint(0x12));
        assert!(f.is_empty());
        // Absent fingerprints are accepted as a no-op.
        assert!(f.remove_fingerprint(0x12));
    }

    #[test]
    fn no_false_negatives() {
        let mut rng = StdRng::seed_from_u64(0xF00D);
        let mut f = Filter::new(10, 6).unwrap();
        let p_mask = low_mask(16);
        let mut inserted = BTreeSet::new();
        while f.len() < 900 {
            let hash = rng.gen::<u64>() & p_mask;
            if inserted.insert(hash) {
                assert!(f.insert_fingerprint(hash).unwrap());
            }
        }
        for &hash in &inserted {
            assert!(f.contains_fingerprint(hash));
        }
        f.check_consistency();
    }

    #[test]
    fn duplicate_inserts_are_idempotent() {
        let mut f = Filter::new(6, 5).unwrap();
        // One run holding remainders {1, 5, 9} so the duplicate scan crosses
        // a real run.
        assert!(f.insert_fingerprint(0x2A5).unwrap());
        assert!(f.insert_fingerprint(0x2A1).unwrap());
        assert!(f.insert_fingerprint(0x2A9).unwrap());
        let len = f.len();
        let snapshot = f.buffer.clone();
        for _ in 0..5 {
            assert!(!f.insert_fingerprint(0x2A5).unwrap());
        }
        assert_eq!(f.len(), len);
        assert_eq!(f.buffer, snapshot);
    }

    #[test]
    fn set_semantics_round_trip() {
        let mut rng = StdRng::seed_from_u64(0xDEC0DE);
        for (q, r) in [(1, 3), (2, 2), (3, 3), (4, 4), (5, 3), (6, 4), (7, 2), (8, 6)] {
            let mut f = Filter::new(q, r).unwrap();
            let p_mask = low_mask(q as u32 + r as u32);
            let mut model: BTreeSet<u64> = BTreeSet::new();

            for _round in 0..4 {
                while f.len() < f.capacity() {
                    let hash = rng.gen::<u64>() & p_mask;
                    if model.insert(hash) {
                        assert!(f.insert_fingerprint(hash).unwrap());
                    }
                }
                f.check_consistency();
                for &hash in &model {
                    assert!(f.contains_fingerprint(hash));
                }
                if let Some(fresh) = (0..=p_mask).find(|h| !model.contains(h)) {
                    assert!(matches!(
                        f.insert_fingerprint(fresh),
                        Err(Error::CapacityExceeded)
                    ));
                }

                while f.len() > f.capacity() / 2 {
                    let pick = rng.gen_range(0..model.len());
                    let hash = *model.iter().nth(pick).unwrap();
                    assert!(f.remove_fingerprint(hash));
                    model.remove(&hash);
                    assert!(!f.contains_fingerprint(hash));
                }
                f.check_consistency();
                for &hash in &model {
                    assert!(f.contains_fingerprint(hash));
                }

                let mut seen: Vec<u64> = f.fingerprints().collect();
                seen.sort_unstable();
                let expect: Vec<u64> = model.iter().copied().collect();
                assert_eq!(seen, expect);
            }
        }
    }

    #[test]
    fn fingerprints_visit_each_entry_once() {
        let f = Filter::new(4, 4).unwrap();
        assert_eq!(f.fingerprints().count(), 0);

        // Includes a run wrapping around the end of the table.
        let mut f = Filter::new(5, 4).unwrap();
        let hashes = [0x000u64, 0x001, 0x010, 0x0AB, 0x155, 0x1F7, 0x1F8];
        for h in hashes {
            assert!(f.insert_fingerprint(h).unwrap());
        }
        let mut got: Vec<u64> = f.fingerprints().collect();
        assert_eq!(got.len() as u64, f.len());
        got.sort_unstable();
        let mut expect = hashes.to_vec();
        expect.sort_unstable();
        assert_eq!(got, expect);
        f.check_consistency();
    }

    #[test]
    fn merge_subset_and_superset() {
        let mut rng = StdRng::seed_from_u64(0xACC01A);
        for (q1, r1, q2, r2) in [
            (3, 3, 3, 3),
            (4, 4, 3, 5),
            (5, 3, 4, 4),
            (3, 6, 6, 3),
            (6, 4, 6, 4),
        ] {
            let mut a = Filter::new(q1, r1).unwrap();
            let mut b = Filter::new(q2, r2).unwrap();
            random_fill(&mut a, &mut rng);
            random_fill(&mut b, &mut rng);

            let out = a.merge(&b).unwrap();
            out.check_consistency();
            assert_eq!(out.fingerprint_size(), 1 + q1.max(q2) + r1.max(r2));
            let union: BTreeSet<u64> = a.fingerprints().chain(b.fingerprints()).collect();
            assert_eq!(out.len(), union.len() as u64);

            for hash in a.fingerprints() {
                assert!(out.contains_fingerprint(hash));
            }
            for hash in b.fingerprints() {
                assert!(out.contains_fingerprint(hash));
            }
            for hash in out.fingerprints() {
                assert!(a.contains_fingerprint(hash) || b.contains_fingerprint(hash));
            }
        }
    }

    #[test]
    fn merge_rejects_unrepresentable_output() {
        let a = Filter::new(4, 60).unwrap();
        let b = Filter::new(4, 60).unwrap();
        assert!(matches!(a.merge(&b), Err(Error::InvalidFingerprintBits)));
    }

    #[test]
    fn clear_resets_table() {
        let mut f = Filter::new(4, 4).unwrap();
        for i in 0..10u64 {
            assert!(f.insert_fingerprint(i << 4).unwrap());
        }
        f.clear();
        assert_eq!(f.len(), 0);
        assert!(f.is_empty());
        assert!(!f.contains_fingerprint(0x00));
        f.check_consistency();
        assert!(f.insert_fingerprint(0x00).unwrap());
        assert!(f.contains_fingerprint(0x00));
    }

    #[test]
    fn false_positive_rate_estimate() {
        let mut f = Filter::new(8, 8).unwrap();
        assert_eq!(f.false_positive_rate(), 0.0);
        for i in 0..128u64 {
            assert!(f.insert_fingerprint(i << 8 | i).unwrap());
        }
        let expected = 1.0 - (-128.0f64 / 65536.0).exp();
        assert!((f.false_positive_rate() - expected).abs() < 1e-12);
        assert!(f.false_positive_rate() > 0.0 && f.false_positive_rate() < 1.0);
    }

    #[test]
    fn with_capacity_sizes_the_table() {
        let f = Filter::with_capacity(1000, 0.01).unwrap();
        assert!(f.capacity() >= 1000);
        assert!(f.fingerprint_size() > f.capacity().trailing_zeros() as u8);
        assert!(matches!(
            Filter::with_capacity(u64::MAX / 2, 0.01),
            Err(Error::CapacityTooLarge)
        ));
    }

    #[test]
    fn hashed_items_round_trip() {
        let mut f = Filter::with_capacity(500, 0.001).unwrap();
        let words = ["apple", "banana", "cherry", "durian", "elderberry"];
        for word in words {
            f.insert(word).unwrap();
        }
        for word in words {
            assert!(f.contains(word));
        }
        assert!(f.remove("banana"));
        for word in ["apple", "cherry", "durian", "elderberry"] {
            assert!(f.contains(word));
        }
        f.check_consistency();
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_round_trip() {
        let mut f = Filter::new(8, 6).unwrap();
        for i in 0..100u64 {
            assert!(f.insert_fingerprint(i << 6 | (i & 0x3F)).unwrap());
        }
        let bytes = serde_cbor::to_vec(&f).unwrap();
        let g: Filter = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(g.len(), f.len());
        assert_eq!(g.buffer, f.buffer);
        for i in 0..100u64 {
            assert!(g.contains_fingerprint(i << 6 | (i & 0x3F)));
        }
    }
}
