use std::hash::Hasher;

use xxhash_rust::xxh3::Xxh3;

/// A `Hasher` producing the same hashes on every platform.
///
/// Wraps xxhash3 and routes every fixed width write through its little endian
/// byte representation, with `usize`/`isize` widened to 64 bits so that
/// pointer width doesn't leak into the hash.
#[derive(Default)]
pub struct StableHasher(Xxh3);

impl StableHasher {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Hasher for StableHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.0.finish()
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        self.0.write(bytes)
    }

    #[inline]
    fn write_u8(&mut self, i: u8) {
        self.write(&[i])
    }

    #[inline]
    fn write_u16(&mut self, i: u16) {
        self.write(&i.to_le_bytes())
    }

    #[inline]
    fn write_u32(&mut self, i: u32) {
        self.write(&i.to_le_bytes())
    }

    #[inline]
    fn write_u64(&mut self, i: u64) {
        self.write(&i.to_le_bytes())
    }

    #[inline]
    fn write_u128(&mut self, i: u128) {
        self.write(&i.to_le_bytes())
    }

    #[inline]
    fn write_usize(&mut self, i: usize) {
        self.write_u64(i as u64)
    }

    #[inline]
    fn write_i8(&mut self, i: i8) {
        self.write_u8(i as u8)
    }

    #[inline]
    fn write_i16(&mut self, i: i16) {
        self.write_u16(i as u16)
    }

    #[inline]
    fn write_i32(&mut self, i: i32) {
        self.write_u32(i as u32)
    }

    #[inline]
    fn write_i64(&mut self, i: i64) {
        self.write_u64(i as u64)
    }

    #[inline]
    fn write_i128(&mut self, i: i128) {
        self.write_u128(i as u128)
    }

    #[inline]
    fn write_isize(&mut self, i: isize) {
        self.write_u64(i as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usize_hashes_like_u64() {
        let mut a = StableHasher::new();
        a.write_usize(0xDEAD_BEEF);
        let mut b = StableHasher::new();
        b.write_u64(0xDEAD_BEEF);
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn known_value_is_stable() {
        let mut h = StableHasher::new();
        h.write(b"");
        let empty = h.finish();
        let mut h = StableHasher::new();
        h.write(b"quotient");
        assert_ne!(h.finish(), empty);
    }
}
