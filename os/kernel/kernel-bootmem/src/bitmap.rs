//! # Page Bitmap
//!
//! One bit per page frame, packed into machine words. A set bit means the
//! frame is unavailable (reserved by firmware, by the kernel image, or by a
//! boot allocation); a clear bit means it is free.
//!
//! ```text
//!  word 0                      word 1
//! ┌──────────────────────────┐┌──────────────────────────┐
//! │ b63 … b2 b1 b0           ││ b127 … b66 b65 b64       │
//! └──────────────────────────┘└──────────────────────────┘
//!   bit i ⇔ frame (region start + i)
//! ```
//!
//! The storage is borrowed from the caller: during early boot there is no
//! heap, so the words normally live in a physical page range that was set
//! aside for them (see [`BootMem::register_region_at`](crate::BootMem::register_region_at)).
//!
//! Any index outside `0..len` is a defect in the caller and panics.

use crate::addresses::pages_for;
use crate::layout::{BITS_PER_WORD, WORD_BYTES};

const WORD_BITS: usize = usize::BITS as usize;

/// Number of words needed to track `bits` frames.
#[inline]
#[must_use]
pub const fn words_for(bits: usize) -> usize {
    bits.div_ceil(WORD_BITS)
}

/// Bytes needed to hold a bitmap for `page_count` frames, rounded up to the
/// machine word size.
///
/// ```rust
/// # use kernel_bootmem::bitmap::bitmap_size_for;
/// # if usize::BITS == 64 {
/// assert_eq!(bitmap_size_for(100), 16);
/// assert_eq!(bitmap_size_for(65), 16);
/// assert_eq!(bitmap_size_for(64), 8);
/// # }
/// ```
#[inline]
#[must_use]
pub const fn bitmap_size_for(page_count: u64) -> u64 {
    page_count.div_ceil(BITS_PER_WORD) * WORD_BYTES
}

/// Whole pages needed to hold a bitmap for `page_count` frames.
#[inline]
#[must_use]
pub const fn bitmap_pages_for(page_count: u64) -> u64 {
    pages_for(bitmap_size_for(page_count))
}

/// Fixed-size bit vector over borrowed word storage.
pub struct Bitmap<'a> {
    words: &'a mut [usize],
    len: usize,
}

impl<'a> Bitmap<'a> {
    /// Wrap `storage` as a bitmap of `len` bits with **every bit set**.
    ///
    /// # Panics
    /// If `storage` holds fewer than [`words_for(len)`](words_for) words.
    #[must_use]
    pub fn new_reserved(storage: &'a mut [usize], len: usize) -> Self {
        let words = words_for(len);
        assert!(
            storage.len() >= words,
            "bitmap storage of {} words cannot track {len} frames",
            storage.len()
        );
        let words = &mut storage[..words];
        words.fill(usize::MAX);
        Self { words, len }
    }

    /// Number of tracked bits.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw word `i`. Bits past [`len`](Self::len) in the last word are
    /// always set.
    #[inline]
    #[must_use]
    pub fn word(&self, i: usize) -> usize {
        self.words[i]
    }

    #[inline]
    #[must_use]
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    #[inline]
    #[must_use]
    pub fn test(&self, i: usize) -> bool {
        self.check(i);
        self.words[i / WORD_BITS] & Self::mask(i) != 0
    }

    #[inline]
    pub fn set(&mut self, i: usize) {
        self.check(i);
        self.words[i / WORD_BITS] |= Self::mask(i);
    }

    #[inline]
    pub fn clear(&mut self, i: usize) {
        self.check(i);
        self.words[i / WORD_BITS] &= !Self::mask(i);
    }

    /// Set bit `i` and return its previous value.
    #[inline]
    pub fn test_and_set(&mut self, i: usize) -> bool {
        let was = self.test(i);
        self.words[i / WORD_BITS] |= Self::mask(i);
        was
    }

    /// Clear bit `i` and return its previous value.
    #[inline]
    pub fn test_and_clear(&mut self, i: usize) -> bool {
        let was = self.test(i);
        self.words[i / WORD_BITS] &= !Self::mask(i);
        was
    }

    /// Lowest index in `start..limit` whose bit is clear.
    ///
    /// # Panics
    /// If `limit` exceeds [`len`](Self::len).
    #[must_use]
    pub fn find_next_zero(&self, start: usize, limit: usize) -> Option<usize> {
        self.find_next(start, limit, true)
    }

    /// Lowest index in `start..limit` whose bit is set.
    ///
    /// # Panics
    /// If `limit` exceeds [`len`](Self::len).
    #[must_use]
    pub fn find_next_set(&self, start: usize, limit: usize) -> Option<usize> {
        self.find_next(start, limit, false)
    }

    /// Number of clear bits. Scans the whole map, O(bits).
    #[must_use]
    pub fn count_zeros(&self) -> usize {
        let full = self.len / WORD_BITS;
        let mut zeros: usize = self.words[..full]
            .iter()
            .map(|w| w.count_zeros() as usize)
            .sum();
        let tail = self.len % WORD_BITS;
        if tail != 0 {
            let valid = (1usize << tail) - 1;
            zeros += (!self.words[full] & valid).count_ones() as usize;
        }
        zeros
    }

    fn find_next(&self, start: usize, limit: usize, zero: bool) -> Option<usize> {
        assert!(
            limit <= self.len,
            "bitmap search limit {limit} out of bounds ({})",
            self.len
        );
        if start >= limit {
            return None;
        }

        let load = |i: usize| if zero { !self.words[i] } else { self.words[i] };

        let mut wi = start / WORD_BITS;
        let mut w = load(wi) & (usize::MAX << (start % WORD_BITS));
        loop {
            if w != 0 {
                let i = wi * WORD_BITS + w.trailing_zeros() as usize;
                return (i < limit).then_some(i);
            }
            wi += 1;
            if wi * WORD_BITS >= limit {
                return None;
            }
            w = load(wi);
        }
    }

    #[inline]
    const fn mask(i: usize) -> usize {
        1 << (i % WORD_BITS)
    }

    #[inline]
    #[track_caller]
    fn check(&self, i: usize) {
        assert!(i < self.len, "bitmap index {i} out of bounds ({})", self.len);
    }
}
