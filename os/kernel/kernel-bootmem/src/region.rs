//! # Boot Memory Regions
//!
//! A [`Region`] is a contiguous range of page frames `[start, end)` with its
//! own [`Bitmap`]. It is created fully reserved: the firmware memory map has
//! to be walked afterwards and every usable range freed explicitly.
//!
//! ## Search acceleration
//! - `hint` is the lowest bitmap index that *might* still be free. Successful
//!   allocations push it forward, frees pull it back. It only decides where a
//!   search starts; the placement engine always keeps a fallback from the
//!   original start so a stale hint can never hide free memory.
//! - `last_end_off` is the byte offset one past the previous allocation. When
//!   the next allocation starts right behind that allocation's partially used
//!   last page, the two share the page (see
//!   [`find_and_reserve`](Region::find_and_reserve)).
//!
//! ## Lifecycle
//! created (all reserved) → reserve/free/allocate → retired by
//! [`release_all`](Region::release_all). Any operation on a retired region
//! panics.

use crate::BootMemError;
use crate::addresses::{FrameNumber, NodeId};
use crate::bitmap::{Bitmap, words_for};
use log::{debug, trace};

/// How a reservation treats frames that are already reserved.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ReserveMode {
    /// Re-reserving is tolerated silently. Used for seeding firmware ranges
    /// that may overlap each other.
    #[default]
    NonExclusive,
    /// Any already-reserved frame fails the whole call with
    /// [`BootMemError::Conflict`]; everything set so far is rolled back.
    Exclusive,
}

/// One contiguous range of page frames tracked by a bitmap.
pub struct Region<'a> {
    node: NodeId,
    start: FrameNumber,
    end: FrameNumber,
    map: Bitmap<'a>,
    /// Lowest bitmap index that may still be free.
    pub(crate) hint: u64,
    /// Byte offset (from `start`) one past the previous allocation.
    pub(crate) last_end_off: u64,
    /// First frame of the bitmap storage when it was carved out of
    /// physical memory; those frames are handed over on release.
    pub(crate) bitmap_frame: Option<FrameNumber>,
    retired: bool,
}

/// Bitmap index for a frame offset inside a region.
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn ix(i: u64) -> usize {
    i as usize
}

impl<'a> Region<'a> {
    /// Create a fully reserved region for frames `[start, end)` on `node`.
    ///
    /// # Errors
    /// - [`BootMemError::EmptyRegion`] if `end <= start`.
    /// - [`BootMemError::BitmapTooSmall`] if `storage` cannot hold one bit
    ///   per frame.
    pub fn new(
        node: NodeId,
        start: FrameNumber,
        end: FrameNumber,
        storage: &'a mut [usize],
    ) -> Result<Self, BootMemError> {
        if end <= start {
            return Err(BootMemError::EmptyRegion { node, start, end });
        }

        let pages = ix(end - start);
        let needed = words_for(pages);
        if storage.len() < needed {
            return Err(BootMemError::BitmapTooSmall {
                needed,
                provided: storage.len(),
            });
        }

        let map = Bitmap::new_reserved(storage, pages);
        debug!(
            "{node}: start={start} end={end} mapsize={:#x}",
            map.word_count() * size_of::<usize>()
        );

        Ok(Self {
            node,
            start,
            end,
            map,
            hint: 0,
            last_end_off: 0,
            bitmap_frame: None,
            retired: false,
        })
    }

    #[inline]
    #[must_use]
    pub const fn node(&self) -> NodeId {
        self.node
    }

    /// First frame of the region.
    #[inline]
    #[must_use]
    pub const fn start_frame(&self) -> FrameNumber {
        self.start
    }

    /// First frame after the region.
    #[inline]
    #[must_use]
    pub const fn end_frame(&self) -> FrameNumber {
        self.end
    }

    #[inline]
    #[must_use]
    pub fn page_count(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, frame: FrameNumber) -> bool {
        self.start <= frame && frame < self.end
    }

    /// Whether `[start, end)` shares at least one frame with this region.
    #[inline]
    #[must_use]
    pub fn overlaps(&self, start: FrameNumber, end: FrameNumber) -> bool {
        start < self.end && self.start < end
    }

    #[inline]
    #[must_use]
    pub const fn is_retired(&self) -> bool {
        self.retired
    }

    #[inline]
    #[must_use]
    pub const fn bitmap(&self) -> &Bitmap<'a> {
        &self.map
    }

    /// Whether `frame` is currently reserved.
    ///
    /// # Panics
    /// If `frame` lies outside the region.
    #[must_use]
    pub fn is_reserved(&self, frame: FrameNumber) -> bool {
        assert!(self.contains(frame), "{frame} is not on {}", self.node);
        self.map.test(ix(frame - self.start))
    }

    /// Number of free frames. Scans the bitmap, O(frames).
    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.map.count_zeros() as u64
    }

    /// Number of reserved frames. Scans the bitmap, O(frames).
    #[must_use]
    pub fn reserved_count(&self) -> u64 {
        self.page_count() - self.free_count()
    }

    /// Reserve frames `[start, end)`, which must lie inside this region.
    ///
    /// # Errors
    /// [`BootMemError::Conflict`] in [`ReserveMode::Exclusive`] if any frame
    /// was already reserved. The bitmap is left as it was found.
    ///
    /// # Panics
    /// If the range leaves the region or the region is retired.
    pub fn reserve(
        &mut self,
        start: FrameNumber,
        end: FrameNumber,
        mode: ReserveMode,
    ) -> Result<(), BootMemError> {
        let (sidx, eidx) = self.indices(start, end);
        self.reserve_idx(sidx, eidx, mode)
    }

    /// Free frames `[start, end)`, which must lie inside this region.
    ///
    /// # Panics
    /// If the range leaves the region, the region is retired, or any frame in
    /// the range is already free (double free).
    pub fn free(&mut self, start: FrameNumber, end: FrameNumber) {
        let (sidx, eidx) = self.indices(start, end);
        self.free_idx(sidx, eidx);
    }

    pub(crate) fn reserve_idx(
        &mut self,
        sidx: u64,
        eidx: u64,
        mode: ReserveMode,
    ) -> Result<(), BootMemError> {
        trace!(
            "{}: reserve start={} end={} mode={mode:?}",
            self.node,
            self.start + sidx,
            self.start + eidx
        );

        for idx in sidx..eidx {
            if !self.map.test_and_set(ix(idx)) {
                continue;
            }
            match mode {
                ReserveMode::Exclusive => {
                    self.free_idx(sidx, idx);
                    return Err(BootMemError::Conflict {
                        frame: self.start + idx,
                    });
                }
                ReserveMode::NonExclusive => {
                    trace!("{}: silent double reserve of {}", self.node, self.start + idx);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn free_idx(&mut self, sidx: u64, eidx: u64) {
        trace!(
            "{}: free start={} end={}",
            self.node,
            self.start + sidx,
            self.start + eidx
        );

        if self.hint > sidx {
            self.hint = sidx;
        }

        for idx in sidx..eidx {
            assert!(
                self.map.test_and_clear(ix(idx)),
                "double free of {} on {}",
                self.start + idx,
                self.node
            );
        }
    }

    #[track_caller]
    pub(crate) fn assert_live(&self) {
        assert!(!self.retired, "{} used after it was released", self.node);
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    #[track_caller]
    fn indices(&self, start: FrameNumber, end: FrameNumber) -> (u64, u64) {
        self.assert_live();
        assert!(
            start >= self.start && end <= self.end && start <= end,
            "range [{start}, {end}) is not inside {} [{}, {})",
            self.node,
            self.start,
            self.end
        );
        (start - self.start, end - self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(storage: &mut [usize], start: u64, end: u64) -> Region<'_> {
        Region::new(
            NodeId(0),
            FrameNumber::new(start),
            FrameNumber::new(end),
            storage,
        )
        .unwrap()
    }

    #[test]
    fn new_region_is_fully_reserved() {
        let mut storage = [0usize; 2];
        let r = region(&mut storage, 0x100, 0x100 + 70);
        assert_eq!(r.page_count(), 70);
        assert_eq!(r.free_count(), 0);
        assert_eq!(r.reserved_count(), 70);
    }

    #[test]
    fn rejects_empty_range_and_short_storage() {
        let mut storage = [0usize; 1];
        assert!(matches!(
            Region::new(NodeId(1), FrameNumber::new(5), FrameNumber::new(5), &mut storage),
            Err(BootMemError::EmptyRegion { .. })
        ));

        let mut storage = [0usize; 1];
        assert!(matches!(
            Region::new(
                NodeId(1),
                FrameNumber::new(0),
                FrameNumber::new(usize::BITS as u64 + 1),
                &mut storage
            ),
            Err(BootMemError::BitmapTooSmall { needed: 2, provided: 1 })
        ));
    }

    #[test]
    fn free_pulls_hint_back() {
        let mut storage = [0usize; 1];
        let mut r = region(&mut storage, 0, 64);
        r.hint = 40;
        r.free(FrameNumber::new(30), FrameNumber::new(35));
        assert_eq!(r.hint, 30);
        r.free(FrameNumber::new(50), FrameNumber::new(52));
        assert_eq!(r.hint, 30);
    }

    #[test]
    fn exclusive_conflict_leaves_bitmap_untouched() {
        let mut storage = [0usize; 1];
        let mut r = region(&mut storage, 0, 64);
        r.free(FrameNumber::new(0), FrameNumber::new(64));
        r.reserve(FrameNumber::new(20), FrameNumber::new(21), ReserveMode::Exclusive)
            .unwrap();
        let before = r.bitmap().word(0);

        let err = r
            .reserve(FrameNumber::new(10), FrameNumber::new(30), ReserveMode::Exclusive)
            .unwrap_err();
        assert_eq!(
            err,
            BootMemError::Conflict {
                frame: FrameNumber::new(20)
            }
        );
        assert_eq!(r.bitmap().word(0), before);
    }

    #[test]
    fn non_exclusive_tolerates_overlap() {
        let mut storage = [0usize; 1];
        let mut r = region(&mut storage, 0, 64);
        r.free(FrameNumber::new(0), FrameNumber::new(64));
        r.reserve(FrameNumber::new(5), FrameNumber::new(10), ReserveMode::NonExclusive)
            .unwrap();
        r.reserve(FrameNumber::new(0), FrameNumber::new(8), ReserveMode::NonExclusive)
            .unwrap();
        assert_eq!(r.reserved_count(), 10);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut storage = [0usize; 1];
        let mut r = region(&mut storage, 0, 64);
        r.free(FrameNumber::new(0), FrameNumber::new(4));
        r.free(FrameNumber::new(3), FrameNumber::new(5));
    }

    #[test]
    #[should_panic(expected = "is not inside")]
    fn out_of_region_range_panics() {
        let mut storage = [0usize; 1];
        let mut r = region(&mut storage, 16, 32);
        r.free(FrameNumber::new(8), FrameNumber::new(20));
    }
}
