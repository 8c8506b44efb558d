//! # Placement
//!
//! First-fit search for a run of free frames inside one [`Region`], honoring
//! alignment, an advisory goal and a mandatory limit.
//!
//! ```text
//!  region start                         min(end, limit)
//!  │                                                  │
//!  ▼        goal        hint                          ▼
//!  ┌────────┬───────────┬──────────────────────────────┐
//!  │████░░░░│██░░░░█████│░░░░░░░░██████░░░░░░░░░░░░░░░│
//!  └────────┴───────────┴──────────────────────────────┘
//!           └─ fallback  └─ search starts here
//! ```
//!
//! A failed search from the hint is retried once from the fallback position,
//! so the hint can only make a search faster, never make it fail.

use crate::addresses::{PhysicalAddress, align_up, pages_for};
use crate::layout::{PAGE_SHIFT, PAGE_SIZE};
use crate::phys_mapper::PhysMapper;
use crate::region::{Region, ReserveMode, ix};
use log::trace;

impl Region<'_> {
    /// Find, reserve and zero `size` bytes inside this region.
    ///
    /// - `align` must be a power of two (or `0` for no alignment); alignments
    ///   below a page only matter when the allocation shares its first page
    ///   with the previous one.
    /// - `goal` is where the search should preferably start (`0` for none).
    /// - `limit` is the exclusive upper address (`0` for none).
    ///
    /// Returns `None` if the region has no suitable free run. That is an
    /// ordinary outcome; the caller decides whether to try elsewhere.
    ///
    /// # Safety
    /// `mapper` must yield writable pointers for every frame of this region;
    /// the reserved bytes are zeroed through it.
    ///
    /// # Panics
    /// - `size` is zero, `align` is not a power of two, or `goal + size`
    ///   exceeds a non-zero `limit`.
    /// - The region is retired.
    pub unsafe fn find_and_reserve<M: PhysMapper + ?Sized>(
        &mut self,
        mapper: &M,
        size: u64,
        align: u64,
        goal: PhysicalAddress,
        limit: PhysicalAddress,
    ) -> Option<PhysicalAddress> {
        self.assert_live();
        assert!(size != 0, "zero-sized boot allocation");
        assert!(
            align == 0 || align.is_power_of_two(),
            "alignment {align:#x} is not a power of two"
        );
        assert!(
            limit.is_zero() || goal.as_u64() + size <= limit.as_u64(),
            "goal {goal} + {size:#x} exceeds limit {limit}"
        );
        let align = align.max(1);

        trace!(
            "{}: size={size:#x} [{} pages] align={align:#x} goal={goal} limit={limit}",
            self.node(),
            pages_for(size)
        );

        let min = self.start_frame().as_u64();
        let mut max = self.end_frame().as_u64();
        let goal_pfn = goal.frame_down().as_u64();
        if !limit.is_zero() {
            max = max.min(limit.frame_down().as_u64());
        }
        if max <= min {
            return None;
        }

        let step = (align >> PAGE_SHIFT).max(1);
        let start = if !goal.is_zero() && min < goal_pfn && goal_pfn < max {
            align_up(goal_pfn, step)
        } else {
            align_up(min, step)
        };

        let midx = max - min;
        let mut sidx = start - min;
        let mut fallback = None;
        if self.hint > sidx {
            fallback = Some(sidx);
            sidx = self.align_idx(self.hint, step);
        }

        let pages = pages_for(size);
        loop {
            if let Some(found) = self.search(sidx, midx, pages, step) {
                // SAFETY: Forwarded from the caller.
                return Some(unsafe { self.claim(mapper, found, size, align) });
            }
            sidx = self.align_idx(fallback.take()?, step);
        }
    }

    /// Lowest `step`-aligned index `>= sidx` that starts `pages` clear bits
    /// ending at or before `midx`.
    fn search(&self, mut sidx: u64, midx: u64, pages: u64, step: u64) -> Option<u64> {
        let map = self.bitmap();
        loop {
            if sidx >= midx {
                return None;
            }
            sidx = map
                .find_next_zero(ix(sidx), ix(midx))
                .map_or(midx, |i| i as u64);
            sidx = self.align_idx(sidx, step);
            let eidx = sidx + pages;
            if sidx >= midx || eidx > midx {
                return None;
            }

            match map.find_next_set(ix(sidx), ix(eidx)) {
                None => return Some(sidx),
                Some(busy) => {
                    let busy = busy as u64;
                    sidx = self.align_idx(busy, step);
                    if sidx == busy {
                        sidx += step;
                    }
                }
            }
        }
    }

    /// Reserve the run found at `sidx`, zero it and update the search state.
    ///
    /// # Safety
    /// See [`find_and_reserve`](Self::find_and_reserve).
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn claim<M: PhysMapper + ?Sized>(
        &mut self,
        mapper: &M,
        sidx: u64,
        size: u64,
        align: u64,
    ) -> PhysicalAddress {
        // Share the previous allocation's partially used last page, but only
        // while that page is still reserved.
        let tail = self.last_end_off >> PAGE_SHIFT;
        let start_off = if self.last_end_off & (PAGE_SIZE - 1) != 0
            && tail + 1 == sidx
            && self.bitmap().test(ix(tail))
        {
            self.align_off(self.last_end_off, align)
        } else {
            sidx << PAGE_SHIFT
        };

        let merge = u64::from((start_off >> PAGE_SHIFT) < sidx);
        let end_off = start_off + size;

        self.last_end_off = end_off;
        self.hint = pages_for(end_off);

        // `search` just saw every frame of the run clear, so a conflict here
        // means the bitmap was corrupted underneath us.
        if let Err(e) = self.reserve_idx(
            (start_off >> PAGE_SHIFT) + merge,
            pages_for(end_off),
            ReserveMode::Exclusive,
        ) {
            panic!("{}: free run at index {sidx} could not be reserved: {e}", self.node());
        }

        let addr = self.start_frame().base() + start_off;
        trace!("{}: placed {size:#x} bytes at {addr} (merge={merge})", self.node());

        // SAFETY: The caller guarantees the mapper covers this region, and
        // `[addr, addr + size)` was just reserved exclusively for us.
        unsafe {
            core::ptr::write_bytes(mapper.phys_to_mut_ptr(addr), 0, size as usize);
        }
        addr
    }

    /// Align a bitmap index so that `start + idx` is a multiple of `step`.
    #[inline]
    fn align_idx(&self, idx: u64, step: u64) -> u64 {
        let base = self.start_frame().as_u64();
        align_up(base + idx, step) - base
    }

    /// Byte-offset counterpart of [`align_idx`](Self::align_idx).
    #[inline]
    fn align_off(&self, off: u64, align: u64) -> u64 {
        let base = self.start_frame().base().as_u64();
        align_up(base + off, align) - base
    }
}
