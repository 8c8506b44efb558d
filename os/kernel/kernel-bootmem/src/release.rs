//! # Handoff to the Page Allocator
//!
//! Once the general-purpose page allocator is ready, every frame the boot
//! allocator still considers free is handed over through a [`PageReleaser`].
//! Releasing happens in blocks of `2^order` frames:
//!
//! - a bitmap word with all bits clear, on a word-aligned frame, goes out as
//!   one block of order [`WORD_ORDER`];
//! - everything else goes out frame by frame (order `0`).
//!
//! Both strategies release exactly the same set of frames; the bulk path only
//! reduces the number of calls.

use crate::addresses::{FrameNumber, PhysicalAddress, align_down};
use crate::bitmap::bitmap_pages_for;
use crate::layout::{BITS_PER_WORD, WORD_ORDER};
use crate::region::Region;
use log::debug;

/// Receiver of released frames, usually the buddy allocator.
pub trait PageReleaser {
    /// Take ownership of the `2^order` frames starting at `frame`.
    fn release_page(&mut self, frame: FrameNumber, order: u32);
}

impl<F> PageReleaser for F
where
    F: FnMut(FrameNumber, u32),
{
    fn release_page(&mut self, frame: FrameNumber, order: u32) {
        self(frame, order);
    }
}

/// How free frames are grouped when they are released.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ReleaseStrategy {
    /// Fully free, word-aligned bitmap words go out as one block.
    #[default]
    Bulk,
    /// Every frame goes out on its own.
    PerFrame,
}

impl Region<'_> {
    /// Hand every free frame to `releaser` and retire the region.
    ///
    /// If the bitmap was placed in physical memory, its frames are handed
    /// over as well, one at a time. Returns the number of frames released.
    ///
    /// # Panics
    /// If the region was already retired.
    pub fn release_all<R: PageReleaser + ?Sized>(
        &mut self,
        releaser: &mut R,
        strategy: ReleaseStrategy,
    ) -> u64 {
        self.assert_live();

        let start = self.start_frame();
        let pages = self.page_count();
        let aligned = strategy == ReleaseStrategy::Bulk && start.is_aligned(BITS_PER_WORD);
        debug!("{}: release start={start} end={} aligned={aligned}", self.node(), self.end_frame());

        let map = self.bitmap();
        let mut count = 0;
        for wi in 0..map.word_count() {
            let base = wi as u64 * BITS_PER_WORD;
            let mut vec = !map.word(wi);

            if aligned && vec == usize::MAX && base + BITS_PER_WORD <= pages {
                releaser.release_page(start + base, WORD_ORDER);
                count += BITS_PER_WORD;
                continue;
            }

            while vec != 0 {
                let off = u64::from(vec.trailing_zeros());
                if base + off >= pages {
                    break;
                }
                releaser.release_page(start + base + off, 0);
                count += 1;
                vec &= vec - 1;
            }
        }

        debug_assert_eq!(count, self.free_count());

        if let Some(first) = self.bitmap_frame {
            let map_pages = bitmap_pages_for(pages);
            for frame in (0..map_pages).map(|i| first + i) {
                // already handed over by the walk above
                if self.contains(frame) && !self.is_reserved(frame) {
                    continue;
                }
                releaser.release_page(frame, 0);
                count += 1;
            }
            debug!("{}: released {map_pages} bitmap frames at {first}", self.node());
        }

        debug!("{}: released={count}", self.node());
        self.retire();
        count
    }
}

/// Release frames `[start, end)` directly, splitting into word-sized blocks
/// where alignment allows.
///
/// Returns the number of frames released.
pub fn release_frame_range<R: PageReleaser + ?Sized>(
    start: FrameNumber,
    end: FrameNumber,
    releaser: &mut R,
) -> u64 {
    if end <= start {
        return 0;
    }

    let start_aligned = start.align_up(BITS_PER_WORD);
    let end_aligned = FrameNumber::new(align_down(end.as_u64(), BITS_PER_WORD));

    if end_aligned <= start_aligned {
        release_each(start, end, releaser);
        return end - start;
    }

    release_each(start, start_aligned, releaser);
    let mut f = start_aligned;
    while f < end_aligned {
        releaser.release_page(f, WORD_ORDER);
        f += BITS_PER_WORD;
    }
    release_each(end_aligned, end, releaser);
    end - start
}

fn release_each<R: PageReleaser + ?Sized>(from: FrameNumber, to: FrameNumber, releaser: &mut R) {
    let mut f = from;
    while f < to {
        releaser.release_page(f, 0);
        f += 1;
    }
}

/// Hand `size` bytes at `addr` straight to the page allocator after the boot
/// allocator is gone. Partial pages at either end are kept back.
///
/// Returns the number of frames released.
pub fn release_late<R: PageReleaser + ?Sized>(
    addr: PhysicalAddress,
    size: u64,
    releaser: &mut R,
) -> u64 {
    let start = addr.frame_up();
    let end = (addr + size).frame_down();
    debug!("late release start={start} end={end}");
    release_frame_range(start, end, releaser)
}

/// Expands `(frame, order)` pairs into single frames. Test helper.
#[cfg(test)]
pub(crate) fn expand(blocks: &[(FrameNumber, u32)]) -> Vec<u64> {
    let mut frames: Vec<u64> = blocks
        .iter()
        .flat_map(|&(f, order)| f.as_u64()..f.as_u64() + (1 << order))
        .collect();
    frames.sort_unstable();
    frames
}
