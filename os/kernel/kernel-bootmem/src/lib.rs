//! # Boot-Time Physical Memory Allocator
//!
//! This crate hands out physical memory before the kernel's page allocator
//! exists. It tracks every page frame with a single bit, needs no heap, and
//! at the end of early boot passes all remaining free frames on to its
//! successor.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      BootMem                        │
//! │    • allocate / allocate_or_die (goal drop,         │
//! │      preferred node, limit filtering)               │
//! │    • reserve / free across regions with rollback    │
//! │    • release_all handoff                            │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                Registry                             │
//! │    • disjoint regions, ordered by start frame       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                 Region                              │
//! │    • bitmap, search hint, previous allocation end   │
//! │    • placement search, per-region reserve/free      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Life of the allocator
//!
//! 1. Register one region per memory node. Regions start out **fully
//!    reserved**.
//! 2. Free every usable range reported by the firmware memory map, then
//!    reserve the kernel image, the bitmaps and anything else in use.
//! 3. Allocate boot data with [`BootMem::allocate`] or
//!    [`BootMem::allocate_or_die`].
//! 4. Hand the remaining free frames to the page allocator with
//!    [`BootMem::release_all`]. The region is retired afterwards.
//!
//! ## Errors
//!
//! Running out of space and conflicting exclusive reservations are ordinary
//! [`BootMemError`] values. Double frees, ranges outside every region,
//! bitmap bounds violations and use of a retired region indicate corrupted
//! state and panic.
//!
//! ## Concurrency
//!
//! None. The allocator is used by a single CPU before anything else runs, or
//! under a lock the caller holds for the whole boot phase; every operation
//! takes `&mut self`.
//!
//! ## Example
//! ```rust
//! use kernel_bootmem::{AllocRequest, BootMem};
//! use kernel_bootmem::addresses::{FrameNumber, NodeId};
//! use kernel_bootmem::phys_mapper::HhdmPhysMapper;
//!
//! // 64 frames of "physical memory" that are identity mapped in this example.
//! let mut ram = vec![0u8; 64 * 4096 + 4096];
//! let base = (ram.as_mut_ptr() as u64 + 4095) & !4095;
//! let first = FrameNumber::new(base >> 12);
//!
//! let mut map = [0usize; 1];
//! let mut bootmem = unsafe { BootMem::new(HhdmPhysMapper::identity()) };
//! bootmem.register_region(NodeId(0), first, first + 64, &mut map).unwrap();
//! bootmem.free_frames(first, first + 64);
//!
//! let pa = bootmem.allocate(&AllocRequest::new(3 * 4096)).unwrap();
//! assert_eq!(pa, first.base());
//!
//! let mut released = 0;
//! bootmem.release_all(NodeId(0), &mut |_: FrameNumber, order: u32| released += 1u64 << order);
//! assert_eq!(released, 61);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod addresses;
pub mod bitmap;
pub mod layout;
pub mod phys_mapper;
mod placement;
pub mod region;
pub mod registry;
pub mod release;
pub mod request;

use crate::addresses::{FrameNumber, NodeId, PhysicalAddress};
use crate::bitmap::words_for;
use crate::layout::{DMA32_SLACK_PAGES, MAX_DMA32_PFN};
use crate::phys_mapper::PhysMapper;
use crate::region::{Region, ix};
use crate::registry::Registry;
use log::{debug, error};

pub use crate::bitmap::{bitmap_pages_for, bitmap_size_for};
pub use crate::region::ReserveMode;
pub use crate::release::{PageReleaser, ReleaseStrategy, release_late};
pub use crate::request::AllocRequest;

/// Recoverable boot allocator errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootMemError {
    #[error("no space for {size:#x} bytes")]
    NoSpace { size: u64 },
    #[error("frame {frame} is already reserved")]
    Conflict { frame: FrameNumber },
    #[error("region for {node} overlaps the region of {other}")]
    Overlap { node: NodeId, other: NodeId },
    #[error("{0} already has a region")]
    DuplicateNode(NodeId),
    #[error("{node}: empty frame range [{start}, {end})")]
    EmptyRegion {
        node: NodeId,
        start: FrameNumber,
        end: FrameNumber,
    },
    #[error("bitmap needs {needed} words, got {provided}")]
    BitmapTooSmall { needed: usize, provided: usize },
    #[error("region registry is full")]
    RegistryFull,
}

#[derive(Copy, Clone)]
enum Mark {
    Reserve(ReserveMode),
    Free,
}

/// The boot allocator: the region registry plus the mapper used to reach
/// physical memory.
pub struct BootMem<'a, M: PhysMapper> {
    regions: Registry<'a>,
    mapper: M,
}

impl<'a, M: PhysMapper> BootMem<'a, M> {
    /// # Safety
    /// `mapper` must yield valid, writable pointers for every frame of every
    /// region registered later; allocations are zeroed through it.
    pub const unsafe fn new(mapper: M) -> Self {
        Self {
            regions: Registry::new(),
            mapper,
        }
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry<'a> {
        &self.regions
    }

    #[must_use]
    pub fn region(&self, node: NodeId) -> Option<&Region<'a>> {
        self.regions.get(node)
    }

    /// Lowest frame managed by the allocator.
    #[must_use]
    pub fn min_frame(&self) -> Option<FrameNumber> {
        self.regions.min_frame()
    }

    /// First frame above everything managed by the allocator.
    #[must_use]
    pub fn max_frame(&self) -> Option<FrameNumber> {
        self.regions.max_frame()
    }

    /// Free frames across all live regions. O(total frames).
    #[must_use]
    pub fn total_free_frames(&self) -> u64 {
        self.regions.total_free_frames()
    }

    /// Register frames `[start, end)` of `node`, tracked in `storage`.
    ///
    /// The new region is fully reserved. The node id is the region's handle
    /// for all node-specific operations.
    ///
    /// # Errors
    /// See [`Region::new`] and [`Registry::insert`].
    pub fn register_region(
        &mut self,
        node: NodeId,
        start: FrameNumber,
        end: FrameNumber,
        storage: &'a mut [usize],
    ) -> Result<NodeId, BootMemError> {
        let region = Region::new(node, start, end, storage)?;
        self.regions.insert(region)?;
        debug!("registered {node} [{start}, {end})");
        Ok(node)
    }

    /// Register frames `[start, end)` of `node` with the bitmap placed in
    /// physical memory at `map_frame`.
    ///
    /// The bitmap occupies [`bitmap_pages_for`]`(end - start)` frames from
    /// `map_frame` on. Those frames are not reserved automatically; the
    /// caller reserves them like any other boot data, and
    /// [`release_all`](Self::release_all) hands them over with the region.
    ///
    /// # Errors
    /// See [`register_region`](Self::register_region).
    ///
    /// # Safety
    /// The bitmap frames must be backed by the mapper and must not be used
    /// for anything else while the allocator lives.
    pub unsafe fn register_region_at(
        &mut self,
        node: NodeId,
        start: FrameNumber,
        end: FrameNumber,
        map_frame: FrameNumber,
    ) -> Result<NodeId, BootMemError> {
        if end <= start {
            return Err(BootMemError::EmptyRegion { node, start, end });
        }

        let words = words_for(ix(end - start));
        // SAFETY: The caller hands us exclusive use of the bitmap frames.
        let storage = unsafe {
            let ptr = self.mapper.phys_to_mut_ptr(map_frame.base()).cast::<usize>();
            core::slice::from_raw_parts_mut(ptr, words)
        };

        let mut region = Region::new(node, start, end, storage)?;
        region.bitmap_frame = Some(map_frame);
        self.regions.insert(region)?;
        debug!("registered {node} [{start}, {end}) with bitmap at {map_frame}");
        Ok(node)
    }

    /// Allocate and zero memory as described by `req`.
    ///
    /// The preferred node (if any) is tried first, then every region in
    /// address order. Regions entirely below the goal are skipped and the
    /// walk stops at the first region starting at or above the limit. If
    /// nothing fits and the request allows it, the goal is dropped and the
    /// whole search repeated once.
    ///
    /// # Errors
    /// [`BootMemError::NoSpace`] if no region can hold the request.
    ///
    /// # Panics
    /// - `req.size` is zero, `req.align` is not a power of two, or
    ///   `goal + size` exceeds a non-zero limit.
    /// - The preferred node has no region or was released. Other released
    ///   regions are skipped.
    pub fn allocate(&mut self, req: &AllocRequest) -> Result<PhysicalAddress, BootMemError> {
        let mut goal = req.goal;
        loop {
            if let Some(pa) = self.try_allocate(req, goal) {
                return Ok(pa);
            }
            if goal.is_zero() || !req.drop_goal {
                return Err(BootMemError::NoSpace { size: req.size });
            }
            debug!("dropping goal {goal} for {:#x} bytes", req.size);
            goal = PhysicalAddress::zero();
        }
    }

    /// [`allocate`](Self::allocate) for call sites that cannot continue
    /// without the memory.
    ///
    /// # Panics
    /// If the allocation fails, or for any reason [`allocate`](Self::allocate)
    /// panics.
    pub fn allocate_or_die(&mut self, req: &AllocRequest) -> PhysicalAddress {
        match self.allocate(req) {
            Ok(pa) => pa,
            Err(e) => {
                error!("bootmem alloc of {} bytes failed: {e}", req.size);
                panic!("out of memory");
            }
        }
    }

    /// Allocate on `node`, steering above the 32-bit DMA boundary when the
    /// node extends far enough beyond it, so DMA32 memory stays available
    /// for devices that need it. Falls back to [`allocate`](Self::allocate)
    /// with `node` preferred.
    ///
    /// # Errors
    /// [`BootMemError::NoSpace`] if no region can hold the request.
    ///
    /// # Panics
    /// See [`allocate`](Self::allocate).
    pub fn allocate_node_high(
        &mut self,
        node: NodeId,
        req: &AllocRequest,
    ) -> Result<PhysicalAddress, BootMemError> {
        let high = FrameNumber::new(MAX_DMA32_PFN);
        let Self { regions, mapper } = self;
        let region = Self::node_region(regions, node);

        let fits_limit = req.limit.is_zero() || high.base().as_u64() + req.size <= req.limit.as_u64();
        if region.end_frame() > high + DMA32_SLACK_PAGES && req.goal.frame_down() < high && fits_limit {
            // SAFETY: `BootMem::new` guarantees the mapper covers all regions.
            let pa = unsafe {
                region.find_and_reserve(&*mapper, req.size, req.align, high.base(), req.limit)
            };
            if let Some(pa) = pa {
                return Ok(pa);
            }
        }

        self.allocate(&req.on_node(node))
    }

    /// Run the placement search on `node` only.
    ///
    /// # Panics
    /// See [`allocate`](Self::allocate).
    pub fn find_and_reserve(
        &mut self,
        node: NodeId,
        size: u64,
        align: u64,
        goal: PhysicalAddress,
        limit: PhysicalAddress,
    ) -> Option<PhysicalAddress> {
        let Self { regions, mapper } = self;
        let region = Self::node_region(regions, node);
        // SAFETY: `BootMem::new` guarantees the mapper covers all regions.
        unsafe { region.find_and_reserve(&*mapper, size, align, goal, limit) }
    }

    /// Reserve frames `[start, end)`, which may span several regions.
    ///
    /// An exclusive reservation is all or nothing: if any frame is already
    /// reserved, the frames set in earlier regions are freed again before
    /// the error is returned.
    ///
    /// # Errors
    /// [`BootMemError::Conflict`] in [`ReserveMode::Exclusive`].
    ///
    /// # Panics
    /// If the range is not fully covered by registered regions.
    pub fn reserve_frames(
        &mut self,
        start: FrameNumber,
        end: FrameNumber,
        mode: ReserveMode,
    ) -> Result<(), BootMemError> {
        self.mark(start, end, Mark::Reserve(mode))
    }

    /// Free frames `[start, end)`, which may span several regions.
    ///
    /// # Panics
    /// If the range is not fully covered by registered regions or any frame
    /// is already free.
    pub fn free_frames(&mut self, start: FrameNumber, end: FrameNumber) {
        if let Err(e) = self.mark(start, end, Mark::Free) {
            unreachable!("freeing cannot conflict: {e}");
        }
    }

    /// Reserve `size` bytes at `addr`. Partial pages are reserved.
    ///
    /// # Errors
    /// See [`reserve_frames`](Self::reserve_frames).
    ///
    /// # Panics
    /// See [`reserve_frames`](Self::reserve_frames).
    pub fn reserve_range(
        &mut self,
        addr: PhysicalAddress,
        size: u64,
        mode: ReserveMode,
    ) -> Result<(), BootMemError> {
        self.reserve_frames(addr.frame_down(), (addr + size).frame_up(), mode)
    }

    /// Free `size` bytes at `addr`. Partial pages stay reserved.
    ///
    /// # Panics
    /// See [`free_frames`](Self::free_frames).
    pub fn free_range(&mut self, addr: PhysicalAddress, size: u64) {
        self.free_frames(addr.frame_up(), (addr + size).frame_down());
    }

    /// Reserve `size` bytes at `addr`, all of which must be on `node`.
    ///
    /// # Errors
    /// [`BootMemError::Conflict`] in [`ReserveMode::Exclusive`].
    ///
    /// # Panics
    /// If `node` has no region or the range leaves it.
    pub fn reserve_node_range(
        &mut self,
        node: NodeId,
        addr: PhysicalAddress,
        size: u64,
        mode: ReserveMode,
    ) -> Result<(), BootMemError> {
        let (start, end) = (addr.frame_down(), (addr + size).frame_up());
        if end <= start {
            return Ok(());
        }
        Self::node_region(&mut self.regions, node).reserve(start, end, mode)
    }

    /// Free `size` bytes at `addr`, all of which must be on `node`.
    ///
    /// # Panics
    /// If `node` has no region, the range leaves it, or any frame is already
    /// free.
    pub fn free_node_range(&mut self, node: NodeId, addr: PhysicalAddress, size: u64) {
        let (start, end) = (addr.frame_up(), (addr + size).frame_down());
        if end <= start {
            return;
        }
        Self::node_region(&mut self.regions, node).free(start, end);
    }

    /// Hand the free frames of `node` to `releaser` in word-sized blocks
    /// where possible, and retire the region.
    ///
    /// # Panics
    /// If `node` has no region or it was already released.
    pub fn release_all<R: PageReleaser + ?Sized>(&mut self, node: NodeId, releaser: &mut R) -> u64 {
        self.release_all_with(node, releaser, ReleaseStrategy::Bulk)
    }

    /// [`release_all`](Self::release_all) with an explicit strategy.
    ///
    /// # Panics
    /// See [`release_all`](Self::release_all).
    pub fn release_all_with<R: PageReleaser + ?Sized>(
        &mut self,
        node: NodeId,
        releaser: &mut R,
        strategy: ReleaseStrategy,
    ) -> u64 {
        Self::node_region(&mut self.regions, node).release_all(releaser, strategy)
    }

    /// Release every region that is still live, in address order.
    ///
    /// Returns the total number of frames released.
    pub fn release_all_regions<R: PageReleaser + ?Sized>(&mut self, releaser: &mut R) -> u64 {
        let total: u64 = self
            .regions
            .iter_mut()
            .filter(|r| !r.is_retired())
            .map(|r| r.release_all(releaser, ReleaseStrategy::Bulk))
            .sum();
        debug!("released {total} frames in total");
        total
    }

    fn try_allocate(&mut self, req: &AllocRequest, goal: PhysicalAddress) -> Option<PhysicalAddress> {
        let Self { regions, mapper } = self;
        let mapper = &*mapper;

        if let Some(node) = req.node {
            let region = Self::node_region(regions, node);
            // SAFETY: `BootMem::new` guarantees the mapper covers all regions.
            let pa = unsafe { region.find_and_reserve(mapper, req.size, req.align, goal, req.limit) };
            if pa.is_some() {
                return pa;
            }
        }

        for region in regions.iter_mut() {
            if region.is_retired() {
                continue;
            }
            if !goal.is_zero() && region.end_frame() <= goal.frame_down() {
                continue;
            }
            if !req.limit.is_zero() && region.start_frame() >= req.limit.frame_down() {
                break;
            }
            // SAFETY: `BootMem::new` guarantees the mapper covers all regions.
            let pa = unsafe { region.find_and_reserve(mapper, req.size, req.align, goal, req.limit) };
            if pa.is_some() {
                return pa;
            }
        }
        None
    }

    /// Apply `op` to `[start, end)` region by region in address order.
    fn mark(&mut self, start: FrameNumber, end: FrameNumber, op: Mark) -> Result<(), BootMemError> {
        if end <= start {
            return Ok(());
        }

        let mut pos = start;
        let mut failure = None;
        for region in self.regions.iter_mut() {
            if !region.contains(pos) {
                assert!(pos == start, "range [{start}, {end}) has a hole at {pos}");
                continue;
            }

            let max = region.end_frame().min(end);
            let result = match op {
                Mark::Reserve(mode) => region.reserve(pos, max, mode),
                Mark::Free => {
                    region.free(pos, max);
                    Ok(())
                }
            };
            if let Err(e) = result {
                failure = Some(e);
                break;
            }
            if max == end {
                return Ok(());
            }
            pos = region.end_frame();
        }

        let Some(e) = failure else {
            panic!("range [{start}, {end}) is not covered by any region");
        };
        debug!("rolling back [{start}, {pos}) after {e}");
        self.mark(start, pos, Mark::Free)?;
        Err(e)
    }

    #[track_caller]
    fn node_region<'r>(regions: &'r mut Registry<'a>, node: NodeId) -> &'r mut Region<'a> {
        match regions.get_mut(node) {
            Some(region) => region,
            None => panic!("no region registered for {node}"),
        }
    }
}
