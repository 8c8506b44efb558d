//! # Region Registry
//!
//! Fixed-capacity, address-ordered set of [`Region`]s. Regions are kept sorted
//! by their first frame so that range operations and allocation fallbacks can
//! walk physical memory from low to high addresses. No two regions may share
//! a frame, and every node owns at most one region.

use crate::BootMemError;
use crate::addresses::{FrameNumber, NodeId};
use crate::layout::MAX_REGIONS;
use crate::region::Region;

pub struct Registry<'a> {
    slots: [Option<Region<'a>>; MAX_REGIONS],
    len: usize,
}

impl Default for Registry<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Registry<'a> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_REGIONS],
            len: 0,
        }
    }

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

    /// Add `region`, keeping the registry ordered by start frame.
    ///
    /// # Errors
    /// - [`BootMemError::DuplicateNode`] if the node already has a region.
    /// - [`BootMemError::Overlap`] if any frame is already covered.
    /// - [`BootMemError::RegistryFull`] if all slots are taken.
    pub fn insert(&mut self, region: Region<'a>) -> Result<(), BootMemError> {
        if self.get(region.node()).is_some() {
            return Err(BootMemError::DuplicateNode(region.node()));
        }
        if let Some(other) = self
            .iter()
            .find(|r| r.overlaps(region.start_frame(), region.end_frame()))
        {
            return Err(BootMemError::Overlap {
                node: region.node(),
                other: other.node(),
            });
        }
        if self.len == MAX_REGIONS {
            return Err(BootMemError::RegistryFull);
        }

        let pos = self
            .iter()
            .position(|r| region.start_frame() < r.start_frame())
            .unwrap_or(self.len);
        self.slots[pos..=self.len].rotate_right(1);
        self.slots[pos] = Some(region);
        self.len += 1;
        Ok(())
    }

    /// Regions in ascending address order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Region<'a>> {
        self.slots[..self.len].iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut Region<'a>> {
        self.slots[..self.len].iter_mut().flatten()
    }

    #[must_use]
    pub fn get(&self, node: NodeId) -> Option<&Region<'a>> {
        self.iter().find(|r| r.node() == node)
    }

    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut Region<'a>> {
        self.iter_mut().find(|r| r.node() == node)
    }

    /// Lowest frame tracked by any region.
    #[must_use]
    pub fn min_frame(&self) -> Option<FrameNumber> {
        self.iter().next().map(Region::start_frame)
    }

    /// First frame after the highest region.
    #[must_use]
    pub fn max_frame(&self) -> Option<FrameNumber> {
        self.iter().next_back().map(Region::end_frame)
    }

    /// Free frames across all live regions. O(total frames).
    #[must_use]
    pub fn total_free_frames(&self) -> u64 {
        self.iter()
            .filter(|r| !r.is_retired())
            .map(Region::free_count)
            .sum()
    }
}
