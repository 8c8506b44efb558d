//! # Allocation Requests
//!
//! Every boot allocation goes through [`BootMem::allocate`](crate::BootMem::allocate)
//! with an [`AllocRequest`]. The common "flavors" of boot allocation are
//! presets of the same request type:
//!
//! | Preset                          | Alignment           | Goal                | Limit                      |
//! |:--------------------------------|:--------------------|:--------------------|:---------------------------|
//! | [`bytes`](AllocRequest::bytes)  | [`SMP_CACHE_BYTES`] | [`MAX_DMA_ADDRESS`] | none                       |
//! | [`pages`](AllocRequest::pages)  | [`PAGE_SIZE`]       | [`MAX_DMA_ADDRESS`] | none                       |
//! | [`low`](AllocRequest::low)      | [`SMP_CACHE_BYTES`] | none                | [`ARCH_LOW_ADDRESS_LIMIT`] |
//! | [`low_pages`](AllocRequest::low_pages) | [`PAGE_SIZE`] | none               | [`ARCH_LOW_ADDRESS_LIMIT`] |
//! | [`section`](AllocRequest::section) | [`SMP_CACHE_BYTES`] | section start    | section end                |

use crate::addresses::{NodeId, PhysicalAddress};
use crate::layout::{
    ARCH_LOW_ADDRESS_LIMIT, MAX_DMA_ADDRESS, PAGE_SIZE, SECTION_SHIFT, SMP_CACHE_BYTES,
};

/// Parameters of one boot allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllocRequest {
    /// Size in bytes; must not be zero.
    pub size: u64,
    /// Power-of-two alignment in bytes.
    pub align: u64,
    /// Preferred lowest address, zero for none.
    pub goal: PhysicalAddress,
    /// Exclusive upper address, zero for none.
    pub limit: PhysicalAddress,
    /// Node to try before walking all regions.
    pub node: Option<NodeId>,
    /// Whether an unsatisfiable goal is dropped and the search repeated.
    pub drop_goal: bool,
}

impl AllocRequest {
    /// Page-aligned request with no goal, limit or node preference.
    #[must_use]
    pub const fn new(size: u64) -> Self {
        Self {
            size,
            align: PAGE_SIZE,
            goal: PhysicalAddress::zero(),
            limit: PhysicalAddress::zero(),
            node: None,
            drop_goal: true,
        }
    }

    /// Cache-line aligned memory, preferably above the ISA DMA zone.
    #[must_use]
    pub const fn bytes(size: u64) -> Self {
        Self::new(size)
            .with_align(SMP_CACHE_BYTES)
            .with_goal(PhysicalAddress::new(MAX_DMA_ADDRESS))
    }

    /// Whole pages, preferably above the ISA DMA zone.
    #[must_use]
    pub const fn pages(size: u64) -> Self {
        Self::new(size).with_goal(PhysicalAddress::new(MAX_DMA_ADDRESS))
    }

    /// Cache-line aligned memory below [`ARCH_LOW_ADDRESS_LIMIT`].
    #[must_use]
    pub const fn low(size: u64) -> Self {
        Self::new(size)
            .with_align(SMP_CACHE_BYTES)
            .with_limit(PhysicalAddress::new(ARCH_LOW_ADDRESS_LIMIT))
    }

    /// Whole pages below [`ARCH_LOW_ADDRESS_LIMIT`].
    #[must_use]
    pub const fn low_pages(size: u64) -> Self {
        Self::new(size).with_limit(PhysicalAddress::new(ARCH_LOW_ADDRESS_LIMIT))
    }

    /// Memory inside sparse-memory section `section_nr`, without falling
    /// back to other sections.
    #[must_use]
    pub const fn section(size: u64, section_nr: u64) -> Self {
        let mut req = Self::new(size)
            .with_align(SMP_CACHE_BYTES)
            .with_goal(PhysicalAddress::new(section_nr << SECTION_SHIFT))
            .with_limit(PhysicalAddress::new((section_nr + 1) << SECTION_SHIFT));
        req.drop_goal = false;
        req
    }

    #[must_use]
    pub const fn with_align(mut self, align: u64) -> Self {
        self.align = align;
        self
    }

    #[must_use]
    pub const fn with_goal(mut self, goal: PhysicalAddress) -> Self {
        self.goal = goal;
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: PhysicalAddress) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub const fn on_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }
}
