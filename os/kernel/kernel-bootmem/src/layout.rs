//! # Boot Memory Layout
//!
//! Constants shared by the boot-time allocator. They describe the machine
//! (page and word size) and the address boundaries the allocation presets in
//! [`request`](crate::request) are built from.

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Size of one page frame in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Number of frames tracked by one bitmap word.
pub const BITS_PER_WORD: u64 = usize::BITS as u64;

/// Size of one bitmap word in bytes.
pub const WORD_BYTES: u64 = size_of::<usize>() as u64;

/// Allocation order of one fully free, word-aligned bitmap word, i.e.
/// `log2(BITS_PER_WORD)`.
pub const WORD_ORDER: u32 = usize::BITS.trailing_zeros();

/// Default alignment of byte-sized boot allocations (one cache line).
pub const SMP_CACHE_BYTES: u64 = 64;

/// End of the ISA DMA zone. Default goal of the "normal" presets so that
/// ordinary boot data does not eat the scarce low memory first.
pub const MAX_DMA_ADDRESS: u64 = 16 * 1024 * 1024; // 16 MiB

/// First frame above the 32-bit DMA boundary.
pub const MAX_DMA32_PFN: u64 = (4 * 1024 * 1024 * 1024) >> PAGE_SHIFT;

/// Slack above [`MAX_DMA32_PFN`] a node must have before node-high
/// allocations are steered above the boundary.
pub const DMA32_SLACK_PAGES: u64 = (128 * 1024 * 1024) >> PAGE_SHIFT; // 128 MiB

/// Exclusive upper bound of "low" allocations.
pub const ARCH_LOW_ADDRESS_LIMIT: u64 = 0xffff_ffff;

/// log2 of the sparse-memory section size in bytes.
pub const SECTION_SHIFT: u32 = 27; // 128 MiB

/// Maximum number of regions the registry can hold.
pub const MAX_REGIONS: usize = 8;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(BITS_PER_WORD.is_power_of_two());
    assert!(1_u64 << WORD_ORDER == BITS_PER_WORD);
    assert!(SMP_CACHE_BYTES.is_power_of_two());
    assert!(MAX_DMA_ADDRESS.is_multiple_of(PAGE_SIZE));
    assert!(SECTION_SHIFT > PAGE_SHIFT);
    assert!(MAX_REGIONS > 0);
};
