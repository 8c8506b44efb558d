//! # Physical Memory Access for the Boot Allocator
//!
//! The boot allocator hands out **physical** ranges, but it has to touch them:
//! every allocation is zeroed before it is returned, and a region's bitmap can
//! be placed directly in physical memory. [`PhysMapper`] is the seam that turns
//! a physical address into a pointer the CPU can dereference in the current
//! address space.
//!
//! ## Implementations
//! - [`HhdmPhysMapper`]: every physical address is visible at a fixed offset
//!   (higher-half direct map, or `0` for identity mapping during early boot).
//! - Tests provide their own mapper backed by a heap buffer.

use crate::addresses::PhysicalAddress;

/// Converts physical addresses into writable pointers.
pub trait PhysMapper {
    /// Pointer through which the byte at `pa` can be read and written.
    ///
    /// # Safety
    /// The caller must only use the pointer for memory that is actually
    /// backed and mapped, and must not create aliasing mutable references.
    unsafe fn phys_to_mut_ptr(&self, pa: PhysicalAddress) -> *mut u8;
}

/// [`PhysMapper`] for a direct map at a fixed virtual offset.
///
/// # Example
/// ```rust
/// use kernel_bootmem::addresses::PhysicalAddress;
/// use kernel_bootmem::phys_mapper::{HhdmPhysMapper, PhysMapper};
/// let mapper = HhdmPhysMapper::new(0xffff_8880_0000_0000);
/// let p = unsafe { mapper.phys_to_mut_ptr(PhysicalAddress::new(0x1000)) };
/// assert_eq!(p as u64, 0xffff_8880_0000_1000);
/// ```
#[derive(Debug, Copy, Clone)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Physical memory is identity mapped (the usual state right after the
    /// firmware hands over control).
    #[must_use]
    pub const fn identity() -> Self {
        Self::new(0)
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn phys_to_mut_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        self.offset.wrapping_add(pa.as_u64()) as usize as *mut u8
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    unsafe fn phys_to_mut_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        // SAFETY: Forwarded; the caller upholds the contract of `M`.
        unsafe { (**self).phys_to_mut_ptr(pa) }
    }
}
