#![allow(dead_code)]

use kernel_bootmem::addresses::{FrameNumber, PhysicalAddress};
use kernel_bootmem::layout::PAGE_SIZE;
use kernel_bootmem::phys_mapper::{HhdmPhysMapper, PhysMapper};
use kernel_bootmem::release::PageReleaser;

/// `frames` pages of RAM filled with `fill`, at physical address zero and
/// reachable through a direct-map mapper. Word-backed so bitmaps can live in
/// it.
pub fn ram(frames: u64, fill: u8) -> (Vec<u64>, HhdmPhysMapper) {
    let words = usize::try_from(frames * PAGE_SIZE / 8).unwrap();
    let mut backing = vec![u64::from_ne_bytes([fill; 8]); words];
    let mapper = HhdmPhysMapper::new(backing.as_mut_ptr() as u64);
    (backing, mapper)
}

/// `len` bytes of `backing` at physical address `pa`.
pub fn bytes(backing: &[u64], pa: PhysicalAddress, len: usize) -> &[u8] {
    let off = usize::try_from(pa.as_u64()).unwrap();
    assert!(off + len <= backing.len() * 8);
    unsafe { std::slice::from_raw_parts(backing.as_ptr().cast::<u8>().add(off), len) }
}

/// Maps every page onto the same scratch page, for sparse layouts whose
/// allocations are at most three pages and never read back.
pub struct ScratchMemory {
    ptr: *mut u8,
}

impl ScratchMemory {
    pub fn new() -> Self {
        let buf = Vec::leak(vec![0u8; 4 * usize::try_from(PAGE_SIZE).unwrap()]);
        Self {
            ptr: buf.as_mut_ptr(),
        }
    }
}

impl PhysMapper for ScratchMemory {
    unsafe fn phys_to_mut_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        unsafe { self.ptr.add(usize::try_from(pa.page_offset()).unwrap()) }
    }
}

#[derive(Default)]
pub struct Collector(pub Vec<(FrameNumber, u32)>);

impl Collector {
    /// Released frames, one entry per frame, sorted.
    pub fn frames(&self) -> Vec<u64> {
        let mut frames: Vec<u64> = self
            .0
            .iter()
            .flat_map(|&(f, order)| f.as_u64()..f.as_u64() + (1 << order))
            .collect();
        frames.sort_unstable();
        frames
    }
}

impl PageReleaser for Collector {
    fn release_page(&mut self, frame: FrameNumber, order: u32) {
        self.0.push((frame, order));
    }
}

pub const fn f(n: u64) -> FrameNumber {
    FrameNumber::new(n)
}
