//! Shared test fixtures: a mock physical memory standing in for the
//! direct map, mirroring how the boot path presents RAM to the
//! allocator.

use std::alloc::Layout;

use quark_core::addr::PhysAddr;

use crate::{DirectMap, PAGE_SIZE, PhysMemoryRegion};

/// [`DirectMap`] over a host buffer: physical address zero is the buffer
/// base.
pub struct BufferMap {
    base: *mut u8,
}

// SAFETY: The buffer outlives every user; concurrent access is managed
// by the allocator structures under test.
unsafe impl Send for BufferMap {}
unsafe impl Sync for BufferMap {}

// SAFETY: Pointers cover the whole simulated span for the fixture's
// lifetime.
unsafe impl DirectMap for BufferMap {
    fn phys_to_ptr(&self, phys: PhysAddr) -> *mut u8 {
        // SAFETY: Tests only present addresses inside the span.
        unsafe { self.base.add(phys.as_u64() as usize) }
    }
}

/// A page-aligned buffer acting as physical memory `[0, frames * 4096)`.
pub struct TestMemory {
    map: BufferMap,
    frames: usize,
}

impl TestMemory {
    /// Allocates a zeroed physical-memory stand-in of `frames` pages.
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: Layout is non-zero and valid.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self {
            map: BufferMap { base },
            frames,
        }
    }

    /// The exclusive end of the simulated physical span.
    pub fn span_end(&self) -> PhysAddr {
        PhysAddr::new((self.frames * PAGE_SIZE) as u64)
    }

    /// A one-region usable memory map covering the whole span.
    pub fn regions(&self) -> [PhysMemoryRegion; 1] {
        [PhysMemoryRegion {
            start: PhysAddr::zero(),
            size: (self.frames * PAGE_SIZE) as u64,
            usable: true,
        }]
    }

    /// The direct map over this buffer.
    pub fn dm(&self) -> &BufferMap {
        &self.map
    }
}

impl Drop for TestMemory {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: Allocated in `new` with the same layout.
        unsafe { std::alloc::dealloc(self.map.base, layout) };
    }
}
