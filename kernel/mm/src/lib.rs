//! Memory management for the Quark kernel.
//!
//! This crate owns every physical page frame and every task's virtual
//! address space:
//!
//! - [`pmm`] — the buddy frame allocator over [`zone`]s and the NUMA
//!   [`topology`], backed by the per-frame bookkeeping in [`frame`].
//! - [`vma`] / [`address_space`] — virtual memory areas and the per-task
//!   address space that collects them.
//! - [`mapper`] — the hardware-abstraction walker over the multi-level
//!   translation tree.
//! - [`fault`] — the page-fault resolution state machine.
//!
//! # Lock ordering
//!
//! An address space's `RwLock` is always taken before any zone spin lock
//! (page-table frames are allocated while mapping). Zone locks never nest
//! with each other, and nothing is logged while a zone lock is held.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod address_space;
pub mod backing;
pub mod fault;
pub mod frame;
pub mod mapper;
pub mod pmm;
pub mod topology;
pub mod vma;
pub mod zone;

#[cfg(test)]
mod testutil;

use quark_core::addr::PhysAddr;

/// Size of one page / frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Bit mask covering the page-offset bits.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Number of buddy orders: blocks span `2^0` to `2^(MAX_ORDER - 1)` pages.
pub const MAX_ORDER: usize = 11;

/// Depth of the translation tree walked by [`mapper::PageWalker`].
///
/// The walker iterates level indices rather than naming levels, so this
/// constant is the only place the depth appears.
pub const PAGING_LEVELS: usize = 4;

/// A physical memory range reported by the boot-time memory map provider.
///
/// The caller converts bootloader-specific memory maps into these
/// descriptors before handing them to [`pmm::FrameAllocator::new`].
#[derive(Debug, Clone, Copy)]
pub struct PhysMemoryRegion {
    /// Start of the region.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// Whether the region is usable RAM (as opposed to reserved firmware
    /// or device ranges).
    pub usable: bool,
}

impl PhysMemoryRegion {
    /// Returns the exclusive end address of the region.
    #[inline]
    pub fn end(&self) -> PhysAddr {
        self.start + self.size
    }
}

bitflags::bitflags! {
    /// Optional capabilities of the memory subsystem.
    ///
    /// Features whose algorithms this subsystem does not implement are
    /// gated behind these flags instead of being stubbed out; the
    /// corresponding entry points fail with `Unsupported` while the flag
    /// is clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// Moving an allocated block between NUMA nodes.
        const PAGE_MIGRATION = 1 << 0;
        /// Transparent compression of cold frames.
        const COMPRESSION    = 1 << 1;
        /// Hardware-encrypted frame allocation.
        const ENCRYPTION     = 1 << 2;
    }
}

/// Access to physical memory through the kernel's direct mapping.
///
/// The page-table walker, the buddy free lists, and the fault resolver
/// all read and write physical frames through this trait. The kernel
/// implements it with the bootloader-provided linear mapping
/// ([`OffsetDirectMap`]); host tests substitute a plain buffer.
///
/// # Safety
///
/// Implementations must return pointers that are valid for reads and
/// writes of [`PAGE_SIZE`] bytes for every frame handed out by the frame
/// allocator, and the mapping must be stable for the allocator's
/// lifetime.
pub unsafe trait DirectMap: Sync {
    /// Returns a pointer to the byte at physical address `phys`.
    fn phys_to_ptr(&self, phys: PhysAddr) -> *mut u8;
}

/// [`DirectMap`] implementation for an offset-mapped physical window,
/// i.e. the conventional higher-half direct map.
#[derive(Debug, Clone, Copy)]
pub struct OffsetDirectMap {
    offset: u64,
}

impl OffsetDirectMap {
    /// Creates a direct map adding `offset` to every physical address.
    ///
    /// # Safety
    ///
    /// `offset` must be the base of a linear mapping covering all
    /// physical memory handed to the frame allocator.
    pub const unsafe fn new(offset: u64) -> Self {
        Self { offset }
    }
}

// SAFETY: The constructor contract guarantees the offset mapping covers
// all managed physical memory.
unsafe impl DirectMap for OffsetDirectMap {
    #[inline]
    fn phys_to_ptr(&self, phys: PhysAddr) -> *mut u8 {
        (self.offset + phys.as_u64()) as *mut u8
    }
}

/// Zeroes one frame through the direct map.
///
/// # Safety
///
/// `frame` must be owned by the caller and not concurrently accessed.
pub(crate) unsafe fn zero_frame(dm: &impl DirectMap, frame: quark_core::paging::PhysFrame) {
    // SAFETY: The DirectMap contract makes the pointer valid for
    // PAGE_SIZE bytes; the caller guarantees exclusive ownership.
    unsafe {
        core::ptr::write_bytes(dm.phys_to_ptr(frame.start_address()), 0, PAGE_SIZE);
    }
}

/// Copies the contents of `src` into `dst` through the direct map.
///
/// # Safety
///
/// `dst` must be owned by the caller; `src` must remain mapped for the
/// duration of the copy. The frames must be distinct.
pub(crate) unsafe fn copy_frame(
    dm: &impl DirectMap,
    src: quark_core::paging::PhysFrame,
    dst: quark_core::paging::PhysFrame,
) {
    debug_assert_ne!(src, dst);
    // SAFETY: Both pointers are valid for PAGE_SIZE bytes per the
    // DirectMap contract and refer to distinct frames.
    unsafe {
        core::ptr::copy_nonoverlapping(
            dm.phys_to_ptr(src.start_address()),
            dm.phys_to_ptr(dst.start_address()),
            PAGE_SIZE,
        );
    }
}
