//! Per-frame bookkeeping.
//!
//! Every physical page has one [`FrameDescriptor`] in a [`FrameTable`]
//! indexed by frame number. The table itself is carved out of the first
//! large-enough usable region at boot, so no heap is needed below the
//! allocator.
//!
//! Descriptor fields are atomics: the reference count is shared freely,
//! while the remaining fields are only written under the owning zone's
//! lock and use relaxed ordering.

use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use quark_core::addr::PhysAddr;
use quark_core::paging::PhysFrame;
use quark_core::time;

use crate::topology::{NodeId, NumaTopology};
use crate::{DirectMap, PAGE_SIZE, PhysMemoryRegion};

bitflags::bitflags! {
    /// State flags of a physical frame.
    ///
    /// `FREE`, `ALLOCATED` and `PINNED` are mutually exclusive states;
    /// a frame with none of them set is outside the allocator (reserved
    /// firmware memory, or the frame table itself).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// On a buddy free list.
        const FREE       = 1 << 0;
        /// Handed out by the allocator.
        const ALLOCATED  = 1 << 1;
        /// Allocated and never reclaimable or migratable.
        const PINNED     = 1 << 2;
        /// Contents are stored compressed (capability-gated).
        const COMPRESSED = 1 << 3;
        /// Frame is hardware-encrypted (capability-gated).
        const ENCRYPTED  = 1 << 4;
    }
}

/// Why a frame was allocated; recorded for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocTag(pub u32);

impl AllocTag {
    /// No tag supplied.
    pub const UNTAGGED: Self = Self(0);
    /// Frame backs a translation-table level.
    pub const PAGE_TABLE: Self = Self(1);
    /// Frame backs a user mapping.
    pub const USER: Self = Self(2);
    /// Frame backs a kernel allocation.
    pub const KERNEL: Self = Self(3);
}

/// Bookkeeping record for one physical frame.
#[repr(C)]
pub struct FrameDescriptor {
    state: AtomicU8,
    order: AtomicU8,
    zone: AtomicU8,
    node: AtomicU8,
    refcount: AtomicU32,
    tag: AtomicU32,
    last_access: AtomicU64,
}

impl FrameDescriptor {
    /// Returns the current state flags.
    #[inline]
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.state.load(Ordering::Relaxed))
    }

    /// Returns `true` if the frame sits on a buddy free list.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.flags().contains(FrameFlags::FREE)
    }

    /// Returns the buddy order recorded for this frame.
    #[inline]
    pub fn order(&self) -> usize {
        self.order.load(Ordering::Relaxed) as usize
    }

    /// Returns the index of the owning zone.
    #[inline]
    pub fn zone_index(&self) -> usize {
        self.zone.load(Ordering::Relaxed) as usize
    }

    /// Returns the owning NUMA node.
    #[inline]
    pub fn node(&self) -> NodeId {
        NodeId(self.node.load(Ordering::Relaxed))
    }

    /// Returns the allocation tag.
    #[inline]
    pub fn tag(&self) -> AllocTag {
        AllocTag(self.tag.load(Ordering::Relaxed))
    }

    /// Returns the recorded last-access tick.
    #[inline]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Returns the current reference count.
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Increments the reference count, returning the new value.
    #[inline]
    pub fn retain(&self) -> u32 {
        let prev = self.refcount.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "retain of unreferenced frame");
        prev + 1
    }

    /// Decrements the reference count, returning the new value. The
    /// caller frees the frame when this reaches zero.
    #[inline]
    pub fn release(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release of unreferenced frame");
        prev - 1
    }

    /// Records an access for reclaim heuristics.
    #[inline]
    pub fn touch(&self) {
        self.last_access.store(time::ticks(), Ordering::Relaxed);
    }

    /// Transitions the descriptor to the free state at `order`.
    ///
    /// Called under the owning zone's lock.
    pub(crate) fn set_free(&self, order: usize) {
        debug_assert_eq!(self.refcount.load(Ordering::Relaxed), 0);
        self.order.store(order as u8, Ordering::Relaxed);
        self.state.store(FrameFlags::FREE.bits(), Ordering::Relaxed);
    }

    /// Clears all state flags: the frame becomes the interior of some
    /// block and its descriptor no longer speaks for one.
    ///
    /// Called under the owning zone's lock. Keeps the invariant that
    /// `FREE` is set exactly on the heads of blocks currently on a free
    /// list.
    pub(crate) fn reset_state(&self) {
        self.state.store(FrameFlags::empty().bits(), Ordering::Relaxed);
    }

    /// Clears the free state of a block head absorbed into a larger
    /// block during coalescing.
    pub(crate) fn clear_free(&self) {
        debug_assert!(self.is_free());
        self.reset_state();
    }

    /// Transitions the descriptor to the allocated state.
    ///
    /// Called under the owning zone's lock; sets the reference count to
    /// one.
    pub(crate) fn set_allocated(&self, order: usize, tag: AllocTag) {
        self.order.store(order as u8, Ordering::Relaxed);
        self.tag.store(tag.0, Ordering::Relaxed);
        self.refcount.store(1, Ordering::Release);
        self.state
            .store(FrameFlags::ALLOCATED.bits(), Ordering::Relaxed);
        self.touch();
    }

    /// Marks an allocated frame pinned.
    pub fn pin(&self) {
        debug_assert!(self.flags().contains(FrameFlags::ALLOCATED));
        self.state.store(
            (FrameFlags::ALLOCATED | FrameFlags::PINNED).bits(),
            Ordering::Relaxed,
        );
    }

    /// Records the owning zone and node; set once at allocator build.
    pub(crate) fn set_home(&self, zone: usize, node: NodeId) {
        self.zone.store(zone as u8, Ordering::Relaxed);
        self.node.store(node.0, Ordering::Relaxed);
    }
}

/// Errors from frame-table construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTableError {
    /// The memory map contains no usable memory.
    NoUsableMemory,
    /// No usable region is large enough to hold the descriptor table.
    NoTableRegion,
}

impl core::fmt::Display for FrameTableError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoUsableMemory => write!(f, "memory map contains no usable memory"),
            Self::NoTableRegion => write!(f, "no region large enough for the frame table"),
        }
    }
}

/// The frame descriptor table, indexed 1:1 by frame number.
#[derive(Debug)]
pub struct FrameTable {
    /// Descriptor array stored in carved-out physical memory, reached
    /// through the direct map.
    descriptors: *mut FrameDescriptor,
    len: usize,
    /// Physical range occupied by the table itself.
    carved: (PhysAddr, PhysAddr),
}

// SAFETY: All descriptor fields are atomics; the raw pointer is only a
// stable view into memory the table owns for its lifetime.
unsafe impl Send for FrameTable {}
unsafe impl Sync for FrameTable {}

impl FrameTable {
    /// Builds the frame table covering every frame up to the end of the
    /// last usable region, carving storage for the descriptors out of the
    /// first usable region that fits them.
    ///
    /// # Safety
    ///
    /// `regions` must accurately describe physical memory and `dm` must
    /// cover it. Must be called exactly once per allocator.
    pub unsafe fn new(
        regions: &[PhysMemoryRegion],
        topology: &NumaTopology,
        dm: &impl DirectMap,
    ) -> Result<Self, FrameTableError> {
        let max_phys = regions
            .iter()
            .filter(|r| r.usable)
            .map(|r| r.end().as_u64())
            .max()
            .ok_or(FrameTableError::NoUsableMemory)?;

        let len = (max_phys as usize) / PAGE_SIZE;
        let table_bytes = len * core::mem::size_of::<FrameDescriptor>();
        let table_frames = table_bytes.div_ceil(PAGE_SIZE);

        // First usable region that can hold the whole descriptor array.
        let carve_start = regions
            .iter()
            .filter(|r| r.usable && r.size >= (table_frames * PAGE_SIZE) as u64)
            .map(|r| r.start.align_up(PAGE_SIZE as u64))
            .next()
            .ok_or(FrameTableError::NoTableRegion)?;
        let carve_end = carve_start + (table_frames * PAGE_SIZE) as u64;

        let descriptors = dm.phys_to_ptr(carve_start) as *mut FrameDescriptor;
        // SAFETY: The carved range is usable RAM covered by the direct
        // map and not yet handed to any allocator; zero bytes are a valid
        // initial state for a descriptor full of atomics.
        unsafe {
            core::ptr::write_bytes(descriptors as *mut u8, 0, table_bytes);
        }

        let table = Self {
            descriptors,
            len,
            carved: (carve_start, carve_end),
        };

        // The table's own frames are pinned kernel memory.
        for pfn in carve_start.frame_number()..carve_end.frame_number() {
            let desc = table.get(pfn).expect("carved range within table");
            desc.set_allocated(0, AllocTag::KERNEL);
            desc.pin();
            desc.set_home(0, topology.node_of(PhysAddr::from_frame_number(pfn)));
        }

        Ok(table)
    }

    /// Number of tracked frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the table tracks no frames.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the physical range occupied by the descriptor array.
    #[inline]
    pub fn carved_range(&self) -> (PhysAddr, PhysAddr) {
        self.carved
    }

    /// Returns the descriptor for frame number `pfn`.
    #[inline]
    pub fn get(&self, pfn: usize) -> Option<&FrameDescriptor> {
        if pfn < self.len {
            // SAFETY: `pfn` is in bounds and the array lives as long as
            // the table.
            Some(unsafe { &*self.descriptors.add(pfn) })
        } else {
            None
        }
    }

    /// Returns the descriptor for `frame`, panicking if it is outside the
    /// table (allocator-internal callers always pass tracked frames).
    #[inline]
    #[track_caller]
    pub fn of(&self, frame: PhysFrame) -> &FrameDescriptor {
        self.get(frame.number()).expect("frame outside frame table")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestMemory;

    #[test]
    fn builds_and_carves_descriptor_storage() {
        let mem = TestMemory::new(64);
        let topo = NumaTopology::single_node(mem.span_end());
        let table = unsafe { FrameTable::new(&mem.regions(), &topo, mem.dm()) }.unwrap();

        assert_eq!(table.len(), 64);
        let (start, end) = table.carved_range();
        assert!(end > start);

        // Carved frames are pinned and referenced.
        let desc = table.of(PhysFrame::containing_address(start));
        assert!(desc.flags().contains(FrameFlags::PINNED));
        assert_eq!(desc.refcount(), 1);

        // Frames outside the carve start out untracked (no state flags).
        let last = table.get(63).unwrap();
        assert_eq!(last.flags(), FrameFlags::empty());
        assert_eq!(last.refcount(), 0);
    }

    #[test]
    fn out_of_range_lookup_fails() {
        let mem = TestMemory::new(16);
        let topo = NumaTopology::single_node(mem.span_end());
        let table = unsafe { FrameTable::new(&mem.regions(), &topo, mem.dm()) }.unwrap();
        assert!(table.get(16).is_none());
        assert!(table.get(15).is_some());
    }

    #[test]
    fn refcount_retain_release() {
        let mem = TestMemory::new(16);
        let topo = NumaTopology::single_node(mem.span_end());
        let table = unsafe { FrameTable::new(&mem.regions(), &topo, mem.dm()) }.unwrap();

        let desc = table.get(8).unwrap();
        desc.set_allocated(0, AllocTag::USER);
        assert_eq!(desc.refcount(), 1);
        assert_eq!(desc.retain(), 2);
        assert_eq!(desc.release(), 1);
        assert_eq!(desc.release(), 0);
    }

    #[test]
    fn empty_memory_map_is_rejected() {
        let mem = TestMemory::new(16);
        let topo = NumaTopology::single_node(mem.span_end());
        let none: [PhysMemoryRegion; 0] = [];
        let err = unsafe { FrameTable::new(&none, &topo, mem.dm()) }.unwrap_err();
        assert_eq!(err, FrameTableError::NoUsableMemory);
    }
}
