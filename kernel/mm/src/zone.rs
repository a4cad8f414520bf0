//! Memory zones and their buddy free lists.
//!
//! A [`Zone`] is one contiguous physical range with a single allocation
//! policy. It owns per-order free lists protected by its own spin lock,
//! so zones on different nodes (or of different kinds) never contend.
//!
//! Free lists are doubly-linked headers threaded through the free blocks
//! themselves via the direct map; the frame table records each block's
//! state and order so coalescing can test a buddy in O(1).

use core::sync::atomic::{AtomicU64, Ordering};

use quark_core::addr::PhysAddr;
use quark_core::paging::PhysFrame;
use quark_core::sync::SpinLock;

use crate::frame::{AllocTag, FrameTable};
use crate::topology::{NodeId, ZoneKind};
use crate::{DirectMap, MAX_ORDER, PAGE_SIZE};

/// Link header stored in the first bytes of every free block.
///
/// `u64::MAX` marks a missing neighbour; physical address zero is a
/// valid frame.
#[repr(C)]
struct FreeBlock {
    prev: u64,
    next: u64,
}

const NO_LINK: u64 = u64::MAX;

/// Per-order list heads, guarded by the zone lock.
struct FreeArea {
    heads: [u64; MAX_ORDER],
}

impl FreeArea {
    const fn new() -> Self {
        Self {
            heads: [NO_LINK; MAX_ORDER],
        }
    }
}

/// Free-page thresholds derived from the zone size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    /// Plenty of memory.
    Nominal,
    /// Below the low watermark; background reclaim should start.
    Low,
    /// Below the minimum watermark; synchronous reclaim territory.
    Critical,
}

/// One contiguous physical range with uniform allocation policy.
pub struct Zone {
    kind: ZoneKind,
    node: NodeId,
    start: PhysAddr,
    end: PhysAddr,
    /// Buddy free lists; the only lock in the allocation fast path.
    area: SpinLock<FreeArea>,
    free_pages: AtomicU64,
    managed_pages: AtomicU64,
    watermark_low: AtomicU64,
    watermark_min: AtomicU64,
}

impl Zone {
    /// Creates an empty zone covering `[start, end)`.
    pub fn new(kind: ZoneKind, node: NodeId, start: PhysAddr, end: PhysAddr) -> Self {
        Self {
            kind,
            node,
            start,
            end,
            area: SpinLock::new(FreeArea::new()),
            free_pages: AtomicU64::new(0),
            managed_pages: AtomicU64::new(0),
            watermark_low: AtomicU64::new(0),
            watermark_min: AtomicU64::new(0),
        }
    }

    /// The zone's allocation policy class.
    #[inline]
    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    /// The owning NUMA node.
    #[inline]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Returns `true` if `addr` falls inside the zone.
    #[inline]
    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Number of pages currently on the free lists.
    #[inline]
    pub fn free_pages(&self) -> u64 {
        self.free_pages.load(Ordering::Relaxed)
    }

    /// Number of pages this zone manages.
    #[inline]
    pub fn managed_pages(&self) -> u64 {
        self.managed_pages.load(Ordering::Relaxed)
    }

    /// Current pressure state relative to the watermarks.
    pub fn pressure(&self) -> Pressure {
        let free = self.free_pages();
        if free <= self.watermark_min.load(Ordering::Relaxed) {
            Pressure::Critical
        } else if free <= self.watermark_low.load(Ordering::Relaxed) {
            Pressure::Low
        } else {
            Pressure::Nominal
        }
    }

    /// Derives the watermarks from the managed page count. Called once
    /// after all ranges are added.
    pub(crate) fn finalize_watermarks(&self) {
        let managed = self.managed_pages();
        self.watermark_low.store(managed / 16, Ordering::Relaxed);
        self.watermark_min.store(managed / 64, Ordering::Relaxed);
    }

    /// Seeds the free lists with the usable range `[start, end)`,
    /// breaking it into the largest aligned blocks that fit.
    /// `zone_index` is this zone's position in the allocator's zone
    /// array, recorded into every descriptor for free-path routing.
    ///
    /// # Safety
    ///
    /// The range must be usable RAM inside this zone, covered by `dm`,
    /// and not yet known to any allocator.
    pub(crate) unsafe fn add_range(
        &self,
        table: &FrameTable,
        dm: &impl DirectMap,
        zone_index: usize,
        start: PhysAddr,
        end: PhysAddr,
    ) {
        debug_assert!(start >= self.start && end <= self.end);
        let mut pfn = start.align_up(PAGE_SIZE as u64).frame_number();
        let end_pfn = end.align_down(PAGE_SIZE as u64).frame_number();

        for i in pfn..end_pfn {
            if let Some(desc) = table.get(i) {
                desc.set_home(zone_index, self.node);
            }
        }

        while pfn < end_pfn {
            // Largest order that is both aligned at `pfn` and fits.
            let mut order = MAX_ORDER - 1;
            while order > 0 && (pfn & ((1 << order) - 1) != 0 || pfn + (1 << order) > end_pfn) {
                order -= 1;
            }

            let frame = PhysFrame::from_number(pfn);
            // SAFETY: The block is unused RAM per the caller contract.
            unsafe { self.free_block(table, dm, frame, order) };
            self.managed_pages
                .fetch_add(1 << order, Ordering::Relaxed);
            pfn += 1 << order;
        }
    }

    /// Allocates one block of `2^order` pages, splitting larger blocks as
    /// needed. Returns `None` when no block of sufficient order is free.
    pub(crate) fn allocate(
        &self,
        table: &FrameTable,
        dm: &impl DirectMap,
        order: usize,
        tag: AllocTag,
    ) -> Option<PhysFrame> {
        debug_assert!(order < MAX_ORDER);
        let mut area = self.area.lock();

        // Smallest free order that can satisfy the request.
        let found = (order..MAX_ORDER).find(|&i| area.heads[i] != NO_LINK)?;

        // SAFETY: List heads only ever hold blocks seeded through
        // add_range, so the address is a valid free block in this zone.
        let frame = unsafe { self.pop_head(dm, &mut area, found) };

        // Split down to the requested order; the upper halves go back on
        // their lists.
        let mut current = found;
        while current > order {
            current -= 1;
            let upper = PhysFrame::from_number(frame.number() + (1 << current));
            // SAFETY: `upper` is the second half of a block we own.
            unsafe { self.push_head(dm, &mut area, upper, current) };
            table.of(upper).set_free(current);
        }

        table.of(frame).set_allocated(order, tag);
        self.free_pages
            .fetch_sub(1 << order, Ordering::Relaxed);
        Some(frame)
    }

    /// Returns a block of `2^order` pages to the free lists, coalescing
    /// with its buddy while possible.
    ///
    /// # Safety
    ///
    /// The block must have been allocated from this zone at this order
    /// (or be fresh memory seeded by `add_range`) and must no longer be
    /// referenced.
    pub(crate) unsafe fn free(
        &self,
        table: &FrameTable,
        dm: &impl DirectMap,
        frame: PhysFrame,
        order: usize,
    ) {
        debug_assert!(
            table.of(frame).flags() == crate::frame::FrameFlags::ALLOCATED,
            "double free or free of unallocated block {:?}",
            frame
        );
        debug_assert_eq!(table.of(frame).refcount(), 0, "free of referenced frame");
        self.free_pages
            .fetch_add(1 << order, Ordering::Relaxed);
        // SAFETY: Forwarded caller contract.
        unsafe { self.free_block(table, dm, frame, order) };
    }

    /// Lock-holding free path shared by `free` and `add_range`.
    unsafe fn free_block(
        &self,
        table: &FrameTable,
        dm: &impl DirectMap,
        frame: PhysFrame,
        order: usize,
    ) {
        let mut area = self.area.lock();
        let mut frame = frame;
        let mut order = order;

        // The freed head stops speaking for the block until it is pushed
        // (it may end up interior to a coalesced block instead).
        table.of(frame).reset_state();

        // Coalesce upwards while the buddy is free at the same order.
        while order < MAX_ORDER - 1 {
            let buddy = frame.buddy(order);
            if !self.contains(buddy.start_address()) {
                break;
            }
            let Some(buddy_desc) = table.get(buddy.number()) else {
                break;
            };
            if !buddy_desc.is_free() || buddy_desc.order() != order {
                break;
            }

            // SAFETY: The buddy is on the order list we are holding the
            // lock for; unlinking it is exclusive to us.
            unsafe { self.unlink(dm, &mut area, buddy, order) };
            buddy_desc.clear_free();

            frame = PhysFrame::from_number(frame.number().min(buddy.number()));
            order += 1;
        }

        // SAFETY: The (possibly coalesced) block is exclusively ours.
        unsafe { self.push_head(dm, &mut area, frame, order) };
        table.of(frame).set_free(order);
    }

    // -- free-list primitives (zone lock held) ------------------------------

    /// Reads the link header of a free block.
    unsafe fn header<'a>(&self, dm: &impl DirectMap, frame: PhysFrame) -> &'a mut FreeBlock {
        debug_assert!(self.contains(frame.start_address()));
        // SAFETY: Free blocks are unused RAM owned by this zone; the
        // header occupies the first 16 bytes of a PAGE_SIZE block and is
        // only touched under the zone lock.
        unsafe { &mut *(dm.phys_to_ptr(frame.start_address()) as *mut FreeBlock) }
    }

    /// Pushes `frame` on the head of the `order` list.
    unsafe fn push_head(
        &self,
        dm: &impl DirectMap,
        area: &mut FreeArea,
        frame: PhysFrame,
        order: usize,
    ) {
        let old_head = area.heads[order];
        // SAFETY: Caller owns the block exclusively.
        let header = unsafe { self.header(dm, frame) };
        header.prev = NO_LINK;
        header.next = old_head;
        if old_head != NO_LINK {
            // SAFETY: The old head is a free block on this list.
            let old = unsafe {
                self.header(dm, PhysFrame::containing_address(PhysAddr::new(old_head)))
            };
            old.prev = frame.start_address().as_u64();
        }
        area.heads[order] = frame.start_address().as_u64();
    }

    /// Pops and returns the head of the `order` list, which must exist.
    unsafe fn pop_head(
        &self,
        dm: &impl DirectMap,
        area: &mut FreeArea,
        order: usize,
    ) -> PhysFrame {
        let head = area.heads[order];
        debug_assert_ne!(head, NO_LINK);
        let frame = PhysFrame::containing_address(PhysAddr::new(head));
        // SAFETY: The head is a free block on this list.
        let header = unsafe { self.header(dm, frame) };
        area.heads[order] = header.next;
        if header.next != NO_LINK {
            // SAFETY: The successor is a free block on this list.
            let next = unsafe {
                self.header(dm, PhysFrame::containing_address(PhysAddr::new(header.next)))
            };
            next.prev = NO_LINK;
        }
        frame
    }

    /// Unlinks `frame` from anywhere in the `order` list.
    unsafe fn unlink(
        &self,
        dm: &impl DirectMap,
        area: &mut FreeArea,
        frame: PhysFrame,
        order: usize,
    ) {
        // SAFETY: Caller guarantees the block is on this list.
        let header = unsafe { self.header(dm, frame) };
        let (prev, next) = (header.prev, header.next);

        if prev == NO_LINK {
            debug_assert_eq!(area.heads[order], frame.start_address().as_u64());
            area.heads[order] = next;
        } else {
            // SAFETY: The predecessor is a free block on this list.
            let p = unsafe {
                self.header(dm, PhysFrame::containing_address(PhysAddr::new(prev)))
            };
            p.next = next;
        }
        if next != NO_LINK {
            // SAFETY: The successor is a free block on this list.
            let n = unsafe {
                self.header(dm, PhysFrame::containing_address(PhysAddr::new(next)))
            };
            n.prev = prev;
        }
    }

    /// Checks the buddy invariant for `order`: no block on the list has a
    /// free buddy of the same order. Test/diagnostic helper; takes the
    /// zone lock.
    pub fn assert_no_free_buddies(&self, table: &FrameTable, dm: &impl DirectMap) {
        let area = self.area.lock();
        for order in 0..MAX_ORDER - 1 {
            let mut cursor = area.heads[order];
            while cursor != NO_LINK {
                let frame = PhysFrame::containing_address(PhysAddr::new(cursor));
                let buddy = frame.buddy(order);
                if self.contains(buddy.start_address()) {
                    if let Some(desc) = table.get(buddy.number()) {
                        assert!(
                            !(desc.is_free() && desc.order() == order),
                            "free buddies left uncoalesced at order {order}"
                        );
                    }
                }
                // SAFETY: Walking blocks under the zone lock.
                let header = unsafe { &*(dm.phys_to_ptr(frame.start_address()) as *const FreeBlock) };
                cursor = header.next;
            }
        }
    }
}
