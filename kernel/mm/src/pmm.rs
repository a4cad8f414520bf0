//! The physical frame allocator.
//!
//! [`FrameAllocator`] fronts the buddy [`Zone`]s: it routes every
//! request to candidate zones ordered by NUMA distance and zone-kind
//! fallback, fires the memory-pressure hook, and invokes synchronous
//! reclaim when a non-atomic request meets an empty free list.
//!
//! The allocator is built once at boot from the memory map and passed by
//! reference to every call site; all interior locking is per zone.

use core::sync::atomic::{AtomicPtr, Ordering};

use planck_noalloc::vec::ArrayVec;
use quark_core::addr::PhysAddr;
use quark_core::paging::PhysFrame;
use quark_core::{kdebug, kwarn};

use crate::frame::{AllocTag, FrameTable, FrameTableError};
use crate::topology::{NodeId, NumaTopology, ZoneKind};
use crate::zone::{Pressure, Zone};
use crate::{Capabilities, DirectMap, MAX_ORDER, PAGE_SIZE, PhysMemoryRegion};

/// Maximum number of zones across all nodes.
pub const MAX_ZONES: usize = 32;

/// Errors from frame allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free block satisfies the order/zone/node constraints.
    OutOfMemory,
    /// The requested order is outside `0..MAX_ORDER`.
    InvalidOrder,
    /// The request needs a capability the subsystem was built without.
    Unsupported,
    /// Allocator construction failed.
    Init(FrameTableError),
}

impl core::fmt::Display for AllocError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::InvalidOrder => write!(f, "allocation order out of range"),
            Self::Unsupported => write!(f, "capability not available"),
            Self::Init(e) => write!(f, "allocator init: {e}"),
        }
    }
}

bitflags::bitflags! {
    /// Modifiers for an allocation request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Zero the block before returning it.
        const ZEROED      = 1 << 0;
        /// Fail immediately instead of attempting reclaim.
        const ATOMIC      = 1 << 1;
        /// Never fall back to a remote NUMA node.
        const NO_FALLBACK = 1 << 2;
        /// Request a hardware-encrypted block (capability-gated).
        const ENCRYPTED   = 1 << 3;
    }
}

/// One allocation request.
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    /// Buddy order of the block.
    pub order: usize,
    /// Highest acceptable zone kind; the allocator may fall back to more
    /// constrained kinds, never wider.
    pub ceiling: ZoneKind,
    /// Preferred NUMA node; `None` means node 0.
    pub node: Option<NodeId>,
    /// Behaviour modifiers.
    pub flags: AllocFlags,
    /// Diagnostic tag recorded in the frame descriptor.
    pub tag: AllocTag,
}

impl AllocRequest {
    /// A plain request for a block of `2^order` pages of normal memory.
    pub fn order(order: usize) -> Self {
        Self {
            order,
            ceiling: ZoneKind::Normal,
            node: None,
            flags: AllocFlags::empty(),
            tag: AllocTag::UNTAGGED,
        }
    }

    /// Constrains the zone ceiling.
    pub fn ceiling(mut self, kind: ZoneKind) -> Self {
        self.ceiling = kind;
        self
    }

    /// Prefers (or pins, with [`AllocFlags::NO_FALLBACK`]) a node.
    pub fn on_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    /// Adds behaviour flags.
    pub fn with_flags(mut self, flags: AllocFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Sets the diagnostic tag.
    pub fn tagged(mut self, tag: AllocTag) -> Self {
        self.tag = tag;
        self
    }
}

// ---------------------------------------------------------------------------
// Pressure and reclaim hooks
// ---------------------------------------------------------------------------

/// Signature of the memory-pressure notification hook.
pub type PressureFn = fn(Pressure);

/// Signature of the synchronous reclaim hook: asked to free at least the
/// given number of pages, returns how many it actually reclaimed.
pub type ReclaimFn = fn(u64) -> u64;

fn null_pressure(_level: Pressure) {}

fn null_reclaim(_wanted: u64) -> u64 {
    0
}

static PRESSURE_FN: AtomicPtr<()> = AtomicPtr::new(null_pressure as *mut ());
static RECLAIM_FN: AtomicPtr<()> = AtomicPtr::new(null_reclaim as *mut ());

/// Registers the memory-pressure notification hook.
///
/// # Safety
///
/// The function must be safe to call from any context; it runs outside
/// all allocator locks but possibly in a fault path.
pub unsafe fn set_pressure_fn(f: PressureFn) {
    PRESSURE_FN.store(f as *mut (), Ordering::Release);
}

/// Registers the synchronous reclaim hook.
///
/// # Safety
///
/// The function must be safe to call from allocation context, may only
/// free memory through [`FrameAllocator::free`], and must not acquire
/// any address-space lock (allocation runs under them in fault paths).
pub unsafe fn set_reclaim_fn(f: ReclaimFn) {
    RECLAIM_FN.store(f as *mut (), Ordering::Release);
}

fn notify_pressure(level: Pressure) {
    let ptr = PRESSURE_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `PressureFn` pointers are stored.
    let f: PressureFn = unsafe { core::mem::transmute(ptr) };
    f(level);
}

fn run_reclaim(wanted: u64) -> u64 {
    let ptr = RECLAIM_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `ReclaimFn` pointers are stored.
    let f: ReclaimFn = unsafe { core::mem::transmute(ptr) };
    f(wanted)
}

// ---------------------------------------------------------------------------
// FrameAllocator
// ---------------------------------------------------------------------------

/// The physical memory manager.
pub struct FrameAllocator {
    table: FrameTable,
    zones: ArrayVec<Zone, MAX_ZONES>,
    topology: NumaTopology,
    capabilities: Capabilities,
}

impl FrameAllocator {
    /// Builds the allocator from the boot memory map and NUMA topology.
    ///
    /// Carves the frame table out of the first fitting region, splits
    /// every usable region into per-node, per-kind zones, and seeds the
    /// buddy free lists.
    ///
    /// # Safety
    ///
    /// `regions` must accurately describe physical memory, `dm` must
    /// cover it, and this must be called exactly once per machine boot.
    pub unsafe fn new(
        regions: &[PhysMemoryRegion],
        topology: NumaTopology,
        capabilities: Capabilities,
        dm: &impl DirectMap,
    ) -> Result<Self, AllocError> {
        // SAFETY: Forwarded caller contract.
        let table =
            unsafe { FrameTable::new(regions, &topology, dm) }.map_err(AllocError::Init)?;
        let (carve_start, carve_end) = table.carved_range();

        let mut allocator = Self {
            table,
            zones: ArrayVec::new(),
            topology,
            capabilities,
        };

        // Cut every usable region at node, zone-kind, and carve
        // boundaries; each resulting piece lands in (or creates) the
        // zone for its (node, kind) pair.
        for region in regions.iter().filter(|r| r.usable) {
            let mut cursor = region.start.align_up(PAGE_SIZE as u64);
            let end = region.end().align_down(PAGE_SIZE as u64);
            while cursor < end {
                // Skip the descriptor-table carve.
                if cursor >= carve_start && cursor < carve_end {
                    cursor = carve_end;
                    continue;
                }
                let node = allocator.topology.node_of(cursor);
                let kind = ZoneKind::classify(cursor, allocator.topology.normal_limit());

                let mut piece_end = end
                    .as_u64()
                    .min(kind.boundary(allocator.topology.normal_limit()));
                if cursor < carve_start {
                    piece_end = piece_end.min(carve_start.as_u64());
                }
                for n in allocator.topology.nodes() {
                    if n.contains(cursor) {
                        piece_end = piece_end.min(n.end.as_u64());
                    }
                }
                let piece_end = PhysAddr::new(piece_end);
                debug_assert!(piece_end > cursor);

                allocator.seed_zone(node, kind, cursor, piece_end, dm);
                cursor = piece_end;
            }
        }

        for zone in allocator.zones.iter() {
            zone.finalize_watermarks();
        }

        kdebug!(
            "pmm: {} zones over {} frames ({} free)",
            allocator.zones.len(),
            allocator.table.len(),
            allocator.free_pages()
        );
        Ok(allocator)
    }

    /// Finds or creates the zone for `(node, kind)` adjacent to the
    /// piece, then seeds the piece into its free lists. Returns the zone
    /// index.
    fn seed_zone(
        &mut self,
        node: NodeId,
        kind: ZoneKind,
        start: PhysAddr,
        end: PhysAddr,
        dm: &impl DirectMap,
    ) -> usize {
        let index = match self
            .zones
            .iter()
            .position(|z| z.node() == node && z.kind() == kind)
        {
            Some(i) => i,
            None => {
                assert!(!self.zones.is_full(), "zone table full");
                // The zone spans the (node, kind) window so later pieces
                // of the same class can join it. Clamping to the node
                // span keeps buddy coalescing from reaching into a
                // neighbouring node's zone.
                let limit = self.topology.normal_limit();
                let kind_start = match kind {
                    ZoneKind::Dma => PhysAddr::zero(),
                    ZoneKind::Dma32 => PhysAddr::new(crate::topology::DMA_LIMIT),
                    ZoneKind::Normal => PhysAddr::new(crate::topology::DMA32_LIMIT),
                    ZoneKind::High => PhysAddr::new(limit),
                    ZoneKind::Device => start,
                };
                let kind_end = PhysAddr::new_truncate(kind.boundary(limit));
                let (mut zone_start, mut zone_end) = (kind_start, kind_end);
                if let Some(n) = self.topology.nodes().iter().find(|n| n.id == node) {
                    zone_start = zone_start.max(n.start);
                    zone_end = zone_end.min(n.end);
                }
                self.zones.push(Zone::new(kind, node, zone_start, zone_end));
                self.zones.len() - 1
            }
        };
        // SAFETY: The piece is usable RAM not yet seeded anywhere else.
        unsafe { self.zones[index].add_range(&self.table, dm, index, start, end) };
        index
    }

    /// Registers a device-exposed physical range as a dedicated zone.
    ///
    /// Device zones are only ever used by requests whose ceiling is
    /// [`ZoneKind::Device`]; ordinary allocations never touch them.
    ///
    /// # Safety
    ///
    /// The range must be device-accessible memory covered by `dm`, inside
    /// the frame table span, and not part of any usable RAM region.
    pub unsafe fn register_device_region(
        &mut self,
        node: NodeId,
        start: PhysAddr,
        end: PhysAddr,
        dm: &impl DirectMap,
    ) {
        let index = self.seed_zone(node, ZoneKind::Device, start, end, dm);
        self.zones[index].finalize_watermarks();
    }

    /// Returns the frame bookkeeping table.
    #[inline]
    pub fn table(&self) -> &FrameTable {
        &self.table
    }

    /// Returns the NUMA topology.
    #[inline]
    pub fn topology(&self) -> &NumaTopology {
        &self.topology
    }

    /// Returns the configured capabilities.
    #[inline]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Total free pages across all zones.
    pub fn free_pages(&self) -> u64 {
        self.zones.iter().map(Zone::free_pages).sum()
    }

    /// Allocates a block of `2^order` pages.
    ///
    /// Candidate zones are visited node-by-node in increasing NUMA
    /// distance (just the preferred node under
    /// [`AllocFlags::NO_FALLBACK`]), and within each node along the zone
    /// kind fallback chain. When every candidate is empty, a non-atomic
    /// request runs the reclaim hook once and retries.
    pub fn allocate(
        &self,
        request: AllocRequest,
        dm: &impl DirectMap,
    ) -> Result<PhysFrame, AllocError> {
        if request.order >= MAX_ORDER {
            return Err(AllocError::InvalidOrder);
        }
        if request.flags.contains(AllocFlags::ENCRYPTED)
            && !self.capabilities.contains(Capabilities::ENCRYPTION)
        {
            return Err(AllocError::Unsupported);
        }

        if let Some(frame) = self.try_zones(&request, dm) {
            self.after_alloc(&request, frame, dm);
            return Ok(frame);
        }

        if !request.flags.contains(AllocFlags::ATOMIC) {
            let wanted = 1u64 << request.order;
            let reclaimed = run_reclaim(wanted);
            if reclaimed > 0 {
                kdebug!("pmm: reclaim freed {reclaimed} pages, retrying order {}", request.order);
                if let Some(frame) = self.try_zones(&request, dm) {
                    self.after_alloc(&request, frame, dm);
                    return Ok(frame);
                }
            }
        }

        kwarn!(
            "pmm: out of memory (order {}, ceiling {:?}, node {:?})",
            request.order,
            request.ceiling,
            request.node
        );
        Err(AllocError::OutOfMemory)
    }

    /// One pass over the candidate zones.
    fn try_zones(&self, request: &AllocRequest, dm: &impl DirectMap) -> Option<PhysFrame> {
        let preferred = request.node.unwrap_or(NodeId(0));
        let node_order = self.topology.nodes_by_distance(preferred);
        let nodes: &[NodeId] = if request.flags.contains(AllocFlags::NO_FALLBACK) {
            &node_order.as_slice()[..1.min(node_order.len())]
        } else {
            node_order.as_slice()
        };

        for &node in nodes {
            for &kind in request.ceiling.fallback_chain() {
                for zone in self
                    .zones
                    .iter()
                    .filter(|z| z.node() == node && z.kind() == kind)
                {
                    if let Some(frame) = zone.allocate(&self.table, dm, request.order, request.tag)
                    {
                        return Some(frame);
                    }
                }
            }
        }
        None
    }

    /// Post-allocation work done outside the zone lock: zeroing and the
    /// pressure signal.
    fn after_alloc(&self, request: &AllocRequest, frame: PhysFrame, dm: &impl DirectMap) {
        if request.flags.contains(AllocFlags::ZEROED) {
            for i in 0..(1u64 << request.order) {
                // SAFETY: The block was just allocated and is exclusively
                // ours.
                unsafe { crate::zero_frame(dm, frame + i) };
            }
        }

        let zone = &self.zones[self.table.of(frame).zone_index()];
        match zone.pressure() {
            Pressure::Nominal => {}
            level => notify_pressure(level),
        }
    }

    /// Returns a block to its zone, coalescing with free buddies.
    ///
    /// The block's reference count must already be zero.
    ///
    /// # Safety
    ///
    /// The block must have been returned by [`allocate`](Self::allocate)
    /// at this order and must no longer be mapped anywhere (translation
    /// caches for it must have been invalidated).
    pub unsafe fn free(&self, frame: PhysFrame, order: usize, dm: &impl DirectMap) {
        let zone = &self.zones[self.table.of(frame).zone_index()];
        // SAFETY: Forwarded caller contract.
        unsafe { zone.free(&self.table, dm, frame, order) };
    }

    /// Increments a frame's reference count (shared mapping created).
    pub fn retain(&self, frame: PhysFrame) {
        self.table.of(frame).retain();
    }

    /// Drops one reference to an order-0 frame, freeing it when the
    /// count reaches zero. Returns `true` if the frame was freed.
    ///
    /// # Safety
    ///
    /// The caller must hold one of the frame's references and must have
    /// invalidated any translation pointing at it.
    pub unsafe fn release(&self, frame: PhysFrame, dm: &impl DirectMap) -> bool {
        let desc = self.table.of(frame);
        if desc.release() == 0 {
            let order = desc.order();
            // SAFETY: Count reached zero, so the last mapping is gone.
            unsafe { self.free(frame, order, dm) };
            true
        } else {
            false
        }
    }

    /// Moves an allocated block to another node.
    ///
    /// Gated behind [`Capabilities::PAGE_MIGRATION`]; the algorithm is
    /// not implemented in this subsystem.
    pub fn migrate(&self, _frame: PhysFrame, _target: NodeId) -> Result<(), AllocError> {
        if !self.capabilities.contains(Capabilities::PAGE_MIGRATION) {
            return Err(AllocError::Unsupported);
        }
        Err(AllocError::Unsupported)
    }

    /// Compresses an allocated frame's contents.
    ///
    /// Gated behind [`Capabilities::COMPRESSION`]; the algorithm is not
    /// implemented in this subsystem.
    pub fn compress(&self, _frame: PhysFrame) -> Result<(), AllocError> {
        if !self.capabilities.contains(Capabilities::COMPRESSION) {
            return Err(AllocError::Unsupported);
        }
        Err(AllocError::Unsupported)
    }
}
