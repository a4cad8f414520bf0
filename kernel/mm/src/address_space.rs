//! Per-task address spaces.
//!
//! An [`AddressSpace`] owns one translation tree root and the ordered
//! collection of VMAs mapped into it. A single `RwLock` serialises VMA
//! changes and page-table mutations for the space; lookups take the read
//! side. The scheduler shares the space between cooperating threads with
//! an `Arc` and calls [`destroy`](AddressSpace::destroy) when the last
//! task exits.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use quark_core::addr::{PhysAddr, VirtAddr};
use quark_core::entry::{EntryFlags, SwapSlot};
use quark_core::kdebug;
use quark_core::paging::{Page, PhysFrame};
use quark_core::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::backing::{BackingStore, PageSource};
use crate::frame::AllocTag;
use crate::mapper::{ClearedEntry, MapError, MapFlags, PageWalker, UnmapError};
use crate::pmm::{AllocError, AllocFlags, AllocRequest, FrameAllocator};
use crate::vma::{BackingRef, Protection, Vma, VmaError, VmaFlags, VmaKind, VmaSet};
use crate::{DirectMap, PAGE_SIZE};

/// Errors from address-space operations, folding the per-layer errors
/// into the subsystem taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsError {
    /// No frame (or page-table frame) could be allocated.
    OutOfMemory,
    /// The range collides with an existing VMA.
    Overlap,
    /// The leaf slot is already mapped.
    AlreadyMapped,
    /// The page (or range) is not mapped.
    NotMapped,
    /// No VMA covers the range.
    NotFound,
    /// Empty, inverted or non-canonical range.
    InvalidAddress,
    /// The operation needs a capability the subsystem lacks.
    Unsupported,
    /// The backing store failed to transport a page.
    Io,
}

impl core::fmt::Display for AsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Overlap => write!(f, "mapping overlap"),
            Self::AlreadyMapped => write!(f, "already mapped"),
            Self::NotMapped => write!(f, "not mapped"),
            Self::NotFound => write!(f, "no such mapping"),
            Self::InvalidAddress => write!(f, "invalid address"),
            Self::Unsupported => write!(f, "capability not available"),
            Self::Io => write!(f, "backing store failure"),
        }
    }
}

impl From<AllocError> for AsError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::Unsupported => Self::Unsupported,
            _ => Self::OutOfMemory,
        }
    }
}

impl From<MapError> for AsError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::AlreadyMapped => Self::AlreadyMapped,
            MapError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

impl From<UnmapError> for AsError {
    fn from(_: UnmapError) -> Self {
        Self::NotMapped
    }
}

impl From<VmaError> for AsError {
    fn from(e: VmaError) -> Self {
        match e {
            VmaError::Overlap => Self::Overlap,
            VmaError::NotFound => Self::NotFound,
            VmaError::InvalidRange => Self::InvalidAddress,
        }
    }
}

/// Aggregate page counters of one address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsStats {
    /// Present pages.
    pub resident: u64,
    /// Present pages shared with another space (shared or copy-on-write).
    pub shared: u64,
    /// Pages recorded as swapped out.
    pub swapped: u64,
}

/// Sequential-fault tracking used by the prefetch heuristic.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FaultHint {
    /// Address of the previous demand fault.
    pub last: u64,
    /// Stride between the two most recent faults.
    pub stride: i64,
    /// Consecutive same-stride faults seen.
    pub run: u32,
}

/// How [`AddressSpace::clone_from`] treats private data pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMode {
    /// Share frames read-only and mark both sides copy-on-write
    /// (fork-style).
    CopyOnWrite,
    /// Duplicate every private frame eagerly.
    Duplicate,
}

pub(crate) struct AsInner {
    pub(crate) vmas: VmaSet,
    pub(crate) stats: AsStats,
    pub(crate) hint: FaultHint,
    dead: bool,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// One task's virtual address space.
pub struct AddressSpace {
    id: u64,
    root: PhysFrame,
    inner: RwLock<AsInner>,
}

impl AddressSpace {
    /// Creates a fresh address space with an empty VMA set and a zeroed
    /// top-level table.
    pub fn create(pmm: &FrameAllocator, dm: &impl DirectMap) -> Result<Self, AsError> {
        let root = pmm.allocate(
            AllocRequest::order(0)
                .with_flags(AllocFlags::ZEROED)
                .tagged(AllocTag::PAGE_TABLE),
            dm,
        )?;
        let space = Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            root,
            inner: RwLock::new(AsInner {
                vmas: VmaSet::new(),
                stats: AsStats::default(),
                hint: FaultHint::default(),
                dead: false,
            }),
        };
        kdebug!("as{}: created", space.id);
        Ok(space)
    }

    /// The space's identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The root table frame (what the architecture loads on a switch).
    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// Copy of the aggregate statistics.
    pub fn stats(&self) -> AsStats {
        self.inner.read().stats
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, AsInner> {
        self.inner.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, AsInner> {
        self.inner.write()
    }

    pub(crate) fn walker<'a, D: DirectMap>(&self, dm: &'a D) -> PageWalker<'a, D> {
        // SAFETY: `root` was allocated zeroed at creation and table
        // frames live until `destroy`.
        unsafe { PageWalker::new(self.root, dm) }
    }

    /// Allocation closure for page-table frames.
    pub(crate) fn table_alloc<'a, D: DirectMap>(
        pmm: &'a FrameAllocator,
        dm: &'a D,
    ) -> impl FnMut() -> Option<PhysFrame> + 'a {
        move || {
            pmm.allocate(
                AllocRequest::order(0)
                    .with_flags(AllocFlags::ZEROED)
                    .tagged(AllocTag::PAGE_TABLE),
                dm,
            )
            .ok()
        }
    }

    // -- VMA management -----------------------------------------------------

    /// Creates a VMA over `[start, start + size)` (page-rounded).
    ///
    /// Without [`VmaFlags::FIXED`] an overlap fails with
    /// [`AsError::Overlap`]; with it, the colliding range is carved out
    /// of existing VMAs (their pages unmapped) first.
    #[allow(clippy::too_many_arguments)]
    pub fn create_vma(
        &self,
        start: VirtAddr,
        size: u64,
        kind: VmaKind,
        prot: Protection,
        flags: VmaFlags,
        file: Option<BackingRef>,
        pmm: &FrameAllocator,
        dm: &impl DirectMap,
        backing: &dyn BackingStore,
    ) -> Result<VirtAddr, AsError> {
        if size == 0 {
            return Err(AsError::InvalidAddress);
        }
        let start = start.align_down(PAGE_SIZE as u64);
        let end = (start + size).align_up(PAGE_SIZE as u64);

        let mut inner = self.inner.write();
        if inner.vmas.intersects(start, end) {
            if !flags.contains(VmaFlags::FIXED) {
                return Err(AsError::Overlap);
            }
            self.teardown_range(&mut inner, start, end, pmm, dm, backing);
        }
        inner
            .vmas
            .insert(Vma::new(start, end, kind, prot, flags, file))?;
        Ok(start)
    }

    /// Unmaps `[start, start + size)`: every covered page is released
    /// (or its swap slot discarded) and the VMA records are removed or
    /// split.
    pub fn destroy_vma(
        &self,
        start: VirtAddr,
        size: u64,
        pmm: &FrameAllocator,
        dm: &impl DirectMap,
        backing: &dyn BackingStore,
    ) -> Result<(), AsError> {
        if size == 0 {
            return Err(AsError::InvalidAddress);
        }
        let start = start.align_down(PAGE_SIZE as u64);
        let end = (start + size).align_up(PAGE_SIZE as u64);

        let mut inner = self.inner.write();
        if !inner.vmas.intersects(start, end) {
            return Err(AsError::NotFound);
        }
        self.teardown_range(&mut inner, start, end, pmm, dm, backing);
        Ok(())
    }

    /// Changes the protection of `[start, start + size)`, splitting
    /// boundary VMAs and adjusting live leaf entries. Copy-on-write
    /// entries keep their pending-copy state even when the region
    /// becomes writable.
    pub fn protect(
        &self,
        start: VirtAddr,
        size: u64,
        prot: Protection,
        dm: &impl DirectMap,
    ) -> Result<(), AsError> {
        let start = start.align_down(PAGE_SIZE as u64);
        let end = (start + size).align_up(PAGE_SIZE as u64);

        let mut inner = self.inner.write();
        let affected = inner.vmas.protect(start, end, prot)?;
        let walker = self.walker(dm);

        for (range_start, range_end) in affected {
            for page in Page::range(
                Page::containing_address(range_start),
                Page::containing_address(range_end),
            ) {
                let Some(entry) = walker.entry(page) else {
                    continue;
                };
                if !entry.is_present() {
                    continue;
                }
                let mut flags = MapFlags::from_entry_flags(entry.flags());
                flags.remove(MapFlags::WRITABLE | MapFlags::EXECUTABLE);
                if prot.contains(Protection::WRITE) && !entry.is_copy_on_write() {
                    flags |= MapFlags::WRITABLE;
                }
                if prot.contains(Protection::EXEC) {
                    flags |= MapFlags::EXECUTABLE;
                }
                walker.update_flags(page, flags)?.flush();
            }
        }
        Ok(())
    }

    /// Point lookup of the VMA covering `addr`.
    pub fn find_vma(&self, addr: VirtAddr) -> Option<Vma> {
        self.inner.read().vmas.find(addr).copied()
    }

    /// Range lookup: every VMA intersecting `[start, end)`.
    pub fn find_intersection(&self, start: VirtAddr, end: VirtAddr) -> Vec<Vma> {
        self.inner
            .read()
            .vmas
            .intersection(start, end)
            .copied()
            .collect()
    }

    // -- page-level operations ---------------------------------------------

    /// Maps one page, allocating intermediate tables as needed. The
    /// fresh mapping was never cached, so no invalidation is issued.
    pub fn map_page(
        &self,
        page: Page,
        frame: PhysFrame,
        flags: MapFlags,
        pmm: &FrameAllocator,
        dm: &impl DirectMap,
    ) -> Result<(), AsError> {
        let mut inner = self.inner.write();
        let walker = self.walker(dm);
        let mut alloc = Self::table_alloc(pmm, dm);
        walker.map(page, frame, flags, &mut alloc)?.ignore();
        inner.stats.resident += 1;
        if flags.intersects(MapFlags::SHARED | MapFlags::COPY_ON_WRITE) {
            inner.stats.shared += 1;
        }
        Ok(())
    }

    /// Unmaps one page, invalidates its translation, and returns the
    /// frame. Reference-count bookkeeping stays with the caller, but the
    /// invalidation has already happened by the time the caller can free
    /// the frame.
    pub fn unmap_page(&self, page: Page, dm: &impl DirectMap) -> Result<PhysFrame, AsError> {
        let mut inner = self.inner.write();
        let walker = self.walker(dm);
        let entry = walker.entry(page).ok_or(AsError::NotMapped)?;
        let (frame, flush) = walker.unmap(page)?;
        flush.flush();
        inner.stats.resident = inner.stats.resident.saturating_sub(1);
        if entry
            .flags()
            .intersects(EntryFlags::SHARED | EntryFlags::COPY_ON_WRITE)
        {
            inner.stats.shared = inner.stats.shared.saturating_sub(1);
        }
        Ok(frame)
    }

    /// Evicts a resident page: invalidates the mapping, records `slot`
    /// in its place, writes the contents to the backing store (with no
    /// locks held), then drops the frame reference.
    ///
    /// On a write failure the mapping is restored and the slot is left
    /// unused.
    pub fn swap_out_page(
        &self,
        page: Page,
        slot: SwapSlot,
        pmm: &FrameAllocator,
        dm: &impl DirectMap,
        backing: &dyn BackingStore,
    ) -> Result<(), AsError> {
        let (frame, old_flags) = {
            let mut inner = self.inner.write();
            let walker = self.walker(dm);
            let entry = walker.entry(page).ok_or(AsError::NotMapped)?;
            let old_flags = entry.flags();
            if entry.frame().is_none() {
                return Err(AsError::NotMapped);
            }
            let (frame, flush) = walker.unmap(page)?;
            flush.flush();
            let mut alloc = Self::table_alloc(pmm, dm);
            walker.set_swapped(page, slot, &mut alloc)?;
            inner.stats.resident = inner.stats.resident.saturating_sub(1);
            inner.stats.swapped += 1;
            if old_flags.intersects(EntryFlags::SHARED | EntryFlags::COPY_ON_WRITE) {
                inner.stats.shared = inner.stats.shared.saturating_sub(1);
            }
            (frame, old_flags)
        };

        // The mapping is gone and its translation invalidated, so the
        // contents are stable; the blocking write runs without locks.
        let ptr = dm.phys_to_ptr(frame.start_address());
        // SAFETY: The frame is no longer mapped and we hold its
        // reference.
        let src = unsafe { &*(ptr as *const [u8; PAGE_SIZE]) };
        if backing.write_page(PageSource::Swap(slot), src).is_err() {
            // Roll back: drop the swap record and remap the frame.
            let mut inner = self.inner.write();
            let walker = self.walker(dm);
            let _ = walker.take_swap_slot(page);
            let mut alloc = Self::table_alloc(pmm, dm);
            walker
                .map(page, frame, MapFlags::from_entry_flags(old_flags), &mut alloc)?
                .ignore();
            inner.stats.resident += 1;
            inner.stats.swapped = inner.stats.swapped.saturating_sub(1);
            if old_flags.intersects(EntryFlags::SHARED | EntryFlags::COPY_ON_WRITE) {
                inner.stats.shared += 1;
            }
            return Err(AsError::Io);
        }

        // SAFETY: The translation was invalidated before the write.
        unsafe { pmm.release(frame, dm) };
        Ok(())
    }

    /// Translates a virtual address through this space's tables.
    pub fn translate(&self, virt: VirtAddr, dm: &impl DirectMap) -> Option<PhysAddr> {
        let _guard = self.inner.read();
        self.walker(dm).translate(virt)
    }

    /// Counts pages whose dirty bit the hardware has set. A full walk;
    /// used by reclaim heuristics, not hot paths.
    pub fn count_dirty(&self, dm: &impl DirectMap) -> u64 {
        let inner = self.inner.read();
        let walker = self.walker(dm);
        let mut dirty = 0;
        for vma in inner.vmas.iter() {
            for page in Page::range(
                Page::containing_address(vma.start),
                Page::containing_address(vma.end),
            ) {
                if let Some(entry) = walker.entry(page) {
                    if entry.is_present() && entry.flags().contains(EntryFlags::DIRTY) {
                        dirty += 1;
                    }
                }
            }
        }
        dirty
    }

    // -- lifecycle ----------------------------------------------------------

    /// Duplicates `parent` into a new address space.
    ///
    /// Shared VMAs always share frames. Private data pages are either
    /// downgraded to copy-on-write on both sides
    /// ([`CloneMode::CopyOnWrite`]) or copied eagerly
    /// ([`CloneMode::Duplicate`]). Swapped-out private pages are
    /// materialised from the backing store into the child; the parent
    /// keeps its slot. On failure the partially built child is torn
    /// down before the error is returned.
    pub fn clone_from(
        parent: &Self,
        mode: CloneMode,
        pmm: &FrameAllocator,
        dm: &impl DirectMap,
        backing: &dyn BackingStore,
    ) -> Result<Self, AsError> {
        let child = Self::create(pmm, dm)?;
        match Self::clone_into(parent, &child, mode, pmm, dm, backing) {
            Ok(()) => Ok(child),
            Err(e) => {
                child.destroy(pmm, dm, backing);
                Err(e)
            }
        }
    }

    fn clone_into(
        parent: &Self,
        child: &Self,
        mode: CloneMode,
        pmm: &FrameAllocator,
        dm: &impl DirectMap,
        backing: &dyn BackingStore,
    ) -> Result<(), AsError> {
        let mut parent_inner = parent.inner.write();
        let mut child_inner = child.inner.write();
        let parent_walker = parent.walker(dm);
        let child_walker = child.walker(dm);
        let mut alloc = Self::table_alloc(pmm, dm);

        let vmas: Vec<Vma> = parent_inner.vmas.iter().copied().collect();
        for vma in &vmas {
            child_inner.vmas.insert(*vma)?;
            let share_frames = vma.flags.contains(VmaFlags::SHARED)
                || matches!(vma.kind, VmaKind::Shared | VmaKind::Device);

            for page in Page::range(
                Page::containing_address(vma.start),
                Page::containing_address(vma.end),
            ) {
                let Some(entry) = parent_walker.entry(page) else {
                    continue;
                };

                if let Some(frame) = entry.frame() {
                    let writable_private = !share_frames
                        && (entry.flags().contains(EntryFlags::WRITABLE)
                            || entry.is_copy_on_write());

                    if !writable_private {
                        // Shared or read-only: both spaces reference the
                        // same frame with unchanged flags.
                        pmm.retain(frame);
                        child_walker
                            .map(
                                page,
                                frame,
                                MapFlags::from_entry_flags(entry.flags()),
                                &mut alloc,
                            )?
                            .ignore();
                        child_inner.stats.resident += 1;
                        child_inner.stats.shared += 1;
                    } else if mode == CloneMode::CopyOnWrite {
                        // Downgrade the parent, mirror into the child.
                        let cow = if entry.is_copy_on_write() {
                            entry
                        } else {
                            let cow = entry.make_copy_on_write();
                            parent_walker.update_entry(page, cow)?.flush();
                            parent_inner.stats.shared += 1;
                            cow
                        };
                        pmm.retain(frame);
                        child_walker
                            .map(
                                page,
                                frame,
                                MapFlags::from_entry_flags(cow.flags()),
                                &mut alloc,
                            )?
                            .ignore();
                        child_inner.stats.resident += 1;
                        child_inner.stats.shared += 1;
                    } else {
                        // Eager copy.
                        let copy =
                            pmm.allocate(AllocRequest::order(0).tagged(AllocTag::USER), dm)?;
                        // SAFETY: `copy` is exclusively ours; `frame`
                        // stays mapped under the parent's write lock.
                        unsafe { crate::copy_frame(dm, frame, copy) };
                        child_walker
                            .map(
                                page,
                                copy,
                                MapFlags::from_entry_flags(vma.entry_flags()),
                                &mut alloc,
                            )?
                            .ignore();
                        child_inner.stats.resident += 1;
                    }
                } else if let Some(slot) = entry.swap_slot() {
                    // Materialise the child's copy from backing store.
                    let copy = pmm.allocate(AllocRequest::order(0).tagged(AllocTag::USER), dm)?;
                    let ptr = dm.phys_to_ptr(copy.start_address());
                    // SAFETY: `copy` is exclusively ours.
                    let dst = unsafe { &mut *(ptr as *mut [u8; PAGE_SIZE]) };
                    if backing.read_page(PageSource::Swap(slot), dst).is_err() {
                        // SAFETY: Nothing maps `copy` yet.
                        unsafe { pmm.release(copy, dm) };
                        return Err(AsError::Io);
                    }
                    child_walker
                        .map(
                            page,
                            copy,
                            MapFlags::from_entry_flags(vma.entry_flags()),
                            &mut alloc,
                        )?
                        .ignore();
                    child_inner.stats.resident += 1;
                }
            }
        }

        kdebug!(
            "as{}: cloned from as{} ({:?}, {} vmas)",
            child.id,
            parent.id,
            mode,
            vmas.len()
        );
        Ok(())
    }

    /// Tears the whole space down: unmaps every VMA, releases every
    /// frame and swap slot, then frees the translation tree including
    /// the root. The space must no longer be live on any CPU.
    pub fn destroy(self, pmm: &FrameAllocator, dm: &impl DirectMap, backing: &dyn BackingStore) {
        {
            let mut inner = self.inner.write();
            debug_assert!(!inner.dead);

            let span = {
                let lo = inner.vmas.iter().next().map(|v| v.start);
                let hi = inner.vmas.iter().last().map(|v| v.end);
                lo.zip(hi)
            };
            if let Some((lo, hi)) = span {
                self.teardown_range(&mut inner, lo, hi, pmm, dm, backing);
            }
            inner.dead = true;

            let walker = self.walker(dm);
            walker.free_tree(&mut |table_frame| {
                // SAFETY: Table frames are exclusively owned by this tree
                // and the space is no longer loaded anywhere.
                unsafe {
                    pmm.release(table_frame, dm);
                }
            });
        }
        kdebug!("as{}: destroyed", self.id);
    }

    /// Unmaps and releases everything in `[start, end)` and removes the
    /// covering VMA records. Translation-cache invalidation for each
    /// page precedes the release of its frame.
    fn teardown_range(
        &self,
        inner: &mut AsInner,
        start: VirtAddr,
        end: VirtAddr,
        pmm: &FrameAllocator,
        dm: &impl DirectMap,
        backing: &dyn BackingStore,
    ) {
        let walker = self.walker(dm);
        for vma in inner.vmas.carve(start, end) {
            for page in Page::range(
                Page::containing_address(vma.start),
                Page::containing_address(vma.end),
            ) {
                let was_shared = walker.entry(page).is_some_and(|e| {
                    e.flags()
                        .intersects(EntryFlags::SHARED | EntryFlags::COPY_ON_WRITE)
                });
                match walker.clear(page) {
                    Ok(ClearedEntry::Mapped(frame, flush)) => {
                        // Invalidate before the frame can be reused.
                        flush.flush();
                        // SAFETY: The translation was just invalidated.
                        unsafe { pmm.release(frame, dm) };
                        inner.stats.resident = inner.stats.resident.saturating_sub(1);
                        if was_shared {
                            inner.stats.shared = inner.stats.shared.saturating_sub(1);
                        }
                    }
                    Ok(ClearedEntry::Swapped(slot)) => {
                        backing.discard(slot);
                        inner.stats.swapped = inner.stats.swapped.saturating_sub(1);
                    }
                    Err(UnmapError::NotMapped) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::NoBackingStore;
    use crate::testutil::TestMemory;
    use crate::topology::NumaTopology;
    use crate::Capabilities;

    struct Fixture {
        mem: TestMemory,
        pmm: FrameAllocator,
        backing: NoBackingStore,
    }

    fn fixture(frames: usize) -> Fixture {
        let mem = TestMemory::new(frames);
        let topo = NumaTopology::single_node(mem.span_end());
        let pmm = unsafe {
            FrameAllocator::new(&mem.regions(), topo, Capabilities::empty(), mem.dm())
        }
        .unwrap();
        Fixture {
            mem,
            pmm,
            backing: NoBackingStore,
        }
    }

    fn anon_vma(fx: &Fixture, space: &AddressSpace, start: u64, size: u64) {
        space
            .create_vma(
                VirtAddr::new(start),
                size,
                VmaKind::Anonymous,
                Protection::READ | Protection::WRITE,
                VmaFlags::PRIVATE,
                None,
                &fx.pmm,
                fx.mem.dm(),
                &fx.backing,
            )
            .unwrap();
    }

    /// Maps one anonymous page the way the fault path would.
    fn populate(fx: &Fixture, space: &AddressSpace, addr: u64) -> PhysFrame {
        let vma = space.find_vma(VirtAddr::new(addr)).unwrap();
        let frame = fx
            .pmm
            .allocate(
                AllocRequest::order(0)
                    .with_flags(AllocFlags::ZEROED)
                    .tagged(AllocTag::USER),
                fx.mem.dm(),
            )
            .unwrap();
        space
            .map_page(
                Page::containing_address(VirtAddr::new(addr)),
                frame,
                MapFlags::from_entry_flags(vma.entry_flags()),
                &fx.pmm,
                fx.mem.dm(),
            )
            .unwrap();
        frame
    }

    #[test]
    fn create_and_destroy_release_everything() {
        let fx = fixture(256);
        let free_before = fx.pmm.free_pages();

        let space = AddressSpace::create(&fx.pmm, fx.mem.dm()).unwrap();
        anon_vma(&fx, &space, 0x1000, 3 * PAGE_SIZE as u64);
        populate(&fx, &space, 0x1000);
        populate(&fx, &space, 0x2000);

        assert_eq!(space.stats().resident, 2);
        space.destroy(&fx.pmm, fx.mem.dm(), &fx.backing);
        assert_eq!(fx.pmm.free_pages(), free_before);
    }

    #[test]
    fn create_vma_rejects_overlap() {
        let fx = fixture(256);
        let space = AddressSpace::create(&fx.pmm, fx.mem.dm()).unwrap();
        anon_vma(&fx, &space, 0x1000, PAGE_SIZE as u64);

        let result = space.create_vma(
            VirtAddr::new(0x1000),
            PAGE_SIZE as u64,
            VmaKind::Anonymous,
            Protection::READ,
            VmaFlags::PRIVATE,
            None,
            &fx.pmm,
            fx.mem.dm(),
            &fx.backing,
        );
        assert_eq!(result.unwrap_err(), AsError::Overlap);
        space.destroy(&fx.pmm, fx.mem.dm(), &fx.backing);
    }

    #[test]
    fn fixed_mapping_carves_collisions() {
        let fx = fixture(256);
        let space = AddressSpace::create(&fx.pmm, fx.mem.dm()).unwrap();
        anon_vma(&fx, &space, 0x1000, 4 * PAGE_SIZE as u64);
        let frame = populate(&fx, &space, 0x2000);

        space
            .create_vma(
                VirtAddr::new(0x2000),
                PAGE_SIZE as u64,
                VmaKind::Anonymous,
                Protection::READ,
                VmaFlags::PRIVATE | VmaFlags::FIXED,
                None,
                &fx.pmm,
                fx.mem.dm(),
                &fx.backing,
            )
            .unwrap();

        // The carved page was unmapped and its frame freed.
        assert!(space
            .translate(VirtAddr::new(0x2000), fx.mem.dm())
            .is_none());
        assert!(fx.pmm.table().of(frame).is_free());
        // Old region survives on both sides of the carve.
        assert!(space.find_vma(VirtAddr::new(0x1000)).is_some());
        assert!(space.find_vma(VirtAddr::new(0x3000)).is_some());
        space.destroy(&fx.pmm, fx.mem.dm(), &fx.backing);
    }

    #[test]
    fn destroy_vma_unmaps_and_splits() {
        let fx = fixture(256);
        let space = AddressSpace::create(&fx.pmm, fx.mem.dm()).unwrap();
        anon_vma(&fx, &space, 0x1000, 4 * PAGE_SIZE as u64);
        let frame = populate(&fx, &space, 0x2000);

        space
            .destroy_vma(
                VirtAddr::new(0x2000),
                PAGE_SIZE as u64,
                &fx.pmm,
                fx.mem.dm(),
                &fx.backing,
            )
            .unwrap();

        assert!(space.find_vma(VirtAddr::new(0x2000)).is_none());
        assert!(fx.pmm.table().of(frame).is_free());
        assert_eq!(space.stats().resident, 0);
        space.destroy(&fx.pmm, fx.mem.dm(), &fx.backing);
    }

    #[test]
    fn map_unmap_round_trip_reports_unmapped() {
        let fx = fixture(256);
        let space = AddressSpace::create(&fx.pmm, fx.mem.dm()).unwrap();
        anon_vma(&fx, &space, 0x4000, PAGE_SIZE as u64);
        let frame = populate(&fx, &space, 0x4000);

        let page = Page::containing_address(VirtAddr::new(0x4000));
        let unmapped = space.unmap_page(page, fx.mem.dm()).unwrap();
        assert_eq!(unmapped, frame);
        assert!(space.translate(VirtAddr::new(0x4000), fx.mem.dm()).is_none());

        // SAFETY: Translation invalidated by unmap_page.
        unsafe { fx.pmm.release(frame, fx.mem.dm()) };
        space.destroy(&fx.pmm, fx.mem.dm(), &fx.backing);
    }

    #[test]
    fn protect_downgrades_live_mappings() {
        let fx = fixture(256);
        let space = AddressSpace::create(&fx.pmm, fx.mem.dm()).unwrap();
        anon_vma(&fx, &space, 0x1000, 2 * PAGE_SIZE as u64);
        populate(&fx, &space, 0x1000);

        space
            .protect(
                VirtAddr::new(0x1000),
                2 * PAGE_SIZE as u64,
                Protection::READ,
                fx.mem.dm(),
            )
            .unwrap();

        let inner = space.read();
        let walker = space.walker(fx.mem.dm());
        let entry = walker
            .entry(Page::containing_address(VirtAddr::new(0x1000)))
            .unwrap();
        assert!(!entry.flags().contains(EntryFlags::WRITABLE));
        drop(inner);
        space.destroy(&fx.pmm, fx.mem.dm(), &fx.backing);
    }

    #[test]
    fn cow_clone_shares_frames_read_only() {
        let fx = fixture(256);
        let parent = AddressSpace::create(&fx.pmm, fx.mem.dm()).unwrap();
        anon_vma(&fx, &parent, 0x1000, 2 * PAGE_SIZE as u64);
        let frame = populate(&fx, &parent, 0x1000);

        let child = AddressSpace::clone_from(
            &parent,
            CloneMode::CopyOnWrite,
            &fx.pmm,
            fx.mem.dm(),
            &fx.backing,
        )
        .unwrap();

        // Same physical frame, doubly referenced, read-only both sides.
        assert_eq!(
            parent.translate(VirtAddr::new(0x1000), fx.mem.dm()),
            child.translate(VirtAddr::new(0x1000), fx.mem.dm())
        );
        assert_eq!(fx.pmm.table().of(frame).refcount(), 2);

        let page = Page::containing_address(VirtAddr::new(0x1000));
        for space in [&parent, &child] {
            let guard = space.read();
            let entry = space.walker(fx.mem.dm()).entry(page).unwrap();
            assert!(entry.is_copy_on_write());
            assert!(!entry.flags().contains(EntryFlags::WRITABLE));
            drop(guard);
        }

        child.destroy(&fx.pmm, fx.mem.dm(), &fx.backing);
        assert_eq!(fx.pmm.table().of(frame).refcount(), 1);
        parent.destroy(&fx.pmm, fx.mem.dm(), &fx.backing);
    }

    #[test]
    fn duplicate_clone_copies_contents() {
        let fx = fixture(256);
        let parent = AddressSpace::create(&fx.pmm, fx.mem.dm()).unwrap();
        anon_vma(&fx, &parent, 0x1000, PAGE_SIZE as u64);
        let frame = populate(&fx, &parent, 0x1000);

        // SAFETY: Frame is mapped writable only in the parent.
        unsafe {
            *fx.mem.dm().phys_to_ptr(frame.start_address()) = 0x5A;
        }

        let child = AddressSpace::clone_from(
            &parent,
            CloneMode::Duplicate,
            &fx.pmm,
            fx.mem.dm(),
            &fx.backing,
        )
        .unwrap();

        let child_phys = child.translate(VirtAddr::new(0x1000), fx.mem.dm()).unwrap();
        assert_ne!(child_phys, frame.start_address());
        // SAFETY: Reading the child's private copy.
        let copied = unsafe { *fx.mem.dm().phys_to_ptr(child_phys) };
        assert_eq!(copied, 0x5A);

        child.destroy(&fx.pmm, fx.mem.dm(), &fx.backing);
        parent.destroy(&fx.pmm, fx.mem.dm(), &fx.backing);
    }

    #[test]
    fn find_intersection_reports_partial_overlaps() {
        let fx = fixture(256);
        let space = AddressSpace::create(&fx.pmm, fx.mem.dm()).unwrap();
        anon_vma(&fx, &space, 0x1000, 2 * PAGE_SIZE as u64);
        anon_vma(&fx, &space, 0x5000, 2 * PAGE_SIZE as u64);

        let hits = space.find_intersection(VirtAddr::new(0x2000), VirtAddr::new(0x6000));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].start, VirtAddr::new(0x1000));
        assert_eq!(hits[1].start, VirtAddr::new(0x5000));

        assert!(space
            .find_intersection(VirtAddr::new(0x8000), VirtAddr::new(0x9000))
            .is_empty());
        space.destroy(&fx.pmm, fx.mem.dm(), &fx.backing);
    }

    #[test]
    fn count_dirty_sees_hardware_dirty_bits() {
        let fx = fixture(256);
        let space = AddressSpace::create(&fx.pmm, fx.mem.dm()).unwrap();
        anon_vma(&fx, &space, 0x1000, 2 * PAGE_SIZE as u64);
        populate(&fx, &space, 0x1000);
        populate(&fx, &space, 0x2000);
        assert_eq!(space.count_dirty(fx.mem.dm()), 0);

        // Set one dirty bit the way the hardware would.
        {
            let _guard = space.write();
            let walker = space.walker(fx.mem.dm());
            let page = Page::containing_address(VirtAddr::new(0x1000));
            let entry = walker.entry(page).unwrap();
            walker
                .update_entry(page, entry.with_flags(entry.flags() | EntryFlags::DIRTY))
                .unwrap()
                .ignore();
        }
        assert_eq!(space.count_dirty(fx.mem.dm()), 1);
        space.destroy(&fx.pmm, fx.mem.dm(), &fx.backing);
    }

    #[test]
    fn swap_out_records_slot_and_releases_frame() {
        let fx = fixture(256);
        let space = AddressSpace::create(&fx.pmm, fx.mem.dm()).unwrap();
        anon_vma(&fx, &space, 0x1000, PAGE_SIZE as u64);
        let frame = populate(&fx, &space, 0x1000);

        let page = Page::containing_address(VirtAddr::new(0x1000));
        space
            .swap_out_page(page, SwapSlot(9), &fx.pmm, fx.mem.dm(), &fx.backing)
            .unwrap();

        assert!(fx.pmm.table().of(frame).is_free());
        assert_eq!(space.stats().swapped, 1);
        assert_eq!(space.stats().resident, 0);

        let guard = space.read();
        let entry = space.walker(fx.mem.dm()).entry(page).unwrap();
        assert_eq!(entry.swap_slot(), Some(SwapSlot(9)));
        drop(guard);
        space.destroy(&fx.pmm, fx.mem.dm(), &fx.backing);
    }
}
