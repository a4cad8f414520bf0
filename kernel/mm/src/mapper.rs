//! Hardware-abstraction page-table walker.
//!
//! [`PageWalker`] walks one address space's translation tree: a radix
//! tree of 512-entry tables, [`PAGING_LEVELS`](crate::PAGING_LEVELS)
//! deep, stored in physical frames reached through the [`DirectMap`].
//! Walks iterate level indices top-down, so no code here names a
//! particular paging level and the depth stays a constant.
//!
//! # TLB flush decoupling
//!
//! Every mutation returns a [`MapFlush`] that the caller must `flush()`
//! or `ignore()`. The architecture registers its invalidation primitive
//! at boot via [`register_tlb_flush`]; before registration (and in host
//! tests) flushes are no-ops. The ordering rule throughout this crate is
//! that a mapping's flush happens before its frame can be handed back to
//! the allocator.

use core::sync::atomic::{AtomicPtr, Ordering};

use quark_core::addr::{PhysAddr, VirtAddr};
use quark_core::entry::{EntryFlags, PageEntry, SwapSlot};
use quark_core::paging::{Page, PhysFrame};

use crate::{DirectMap, PAGING_LEVELS};

/// Entries per translation table.
const TABLE_ENTRIES: usize = 512;

bitflags::bitflags! {
    /// Architecture-independent mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        /// Page is writable.
        const WRITABLE      = 1 << 0;
        /// Page is executable (if unset, no-execute is implied).
        const EXECUTABLE    = 1 << 1;
        /// Page is accessible from user mode.
        const USER          = 1 << 2;
        /// Global page (not flushed on address-space switch).
        const GLOBAL        = 1 << 3;
        /// Page is shared until written; writes fault for a private copy.
        const COPY_ON_WRITE = 1 << 4;
        /// Frame is deliberately shared between address spaces.
        const SHARED        = 1 << 5;
    }
}

impl MapFlags {
    /// Derives mapping flags from a VMA's entry-flag template.
    pub fn from_entry_flags(flags: EntryFlags) -> Self {
        let mut out = Self::empty();
        if flags.contains(EntryFlags::WRITABLE) {
            out |= Self::WRITABLE;
        }
        if !flags.contains(EntryFlags::NO_EXECUTE) {
            out |= Self::EXECUTABLE;
        }
        if flags.contains(EntryFlags::USER) {
            out |= Self::USER;
        }
        if flags.contains(EntryFlags::GLOBAL) {
            out |= Self::GLOBAL;
        }
        if flags.contains(EntryFlags::COPY_ON_WRITE) {
            out |= Self::COPY_ON_WRITE;
        }
        if flags.contains(EntryFlags::SHARED) {
            out |= Self::SHARED;
        }
        out
    }

    /// Converts to the entry representation. `COPY_ON_WRITE` wins over
    /// `WRITABLE`, preserving the entry invariant.
    pub fn to_entry_flags(self) -> EntryFlags {
        let mut out = EntryFlags::empty();
        if self.contains(Self::WRITABLE) && !self.contains(Self::COPY_ON_WRITE) {
            out |= EntryFlags::WRITABLE;
        }
        if !self.contains(Self::EXECUTABLE) {
            out |= EntryFlags::NO_EXECUTE;
        }
        if self.contains(Self::USER) {
            out |= EntryFlags::USER;
        }
        if self.contains(Self::GLOBAL) {
            out |= EntryFlags::GLOBAL;
        }
        if self.contains(Self::COPY_ON_WRITE) {
            out |= EntryFlags::COPY_ON_WRITE;
        }
        if self.contains(Self::SHARED) {
            out |= EntryFlags::SHARED;
        }
        out
    }
}

/// Errors from map operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The leaf slot is already occupied; unmap first.
    AlreadyMapped,
    /// An intermediate table could not be allocated.
    OutOfMemory,
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyMapped => write!(f, "slot already mapped"),
            Self::OutOfMemory => write!(f, "out of memory for page tables"),
        }
    }
}

/// Errors from unmap / flag-update operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// The page is not mapped.
    NotMapped,
}

impl core::fmt::Display for UnmapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotMapped => write!(f, "page not mapped"),
        }
    }
}

// ---------------------------------------------------------------------------
// Registered TLB flush callback
// ---------------------------------------------------------------------------

static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush as fn(VirtAddr) as *mut ());

fn nop_flush(_virt: VirtAddr) {}

/// Registers the architecture-specific translation-cache invalidation
/// primitive. Must run during early boot, before any mapping that could
/// already be cached is modified.
pub fn register_tlb_flush(f: fn(VirtAddr)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn arch_flush_page(virt: VirtAddr) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn(VirtAddr)` pointers (or the initial
    // `nop_flush`) are ever stored.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

/// A pending translation-cache invalidation for one page.
///
/// Flushes on drop unless [`flush`](Self::flush) or
/// [`ignore`](Self::ignore) is called first.
#[derive(Debug)]
#[must_use = "TLB flush is pending; call .flush() or .ignore()"]
pub struct MapFlush {
    virt: VirtAddr,
    needs_flush: bool,
}

impl MapFlush {
    /// Creates a pending flush for the given address.
    pub fn new(virt: VirtAddr) -> Self {
        Self {
            virt,
            needs_flush: true,
        }
    }

    /// Flushes the translation cache entry immediately.
    pub fn flush(mut self) {
        self.needs_flush = false;
        arch_flush_page(self.virt);
    }

    /// Opts out of flushing (fresh mappings never cached, or batch
    /// invalidation handled by the caller).
    pub fn ignore(mut self) {
        self.needs_flush = false;
    }
}

impl Drop for MapFlush {
    fn drop(&mut self) {
        if self.needs_flush {
            arch_flush_page(self.virt);
        }
    }
}

// ---------------------------------------------------------------------------
// PageWalker
// ---------------------------------------------------------------------------

/// What [`PageWalker::clear`] found in the leaf slot.
#[derive(Debug)]
pub enum ClearedEntry {
    /// A resident mapping; the frame and its pending flush.
    Mapped(PhysFrame, MapFlush),
    /// A swapped-out page; the slot for the caller to discard.
    Swapped(SwapSlot),
}

/// Walks and mutates the translation tree rooted at one frame.
///
/// The walker holds no locks; callers serialise access per address space
/// (the address space's `RwLock` in this crate).
pub struct PageWalker<'a, D: DirectMap> {
    root: PhysFrame,
    dm: &'a D,
}

impl<'a, D: DirectMap> PageWalker<'a, D> {
    /// Creates a walker over the tree rooted at `root`.
    ///
    /// # Safety
    ///
    /// `root` must be a frame holding a valid (possibly empty) top-level
    /// table, and table frames referenced from it must stay alive while
    /// the walker is used.
    pub unsafe fn new(root: PhysFrame, dm: &'a D) -> Self {
        Self { root, dm }
    }

    /// The root table frame.
    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// Returns the raw slot array of the table in `frame`.
    fn table(&self, frame: PhysFrame) -> &mut [u64; TABLE_ENTRIES] {
        // SAFETY: Table frames are allocator-owned and reached through
        // the direct map; the per-address-space lock serialises access.
        unsafe { &mut *(self.dm.phys_to_ptr(frame.start_address()) as *mut [u64; TABLE_ENTRIES]) }
    }

    /// Walks down to the leaf table, optionally allocating missing
    /// intermediate tables through `alloc`.
    fn leaf_table(
        &self,
        virt: VirtAddr,
        alloc: Option<&mut dyn FnMut() -> Option<PhysFrame>>,
    ) -> Option<PhysFrame> {
        let mut alloc = alloc;
        let mut table_frame = self.root;

        for level in (1..PAGING_LEVELS).rev() {
            let table = self.table(table_frame);
            let index = virt.level_index(level);
            let entry = PageEntry::from_bits(table[index]);

            table_frame = if entry.is_present() {
                entry.frame().expect("present entry has frame")
            } else {
                let alloc = alloc.as_deref_mut()?;
                let frame = alloc()?;
                // Intermediate entries are maximally permissive; the
                // leaf entry enforces the real protection.
                let flags = EntryFlags::WRITABLE | EntryFlags::USER;
                table[index] = PageEntry::mapping(frame, flags).bits();
                frame
            };
        }
        Some(table_frame)
    }

    /// Maps `page` to `frame` with the given flags.
    ///
    /// Allocates missing intermediate tables via `alloc` (which must
    /// return zeroed frames). Fails with [`MapError::AlreadyMapped`] if
    /// the leaf slot is occupied by a mapping or a swap record, and
    /// [`MapError::OutOfMemory`] if a table allocation fails.
    pub fn map(
        &self,
        page: Page,
        frame: PhysFrame,
        flags: MapFlags,
        alloc: &mut dyn FnMut() -> Option<PhysFrame>,
    ) -> Result<MapFlush, MapError> {
        let virt = page.start_address();
        let leaf = self
            .leaf_table(virt, Some(alloc))
            .ok_or(MapError::OutOfMemory)?;

        let table = self.table(leaf);
        let index = virt.level_index(0);
        let existing = PageEntry::from_bits(table[index]);
        if !existing.is_unused() {
            return Err(MapError::AlreadyMapped);
        }

        table[index] = PageEntry::mapping(frame, flags.to_entry_flags()).bits();
        Ok(MapFlush::new(virt))
    }

    /// Unmaps `page`, returning the previously mapped frame and the
    /// pending flush. Reference-count bookkeeping stays with the caller.
    pub fn unmap(&self, page: Page) -> Result<(PhysFrame, MapFlush), UnmapError> {
        let virt = page.start_address();
        let leaf = self.leaf_table(virt, None).ok_or(UnmapError::NotMapped)?;

        let table = self.table(leaf);
        let index = virt.level_index(0);
        let entry = PageEntry::from_bits(table[index]);
        let frame = entry.frame().ok_or(UnmapError::NotMapped)?;

        table[index] = PageEntry::empty().bits();
        Ok((frame, MapFlush::new(virt)))
    }

    /// Clears the leaf slot whatever it holds; used by region teardown.
    pub fn clear(&self, page: Page) -> Result<ClearedEntry, UnmapError> {
        let virt = page.start_address();
        let leaf = self.leaf_table(virt, None).ok_or(UnmapError::NotMapped)?;

        let table = self.table(leaf);
        let index = virt.level_index(0);
        let entry = PageEntry::from_bits(table[index]);

        if let Some(frame) = entry.frame() {
            table[index] = PageEntry::empty().bits();
            Ok(ClearedEntry::Mapped(frame, MapFlush::new(virt)))
        } else if let Some(slot) = entry.swap_slot() {
            table[index] = PageEntry::empty().bits();
            Ok(ClearedEntry::Swapped(slot))
        } else {
            Err(UnmapError::NotMapped)
        }
    }

    /// Reads the leaf entry for `page`, if any level of the walk exists.
    pub fn entry(&self, page: Page) -> Option<PageEntry> {
        let virt = page.start_address();
        let leaf = self.leaf_table(virt, None)?;
        let entry = PageEntry::from_bits(self.table(leaf)[virt.level_index(0)]);
        if entry.is_unused() { None } else { Some(entry) }
    }

    /// Replaces the leaf entry for `page`, which must exist. Used for
    /// copy-on-write transitions where the frame changes with the flags.
    pub fn update_entry(&self, page: Page, entry: PageEntry) -> Result<MapFlush, UnmapError> {
        let virt = page.start_address();
        let leaf = self.leaf_table(virt, None).ok_or(UnmapError::NotMapped)?;

        let table = self.table(leaf);
        let index = virt.level_index(0);
        if PageEntry::from_bits(table[index]).is_unused() {
            return Err(UnmapError::NotMapped);
        }
        table[index] = entry.bits();
        Ok(MapFlush::new(virt))
    }

    /// Updates only the flags of a present mapping, keeping its frame.
    pub fn update_flags(&self, page: Page, flags: MapFlags) -> Result<MapFlush, UnmapError> {
        let virt = page.start_address();
        let leaf = self.leaf_table(virt, None).ok_or(UnmapError::NotMapped)?;

        let table = self.table(leaf);
        let index = virt.level_index(0);
        let entry = PageEntry::from_bits(table[index]);
        if !entry.is_present() {
            return Err(UnmapError::NotMapped);
        }
        table[index] = entry
            .with_flags(flags.to_entry_flags() | EntryFlags::PRESENT)
            .bits();
        Ok(MapFlush::new(virt))
    }

    /// Translates a virtual address to its physical address.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let leaf = self.leaf_table(virt, None)?;
        let entry = PageEntry::from_bits(self.table(leaf)[virt.level_index(0)]);
        entry
            .frame()
            .map(|f| f.start_address() + virt.page_offset())
    }

    /// Takes the swap slot out of a swapped leaf entry, clearing it so a
    /// fresh mapping can be installed.
    pub fn take_swap_slot(&self, page: Page) -> Option<SwapSlot> {
        let virt = page.start_address();
        let leaf = self.leaf_table(virt, None)?;
        let table = self.table(leaf);
        let index = virt.level_index(0);
        let slot = PageEntry::from_bits(table[index]).swap_slot()?;
        table[index] = PageEntry::empty().bits();
        Some(slot)
    }

    /// Records a swap slot in an empty leaf slot (page evicted).
    pub fn set_swapped(
        &self,
        page: Page,
        slot: SwapSlot,
        alloc: &mut dyn FnMut() -> Option<PhysFrame>,
    ) -> Result<(), MapError> {
        let virt = page.start_address();
        let leaf = self
            .leaf_table(virt, Some(alloc))
            .ok_or(MapError::OutOfMemory)?;
        let table = self.table(leaf);
        let index = virt.level_index(0);
        if !PageEntry::from_bits(table[index]).is_unused() {
            return Err(MapError::AlreadyMapped);
        }
        table[index] = PageEntry::swapped_out(slot).bits();
        Ok(())
    }

    /// Frees every table frame of the tree, including the root, through
    /// `free`. Leaf entries must already have been cleared (their frames
    /// are owned by VMAs, not by the tree).
    pub fn free_tree(&self, free: &mut dyn FnMut(PhysFrame)) {
        self.free_level(self.root, PAGING_LEVELS - 1, free);
    }

    fn free_level(&self, table_frame: PhysFrame, level: usize, free: &mut dyn FnMut(PhysFrame)) {
        if level > 0 {
            let table = self.table(table_frame);
            for index in 0..TABLE_ENTRIES {
                let entry = PageEntry::from_bits(table[index]);
                if let Some(child) = entry.frame() {
                    self.free_level(child, level - 1, free);
                }
                table[index] = PageEntry::empty().bits();
            }
        }
        free(table_frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quark_core::entry::ENTRY_ADDR_MASK;

    use crate::frame::AllocTag;
    use crate::pmm::{AllocFlags, AllocRequest, FrameAllocator};
    use crate::testutil::TestMemory;
    use crate::topology::NumaTopology;
    use crate::{Capabilities, PAGE_SIZE};

    /// Masks an entry down to its address bits.
    fn entry_addr(bits: u64) -> u64 {
        bits & ENTRY_ADDR_MASK
    }

    struct Fixture {
        mem: TestMemory,
        pmm: FrameAllocator,
        root: PhysFrame,
    }

    fn fixture(frames: usize) -> Fixture {
        let mem = TestMemory::new(frames);
        let topo = NumaTopology::single_node(mem.span_end());
        let pmm = unsafe {
            FrameAllocator::new(&mem.regions(), topo, Capabilities::empty(), mem.dm())
        }
        .unwrap();
        let root = pmm
            .allocate(
                AllocRequest::order(0)
                    .with_flags(AllocFlags::ZEROED)
                    .tagged(AllocTag::PAGE_TABLE),
                mem.dm(),
            )
            .unwrap();
        Fixture { mem, pmm, root }
    }

    impl Fixture {
        fn walker(&self) -> PageWalker<'_, crate::testutil::BufferMap> {
            unsafe { PageWalker::new(self.root, self.mem.dm()) }
        }

        fn table_alloc(&self) -> impl FnMut() -> Option<PhysFrame> + '_ {
            move || {
                self.pmm
                    .allocate(
                        AllocRequest::order(0)
                            .with_flags(AllocFlags::ZEROED)
                            .tagged(AllocTag::PAGE_TABLE),
                        self.mem.dm(),
                    )
                    .ok()
            }
        }

        fn user_frame(&self) -> PhysFrame {
            self.pmm
                .allocate(
                    AllocRequest::order(0)
                        .with_flags(AllocFlags::ZEROED)
                        .tagged(AllocTag::USER),
                    self.mem.dm(),
                )
                .unwrap()
        }
    }

    fn page(addr: u64) -> Page {
        Page::containing_address(VirtAddr::new(addr))
    }

    #[test]
    fn map_unmap_round_trip() {
        let fx = fixture(128);
        let walker = fx.walker();
        let frame = fx.user_frame();
        let mut alloc = fx.table_alloc();

        walker
            .map(page(0x40_0000), frame, MapFlags::WRITABLE | MapFlags::USER, &mut alloc)
            .unwrap()
            .ignore();

        assert_eq!(
            walker.translate(VirtAddr::new(0x40_0123)),
            Some(frame.start_address() + 0x123)
        );

        let (unmapped, flush) = walker.unmap(page(0x40_0000)).unwrap();
        flush.flush();
        assert_eq!(unmapped, frame);
        assert_eq!(walker.translate(VirtAddr::new(0x40_0000)), None);
    }

    #[test]
    fn double_map_is_rejected() {
        let fx = fixture(128);
        let walker = fx.walker();
        let frame = fx.user_frame();
        let mut alloc = fx.table_alloc();

        walker
            .map(page(0x1000), frame, MapFlags::WRITABLE, &mut alloc)
            .unwrap()
            .ignore();
        assert_eq!(
            walker
                .map(page(0x1000), frame, MapFlags::WRITABLE, &mut alloc)
                .err(),
            Some(MapError::AlreadyMapped)
        );
    }

    #[test]
    fn unmap_missing_is_not_mapped() {
        let fx = fixture(128);
        let walker = fx.walker();
        assert_eq!(walker.unmap(page(0x5000)).err(), Some(UnmapError::NotMapped));
    }

    #[test]
    fn table_allocation_failure_is_out_of_memory() {
        let fx = fixture(128);
        let walker = fx.walker();
        let frame = fx.user_frame();
        let mut failing = || None;

        assert_eq!(
            walker
                .map(page(0x1000), frame, MapFlags::WRITABLE, &mut failing)
                .err(),
            Some(MapError::OutOfMemory)
        );
    }

    #[test]
    fn distant_addresses_use_distinct_subtrees() {
        let fx = fixture(256);
        let walker = fx.walker();
        let mut alloc = fx.table_alloc();

        let a = fx.user_frame();
        let b = fx.user_frame();
        // Far enough apart to differ in the top-level index.
        walker
            .map(page(0x1000), a, MapFlags::WRITABLE, &mut alloc)
            .unwrap()
            .ignore();
        walker
            .map(page(0x0000_7F80_0000_0000), b, MapFlags::WRITABLE, &mut alloc)
            .unwrap()
            .ignore();

        assert_eq!(walker.translate(VirtAddr::new(0x1000)), Some(a.start_address()));
        assert_eq!(
            walker.translate(VirtAddr::new(0x0000_7F80_0000_0000)),
            Some(b.start_address())
        );
    }

    #[test]
    fn update_flags_preserves_frame() {
        let fx = fixture(128);
        let walker = fx.walker();
        let frame = fx.user_frame();
        let mut alloc = fx.table_alloc();

        walker
            .map(page(0x2000), frame, MapFlags::WRITABLE | MapFlags::USER, &mut alloc)
            .unwrap()
            .ignore();
        walker
            .update_flags(page(0x2000), MapFlags::USER)
            .unwrap()
            .flush();

        let entry = walker.entry(page(0x2000)).unwrap();
        assert_eq!(entry.frame(), Some(frame));
        assert!(!entry.flags().contains(EntryFlags::WRITABLE));
    }

    #[test]
    fn cow_flag_strips_writable_in_entry() {
        let fx = fixture(128);
        let walker = fx.walker();
        let frame = fx.user_frame();
        let mut alloc = fx.table_alloc();

        walker
            .map(
                page(0x3000),
                frame,
                MapFlags::WRITABLE | MapFlags::COPY_ON_WRITE,
                &mut alloc,
            )
            .unwrap()
            .ignore();

        let entry = walker.entry(page(0x3000)).unwrap();
        assert!(entry.is_copy_on_write());
        assert!(!entry.flags().contains(EntryFlags::WRITABLE));
    }

    #[test]
    fn swap_slot_round_trip() {
        let fx = fixture(128);
        let walker = fx.walker();
        let mut alloc = fx.table_alloc();

        walker
            .set_swapped(page(0x9000), SwapSlot(77), &mut alloc)
            .unwrap();
        assert_eq!(walker.translate(VirtAddr::new(0x9000)), None);
        assert_eq!(walker.entry(page(0x9000)).unwrap().swap_slot(), Some(SwapSlot(77)));

        assert_eq!(walker.take_swap_slot(page(0x9000)), Some(SwapSlot(77)));
        assert!(walker.entry(page(0x9000)).is_none());
    }

    #[test]
    fn clear_distinguishes_mapped_and_swapped() {
        let fx = fixture(128);
        let walker = fx.walker();
        let frame = fx.user_frame();
        let mut alloc = fx.table_alloc();

        walker
            .map(page(0x1000), frame, MapFlags::WRITABLE, &mut alloc)
            .unwrap()
            .ignore();
        walker
            .set_swapped(page(0x2000), SwapSlot(5), &mut alloc)
            .unwrap();

        match walker.clear(page(0x1000)).unwrap() {
            ClearedEntry::Mapped(f, flush) => {
                flush.flush();
                assert_eq!(f, frame);
            }
            other => panic!("expected mapped entry, got {other:?}"),
        }
        match walker.clear(page(0x2000)).unwrap() {
            ClearedEntry::Swapped(slot) => assert_eq!(slot, SwapSlot(5)),
            other => panic!("expected swapped entry, got {other:?}"),
        }
    }

    #[test]
    fn free_tree_returns_all_table_frames() {
        let fx = fixture(256);
        let walker = fx.walker();
        let frame = fx.user_frame();
        let mut alloc = fx.table_alloc();

        walker
            .map(page(0x1000), frame, MapFlags::WRITABLE, &mut alloc)
            .unwrap()
            .ignore();
        let (_, flush) = walker.unmap(page(0x1000)).unwrap();
        flush.flush();

        let free_before = fx.pmm.free_pages();
        let mut freed = 0u64;
        walker.free_tree(&mut |table_frame| {
            fx.pmm.table().of(table_frame).release();
            // SAFETY: Table frames are exclusively owned by this tree.
            unsafe { fx.pmm.free(table_frame, 0, fx.mem.dm()) };
            freed += 1;
        });
        // Root + one table per level below the root.
        assert_eq!(freed, PAGING_LEVELS as u64);
        assert_eq!(fx.pmm.free_pages(), free_before + freed);
    }

    #[test]
    fn raw_entry_masks_are_consistent() {
        let entry = PageEntry::mapping(PhysFrame::from_number(3), EntryFlags::WRITABLE);
        assert_eq!(entry_addr(entry.bits()), 3 * PAGE_SIZE as u64);
    }
}
