//! Virtual memory areas.
//!
//! A [`Vma`] is a half-open virtual range with uniform kind, protection
//! and mapping flags. Each address space keeps its VMAs in a [`VmaSet`]
//! ordered by start address, giving logarithmic point and range lookups
//! and supporting the split/carve operations that unmap and mprotect
//! need.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use quark_core::addr::{PAGE_SIZE, VirtAddr};
use quark_core::entry::EntryFlags;

bitflags::bitflags! {
    /// Access protection of a VMA.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        /// Region is readable.
        const READ  = 1 << 0;
        /// Region is writable.
        const WRITE = 1 << 1;
        /// Region is executable.
        const EXEC  = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Mapping behaviour flags of a VMA.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        /// Writes are private to this address space (copy-on-write after
        /// a clone).
        const PRIVATE = 1 << 0;
        /// Frames are deliberately shared with other address spaces.
        const SHARED  = 1 << 1;
        /// The caller demanded this exact placement; creation carves out
        /// colliding regions instead of failing.
        const FIXED   = 1 << 2;
        /// Pages are locked resident; never swapped.
        const LOCKED  = 1 << 3;
    }
}

/// What a VMA maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    /// Zero-fill-on-demand memory.
    Anonymous,
    /// Pages materialised from a file.
    FileBacked,
    /// Device memory; never demand-paged or swapped.
    Device,
    /// Explicitly shared memory segment.
    Shared,
    /// A task stack.
    Stack,
    /// The task heap.
    Heap,
    /// Executable image text.
    Code,
}

/// Opaque reference to a file known to the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingRef {
    /// Storage-layer handle for the file.
    pub file: u64,
    /// Byte offset of the VMA's first page within the file.
    pub offset: u64,
}

/// Errors from VMA operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaError {
    /// The range collides with an existing VMA.
    Overlap,
    /// No VMA covers the given range.
    NotFound,
    /// Zero-sized or inverted range.
    InvalidRange,
}

impl fmt::Display for VmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overlap => write!(f, "range collides with an existing mapping"),
            Self::NotFound => write!(f, "no mapping covers the range"),
            Self::InvalidRange => write!(f, "empty or inverted range"),
        }
    }
}

/// A contiguous virtual range with uniform attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    /// Inclusive start, page-aligned.
    pub start: VirtAddr,
    /// Exclusive end, page-aligned.
    pub end: VirtAddr,
    /// What the range maps.
    pub kind: VmaKind,
    /// Access protection.
    pub prot: Protection,
    /// Mapping behaviour.
    pub flags: VmaFlags,
    /// Backing file, for [`VmaKind::FileBacked`] regions.
    pub backing: Option<BackingRef>,
}

impl Vma {
    /// Creates a VMA over `[start, end)`.
    pub fn new(
        start: VirtAddr,
        end: VirtAddr,
        kind: VmaKind,
        prot: Protection,
        flags: VmaFlags,
        backing: Option<BackingRef>,
    ) -> Self {
        debug_assert!(start < end, "VMA start must precede end");
        debug_assert!(start.is_aligned(PAGE_SIZE) && end.is_aligned(PAGE_SIZE));
        Self {
            start,
            end,
            kind,
            prot,
            flags,
            backing,
        }
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns `true` for a degenerate empty range (never stored).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Returns `true` if `addr` falls inside the range.
    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Returns `true` if the range intersects `[start, end)`.
    #[inline]
    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.start < end && start < self.end
    }

    /// Splits at `addr` (page-aligned, strictly inside), returning the
    /// upper part and shrinking `self` to the lower part. File offsets
    /// are advanced for the upper part.
    pub fn split_at(&mut self, addr: VirtAddr) -> Vma {
        debug_assert!(addr > self.start && addr < self.end);
        debug_assert!(addr.is_aligned(PAGE_SIZE));
        let mut upper = *self;
        upper.start = addr;
        if let Some(backing) = &mut upper.backing {
            backing.offset += addr - self.start;
        }
        self.end = addr;
        upper
    }

    /// Returns `true` if `other` continues this VMA with identical
    /// attributes (and contiguous file offsets), so the two can merge.
    pub fn can_merge_with(&self, other: &Vma) -> bool {
        if self.end != other.start
            || self.kind != other.kind
            || self.prot != other.prot
            || self.flags != other.flags
        {
            return false;
        }
        match (self.backing, other.backing) {
            (None, None) => true,
            (Some(a), Some(b)) => a.file == b.file && a.offset + self.len() == b.offset,
            _ => false,
        }
    }

    /// Derives the page-table entry flags a freshly mapped page of this
    /// VMA should carry.
    pub fn entry_flags(&self) -> EntryFlags {
        let mut flags = EntryFlags::USER;
        if self.prot.contains(Protection::WRITE) {
            flags |= EntryFlags::WRITABLE;
        }
        if !self.prot.contains(Protection::EXEC) {
            flags |= EntryFlags::NO_EXECUTE;
        }
        if self.flags.contains(VmaFlags::SHARED) || self.kind == VmaKind::Shared {
            flags |= EntryFlags::SHARED;
        }
        flags
    }

    /// Returns `true` if an access of the given kind is permitted.
    pub fn permits(&self, write: bool, execute: bool) -> bool {
        if write && !self.prot.contains(Protection::WRITE) {
            return false;
        }
        if execute && !self.prot.contains(Protection::EXEC) {
            return false;
        }
        if !write && !execute && !self.prot.contains(Protection::READ) {
            return false;
        }
        true
    }
}

/// The ordered, non-overlapping VMA collection of one address space.
#[derive(Debug, Default)]
pub struct VmaSet {
    /// VMAs keyed by start address.
    map: BTreeMap<u64, Vma>,
}

impl VmaSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Number of VMAs.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the set holds no VMAs.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Inserts `vma`, rejecting overlap with any existing region, then
    /// merges it with compatible neighbours.
    pub fn insert(&mut self, vma: Vma) -> Result<(), VmaError> {
        if vma.is_empty() {
            return Err(VmaError::InvalidRange);
        }
        if self.intersects(vma.start, vma.end) {
            return Err(VmaError::Overlap);
        }
        self.map.insert(vma.start.as_u64(), vma);
        self.merge_around(vma.start);
        Ok(())
    }

    /// Point lookup: the VMA containing `addr`.
    pub fn find(&self, addr: VirtAddr) -> Option<&Vma> {
        self.map
            .range(..=addr.as_u64())
            .next_back()
            .map(|(_, v)| v)
            .filter(|v| v.contains(addr))
    }

    /// Returns `true` if any VMA intersects `[start, end)`.
    pub fn intersects(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.intersection(start, end).next().is_some()
    }

    /// Range lookup: all VMAs intersecting `[start, end)`, in order.
    pub fn intersection(
        &self,
        start: VirtAddr,
        end: VirtAddr,
    ) -> impl Iterator<Item = &Vma> {
        // A VMA starting before `start` can still reach into the range,
        // so begin one entry early.
        let first = self
            .map
            .range(..=start.as_u64())
            .next_back()
            .map_or(start.as_u64(), |(k, _)| *k);
        self.map
            .range(first..end.as_u64())
            .map(|(_, v)| v)
            .filter(move |v| v.overlaps(start, end))
    }

    /// Iterates all VMAs in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.map.values()
    }

    /// Removes everything intersecting `[start, end)`, splitting
    /// partially covered VMAs. Returns the removed pieces (clipped to
    /// the range) so the caller can unmap their pages.
    pub fn carve(&mut self, start: VirtAddr, end: VirtAddr) -> Vec<Vma> {
        let keys: Vec<u64> = self
            .intersection(start, end)
            .map(|v| v.start.as_u64())
            .collect();

        let mut removed = Vec::new();
        for key in keys {
            let mut vma = self.map.remove(&key).expect("key from intersection");

            if vma.start < start {
                // Keep the prefix.
                let upper = vma.split_at(start);
                self.map.insert(vma.start.as_u64(), vma);
                vma = upper;
            }
            if vma.end > end {
                // Keep the suffix.
                let upper = vma.split_at(end);
                self.map.insert(upper.start.as_u64(), upper);
            }
            removed.push(vma);
        }
        removed
    }

    /// Changes the protection of `[start, end)`, splitting boundary VMAs
    /// so the change applies exactly to the range. Returns the affected
    /// sub-ranges so the caller can downgrade or upgrade live mappings.
    ///
    /// Fails with [`VmaError::NotFound`] when nothing intersects the
    /// range.
    pub fn protect(
        &mut self,
        start: VirtAddr,
        end: VirtAddr,
        prot: Protection,
    ) -> Result<Vec<(VirtAddr, VirtAddr)>, VmaError> {
        let pieces = self.carve(start, end);
        if pieces.is_empty() {
            return Err(VmaError::NotFound);
        }
        let mut affected = Vec::with_capacity(pieces.len());
        for mut piece in pieces {
            piece.prot = prot;
            affected.push((piece.start, piece.end));
            self.map.insert(piece.start.as_u64(), piece);
            self.merge_around(piece.start);
        }
        Ok(affected)
    }

    /// Merges the VMA at `at` with its neighbours where attributes allow.
    fn merge_around(&mut self, at: VirtAddr) {
        let mut key = at.as_u64();

        // Merge with predecessor.
        if let Some((&prev_key, _)) = self.map.range(..key).next_back() {
            let prev = self.map[&prev_key];
            let this = self.map[&key];
            if prev.can_merge_with(&this) {
                self.map.remove(&key);
                self.map.get_mut(&prev_key).expect("predecessor").end = this.end;
                key = prev_key;
            }
        }

        // Merge with successor.
        let this = self.map[&key];
        if let Some((&next_key, _)) = self.map.range(key + 1..).next() {
            let next = self.map[&next_key];
            if this.can_merge_with(&next) {
                self.map.remove(&next_key);
                self.map.get_mut(&key).expect("merged vma").end = next.end;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vma(start: u64, end: u64) -> Vma {
        Vma::new(
            VirtAddr::new(start),
            VirtAddr::new(end),
            VmaKind::Anonymous,
            Protection::READ | Protection::WRITE,
            VmaFlags::PRIVATE,
            None,
        )
    }

    fn vma_prot(start: u64, end: u64, prot: Protection) -> Vma {
        Vma::new(
            VirtAddr::new(start),
            VirtAddr::new(end),
            VmaKind::Anonymous,
            prot,
            VmaFlags::PRIVATE,
            None,
        )
    }

    #[test]
    fn contains_and_overlaps() {
        let v = vma(0x2000, 0x4000);
        assert!(v.contains(VirtAddr::new(0x2000)));
        assert!(v.contains(VirtAddr::new(0x3FFF)));
        assert!(!v.contains(VirtAddr::new(0x4000)));

        assert!(v.overlaps(VirtAddr::new(0x1000), VirtAddr::new(0x3000)));
        assert!(v.overlaps(VirtAddr::new(0x3000), VirtAddr::new(0x5000)));
        assert!(!v.overlaps(VirtAddr::new(0x0000), VirtAddr::new(0x2000)));
        assert!(!v.overlaps(VirtAddr::new(0x4000), VirtAddr::new(0x5000)));
    }

    #[test]
    fn insert_rejects_overlap() {
        let mut set = VmaSet::new();
        set.insert(vma(0x2000, 0x4000)).unwrap();
        assert_eq!(set.insert(vma(0x3000, 0x5000)), Err(VmaError::Overlap));
        assert_eq!(set.insert(vma(0x1000, 0x2001)), Err(VmaError::Overlap));
    }

    #[test]
    fn adjacent_compatible_vmas_merge() {
        let mut set = VmaSet::new();
        set.insert(vma(0x1000, 0x2000)).unwrap();
        set.insert(vma(0x3000, 0x4000)).unwrap();
        assert_eq!(set.len(), 2);

        // Filling the gap merges everything into one region.
        set.insert(vma(0x2000, 0x3000)).unwrap();
        assert_eq!(set.len(), 1);
        let merged = set.find(VirtAddr::new(0x1000)).unwrap();
        assert_eq!(merged.end, VirtAddr::new(0x4000));
    }

    #[test]
    fn adjacent_incompatible_vmas_stay_apart() {
        let mut set = VmaSet::new();
        set.insert(vma(0x1000, 0x2000)).unwrap();
        set.insert(vma_prot(0x2000, 0x3000, Protection::READ)).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn find_is_a_point_lookup() {
        let mut set = VmaSet::new();
        set.insert(vma(0x1000, 0x2000)).unwrap();
        set.insert(vma_prot(0x3000, 0x4000, Protection::READ)).unwrap();

        assert!(set.find(VirtAddr::new(0x1800)).is_some());
        assert!(set.find(VirtAddr::new(0x2800)).is_none());
        assert!(set.find(VirtAddr::new(0x3000)).is_some());
        assert!(set.find(VirtAddr::new(0x4000)).is_none());
    }

    #[test]
    fn intersection_spans_partial_overlaps() {
        let mut set = VmaSet::new();
        set.insert(vma(0x1000, 0x3000)).unwrap();
        set.insert(vma_prot(0x5000, 0x7000, Protection::READ)).unwrap();

        let hits: Vec<_> = set
            .intersection(VirtAddr::new(0x2000), VirtAddr::new(0x6000))
            .collect();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn carve_splits_interior() {
        let mut set = VmaSet::new();
        set.insert(vma(0x1000, 0x4000)).unwrap();

        let removed = set.carve(VirtAddr::new(0x2000), VirtAddr::new(0x3000));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].start, VirtAddr::new(0x2000));
        assert_eq!(removed[0].end, VirtAddr::new(0x3000));

        assert!(set.find(VirtAddr::new(0x1800)).is_some());
        assert!(set.find(VirtAddr::new(0x2800)).is_none());
        assert!(set.find(VirtAddr::new(0x3800)).is_some());
    }

    #[test]
    fn carve_clips_edges() {
        let mut set = VmaSet::new();
        set.insert(vma(0x2000, 0x4000)).unwrap();

        let removed = set.carve(VirtAddr::new(0x1000), VirtAddr::new(0x3000));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].start, VirtAddr::new(0x2000));
        assert_eq!(removed[0].end, VirtAddr::new(0x3000));
        assert!(set.find(VirtAddr::new(0x3800)).is_some());
    }

    #[test]
    fn split_advances_file_offset() {
        let mut v = Vma::new(
            VirtAddr::new(0x1000),
            VirtAddr::new(0x4000),
            VmaKind::FileBacked,
            Protection::READ,
            VmaFlags::PRIVATE,
            Some(BackingRef { file: 7, offset: 0x0 }),
        );
        let upper = v.split_at(VirtAddr::new(0x2000));
        assert_eq!(v.backing.unwrap().offset, 0);
        assert_eq!(upper.backing.unwrap().offset, 0x1000);
    }

    #[test]
    fn protect_splits_and_applies() {
        let mut set = VmaSet::new();
        set.insert(vma(0x1000, 0x4000)).unwrap();

        let affected = set
            .protect(
                VirtAddr::new(0x2000),
                VirtAddr::new(0x3000),
                Protection::READ,
            )
            .unwrap();
        assert_eq!(affected, vec![(VirtAddr::new(0x2000), VirtAddr::new(0x3000))]);

        assert_eq!(
            set.find(VirtAddr::new(0x2800)).unwrap().prot,
            Protection::READ
        );
        assert_eq!(
            set.find(VirtAddr::new(0x1800)).unwrap().prot,
            Protection::READ | Protection::WRITE
        );
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn protect_missing_range_fails() {
        let mut set = VmaSet::new();
        assert_eq!(
            set.protect(VirtAddr::new(0x1000), VirtAddr::new(0x2000), Protection::READ),
            Err(VmaError::NotFound)
        );
    }

    #[test]
    fn non_overlap_invariant_under_churn() {
        let mut set = VmaSet::new();
        set.insert(vma(0x1000, 0x8000)).unwrap();
        set.carve(VirtAddr::new(0x2000), VirtAddr::new(0x3000));
        set.carve(VirtAddr::new(0x5000), VirtAddr::new(0x6000));
        set.insert(vma_prot(0x2000, 0x3000, Protection::READ)).unwrap();

        // Pairwise non-overlap over everything left in the set.
        let all: Vec<_> = set.iter().copied().collect();
        for (i, a) in all.iter().enumerate() {
            for b in all.iter().skip(i + 1) {
                assert!(!a.overlaps(b.start, b.end), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn entry_flags_follow_protection() {
        let v = vma_prot(0x1000, 0x2000, Protection::READ | Protection::WRITE);
        let flags = v.entry_flags();
        assert!(flags.contains(EntryFlags::WRITABLE));
        assert!(flags.contains(EntryFlags::NO_EXECUTE));
        assert!(flags.contains(EntryFlags::USER));

        let x = vma_prot(0x1000, 0x2000, Protection::READ | Protection::EXEC);
        assert!(!x.entry_flags().contains(EntryFlags::NO_EXECUTE));
        assert!(!x.entry_flags().contains(EntryFlags::WRITABLE));
    }

    #[test]
    fn permits_checks_access_kind() {
        let ro = vma_prot(0x1000, 0x2000, Protection::READ);
        assert!(ro.permits(false, false));
        assert!(!ro.permits(true, false));
        assert!(!ro.permits(false, true));

        let rw = vma_prot(0x1000, 0x2000, Protection::READ | Protection::WRITE);
        assert!(rw.permits(true, false));
    }
}
