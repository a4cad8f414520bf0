//! Page table entry value object.
//!
//! [`PageEntry`] wraps the raw 64-bit entry format behind named accessors
//! so flag manipulation never happens as loose bit arithmetic at call
//! sites. The setters maintain the invariant that `COPY_ON_WRITE` and
//! `WRITABLE` are never set together, and that a swapped-out entry is
//! never marked present.

use crate::addr::PhysAddr;
use crate::paging::PhysFrame;

/// Physical address mask: bits 12..51 of an entry.
pub const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags::bitflags! {
    /// Page table entry flags.
    ///
    /// The low bits mirror a conventional hardware layout; `COPY_ON_WRITE`,
    /// `SHARED` and `SWAPPED` occupy software-available bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        /// Entry is present / valid.
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode.
        const USER          = 1 << 2;
        /// Hardware has read through this entry.
        const ACCESSED      = 1 << 5;
        /// Hardware has written through this entry.
        const DIRTY         = 1 << 6;
        /// Global mapping, survives an address-space switch.
        const GLOBAL        = 1 << 8;
        /// Write must be resolved by copying the shared frame first.
        const COPY_ON_WRITE = 1 << 9;
        /// Frame is deliberately shared between address spaces.
        const SHARED        = 1 << 10;
        /// Entry holds a swap slot instead of a frame (never with PRESENT).
        const SWAPPED       = 1 << 11;
        /// Instruction fetch from this page is forbidden.
        const NO_EXECUTE    = 1 << 63;
    }
}

/// A single page table entry (64 bits).
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// An empty (not present, not swapped) entry.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates a present entry mapping `frame` with the given flags.
    ///
    /// `PRESENT` is added unconditionally. Panics in debug builds if the
    /// flags combine `COPY_ON_WRITE` with `WRITABLE` or include `SWAPPED`.
    #[inline]
    pub fn mapping(frame: PhysFrame, flags: EntryFlags) -> Self {
        let flags = flags | EntryFlags::PRESENT;
        debug_assert!(
            !flags.contains(EntryFlags::COPY_ON_WRITE | EntryFlags::WRITABLE),
            "PageEntry: copy-on-write entries must not be writable"
        );
        debug_assert!(!flags.contains(EntryFlags::SWAPPED));
        Self((frame.start_address().as_u64() & ENTRY_ADDR_MASK) | flags.bits())
    }

    /// Creates a non-present entry recording an evicted page's swap slot.
    #[inline]
    pub fn swapped_out(slot: SwapSlot) -> Self {
        Self((slot.0 << 12) | EntryFlags::SWAPPED.bits())
    }

    /// Returns the raw bits.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Reconstructs an entry from raw bits read out of a table.
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns `true` if the entry is neither present nor swapped.
    #[inline]
    pub fn is_unused(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the `PRESENT` bit is set.
    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    /// Returns `true` if the entry records a swapped-out page.
    #[inline]
    pub fn is_swapped(self) -> bool {
        !self.is_present() && self.flags().contains(EntryFlags::SWAPPED)
    }

    /// Returns `true` for a present entry awaiting copy-on-write.
    #[inline]
    pub fn is_copy_on_write(self) -> bool {
        self.is_present() && self.flags().contains(EntryFlags::COPY_ON_WRITE)
    }

    /// Returns the mapped frame of a present entry.
    #[inline]
    pub fn frame(self) -> Option<PhysFrame> {
        if self.is_present() {
            Some(PhysFrame::containing_address(PhysAddr::new_truncate(
                self.0 & ENTRY_ADDR_MASK,
            )))
        } else {
            None
        }
    }

    /// Returns the swap slot of a swapped-out entry.
    #[inline]
    pub fn swap_slot(self) -> Option<SwapSlot> {
        if self.is_swapped() {
            Some(SwapSlot((self.0 & ENTRY_ADDR_MASK) >> 12))
        } else {
            None
        }
    }

    /// Returns the flags portion of this entry.
    #[inline]
    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0 & !ENTRY_ADDR_MASK)
    }

    /// Replaces the flags, keeping the mapped frame.
    ///
    /// Maintains the copy-on-write exclusion by stripping `WRITABLE` when
    /// `COPY_ON_WRITE` is requested.
    #[inline]
    pub fn with_flags(self, flags: EntryFlags) -> Self {
        let mut flags = flags;
        if flags.contains(EntryFlags::COPY_ON_WRITE) {
            flags.remove(EntryFlags::WRITABLE);
        }
        Self((self.0 & ENTRY_ADDR_MASK) | flags.bits())
    }

    /// Downgrades a present entry for sharing: clears `WRITABLE`, sets
    /// `COPY_ON_WRITE`. Used when cloning an address space.
    #[inline]
    pub fn make_copy_on_write(self) -> Self {
        debug_assert!(self.is_present());
        let flags = (self.flags() | EntryFlags::COPY_ON_WRITE) - EntryFlags::WRITABLE;
        self.with_flags(flags)
    }

    /// Upgrades a copy-on-write entry back to exclusive writable, pointing
    /// it at `frame` (the private copy, or the original when the caller was
    /// its sole owner).
    #[inline]
    pub fn make_private_writable(self, frame: PhysFrame) -> Self {
        debug_assert!(self.is_copy_on_write());
        let flags = (self.flags() | EntryFlags::WRITABLE) - EntryFlags::COPY_ON_WRITE;
        Self::mapping(frame, flags)
    }
}

impl core::fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(frame) = self.frame() {
            write!(f, "PageEntry({:#x}, {:?})", frame.start_address(), self.flags())
        } else if let Some(slot) = self.swap_slot() {
            write!(f, "PageEntry(swapped {})", slot.0)
        } else {
            write!(f, "PageEntry(unused)")
        }
    }
}

/// An opaque reference to a page's location in backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapSlot(pub u64);
