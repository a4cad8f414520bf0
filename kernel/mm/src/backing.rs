//! Backing-store collaborator interface.
//!
//! Demand paging of file-backed regions and swap-in both need page
//! contents from the storage layer. This subsystem treats that layer as
//! an opaque, blocking collaborator behind [`BackingStore`]; callers in
//! the fault path drop their locks before invoking it.

use quark_core::entry::SwapSlot;

use crate::PAGE_SIZE;
use crate::vma::BackingRef;

/// Where a page's contents live in the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    /// A window of a file: the VMA's backing reference plus the page's
    /// byte offset within it.
    File(BackingRef, u64),
    /// A previously evicted page's swap slot.
    Swap(SwapSlot),
}

/// Error reported by the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoError;

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "backing store I/O failed")
    }
}

/// Blocking page transport to and from the storage layer.
///
/// Implementations may sleep; nothing in this subsystem calls them while
/// holding a lock.
pub trait BackingStore: Sync {
    /// Reads one page of content into `dst`.
    fn read_page(&self, source: PageSource, dst: &mut [u8; PAGE_SIZE]) -> Result<(), IoError>;

    /// Writes one page of content from `src`.
    fn write_page(&self, source: PageSource, src: &[u8; PAGE_SIZE]) -> Result<(), IoError>;

    /// Releases a swap slot whose page was destroyed without re-reading
    /// it. The default implementation ignores the notification.
    fn discard(&self, slot: SwapSlot) {
        let _ = slot;
    }
}

/// A backing store with no storage: reads zero-fill, writes vanish.
///
/// Stands in for the storage layer before it comes up, and in host
/// tests that do not exercise file-backed paths.
#[derive(Debug, Default)]
pub struct NoBackingStore;

impl BackingStore for NoBackingStore {
    fn read_page(&self, _source: PageSource, dst: &mut [u8; PAGE_SIZE]) -> Result<(), IoError> {
        dst.fill(0);
        Ok(())
    }

    fn write_page(&self, _source: PageSource, _src: &[u8; PAGE_SIZE]) -> Result<(), IoError> {
        Ok(())
    }
}
