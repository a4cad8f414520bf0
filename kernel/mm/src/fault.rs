//! Page-fault resolution.
//!
//! [`FaultResolver::resolve`] is the state machine behind every
//! hardware page-fault trap: classify the access against the owning
//! VMA, then demand-page, break copy-on-write, swap in, or escalate.
//!
//! The resolver runs in trap context. Paths that must block on the
//! backing store (file reads, swap-in) drop the address-space lock
//! first and re-validate the VMA and leaf entry afterwards, since the
//! region may have been unmapped or resolved concurrently.

use quark_core::addr::VirtAddr;
use quark_core::entry::PageEntry;
use quark_core::paging::Page;
use quark_core::{kdebug, kfatal, time};

use crate::address_space::AddressSpace;
use crate::backing::{BackingStore, PageSource};
use crate::frame::AllocTag;
use crate::mapper::{MapError, MapFlags};
use crate::pmm::{AllocFlags, AllocRequest, FrameAllocator};
use crate::vma::{Vma, VmaKind};
use crate::{DirectMap, PAGE_SIZE};

bitflags::bitflags! {
    /// Decoded hardware error code delivered with a page-fault trap.
    ///
    /// The trap dispatcher translates the architecture's raw code into
    /// this set before calling the resolver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u64 {
        /// Translation was present; the fault is a permission issue.
        const PRESENT     = 1 << 0;
        /// The faulting access was a write.
        const WRITE       = 1 << 1;
        /// The fault came from user mode.
        const USER        = 1 << 2;
        /// A reserved bit was set in a translation entry (corruption).
        const RESERVED    = 1 << 3;
        /// The faulting access was an instruction fetch.
        const INSTRUCTION = 1 << 4;
    }
}

/// Execution context the trap arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecContext {
    /// Kernel-mode code faulted.
    Kernel,
    /// User-mode code faulted.
    User,
}

/// How a resolvable fault was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// First touch of a demand-paged region.
    DemandPage,
    /// Write to a shared copy-on-write page.
    CopyOnWrite,
    /// Reload of a swapped-out page.
    SwapIn,
    /// Access violating the VMA's protection; never self-resolves.
    ProtectionViolation,
}

/// Why a fault could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// The address is not canonical.
    InvalidAddress,
    /// No VMA covers the address.
    SegmentationFault,
    /// The access violates the covering VMA's protection.
    ProtectionViolation,
    /// No frame could be allocated during resolution.
    OutOfMemory,
    /// A reserved bit was set in a translation entry.
    TableCorruption,
    /// The backing store failed to deliver the page.
    BackingStoreFailure,
}

impl core::fmt::Display for Escalation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidAddress => write!(f, "non-canonical address"),
            Self::SegmentationFault => write!(f, "no mapping covers the address"),
            Self::ProtectionViolation => write!(f, "access violates region protection"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::TableCorruption => write!(f, "reserved bit set in translation entry"),
            Self::BackingStoreFailure => write!(f, "backing store failure"),
        }
    }
}

/// Record of one fault's journey through the resolver.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// The faulting virtual address.
    pub addr: u64,
    /// Decoded hardware error code.
    pub code: FaultCode,
    /// Execution context of the fault.
    pub context: ExecContext,
    /// Classification, once reached.
    pub class: Option<FaultClass>,
    /// Kind of the covering VMA, when one exists.
    pub vma_kind: Option<VmaKind>,
    /// Tick at fault entry.
    pub started: u64,
    /// Ticks spent resolving.
    pub elapsed: u64,
}

/// Verdict returned to the trap dispatcher.
#[derive(Debug)]
pub enum FaultVerdict {
    /// The mapping was repaired; the faulting instruction can retry.
    Resolved(PageFaultInfo),
    /// The fault cannot be resolved. `fatal` is set for kernel-mode
    /// faults; the dispatcher must halt rather than continue in a
    /// possibly corrupted state. User-mode escalations go to the
    /// scheduler for signal delivery.
    Escalated {
        /// Classified failure reason.
        reason: Escalation,
        /// Whether the dispatcher must halt the system.
        fatal: bool,
        /// The fault record for diagnostics.
        info: PageFaultInfo,
    },
}

/// Upper bound on pages pre-mapped by the sequential-fault heuristic.
const PREFETCH_MAX: u64 = 4;
/// Same-stride faults required before prefetch kicks in.
const PREFETCH_THRESHOLD: u32 = 3;

/// The page-fault resolution engine.
///
/// One resolver serves all address spaces; per-space state lives in the
/// spaces themselves.
pub struct FaultResolver<'a, D: DirectMap, B: BackingStore + ?Sized> {
    pmm: &'a FrameAllocator,
    dm: &'a D,
    backing: &'a B,
}

impl<'a, D: DirectMap, B: BackingStore + ?Sized> FaultResolver<'a, D, B> {
    /// Creates a resolver over the given collaborators.
    pub fn new(pmm: &'a FrameAllocator, dm: &'a D, backing: &'a B) -> Self {
        Self { pmm, dm, backing }
    }

    /// Resolves one page fault, running to a verdict.
    ///
    /// `raw_addr` is the faulting address exactly as the hardware
    /// reported it; `code` is the decoded error code; `space` is the
    /// current task's address space supplied by the scheduler.
    pub fn resolve(
        &self,
        space: &AddressSpace,
        raw_addr: u64,
        code: FaultCode,
        context: ExecContext,
    ) -> FaultVerdict {
        let mut info = PageFaultInfo {
            addr: raw_addr,
            code,
            context,
            class: None,
            vma_kind: None,
            started: time::ticks(),
            elapsed: 0,
        };

        // A reserved bit in a translation entry means the tables are
        // corrupted; nothing above can fix that.
        if code.contains(FaultCode::RESERVED) {
            return self.escalate(Escalation::TableCorruption, &mut info, space);
        }

        let Ok(addr) = VirtAddr::try_new(raw_addr) else {
            return self.escalate(Escalation::InvalidAddress, &mut info, space);
        };
        let page = Page::containing_address(addr);
        let write = code.contains(FaultCode::WRITE);
        let execute = code.contains(FaultCode::INSTRUCTION);

        // Classification under the read lock.
        let (vma, entry) = {
            let guard = space.read();
            let Some(vma) = guard.vmas.find(addr) else {
                drop(guard);
                return self.escalate(Escalation::SegmentationFault, &mut info, space);
            };
            let vma = *vma;
            let entry = space.walker(self.dm).entry(page);
            (vma, entry)
        };
        info.vma_kind = Some(vma.kind);

        // The VMA's protection decides whether the access is legal at
        // all; an illegal access never demand-pages.
        if !vma.permits(write, execute) {
            info.class = Some(FaultClass::ProtectionViolation);
            return self.escalate(Escalation::ProtectionViolation, &mut info, space);
        }

        let class = match entry {
            Some(e) if e.is_present() => {
                if write && e.is_copy_on_write() {
                    FaultClass::CopyOnWrite
                } else {
                    // Present, permitted by the VMA, yet it faulted:
                    // the entry is stricter than the VMA for no reason
                    // this subsystem created.
                    info.class = Some(FaultClass::ProtectionViolation);
                    return self.escalate(Escalation::ProtectionViolation, &mut info, space);
                }
            }
            Some(e) if e.is_swapped() => FaultClass::SwapIn,
            _ => FaultClass::DemandPage,
        };
        info.class = Some(class);

        let outcome = match class {
            FaultClass::CopyOnWrite => self.resolve_cow(space, page),
            FaultClass::SwapIn => self.resolve_swap_in(space, page, entry.expect("swapped entry")),
            FaultClass::DemandPage => self.resolve_demand(space, page, &vma),
            FaultClass::ProtectionViolation => unreachable!("escalated above"),
        };

        match outcome {
            Ok(()) => {
                info.elapsed = time::ticks().saturating_sub(info.started);
                FaultVerdict::Resolved(info)
            }
            Err(reason) => self.escalate(reason, &mut info, space),
        }
    }

    // -- resolution paths ---------------------------------------------------

    /// Breaks copy-on-write for `page`.
    fn resolve_cow(&self, space: &AddressSpace, page: Page) -> Result<(), Escalation> {
        let mut inner = space.write();
        let walker = space.walker(self.dm);

        // Re-validate under the write lock; another thread may have
        // broken the share first.
        let Some(entry) = walker.entry(page) else {
            return Ok(());
        };
        if !entry.is_copy_on_write() {
            return Ok(());
        }
        let old_frame = entry.frame().expect("copy-on-write entry is present");
        let desc = self.pmm.table().of(old_frame);
        desc.touch();

        if desc.refcount() == 1 {
            // Sole owner: upgrade in place, no copy needed.
            walker
                .update_entry(page, entry.make_private_writable(old_frame))
                .map_err(|_| Escalation::SegmentationFault)?
                .flush();
            inner.stats.shared = inner.stats.shared.saturating_sub(1);
            return Ok(());
        }

        // Copy first; the shared original is never written.
        let copy = self
            .pmm
            .allocate(AllocRequest::order(0).tagged(AllocTag::USER), self.dm)
            .map_err(|_| Escalation::OutOfMemory)?;
        // SAFETY: `copy` is exclusively ours; `old_frame` stays alive
        // through our reference.
        unsafe { crate::copy_frame(self.dm, old_frame, copy) };

        // Repoint, invalidate, and only then drop the old reference so
        // the stale translation can never observe a reused frame.
        walker
            .update_entry(page, entry.make_private_writable(copy))
            .map_err(|_| Escalation::SegmentationFault)?
            .flush();
        inner.stats.shared = inner.stats.shared.saturating_sub(1);
        // SAFETY: This space's translation now points at `copy`.
        unsafe { self.pmm.release(old_frame, self.dm) };

        kdebug!(
            "fault: cow break at {:#x} ({:?} -> {:?})",
            page.start_address().as_u64(),
            old_frame,
            copy
        );
        Ok(())
    }

    /// Demand-pages `page` within `vma`.
    fn resolve_demand(
        &self,
        space: &AddressSpace,
        page: Page,
        vma: &Vma,
    ) -> Result<(), Escalation> {
        let file_source = vma.backing.map(|backing| {
            let offset = page.start_address() - vma.start;
            PageSource::File(backing, offset)
        });

        // Allocate before taking the write lock; zeroing covers the
        // anonymous case.
        let frame = self
            .pmm
            .allocate(
                AllocRequest::order(0)
                    .with_flags(AllocFlags::ZEROED)
                    .tagged(AllocTag::USER),
                self.dm,
            )
            .map_err(|_| Escalation::OutOfMemory)?;

        // File-backed content is read with no locks held.
        if let Some(source) = file_source {
            let ptr = self.dm.phys_to_ptr(frame.start_address());
            // SAFETY: `frame` is exclusively ours until mapped.
            let dst = unsafe { &mut *(ptr as *mut [u8; PAGE_SIZE]) };
            if self.backing.read_page(source, dst).is_err() {
                // SAFETY: Nothing maps `frame`.
                unsafe { self.pmm.release(frame, self.dm) };
                return Err(Escalation::BackingStoreFailure);
            }
        }

        let mut inner = space.write();
        let walker = space.walker(self.dm);

        // Re-validate: the VMA may be gone, or another thread may have
        // resolved the same fault while we were allocating or reading.
        let addr = page.start_address();
        let Some(current) = inner.vmas.find(addr).copied() else {
            drop(inner);
            // SAFETY: Nothing maps `frame`.
            unsafe { self.pmm.release(frame, self.dm) };
            return Err(Escalation::SegmentationFault);
        };
        if walker.entry(page).is_some_and(|e| e.is_present()) {
            drop(inner);
            // SAFETY: Nothing maps `frame`.
            unsafe { self.pmm.release(frame, self.dm) };
            return Ok(());
        }

        let flags = MapFlags::from_entry_flags(current.entry_flags());
        let mut alloc = AddressSpace::table_alloc(self.pmm, self.dm);
        match walker.map(page, frame, flags, &mut alloc) {
            Ok(flush) => flush.ignore(),
            Err(e) => {
                drop(inner);
                // SAFETY: Nothing maps `frame`.
                unsafe { self.pmm.release(frame, self.dm) };
                return Err(match e {
                    MapError::OutOfMemory => Escalation::OutOfMemory,
                    MapError::AlreadyMapped => return Ok(()),
                });
            }
        }
        inner.stats.resident += 1;
        if flags.intersects(MapFlags::SHARED | MapFlags::COPY_ON_WRITE) {
            inner.stats.shared += 1;
        }

        // Sequential-fault heuristic, anonymous regions only (file
        // reads would block).
        if current.backing.is_none() {
            self.maybe_prefetch(&mut inner, space, &current, page);
        }
        Ok(())
    }

    /// Reloads a swapped-out page.
    fn resolve_swap_in(
        &self,
        space: &AddressSpace,
        page: Page,
        observed: PageEntry,
    ) -> Result<(), Escalation> {
        let slot = observed.swap_slot().expect("swap-in classified entry");

        let frame = self
            .pmm
            .allocate(AllocRequest::order(0).tagged(AllocTag::USER), self.dm)
            .map_err(|_| Escalation::OutOfMemory)?;

        // Blocking read with no locks held.
        let ptr = self.dm.phys_to_ptr(frame.start_address());
        // SAFETY: `frame` is exclusively ours until mapped.
        let dst = unsafe { &mut *(ptr as *mut [u8; PAGE_SIZE]) };
        if self.backing.read_page(PageSource::Swap(slot), dst).is_err() {
            // SAFETY: Nothing maps `frame`.
            unsafe { self.pmm.release(frame, self.dm) };
            return Err(Escalation::BackingStoreFailure);
        }

        let mut inner = space.write();
        let walker = space.walker(self.dm);

        // Re-validate: still the same swapped slot?
        let addr = page.start_address();
        let Some(vma) = inner.vmas.find(addr).copied() else {
            drop(inner);
            // SAFETY: Nothing maps `frame`.
            unsafe { self.pmm.release(frame, self.dm) };
            return Err(Escalation::SegmentationFault);
        };
        if walker.entry(page).and_then(PageEntry::swap_slot) != Some(slot) {
            // Concurrently resolved, re-evicted elsewhere, or unmapped;
            // our copy is stale either way.
            drop(inner);
            // SAFETY: Nothing maps `frame`.
            unsafe { self.pmm.release(frame, self.dm) };
            return Ok(());
        }
        let _ = walker.take_swap_slot(page);

        let flags = MapFlags::from_entry_flags(vma.entry_flags());
        let mut alloc = AddressSpace::table_alloc(self.pmm, self.dm);
        match walker.map(page, frame, flags, &mut alloc) {
            Ok(flush) => flush.ignore(),
            Err(_) => {
                drop(inner);
                // SAFETY: Nothing maps `frame`.
                unsafe { self.pmm.release(frame, self.dm) };
                return Err(Escalation::OutOfMemory);
            }
        }
        inner.stats.swapped = inner.stats.swapped.saturating_sub(1);
        inner.stats.resident += 1;
        drop(inner);

        self.backing.discard(slot);
        Ok(())
    }

    /// Updates the stride tracker and pre-maps ahead after a run of
    /// same-stride demand faults. Prefetch failures are silent; the
    /// heuristic must never turn an easy fault into an error.
    fn maybe_prefetch(
        &self,
        inner: &mut crate::address_space::AsInner,
        space: &AddressSpace,
        vma: &Vma,
        page: Page,
    ) {
        // A run of N means the last N faults form an arithmetic
        // sequence; three faults at the same stride arm the prefetch.
        let addr = page.start_address().as_u64();
        let stride = addr.wrapping_sub(inner.hint.last) as i64;
        if inner.hint.last != 0 && stride != 0 {
            if inner.hint.run >= 2 && stride == inner.hint.stride {
                inner.hint.run += 1;
            } else {
                inner.hint.run = 2;
                inner.hint.stride = stride;
            }
        } else {
            inner.hint.run = 1;
        }
        inner.hint.last = addr;

        if inner.hint.run < PREFETCH_THRESHOLD {
            return;
        }

        let walker = space.walker(self.dm);
        let flags = MapFlags::from_entry_flags(vma.entry_flags());
        let mut mapped = 0u64;
        for i in 1..=PREFETCH_MAX {
            let next = VirtAddr::new_truncate(
                addr.wrapping_add((inner.hint.stride.wrapping_mul(i as i64)) as u64),
            );
            if !vma.contains(next) {
                break;
            }
            let next_page = Page::containing_address(next);
            if walker.entry(next_page).is_some() {
                continue;
            }
            // Atomic allocation: prefetch must not trigger reclaim.
            let Ok(frame) = self.pmm.allocate(
                AllocRequest::order(0)
                    .with_flags(AllocFlags::ZEROED | AllocFlags::ATOMIC)
                    .tagged(AllocTag::USER),
                self.dm,
            ) else {
                break;
            };
            let mut alloc = AddressSpace::table_alloc(self.pmm, self.dm);
            match walker.map(next_page, frame, flags, &mut alloc) {
                Ok(flush) => {
                    flush.ignore();
                    inner.stats.resident += 1;
                    mapped += 1;
                }
                Err(_) => {
                    // SAFETY: Nothing maps `frame`.
                    unsafe { self.pmm.release(frame, self.dm) };
                    break;
                }
            }
        }
        if mapped > 0 {
            kdebug!(
                "fault: prefetched {mapped} pages after stride {:#x} run",
                inner.hint.stride
            );
        }
    }

    /// Builds the escalated verdict, dumping diagnostics for fatal
    /// kernel-mode faults.
    fn escalate(
        &self,
        reason: Escalation,
        info: &mut PageFaultInfo,
        space: &AddressSpace,
    ) -> FaultVerdict {
        info.elapsed = time::ticks().saturating_sub(info.started);
        let fatal = info.context == ExecContext::Kernel;
        if fatal {
            // Best-effort state dump before the dispatcher halts.
            kfatal!(
                "unrecoverable kernel page fault: {reason} at {:#x} (code {:?}, as{}, class {:?})",
                info.addr,
                info.code,
                space.id(),
                info.class
            );
        } else {
            kdebug!(
                "fault: escalating {reason} at {:#x} (as{})",
                info.addr,
                space.id()
            );
        }
        FaultVerdict::Escalated {
            reason,
            fatal,
            info: *info,
        }
    }
}
