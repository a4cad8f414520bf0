//! Monotonic tick source.
//!
//! The memory manager records last-access times on frames and fault
//! resolution timing, but has no clock of its own. The architecture layer
//! registers one at boot; until then [`ticks`] reads zero, which keeps
//! host tests deterministic.

use core::sync::atomic::{AtomicPtr, Ordering};

/// The signature of the global tick source.
pub type ClockFn = fn() -> u64;

fn null_clock() -> u64 {
    0
}

static CLOCK_FN: AtomicPtr<()> = AtomicPtr::new(null_clock as *mut ());

/// Registers the global monotonic tick source.
///
/// # Safety
///
/// The provided function must be safe to call from any context, including
/// fault handlers, and must be monotonic.
pub unsafe fn set_clock_fn(f: ClockFn) {
    CLOCK_FN.store(f as *mut (), Ordering::Release);
}

/// Returns the current monotonic tick count (zero before registration).
pub fn ticks() -> u64 {
    let ptr = CLOCK_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `ClockFn` pointers (or the initial `null_clock`)
    // are ever stored into CLOCK_FN.
    let f: ClockFn = unsafe { core::mem::transmute(ptr) };
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_clock_reads_zero() {
        assert_eq!(ticks(), 0);
    }
}
