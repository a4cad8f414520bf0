//! Synchronization primitives for the kernel.
//!
//! Provides [`SpinLock`] and [`RwLock`] suitable for use in `static`
//! items and usable before any allocator or scheduler is available.

mod rwlock;
mod spinlock;

pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
