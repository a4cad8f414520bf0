//! Spin-based reader-writer lock.
//!
//! Readers share the lock; a writer excludes everyone. Writers set a
//! pending bit before waiting so that a steady stream of readers cannot
//! starve them.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// Writer-held marker in the state word.
const WRITER: u32 = 1 << 31;
/// Writer-waiting marker; blocks new readers.
const WRITER_PENDING: u32 = 1 << 30;
/// Mask covering the reader count.
const READER_MASK: u32 = WRITER_PENDING - 1;

/// A spin-based reader-writer lock.
///
/// The state word packs a reader count with writer-held and
/// writer-pending bits. Const-constructable for use in `static` items.
pub struct RwLock<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: The RwLock hands out shared references only while no writer is
// active and an exclusive reference only while nothing else holds the lock.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new unlocked `RwLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock for shared read access, spinning while a writer
    /// holds or awaits it.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & (WRITER | WRITER_PENDING) == 0 {
                if self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return RwLockReadGuard { lock: self };
                }
            } else {
                core::hint::spin_loop();
            }
        }
    }

    /// Acquires the lock for exclusive write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            // Announce intent so the reader stream drains. Re-announced every
            // iteration because a releasing writer clears the whole word.
            self.state.fetch_or(WRITER_PENDING, Ordering::Relaxed);
            if self
                .state
                .compare_exchange_weak(
                    WRITER_PENDING,
                    WRITER,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return RwLockWriteGuard { lock: self };
            }
            core::hint::spin_loop();
        }
    }

    /// Attempts to acquire read access without blocking.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let state = self.state.load(Ordering::Relaxed);
        if state & (WRITER | WRITER_PENDING) != 0 {
            return None;
        }
        self.state
            .compare_exchange(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwLockReadGuard { lock: self })
    }

    /// Attempts to acquire write access without blocking.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwLockWriteGuard { lock: self })
    }
}

/// RAII guard for shared read access.
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Readers exclude writers while any guard exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        debug_assert!(self.lock.state.load(Ordering::Relaxed) & READER_MASK > 0);
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

/// RAII guard for exclusive write access.
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The write guard guarantees exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The write guard guarantees exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_readers() {
        let lock = RwLock::new(5);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 10);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = RwLock::new(5);
        let guard = lock.write();
        assert!(lock.try_read().is_none());
        assert!(lock.try_write().is_none());
        drop(guard);
        assert!(lock.try_read().is_some());
    }

    #[test]
    fn reader_excludes_writer() {
        let lock = RwLock::new(5);
        let guard = lock.read();
        assert!(lock.try_write().is_none());
        drop(guard);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn write_then_read_sees_value() {
        let lock = RwLock::new(0);
        *lock.write() = 7;
        assert_eq!(*lock.read(), 7);
    }

    #[test]
    fn concurrent_read_write() {
        use std::sync::Arc;

        let lock = Arc::new(RwLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    *lock.write() += 1;
                }
            }));
        }
        for _ in 0..2 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let value = *lock.read();
                    assert!(value <= 1000);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.read(), 1000);
    }
}
