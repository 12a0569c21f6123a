//! Reader-writer locks.

use core::cell::UnsafeCell;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::platform::RawMutex as _;

use super::RawSyncPrimitivesProvider;

/// Writer-held marker bit.
const WRITER: u32 = 1 << 31;
/// Set while any thread is blocked on the lock.
const CONTENDED: u32 = 1 << 30;
/// Low bits carry the active reader count.
const READER_MASK: u32 = CONTENDED - 1;

/// A reader-writer lock over the platform raw mutex.
///
/// One atomic word carries the reader count, a writer bit, and a contended
/// bit; releases that observe the contended bit clear it and wake every
/// waiter, which then re-evaluates. Concurrent readers proceed in parallel;
/// writers are exclusive against both readers and writers.
pub struct RwLock<Platform: RawSyncPrimitivesProvider, T: ?Sized> {
    raw: Platform::RawMutex,
    data: UnsafeCell<T>,
}

// SAFETY: `RwLock<T>` inherits `Send` from `T`.
unsafe impl<Platform: RawSyncPrimitivesProvider, T: Send> Send for RwLock<Platform, T> {}
// SAFETY: readers only share `&T`; writers are exclusive.
unsafe impl<Platform: RawSyncPrimitivesProvider, T: Send + Sync> Sync for RwLock<Platform, T> {}

impl<Platform: RawSyncPrimitivesProvider, T> RwLock<Platform, T> {
    /// Returns a new rwlock wrapping the given value.
    #[inline]
    pub const fn new(val: T) -> Self {
        Self {
            raw: <Platform::RawMutex as crate::platform::RawMutex>::INIT,
            data: UnsafeCell::new(val),
        }
    }

    /// Consumes the lock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> RwLock<Platform, T> {
    /// Acquires shared read access, blocking while a writer holds the lock.
    pub fn read(&self) -> RwLockReadGuard<'_, Platform, T> {
        let atomic = self.raw.underlying_atomic();
        loop {
            let state = atomic.load(Relaxed);
            if state & WRITER == 0 {
                debug_assert!(state & READER_MASK < READER_MASK);
                if atomic
                    .compare_exchange_weak(state, state + 1, Acquire, Relaxed)
                    .is_ok()
                {
                    return RwLockReadGuard { lock: self };
                }
                continue;
            }
            self.block_on(state);
        }
    }

    /// Acquires exclusive write access, blocking until no reader or writer
    /// holds the lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, Platform, T> {
        let atomic = self.raw.underlying_atomic();
        loop {
            let state = atomic.load(Relaxed);
            if state & (WRITER | READER_MASK) == 0 {
                if atomic
                    .compare_exchange_weak(state, state | WRITER, Acquire, Relaxed)
                    .is_ok()
                {
                    return RwLockWriteGuard { lock: self };
                }
                continue;
            }
            self.block_on(state);
        }
    }

    /// Marks the lock contended and blocks until the state changes.
    fn block_on(&self, observed: u32) {
        let atomic = self.raw.underlying_atomic();
        let target = observed | CONTENDED;
        if observed & CONTENDED == 0
            && atomic
                .compare_exchange(observed, target, Relaxed, Relaxed)
                .is_err()
        {
            // State moved underneath us; re-evaluate instead of sleeping.
            return;
        }
        let _ = self.raw.block(target);
    }

    /// Clears the contended bit and wakes every waiter to re-evaluate.
    fn release_waiters(&self) {
        self.raw.underlying_atomic().fetch_and(!CONTENDED, Relaxed);
        self.raw.wake_all();
    }

    fn unlock_read(&self) {
        let prev = self.raw.underlying_atomic().fetch_sub(1, Release);
        debug_assert!(prev & READER_MASK >= 1);
        if prev & READER_MASK == 1 && prev & CONTENDED != 0 {
            self.release_waiters();
        }
    }

    fn unlock_write(&self) {
        let atomic = self.raw.underlying_atomic();
        let prev = atomic.fetch_and(!WRITER, Release);
        debug_assert!(prev & WRITER != 0);
        if prev & CONTENDED != 0 {
            self.release_waiters();
        }
    }

    /// Returns a mutable reference to the underlying data; safe because
    /// `&mut self` proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: `&mut self` excludes all other access.
        unsafe { &mut *self.data.get() }
    }
}

/// RAII guard for shared access; released on drop.
pub struct RwLockReadGuard<'a, Platform: RawSyncPrimitivesProvider, T: ?Sized + 'a> {
    lock: &'a RwLock<Platform, T>,
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> core::ops::Deref
    for RwLockReadGuard<'_, Platform, T>
{
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: reader guards only exist while no writer holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> Drop for RwLockReadGuard<'_, Platform, T> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

/// RAII guard for exclusive access; released on drop.
pub struct RwLockWriteGuard<'a, Platform: RawSyncPrimitivesProvider, T: ?Sized + 'a> {
    lock: &'a RwLock<Platform, T>,
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> core::ops::Deref
    for RwLockWriteGuard<'_, Platform, T>
{
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the writer guard is exclusive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> core::ops::DerefMut
    for RwLockWriteGuard<'_, Platform, T>
{
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the writer guard is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> Drop for RwLockWriteGuard<'_, Platform, T> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}
