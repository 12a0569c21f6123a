//! Mutual exclusion.

use core::cell::UnsafeCell;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::platform::RawMutex as _;

use super::RawSyncPrimitivesProvider;

/// A spin-then-block wrapper around the platform raw mutex.
///
/// Atomic states: 0 unlocked, 1 locked, 2 locked with waiters.
struct SpinEnabledRawMutex<Platform: RawSyncPrimitivesProvider> {
    raw: Platform::RawMutex,
}

impl<Platform: RawSyncPrimitivesProvider> SpinEnabledRawMutex<Platform> {
    #[inline]
    const fn new() -> Self {
        Self {
            raw: <Platform::RawMutex as crate::platform::RawMutex>::INIT,
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.raw
            .underlying_atomic()
            .compare_exchange(0, 1, Acquire, Relaxed)
            .is_ok()
    }

    #[inline]
    fn lock(&self) {
        if !self.try_lock() {
            self.lock_contended();
        }
    }

    #[cold]
    fn lock_contended(&self) {
        let mut state = self.spin();

        if state == 0 {
            match self
                .raw
                .underlying_atomic()
                .compare_exchange(0, 1, Acquire, Relaxed)
            {
                Ok(_) => return,
                Err(s) => state = s,
            }
        }

        loop {
            // Mark contended; a transition from 0 means we took the lock.
            if state != 2 && self.raw.underlying_atomic().swap(2, Acquire) == 0 {
                return;
            }

            // Block while still contended. Non-interruptible by design.
            let _ = self.raw.block(2);

            state = self.spin();
        }
    }

    /// Spin briefly in case the holder releases quickly. Returns the state
    /// once it is unlocked (0), contended (2), or the spin count runs out.
    fn spin(&self) -> u32 {
        let mut spin = 100;
        loop {
            let state = self.raw.underlying_atomic().load(Relaxed);
            if state != 1 || spin == 0 {
                return state;
            }
            core::hint::spin_loop();
            spin -= 1;
        }
    }

    /// # Safety
    ///
    /// Must be paired with a successful `lock`/`try_lock` on this thread.
    #[inline]
    unsafe fn unlock(&self) {
        if self.raw.underlying_atomic().swap(0, Release) == 2 {
            // Wake one waiter; it re-marks the lock contended on acquisition
            // so the remaining waiters are not stranded.
            self.raw.wake_one();
        }
    }
}

/// A mutual exclusion primitive, roughly analogous to `std::sync::Mutex`
/// but without poisoning: [`lock`](Mutex::lock) returns the guard directly.
pub struct Mutex<Platform: RawSyncPrimitivesProvider, T: ?Sized> {
    raw: SpinEnabledRawMutex<Platform>,
    data: UnsafeCell<T>,
}

// SAFETY: `Mutex<T>` inherits `Send` from `T`.
unsafe impl<Platform: RawSyncPrimitivesProvider, T: Send> Send for Mutex<Platform, T> {}
// SAFETY: access to `T` is mutually exclusive.
unsafe impl<Platform: RawSyncPrimitivesProvider, T: Send> Sync for Mutex<Platform, T> {}

impl<Platform: RawSyncPrimitivesProvider, T> Mutex<Platform, T> {
    /// Returns a new mutex wrapping the given value.
    #[inline]
    pub const fn new(val: T) -> Self {
        Self {
            raw: SpinEnabledRawMutex::new(),
            data: UnsafeCell::new(val),
        }
    }

    /// Acquires the mutex, blocking until it is available.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, Platform, T> {
        self.raw.lock();
        MutexGuard { mutex: self }
    }

    /// Returns a mutable reference to the underlying data; safe because
    /// `&mut self` proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: `&mut self` excludes all other access.
        unsafe { &mut *self.data.get() }
    }

    /// Consumes the mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// RAII guard returned by [`Mutex::lock`]; the lock is released on drop.
pub struct MutexGuard<'a, Platform: RawSyncPrimitivesProvider, T: ?Sized + 'a> {
    mutex: &'a Mutex<Platform, T>,
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> core::ops::Deref
    for MutexGuard<'_, Platform, T>
{
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means exclusive access.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> core::ops::DerefMut
    for MutexGuard<'_, Platform, T>
{
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means exclusive access.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> Drop for MutexGuard<'_, Platform, T> {
    fn drop(&mut self) {
        // SAFETY: the guard was created by a successful lock.
        unsafe {
            self.mutex.raw.unlock();
        }
    }
}
