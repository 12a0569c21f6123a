//! Higher-level synchronization primitives.
//!
//! [`Mutex`] and [`RwLock`] are built on the platform's futex-shaped
//! [`RawMutex`](crate::platform::RawMutex) rather than on host OS locks
//! directly, so that the whole core stays behind the platform boundary. The
//! mutex follows the classic three-state (unlocked / locked / contended)
//! futex protocol; the rwlock packs a reader count and writer bit into one
//! atomic word.

use crate::platform;

mod mutex;
mod rwlock;

pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A convenience name for the platform requirements of these primitives.
pub trait RawSyncPrimitivesProvider: platform::RawMutexProvider + Sync + 'static {}
impl<Platform> RawSyncPrimitivesProvider for Platform where
    Platform: platform::RawMutexProvider + Sync + 'static
{
}
