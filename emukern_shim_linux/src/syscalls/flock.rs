//! Advisory whole-file locks (`flock`).
//!
//! Locks are owned by the open-file description, so descriptors produced by
//! `dup` or inherited across `fork` share one lock. State is keyed by the
//! host file identity; waiters park on their task's wait state and are woken
//! on every release to re-evaluate.

use alloc::sync::Arc;
use alloc::vec::Vec;

use emukern::event::wait::Waker;
use emukern::platform::FileIdentity;
use emukern::sync::Mutex;
use hashbrown::HashMap;

use emukern_common_linux::{FlockOp, errno::Errno};

use crate::{KernelPlatform, Task};

/// An open-file description's lock identity.
pub(crate) type LockOwner = usize;

pub(crate) struct FlockTable<P: KernelPlatform> {
    inner: Mutex<P, HashMap<FileIdentity, FlockState<P>>>,
}

struct FlockState<P: KernelPlatform> {
    exclusive: Option<LockOwner>,
    shared: Vec<LockOwner>,
    waiters: Vec<Waker<P>>,
}

impl<P: KernelPlatform> FlockState<P> {
    fn new() -> Self {
        Self {
            exclusive: None,
            shared: Vec::new(),
            waiters: Vec::new(),
        }
    }

    fn remove_owner(&mut self, owner: LockOwner) -> bool {
        let mut changed = false;
        if self.exclusive == Some(owner) {
            self.exclusive = None;
            changed = true;
        }
        let before = self.shared.len();
        self.shared.retain(|&o| o != owner);
        changed |= self.shared.len() != before;
        changed
    }

    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty() && self.waiters.is_empty()
    }
}

impl<P: KernelPlatform> FlockTable<P> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// One acquisition attempt. On conflict, registers `waker` (when
    /// given) so the caller is woken at the next release.
    ///
    /// Converting between shared and exclusive first drops the owner's
    /// existing lock, matching the documented `flock` conversion race.
    pub(crate) fn try_lock(
        &self,
        id: FileIdentity,
        owner: LockOwner,
        exclusive: bool,
        waker: Option<&Waker<P>>,
    ) -> bool {
        let mut table = self.inner.lock();
        let state = table.entry(id).or_insert_with(FlockState::new);
        state.remove_owner(owner);
        let granted = if exclusive {
            state.exclusive.is_none() && state.shared.is_empty()
        } else {
            state.exclusive.is_none()
        };
        if granted {
            if exclusive {
                state.exclusive = Some(owner);
            } else {
                state.shared.push(owner);
            }
        } else if let Some(waker) = waker {
            state.waiters.push(waker.clone());
        }
        granted
    }

    /// Releases whatever lock `owner` holds on `id` and wakes the waiters.
    pub(crate) fn release_owner(&self, id: FileIdentity, owner: LockOwner) {
        let waiters = {
            let mut table = self.inner.lock();
            let Some(state) = table.get_mut(&id) else {
                return;
            };
            if !state.remove_owner(owner) {
                return;
            }
            let waiters = core::mem::take(&mut state.waiters);
            if state.is_free() {
                table.remove(&id);
            }
            waiters
        };
        for waiter in waiters {
            waiter.wake();
        }
    }
}

impl<P: KernelPlatform> Task<P> {
    pub(crate) fn sys_flock(&self, fd: i32, op: FlockOp) -> Result<(), Errno> {
        let file = self.fd_file(fd)?;
        let nonblocking = op.contains(FlockOp::LOCK_NB);
        let mode = op & !FlockOp::LOCK_NB;

        let exclusive = match mode {
            FlockOp::LOCK_UN => {
                self.global
                    .flocks
                    .release_owner(file.identity, file.lock_owner());
                return Ok(());
            }
            FlockOp::LOCK_SH => false,
            FlockOp::LOCK_EX => true,
            // Exactly one of SH/EX/UN must be present.
            _ => return Err(Errno::EINVAL),
        };

        let id = file.identity;
        let owner = file.lock_owner();
        if nonblocking {
            if self.global.flocks.try_lock(id, owner, exclusive, None) {
                Ok(())
            } else {
                Err(Errno::EWOULDBLOCK)
            }
        } else {
            let cx = self.wait_cx();
            let waker = cx.waker().clone();
            match cx.wait_until(|| {
                self.global
                    .flocks
                    .try_lock(id, owner, exclusive, Some(&waker))
            }) {
                Ok(()) => Ok(()),
                Err(_) => Err(Errno::EINTR),
            }
        }
    }
}
