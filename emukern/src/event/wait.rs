// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Support infrastructure for interruptible waits.
//!
//! Waits taken through [`sync`](crate::sync) locks are short and guaranteed
//! to finish, so they are not interruptible. Waits on guest-controlled
//! conditions (a child becoming a zombie, a sleep deadline, an advisory
//! file lock, a poll set) may never complete, and must be cancellable by
//! process teardown or an incoming signal. This module provides the
//! infrastructure for such waits.
//!
//! One [`WaitState`] exists per execution unit. A [`WaitContext`] borrowed
//! from it performs the actual waits, optionally with a deadline and an
//! interrupt predicate; a [`Waker`] cloned from the context lets other units
//! wake the waiter to re-evaluate its condition; a [`ThreadHandle`]
//! interrupts the unit in *any* state, including while it is executing guest
//! code. The state machine transitions to `WAITING` *before* the condition
//! is evaluated, so a wake racing the evaluation is observed rather than
//! lost; blocking `wait` relies on that ordering.

use alloc::sync::Arc;
use core::{marker::PhantomData, sync::atomic::Ordering};

use crate::{
    platform::{
        ImmediatelyWokenUp, Instant as _, RawMutex, ThreadProvider, TimeProvider,
        UnblockedOrTimedOut,
    },
    sync::RawSyncPrimitivesProvider,
};
use thiserror::Error;

/// The wait state for one execution unit.
///
/// Tracks whether the unit is running in the host, blocked, or running guest
/// code, and provides the ability to wait, be woken, and be interrupted.
/// Meant to be stored in the per-unit task object and used for all of that
/// unit's waits.
pub struct WaitState<Platform: RawSyncPrimitivesProvider> {
    waker: Waker<Platform>,
    /// `Send` but deliberately not `Sync`: only the owning unit waits on it.
    _phantom: PhantomData<core::cell::Cell<()>>,
}

struct WaitStateInner<Platform: RawSyncPrimitivesProvider> {
    platform: &'static Platform,
    condvar: Platform::RawMutex,
}

/// A cross-thread handle that wakes a unit blocked in
/// [`WaitContext::wait_until`] so it re-evaluates its condition.
///
/// Does not interrupt guest execution; for that, use
/// [`ThreadHandle::interrupt`].
pub struct Waker<Platform: RawSyncPrimitivesProvider>(Arc<WaitStateInner<Platform>>);

impl<Platform: RawSyncPrimitivesProvider> Clone for Waker<Platform> {
    fn clone(&self) -> Self {
        Waker(self.0.clone())
    }
}

impl<Platform: RawSyncPrimitivesProvider> Waker<Platform> {
    /// Wakes the owning unit if it is blocked in a wait.
    pub fn wake(&self) {
        self.0.wake();
    }
}

impl<Platform: RawSyncPrimitivesProvider> WaitState<Platform> {
    /// Creates a new wait state. One per execution unit.
    pub fn new(platform: &'static Platform) -> Self {
        Self {
            waker: Waker(Arc::new(WaitStateInner {
                platform,
                condvar: <Platform::RawMutex as RawMutex>::INIT,
            })),
            _phantom: PhantomData,
        }
    }

    /// Returns a wait context for performing interruptible waits.
    pub fn context(&self) -> WaitContext<'_, Platform>
    where
        Platform: TimeProvider,
    {
        WaitContext::new(&self.waker)
    }

    /// Returns a handle that can interrupt this unit whether it is waiting
    /// or running guest code.
    pub fn thread_handle(&self) -> ThreadHandle<Platform>
    where
        Platform: ThreadProvider,
    {
        ThreadHandle {
            waker: self.waker.clone(),
            thread: self.waker.0.platform.current_thread(),
        }
    }

    /// Moves the unit into the running-in-guest state, then calls `f` to
    /// check whether the guest should actually run (pending signals, exit
    /// requests). After `f` fires, [`ThreadHandle::interrupt`] interrupts
    /// guest execution rather than a wait.
    ///
    /// If this returns `true`, [`finish_running_guest`]
    /// (Self::finish_running_guest) must be called before the wait state is
    /// used again.
    ///
    /// # Panics
    ///
    /// Panics if the unit is not in the running-in-host state.
    #[must_use]
    pub fn prepare_to_run_guest(&self, f: impl FnOnce() -> bool) -> bool {
        assert_eq!(
            self.waker.0.state_for_assert(),
            ThreadState::RUNNING_IN_HOST
        );
        self.waker
            .0
            .set_state(ThreadState::RUNNING_IN_GUEST, Ordering::SeqCst);
        let ready = f();
        if !ready {
            self.waker
                .0
                .set_state(ThreadState::RUNNING_IN_HOST, Ordering::Relaxed);
        }
        ready
    }

    /// Returns the unit to the running-in-host state after guest execution.
    ///
    /// # Panics
    ///
    /// Panics without a prior successful
    /// [`prepare_to_run_guest`](Self::prepare_to_run_guest).
    pub fn finish_running_guest(&self) {
        let state = self.waker.0.state_for_assert();
        assert!(
            state == ThreadState::RUNNING_IN_GUEST || state == ThreadState::INTERRUPTED_GUEST,
            "{state:?}"
        );
        self.waker
            .0
            .set_state(ThreadState::RUNNING_IN_HOST, Ordering::Relaxed);
    }
}

impl<Platform: RawSyncPrimitivesProvider> WaitStateInner<Platform> {
    /// Wakes the unit if it is waiting (not if it is running guest code).
    fn wake(&self) {
        let condvar = &self.condvar;
        let v = condvar.underlying_atomic().fetch_update(
            Ordering::Release,
            Ordering::Relaxed,
            |state| match ThreadState(state) {
                ThreadState::RUNNING_IN_HOST
                | ThreadState::WOKEN
                | ThreadState::RUNNING_IN_GUEST
                | ThreadState::INTERRUPTED_GUEST => None,
                ThreadState::WAITING => Some(ThreadState::WOKEN.0),
                state => unreachable!("{state:?}"),
            },
        );
        match v.map(ThreadState) {
            Ok(ThreadState::WAITING) => {
                condvar.wake_one();
            }
            Ok(state) => unreachable!("{state:?}"),
            Err(_) => {
                // Keep the release ordering consistent even when nothing was
                // woken.
                core::sync::atomic::fence(Ordering::Release);
            }
        }
    }

    fn state_for_assert(&self) -> ThreadState {
        ThreadState(self.condvar.underlying_atomic().load(Ordering::Relaxed))
    }

    fn set_state(&self, new_state: ThreadState, ordering: Ordering) {
        self.condvar
            .underlying_atomic()
            .store(new_state.0, ordering);
    }
}

/// A handle that interrupts one execution unit in any state.
pub struct ThreadHandle<Platform: RawSyncPrimitivesProvider + ThreadProvider> {
    waker: Waker<Platform>,
    thread: Platform::ThreadHandle,
}

impl<Platform: RawSyncPrimitivesProvider + ThreadProvider> Clone for ThreadHandle<Platform> {
    fn clone(&self) -> Self {
        Self {
            waker: self.waker.clone(),
            thread: self.thread.clone(),
        }
    }
}

impl<Platform: RawSyncPrimitivesProvider + ThreadProvider> ThreadHandle<Platform> {
    /// Interrupts the unit. A waiting unit is woken to re-evaluate its wait
    /// and interrupt conditions; a unit running guest code is kicked back
    /// into the shim through the platform.
    pub fn interrupt(&self) {
        let condvar = &self.waker.0.condvar;
        let v = condvar.underlying_atomic().fetch_update(
            Ordering::Release,
            Ordering::Relaxed,
            |state| match ThreadState(state) {
                ThreadState::RUNNING_IN_HOST
                | ThreadState::WOKEN
                | ThreadState::INTERRUPTED_GUEST => None,
                ThreadState::WAITING => Some(ThreadState::WOKEN.0),
                ThreadState::RUNNING_IN_GUEST => Some(ThreadState::INTERRUPTED_GUEST.0),
                state => unreachable!("{state:?}"),
            },
        );
        match v.map(ThreadState) {
            Ok(ThreadState::WAITING) => {
                condvar.wake_one();
            }
            Ok(ThreadState::RUNNING_IN_GUEST) => {
                self.waker.0.platform.interrupt_thread(&self.thread);
            }
            Ok(state) => unreachable!("{state:?}"),
            Err(_) => {
                core::sync::atomic::fence(Ordering::Release);
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct ThreadState(u32);

impl ThreadState {
    /// Running in the host/shim (including non-interruptible lock waits).
    const RUNNING_IN_HOST: Self = Self(0);
    /// Blocked in [`WaitContext::wait_until`].
    const WAITING: Self = Self(1);
    /// Woken; must re-evaluate its wait condition.
    const WOKEN: Self = Self(2);
    /// Executing guest code (or transitioning to/from it).
    const RUNNING_IN_GUEST: Self = Self(3);
    /// Executing guest code with a pending interrupt; will re-enter the shim
    /// as soon as possible.
    const INTERRUPTED_GUEST: Self = Self(4);
}

impl core::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let v = match *self {
            Self::RUNNING_IN_HOST => "RUNNING_IN_HOST",
            Self::WAITING => "WAITING",
            Self::WOKEN => "WOKEN",
            Self::RUNNING_IN_GUEST => "RUNNING_IN_GUEST",
            Self::INTERRUPTED_GUEST => "INTERRUPTED_GUEST",
            Self(v) => return write!(f, "UNKNOWN({v})"),
        };
        f.write_str(v)
    }
}

/// A context object used to perform interruptible waits, created from a
/// [`WaitState`] and optionally augmented with a deadline and an interrupt
/// predicate.
pub struct WaitContext<'a, Platform: RawSyncPrimitivesProvider + TimeProvider> {
    waker: &'a Waker<Platform>,
    deadline: Option<Platform::Instant>,
    check_interrupt: &'a dyn CheckForInterrupt,
    // Only usable by the unit that created it.
    _phantom: PhantomData<*mut ()>,
}

/// Predicate deciding whether a wait should be abandoned.
pub trait CheckForInterrupt {
    /// Called each time the wait is about to block; returning `true` makes
    /// the wait fail with [`WaitError::Interrupted`].
    fn check_for_interrupt(&self) -> bool;
}

struct NeverInterrupt;

impl CheckForInterrupt for NeverInterrupt {
    fn check_for_interrupt(&self) -> bool {
        false
    }
}

impl<'a, Platform: RawSyncPrimitivesProvider + TimeProvider> WaitContext<'a, Platform> {
    fn new(waker: &'a Waker<Platform>) -> WaitContext<'a, Platform> {
        WaitContext {
            waker,
            deadline: None,
            check_interrupt: &NeverInterrupt,
            _phantom: PhantomData,
        }
    }

    /// Returns a context using the given interrupt predicate (replacing any
    /// existing one).
    #[must_use]
    pub fn with_check_for_interrupt(&self, f: &'a dyn CheckForInterrupt) -> Self {
        Self {
            check_interrupt: f,
            ..*self
        }
    }

    /// Returns a context whose deadline is `timeout` from now. An existing
    /// earlier deadline, or a `None` timeout, leaves the context unchanged.
    #[must_use]
    pub fn with_timeout(&self, timeout: impl Into<Option<core::time::Duration>>) -> Self {
        // Overflow of the deadline computation means "effectively forever".
        if let Some(deadline) = timeout
            .into()
            .and_then(|timeout| self.waker.0.platform.now().checked_add(timeout))
        {
            self.with_deadline(deadline)
        } else {
            Self { ..*self }
        }
    }

    /// Returns a context with the given deadline, keeping an existing
    /// earlier one.
    #[must_use]
    pub fn with_deadline(&self, deadline: impl Into<Option<Platform::Instant>>) -> Self {
        let mut this = Self { ..*self };
        if let Some(deadline) = deadline.into()
            && self.deadline.is_none_or(|d| deadline < d)
        {
            this.deadline = Some(deadline);
        }
        this
    }

    /// The remaining time before the deadline, if one is set.
    pub fn remaining_timeout(&self) -> Option<core::time::Duration> {
        self.deadline.and_then(|deadline| {
            let now = self.waker.0.platform.now();
            deadline.checked_duration_since(&now)
        })
    }

    /// Moves the unit into the waiting state. Must precede condition
    /// evaluation so wakeups cannot be missed.
    fn start_wait(&self) {
        self.waker
            .0
            .set_state(ThreadState::WAITING, Ordering::SeqCst);
    }

    fn end_wait(&self) {
        self.waker
            .0
            .set_state(ThreadState::RUNNING_IN_HOST, Ordering::Relaxed);
    }

    /// Checks timeout and interrupt, then actually blocks. `start_wait` must
    /// already have run and the wait condition have been evaluated.
    fn commit_wait(&self) -> Result<(), WaitError> {
        // Timeout outranks interrupt so an expired sleep reports `TimedOut`
        // even with a signal pending.
        let timeout = if self.deadline.is_some() {
            Some(self.remaining_timeout().ok_or(WaitError::TimedOut)?)
        } else {
            None
        };
        if self.check_interrupt.check_for_interrupt() {
            return Err(WaitError::Interrupted);
        }

        if let Some(timeout) = timeout {
            let r = self
                .waker
                .0
                .condvar
                .block_or_timeout(ThreadState::WAITING.0, timeout);
            match r {
                Ok(UnblockedOrTimedOut::Unblocked) | Err(ImmediatelyWokenUp) => Ok(()),
                Ok(UnblockedOrTimedOut::TimedOut) => Err(WaitError::TimedOut),
            }
        } else {
            let _ = self.waker.0.condvar.block(ThreadState::WAITING.0);
            Ok(())
        }
    }

    /// Sleeps until interrupted or timed out. With no deadline, sleeps until
    /// interrupted. An already-expired deadline returns `TimedOut`
    /// immediately, even with an interrupt pending.
    pub fn sleep(&self) -> WaitError {
        self.wait_until(|| false).unwrap_err()
    }

    /// Waits until `ready` returns `true`.
    ///
    /// `ready` runs once before the unit sleeps and again on every wakeup;
    /// the caller must arrange wakeups via [`Waker::wake`] or
    /// [`ThreadHandle::interrupt`].
    ///
    /// # Panics
    ///
    /// Panics if the unit is not in the running state (recursive waits, or a
    /// missing [`WaitState::finish_running_guest`]).
    pub fn wait_until(&self, mut ready: impl FnMut() -> bool) -> Result<(), WaitError> {
        assert_eq!(
            self.waker.0.state_for_assert(),
            ThreadState::RUNNING_IN_HOST
        );
        let _end_wait = crate::utils::defer(|| self.end_wait());
        loop {
            self.start_wait();
            if ready() {
                break Ok(());
            }
            self.commit_wait()?;
        }
    }

    /// Returns the waker associated with this context.
    pub fn waker(&self) -> &Waker<Platform> {
        self.waker
    }
}

/// An error that can occur during a wait.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("wait was interrupted")]
    Interrupted,
    #[error("wait timed out")]
    TimedOut,
}
