// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Process/thread records, the process table, and the lifecycle syscalls:
//! fork/vfork/clone, execve, exit/exit_group, the wait family, identity
//! calls, and signal bookkeeping.
//!
//! Lock ordering: the process table lock is always taken before any
//! record's `inner` mutex, and two `inner` mutexes are never held at once.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use emukern::event::wait::{ThreadHandle, Waker};
use emukern::sync::{Mutex, RwLock};
use hashbrown::{HashMap, HashSet};

use emukern_common_linux::{
    Addr, CloneFlags, PATH_MAX, Pid, SigSet, Signal, WaitOptions, errno::Errno, wstatus,
};

use crate::{
    Control, GlobalState, KernelPlatform, Space, StartContext, Task, TaskParams,
    syscalls::file::{FilesState, FsState},
};

/// The process every orphan is reparented to.
pub(crate) const REAPER_PID: Pid = 1;

/// Highest pid before allocation wraps.
const PID_MAX: Pid = 0x8000;

/// Length of the command-name buffer, terminator included.
pub const TASK_COMM_LEN: usize = 16;

/// Task credentials.
#[derive(Clone, Copy, Debug)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
}

/// How a process record left (or has not yet left) the running state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Running,
    /// Stopped by job control; resumable by `SIGCONT`.
    Stopped(Signal),
    /// Terminated; the status is retained until the parent reaps it.
    Zombie(ExitStatus),
}

/// A terminated process's status, as `wait` reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
}

impl ExitStatus {
    /// The guest `wstatus` encoding.
    pub fn wstatus(self) -> u32 {
        match self {
            ExitStatus::Exited(code) => wstatus::exited(code),
            ExitStatus::Signaled(sig) => wstatus::signaled(sig.as_i32()),
        }
    }
}

/// A job-control event the parent has not yet consumed via `wait`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum JobEvent {
    Stopped(Signal),
    Continued,
}

/// `ITIMER_REAL` state.
pub(crate) struct ItimerReal<I> {
    pub(crate) expires: I,
    pub(crate) interval: Option<core::time::Duration>,
}

/// One process/thread record.
///
/// Every schedulable guest execution unit has one record; members of a
/// thread group share a `tgid` (and, per clone flags, the address space and
/// descriptor tables reached through the `Arc`s here).
pub struct Process<P: KernelPlatform> {
    pid: Pid,
    tgid: Pid,
    pub(crate) mm: Mutex<P, Option<Arc<Space<P>>>>,
    pub(crate) files: Mutex<P, Option<Arc<FilesState<P>>>>,
    pub(crate) fs: Mutex<P, Option<Arc<FsState<P>>>>,
    credentials: Mutex<P, Credentials>,
    comm: Mutex<P, [u8; TASK_COMM_LEN]>,
    pub(crate) inner: Mutex<P, ProcessInner<P>>,
}

pub(crate) struct ProcessInner<P: KernelPlatform> {
    pub(crate) state: TaskState,
    pub(crate) ppid: Pid,
    pub(crate) pgid: Pid,
    pub(crate) sid: Pid,
    /// Direct (waitable) children, by pid. Thread-group siblings are not
    /// children.
    pub(crate) children: Vec<Pid>,
    pub(crate) pending: SigSet,
    pub(crate) blocked: SigSet,
    /// Set once something decided this task must die; the owning execution
    /// unit finalizes at its next guest boundary.
    pub(crate) exit_request: Option<ExitStatus>,
    /// Guards exit finalization so it runs exactly once.
    pub(crate) finalized: bool,
    pub(crate) job_event: Option<JobEvent>,
    /// The signal sent to the parent on exit (clone's CSIGNAL byte).
    pub(crate) exit_signal: Option<Signal>,
    pub(crate) set_child_tid: Option<Addr>,
    pub(crate) clear_child_tid: Option<Addr>,
    pub(crate) tls_ptr: Option<Addr>,
    /// Wakes a parent blocked in `vfork` when this child execs or exits.
    pub(crate) vfork_parent: Option<Waker<P>>,
    pub(crate) vfork_done: bool,
    /// Wakes this process when one of its children changes state.
    pub(crate) child_waiter: Option<Waker<P>>,
    /// Interrupts the execution unit backing this record.
    pub(crate) thread: Option<ThreadHandle<P>>,
    pub(crate) itimer_real: Option<ItimerReal<P::Instant>>,
}

/// Signals whose default disposition is to do nothing.
fn default_ignored(sig: Signal) -> bool {
    matches!(
        sig,
        Signal::SIGCHLD | Signal::SIGCONT | Signal::SIGURG | Signal::SIGWINCH
    )
}

impl<P: KernelPlatform> Process<P> {
    /// Builds the record for the initial process: fresh address space,
    /// empty descriptor table, its own session and process group.
    pub(crate) fn new_initial(
        global: &Arc<GlobalState<P>>,
        params: &TaskParams,
    ) -> Result<Arc<Self>, Errno> {
        let mm = Space::new(global.platform).map_err(|_| Errno::ENOMEM)?;
        Ok(Arc::new(Self {
            pid: params.pid,
            tgid: params.pid,
            mm: Mutex::new(Some(Arc::new(mm))),
            files: Mutex::new(Some(Arc::new(FilesState::new()))),
            fs: Mutex::new(Some(Arc::new(FsState::new()))),
            credentials: Mutex::new(Credentials {
                uid: params.uid,
                euid: params.euid,
                gid: params.gid,
                egid: params.egid,
            }),
            comm: Mutex::new([0; TASK_COMM_LEN]),
            inner: Mutex::new(ProcessInner {
                state: TaskState::Running,
                ppid: params.ppid,
                pgid: params.pid,
                sid: params.pid,
                children: Vec::new(),
                pending: SigSet::empty(),
                blocked: SigSet::empty(),
                exit_request: None,
                finalized: false,
                job_event: None,
                exit_signal: Some(Signal::SIGCHLD),
                set_child_tid: None,
                clear_child_tid: None,
                tls_ptr: None,
                vfork_parent: None,
                vfork_done: false,
                child_waiter: None,
                thread: None,
                itimer_real: None,
            }),
        }))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn tgid(&self) -> Pid {
        self.tgid
    }

    pub fn task_state(&self) -> TaskState {
        self.inner.lock().state
    }

    pub fn ppid(&self) -> Pid {
        self.inner.lock().ppid
    }

    pub fn pgid(&self) -> Pid {
        self.inner.lock().pgid
    }

    pub(crate) fn mm(&self) -> Option<Arc<Space<P>>> {
        self.mm.lock().clone()
    }

    pub(crate) fn files(&self) -> Arc<FilesState<P>> {
        self.files
            .lock()
            .clone()
            .expect("files accessed after exit")
    }

    pub(crate) fn fs(&self) -> Arc<FsState<P>> {
        self.fs.lock().clone().expect("fs accessed after exit")
    }

    pub(crate) fn credentials(&self) -> Credentials {
        *self.credentials.lock()
    }

    pub(crate) fn set_comm_from_path(&self, path: &str) {
        let base = path.rsplit('/').next().unwrap_or(path);
        let mut comm = [0u8; TASK_COMM_LEN];
        let n = base.len().min(TASK_COMM_LEN - 1);
        comm[..n].copy_from_slice(&base.as_bytes()[..n]);
        *self.comm.lock() = comm;
    }

    pub fn comm(&self) -> [u8; TASK_COMM_LEN] {
        *self.comm.lock()
    }

    pub(crate) fn set_thread_handle(&self, handle: ThreadHandle<P>) {
        self.inner.lock().thread = Some(handle);
    }

    pub(crate) fn is_exiting(&self) -> bool {
        self.inner.lock().exit_request.is_some()
    }

    /// Whether a pending, unblocked, non-ignored signal awaits delivery.
    pub(crate) fn has_deliverable_signal(&self) -> bool {
        let inner = self.inner.lock();
        let mut pending = inner.pending;
        loop {
            match pending.first_deliverable(&inner.blocked) {
                None => return false,
                Some(sig) if default_ignored(sig) => pending.remove(sig),
                Some(_) => return true,
            }
        }
    }

    /// Records that this task must die, and kicks its execution unit.
    pub(crate) fn request_exit(&self, status: ExitStatus) {
        let mut inner = self.inner.lock();
        if inner.exit_request.is_none() {
            inner.exit_request = Some(status);
        }
        let thread = inner.thread.clone();
        drop(inner);
        if let Some(thread) = thread {
            thread.interrupt();
        }
    }

    /// Applies a signal's immediate effect to this record and kicks the
    /// backing execution unit. Returns whether the parent should be told of
    /// a continue event.
    pub(crate) fn post_signal(&self, sig: Signal) -> bool {
        let mut inner = self.inner.lock();
        let mut continued = false;
        match sig {
            // SIGKILL cannot be blocked or handled.
            Signal::SIGKILL => {
                if inner.exit_request.is_none() {
                    inner.exit_request = Some(ExitStatus::Signaled(Signal::SIGKILL));
                }
            }
            // SIGCONT resumes a stopped task even before delivery.
            Signal::SIGCONT => {
                if let TaskState::Stopped(_) = inner.state {
                    inner.state = TaskState::Running;
                    inner.job_event = Some(JobEvent::Continued);
                    continued = true;
                }
                inner.pending.add(sig);
            }
            _ => inner.pending.add(sig),
        }
        let thread = inner.thread.clone();
        drop(inner);
        if let Some(thread) = thread {
            thread.interrupt();
        }
        continued
    }

    /// Called by a child (under the table lock) when it exits, stops, or
    /// continues: raises the child-exit signal and wakes any blocked wait.
    pub(crate) fn notify_child_event(&self, exit_signal: Option<Signal>) {
        let mut inner = self.inner.lock();
        inner.pending.add(exit_signal.unwrap_or(Signal::SIGCHLD));
        let waiter = inner.child_waiter.clone();
        drop(inner);
        if let Some(waiter) = waiter {
            waiter.wake();
        }
    }

    /// Releases a parent blocked in `vfork`, if any.
    pub(crate) fn complete_vfork(&self) {
        let mut inner = self.inner.lock();
        inner.vfork_done = true;
        let parent = inner.vfork_parent.take();
        drop(inner);
        if let Some(parent) = parent {
            parent.wake();
        }
    }

    /// Expires `ITIMER_REAL` into a pending `SIGALRM` when due.
    pub(crate) fn poll_itimer(&self, platform: &'static P) {
        use emukern::platform::{Instant as _, TimeProvider as _};
        let mut inner = self.inner.lock();
        let (expires, interval) = match &inner.itimer_real {
            Some(timer) => (timer.expires, timer.interval),
            None => return,
        };
        let now = platform.now();
        if now < expires {
            return;
        }
        // Periodic timers rearm; one-shot timers disarm.
        inner.itimer_real = interval.and_then(|iv| {
            now.checked_add(iv).map(|next| ItimerReal {
                expires: next,
                interval: Some(iv),
            })
        });
        inner.pending.add(Signal::SIGALRM);
    }
}

// ---------------------------------------------------------------------------
// Process table

/// The process-wide registry of live records, with secondary indices by
/// process group and thread group.
pub(crate) struct ProcessTable<P: KernelPlatform> {
    inner: RwLock<P, TableInner<P>>,
}

struct TableInner<P: KernelPlatform> {
    procs: HashMap<Pid, Arc<Process<P>>>,
    pgroups: HashMap<Pid, HashSet<Pid>>,
    tgroups: HashMap<Pid, HashSet<Pid>>,
    next_pid: Pid,
}

impl<P: KernelPlatform> ProcessTable<P> {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                procs: HashMap::new(),
                pgroups: HashMap::new(),
                tgroups: HashMap::new(),
                next_pid: 2,
            }),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().procs.len()
    }

    pub(crate) fn get(&self, pid: Pid) -> Option<Arc<Process<P>>> {
        self.inner.read().procs.get(&pid).cloned()
    }

    /// Allocates the next unused pid, wrapping at [`PID_MAX`].
    pub(crate) fn alloc_pid(&self) -> Pid {
        let mut inner = self.inner.write();
        loop {
            let pid = inner.next_pid;
            inner.next_pid = if pid >= PID_MAX { 2 } else { pid + 1 };
            if !inner.procs.contains_key(&pid) {
                return pid;
            }
        }
    }

    pub(crate) fn insert(&self, process: Arc<Process<P>>) {
        let mut inner = self.inner.write();
        let (pgid, tgid, pid) = {
            let p = process.inner.lock();
            (p.pgid, process.tgid, process.pid)
        };
        inner.pgroups.entry(pgid).or_default().insert(pid);
        inner.tgroups.entry(tgid).or_default().insert(pid);
        inner.procs.insert(pid, process);
    }

    /// Removes a record (reap, or silent thread exit).
    pub(crate) fn remove(&self, pid: Pid) -> Option<Arc<Process<P>>> {
        let mut inner = self.inner.write();
        let process = inner.procs.remove(&pid)?;
        let (pgid, tgid) = {
            let p = process.inner.lock();
            (p.pgid, process.tgid)
        };
        if let Some(set) = inner.pgroups.get_mut(&pgid) {
            set.remove(&pid);
            if set.is_empty() {
                inner.pgroups.remove(&pgid);
            }
        }
        if let Some(set) = inner.tgroups.get_mut(&tgid) {
            set.remove(&pid);
            if set.is_empty() {
                inner.tgroups.remove(&tgid);
            }
        }
        Some(process)
    }

    pub(crate) fn group_members(&self, pgid: Pid) -> Vec<Arc<Process<P>>> {
        let inner = self.inner.read();
        inner
            .pgroups
            .get(&pgid)
            .into_iter()
            .flatten()
            .filter_map(|pid| inner.procs.get(pid).cloned())
            .collect()
    }

    pub(crate) fn thread_group_members(&self, tgid: Pid) -> Vec<Arc<Process<P>>> {
        let inner = self.inner.read();
        inner
            .tgroups
            .get(&tgid)
            .into_iter()
            .flatten()
            .filter_map(|pid| inner.procs.get(pid).cloned())
            .collect()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Process<P>>> {
        self.inner.read().procs.values().cloned().collect()
    }

    /// Moves `pid` between process-group indices (`setpgid`, `setsid`).
    pub(crate) fn move_process_group(&self, pid: Pid, old_pgid: Pid, new_pgid: Pid) {
        let mut inner = self.inner.write();
        if let Some(set) = inner.pgroups.get_mut(&old_pgid) {
            set.remove(&pid);
            if set.is_empty() {
                inner.pgroups.remove(&old_pgid);
            }
        }
        inner.pgroups.entry(new_pgid).or_default().insert(pid);
    }
}

// ---------------------------------------------------------------------------
// Lifecycle syscalls

impl<P: KernelPlatform> Task<P> {
    pub(crate) fn sys_getpid(&self) -> Result<i32, Errno> {
        Ok(self.process.tgid())
    }

    pub(crate) fn sys_gettid(&self) -> Result<i32, Errno> {
        Ok(self.process.pid())
    }

    pub(crate) fn sys_getppid(&self) -> Result<i32, Errno> {
        Ok(self.process.ppid())
    }

    pub(crate) fn sys_getpgid(&self, pid: Pid) -> Result<i32, Errno> {
        if pid == 0 || pid == self.process.pid() {
            return Ok(self.process.pgid());
        }
        let process = self.global.processes.get(pid).ok_or(Errno::ESRCH)?;
        Ok(process.pgid())
    }

    pub(crate) fn sys_setpgid(&self, pid: Pid, pgid: Pid) -> Result<(), Errno> {
        if pgid < 0 {
            return Err(Errno::EINVAL);
        }
        let target_pid = if pid == 0 { self.process.pid() } else { pid };
        let target = self.global.processes.get(target_pid).ok_or(Errno::ESRCH)?;
        // Only the caller itself or one of its children may be moved.
        if target.pid() != self.process.pid() && target.ppid() != self.process.pid() {
            return Err(Errno::ESRCH);
        }
        let new_pgid = if pgid == 0 { target_pid } else { pgid };
        let old_pgid = {
            let mut inner = target.inner.lock();
            let old = inner.pgid;
            inner.pgid = new_pgid;
            old
        };
        if old_pgid != new_pgid {
            self.global
                .processes
                .move_process_group(target_pid, old_pgid, new_pgid);
        }
        Ok(())
    }

    pub(crate) fn sys_getsid(&self, pid: Pid) -> Result<i32, Errno> {
        if pid == 0 || pid == self.process.pid() {
            return Ok(self.process.inner.lock().sid);
        }
        let process = self.global.processes.get(pid).ok_or(Errno::ESRCH)?;
        let sid = process.inner.lock().sid;
        Ok(sid)
    }

    pub(crate) fn sys_setsid(&self) -> Result<i32, Errno> {
        let pid = self.process.pid();
        let old_pgid = {
            let mut inner = self.process.inner.lock();
            // A process group leader may not create a new session.
            if inner.pgid == pid {
                return Err(Errno::EPERM);
            }
            let old = inner.pgid;
            inner.pgid = pid;
            inner.sid = pid;
            old
        };
        self.global.processes.move_process_group(pid, old_pgid, pid);
        Ok(pid)
    }

    pub(crate) fn sys_set_tid_address(&self, tidptr: Addr) -> Result<i32, Errno> {
        self.process.inner.lock().clear_child_tid = if tidptr == 0 { None } else { Some(tidptr) };
        Ok(self.process.pid())
    }

    pub(crate) fn sys_set_thread_area(&self, user_desc: Addr) -> Result<(), Errno> {
        // The emulated CPU owns the segment registers; the kernel only
        // remembers the pointer so a cloned task can re-establish it.
        self.process.inner.lock().tls_ptr = Some(user_desc);
        Ok(())
    }

    pub(crate) fn sys_fork(&self) -> Result<u32, Errno> {
        self.do_clone(CloneFlags::empty(), Some(Signal::SIGCHLD), None, 0, None, 0)
    }

    pub(crate) fn sys_vfork(&self) -> Result<u32, Errno> {
        self.do_clone(CloneFlags::VFORK, Some(Signal::SIGCHLD), None, 0, None, 0)
    }

    pub(crate) fn sys_clone(
        &self,
        flags: CloneFlags,
        exit_signal: u32,
        stack: Addr,
        parent_tid: Addr,
        tls: Addr,
        child_tid: Addr,
    ) -> Result<u32, Errno> {
        let exit_signal = match exit_signal {
            0 => None,
            n => Some(Signal::try_from(n as i32).map_err(|_| Errno::EINVAL)?),
        };
        let stack = if stack == 0 { None } else { Some(stack) };
        let tls = if flags.contains(CloneFlags::SETTLS) {
            Some(tls)
        } else {
            None
        };
        self.do_clone(flags, exit_signal, stack, parent_tid, tls, child_tid)
    }

    fn do_clone(
        &self,
        flags: CloneFlags,
        exit_signal: Option<Signal>,
        stack: Option<Addr>,
        parent_tid: Addr,
        tls: Option<Addr>,
        child_tid: Addr,
    ) -> Result<u32, Errno> {
        let unsupported = CloneFlags::PTRACE | CloneFlags::NEWNS | CloneFlags::UNTRACED;
        if flags.intersects(unsupported) {
            self.global
                .log_unsupported(format_args!("clone flags {flags:?}"));
            return Err(Errno::EINVAL);
        }
        if flags.contains(CloneFlags::THREAD)
            && !(flags.contains(CloneFlags::VM) && flags.contains(CloneFlags::SIGHAND))
        {
            return Err(Errno::EINVAL);
        }

        // Resource selection per clone flags: shared or duplicated.
        let mm = {
            let current = self.mm()?;
            if flags.contains(CloneFlags::VM) {
                current
            } else {
                Arc::new(current.fork_duplicate().map_err(|_| Errno::ENOMEM)?)
            }
        };
        let files = {
            let current = self.files();
            if flags.contains(CloneFlags::FILES) {
                current
            } else {
                Arc::new(current.duplicate())
            }
        };
        let fs = {
            let current = self.fs();
            if flags.contains(CloneFlags::FS) {
                current
            } else {
                Arc::new(current.duplicate())
            }
        };

        let child_pid = self.global.processes.alloc_pid();
        let is_thread = flags.contains(CloneFlags::THREAD);
        let ppid = if is_thread || flags.contains(CloneFlags::PARENT) {
            self.process.ppid()
        } else {
            self.process.pid()
        };
        let tgid = if is_thread {
            self.process.tgid()
        } else {
            child_pid
        };
        let (pgid, sid, blocked) = {
            let inner = self.process.inner.lock();
            (inner.pgid, inner.sid, inner.blocked)
        };

        let child = Arc::new(Process {
            pid: child_pid,
            tgid,
            mm: Mutex::new(Some(mm)),
            files: Mutex::new(Some(files)),
            fs: Mutex::new(Some(fs)),
            credentials: Mutex::new(self.credentials()),
            comm: Mutex::new(self.process.comm()),
            inner: Mutex::new(ProcessInner {
                state: TaskState::Running,
                ppid,
                pgid,
                sid,
                children: Vec::new(),
                pending: SigSet::empty(),
                blocked,
                exit_request: None,
                finalized: false,
                job_event: None,
                exit_signal,
                set_child_tid: if flags.contains(CloneFlags::CHILD_SETTID) && child_tid != 0 {
                    Some(child_tid)
                } else {
                    None
                },
                clear_child_tid: if flags.contains(CloneFlags::CHILD_CLEARTID) && child_tid != 0 {
                    Some(child_tid)
                } else {
                    None
                },
                tls_ptr: tls,
                vfork_parent: None,
                vfork_done: false,
                child_waiter: None,
                thread: None,
                itimer_real: None,
            }),
        });

        self.global.processes.insert(child.clone());
        // Threads are not waitable children; everyone else joins the
        // parent-of-record's child list.
        if !is_thread {
            if let Some(parent) = self.global.processes.get(ppid) {
                parent.inner.lock().children.push(child_pid);
            }
        }

        if flags.contains(CloneFlags::PARENT_SETTID) && parent_tid != 0 {
            self.write_user::<i32>(parent_tid, child_pid)?;
        }

        let child_task = Task {
            global: self.global.clone(),
            process: child.clone(),
            wait_state: emukern::event::wait::WaitState::new(self.global.platform),
        };
        if let Err(err) = self
            .global
            .spawner
            .spawn(child_task, StartContext::CloneOfCaller { stack, tls })
        {
            self.global.processes.remove(child_pid);
            if let Some(parent) = self.global.processes.get(ppid) {
                parent.inner.lock().children.retain(|&p| p != child_pid);
            }
            return Err(err.into());
        }

        if flags.contains(CloneFlags::VFORK) {
            self.wait_for_vfork_child(&child);
        }

        Ok(child_pid as u32)
    }

    /// Blocks the caller until the vfork child execs or exits. Interrupts
    /// restart the wait unless the caller itself is dying (the
    /// parent-blocked contract of `vfork`).
    fn wait_for_vfork_child(&self, child: &Arc<Process<P>>) {
        loop {
            let cx = self.wait_cx();
            child.inner.lock().vfork_parent = Some(cx.waker().clone());
            let r = cx.wait_until(|| child.inner.lock().vfork_done);
            child.inner.lock().vfork_parent = None;
            match r {
                Ok(()) => break,
                Err(_) if self.is_exiting() => break,
                Err(_) => {
                    // Consume the interrupting signal before restarting the
                    // wait; a fatal one turns into an exit request.
                    if !self.process_signals() {
                        break;
                    }
                }
            }
        }
    }

    pub(crate) fn sys_execve(&self, path: Addr, argv: Addr, envp: Addr) -> Result<Control, Errno> {
        let path = self.read_user_string(path, PATH_MAX)?;
        let argv = self.read_user_string_array(argv)?;
        let envp = self.read_user_string_array(envp)?;

        // Exec tears down the rest of the thread group.
        for member in self
            .global
            .processes
            .thread_group_members(self.process.tgid())
        {
            if member.pid() != self.process.pid() {
                member.request_exit(ExitStatus::Exited(0));
            }
        }

        let start = self.load_program(&path, &argv, &envp)?;
        {
            let mut inner = self.process.inner.lock();
            inner.clear_child_tid = None;
            inner.set_child_tid = None;
            inner.tls_ptr = None;
        }
        self.files().close_on_exec();
        self.process.complete_vfork();
        match start {
            StartContext::Fresh {
                entry_point,
                stack_pointer,
            } => Ok(Control::Exec {
                entry_point,
                stack_pointer,
            }),
            StartContext::CloneOfCaller { .. } => unreachable!(),
        }
    }

    pub(crate) fn sys_exit(&self, status: i32) -> Control {
        self.process.request_exit(ExitStatus::Exited(status & 0xff));
        self.finalize_exit();
        Control::Exited
    }

    pub(crate) fn sys_exit_group(&self, status: i32) -> Control {
        let status = ExitStatus::Exited(status & 0xff);
        for member in self
            .global
            .processes
            .thread_group_members(self.process.tgid())
        {
            member.request_exit(status);
        }
        self.process.request_exit(status);
        self.finalize_exit();
        Control::Exited
    }

    /// Transitions this task's record out of the running state: releases
    /// its address space and descriptor tables, writes the clear-child-tid
    /// word, reparents its children, and either becomes a zombie (group
    /// leader) or leaves the table (thread). Runs exactly once, on the
    /// task's own execution unit.
    pub(crate) fn finalize_exit(&self) {
        let (status, clear_tid) = {
            let mut inner = self.process.inner.lock();
            if inner.finalized {
                return;
            }
            inner.finalized = true;
            let status = inner.exit_request.unwrap_or(ExitStatus::Exited(0));
            inner.exit_request = Some(status);
            (status, inner.clear_child_tid.take())
        };

        if let Some(addr) = clear_tid {
            // The address space is still alive here; a failed write only
            // means the guest unmapped the word.
            let _ = self.write_user::<i32>(addr, 0);
        }

        self.process.complete_vfork();

        // Release resource ownership. Shared references (CLONE_VM /
        // CLONE_FILES siblings) keep the underlying objects alive; the last
        // drop tears them down.
        *self.process.mm.lock() = None;
        *self.process.files.lock() = None;
        *self.process.fs.lock() = None;

        let pid = self.process.pid();
        let (children, ppid, exit_signal) = {
            let mut inner = self.process.inner.lock();
            inner.state = TaskState::Zombie(status);
            (
                core::mem::take(&mut inner.children),
                inner.ppid,
                inner.exit_signal,
            )
        };

        self.reparent_children(pid, &children);

        if self.process.pid() != self.process.tgid() {
            // Threads are not waitable: the record leaves the table
            // directly.
            self.global.processes.remove(pid);
            return;
        }

        match self.global.processes.get(ppid) {
            Some(parent) => parent.notify_child_event(exit_signal),
            None => {
                // Orphaned with no interested parent: reap immediately.
                self.global.processes.remove(pid);
            }
        }
    }

    /// Hands `children` of the dying `of` process to the init reaper. With
    /// no live reaper, zombie children are dropped and running children
    /// become self-reaping orphans.
    fn reparent_children(&self, of: Pid, children: &[Pid]) {
        let reaper = self
            .global
            .processes
            .get(REAPER_PID)
            .filter(|r| of != REAPER_PID && !r.is_exiting());
        for &child_pid in children {
            let Some(child) = self.global.processes.get(child_pid) else {
                continue;
            };
            match &reaper {
                Some(reaper) => {
                    child.inner.lock().ppid = REAPER_PID;
                    reaper.inner.lock().children.push(child_pid);
                    if matches!(child.task_state(), TaskState::Zombie(_)) {
                        reaper.notify_child_event(child.inner.lock().exit_signal);
                    }
                }
                None => {
                    child.inner.lock().ppid = 0;
                    if matches!(child.task_state(), TaskState::Zombie(_)) {
                        self.global.processes.remove(child_pid);
                    }
                }
            }
        }
    }

    pub(crate) fn sys_wait4(
        &self,
        pid: Pid,
        status_addr: Addr,
        options: WaitOptions,
        rusage_addr: Addr,
    ) -> Result<u32, Errno> {
        let cx = self.wait_cx();
        self.process.inner.lock().child_waiter = Some(cx.waker().clone());
        let result = core::cell::Cell::new(None);
        let wait_result = cx.wait_until(|| match self.try_reap(pid, options) {
            Ok(Some(reaped)) => {
                result.set(Some(Ok(reaped)));
                true
            }
            Ok(None) => {
                if options.contains(WaitOptions::WNOHANG) {
                    result.set(Some(Ok((0, 0))));
                    true
                } else {
                    false
                }
            }
            Err(err) => {
                result.set(Some(Err(err)));
                true
            }
        });
        self.process.inner.lock().child_waiter = None;

        match wait_result {
            Ok(()) => {}
            Err(_) => return Err(Errno::EINTR),
        }
        let (child_pid, status) = result.take().expect("wait_until returned without result")?;
        if child_pid != 0 {
            if status_addr != 0 {
                self.write_user::<u32>(status_addr, status)?;
            }
            if rusage_addr != 0 {
                // Resource accounting is not modeled; the record is
                // well-formed but zero.
                self.write_user(rusage_addr, emukern_common_linux::RUsage::default())?;
            }
        }
        Ok(child_pid as u32)
    }

    /// One scan over the caller's children for the standard target
    /// encoding. `Ok(Some)` delivers a ready child, `Ok(None)` means keep
    /// waiting, `Err(ECHILD)` means no eligible child exists at all.
    fn try_reap(&self, pid: Pid, options: WaitOptions) -> Result<Option<(Pid, u32)>, Errno> {
        let children = self.process.inner.lock().children.clone();
        let own_pgid = self.process.pgid();
        let mut any_match = false;

        for child_pid in children {
            let Some(child) = self.global.processes.get(child_pid) else {
                continue;
            };
            let selected = match pid {
                p if p > 0 => child_pid == p,
                0 => child.pgid() == own_pgid,
                -1 => true,
                p => child.pgid() == -p,
            };
            if !selected {
                continue;
            }
            any_match = true;

            // Zombie: reap exactly once.
            if let TaskState::Zombie(status) = child.task_state() {
                self.global.processes.remove(child_pid);
                self.process
                    .inner
                    .lock()
                    .children
                    .retain(|&p| p != child_pid);
                return Ok(Some((child_pid, status.wstatus())));
            }

            // Job-control events, when asked for.
            let event = {
                let mut inner = child.inner.lock();
                match inner.job_event {
                    Some(JobEvent::Stopped(sig)) if options.contains(WaitOptions::WUNTRACED) => {
                        inner.job_event = None;
                        Some(wstatus::stopped(sig.as_i32()))
                    }
                    Some(JobEvent::Continued) if options.contains(WaitOptions::WCONTINUED) => {
                        inner.job_event = None;
                        Some(wstatus::CONTINUED)
                    }
                    _ => None,
                }
            };
            if let Some(status) = event {
                return Ok(Some((child_pid, status)));
            }
        }

        if any_match { Ok(None) } else { Err(Errno::ECHILD) }
    }

    pub(crate) fn sys_kill(&self, pid: Pid, signal: i32) -> Result<(), Errno> {
        let sig = self.parse_signal(signal)?;
        let targets: Vec<Arc<Process<P>>> = match pid {
            // A thread pid addresses its whole thread group.
            p if p > 0 => self
                .global
                .processes
                .get(p)
                .and_then(|t| self.global.processes.get(t.tgid()))
                .into_iter()
                .collect(),
            0 => self.global.processes.group_members(self.process.pgid()),
            -1 => self
                .global
                .processes
                .all()
                .into_iter()
                .filter(|p| p.pid() != REAPER_PID && p.pid() != self.process.pid())
                .collect(),
            p => self.global.processes.group_members(-p),
        };
        // Signals address thread groups: deliver once per group leader.
        let targets: Vec<_> = targets
            .into_iter()
            .filter(|p| p.pid() == p.tgid())
            .collect();
        if targets.is_empty() {
            return Err(Errno::ESRCH);
        }
        if let Some(sig) = sig {
            for target in targets {
                self.deliver_signal(&target, sig);
            }
        }
        Ok(())
    }

    pub(crate) fn sys_tkill(&self, tid: Pid, signal: i32) -> Result<(), Errno> {
        let sig = self.parse_signal(signal)?;
        let target = self.global.processes.get(tid).ok_or(Errno::ESRCH)?;
        if let Some(sig) = sig {
            self.deliver_signal(&target, sig);
        }
        Ok(())
    }

    pub(crate) fn sys_tgkill(&self, tgid: Pid, tid: Pid, signal: i32) -> Result<(), Errno> {
        let sig = self.parse_signal(signal)?;
        let target = self.global.processes.get(tid).ok_or(Errno::ESRCH)?;
        if target.tgid() != tgid {
            return Err(Errno::ESRCH);
        }
        if let Some(sig) = sig {
            self.deliver_signal(&target, sig);
        }
        Ok(())
    }

    /// Signal 0 probes for existence without delivering.
    fn parse_signal(&self, signal: i32) -> Result<Option<Signal>, Errno> {
        if signal == 0 {
            return Ok(None);
        }
        Signal::try_from(signal).map(Some).map_err(|_| Errno::EINVAL)
    }

    fn deliver_signal(&self, target: &Arc<Process<P>>, sig: Signal) {
        let continued = target.post_signal(sig);
        if continued {
            // Tell the parent about the continue event (WCONTINUED).
            if let Some(parent) = self.global.processes.get(target.ppid()) {
                parent.notify_child_event(None);
            }
        }
    }

    /// Delivers pending signals at the guest boundary. Returns `false` when
    /// a fatal signal turned into an exit request.
    pub(crate) fn process_signals(&self) -> bool {
        self.process.poll_itimer(self.platform());
        loop {
            if self.is_exiting() {
                return false;
            }
            let sig = {
                let mut inner = self.process.inner.lock();
                let Some(sig) = inner.pending.first_deliverable(&inner.blocked) else {
                    return true;
                };
                inner.pending.remove(sig);
                sig
            };
            if default_ignored(sig) {
                continue;
            }
            if sig.default_is_stop() {
                self.enter_stopped(sig);
                continue;
            }
            // Everything else is fatal by default at this modeling depth
            // (signal handler installation lives outside this core).
            self.process.request_exit(ExitStatus::Signaled(sig));
            return false;
        }
    }

    /// Job-control stop: park this execution unit until `SIGCONT` resumes
    /// the record or an exit request arrives.
    fn enter_stopped(&self, sig: Signal) {
        {
            let mut inner = self.process.inner.lock();
            inner.state = TaskState::Stopped(sig);
            inner.job_event = Some(JobEvent::Stopped(sig));
        }
        if let Some(parent) = self.global.processes.get(self.process.ppid()) {
            parent.notify_child_event(None);
        }
        let cx = self.wait_state.context();
        let _ = cx.wait_until(|| {
            let inner = self.process.inner.lock();
            !matches!(inner.state, TaskState::Stopped(_)) || inner.exit_request.is_some()
        });
    }

    /// Writes the set-child-tid word on the child's own unit (`attach`).
    pub(crate) fn write_set_child_tid_value(&self) {
        let addr = self.process.inner.lock().set_child_tid.take();
        if let Some(addr) = addr {
            let _ = self.write_user::<i32>(addr, self.process.pid());
        }
    }
}

/// `comm` as a displayable string (diagnostics).
pub fn comm_str(comm: &[u8; TASK_COMM_LEN]) -> String {
    let end = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..end]).into_owned()
}
