// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The Linux personality on top of EmuKern.
//!
//! This crate owns the guest-visible kernel state: the process/thread
//! table, per-process address spaces and descriptor tables, and every
//! syscall handler. The instruction emulator sits above it and talks to it
//! through two narrow surfaces: [`Kernel::launch`] to create the first
//! process, and [`Task::syscall`] each time the emulated CPU traps a
//! syscall. Everything the kernel needs from the host arrives through the
//! [`KernelPlatform`] capability bundle.

#![no_std]
#![expect(
    clippy::unused_self,
    reason = "by convention, syscalls and related methods take &self even if unused"
)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use emukern::event::wait::{WaitContext, WaitState};
use emukern::mm::PAGE_SIZE;
use emukern::platform::page_mgmt::PageManagementProvider;
use emukern::platform::{
    DebugLogProvider, FileProvider, GuestMemoryProvider, ThreadProvider, TimeProvider,
};
use emukern::sync::RawSyncPrimitivesProvider;
use emukern_common_linux::{Addr, Pid, SyscallRequest, UserAbi, Word, errno::Errno};
use thiserror::Error;

pub mod loader;
pub mod syscalls;

use syscalls::file::{FilesState, FsState};
use syscalls::flock::FlockTable;
use syscalls::process::{Credentials, Process, ProcessTable, TaskState};

/// The capability bundle a host platform must provide for the Linux
/// personality.
pub trait KernelPlatform:
    RawSyncPrimitivesProvider
    + TimeProvider
    + ThreadProvider
    + GuestMemoryProvider
    + PageManagementProvider<{ PAGE_SIZE }>
    + FileProvider
    + DebugLogProvider
{
}

impl<T> KernelPlatform for T where
    T: RawSyncPrimitivesProvider
        + TimeProvider
        + ThreadProvider
        + GuestMemoryProvider
        + PageManagementProvider<{ PAGE_SIZE }>
        + FileProvider
        + DebugLogProvider
{
}

/// The guest address space type used throughout the shim.
pub(crate) type Space<P> = emukern::mm::AddressSpace<P, { PAGE_SIZE }>;

// This places size limits on maximum read/write sizes that might occur; it
// exists primarily to prevent OOM due to the guest asking for a massive
// transfer at once. Chunked copies keep the syscall count low without
// allowing guest-controlled allocations to balloon.
pub(crate) const MAX_KERNEL_BUF_SIZE: usize = 0x80_000;

/// Caps the number of argv/envp entries `execve` accepts.
pub(crate) const MAX_ARG_STRINGS: usize = 0x1000;

/// Builder for the kernel: platform plus the embedder-supplied program
/// loader and task spawner.
pub struct KernelBuilder<P: KernelPlatform> {
    platform: &'static P,
    loader: Option<Box<dyn loader::ProgramLoader<P>>>,
    spawner: Option<Box<dyn TaskSpawner<P>>>,
}

impl<P: KernelPlatform> KernelBuilder<P> {
    pub fn new(platform: &'static P) -> Self {
        Self {
            platform,
            loader: None,
            spawner: None,
        }
    }

    /// Sets the program-image loader used by launch and `execve`.
    pub fn set_loader(&mut self, loader: Box<dyn loader::ProgramLoader<P>>) {
        self.loader = Some(loader);
    }

    /// Sets the spawner that binds new tasks to host execution units.
    pub fn set_spawner(&mut self, spawner: Box<dyn TaskSpawner<P>>) {
        self.spawner = Some(spawner);
    }

    /// Build the kernel.
    ///
    /// # Panics
    ///
    /// Panics if the loader or spawner has not been set.
    pub fn build(self) -> Kernel<P> {
        Kernel(Arc::new(GlobalState {
            platform: self.platform,
            processes: ProcessTable::new(),
            flocks: Arc::new(FlockTable::new()),
            boot_time: self.platform.now(),
            loader: self.loader.expect("program loader must be set"),
            spawner: self.spawner.expect("task spawner must be set"),
        }))
    }
}

/// A full guest kernel instance.
pub struct Kernel<P: KernelPlatform>(pub(crate) Arc<GlobalState<P>>);

impl<P: KernelPlatform> Clone for Kernel<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Identity parameters for the initial process.
pub struct TaskParams {
    pub pid: Pid,
    pub ppid: Pid,
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            pid: 1,
            ppid: 0,
            uid: 0,
            euid: 0,
            gid: 0,
            egid: 0,
        }
    }
}

/// A launched program: the task handle for the execution unit that will run
/// it, plus the initial CPU state the emulator should assume.
pub struct LaunchedProgram<P: KernelPlatform> {
    pub task: Task<P>,
    pub start: StartContext,
}

impl<P: KernelPlatform> Kernel<P> {
    /// Loads `path` as the initial process, building its address space,
    /// stack, and stdio descriptors. The caller binds the returned task to
    /// an execution unit and starts emulating at the returned context.
    pub fn launch(
        &self,
        params: TaskParams,
        path: &str,
        argv: Vec<String>,
        envp: Vec<String>,
    ) -> Result<LaunchedProgram<P>, Errno> {
        let process = Process::new_initial(&self.0, &params)?;
        self.0.processes.insert(process.clone());
        let task = Task {
            global: self.0.clone(),
            process,
            wait_state: WaitState::new(self.0.platform),
        };
        task.files().initialize_stdio(&self.0);
        let start = task.load_program(path, &argv, &envp)?;
        Ok(LaunchedProgram { task, start })
    }

    /// The live process table (diagnostics and embedder introspection).
    pub fn process_count(&self) -> usize {
        self.0.processes.len()
    }

    /// Looks up the exit status of a zombie, or `None` while it is running.
    pub fn exit_status_of(&self, pid: Pid) -> Option<syscalls::process::ExitStatus> {
        let process = self.0.processes.get(pid)?;
        match process.task_state() {
            TaskState::Zombie(status) => Some(status),
            _ => None,
        }
    }
}

/// Global kernel state, shared across all tasks.
pub(crate) struct GlobalState<P: KernelPlatform> {
    /// The platform instance used throughout the shim.
    pub(crate) platform: &'static P,
    /// The process-wide registry of live process/thread records.
    pub(crate) processes: ProcessTable<P>,
    /// Advisory whole-file locks, keyed by host file identity.
    pub(crate) flocks: Arc<FlockTable<P>>,
    /// When the kernel was constructed (CLOCK_MONOTONIC epoch).
    pub(crate) boot_time: P::Instant,
    /// Builds program images for launch and `execve`.
    pub(crate) loader: Box<dyn loader::ProgramLoader<P>>,
    /// Binds freshly created tasks to host execution units.
    pub(crate) spawner: Box<dyn TaskSpawner<P>>,
}

impl<P: KernelPlatform> GlobalState<P> {
    pub(crate) fn log_unsupported(&self, args: core::fmt::Arguments<'_>) {
        if cfg!(debug_assertions) {
            let msg = alloc::format!("WARNING: unsupported: {args}\n");
            self.platform.debug_log_print(&msg);
        }
    }
}

/// Binds new tasks to host execution units.
///
/// The shim creates the process record; actually running it (duplicating
/// the emulated CPU, scheduling a host thread) is the embedder's job.
pub trait TaskSpawner<P: KernelPlatform>: Send + Sync {
    fn spawn(&self, task: Task<P>, start: StartContext) -> Result<(), SpawnError>;
}

/// Initial CPU state for a new or replaced task image.
#[derive(Clone, Copy, Debug)]
pub enum StartContext {
    /// A fresh program image: begin at `entry_point` with `stack_pointer`.
    Fresh {
        entry_point: Addr,
        stack_pointer: Addr,
    },
    /// A clone of the calling task: duplicate the caller's CPU state with a
    /// zero syscall return value, overriding the stack pointer and
    /// thread-local base when provided.
    CloneOfCaller {
        stack: Option<Addr>,
        tls: Option<Addr>,
    },
}

/// The embedder could not start an execution unit.
#[derive(Error, Debug, Clone, Copy)]
#[error("failed to spawn an execution unit")]
pub struct SpawnError;

impl From<SpawnError> for Errno {
    fn from(_: SpawnError) -> Self {
        Errno::EAGAIN
    }
}

/// What the emulator should do after a syscall.
#[derive(Debug)]
pub enum SyscallOutcome {
    /// Store the value in the guest's return register and resume.
    Return(Word),
    /// The image was replaced (`execve`): reset the CPU to this context and
    /// resume.
    Exec {
        entry_point: Addr,
        stack_pointer: Addr,
    },
    /// The task exited; stop emulating on this execution unit.
    Exited,
}

/// Whether the task may (re)enter guest execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueOperation {
    ResumeGuest,
    ExitThread,
}

/// One guest execution unit: global state, the task's process record, and
/// its wait state.
///
/// A `Task` is `Send` (it is created by `clone` on the parent's unit and
/// moved to the child's) but deliberately not `Sync`.
pub struct Task<P: KernelPlatform> {
    pub(crate) global: Arc<GlobalState<P>>,
    pub(crate) process: Arc<Process<P>>,
    pub(crate) wait_state: WaitState<P>,
}

impl<P: KernelPlatform> Task<P> {
    /// Binds this task to the calling host thread so that signals can
    /// interrupt it. Must be called on the thread that will run the task,
    /// before guest execution begins.
    pub fn attach(&self) {
        self.process
            .set_thread_handle(self.wait_state.thread_handle());
        self.write_set_child_tid_value();
    }

    /// Transition toward guest execution: evaluates the timer, delivers
    /// pending signals (a job-control stop parks the unit right here), and
    /// decides whether the guest should run. On `ExitThread` the task's
    /// record has been transitioned (zombie or removed) and the execution
    /// unit must stop.
    #[must_use]
    pub fn prepare_to_run_guest(&self) -> ContinueOperation {
        loop {
            // Delivery happens in the host state; stops block here until
            // SIGCONT or an exit request.
            if !self.process_signals() || self.is_exiting() {
                self.finalize_exit();
                return ContinueOperation::ExitThread;
            }
            // Transition to the guest state, unless a signal raced in after
            // delivery; then go around and deliver it too.
            let ready = self.wait_state.prepare_to_run_guest(|| {
                !self.is_exiting() && !self.process.has_deliverable_signal()
            });
            if ready {
                return ContinueOperation::ResumeGuest;
            }
        }
    }

    /// Handles a trapped syscall end-to-end: re-enters the shim, decodes
    /// and runs the handler, then prepares to resume the guest.
    pub fn syscall(&self, nr: u32, args: [Word; 6]) -> SyscallOutcome {
        self.wait_state.finish_running_guest();
        let control = match SyscallRequest::decode(nr, args) {
            Ok(request) => self.do_syscall(request),
            Err(err) => Err(err),
        };
        let outcome = match control {
            Ok(Control::Value(v)) => SyscallOutcome::Return(v),
            Ok(Control::Exec {
                entry_point,
                stack_pointer,
            }) => SyscallOutcome::Exec {
                entry_point,
                stack_pointer,
            },
            Ok(Control::Exited) => return SyscallOutcome::Exited,
            Err(err) => SyscallOutcome::Return(err.as_neg() as Word),
        };
        match self.prepare_to_run_guest() {
            ContinueOperation::ResumeGuest => outcome,
            ContinueOperation::ExitThread => SyscallOutcome::Exited,
        }
    }

    /// The process record backing this task.
    pub fn process(&self) -> &Arc<Process<P>> {
        &self.process
    }

    pub(crate) fn platform(&self) -> &'static P {
        self.global.platform
    }

    /// Returns a wait context to use to perform interruptible waits.
    pub(crate) fn wait_cx(&self) -> WaitContext<'_, P> {
        self.wait_state.context().with_check_for_interrupt(self)
    }

    pub(crate) fn is_exiting(&self) -> bool {
        self.process.is_exiting()
    }

    pub(crate) fn files(&self) -> Arc<FilesState<P>> {
        self.process.files()
    }

    pub(crate) fn fs(&self) -> Arc<FsState<P>> {
        self.process.fs()
    }

    pub(crate) fn mm(&self) -> Result<Arc<Space<P>>, Errno> {
        self.process.mm().ok_or(Errno::EFAULT)
    }

    pub(crate) fn credentials(&self) -> Credentials {
        self.process.credentials()
    }
}

impl<P: KernelPlatform> emukern::event::wait::CheckForInterrupt for Task<P> {
    fn check_for_interrupt(&self) -> bool {
        self.is_exiting() || self.process.has_deliverable_signal()
    }
}

impl<P: KernelPlatform> Drop for Task<P> {
    fn drop(&mut self) {
        // Safety net: a task dropped without going through an exit syscall
        // (emulator teardown, spawner failure) still unwinds its record.
        self.finalize_exit();
    }
}

/// Internal control-flow result of a handler.
pub(crate) enum Control {
    Value(Word),
    Exec {
        entry_point: Addr,
        stack_pointer: Addr,
    },
    Exited,
}

pub(crate) trait ToSyscallResult {
    fn to_syscall_result(self) -> Result<Word, Errno>;
}

impl ToSyscallResult for Result<(), Errno> {
    fn to_syscall_result(self) -> Result<Word, Errno> {
        self.map(|()| 0)
    }
}

impl ToSyscallResult for Result<u32, Errno> {
    fn to_syscall_result(self) -> Result<Word, Errno> {
        self
    }
}

impl ToSyscallResult for Result<usize, Errno> {
    fn to_syscall_result(self) -> Result<Word, Errno> {
        self.and_then(|v| Word::try_from(v).map_err(|_| Errno::EOVERFLOW))
    }
}

impl ToSyscallResult for Result<i32, Errno> {
    fn to_syscall_result(self) -> Result<Word, Errno> {
        self.map(|v| v as Word)
    }
}

impl<P: KernelPlatform> Task<P> {
    /// Dispatches a decoded request to its handler.
    fn do_syscall(&self, request: SyscallRequest) -> Result<Control, Errno> {
        // Helper macro to unify the return value from `sys_*`.
        macro_rules! syscall {
            ($func:ident($($args:expr),*)) => {
                self.$func($($args),*).to_syscall_result().map(Control::Value)
            };
        }

        match request {
            SyscallRequest::Exit { status } => Ok(self.sys_exit(status)),
            SyscallRequest::ExitGroup { status } => Ok(self.sys_exit_group(status)),
            SyscallRequest::Fork => syscall!(sys_fork()),
            SyscallRequest::Vfork => syscall!(sys_vfork()),
            SyscallRequest::Clone {
                flags,
                exit_signal,
                stack,
                parent_tid,
                tls,
                child_tid,
            } => syscall!(sys_clone(flags, exit_signal, stack, parent_tid, tls, child_tid)),
            SyscallRequest::Execve { path, argv, envp } => self.sys_execve(path, argv, envp),
            SyscallRequest::Waitpid {
                pid,
                status,
                options,
            } => syscall!(sys_wait4(pid, status, options, 0)),
            SyscallRequest::Wait4 {
                pid,
                status,
                options,
                rusage,
            } => syscall!(sys_wait4(pid, status, options, rusage)),

            SyscallRequest::Brk { addr } => syscall!(sys_brk(addr)),
            SyscallRequest::OldMmap { args } => {
                self.global
                    .log_unsupported(format_args!("legacy mmap(struct at {args:#x})"));
                Err(Errno::ENOSYS)
            }
            SyscallRequest::Mmap2 {
                addr,
                length,
                prot,
                flags,
                fd,
                pgoffset,
            } => syscall!(sys_mmap2(addr, length, prot, flags, fd, pgoffset)),
            SyscallRequest::Munmap { addr, length } => syscall!(sys_munmap(addr, length)),
            SyscallRequest::Mprotect { addr, length, prot } => {
                syscall!(sys_mprotect(addr, length, prot))
            }
            SyscallRequest::Madvise {
                addr,
                length,
                advice,
            } => syscall!(sys_madvise(addr, length, advice)),

            SyscallRequest::Open { path, flags, mode } => syscall!(sys_open(path, flags, mode)),
            SyscallRequest::Openat {
                dirfd,
                path,
                flags,
                mode,
            } => syscall!(sys_openat(dirfd, path, flags, mode)),
            SyscallRequest::Close { fd } => syscall!(sys_close(fd)),
            SyscallRequest::Read { fd, buf, count } => syscall!(sys_read(fd, buf, count)),
            SyscallRequest::Write { fd, buf, count } => syscall!(sys_write(fd, buf, count)),
            SyscallRequest::Readv { fd, iovec, iovcnt } => syscall!(sys_readv(fd, iovec, iovcnt)),
            SyscallRequest::Writev { fd, iovec, iovcnt } => syscall!(sys_writev(fd, iovec, iovcnt)),
            SyscallRequest::Lseek { fd, offset, whence } => syscall!(sys_lseek(fd, offset, whence)),
            SyscallRequest::Llseek {
                fd,
                offset_high,
                offset_low,
                result,
                whence,
            } => syscall!(sys_llseek(fd, offset_high, offset_low, result, whence)),
            SyscallRequest::Dup { fd } => syscall!(sys_dup(fd)),
            SyscallRequest::Dup2 { fd, newfd } => syscall!(sys_dup2(fd, newfd)),
            SyscallRequest::Fcntl { fd, arg } => syscall!(sys_fcntl(fd, arg)),
            SyscallRequest::Flock { fd, op } => syscall!(sys_flock(fd, op)),
            SyscallRequest::Ioctl { fd, cmd, arg } => syscall!(sys_ioctl(fd, cmd, arg)),
            SyscallRequest::Ftruncate { fd, length } => syscall!(sys_ftruncate(fd, length)),
            SyscallRequest::Fchmod { fd, mode } => syscall!(sys_fchmod(fd, mode)),
            SyscallRequest::Fchown { fd, owner, group } => syscall!(sys_fchown(fd, owner, group)),
            SyscallRequest::Fsync { fd } => syscall!(sys_fsync(fd)),
            SyscallRequest::Sendfile {
                out_fd,
                in_fd,
                offset,
                count,
            } => syscall!(sys_sendfile(out_fd, in_fd, offset, count)),
            SyscallRequest::Getdents64 { fd, dirp, count } => {
                syscall!(sys_getdents64(fd, dirp, count))
            }

            SyscallRequest::Stat64 { path, buf } => syscall!(sys_stat64(path, buf)),
            SyscallRequest::Lstat64 { path, buf } => syscall!(sys_lstat64(path, buf)),
            SyscallRequest::Fstat64 { fd, buf } => syscall!(sys_fstat64(fd, buf)),
            SyscallRequest::Fstatat64 {
                dirfd,
                path,
                buf,
                flags,
            } => syscall!(sys_fstatat64(dirfd, path, buf, flags)),
            SyscallRequest::Access { path, mode } => syscall!(sys_access(path, mode)),
            SyscallRequest::Readlink { path, buf, size } => {
                syscall!(sys_readlink(path, buf, size))
            }
            SyscallRequest::Unlink { path } => syscall!(sys_unlink(path)),
            SyscallRequest::Unlinkat { dirfd, path, flags } => {
                syscall!(sys_unlinkat(dirfd, path, flags))
            }
            SyscallRequest::Mkdir { path, mode } => syscall!(sys_mkdir(path, mode)),
            SyscallRequest::Mkdirat { dirfd, path, mode } => {
                syscall!(sys_mkdirat(dirfd, path, mode))
            }
            SyscallRequest::Rmdir { path } => syscall!(sys_rmdir(path)),
            SyscallRequest::Rename { from, to } => syscall!(sys_rename(from, to)),
            SyscallRequest::Statfs64 { path, size, buf } => {
                syscall!(sys_statfs64(path, size, buf))
            }
            SyscallRequest::Fstatfs64 { fd, size, buf } => {
                syscall!(sys_fstatfs64(fd, size, buf))
            }
            SyscallRequest::Utimensat {
                dirfd,
                path,
                times,
                flags,
            } => syscall!(sys_utimensat(dirfd, path, times, flags)),
            SyscallRequest::Mount { .. } => {
                // Mount translation belongs to the host filesystem backend.
                self.global
                    .log_unsupported(format_args!("mount by the guest"));
                Err(Errno::ENOSYS)
            }

            SyscallRequest::Getpid => syscall!(sys_getpid()),
            SyscallRequest::Gettid => syscall!(sys_gettid()),
            SyscallRequest::Getppid => syscall!(sys_getppid()),
            SyscallRequest::Getpgid { pid } => syscall!(sys_getpgid(pid)),
            SyscallRequest::Setpgid { pid, pgid } => syscall!(sys_setpgid(pid, pgid)),
            SyscallRequest::Getpgrp => syscall!(sys_getpgid(0)),
            SyscallRequest::Getsid { pid } => syscall!(sys_getsid(pid)),
            SyscallRequest::Setsid => syscall!(sys_setsid()),
            SyscallRequest::Getuid => Ok(Control::Value(self.credentials().uid)),
            SyscallRequest::Geteuid => Ok(Control::Value(self.credentials().euid)),
            SyscallRequest::Getgid => Ok(Control::Value(self.credentials().gid)),
            SyscallRequest::Getegid => Ok(Control::Value(self.credentials().egid)),
            SyscallRequest::Getcwd { buf, size } => syscall!(sys_getcwd(buf, size)),
            SyscallRequest::Chdir { path } => syscall!(sys_chdir(path)),
            SyscallRequest::Fchdir { fd } => syscall!(sys_fchdir(fd)),
            SyscallRequest::Umask { mask } => syscall!(sys_umask(mask)),
            SyscallRequest::SetTidAddress { tidptr } => syscall!(sys_set_tid_address(tidptr)),
            SyscallRequest::SetThreadArea { user_desc } => {
                syscall!(sys_set_thread_area(user_desc))
            }
            SyscallRequest::Kill { pid, signal } => syscall!(sys_kill(pid, signal)),
            SyscallRequest::Tkill { tid, signal } => syscall!(sys_tkill(tid, signal)),
            SyscallRequest::Tgkill { tgid, tid, signal } => {
                syscall!(sys_tgkill(tgid, tid, signal))
            }
            SyscallRequest::Getrlimit { resource, rlim } => {
                syscall!(sys_getrlimit(resource, rlim))
            }
            SyscallRequest::Setrlimit { resource, rlim } => {
                syscall!(sys_setrlimit(resource, rlim))
            }
            SyscallRequest::Getrusage { who, usage } => syscall!(sys_getrusage(who, usage)),

            SyscallRequest::Time { tloc } => syscall!(sys_time(tloc)),
            SyscallRequest::ClockGettime { clock, tp } => syscall!(sys_clock_gettime(clock, tp)),
            SyscallRequest::ClockGetres { clock, res } => syscall!(sys_clock_getres(clock, res)),
            SyscallRequest::Gettimeofday { tv, tz } => syscall!(sys_gettimeofday(tv, tz)),
            SyscallRequest::Nanosleep { req, rem } => syscall!(sys_nanosleep(req, rem)),
            SyscallRequest::Getitimer { which, value } => syscall!(sys_getitimer(which, value)),
            SyscallRequest::Setitimer {
                which,
                new_value,
                old_value,
            } => syscall!(sys_setitimer(which, new_value, old_value)),
            SyscallRequest::Alarm { seconds } => syscall!(sys_alarm(seconds)),
            SyscallRequest::Uname { buf } => syscall!(sys_uname(buf)),
            SyscallRequest::Sysinfo { buf } => syscall!(sys_sysinfo(buf)),
            SyscallRequest::Poll {
                fds,
                nfds,
                timeout_ms,
            } => syscall!(sys_poll(fds, nfds, timeout_ms)),
            SyscallRequest::Pause => syscall!(sys_pause()),
            SyscallRequest::SchedYield => {
                // The host OS schedules the backing threads; nothing to do.
                Ok(Control::Value(0))
            }

            request => {
                self.global
                    .log_unsupported(format_args!("syscall {request:?}"));
                Err(Errno::ENOSYS)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Guest memory marshaling

impl<P: KernelPlatform> Task<P> {
    /// Reads one plain-old-data record from guest memory.
    pub(crate) fn read_user<T: UserAbi>(&self, addr: Addr) -> Result<T, Errno> {
        let mut value = core::mem::MaybeUninit::<T>::uninit();
        // SAFETY: `UserAbi` guarantees `T` is valid for any bit pattern and
        // the buffer covers exactly `size_of::<T>()` bytes.
        let buf = unsafe {
            core::slice::from_raw_parts_mut(
                value.as_mut_ptr().cast::<u8>(),
                core::mem::size_of::<T>(),
            )
        };
        self.platform().read_guest(addr as usize, buf)?;
        // SAFETY: fully initialized by the successful read.
        Ok(unsafe { value.assume_init() })
    }

    /// Writes one plain-old-data record into guest memory.
    pub(crate) fn write_user<T: UserAbi>(&self, addr: Addr, value: T) -> Result<(), Errno> {
        // SAFETY: `UserAbi` guarantees `T` has no uninitialized padding the
        // guest could observe.
        let bytes = unsafe {
            core::slice::from_raw_parts(
                core::ptr::from_ref(&value).cast::<u8>(),
                core::mem::size_of::<T>(),
            )
        };
        Ok(self.platform().write_guest(addr as usize, bytes)?)
    }

    /// Reads raw bytes from guest memory.
    pub(crate) fn read_user_bytes(&self, addr: Addr, buf: &mut [u8]) -> Result<(), Errno> {
        Ok(self.platform().read_guest(addr as usize, buf)?)
    }

    /// Writes raw bytes into guest memory.
    pub(crate) fn write_user_bytes(&self, addr: Addr, bytes: &[u8]) -> Result<(), Errno> {
        Ok(self.platform().write_guest(addr as usize, bytes)?)
    }

    /// Reads a NUL-terminated guest string as UTF-8 (paths and argv).
    pub(crate) fn read_user_string(&self, addr: Addr, max: usize) -> Result<String, Errno> {
        let bytes = self.platform().read_guest_cstr(addr as usize, max)?;
        String::from_utf8(bytes).map_err(|_| Errno::EINVAL)
    }

    /// Reads a NUL-terminated array of guest string pointers (argv/envp).
    pub(crate) fn read_user_string_array(&self, addr: Addr) -> Result<Vec<String>, Errno> {
        let mut out = Vec::new();
        if addr == 0 {
            return Ok(out);
        }
        for i in 0..MAX_ARG_STRINGS {
            let slot = addr
                .checked_add((i * core::mem::size_of::<Addr>()) as u32)
                .ok_or(Errno::EFAULT)?;
            let ptr: Addr = self.read_user(slot)?;
            if ptr == 0 {
                return Ok(out);
            }
            out.push(self.read_user_string(ptr, emukern_common_linux::PATH_MAX)?);
        }
        Err(Errno::E2BIG)
    }
}

/// A zeroed transfer buffer capped at [`MAX_KERNEL_BUF_SIZE`].
pub(crate) fn bounded_kernel_buf(len: usize) -> Vec<u8> {
    vec![0u8; len.min(MAX_KERNEL_BUF_SIZE)]
}
