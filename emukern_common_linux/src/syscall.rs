//! Syscall numbers and the typed request decoder.
//!
//! Dispatch is a closed mapping: a raw `(number, args)` pair either decodes
//! into exactly one [`SyscallRequest`] variant carrying its argument shape,
//! or falls through to `ENOSYS`. Handlers never see raw argument words.

use num_enum::TryFromPrimitive;

use crate::{
    AccessMode, Addr, AtFlags, ClockId, CloneFlags, FcntlArg, FlockOp, ItimerWhich, MadviseAdvice,
    MapFlags, OpenFlags, Pid, ProtFlags, RlimitResource, SeekWhence, WaitOptions, Word,
    errno::Errno,
};

/// The i386 syscall numbers this surface recognizes.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[allow(non_camel_case_types)]
pub enum Sysno {
    exit = 1,
    fork = 2,
    read = 3,
    write = 4,
    open = 5,
    close = 6,
    waitpid = 7,
    unlink = 10,
    execve = 11,
    chdir = 12,
    time = 13,
    lseek = 19,
    getpid = 20,
    mount = 21,
    getuid = 24,
    alarm = 27,
    pause = 29,
    access = 33,
    kill = 37,
    rename = 38,
    mkdir = 39,
    rmdir = 40,
    dup = 41,
    brk = 45,
    getgid = 47,
    geteuid = 49,
    getegid = 50,
    ioctl = 54,
    fcntl = 55,
    setpgid = 57,
    umask = 60,
    dup2 = 63,
    getppid = 64,
    getpgrp = 65,
    setsid = 66,
    setrlimit = 75,
    getrlimit = 76,
    getrusage = 77,
    gettimeofday = 78,
    readlink = 85,
    mmap = 90,
    munmap = 91,
    ftruncate = 93,
    fchmod = 94,
    setitimer = 104,
    getitimer = 105,
    wait4 = 114,
    sysinfo = 116,
    fsync = 118,
    clone = 120,
    uname = 122,
    mprotect = 125,
    getpgid = 132,
    fchdir = 133,
    _llseek = 140,
    flock = 143,
    readv = 145,
    writev = 146,
    getsid = 147,
    sched_yield = 158,
    nanosleep = 162,
    poll = 168,
    getcwd = 183,
    sendfile = 187,
    vfork = 190,
    ugetrlimit = 191,
    mmap2 = 192,
    stat64 = 195,
    lstat64 = 196,
    fstat64 = 197,
    getuid32 = 199,
    getgid32 = 200,
    geteuid32 = 201,
    getegid32 = 202,
    fchown32 = 207,
    madvise = 219,
    getdents64 = 220,
    fcntl64 = 221,
    gettid = 224,
    tkill = 238,
    sendfile64 = 239,
    set_thread_area = 243,
    exit_group = 252,
    set_tid_address = 258,
    clock_gettime = 265,
    clock_getres = 266,
    statfs64 = 268,
    fstatfs64 = 269,
    tgkill = 270,
    openat = 295,
    mkdirat = 296,
    fstatat64 = 300,
    unlinkat = 301,
    utimensat = 320,
}

/// A decoded syscall request.
///
/// Each variant carries its argument shape; guest pointers stay as [`Addr`]
/// values and are marshaled by the handlers through the guest-memory
/// capability.
#[non_exhaustive]
#[derive(Debug)]
pub enum SyscallRequest {
    // Process lifecycle
    Exit { status: i32 },
    ExitGroup { status: i32 },
    Fork,
    Vfork,
    Clone {
        flags: CloneFlags,
        exit_signal: u32,
        stack: Addr,
        parent_tid: Addr,
        tls: Addr,
        child_tid: Addr,
    },
    Execve { path: Addr, argv: Addr, envp: Addr },
    Waitpid { pid: Pid, status: Addr, options: WaitOptions },
    Wait4 { pid: Pid, status: Addr, options: WaitOptions, rusage: Addr },

    // Memory management
    Brk { addr: Addr },
    /// The legacy struct-argument `mmap`; unimplemented on this surface.
    OldMmap { args: Addr },
    Mmap2 {
        addr: Addr,
        length: u32,
        prot: ProtFlags,
        flags: MapFlags,
        fd: i32,
        pgoffset: u32,
    },
    Munmap { addr: Addr, length: u32 },
    Mprotect { addr: Addr, length: u32, prot: ProtFlags },
    Madvise { addr: Addr, length: u32, advice: MadviseAdvice },

    // File descriptors
    Open { path: Addr, flags: OpenFlags, mode: u32 },
    Openat { dirfd: i32, path: Addr, flags: OpenFlags, mode: u32 },
    Close { fd: i32 },
    Read { fd: i32, buf: Addr, count: u32 },
    Write { fd: i32, buf: Addr, count: u32 },
    Readv { fd: i32, iovec: Addr, iovcnt: u32 },
    Writev { fd: i32, iovec: Addr, iovcnt: u32 },
    Lseek { fd: i32, offset: i32, whence: SeekWhence },
    Llseek {
        fd: i32,
        offset_high: u32,
        offset_low: u32,
        result: Addr,
        whence: SeekWhence,
    },
    Dup { fd: i32 },
    Dup2 { fd: i32, newfd: i32 },
    Fcntl { fd: i32, arg: FcntlArg },
    Flock { fd: i32, op: FlockOp },
    Ioctl { fd: i32, cmd: u32, arg: Word },
    Ftruncate { fd: i32, length: u32 },
    Fchmod { fd: i32, mode: u32 },
    Fchown { fd: i32, owner: u32, group: u32 },
    Fsync { fd: i32 },
    Sendfile { out_fd: i32, in_fd: i32, offset: Addr, count: u32 },
    Getdents64 { fd: i32, dirp: Addr, count: u32 },

    // Path-keyed file management
    Stat64 { path: Addr, buf: Addr },
    Lstat64 { path: Addr, buf: Addr },
    Fstat64 { fd: i32, buf: Addr },
    Fstatat64 { dirfd: i32, path: Addr, buf: Addr, flags: AtFlags },
    Access { path: Addr, mode: AccessMode },
    Readlink { path: Addr, buf: Addr, size: u32 },
    Unlink { path: Addr },
    Unlinkat { dirfd: i32, path: Addr, flags: AtFlags },
    Mkdir { path: Addr, mode: u32 },
    Mkdirat { dirfd: i32, path: Addr, mode: u32 },
    Rmdir { path: Addr },
    Rename { from: Addr, to: Addr },
    Statfs64 { path: Addr, size: u32, buf: Addr },
    Fstatfs64 { fd: i32, size: u32, buf: Addr },
    Utimensat { dirfd: i32, path: Addr, times: Addr, flags: AtFlags },
    Mount {
        source: Addr,
        target: Addr,
        fstype: Addr,
        flags: u32,
        data: Addr,
    },

    // Process information
    Getpid,
    Gettid,
    Getppid,
    Getpgid { pid: Pid },
    Setpgid { pid: Pid, pgid: Pid },
    Getpgrp,
    Getsid { pid: Pid },
    Setsid,
    Getuid,
    Geteuid,
    Getgid,
    Getegid,
    Getcwd { buf: Addr, size: u32 },
    Chdir { path: Addr },
    Fchdir { fd: i32 },
    Umask { mask: u32 },
    SetTidAddress { tidptr: Addr },
    SetThreadArea { user_desc: Addr },
    Kill { pid: Pid, signal: i32 },
    Tkill { tid: Pid, signal: i32 },
    Tgkill { tgid: Pid, tid: Pid, signal: i32 },
    Getrlimit { resource: RlimitResource, rlim: Addr },
    Setrlimit { resource: RlimitResource, rlim: Addr },
    Getrusage { who: i32, usage: Addr },

    // Time and system information
    Time { tloc: Addr },
    ClockGettime { clock: ClockId, tp: Addr },
    ClockGetres { clock: ClockId, res: Addr },
    Gettimeofday { tv: Addr, tz: Addr },
    Nanosleep { req: Addr, rem: Addr },
    Getitimer { which: ItimerWhich, value: Addr },
    Setitimer { which: ItimerWhich, new_value: Addr, old_value: Addr },
    Alarm { seconds: u32 },
    Uname { buf: Addr },
    Sysinfo { buf: Addr },
    Poll { fds: Addr, nfds: u32, timeout_ms: i32 },
    Pause,
    SchedYield,
}

impl SyscallRequest {
    /// Decodes a raw syscall. Unknown numbers yield `ENOSYS`; malformed
    /// closed-vocabulary arguments yield `EINVAL` here so handlers only see
    /// well-formed requests.
    pub fn decode(nr: u32, args: [Word; 6]) -> Result<SyscallRequest, Errno> {
        let sysno = Sysno::try_from(nr).map_err(|_| Errno::ENOSYS)?;
        let [a0, a1, a2, a3, a4, a5] = args;
        let req = match sysno {
            Sysno::exit => SyscallRequest::Exit { status: a0 as i32 },
            Sysno::exit_group => SyscallRequest::ExitGroup { status: a0 as i32 },
            Sysno::fork => SyscallRequest::Fork,
            Sysno::vfork => SyscallRequest::Vfork,
            Sysno::clone => SyscallRequest::Clone {
                flags: CloneFlags::from_bits_retain(a0 & !CloneFlags::CSIGNAL_MASK),
                exit_signal: a0 & CloneFlags::CSIGNAL_MASK,
                stack: a1,
                parent_tid: a2,
                tls: a3,
                child_tid: a4,
            },
            Sysno::execve => SyscallRequest::Execve {
                path: a0,
                argv: a1,
                envp: a2,
            },
            Sysno::waitpid => SyscallRequest::Waitpid {
                pid: a0 as i32,
                status: a1,
                options: WaitOptions::from_bits_retain(a2),
            },
            Sysno::wait4 => SyscallRequest::Wait4 {
                pid: a0 as i32,
                status: a1,
                options: WaitOptions::from_bits_retain(a2),
                rusage: a3,
            },

            Sysno::brk => SyscallRequest::Brk { addr: a0 },
            Sysno::mmap => SyscallRequest::OldMmap { args: a0 },
            Sysno::mmap2 => SyscallRequest::Mmap2 {
                addr: a0,
                length: a1,
                prot: ProtFlags::from_bits_retain(a2),
                flags: MapFlags::from_bits_retain(a3),
                fd: a4 as i32,
                pgoffset: a5,
            },
            Sysno::munmap => SyscallRequest::Munmap {
                addr: a0,
                length: a1,
            },
            Sysno::mprotect => SyscallRequest::Mprotect {
                addr: a0,
                length: a1,
                prot: ProtFlags::from_bits_retain(a2),
            },
            Sysno::madvise => SyscallRequest::Madvise {
                addr: a0,
                length: a1,
                advice: MadviseAdvice::try_from(a2).map_err(|_| Errno::EINVAL)?,
            },

            Sysno::open => SyscallRequest::Open {
                path: a0,
                flags: OpenFlags::from_bits_retain(a1),
                mode: a2,
            },
            Sysno::openat => SyscallRequest::Openat {
                dirfd: a0 as i32,
                path: a1,
                flags: OpenFlags::from_bits_retain(a2),
                mode: a3,
            },
            Sysno::close => SyscallRequest::Close { fd: a0 as i32 },
            Sysno::read => SyscallRequest::Read {
                fd: a0 as i32,
                buf: a1,
                count: a2,
            },
            Sysno::write => SyscallRequest::Write {
                fd: a0 as i32,
                buf: a1,
                count: a2,
            },
            Sysno::readv => SyscallRequest::Readv {
                fd: a0 as i32,
                iovec: a1,
                iovcnt: a2,
            },
            Sysno::writev => SyscallRequest::Writev {
                fd: a0 as i32,
                iovec: a1,
                iovcnt: a2,
            },
            Sysno::lseek => SyscallRequest::Lseek {
                fd: a0 as i32,
                offset: a1 as i32,
                whence: SeekWhence::try_from(a2).map_err(|_| Errno::EINVAL)?,
            },
            Sysno::_llseek => SyscallRequest::Llseek {
                fd: a0 as i32,
                offset_high: a1,
                offset_low: a2,
                result: a3,
                whence: SeekWhence::try_from(a4).map_err(|_| Errno::EINVAL)?,
            },
            Sysno::dup => SyscallRequest::Dup { fd: a0 as i32 },
            Sysno::dup2 => SyscallRequest::Dup2 {
                fd: a0 as i32,
                newfd: a1 as i32,
            },
            Sysno::fcntl | Sysno::fcntl64 => SyscallRequest::Fcntl {
                fd: a0 as i32,
                arg: FcntlArg::from_raw(a1, a2),
            },
            Sysno::flock => SyscallRequest::Flock {
                fd: a0 as i32,
                op: FlockOp::from_bits(a1).ok_or(Errno::EINVAL)?,
            },
            Sysno::ioctl => SyscallRequest::Ioctl {
                fd: a0 as i32,
                cmd: a1,
                arg: a2,
            },
            Sysno::ftruncate => SyscallRequest::Ftruncate {
                fd: a0 as i32,
                length: a1,
            },
            Sysno::fchmod => SyscallRequest::Fchmod {
                fd: a0 as i32,
                mode: a1,
            },
            Sysno::fchown32 => SyscallRequest::Fchown {
                fd: a0 as i32,
                owner: a1,
                group: a2,
            },
            Sysno::fsync => SyscallRequest::Fsync { fd: a0 as i32 },
            Sysno::sendfile | Sysno::sendfile64 => SyscallRequest::Sendfile {
                out_fd: a0 as i32,
                in_fd: a1 as i32,
                offset: a2,
                count: a3,
            },
            Sysno::getdents64 => SyscallRequest::Getdents64 {
                fd: a0 as i32,
                dirp: a1,
                count: a2,
            },

            Sysno::stat64 => SyscallRequest::Stat64 { path: a0, buf: a1 },
            Sysno::lstat64 => SyscallRequest::Lstat64 { path: a0, buf: a1 },
            Sysno::fstat64 => SyscallRequest::Fstat64 {
                fd: a0 as i32,
                buf: a1,
            },
            Sysno::fstatat64 => SyscallRequest::Fstatat64 {
                dirfd: a0 as i32,
                path: a1,
                buf: a2,
                flags: AtFlags::from_bits_retain(a3),
            },
            Sysno::access => SyscallRequest::Access {
                path: a0,
                mode: AccessMode::from_bits(a1).ok_or(Errno::EINVAL)?,
            },
            Sysno::readlink => SyscallRequest::Readlink {
                path: a0,
                buf: a1,
                size: a2,
            },
            Sysno::unlink => SyscallRequest::Unlink { path: a0 },
            Sysno::unlinkat => SyscallRequest::Unlinkat {
                dirfd: a0 as i32,
                path: a1,
                flags: AtFlags::from_bits_retain(a2),
            },
            Sysno::mkdir => SyscallRequest::Mkdir { path: a0, mode: a1 },
            Sysno::mkdirat => SyscallRequest::Mkdirat {
                dirfd: a0 as i32,
                path: a1,
                mode: a2,
            },
            Sysno::rmdir => SyscallRequest::Rmdir { path: a0 },
            Sysno::rename => SyscallRequest::Rename { from: a0, to: a1 },
            Sysno::statfs64 => SyscallRequest::Statfs64 {
                path: a0,
                size: a1,
                buf: a2,
            },
            Sysno::fstatfs64 => SyscallRequest::Fstatfs64 {
                fd: a0 as i32,
                size: a1,
                buf: a2,
            },
            Sysno::utimensat => SyscallRequest::Utimensat {
                dirfd: a0 as i32,
                path: a1,
                times: a2,
                flags: AtFlags::from_bits_retain(a3),
            },
            Sysno::mount => SyscallRequest::Mount {
                source: a0,
                target: a1,
                fstype: a2,
                flags: a3,
                data: a4,
            },

            Sysno::getpid => SyscallRequest::Getpid,
            Sysno::gettid => SyscallRequest::Gettid,
            Sysno::getppid => SyscallRequest::Getppid,
            Sysno::getpgid => SyscallRequest::Getpgid { pid: a0 as i32 },
            Sysno::setpgid => SyscallRequest::Setpgid {
                pid: a0 as i32,
                pgid: a1 as i32,
            },
            Sysno::getpgrp => SyscallRequest::Getpgrp,
            Sysno::getsid => SyscallRequest::Getsid { pid: a0 as i32 },
            Sysno::setsid => SyscallRequest::Setsid,
            Sysno::getuid | Sysno::getuid32 => SyscallRequest::Getuid,
            Sysno::geteuid | Sysno::geteuid32 => SyscallRequest::Geteuid,
            Sysno::getgid | Sysno::getgid32 => SyscallRequest::Getgid,
            Sysno::getegid | Sysno::getegid32 => SyscallRequest::Getegid,
            Sysno::getcwd => SyscallRequest::Getcwd { buf: a0, size: a1 },
            Sysno::chdir => SyscallRequest::Chdir { path: a0 },
            Sysno::fchdir => SyscallRequest::Fchdir { fd: a0 as i32 },
            Sysno::umask => SyscallRequest::Umask { mask: a0 },
            Sysno::set_tid_address => SyscallRequest::SetTidAddress { tidptr: a0 },
            Sysno::set_thread_area => SyscallRequest::SetThreadArea { user_desc: a0 },
            Sysno::kill => SyscallRequest::Kill {
                pid: a0 as i32,
                signal: a1 as i32,
            },
            Sysno::tkill => SyscallRequest::Tkill {
                tid: a0 as i32,
                signal: a1 as i32,
            },
            Sysno::tgkill => SyscallRequest::Tgkill {
                tgid: a0 as i32,
                tid: a1 as i32,
                signal: a2 as i32,
            },
            Sysno::getrlimit | Sysno::ugetrlimit => SyscallRequest::Getrlimit {
                resource: RlimitResource::try_from(a0).map_err(|_| Errno::EINVAL)?,
                rlim: a1,
            },
            Sysno::setrlimit => SyscallRequest::Setrlimit {
                resource: RlimitResource::try_from(a0).map_err(|_| Errno::EINVAL)?,
                rlim: a1,
            },
            Sysno::getrusage => SyscallRequest::Getrusage {
                who: a0 as i32,
                usage: a1,
            },

            Sysno::time => SyscallRequest::Time { tloc: a0 },
            Sysno::clock_gettime => SyscallRequest::ClockGettime {
                clock: ClockId::try_from(a0).map_err(|_| Errno::EINVAL)?,
                tp: a1,
            },
            Sysno::clock_getres => SyscallRequest::ClockGetres {
                clock: ClockId::try_from(a0).map_err(|_| Errno::EINVAL)?,
                res: a1,
            },
            Sysno::gettimeofday => SyscallRequest::Gettimeofday { tv: a0, tz: a1 },
            Sysno::nanosleep => SyscallRequest::Nanosleep { req: a0, rem: a1 },
            Sysno::getitimer => SyscallRequest::Getitimer {
                which: ItimerWhich::try_from(a0).map_err(|_| Errno::EINVAL)?,
                value: a1,
            },
            Sysno::setitimer => SyscallRequest::Setitimer {
                which: ItimerWhich::try_from(a0).map_err(|_| Errno::EINVAL)?,
                new_value: a1,
                old_value: a2,
            },
            Sysno::alarm => SyscallRequest::Alarm { seconds: a0 },
            Sysno::uname => SyscallRequest::Uname { buf: a0 },
            Sysno::sysinfo => SyscallRequest::Sysinfo { buf: a0 },
            Sysno::poll => SyscallRequest::Poll {
                fds: a0,
                nfds: a1,
                timeout_ms: a2 as i32,
            },
            Sysno::pause => SyscallRequest::Pause,
            Sysno::sched_yield => SyscallRequest::SchedYield,
        };
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn unknown_numbers_are_enosys() {
        assert_eq!(
            SyscallRequest::decode(0xdead, [0; 6]).unwrap_err(),
            Errno::ENOSYS
        );
        // socketcall is out of scope on this surface.
        assert_eq!(
            SyscallRequest::decode(102, [0; 6]).unwrap_err(),
            Errno::ENOSYS
        );
    }

    #[test]
    fn clone_splits_exit_signal() {
        let flags = 0x100 | 0x400 | 17; // VM | FILES | SIGCHLD
        let req = SyscallRequest::decode(120, [flags, 0, 0, 0, 0, 0]).unwrap();
        match req {
            SyscallRequest::Clone {
                flags, exit_signal, ..
            } => {
                assert!(flags.contains(CloneFlags::VM | CloneFlags::FILES));
                assert_eq!(exit_signal, 17);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn bad_closed_vocabulary_is_einval() {
        // lseek with whence 9
        assert_eq!(
            SyscallRequest::decode(19, [0, 0, 9, 0, 0, 0]).unwrap_err(),
            Errno::EINVAL
        );
        // flock with an unknown operation bit
        assert_eq!(
            SyscallRequest::decode(143, [0, 0x40, 0, 0, 0, 0]).unwrap_err(),
            Errno::EINVAL
        );
    }
}
