//! Common Linux-y items for the EmuKern shim.
//!
//! The guest ABI modeled here is 32-bit x86: addresses and syscall argument
//! words are `u32`, and the marshaled records carry the exact i386 field
//! widths and ordering. Any layout drift here breaks binary compatibility
//! with guest programs.

#![no_std]
#![allow(non_camel_case_types)]

use num_enum::TryFromPrimitive;

pub mod errno;
mod syscall;

pub use syscall::{Sysno, SyscallRequest};

/// A guest virtual address.
pub type Addr = u32;
/// A raw syscall argument word.
pub type Word = u32;
/// A process/thread identifier.
pub type Pid = i32;

/// Longest path the shim accepts from the guest.
pub const PATH_MAX: usize = 4096;

/// Special `dirfd` meaning "relative to the current working directory".
pub const AT_FDCWD: i32 = -100;

bitflags::bitflags! {
    /// Desired memory protection of a mapping (`PROT_*`).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ProtFlags: u32 {
        const PROT_READ = 1 << 0;
        const PROT_WRITE = 1 << 1;
        const PROT_EXEC = 1 << 2;
        /// <https://docs.rs/bitflags/*/bitflags/#externally-defined-flags>
        const _ = !0;
    }
}

bitflags::bitflags! {
    /// `mmap` behavior flags (`MAP_*`, i386 values).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Share this mapping. Mutually exclusive with `MAP_PRIVATE`.
        const MAP_SHARED = 0x1;
        /// Changes are private.
        const MAP_PRIVATE = 0x2;
        /// Interpret the address exactly, replacing any overlap.
        const MAP_FIXED = 0x10;
        /// Not backed by a file.
        const MAP_ANONYMOUS = 0x20;
        /// Used for stacks; the mapping may extend downward.
        const MAP_GROWSDOWN = 0x100;
        /// Do not reserve swap space.
        const MAP_NORESERVE = 0x4000;
        /// Populate page tables eagerly.
        const MAP_POPULATE = 0x8000;
        /// <https://docs.rs/bitflags/*/bitflags/#externally-defined-flags>
        const _ = !0;
    }
}

bitflags::bitflags! {
    /// `open` flags (`O_*`, i386 values).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const O_WRONLY = 0o1;
        const O_RDWR = 0o2;
        const O_ACCMODE = 0o3;
        const O_CREAT = 0o100;
        const O_EXCL = 0o200;
        const O_NOCTTY = 0o400;
        const O_TRUNC = 0o1000;
        const O_APPEND = 0o2000;
        const O_NONBLOCK = 0o4000;
        const O_LARGEFILE = 0o100000;
        const O_DIRECTORY = 0o200000;
        const O_NOFOLLOW = 0o400000;
        const O_CLOEXEC = 0o2000000;
        /// <https://docs.rs/bitflags/*/bitflags/#externally-defined-flags>
        const _ = !0;
    }
}

impl OpenFlags {
    /// `O_RDONLY` is the absence of the other access bits.
    pub fn readable(self) -> bool {
        !self.contains(OpenFlags::O_WRONLY) || self.contains(OpenFlags::O_RDWR)
    }

    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR)
    }

    /// The subset reported and settable through `F_GETFL`/`F_SETFL`.
    pub const STATUS_FLAGS: OpenFlags = OpenFlags::O_APPEND.union(OpenFlags::O_NONBLOCK);
}

bitflags::bitflags! {
    /// Per-descriptor flags (`F_GETFD`/`F_SETFD`).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FdFlags: u32 {
        /// Close the descriptor across `execve`.
        const FD_CLOEXEC = 0x1;
        /// <https://docs.rs/bitflags/*/bitflags/#externally-defined-flags>
        const _ = !0;
    }
}

bitflags::bitflags! {
    /// `clone` flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CloneFlags: u32 {
        const VM = 0x100;
        const FS = 0x200;
        const FILES = 0x400;
        const SIGHAND = 0x800;
        const PTRACE = 0x2000;
        const VFORK = 0x4000;
        const PARENT = 0x8000;
        const THREAD = 0x10000;
        const NEWNS = 0x20000;
        const SYSVSEM = 0x40000;
        const SETTLS = 0x80000;
        const PARENT_SETTID = 0x100000;
        const CHILD_CLEARTID = 0x200000;
        const DETACHED = 0x400000;
        const UNTRACED = 0x800000;
        const CHILD_SETTID = 0x1000000;
        /// <https://docs.rs/bitflags/*/bitflags/#externally-defined-flags>
        const _ = !0;
    }
}

impl CloneFlags {
    /// The low byte of the clone flags word carries the exit signal number.
    pub const CSIGNAL_MASK: u32 = 0xff;
}

bitflags::bitflags! {
    /// `wait4`/`waitpid` options.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WaitOptions: u32 {
        const WNOHANG = 1;
        const WUNTRACED = 2;
        const WCONTINUED = 8;
        /// <https://docs.rs/bitflags/*/bitflags/#externally-defined-flags>
        const _ = !0;
    }
}

bitflags::bitflags! {
    /// `flock` operation word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FlockOp: u32 {
        const LOCK_SH = 1;
        const LOCK_EX = 2;
        const LOCK_NB = 4;
        const LOCK_UN = 8;
    }
}

bitflags::bitflags! {
    /// `access` mode word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AccessMode: u32 {
        const X_OK = 1;
        const W_OK = 2;
        const R_OK = 4;
    }
}

bitflags::bitflags! {
    /// Flags for the `*at` syscalls.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AtFlags: u32 {
        const AT_SYMLINK_NOFOLLOW = 0x100;
        const AT_REMOVEDIR = 0x200;
        const AT_SYMLINK_FOLLOW = 0x400;
        const AT_EMPTY_PATH = 0x1000;
        /// <https://docs.rs/bitflags/*/bitflags/#externally-defined-flags>
        const _ = !0;
    }
}

bitflags::bitflags! {
    /// `poll` event bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PollEvents: u16 {
        const POLLIN = 0x1;
        const POLLPRI = 0x2;
        const POLLOUT = 0x4;
        const POLLERR = 0x8;
        const POLLHUP = 0x10;
        const POLLNVAL = 0x20;
        /// <https://docs.rs/bitflags/*/bitflags/#externally-defined-flags>
        const _ = !0;
    }
}

/// `lseek`/`_llseek` whence values.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum SeekWhence {
    Set = 0,
    Current = 1,
    End = 2,
}

/// `madvise` advice values.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum MadviseAdvice {
    Normal = 0,
    Random = 1,
    Sequential = 2,
    WillNeed = 3,
    DontNeed = 4,
    Free = 8,
    DontFork = 10,
    DoFork = 11,
}

/// `clock_gettime` clock identifiers.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum ClockId {
    Realtime = 0,
    Monotonic = 1,
}

/// `getitimer`/`setitimer` timer selectors.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum ItimerWhich {
    Real = 0,
    Virtual = 1,
    Prof = 2,
}

/// Signal numbers.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum Signal {
    SIGHUP = 1,
    SIGINT = 2,
    SIGQUIT = 3,
    SIGILL = 4,
    SIGTRAP = 5,
    SIGABRT = 6,
    SIGBUS = 7,
    SIGFPE = 8,
    SIGKILL = 9,
    SIGUSR1 = 10,
    SIGSEGV = 11,
    SIGUSR2 = 12,
    SIGPIPE = 13,
    SIGALRM = 14,
    SIGTERM = 15,
    SIGSTKFLT = 16,
    SIGCHLD = 17,
    SIGCONT = 18,
    SIGSTOP = 19,
    SIGTSTP = 20,
    SIGTTIN = 21,
    SIGTTOU = 22,
    SIGURG = 23,
    SIGXCPU = 24,
    SIGXFSZ = 25,
    SIGVTALRM = 26,
    SIGPROF = 27,
    SIGWINCH = 28,
    SIGIO = 29,
    SIGPWR = 30,
    SIGSYS = 31,
}

impl Signal {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Whether the default disposition terminates the receiving process.
    /// (Coarse model: core-dumping and plain-terminating defaults are not
    /// distinguished.)
    pub fn default_is_fatal(self) -> bool {
        !matches!(
            self,
            Signal::SIGCHLD
                | Signal::SIGCONT
                | Signal::SIGSTOP
                | Signal::SIGTSTP
                | Signal::SIGTTIN
                | Signal::SIGTTOU
                | Signal::SIGURG
                | Signal::SIGWINCH
        )
    }

    /// Whether the default disposition stops the receiving process.
    pub fn default_is_stop(self) -> bool {
        matches!(
            self,
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
        )
    }
}

/// A set of pending or blocked signals.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct SigSet(u64);

impl SigSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn add(&mut self, signum: Signal) {
        self.0 |= 1 << (signum as u64 - 1);
    }

    pub fn remove(&mut self, signum: Signal) {
        self.0 &= !(1 << (signum as u64 - 1));
    }

    pub fn contains(&self, signum: Signal) -> bool {
        (self.0 & (1 << (signum as u64 - 1))) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The lowest-numbered signal present and not masked by `blocked`.
    pub fn first_deliverable(&self, blocked: &SigSet) -> Option<Signal> {
        let pending = self.0 & !blocked.0;
        if pending == 0 {
            return None;
        }
        let num = pending.trailing_zeros() as i32 + 1;
        Signal::try_from(num).ok()
    }
}

/// Decoded `fcntl64` command + argument.
#[derive(Debug)]
pub enum FcntlArg {
    /// `F_DUPFD`: duplicate onto the lowest fd at or above the argument.
    DupFd { min: u32 },
    /// `F_DUPFD_CLOEXEC`.
    DupFdCloexec { min: u32 },
    /// `F_GETFD`.
    GetFd,
    /// `F_SETFD`.
    SetFd(FdFlags),
    /// `F_GETFL`.
    GetFl,
    /// `F_SETFL`.
    SetFl(OpenFlags),
    /// Anything this surface does not model.
    Unsupported(u32),
}

const F_DUPFD: u32 = 0;
const F_GETFD: u32 = 1;
const F_SETFD: u32 = 2;
const F_GETFL: u32 = 3;
const F_SETFL: u32 = 4;
const F_DUPFD_CLOEXEC: u32 = 1030;

impl FcntlArg {
    pub fn from_raw(cmd: u32, arg: u32) -> Self {
        match cmd {
            F_DUPFD => Self::DupFd { min: arg },
            F_DUPFD_CLOEXEC => Self::DupFdCloexec { min: arg },
            F_GETFD => Self::GetFd,
            F_SETFD => Self::SetFd(FdFlags::from_bits_retain(arg)),
            F_GETFL => Self::GetFl,
            F_SETFL => Self::SetFl(OpenFlags::from_bits_retain(arg)),
            other => Self::Unsupported(other),
        }
    }
}

/// Marker for plain-old-data records that may be copied to/from guest
/// memory byte-wise.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (packed where the ABI packs), contain
/// no padding whose contents the guest could observe as garbage, and be
/// valid for every bit pattern.
pub unsafe trait UserAbi: Copy + 'static {}

unsafe impl UserAbi for u8 {}
unsafe impl UserAbi for u16 {}
unsafe impl UserAbi for u32 {}
unsafe impl UserAbi for u64 {}
unsafe impl UserAbi for i8 {}
unsafe impl UserAbi for i16 {}
unsafe impl UserAbi for i32 {}
unsafe impl UserAbi for i64 {}

/// Field width of every `uname` string, terminator included.
pub const UTSNAME_LENGTH: usize = 65;

/// The `uname` record.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UtsName {
    pub sysname: [u8; UTSNAME_LENGTH],
    pub nodename: [u8; UTSNAME_LENGTH],
    pub release: [u8; UTSNAME_LENGTH],
    pub version: [u8; UTSNAME_LENGTH],
    pub machine: [u8; UTSNAME_LENGTH],
    pub domainname: [u8; UTSNAME_LENGTH],
}

unsafe impl UserAbi for UtsName {}

impl UtsName {
    /// Builds a field from a string, truncating to fit with a terminator.
    pub fn field(s: &str) -> [u8; UTSNAME_LENGTH] {
        let mut out = [0u8; UTSNAME_LENGTH];
        let n = s.len().min(UTSNAME_LENGTH - 1);
        out[..n].copy_from_slice(&s.as_bytes()[..n]);
        out
    }
}

/// The `sysinfo` record (i386 layout; the trailing pad keeps the size
/// stable across ABI revisions).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct SysInfo {
    pub uptime: u32,
    pub loads: [u32; 3],
    pub totalram: u32,
    pub freeram: u32,
    pub sharedram: u32,
    pub bufferram: u32,
    pub totalswap: u32,
    pub freeswap: u32,
    pub procs: u16,
    pub pad: u16,
    pub totalhigh: u32,
    pub freehigh: u32,
    pub mem_unit: u32,
    pub _f: [u8; 8],
}

unsafe impl UserAbi for SysInfo {}

/// The `iovec` record (`readv`/`writev`).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct IoVec {
    pub base: Addr,
    pub len: u32,
}

unsafe impl UserAbi for IoVec {}

/// The `pollfd` record.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PollFd {
    pub fd: i32,
    pub events: i16,
    pub revents: i16,
}

unsafe impl UserAbi for PollFd {}

/// The `timespec` record (32-bit fields on this ABI).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timespec {
    pub sec: u32,
    pub nsec: u32,
}

unsafe impl UserAbi for Timespec {}

pub const NSEC_PER_SEC: u32 = 1_000_000_000;
pub const USEC_PER_SEC: u32 = 1_000_000;

impl Timespec {
    pub fn from_duration(d: core::time::Duration) -> Self {
        Self {
            sec: d.as_secs() as u32,
            nsec: d.subsec_nanos(),
        }
    }

    /// `None` if the nanosecond field is out of range.
    pub fn to_duration(self) -> Option<core::time::Duration> {
        if self.nsec >= NSEC_PER_SEC {
            return None;
        }
        Some(core::time::Duration::new(self.sec.into(), self.nsec))
    }
}

/// The `timeval` record (32-bit fields on this ABI).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeVal {
    pub sec: u32,
    pub usec: u32,
}

unsafe impl UserAbi for TimeVal {}

impl TimeVal {
    pub fn from_duration(d: core::time::Duration) -> Self {
        Self {
            sec: d.as_secs() as u32,
            usec: d.subsec_micros(),
        }
    }

    pub fn to_duration(self) -> Option<core::time::Duration> {
        if self.usec >= USEC_PER_SEC {
            return None;
        }
        Some(core::time::Duration::new(
            self.sec.into(),
            self.usec * 1000,
        ))
    }

    pub fn is_zero(self) -> bool {
        self.sec == 0 && self.usec == 0
    }
}

/// The `itimerval` record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ITimerVal {
    pub interval: TimeVal,
    pub value: TimeVal,
}

unsafe impl UserAbi for ITimerVal {}

/// The i386 `stat64` record. Packed: the ABI places 8-byte fields at
/// 4-byte offsets.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FileStat64 {
    pub st_dev: u64,
    pub __pad0: [u8; 4],
    pub __st_ino: u32,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u64,
    pub __pad3: [u8; 4],
    pub st_size: i64,
    pub st_blksize: u32,
    pub st_blocks: u64,
    pub st_atime: u32,
    pub st_atime_nsec: u32,
    pub st_mtime: u32,
    pub st_mtime_nsec: u32,
    pub st_ctime: u32,
    pub st_ctime_nsec: u32,
    pub st_ino: u64,
}

unsafe impl UserAbi for FileStat64 {}

/// File-type bits of `st_mode`.
#[repr(u32)]
pub enum InodeType {
    NamedPipe = 0o010000,
    CharDevice = 0o020000,
    Dir = 0o040000,
    BlockDevice = 0o060000,
    File = 0o100000,
    SymLink = 0o120000,
    Socket = 0o140000,
}

/// The i386 `statfs64` record.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct StatFs64 {
    pub f_type: u32,
    pub f_bsize: u32,
    pub f_blocks: u64,
    pub f_bfree: u64,
    pub f_bavail: u64,
    pub f_files: u64,
    pub f_ffree: u64,
    pub f_fsid: [u32; 2],
    pub f_namelen: u32,
    pub f_frsize: u32,
    pub f_flags: u32,
    pub f_spare: [u32; 4],
}

unsafe impl UserAbi for StatFs64 {}

/// Fixed-size head of a `linux_dirent64` record; the name bytes follow.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Dirent64Header {
    pub d_ino: u64,
    pub d_off: i64,
    pub d_reclen: u16,
    pub d_type: u8,
}

unsafe impl UserAbi for Dirent64Header {}

/// `d_type` values in `linux_dirent64`.
pub mod dirent_type {
    pub const DT_UNKNOWN: u8 = 0;
    pub const DT_FIFO: u8 = 1;
    pub const DT_CHR: u8 = 2;
    pub const DT_DIR: u8 = 4;
    pub const DT_BLK: u8 = 6;
    pub const DT_REG: u8 = 8;
    pub const DT_LNK: u8 = 10;
    pub const DT_SOCK: u8 = 12;
}

/// The `rusage` record (i386). The shim zero-fills everything past the
/// times it actually tracks.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RUsage {
    pub ru_utime: TimeVal,
    pub ru_stime: TimeVal,
    pub ru_maxrss: u32,
    pub ru_ixrss: u32,
    pub ru_idrss: u32,
    pub ru_isrss: u32,
    pub ru_minflt: u32,
    pub ru_majflt: u32,
    pub ru_nswap: u32,
    pub ru_inblock: u32,
    pub ru_oublock: u32,
    pub ru_msgsnd: u32,
    pub ru_msgrcv: u32,
    pub ru_nsignals: u32,
    pub ru_nvcsw: u32,
    pub ru_nivcsw: u32,
}

unsafe impl UserAbi for RUsage {}

/// The `rlimit` record (32-bit fields on this ABI).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RLimit {
    pub rlim_cur: u32,
    pub rlim_max: u32,
}

unsafe impl UserAbi for RLimit {}

/// `getrlimit`/`setrlimit` resource selectors this surface reports.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum RlimitResource {
    Cpu = 0,
    Fsize = 1,
    Data = 2,
    Stack = 3,
    Core = 4,
    Rss = 5,
    Nproc = 6,
    Nofile = 7,
    Memlock = 8,
    As = 9,
}

/// Exit-status word encoding, as consumed by `wait`-family callers.
pub mod wstatus {
    /// Normal termination with `code`.
    pub fn exited(code: i32) -> u32 {
        ((code as u32) & 0xff) << 8
    }

    /// Termination by `signal`.
    pub fn signaled(signal: i32) -> u32 {
        (signal as u32) & 0x7f
    }

    /// Stopped by `signal` (job control).
    pub fn stopped(signal: i32) -> u32 {
        0x7f | (((signal as u32) & 0xff) << 8)
    }

    /// Continued by `SIGCONT`.
    pub const CONTINUED: u32 = 0xffff;
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn abi_record_sizes() {
        // These sizes are the wire contract with guest binaries.
        assert_eq!(core::mem::size_of::<UtsName>(), 6 * 65);
        assert_eq!(core::mem::size_of::<SysInfo>(), 64);
        assert_eq!(core::mem::size_of::<IoVec>(), 8);
        assert_eq!(core::mem::size_of::<PollFd>(), 8);
        assert_eq!(core::mem::size_of::<Timespec>(), 8);
        assert_eq!(core::mem::size_of::<TimeVal>(), 8);
        assert_eq!(core::mem::size_of::<ITimerVal>(), 16);
        assert_eq!(core::mem::size_of::<FileStat64>(), 96);
        assert_eq!(core::mem::size_of::<StatFs64>(), 84);
        assert_eq!(core::mem::size_of::<Dirent64Header>(), 19);
        assert_eq!(core::mem::size_of::<RUsage>(), 72);
    }

    #[test]
    fn wstatus_encoding() {
        assert_eq!(wstatus::exited(42), 42 << 8);
        assert_eq!(wstatus::signaled(9), 9);
        assert_eq!(wstatus::stopped(19), 0x7f | (19 << 8));
    }

    #[test]
    fn sigset_bookkeeping() {
        let mut set = SigSet::empty();
        assert!(set.is_empty());
        set.add(Signal::SIGCHLD);
        set.add(Signal::SIGALRM);
        assert!(set.contains(Signal::SIGCHLD));

        // The lowest unblocked pending signal wins.
        assert_eq!(
            set.first_deliverable(&SigSet::empty()),
            Some(Signal::SIGALRM)
        );
        let mut blocked = SigSet::empty();
        blocked.add(Signal::SIGALRM);
        assert_eq!(set.first_deliverable(&blocked), Some(Signal::SIGCHLD));
        set.remove(Signal::SIGALRM);
        assert_eq!(set.first_deliverable(&SigSet::empty()), Some(Signal::SIGCHLD));
    }
}
