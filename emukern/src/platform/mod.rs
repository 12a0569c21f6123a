//! The host platform underneath the emulation core.
//!
//! Each trait in this module is one capability the core consumes from its
//! embedder: futex-shaped blocking primitives, clocks, execution-unit
//! control, the guest-memory copy interface, host memory backing for address
//! spaces, and the host filesystem. A complete embedder implements whichever
//! subset the subsystems it instantiates require; nothing in this crate
//! reaches the host except through these traits.

pub mod page_mgmt;

#[cfg(any(test, feature = "mock-platform"))]
pub mod mock;

use alloc::string::String;
use alloc::vec::Vec;
use thiserror::Error;

/// A provider of raw mutexes.
pub trait RawMutexProvider {
    type RawMutex: RawMutex;
}

/// A raw blocking primitive, expected to roughly match (or be implemented
/// with) a futex: an atomic word plus compare-and-block / wake operations.
pub trait RawMutex: Send + Sync {
    /// An unlocked raw mutex, usable in `const` contexts.
    const INIT: Self;

    /// Returns a reference to the underlying atomic value.
    fn underlying_atomic(&self) -> &core::sync::atomic::AtomicU32;

    /// Wake up to `n` threads blocked on this raw mutex, returning how many
    /// were actually woken.
    fn wake_many(&self, n: usize) -> usize;

    /// Wake one blocked thread. Returns whether a thread was woken.
    fn wake_one(&self) -> bool {
        self.wake_many(1) > 0
    }

    /// Wake every blocked thread, returning how many were woken.
    fn wake_all(&self) -> usize {
        self.wake_many(usize::MAX)
    }

    /// If the underlying value is still `val`, block until woken.
    fn block(&self, val: u32) -> Result<(), ImmediatelyWokenUp>;

    /// If the underlying value is still `val`, block until woken or until
    /// `time` has elapsed.
    fn block_or_timeout(
        &self,
        val: u32,
        time: core::time::Duration,
    ) -> Result<UnblockedOrTimedOut, ImmediatelyWokenUp>;
}

/// The block call returned without sleeping because the underlying value no
/// longer matched.
pub struct ImmediatelyWokenUp;

/// Whether a timed block was woken or ran out its timeout.
#[must_use]
pub enum UnblockedOrTimedOut {
    Unblocked,
    TimedOut,
}

/// An interface to monotonic and wall-clock time.
pub trait TimeProvider {
    type Instant: Instant;
    type SystemTime: SystemTime;

    /// Returns the monotonic "now".
    fn now(&self) -> Self::Instant;

    /// Returns the current wall-clock time.
    fn current_time(&self) -> Self::SystemTime;
}

/// An opaque measurement of a monotonically nondecreasing clock.
pub trait Instant: Copy + PartialEq + PartialOrd + Send + Sync {
    /// Time elapsed from `earlier` to `self`, or `None` if `earlier` is
    /// later than `self`.
    fn checked_duration_since(&self, earlier: &Self) -> Option<core::time::Duration>;

    /// Time elapsed from `earlier` to `self`, clamped to zero.
    fn duration_since(&self, earlier: &Self) -> core::time::Duration {
        self.checked_duration_since(earlier)
            .unwrap_or(core::time::Duration::ZERO)
    }

    /// This instant advanced by `duration`, or `None` on overflow.
    fn checked_add(&self, duration: core::time::Duration) -> Option<Self>;
}

/// An opaque wall-clock timestamp.
pub trait SystemTime {
    const UNIX_EPOCH: Self;

    /// Time elapsed from `earlier` to `self`; `Err` carries the magnitude if
    /// `earlier` is in the future.
    fn duration_since(&self, earlier: &Self) -> Result<core::time::Duration, core::time::Duration>;
}

/// Identify and interrupt host execution units.
///
/// Each guest thread maps onto one host-scheduled execution unit. The core
/// never creates or schedules those units itself; it only needs to name the
/// current one and to be able to kick a unit out of guest execution (signal
/// delivery to a running task).
pub trait ThreadProvider {
    type ThreadHandle: Clone + Send + Sync;

    /// Returns a handle for the calling execution unit.
    fn current_thread(&self) -> Self::ThreadHandle;

    /// Requests that the given execution unit stop running guest code and
    /// re-enter the shim as soon as possible.
    fn interrupt_thread(&self, thread: &Self::ThreadHandle);
}

/// The user-memory copy capability.
///
/// All movement of bytes between guest virtual memory and kernel buffers
/// goes through this interface; a failed copy is reported as a
/// [`GuestMemoryFault`] and must never surface as a host-level fault.
pub trait GuestMemoryProvider {
    /// Copy `buf.len()` bytes out of guest memory at `addr`.
    fn read_guest(&self, addr: usize, buf: &mut [u8]) -> Result<(), GuestMemoryFault>;

    /// Copy `bytes` into guest memory at `addr`.
    fn write_guest(&self, addr: usize, bytes: &[u8]) -> Result<(), GuestMemoryFault>;

    /// Read a NUL-terminated string out of guest memory, scanning at most
    /// `max_len` bytes (terminator included).
    fn read_guest_cstr(&self, addr: usize, max_len: usize) -> Result<Vec<u8>, GuestStringFault> {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        for i in 0..max_len {
            self.read_guest(addr.wrapping_add(i), &mut byte)?;
            if byte[0] == 0 {
                return Ok(out);
            }
            out.push(byte[0]);
        }
        Err(GuestStringFault::TooLong { max_len })
    }
}

/// A guest pointer argument could not be read or written.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("guest memory fault at {addr:#x} ({len} bytes)")]
pub struct GuestMemoryFault {
    pub addr: usize,
    pub len: usize,
}

/// Failure reading a NUL-terminated guest string.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestStringFault {
    #[error(transparent)]
    Fault(#[from] GuestMemoryFault),
    #[error("string exceeds {max_len} bytes")]
    TooLong { max_len: usize },
}

/// An interface to dumping debug output for tracing purposes.
pub trait DebugLogProvider {
    /// Print `msg` to the debug log. Newlines are not appended.
    fn debug_log_print(&self, msg: &str);
}

/// The host filesystem capability, keyed by resolved host paths.
///
/// The core layers guest fd semantics over these handles; the actual I/O,
/// path translation, and mount handling belong to the implementation.
pub trait FileProvider {
    type File: HostFile;

    /// Open (or create, per `flags`) the file at `path`.
    fn open(&self, path: &str, flags: HostOpenFlags, mode: u32) -> Result<Self::File, HostIoError>;

    /// Status of the file at `path`. `follow_links` selects stat-vs-lstat
    /// behavior.
    fn status(&self, path: &str, follow_links: bool) -> Result<HostFileStatus, HostIoError>;

    /// Target of the symbolic link at `path`.
    fn read_link(&self, path: &str) -> Result<String, HostIoError>;

    /// Remove the file at `path`.
    fn unlink(&self, path: &str) -> Result<(), HostIoError>;

    /// Create a directory at `path`.
    fn make_dir(&self, path: &str, mode: u32) -> Result<(), HostIoError>;

    /// Remove the (empty) directory at `path`.
    fn remove_dir(&self, path: &str) -> Result<(), HostIoError>;

    /// Rename `from` to `to`.
    fn rename(&self, from: &str, to: &str) -> Result<(), HostIoError>;

    /// Change the permission bits of the file at `path`.
    fn set_mode(&self, path: &str, mode: u32) -> Result<(), HostIoError>;

    /// Update timestamps (durations since the epoch) of the file at `path`.
    /// `None` leaves the corresponding timestamp untouched.
    fn set_times(
        &self,
        path: &str,
        accessed: Option<core::time::Duration>,
        modified: Option<core::time::Duration>,
    ) -> Result<(), HostIoError>;

    /// Statistics of the filesystem containing `path`.
    fn fs_status(&self, path: &str) -> Result<HostFsStatus, HostIoError>;
}

/// An open host file handle.
pub trait HostFile: Send + Sync {
    /// Read into `buf`, either at the handle's current position (`None`,
    /// advancing it) or at an absolute `offset` (position unchanged).
    fn read(&self, buf: &mut [u8], offset: Option<u64>) -> Result<usize, HostIoError>;

    /// Write from `buf`; offset semantics as for [`read`](Self::read).
    fn write(&self, buf: &[u8], offset: Option<u64>) -> Result<usize, HostIoError>;

    /// Reposition the handle, returning the new absolute offset.
    fn seek(&self, pos: HostSeekFrom) -> Result<u64, HostIoError>;

    /// Status of the open file.
    fn status(&self) -> Result<HostFileStatus, HostIoError>;

    /// Truncate (or extend with zeros) to `len` bytes.
    fn truncate(&self, len: u64) -> Result<(), HostIoError>;

    /// Change the permission bits.
    fn set_mode(&self, mode: u32) -> Result<(), HostIoError>;

    /// Directory entries, if this handle is a directory.
    fn dir_entries(&self) -> Result<Vec<HostDirEntry>, HostIoError>;

    /// Stable identity of the underlying file (advisory locks and `st_dev`/
    /// `st_ino` reporting key off this).
    fn identity(&self) -> FileIdentity;
}

bitflags::bitflags! {
    /// Host-level open disposition. Guest `O_*` words are reduced to these
    /// before crossing the capability boundary.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HostOpenFlags: u32 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const CREATE    = 1 << 2;
        const EXCLUSIVE = 1 << 3;
        const TRUNCATE  = 1 << 4;
        const APPEND    = 1 << 5;
        const DIRECTORY = 1 << 6;
    }
}

/// Where a [`HostFile::seek`] is measured from.
#[derive(Clone, Copy, Debug)]
pub enum HostSeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// The kind of object behind a host path or handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostFileType {
    Regular,
    Directory,
    SymbolicLink,
    CharacterDevice,
    BlockDevice,
    Fifo,
    Socket,
}

/// Stable (device, inode) identity of a host file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
}

/// Host-side file status, in host-neutral units.
#[derive(Clone, Debug)]
pub struct HostFileStatus {
    pub file_type: HostFileType,
    /// Permission bits, `0o777`-style.
    pub mode: u32,
    pub size: u64,
    pub identity: FileIdentity,
    pub link_count: u32,
    /// Timestamps as durations since the epoch.
    pub accessed: core::time::Duration,
    pub modified: core::time::Duration,
    pub changed: core::time::Duration,
}

/// One directory entry from [`HostFile::dir_entries`].
#[derive(Clone, Debug)]
pub struct HostDirEntry {
    pub name: String,
    pub inode: u64,
    pub file_type: HostFileType,
}

/// Filesystem-level statistics for `statfs` reporting.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostFsStatus {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

/// Host-level I/O failures, translated into the guest errno taxonomy by the
/// shim.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostIoError {
    #[error("no such file or directory")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("file exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("illegal seek")]
    IllegalSeek,
    #[error("name too long")]
    NameTooLong,
    #[error("too many levels of symbolic links")]
    TooManyLinks,
    #[error("no space left on device")]
    NoSpace,
    #[error("read-only file system")]
    ReadOnly,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("operation would block")]
    WouldBlock,
    #[error("operation not supported")]
    NotSupported,
    #[error("input/output error")]
    Io,
}
