//! Error handling. See [`Errno`].

use thiserror::Error;

/// Linux error numbers.
///
/// A transparent wrapper around the guest's error numbers, providing type
/// safety by requiring explicit conversions to/from raw integers. Handlers
/// return `Result<_, Errno>`; the dispatcher encodes the error into the
/// guest's negative-return-value convention with [`Errno::as_neg`].
#[derive(PartialEq, Eq, Clone, Copy, Error)]
pub struct Errno {
    value: core::num::NonZeroU8,
}

macro_rules! errno_constants {
    ($(($name:ident, $value:expr, $text:expr),)*) => {
        impl Errno {
            $(pub const $name: Errno = Errno::from_const($value);)*

            /// A short human-readable name for the error.
            pub fn as_str(self) -> &'static str {
                match self.value.get() {
                    $($value => $text,)*
                    _ => "unknown error",
                }
            }
        }
    };
}

errno_constants! {
    (EPERM, 1, "operation not permitted"),
    (ENOENT, 2, "no such file or directory"),
    (ESRCH, 3, "no such process"),
    (EINTR, 4, "interrupted system call"),
    (EIO, 5, "input/output error"),
    (ENXIO, 6, "no such device or address"),
    (E2BIG, 7, "argument list too long"),
    (ENOEXEC, 8, "exec format error"),
    (EBADF, 9, "bad file descriptor"),
    (ECHILD, 10, "no child processes"),
    (EAGAIN, 11, "resource temporarily unavailable"),
    (ENOMEM, 12, "cannot allocate memory"),
    (EACCES, 13, "permission denied"),
    (EFAULT, 14, "bad address"),
    (EBUSY, 16, "device or resource busy"),
    (EEXIST, 17, "file exists"),
    (ENODEV, 19, "no such device"),
    (ENOTDIR, 20, "not a directory"),
    (EISDIR, 21, "is a directory"),
    (EINVAL, 22, "invalid argument"),
    (ENFILE, 23, "too many open files in system"),
    (EMFILE, 24, "too many open files"),
    (ENOTTY, 25, "inappropriate ioctl for device"),
    (EFBIG, 27, "file too large"),
    (ENOSPC, 28, "no space left on device"),
    (ESPIPE, 29, "illegal seek"),
    (EROFS, 30, "read-only file system"),
    (EPIPE, 32, "broken pipe"),
    (EDOM, 33, "numerical argument out of domain"),
    (ERANGE, 34, "numerical result out of range"),
    (EDEADLK, 35, "resource deadlock avoided"),
    (ENAMETOOLONG, 36, "file name too long"),
    (ENOLCK, 37, "no locks available"),
    (ENOSYS, 38, "function not implemented"),
    (ENOTEMPTY, 39, "directory not empty"),
    (ELOOP, 40, "too many levels of symbolic links"),
    (EOVERFLOW, 75, "value too large for defined data type"),
    (EOPNOTSUPP, 95, "operation not supported"),
}

impl Errno {
    /// `EWOULDBLOCK` is `EAGAIN` on Linux.
    pub const EWOULDBLOCK: Errno = Errno::EAGAIN;

    /// The negative integer representation used by the guest return
    /// convention.
    pub fn as_neg(self) -> i32 {
        -i32::from(self)
    }

    const fn from_const(v: u8) -> Self {
        Self {
            value: core::num::NonZeroU8::new(v).unwrap(),
        }
    }
}

impl From<Errno> for i32 {
    fn from(e: Errno) -> Self {
        e.value.get().into()
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl core::fmt::Debug for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Errno({} = {})", self.value.get(), self.as_str())
    }
}

impl From<emukern::platform::GuestMemoryFault> for Errno {
    fn from(_: emukern::platform::GuestMemoryFault) -> Self {
        Errno::EFAULT
    }
}

impl From<emukern::platform::GuestStringFault> for Errno {
    fn from(value: emukern::platform::GuestStringFault) -> Self {
        match value {
            emukern::platform::GuestStringFault::Fault(_) => Errno::EFAULT,
            emukern::platform::GuestStringFault::TooLong { .. } => Errno::ENAMETOOLONG,
        }
    }
}

impl From<emukern::platform::HostIoError> for Errno {
    fn from(value: emukern::platform::HostIoError) -> Self {
        use emukern::platform::HostIoError;
        match value {
            HostIoError::NotFound => Errno::ENOENT,
            HostIoError::PermissionDenied => Errno::EACCES,
            HostIoError::AlreadyExists => Errno::EEXIST,
            HostIoError::NotADirectory => Errno::ENOTDIR,
            HostIoError::IsADirectory => Errno::EISDIR,
            HostIoError::DirectoryNotEmpty => Errno::ENOTEMPTY,
            HostIoError::InvalidArgument => Errno::EINVAL,
            HostIoError::IllegalSeek => Errno::ESPIPE,
            HostIoError::NameTooLong => Errno::ENAMETOOLONG,
            HostIoError::TooManyLinks => Errno::ELOOP,
            HostIoError::NoSpace => Errno::ENOSPC,
            HostIoError::ReadOnly => Errno::EROFS,
            HostIoError::BrokenPipe => Errno::EPIPE,
            HostIoError::WouldBlock => Errno::EAGAIN,
            HostIoError::NotSupported => Errno::EOPNOTSUPP,
            HostIoError::Io => Errno::EIO,
        }
    }
}

impl From<emukern::mm::MapError> for Errno {
    fn from(value: emukern::mm::MapError) -> Self {
        use emukern::mm::MapError;
        match value {
            MapError::Unaligned | MapError::InvalidLength | MapError::InvalidRange => Errno::EINVAL,
            MapError::AddressInUse => Errno::EEXIST,
            MapError::OutOfMemory => Errno::ENOMEM,
            MapError::PopulateFailed => Errno::EIO,
            _ => Errno::EINVAL,
        }
    }
}

impl From<emukern::mm::UnmapError> for Errno {
    fn from(value: emukern::mm::UnmapError) -> Self {
        use emukern::mm::UnmapError;
        match value {
            UnmapError::Unaligned | UnmapError::InvalidLength => Errno::EINVAL,
        }
    }
}

impl From<emukern::mm::ProtectError> for Errno {
    fn from(value: emukern::mm::ProtectError) -> Self {
        use emukern::mm::ProtectError;
        match value {
            ProtectError::Unaligned | ProtectError::InvalidLength => Errno::EINVAL,
            ProtectError::NotMapped(_) => Errno::ENOMEM,
            ProtectError::NoAccess { .. } => Errno::EACCES,
            ProtectError::Backing(_) => Errno::ENOMEM,
        }
    }
}

impl From<emukern::mm::AdviseError> for Errno {
    fn from(value: emukern::mm::AdviseError) -> Self {
        use emukern::mm::AdviseError;
        match value {
            AdviseError::Unaligned | AdviseError::InvalidLength => Errno::EINVAL,
        }
    }
}

impl From<emukern::fd::TableFull> for Errno {
    fn from(_: emukern::fd::TableFull) -> Self {
        Errno::EMFILE
    }
}
