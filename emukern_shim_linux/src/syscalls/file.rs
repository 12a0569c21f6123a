//! File-descriptor syscalls: the per-process descriptor table, open/close/
//! dup semantics, transfer paths, and the host-delegated path operations.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use emukern::fd::SlotTable;
use emukern::mm::FileBackingId;
use emukern::platform::{
    FileIdentity, FileProvider, HostDirEntry, HostFile, HostFileStatus, HostFileType,
    HostOpenFlags, HostSeekFrom,
};
use emukern::sync::{Mutex, RwLock};

use emukern_common_linux::{
    AT_FDCWD, AccessMode, Addr, AtFlags, Dirent64Header, FcntlArg, FdFlags, FileStat64, InodeType,
    IoVec, OpenFlags, PATH_MAX, SeekWhence, StatFs64, Timespec, dirent_type, errno::Errno,
};

use crate::{
    GlobalState, KernelPlatform, MAX_KERNEL_BUF_SIZE, Task, bounded_kernel_buf,
    syscalls::flock::FlockTable,
};

/// Soft cap on descriptors per table (RLIMIT_NOFILE reporting matches).
pub(crate) const NOFILE_LIMIT: usize = 1024;

/// Cap on iovec counts (Linux UIO_MAXIOV).
const MAX_IOVEC: usize = 1024;

static NEXT_BACKING_ID: AtomicU64 = AtomicU64::new(1);

/// One open-file description: the host handle plus the open status flags
/// shared by every descriptor that refers to it (dup, fork).
pub(crate) struct OpenFile<P: KernelPlatform> {
    pub(crate) host: P::File,
    status: AtomicU32,
    pub(crate) identity: FileIdentity,
    /// Ties file-backed mappings in the address space back to this
    /// description.
    pub(crate) backing_id: FileBackingId,
    /// The resolved host path this description was opened from (openat and
    /// fchdir resolution).
    pub(crate) path: String,
    is_directory: bool,
    locks: Arc<FlockTable<P>>,
}

impl<P: KernelPlatform> core::fmt::Debug for OpenFile<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OpenFile")
            .field("identity", &self.identity)
            .field("backing_id", &self.backing_id)
            .field("path", &self.path)
            .field("is_directory", &self.is_directory)
            .finish_non_exhaustive()
    }
}

impl<P: KernelPlatform> OpenFile<P> {
    fn new(
        host: P::File,
        status: OpenFlags,
        path: String,
        is_directory: bool,
        locks: Arc<FlockTable<P>>,
    ) -> Self {
        let identity = host.identity();
        Self {
            host,
            status: AtomicU32::new(status.bits()),
            identity,
            backing_id: FileBackingId(NEXT_BACKING_ID.fetch_add(1, Ordering::Relaxed)),
            path,
            is_directory,
            locks,
        }
    }

    pub(crate) fn get_status(&self) -> OpenFlags {
        OpenFlags::from_bits_retain(self.status.load(Ordering::Relaxed))
    }

    /// Replaces the `F_SETFL`-settable subset of the status flags.
    pub(crate) fn set_status_flags(&self, flags: OpenFlags) {
        let keep = !OpenFlags::STATUS_FLAGS.bits();
        let new = flags.bits() & OpenFlags::STATUS_FLAGS.bits();
        let mut current = self.status.load(Ordering::Relaxed);
        loop {
            match self.status.compare_exchange_weak(
                current,
                (current & keep) | new,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => current = v,
            }
        }
    }

    pub(crate) fn readable(&self) -> bool {
        self.get_status().readable()
    }

    pub(crate) fn writable(&self) -> bool {
        self.get_status().writable()
    }

    pub(crate) fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Identity of this open-file description for advisory lock ownership:
    /// descriptors created by dup/fork share it.
    pub(crate) fn lock_owner(&self) -> usize {
        core::ptr::from_ref(self) as usize
    }
}

impl<P: KernelPlatform> Drop for OpenFile<P> {
    fn drop(&mut self) {
        // The last reference releases any advisory locks the description
        // still holds.
        self.locks.release_owner(self.identity, self.lock_owner());
    }
}

/// One descriptor-table entry: a shared open-file description plus the
/// per-descriptor flags.
pub(crate) struct Descriptor<P: KernelPlatform> {
    pub(crate) file: Arc<OpenFile<P>>,
    pub(crate) flags: FdFlags,
}

impl<P: KernelPlatform> Clone for Descriptor<P> {
    fn clone(&self) -> Self {
        Self {
            file: self.file.clone(),
            flags: self.flags,
        }
    }
}

/// A process's descriptor table. Shared wholesale under `CLONE_FILES`;
/// duplicated (same descriptions, independent slots) by fork.
pub struct FilesState<P: KernelPlatform> {
    pub(crate) table: RwLock<P, SlotTable<Descriptor<P>>>,
}

impl<P: KernelPlatform> FilesState<P> {
    pub(crate) fn new() -> Self {
        Self {
            table: RwLock::new(SlotTable::with_limit(NOFILE_LIMIT)),
        }
    }

    /// Fork's copy: new slots referencing the same descriptions.
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            table: RwLock::new(self.table.read().duplicate()),
        }
    }

    /// Drops every descriptor marked close-on-exec.
    pub(crate) fn close_on_exec(&self) {
        self.table
            .write()
            .retain(|_, desc| !desc.flags.contains(FdFlags::FD_CLOEXEC));
    }

    /// Opens the host stdio streams onto descriptors 0..=2. Best-effort:
    /// an embedder without stdio paths simply starts with a sparse table.
    pub(crate) fn initialize_stdio(&self, global: &Arc<GlobalState<P>>) {
        let mut table = self.table.write();
        for (fd, path, flags) in [
            (0u32, "/dev/stdin", OpenFlags::empty()),
            (1u32, "/dev/stdout", OpenFlags::O_WRONLY),
            (2u32, "/dev/stderr", OpenFlags::O_WRONLY),
        ] {
            let host_flags = if flags.writable() {
                HostOpenFlags::WRITE
            } else {
                HostOpenFlags::READ
            };
            let Ok(host) = global.platform.open(path, host_flags, 0) else {
                continue;
            };
            let file = Arc::new(OpenFile::new(
                host,
                flags,
                path.to_string(),
                false,
                global.flocks.clone(),
            ));
            let _ = table.insert_at(
                fd,
                Descriptor {
                    file,
                    flags: FdFlags::empty(),
                },
            );
        }
    }

    pub(crate) fn get(&self, fd: i32) -> Result<Arc<OpenFile<P>>, Errno> {
        let fd = u32::try_from(fd).map_err(|_| Errno::EBADF)?;
        self.table
            .read()
            .get(fd)
            .map(|desc| desc.file.clone())
            .ok_or(Errno::EBADF)
    }
}

/// The filesystem-position state shared per `CLONE_FS`: working directory
/// and file-mode creation mask.
pub struct FsState<P: KernelPlatform> {
    cwd: Mutex<P, String>,
    umask: AtomicU32,
}

impl<P: KernelPlatform> FsState<P> {
    pub(crate) fn new() -> Self {
        Self {
            cwd: Mutex::new(String::from("/")),
            umask: AtomicU32::new(0o022),
        }
    }

    pub(crate) fn duplicate(&self) -> Self {
        Self {
            cwd: Mutex::new(self.cwd.lock().clone()),
            umask: AtomicU32::new(self.umask.load(Ordering::Relaxed)),
        }
    }

    pub(crate) fn cwd(&self) -> String {
        self.cwd.lock().clone()
    }

    pub(crate) fn set_cwd(&self, path: String) {
        *self.cwd.lock() = path;
    }

    pub(crate) fn umask(&self) -> u32 {
        self.umask.load(Ordering::Relaxed)
    }

    pub(crate) fn swap_umask(&self, mask: u32) -> u32 {
        self.umask.swap(mask & 0o777, Ordering::Relaxed)
    }
}

/// Collapses `.`/`..` components against an absolute base.
pub(crate) fn normalize_path(base: &str, path: &str) -> String {
    let mut parts: Vec<&str> = if path.starts_with('/') {
        Vec::new()
    } else {
        base.split('/').filter(|c| !c.is_empty()).collect()
    };
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    if parts.is_empty() {
        String::from("/")
    } else {
        let mut out = String::new();
        for part in parts {
            out.push('/');
            out.push_str(part);
        }
        out
    }
}

impl<P: KernelPlatform> Task<P> {
    /// Resolves a guest-supplied path against the working directory.
    pub(crate) fn resolve_path(&self, path: &str) -> String {
        normalize_path(&self.fs().cwd(), path)
    }

    /// Resolves a path for the `*at` family: absolute, cwd-relative
    /// (`AT_FDCWD`), or relative to an open directory descriptor.
    pub(crate) fn resolve_at(&self, dirfd: i32, path: &str) -> Result<String, Errno> {
        if path.starts_with('/') {
            return Ok(normalize_path("/", path));
        }
        if dirfd == AT_FDCWD {
            return Ok(self.resolve_path(path));
        }
        let dir = self.files().get(dirfd)?;
        if !dir.is_directory() {
            return Err(Errno::ENOTDIR);
        }
        Ok(normalize_path(&dir.path, path))
    }

    fn read_path_arg(&self, addr: Addr) -> Result<String, Errno> {
        let path = self.read_user_string(addr, PATH_MAX)?;
        if path.is_empty() {
            return Err(Errno::ENOENT);
        }
        Ok(path)
    }

    pub(crate) fn fd_file(&self, fd: i32) -> Result<Arc<OpenFile<P>>, Errno> {
        self.files().get(fd)
    }

    fn do_open(&self, resolved: String, flags: OpenFlags, mode: u32) -> Result<u32, Errno> {
        let mut host_flags = HostOpenFlags::empty();
        host_flags.set(HostOpenFlags::READ, flags.readable());
        host_flags.set(HostOpenFlags::WRITE, flags.writable());
        host_flags.set(HostOpenFlags::CREATE, flags.contains(OpenFlags::O_CREAT));
        host_flags.set(HostOpenFlags::EXCLUSIVE, flags.contains(OpenFlags::O_EXCL));
        host_flags.set(
            HostOpenFlags::TRUNCATE,
            flags.contains(OpenFlags::O_TRUNC) && flags.writable(),
        );
        host_flags.set(HostOpenFlags::APPEND, flags.contains(OpenFlags::O_APPEND));
        host_flags.set(
            HostOpenFlags::DIRECTORY,
            flags.contains(OpenFlags::O_DIRECTORY),
        );
        let mode = mode & !self.fs().umask() & 0o7777;

        let host = self.platform().open(&resolved, host_flags, mode)?;
        let is_directory = matches!(
            host.status().map(|s| s.file_type),
            Ok(HostFileType::Directory)
        );
        let file = Arc::new(OpenFile::new(
            host,
            flags,
            resolved,
            is_directory,
            self.global.flocks.clone(),
        ));
        let fd_flags = if flags.contains(OpenFlags::O_CLOEXEC) {
            FdFlags::FD_CLOEXEC
        } else {
            FdFlags::empty()
        };
        let fd = self.files().table.write().insert(Descriptor {
            file,
            flags: fd_flags,
        })?;
        Ok(fd)
    }

    pub(crate) fn sys_open(&self, path: Addr, flags: OpenFlags, mode: u32) -> Result<u32, Errno> {
        let path = self.read_path_arg(path)?;
        let resolved = self.resolve_path(&path);
        self.do_open(resolved, flags, mode)
    }

    pub(crate) fn sys_openat(
        &self,
        dirfd: i32,
        path: Addr,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<u32, Errno> {
        let path = self.read_path_arg(path)?;
        let resolved = self.resolve_at(dirfd, &path)?;
        self.do_open(resolved, flags, mode)
    }

    pub(crate) fn sys_close(&self, fd: i32) -> Result<(), Errno> {
        let fd = u32::try_from(fd).map_err(|_| Errno::EBADF)?;
        match self.files().table.write().remove(fd) {
            Some(_descriptor) => Ok(()),
            None => Err(Errno::EBADF),
        }
    }

    pub(crate) fn sys_read(&self, fd: i32, buf: Addr, count: u32) -> Result<usize, Errno> {
        let file = self.fd_file(fd)?;
        if !file.readable() {
            return Err(Errno::EBADF);
        }
        let count = count as usize;
        let mut kernel_buf = bounded_kernel_buf(count);
        let mut total = 0usize;
        while total < count {
            let chunk = (count - total).min(kernel_buf.len());
            let n = file.host.read(&mut kernel_buf[..chunk], None)?;
            if n == 0 {
                break;
            }
            let dst = buf.checked_add(total as u32).ok_or(Errno::EFAULT)?;
            self.write_user_bytes(dst, &kernel_buf[..n])?;
            total += n;
            if n < chunk {
                break;
            }
        }
        Ok(total)
    }

    pub(crate) fn sys_write(&self, fd: i32, buf: Addr, count: u32) -> Result<usize, Errno> {
        let file = self.fd_file(fd)?;
        if !file.writable() {
            return Err(Errno::EBADF);
        }
        let count = count as usize;
        let mut kernel_buf = bounded_kernel_buf(count);
        let mut total = 0usize;
        while total < count {
            let chunk = (count - total).min(MAX_KERNEL_BUF_SIZE);
            let src = buf.checked_add(total as u32).ok_or(Errno::EFAULT)?;
            self.read_user_bytes(src, &mut kernel_buf[..chunk])?;
            let n = file.host.write(&kernel_buf[..chunk], None)?;
            total += n;
            if n < chunk {
                break;
            }
        }
        Ok(total)
    }

    fn read_iovecs(&self, iovec: Addr, iovcnt: u32) -> Result<Vec<IoVec>, Errno> {
        let iovcnt = iovcnt as usize;
        if iovcnt > MAX_IOVEC {
            return Err(Errno::EINVAL);
        }
        let mut iovs = Vec::with_capacity(iovcnt);
        for i in 0..iovcnt {
            let addr = iovec
                .checked_add((i * core::mem::size_of::<IoVec>()) as u32)
                .ok_or(Errno::EFAULT)?;
            iovs.push(self.read_user::<IoVec>(addr)?);
        }
        Ok(iovs)
    }

    pub(crate) fn sys_readv(&self, fd: i32, iovec: Addr, iovcnt: u32) -> Result<usize, Errno> {
        let iovs = self.read_iovecs(iovec, iovcnt)?;
        let mut total = 0usize;
        for iov in iovs {
            if iov.len == 0 {
                continue;
            }
            let n = self.sys_read(fd, iov.base, iov.len)?;
            total += n;
            if n < iov.len as usize {
                // Short transfer ends the vector walk.
                break;
            }
        }
        Ok(total)
    }

    pub(crate) fn sys_writev(&self, fd: i32, iovec: Addr, iovcnt: u32) -> Result<usize, Errno> {
        let iovs = self.read_iovecs(iovec, iovcnt)?;
        let mut total = 0usize;
        for iov in iovs {
            if iov.len == 0 {
                continue;
            }
            let n = self.sys_write(fd, iov.base, iov.len)?;
            total += n;
            if n < iov.len as usize {
                break;
            }
        }
        Ok(total)
    }

    fn seek_from(offset: i64, whence: SeekWhence) -> HostSeekFrom {
        match whence {
            SeekWhence::Set => HostSeekFrom::Start(offset.max(0) as u64),
            SeekWhence::Current => HostSeekFrom::Current(offset),
            SeekWhence::End => HostSeekFrom::End(offset),
        }
    }

    pub(crate) fn sys_lseek(&self, fd: i32, offset: i32, whence: SeekWhence) -> Result<u32, Errno> {
        let file = self.fd_file(fd)?;
        let pos = file.host.seek(Self::seek_from(offset.into(), whence))?;
        u32::try_from(pos).map_err(|_| Errno::EOVERFLOW)
    }

    pub(crate) fn sys_llseek(
        &self,
        fd: i32,
        offset_high: u32,
        offset_low: u32,
        result: Addr,
        whence: SeekWhence,
    ) -> Result<(), Errno> {
        let file = self.fd_file(fd)?;
        let offset = ((offset_high as i64) << 32) | offset_low as i64;
        let pos = file.host.seek(Self::seek_from(offset, whence))?;
        self.write_user::<u64>(result, pos)
    }

    pub(crate) fn sys_dup(&self, fd: i32) -> Result<u32, Errno> {
        let fd = u32::try_from(fd).map_err(|_| Errno::EBADF)?;
        let files = self.files();
        let mut table = files.table.write();
        let desc = table.get(fd).ok_or(Errno::EBADF)?.clone();
        // A duplicate references the same description; the close-on-exec
        // flag is per-descriptor and does not carry over.
        let new = table.insert(Descriptor {
            file: desc.file,
            flags: FdFlags::empty(),
        })?;
        Ok(new)
    }

    pub(crate) fn sys_dup2(&self, fd: i32, newfd: i32) -> Result<u32, Errno> {
        let fd = u32::try_from(fd).map_err(|_| Errno::EBADF)?;
        let newfd = u32::try_from(newfd).map_err(|_| Errno::EBADF)?;
        let files = self.files();
        let mut table = files.table.write();
        let desc = table.get(fd).ok_or(Errno::EBADF)?.clone();
        if fd == newfd {
            // Self-dup of a valid descriptor is a no-op.
            return Ok(newfd);
        }
        // Implicitly closes whatever occupied the target slot.
        let _displaced = table.insert_at(
            newfd,
            Descriptor {
                file: desc.file,
                flags: FdFlags::empty(),
            },
        )?;
        Ok(newfd)
    }

    pub(crate) fn sys_fcntl(&self, fd: i32, arg: FcntlArg) -> Result<u32, Errno> {
        let fd = u32::try_from(fd).map_err(|_| Errno::EBADF)?;
        let files = self.files();
        match arg {
            FcntlArg::DupFd { min } | FcntlArg::DupFdCloexec { min } => {
                let cloexec = matches!(arg, FcntlArg::DupFdCloexec { .. });
                let mut table = files.table.write();
                let desc = table.get(fd).ok_or(Errno::EBADF)?.clone();
                let new = table.insert_from(
                    min,
                    Descriptor {
                        file: desc.file,
                        flags: if cloexec {
                            FdFlags::FD_CLOEXEC
                        } else {
                            FdFlags::empty()
                        },
                    },
                )?;
                Ok(new)
            }
            FcntlArg::GetFd => {
                let table = files.table.read();
                let desc = table.get(fd).ok_or(Errno::EBADF)?;
                Ok(desc.flags.bits())
            }
            FcntlArg::SetFd(flags) => {
                let mut table = files.table.write();
                let desc = table.get_mut(fd).ok_or(Errno::EBADF)?;
                desc.flags = flags & FdFlags::FD_CLOEXEC;
                Ok(0)
            }
            FcntlArg::GetFl => {
                let table = files.table.read();
                let desc = table.get(fd).ok_or(Errno::EBADF)?;
                Ok(desc.file.get_status().bits())
            }
            FcntlArg::SetFl(flags) => {
                let table = files.table.read();
                let desc = table.get(fd).ok_or(Errno::EBADF)?;
                desc.file.set_status_flags(flags);
                Ok(0)
            }
            FcntlArg::Unsupported(cmd) => {
                self.global
                    .log_unsupported(format_args!("fcntl(cmd = {cmd})"));
                Err(Errno::EOPNOTSUPP)
            }
        }
    }

    pub(crate) fn sys_ioctl(&self, fd: i32, cmd: u32, arg: u32) -> Result<u32, Errno> {
        const FIONBIO: u32 = 0x5421;
        const TCGETS: u32 = 0x5401;
        const TIOCGWINSZ: u32 = 0x5413;

        let file = self.fd_file(fd)?;
        match cmd {
            FIONBIO => {
                let enable: i32 = self.read_user(arg)?;
                let mut status = file.get_status();
                status.set(OpenFlags::O_NONBLOCK, enable != 0);
                file.set_status_flags(status);
                Ok(0)
            }
            // Host files are never terminals on this surface.
            TCGETS | TIOCGWINSZ => Err(Errno::ENOTTY),
            _ => {
                self.global
                    .log_unsupported(format_args!("ioctl(cmd = {cmd:#x})"));
                Err(Errno::EINVAL)
            }
        }
    }

    pub(crate) fn sys_ftruncate(&self, fd: i32, length: u32) -> Result<(), Errno> {
        let file = self.fd_file(fd)?;
        if !file.writable() {
            return Err(Errno::EINVAL);
        }
        Ok(file.host.truncate(length.into())?)
    }

    pub(crate) fn sys_fchmod(&self, fd: i32, mode: u32) -> Result<(), Errno> {
        let file = self.fd_file(fd)?;
        Ok(file.host.set_mode(mode & 0o7777)?)
    }

    pub(crate) fn sys_fchown(&self, fd: i32, _owner: u32, _group: u32) -> Result<(), Errno> {
        // Single-user emulation: ownership is fixed, the call succeeds.
        let _ = self.fd_file(fd)?;
        Ok(())
    }

    pub(crate) fn sys_fsync(&self, fd: i32) -> Result<(), Errno> {
        // Durability is the host's concern; validate the descriptor only.
        let _ = self.fd_file(fd)?;
        Ok(())
    }

    pub(crate) fn sys_sendfile(
        &self,
        out_fd: i32,
        in_fd: i32,
        offset: Addr,
        count: u32,
    ) -> Result<usize, Errno> {
        let input = self.fd_file(in_fd)?;
        let output = self.fd_file(out_fd)?;
        if !input.readable() || !output.writable() {
            return Err(Errno::EBADF);
        }
        let mut at = if offset != 0 {
            Some(u64::from(self.read_user::<u32>(offset)?))
        } else {
            None
        };
        let count = count as usize;
        let mut kernel_buf = bounded_kernel_buf(count);
        let mut total = 0usize;
        while total < count {
            let chunk = (count - total).min(kernel_buf.len());
            let n = input.host.read(&mut kernel_buf[..chunk], at)?;
            if n == 0 {
                break;
            }
            let written = output.host.write(&kernel_buf[..n], None)?;
            total += written;
            if let Some(at) = &mut at {
                *at += written as u64;
            }
            if written < chunk {
                break;
            }
        }
        if offset != 0
            && let Some(at) = at
        {
            self.write_user::<u32>(offset, u32::try_from(at).map_err(|_| Errno::EOVERFLOW)?)?;
        }
        Ok(total)
    }

    pub(crate) fn sys_getdents64(&self, fd: i32, dirp: Addr, count: u32) -> Result<usize, Errno> {
        let file = self.fd_file(fd)?;
        let entries = file.host.dir_entries()?;
        // The handle's seek position doubles as the next entry index.
        let index = file.host.seek(HostSeekFrom::Current(0))? as usize;

        let mut out: Vec<u8> = Vec::new();
        let mut emitted = 0usize;
        for (i, entry) in entries.iter().enumerate().skip(index) {
            let record = serialize_dirent(entry, (i + 1) as i64);
            if out.len() + record.len() > count as usize {
                if emitted == 0 {
                    return Err(Errno::EINVAL);
                }
                break;
            }
            out.extend_from_slice(&record);
            emitted += 1;
        }
        self.write_user_bytes(dirp, &out)?;
        file.host
            .seek(HostSeekFrom::Start((index + emitted) as u64))?;
        Ok(out.len())
    }

    fn fill_stat(status: &HostFileStatus) -> FileStat64 {
        let type_bits = match status.file_type {
            HostFileType::Regular => InodeType::File as u32,
            HostFileType::Directory => InodeType::Dir as u32,
            HostFileType::SymbolicLink => InodeType::SymLink as u32,
            HostFileType::CharacterDevice => InodeType::CharDevice as u32,
            HostFileType::BlockDevice => InodeType::BlockDevice as u32,
            HostFileType::Fifo => InodeType::NamedPipe as u32,
            HostFileType::Socket => InodeType::Socket as u32,
        };
        FileStat64 {
            st_dev: status.identity.device,
            __st_ino: status.identity.inode as u32,
            st_mode: (status.mode & 0o7777) | type_bits,
            st_nlink: status.link_count,
            st_size: status.size as i64,
            st_blksize: 4096,
            st_blocks: status.size.div_ceil(512),
            st_atime: status.accessed.as_secs() as u32,
            st_atime_nsec: status.accessed.subsec_nanos(),
            st_mtime: status.modified.as_secs() as u32,
            st_mtime_nsec: status.modified.subsec_nanos(),
            st_ctime: status.changed.as_secs() as u32,
            st_ctime_nsec: status.changed.subsec_nanos(),
            st_ino: status.identity.inode,
            ..Default::default()
        }
    }

    pub(crate) fn sys_stat64(&self, path: Addr, buf: Addr) -> Result<(), Errno> {
        let path = self.read_path_arg(path)?;
        let resolved = self.resolve_path(&path);
        let status = self.platform().status(&resolved, true)?;
        self.write_user(buf, Self::fill_stat(&status))
    }

    pub(crate) fn sys_lstat64(&self, path: Addr, buf: Addr) -> Result<(), Errno> {
        let path = self.read_path_arg(path)?;
        let resolved = self.resolve_path(&path);
        let status = self.platform().status(&resolved, false)?;
        self.write_user(buf, Self::fill_stat(&status))
    }

    pub(crate) fn sys_fstat64(&self, fd: i32, buf: Addr) -> Result<(), Errno> {
        let file = self.fd_file(fd)?;
        let status = file.host.status()?;
        self.write_user(buf, Self::fill_stat(&status))
    }

    pub(crate) fn sys_fstatat64(
        &self,
        dirfd: i32,
        path: Addr,
        buf: Addr,
        flags: AtFlags,
    ) -> Result<(), Errno> {
        let path = self.read_user_string(path, PATH_MAX)?;
        if path.is_empty() {
            if !flags.contains(AtFlags::AT_EMPTY_PATH) {
                return Err(Errno::ENOENT);
            }
            return self.sys_fstat64(dirfd, buf);
        }
        let resolved = self.resolve_at(dirfd, &path)?;
        let follow = !flags.contains(AtFlags::AT_SYMLINK_NOFOLLOW);
        let status = self.platform().status(&resolved, follow)?;
        self.write_user(buf, Self::fill_stat(&status))
    }

    pub(crate) fn sys_access(&self, path: Addr, mode: AccessMode) -> Result<(), Errno> {
        let path = self.read_path_arg(path)?;
        let resolved = self.resolve_path(&path);
        let status = self.platform().status(&resolved, true)?;
        if mode == AccessMode::empty() {
            // F_OK: existence only.
            return Ok(());
        }
        // The check runs with the caller's real ids; the emulation owns all
        // host files, so the owner permission bits decide.
        if mode.contains(AccessMode::R_OK) && status.mode & 0o400 == 0 {
            return Err(Errno::EACCES);
        }
        if mode.contains(AccessMode::W_OK) && status.mode & 0o200 == 0 {
            return Err(Errno::EACCES);
        }
        if mode.contains(AccessMode::X_OK) && status.mode & 0o100 == 0 {
            return Err(Errno::EACCES);
        }
        Ok(())
    }

    pub(crate) fn sys_readlink(&self, path: Addr, buf: Addr, size: u32) -> Result<usize, Errno> {
        if size == 0 {
            return Err(Errno::EINVAL);
        }
        let path = self.read_path_arg(path)?;
        let resolved = self.resolve_path(&path);
        let target = self.platform().read_link(&resolved)?;
        let bytes = target.as_bytes();
        let n = bytes.len().min(size as usize);
        // readlink does not NUL-terminate.
        self.write_user_bytes(buf, &bytes[..n])?;
        Ok(n)
    }

    pub(crate) fn sys_unlink(&self, path: Addr) -> Result<(), Errno> {
        let path = self.read_path_arg(path)?;
        let resolved = self.resolve_path(&path);
        Ok(self.platform().unlink(&resolved)?)
    }

    pub(crate) fn sys_unlinkat(&self, dirfd: i32, path: Addr, flags: AtFlags) -> Result<(), Errno> {
        let path = self.read_path_arg(path)?;
        let resolved = self.resolve_at(dirfd, &path)?;
        if flags.contains(AtFlags::AT_REMOVEDIR) {
            Ok(self.platform().remove_dir(&resolved)?)
        } else {
            Ok(self.platform().unlink(&resolved)?)
        }
    }

    pub(crate) fn sys_mkdir(&self, path: Addr, mode: u32) -> Result<(), Errno> {
        let path = self.read_path_arg(path)?;
        let resolved = self.resolve_path(&path);
        let mode = mode & !self.fs().umask() & 0o7777;
        Ok(self.platform().make_dir(&resolved, mode)?)
    }

    pub(crate) fn sys_mkdirat(&self, dirfd: i32, path: Addr, mode: u32) -> Result<(), Errno> {
        let path = self.read_path_arg(path)?;
        let resolved = self.resolve_at(dirfd, &path)?;
        let mode = mode & !self.fs().umask() & 0o7777;
        Ok(self.platform().make_dir(&resolved, mode)?)
    }

    pub(crate) fn sys_rmdir(&self, path: Addr) -> Result<(), Errno> {
        let path = self.read_path_arg(path)?;
        let resolved = self.resolve_path(&path);
        Ok(self.platform().remove_dir(&resolved)?)
    }

    pub(crate) fn sys_rename(&self, from: Addr, to: Addr) -> Result<(), Errno> {
        let from = self.read_path_arg(from)?;
        let to = self.read_path_arg(to)?;
        let from = self.resolve_path(&from);
        let to = self.resolve_path(&to);
        Ok(self.platform().rename(&from, &to)?)
    }

    fn fill_statfs(status: &emukern::platform::HostFsStatus) -> StatFs64 {
        StatFs64 {
            f_type: 0xef53, // reported as ext2-compatible
            f_bsize: status.block_size,
            f_blocks: status.blocks,
            f_bfree: status.blocks_free,
            f_bavail: status.blocks_available,
            f_files: status.files,
            f_ffree: status.files_free,
            f_namelen: status.name_max,
            f_frsize: status.block_size,
            ..Default::default()
        }
    }

    pub(crate) fn sys_statfs64(&self, path: Addr, size: u32, buf: Addr) -> Result<(), Errno> {
        if size as usize != core::mem::size_of::<StatFs64>() {
            return Err(Errno::EINVAL);
        }
        let path = self.read_path_arg(path)?;
        let resolved = self.resolve_path(&path);
        let status = self.platform().fs_status(&resolved)?;
        self.write_user(buf, Self::fill_statfs(&status))
    }

    pub(crate) fn sys_fstatfs64(&self, fd: i32, size: u32, buf: Addr) -> Result<(), Errno> {
        if size as usize != core::mem::size_of::<StatFs64>() {
            return Err(Errno::EINVAL);
        }
        let file = self.fd_file(fd)?;
        let status = self.platform().fs_status(&file.path)?;
        self.write_user(buf, Self::fill_statfs(&status))
    }

    pub(crate) fn sys_utimensat(
        &self,
        dirfd: i32,
        path: Addr,
        times: Addr,
        _flags: AtFlags,
    ) -> Result<(), Errno> {
        const UTIME_NOW: u32 = 0x3fff_ffff;
        const UTIME_OMIT: u32 = 0x3fff_fffe;

        let path = self.read_path_arg(path)?;
        let resolved = self.resolve_at(dirfd, &path)?;

        let now = self.wall_clock_duration();
        let (accessed, modified) = if times == 0 {
            (Some(now), Some(now))
        } else {
            let atime: Timespec = self.read_user(times)?;
            let mtime: Timespec =
                self.read_user(times + core::mem::size_of::<Timespec>() as u32)?;
            let convert = |ts: Timespec| match ts.nsec {
                UTIME_NOW => Ok(Some(now)),
                UTIME_OMIT => Ok(None),
                _ => ts.to_duration().map(Some).ok_or(Errno::EINVAL),
            };
            (convert(atime)?, convert(mtime)?)
        };
        Ok(self.platform().set_times(&resolved, accessed, modified)?)
    }

    pub(crate) fn sys_getcwd(&self, buf: Addr, size: u32) -> Result<usize, Errno> {
        let cwd = self.fs().cwd();
        let bytes = cwd.as_bytes();
        // The terminator must fit too.
        if bytes.len() + 1 > size as usize {
            return Err(Errno::ERANGE);
        }
        self.write_user_bytes(buf, bytes)?;
        self.write_user::<u8>(buf + bytes.len() as u32, 0)?;
        Ok(bytes.len() + 1)
    }

    pub(crate) fn sys_chdir(&self, path: Addr) -> Result<(), Errno> {
        let path = self.read_path_arg(path)?;
        let resolved = self.resolve_path(&path);
        let status = self.platform().status(&resolved, true)?;
        if status.file_type != HostFileType::Directory {
            return Err(Errno::ENOTDIR);
        }
        self.fs().set_cwd(resolved);
        Ok(())
    }

    pub(crate) fn sys_fchdir(&self, fd: i32) -> Result<(), Errno> {
        let file = self.fd_file(fd)?;
        if !file.is_directory() {
            return Err(Errno::ENOTDIR);
        }
        self.fs().set_cwd(file.path.clone());
        Ok(())
    }

    pub(crate) fn sys_umask(&self, mask: u32) -> Result<u32, Errno> {
        Ok(self.fs().swap_umask(mask))
    }
}

/// One `linux_dirent64` record, 8-byte aligned.
fn serialize_dirent(entry: &HostDirEntry, next_offset: i64) -> Vec<u8> {
    let name = entry.name.as_bytes();
    let header_len = core::mem::size_of::<Dirent64Header>();
    let reclen = (header_len + name.len() + 1).next_multiple_of(8);
    let d_type = match entry.file_type {
        HostFileType::Regular => dirent_type::DT_REG,
        HostFileType::Directory => dirent_type::DT_DIR,
        HostFileType::SymbolicLink => dirent_type::DT_LNK,
        HostFileType::CharacterDevice => dirent_type::DT_CHR,
        HostFileType::BlockDevice => dirent_type::DT_BLK,
        HostFileType::Fifo => dirent_type::DT_FIFO,
        HostFileType::Socket => dirent_type::DT_SOCK,
    };
    let header = Dirent64Header {
        d_ino: entry.inode,
        d_off: next_offset,
        d_reclen: reclen as u16,
        d_type,
    };
    let mut out = Vec::with_capacity(reclen);
    // The header is `repr(C, packed)`, so its bytes are exactly the wire
    // layout.
    let header_bytes = unsafe {
        core::slice::from_raw_parts(core::ptr::from_ref(&header).cast::<u8>(), header_len)
    };
    out.extend_from_slice(header_bytes);
    out.extend_from_slice(name);
    out.resize(reclen, 0);
    out
}
