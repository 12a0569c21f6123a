//! Deterministic test platform.
//!
//! Useful for exercising the core (and the Linux shim on top of it) without
//! a real host: time advances one millisecond per observation, guest memory
//! is a sparse page map, the filesystem is in-memory, and the raw mutex is
//! a spin/bookkeeping implementation good enough for multi-threaded tests.
//!
//! Available to downstream crates' test builds through the `mock-platform`
//! feature; requires `std`.

#![allow(
    clippy::significant_drop_tightening,
    reason = "test-only code favors clarity over lock scope tuning"
)]

extern crate std;

use core::sync::atomic::AtomicU32;
use std::boxed::Box;
use std::collections::HashMap;
use std::string::{String, ToString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::vec::Vec;

use super::page_mgmt::{
    AllocationError, DeallocationError, MemoryRegionPermissions, PageBacking,
    PageManagementProvider, PermissionUpdateError,
};
use super::*;

const MOCK_PAGE_SIZE: usize = 4096;
/// Guest addresses at or above this value fault in the mock.
const GUEST_RAM_LIMIT: usize = 0xf000_0000;

/// The deterministic mock platform.
pub struct MockPlatform {
    current_time: AtomicU64,
    guest_ram: RwLock<HashMap<usize, Box<[u8; MOCK_PAGE_SIZE]>>>,
    fs: Mutex<MockFs>,
}

impl MockPlatform {
    /// Creates a leaked (static) mock platform, matching the `&'static`
    /// lifetime real platforms have.
    pub fn new() -> &'static Self {
        Box::leak(Box::new(MockPlatform {
            current_time: AtomicU64::new(0),
            guest_ram: RwLock::new(HashMap::new()),
            fs: Mutex::new(MockFs::new()),
        }))
    }

    /// Pre-populates a host file at `path`.
    pub fn add_host_file(&self, path: &str, contents: &[u8]) {
        self.fs.lock().unwrap().create_file(path, contents, 0o644);
    }

    /// Pre-populates an executable host file at `path`.
    pub fn add_host_executable(&self, path: &str, contents: &[u8]) {
        self.fs.lock().unwrap().create_file(path, contents, 0o755);
    }

    /// Pre-populates a host directory at `path`.
    pub fn add_host_dir(&self, path: &str) {
        self.fs.lock().unwrap().create_dir(path);
    }
}

// ---------------------------------------------------------------------------
// Raw mutex

pub struct MockRawMutex {
    inner: AtomicU32,
    state: RwLock<MockRawMutexState>,
}

struct MockRawMutexState {
    to_wake: usize,
    blocked: usize,
}

impl MockRawMutex {
    const fn new() -> Self {
        Self {
            inner: AtomicU32::new(0),
            state: RwLock::new(MockRawMutexState {
                to_wake: 0,
                blocked: 0,
            }),
        }
    }

    fn block_or_maybe_timeout(
        &self,
        val: u32,
        timeout: Option<core::time::Duration>,
    ) -> Result<UnblockedOrTimedOut, ImmediatelyWokenUp> {
        // Register as blocked before the value check so wakeups that race
        // the check are accounted for.
        self.state.write().unwrap().blocked += 1;

        if self.inner.load(Ordering::SeqCst) != val {
            let mut state = self.state.write().unwrap();
            state.blocked -= 1;
            if state.to_wake > 0 {
                state.to_wake -= 1;
            }
            return Err(ImmediatelyWokenUp);
        }

        let start = std::time::Instant::now();
        loop {
            core::hint::spin_loop();
            std::thread::yield_now();

            if let Some(timeout) = timeout
                && start.elapsed() >= timeout
            {
                let mut state = self.state.write().unwrap();
                state.blocked -= 1;
                return Ok(UnblockedOrTimedOut::TimedOut);
            }

            if self.state.read().unwrap().to_wake == 0 {
                continue;
            }
            let mut state = self.state.write().unwrap();
            if state.to_wake == 0 {
                // Another waiter consumed the wake first.
                continue;
            }
            state.to_wake -= 1;
            state.blocked -= 1;
            return Ok(UnblockedOrTimedOut::Unblocked);
        }
    }
}

impl RawMutex for MockRawMutex {
    const INIT: Self = Self::new();

    fn underlying_atomic(&self) -> &AtomicU32 {
        &self.inner
    }

    fn wake_many(&self, n: usize) -> usize {
        let mut state = loop {
            let state = self.state.write().unwrap();
            if state.to_wake > 0 {
                // A previous wake is still draining; wait for our turn.
                drop(state);
                std::thread::yield_now();
                continue;
            }
            break state;
        };
        let n = state.blocked.min(n);
        state.to_wake = n;
        n
    }

    fn block(&self, val: u32) -> Result<(), ImmediatelyWokenUp> {
        match self.block_or_maybe_timeout(val, None) {
            Ok(UnblockedOrTimedOut::Unblocked) => Ok(()),
            Ok(UnblockedOrTimedOut::TimedOut) => unreachable!(),
            Err(ImmediatelyWokenUp) => Err(ImmediatelyWokenUp),
        }
    }

    fn block_or_timeout(
        &self,
        val: u32,
        timeout: core::time::Duration,
    ) -> Result<UnblockedOrTimedOut, ImmediatelyWokenUp> {
        self.block_or_maybe_timeout(val, Some(timeout))
    }
}

impl RawMutexProvider for MockPlatform {
    type RawMutex = MockRawMutex;
}

// ---------------------------------------------------------------------------
// Time

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MockInstant {
    time: u64,
}

impl Instant for MockInstant {
    fn checked_duration_since(&self, earlier: &Self) -> Option<core::time::Duration> {
        self.time
            .checked_sub(earlier.time)
            .map(core::time::Duration::from_millis)
    }

    fn checked_add(&self, duration: core::time::Duration) -> Option<Self> {
        let millis: u64 = duration.as_millis().try_into().ok()?;
        Some(MockInstant {
            time: self.time.checked_add(millis)?,
        })
    }
}

pub struct MockSystemTime {
    time: u64,
}

impl SystemTime for MockSystemTime {
    const UNIX_EPOCH: Self = MockSystemTime { time: 0 };

    fn duration_since(&self, earlier: &Self) -> Result<core::time::Duration, core::time::Duration> {
        if self.time >= earlier.time {
            Ok(core::time::Duration::from_millis(self.time - earlier.time))
        } else {
            Err(core::time::Duration::from_millis(earlier.time - self.time))
        }
    }
}

impl TimeProvider for MockPlatform {
    type Instant = MockInstant;
    type SystemTime = MockSystemTime;

    fn now(&self) -> Self::Instant {
        MockInstant {
            time: self.current_time.fetch_add(1, Ordering::SeqCst),
        }
    }

    fn current_time(&self) -> Self::SystemTime {
        MockSystemTime {
            time: self.current_time.load(Ordering::SeqCst),
        }
    }
}

// ---------------------------------------------------------------------------
// Threads

impl ThreadProvider for MockPlatform {
    type ThreadHandle = std::thread::ThreadId;

    fn current_thread(&self) -> Self::ThreadHandle {
        std::thread::current().id()
    }

    fn interrupt_thread(&self, _thread: &Self::ThreadHandle) {
        // Mock tasks never actually run guest code; waiters are woken
        // through the waker path.
    }
}

// ---------------------------------------------------------------------------
// Guest memory

impl GuestMemoryProvider for MockPlatform {
    fn read_guest(&self, addr: usize, buf: &mut [u8]) -> Result<(), GuestMemoryFault> {
        let fault = GuestMemoryFault {
            addr,
            len: buf.len(),
        };
        let end = addr.checked_add(buf.len()).ok_or(fault)?;
        if addr < MOCK_PAGE_SIZE || end > GUEST_RAM_LIMIT {
            return Err(fault);
        }
        let ram = self.guest_ram.read().unwrap();
        for (i, byte) in buf.iter_mut().enumerate() {
            let a = addr + i;
            let page = a / MOCK_PAGE_SIZE * MOCK_PAGE_SIZE;
            *byte = ram.get(&page).map_or(0, |p| p[a - page]);
        }
        Ok(())
    }

    fn write_guest(&self, addr: usize, bytes: &[u8]) -> Result<(), GuestMemoryFault> {
        let fault = GuestMemoryFault {
            addr,
            len: bytes.len(),
        };
        let end = addr.checked_add(bytes.len()).ok_or(fault)?;
        if addr < MOCK_PAGE_SIZE || end > GUEST_RAM_LIMIT {
            return Err(fault);
        }
        let mut ram = self.guest_ram.write().unwrap();
        for (i, byte) in bytes.iter().enumerate() {
            let a = addr + i;
            let page = a / MOCK_PAGE_SIZE * MOCK_PAGE_SIZE;
            let entry = ram
                .entry(page)
                .or_insert_with(|| Box::new([0; MOCK_PAGE_SIZE]));
            entry[a - page] = *byte;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Page management

impl PageManagementProvider<MOCK_PAGE_SIZE> for MockPlatform {
    const TASK_ADDR_MIN: usize = MOCK_PAGE_SIZE;
    const TASK_ADDR_MAX: usize = GUEST_RAM_LIMIT;

    type Backing = MockPageBacking;

    fn new_backing(&self) -> Result<Self::Backing, AllocationError> {
        Ok(MockPageBacking {
            reserved: Mutex::new(rangemap::RangeSet::new()),
        })
    }
}

/// Tracks reservations so tests catch double-reserve and release-of-hole
/// bugs in the core's bookkeeping.
pub struct MockPageBacking {
    reserved: Mutex<rangemap::RangeSet<usize>>,
}

impl PageBacking<MOCK_PAGE_SIZE> for MockPageBacking {
    fn reserve(
        &self,
        range: core::ops::Range<usize>,
        _permissions: MemoryRegionPermissions,
    ) -> Result<(), AllocationError> {
        if range.start % MOCK_PAGE_SIZE != 0 || range.end % MOCK_PAGE_SIZE != 0 {
            return Err(AllocationError::Unaligned);
        }
        let mut reserved = self.reserved.lock().unwrap();
        if reserved.overlaps(&range) {
            return Err(AllocationError::AddressInUse);
        }
        reserved.insert(range);
        Ok(())
    }

    unsafe fn release(
        &self,
        range: core::ops::Range<usize>,
    ) -> Result<(), DeallocationError> {
        if range.start % MOCK_PAGE_SIZE != 0 || range.end % MOCK_PAGE_SIZE != 0 {
            return Err(DeallocationError::Unaligned);
        }
        let mut reserved = self.reserved.lock().unwrap();
        if !reserved.overlaps(&range) {
            return Err(DeallocationError::AlreadyUnallocated);
        }
        reserved.remove(range);
        Ok(())
    }

    unsafe fn update_permissions(
        &self,
        range: core::ops::Range<usize>,
        _permissions: MemoryRegionPermissions,
    ) -> Result<(), PermissionUpdateError> {
        let reserved = self.reserved.lock().unwrap();
        if reserved.gaps(&range).next().is_some() {
            return Err(PermissionUpdateError::NotAllocated);
        }
        Ok(())
    }

    fn duplicate(&self) -> Result<Self, AllocationError> {
        Ok(Self {
            reserved: Mutex::new(self.reserved.lock().unwrap().clone()),
        })
    }
}

// ---------------------------------------------------------------------------
// Filesystem

struct MockFs {
    nodes: HashMap<String, MockNode>,
    next_inode: u64,
}

#[derive(Clone)]
enum MockNode {
    File {
        data: std::sync::Arc<Mutex<Vec<u8>>>,
        mode: u32,
        inode: u64,
    },
    Dir {
        inode: u64,
    },
}

impl MockFs {
    fn new() -> Self {
        let mut fs = Self {
            nodes: HashMap::new(),
            next_inode: 2,
        };
        fs.nodes.insert("/".to_string(), MockNode::Dir { inode: 1 });
        fs
    }

    fn alloc_inode(&mut self) -> u64 {
        let ino = self.next_inode;
        self.next_inode += 1;
        ino
    }

    fn create_file(&mut self, path: &str, contents: &[u8], mode: u32) {
        let inode = self.alloc_inode();
        self.nodes.insert(
            path.to_string(),
            MockNode::File {
                data: std::sync::Arc::new(Mutex::new(contents.to_vec())),
                mode,
                inode,
            },
        );
    }

    fn create_dir(&mut self, path: &str) {
        let inode = self.alloc_inode();
        self.nodes
            .insert(path.trim_end_matches('/').to_string(), MockNode::Dir { inode });
    }
}

/// An open handle into the mock filesystem.
pub struct MockFile {
    data: std::sync::Arc<Mutex<Vec<u8>>>,
    pos: Mutex<u64>,
    inode: u64,
    mode: u32,
    readable: bool,
    writable: bool,
    append: bool,
    is_dir: bool,
    path: String,
    fs_entries: Vec<HostDirEntry>,
}

impl HostFile for MockFile {
    fn read(&self, buf: &mut [u8], offset: Option<u64>) -> Result<usize, HostIoError> {
        if !self.readable {
            return Err(HostIoError::PermissionDenied);
        }
        if self.is_dir {
            return Err(HostIoError::IsADirectory);
        }
        let data = self.data.lock().unwrap();
        let mut pos = self.pos.lock().unwrap();
        let at = offset.unwrap_or(*pos) as usize;
        if at >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - at);
        buf[..n].copy_from_slice(&data[at..at + n]);
        if offset.is_none() {
            *pos += n as u64;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: Option<u64>) -> Result<usize, HostIoError> {
        if !self.writable {
            return Err(HostIoError::PermissionDenied);
        }
        if self.is_dir {
            return Err(HostIoError::IsADirectory);
        }
        let mut data = self.data.lock().unwrap();
        let mut pos = self.pos.lock().unwrap();
        let at = if self.append {
            data.len()
        } else {
            offset.unwrap_or(*pos) as usize
        };
        if data.len() < at + buf.len() {
            data.resize(at + buf.len(), 0);
        }
        data[at..at + buf.len()].copy_from_slice(buf);
        if offset.is_none() {
            *pos = (at + buf.len()) as u64;
        }
        Ok(buf.len())
    }

    fn seek(&self, pos: HostSeekFrom) -> Result<u64, HostIoError> {
        let len = self.data.lock().unwrap().len() as i64;
        let mut cur = self.pos.lock().unwrap();
        let new = match pos {
            HostSeekFrom::Start(v) => i64::try_from(v).map_err(|_| HostIoError::IllegalSeek)?,
            HostSeekFrom::Current(v) => (*cur as i64) + v,
            HostSeekFrom::End(v) => len + v,
        };
        if new < 0 {
            return Err(HostIoError::IllegalSeek);
        }
        *cur = new as u64;
        Ok(*cur)
    }

    fn status(&self) -> Result<HostFileStatus, HostIoError> {
        Ok(HostFileStatus {
            file_type: if self.is_dir {
                HostFileType::Directory
            } else {
                HostFileType::Regular
            },
            mode: self.mode,
            size: self.data.lock().unwrap().len() as u64,
            identity: self.identity(),
            link_count: 1,
            accessed: core::time::Duration::ZERO,
            modified: core::time::Duration::ZERO,
            changed: core::time::Duration::ZERO,
        })
    }

    fn truncate(&self, len: u64) -> Result<(), HostIoError> {
        if !self.writable {
            return Err(HostIoError::PermissionDenied);
        }
        self.data.lock().unwrap().resize(len as usize, 0);
        Ok(())
    }

    fn set_mode(&self, _mode: u32) -> Result<(), HostIoError> {
        Ok(())
    }

    fn dir_entries(&self) -> Result<Vec<HostDirEntry>, HostIoError> {
        if !self.is_dir {
            return Err(HostIoError::NotADirectory);
        }
        Ok(self.fs_entries.clone())
    }

    fn identity(&self) -> FileIdentity {
        FileIdentity {
            device: 1,
            inode: self.inode,
        }
    }
}

impl MockFile {
    /// The path this handle was opened from (test assertions).
    pub fn opened_path(&self) -> &str {
        &self.path
    }
}

impl FileProvider for MockPlatform {
    type File = MockFile;

    fn open(&self, path: &str, flags: HostOpenFlags, mode: u32) -> Result<Self::File, HostIoError> {
        let mut fs = self.fs.lock().unwrap();
        let node = match fs.nodes.get(path).cloned() {
            Some(_)
                if flags.contains(HostOpenFlags::CREATE)
                    && flags.contains(HostOpenFlags::EXCLUSIVE) =>
            {
                return Err(HostIoError::AlreadyExists);
            }
            Some(node) => node,
            None if flags.contains(HostOpenFlags::CREATE) => {
                if flags.contains(HostOpenFlags::DIRECTORY) {
                    return Err(HostIoError::NotFound);
                }
                fs.create_file(path, &[], if mode != 0 { mode } else { 0o644 });
                fs.nodes.get(path).cloned().unwrap()
            }
            None => return Err(HostIoError::NotFound),
        };
        match node {
            MockNode::File { data, mode: m, inode } => {
                if flags.contains(HostOpenFlags::DIRECTORY) {
                    return Err(HostIoError::NotADirectory);
                }
                if flags.contains(HostOpenFlags::TRUNCATE) {
                    data.lock().unwrap().clear();
                }
                Ok(MockFile {
                    data,
                    pos: Mutex::new(0),
                    inode,
                    mode: m,
                    readable: flags.contains(HostOpenFlags::READ),
                    writable: flags.contains(HostOpenFlags::WRITE),
                    append: flags.contains(HostOpenFlags::APPEND),
                    is_dir: false,
                    path: path.to_string(),
                    fs_entries: Vec::new(),
                })
            }
            MockNode::Dir { inode } => {
                if flags.contains(HostOpenFlags::WRITE) {
                    return Err(HostIoError::IsADirectory);
                }
                let prefix = if path == "/" {
                    "/".to_string()
                } else {
                    std::format!("{path}/")
                };
                let entries = fs
                    .nodes
                    .iter()
                    .filter(|(p, _)| {
                        p.starts_with(&prefix)
                            && p.len() > prefix.len()
                            && !p[prefix.len()..].contains('/')
                    })
                    .map(|(p, n)| HostDirEntry {
                        name: p[prefix.len()..].to_string(),
                        inode: match n {
                            MockNode::File { inode, .. } | MockNode::Dir { inode } => *inode,
                        },
                        file_type: match n {
                            MockNode::File { .. } => HostFileType::Regular,
                            MockNode::Dir { .. } => HostFileType::Directory,
                        },
                    })
                    .collect();
                Ok(MockFile {
                    data: std::sync::Arc::new(Mutex::new(Vec::new())),
                    pos: Mutex::new(0),
                    inode,
                    mode: 0o755,
                    readable: true,
                    writable: false,
                    append: false,
                    is_dir: true,
                    path: path.to_string(),
                    fs_entries: entries,
                })
            }
        }
    }

    fn status(&self, path: &str, _follow_links: bool) -> Result<HostFileStatus, HostIoError> {
        let fs = self.fs.lock().unwrap();
        match fs.nodes.get(path) {
            Some(MockNode::File { data, mode, inode }) => Ok(HostFileStatus {
                file_type: HostFileType::Regular,
                mode: *mode,
                size: data.lock().unwrap().len() as u64,
                identity: FileIdentity {
                    device: 1,
                    inode: *inode,
                },
                link_count: 1,
                accessed: core::time::Duration::ZERO,
                modified: core::time::Duration::ZERO,
                changed: core::time::Duration::ZERO,
            }),
            Some(MockNode::Dir { inode }) => Ok(HostFileStatus {
                file_type: HostFileType::Directory,
                mode: 0o755,
                size: 0,
                identity: FileIdentity {
                    device: 1,
                    inode: *inode,
                },
                link_count: 1,
                accessed: core::time::Duration::ZERO,
                modified: core::time::Duration::ZERO,
                changed: core::time::Duration::ZERO,
            }),
            None => Err(HostIoError::NotFound),
        }
    }

    fn read_link(&self, _path: &str) -> Result<String, HostIoError> {
        Err(HostIoError::InvalidArgument)
    }

    fn unlink(&self, path: &str) -> Result<(), HostIoError> {
        let mut fs = self.fs.lock().unwrap();
        match fs.nodes.get(path) {
            Some(MockNode::File { .. }) => {
                fs.nodes.remove(path);
                Ok(())
            }
            Some(MockNode::Dir { .. }) => Err(HostIoError::IsADirectory),
            None => Err(HostIoError::NotFound),
        }
    }

    fn make_dir(&self, path: &str, _mode: u32) -> Result<(), HostIoError> {
        let mut fs = self.fs.lock().unwrap();
        if fs.nodes.contains_key(path) {
            return Err(HostIoError::AlreadyExists);
        }
        fs.create_dir(path);
        Ok(())
    }

    fn remove_dir(&self, path: &str) -> Result<(), HostIoError> {
        let mut fs = self.fs.lock().unwrap();
        match fs.nodes.get(path) {
            Some(MockNode::Dir { .. }) => {
                let prefix = std::format!("{path}/");
                if fs.nodes.keys().any(|p| p.starts_with(&prefix)) {
                    return Err(HostIoError::DirectoryNotEmpty);
                }
                fs.nodes.remove(path);
                Ok(())
            }
            Some(MockNode::File { .. }) => Err(HostIoError::NotADirectory),
            None => Err(HostIoError::NotFound),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), HostIoError> {
        let mut fs = self.fs.lock().unwrap();
        let node = fs.nodes.remove(from).ok_or(HostIoError::NotFound)?;
        fs.nodes.insert(to.to_string(), node);
        Ok(())
    }

    fn set_mode(&self, path: &str, new_mode: u32) -> Result<(), HostIoError> {
        let mut fs = self.fs.lock().unwrap();
        match fs.nodes.get_mut(path) {
            Some(MockNode::File { mode, .. }) => {
                *mode = new_mode;
                Ok(())
            }
            Some(MockNode::Dir { .. }) => Ok(()),
            None => Err(HostIoError::NotFound),
        }
    }

    fn set_times(
        &self,
        path: &str,
        _accessed: Option<core::time::Duration>,
        _modified: Option<core::time::Duration>,
    ) -> Result<(), HostIoError> {
        let fs = self.fs.lock().unwrap();
        if fs.nodes.contains_key(path) {
            Ok(())
        } else {
            Err(HostIoError::NotFound)
        }
    }

    fn fs_status(&self, _path: &str) -> Result<HostFsStatus, HostIoError> {
        Ok(HostFsStatus {
            block_size: 4096,
            blocks: 1 << 20,
            blocks_free: 1 << 19,
            blocks_available: 1 << 19,
            files: 1 << 16,
            files_free: 1 << 15,
            name_max: 255,
        })
    }
}

impl DebugLogProvider for MockPlatform {
    fn debug_log_print(&self, msg: &str) {
        std::eprint!("{msg}");
    }
}
