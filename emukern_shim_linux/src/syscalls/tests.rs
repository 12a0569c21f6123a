extern crate std;

use std::boxed::Box;
use std::string::ToString;
use std::sync::{Arc, Mutex as StdMutex};
use std::vec::Vec;
use std::{format, vec};

use emukern::mm::PAGE_SIZE;
use emukern::platform::mock::MockPlatform;
use emukern::platform::page_mgmt::MemoryRegionPermissions;
use emukern::platform::{FileProvider as _, GuestMemoryProvider as _};

use emukern_common_linux::{
    Addr, CloneFlags, FcntlArg, FdFlags, FlockOp, MapFlags, OpenFlags, ProtFlags, Signal,
    WaitOptions, errno::Errno, wstatus,
};

use crate::loader::{LoadError, ProgramImage, ProgramLoader, Segment};
use crate::syscalls::process::{ExitStatus, TaskState};
use crate::{
    ContinueOperation, Kernel, KernelBuilder, SpawnError, StartContext, SyscallOutcome, Task,
    TaskParams, TaskSpawner,
};

const IMAGE_BASE: Addr = 0x0804_8000;

/// Loader used by the tests: the whole file is one read+exec segment.
struct TestLoader;

impl ProgramLoader<MockPlatform> for TestLoader {
    fn load(
        &self,
        file: &<MockPlatform as emukern::platform::FileProvider>::File,
    ) -> Result<ProgramImage, LoadError> {
        use emukern::platform::HostFile as _;
        let mut data = vec![0u8; 0x1000];
        let n = file.read(&mut data, Some(0))?;
        data.truncate(n);
        if data.starts_with(b"#!bad") {
            return Err(LoadError::BadFormat);
        }
        Ok(ProgramImage {
            entry_point: IMAGE_BASE,
            initial_break: IMAGE_BASE + 2 * PAGE_SIZE as Addr,
            segments: vec![Segment {
                vaddr: IMAGE_BASE,
                mem_size: PAGE_SIZE as u32,
                data,
                permissions: MemoryRegionPermissions::READ | MemoryRegionPermissions::EXEC,
            }],
        })
    }
}

/// Spawner used by the tests: children land in a queue for the test to
/// drive explicitly.
struct QueueSpawner {
    queue: Arc<StdMutex<Vec<(Task<MockPlatform>, StartContext)>>>,
}

impl TaskSpawner<MockPlatform> for QueueSpawner {
    fn spawn(
        &self,
        task: Task<MockPlatform>,
        start: StartContext,
    ) -> Result<(), SpawnError> {
        self.queue.lock().unwrap().push((task, start));
        Ok(())
    }
}

struct TestEnv {
    platform: &'static MockPlatform,
    kernel: Kernel<MockPlatform>,
    spawned: Arc<StdMutex<Vec<(Task<MockPlatform>, StartContext)>>>,
}

impl TestEnv {
    /// Pops the most recently spawned child task.
    fn take_spawned(&self) -> Task<MockPlatform> {
        let (task, _start) = self
            .spawned
            .lock()
            .unwrap()
            .pop()
            .expect("no spawned task queued");
        task
    }
}

fn setup() -> (TestEnv, Task<MockPlatform>) {
    let platform = MockPlatform::new();
    platform.add_host_dir("/dev");
    platform.add_host_file("/dev/stdin", b"");
    platform.add_host_file("/dev/stdout", b"");
    platform.add_host_file("/dev/stderr", b"");
    platform.add_host_dir("/bin");
    platform.add_host_executable("/bin/init", b"INIT");
    platform.add_host_dir("/tmp");

    let spawned = Arc::new(StdMutex::new(Vec::new()));
    let mut builder = KernelBuilder::new(platform);
    builder.set_loader(Box::new(TestLoader));
    builder.set_spawner(Box::new(QueueSpawner {
        queue: spawned.clone(),
    }));
    let kernel = builder.build();

    let launched = kernel
        .launch(
            TaskParams::default(),
            "/bin/init",
            vec!["init".to_string()],
            vec!["TERM=dumb".to_string()],
        )
        .expect("launch failed");
    launched.task.attach();

    (
        TestEnv {
            platform,
            kernel,
            spawned,
        },
        launched.task,
    )
}

/// Scratch guest memory well away from the image and stack.
const SCRATCH: Addr = 0x2000_0000;

fn poke_cstr(platform: &'static MockPlatform, addr: Addr, s: &str) {
    platform.write_guest(addr as usize, s.as_bytes()).unwrap();
    platform
        .write_guest(addr as usize + s.len(), &[0u8])
        .unwrap();
}

fn poke_words(platform: &'static MockPlatform, addr: Addr, words: &[u32]) {
    for (i, w) in words.iter().enumerate() {
        platform
            .write_guest(addr as usize + i * 4, &w.to_le_bytes())
            .unwrap();
    }
}

// ---------------------------------------------------------------------------
// Launch & dispatch

#[test]
fn launch_builds_image_stack_and_stdio() {
    let (_env, task) = setup();
    let mm = task.mm().unwrap();
    // Image segment and stack are both present.
    assert!(mm.contains_range(IMAGE_BASE as usize, PAGE_SIZE));
    assert!(!mm.mappings().is_empty());
    // The break sits past the image.
    assert!(mm.current_break() >= IMAGE_BASE as usize + PAGE_SIZE);
    // stdio descriptors 0..=2 exist.
    for fd in 0..3 {
        assert!(task.fd_file(fd).is_ok(), "missing stdio fd {fd}");
    }
    assert_eq!(task.process().pid(), 1);
}

#[test]
fn dispatcher_encodes_results_and_unknown_numbers() {
    let (_env, task) = setup();
    assert_eq!(task.prepare_to_run_guest(), ContinueOperation::ResumeGuest);

    // getpid (i386 nr 20).
    match task.syscall(20, [0; 6]) {
        SyscallOutcome::Return(v) => assert_eq!(v, 1),
        other => panic!("unexpected outcome {other:?}"),
    }
    // Unknown syscall: ENOSYS encoded as a negative return, no abort.
    match task.syscall(0xdead, [0; 6]) {
        SyscallOutcome::Return(v) => assert_eq!(v as i32, Errno::ENOSYS.as_neg()),
        other => panic!("unexpected outcome {other:?}"),
    }
    // A bad pointer surfaces as EFAULT rather than a host fault.
    match task.syscall(122, [0xffff_fff0, 0, 0, 0, 0, 0]) {
        SyscallOutcome::Return(v) => assert_eq!(v as i32, Errno::EFAULT.as_neg()),
        other => panic!("unexpected outcome {other:?}"),
    }
    // exit_group through the dispatcher terminates the task.
    match task.syscall(252, [3, 0, 0, 0, 0, 0]) {
        SyscallOutcome::Exited => {}
        other => panic!("unexpected outcome {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Memory

#[test]
fn brk_is_idempotent_and_reports_current_on_failure() {
    let (_env, task) = setup();
    let current = task.sys_brk(0).unwrap();
    let target = current + 3 * PAGE_SIZE as u32 + 5;
    assert_eq!(task.sys_brk(target).unwrap(), target);
    assert_eq!(task.sys_brk(target).unwrap(), target);

    // Plant an obstacle right above the break and try to grow through it.
    let obstacle = (target as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let mm = task.mm().unwrap();
    mm.map_anonymous(
        obstacle,
        PAGE_SIZE,
        MemoryRegionPermissions::READ,
        emukern::mm::MapRequestFlags::FIXED,
    )
    .unwrap();
    // Failure reports the unchanged current break.
    assert_eq!(
        task.sys_brk(target + 4 * PAGE_SIZE as u32).unwrap(),
        target
    );
}

#[test]
fn mmap_protect_fixed_overwrite_unmap_scenario() {
    let (_env, task) = setup();
    let prot_rw = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
    let anon_priv = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;

    let x = task
        .sys_mmap2(0, PAGE_SIZE as u32, prot_rw, anon_priv, -1, 0)
        .unwrap();
    assert_eq!(x as usize % PAGE_SIZE, 0);

    task.sys_mprotect(x, PAGE_SIZE as u32, ProtFlags::PROT_READ)
        .unwrap();

    // MAP_FIXED overwrites the read-only region in place.
    let y = task
        .sys_mmap2(
            x,
            PAGE_SIZE as u32,
            prot_rw,
            anon_priv | MapFlags::MAP_FIXED,
            -1,
            0,
        )
        .unwrap();
    assert_eq!(y, x);

    task.sys_munmap(x, PAGE_SIZE as u32).unwrap();
    // Unmapping an unmapped range is idempotent.
    task.sys_munmap(x, PAGE_SIZE as u32).unwrap();

    let mm = task.mm().unwrap();
    assert!(!mm.contains_range(x as usize, PAGE_SIZE));
}

#[test]
fn mmap_file_populates_contents() {
    let (env, task) = setup();
    env.platform
        .add_host_file("/tmp/data.bin", b"hello mapping");

    poke_cstr(env.platform, SCRATCH, "/tmp/data.bin");
    let fd = task
        .sys_open(SCRATCH, OpenFlags::empty(), 0)
        .unwrap() as i32;
    let addr = task
        .sys_mmap2(
            0,
            PAGE_SIZE as u32,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            fd,
            0,
        )
        .unwrap();

    let mut buf = [0u8; 13];
    env.platform.read_guest(addr as usize, &mut buf).unwrap();
    assert_eq!(&buf, b"hello mapping");

    // The region records its file backing.
    let mm = task.mm().unwrap();
    let (_, vma) = mm
        .mappings()
        .into_iter()
        .find(|(r, _)| r.start == addr as usize)
        .unwrap();
    assert!(vma.is_file_backed());
}

#[test]
fn mmap_rejects_bad_flag_combinations() {
    let (_env, task) = setup();
    let prot = ProtFlags::PROT_READ;
    // Neither PRIVATE nor SHARED.
    assert_eq!(
        task.sys_mmap2(0, 4096, prot, MapFlags::MAP_ANONYMOUS, -1, 0),
        Err(Errno::EINVAL)
    );
    // Zero length.
    assert_eq!(
        task.sys_mmap2(
            0,
            0,
            prot,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            -1,
            0
        ),
        Err(Errno::EINVAL)
    );
    // mprotect of an unmapped range.
    assert_eq!(
        task.sys_mprotect(0x7000_0000, 4096, prot),
        Err(Errno::ENOMEM)
    );
}

// ---------------------------------------------------------------------------
// File descriptors

#[test]
fn open_read_write_lseek_roundtrip() {
    let (env, task) = setup();
    poke_cstr(env.platform, SCRATCH, "/tmp/file.txt");
    let fd = task
        .sys_open(
            SCRATCH,
            OpenFlags::O_RDWR | OpenFlags::O_CREAT,
            0o666,
        )
        .unwrap() as i32;

    let data_addr = SCRATCH + 0x100;
    env.platform
        .write_guest(data_addr as usize, b"guest data")
        .unwrap();
    assert_eq!(task.sys_write(fd, data_addr, 10).unwrap(), 10);

    assert_eq!(
        task.sys_lseek(fd, 0, emukern_common_linux::SeekWhence::Set)
            .unwrap(),
        0
    );
    let read_addr = SCRATCH + 0x200;
    assert_eq!(task.sys_read(fd, read_addr, 10).unwrap(), 10);
    let mut back = [0u8; 10];
    env.platform
        .read_guest(read_addr as usize, &mut back)
        .unwrap();
    assert_eq!(&back, b"guest data");

    task.sys_close(fd).unwrap();
    assert_eq!(task.sys_close(fd), Err(Errno::EBADF));
}

#[test]
fn dup2_self_is_noop_and_dup_shares_the_description() {
    let (env, task) = setup();
    env.platform.add_host_file("/tmp/a", b"abcdef");
    poke_cstr(env.platform, SCRATCH, "/tmp/a");
    let fd = task.sys_open(SCRATCH, OpenFlags::empty(), 0).unwrap() as i32;

    // dup2 onto itself: returns the fd, no handle churn.
    assert_eq!(task.sys_dup2(fd, fd).unwrap(), fd as u32);
    // dup2 onto an invalid source fails.
    assert_eq!(task.sys_dup2(99, 5), Err(Errno::EBADF));

    let dup = task.sys_dup(fd).unwrap() as i32;
    assert_ne!(dup, fd);

    // The two descriptors share one offset (one open-file description).
    let buf = SCRATCH + 0x100;
    assert_eq!(task.sys_read(fd, buf, 3).unwrap(), 3);
    assert_eq!(task.sys_read(dup, buf, 3).unwrap(), 3);
    let mut back = [0u8; 3];
    env.platform.read_guest(buf as usize, &mut back).unwrap();
    assert_eq!(&back, b"def");

    // Closing the duplicate leaves the original usable.
    task.sys_close(dup).unwrap();
    assert_eq!(
        task.sys_lseek(fd, 0, emukern_common_linux::SeekWhence::Current)
            .unwrap(),
        6
    );
}

#[test]
fn fcntl_descriptor_flags_and_status_flags() {
    let (env, task) = setup();
    env.platform.add_host_file("/tmp/f", b"");
    poke_cstr(env.platform, SCRATCH, "/tmp/f");
    let fd = task
        .sys_open(SCRATCH, OpenFlags::O_RDWR | OpenFlags::O_CLOEXEC, 0)
        .unwrap() as i32;

    assert_eq!(
        task.sys_fcntl(fd, FcntlArg::GetFd).unwrap(),
        FdFlags::FD_CLOEXEC.bits()
    );
    task.sys_fcntl(fd, FcntlArg::SetFd(FdFlags::empty())).unwrap();
    assert_eq!(task.sys_fcntl(fd, FcntlArg::GetFd).unwrap(), 0);

    task.sys_fcntl(fd, FcntlArg::SetFl(OpenFlags::O_NONBLOCK))
        .unwrap();
    let status = OpenFlags::from_bits_retain(task.sys_fcntl(fd, FcntlArg::GetFl).unwrap());
    assert!(status.contains(OpenFlags::O_NONBLOCK));
    assert!(status.contains(OpenFlags::O_RDWR));

    // F_DUPFD_CLOEXEC picks the lowest slot at or above the floor and sets
    // the flag.
    let dup = task
        .sys_fcntl(fd, FcntlArg::DupFdCloexec { min: 10 })
        .unwrap();
    assert!(dup >= 10);
    assert_eq!(
        task.sys_fcntl(dup as i32, FcntlArg::GetFd).unwrap(),
        FdFlags::FD_CLOEXEC.bits()
    );

    // Unsupported commands are refused, not fatal.
    assert_eq!(
        task.sys_fcntl(fd, FcntlArg::Unsupported(1000)),
        Err(Errno::EOPNOTSUPP)
    );
}

#[test]
fn flock_shared_exclusive_and_nonblocking() {
    let (env, task) = setup();
    env.platform.add_host_file("/tmp/lockfile", b"");
    poke_cstr(env.platform, SCRATCH, "/tmp/lockfile");
    let fd_a = task.sys_open(SCRATCH, OpenFlags::empty(), 0).unwrap() as i32;
    let fd_b = task.sys_open(SCRATCH, OpenFlags::empty(), 0).unwrap() as i32;

    // Two shared locks coexist.
    task.sys_flock(fd_a, FlockOp::LOCK_SH).unwrap();
    task.sys_flock(fd_b, FlockOp::LOCK_SH | FlockOp::LOCK_NB)
        .unwrap();

    // Upgrading one to exclusive while the other holds shared would block.
    assert_eq!(
        task.sys_flock(fd_b, FlockOp::LOCK_EX | FlockOp::LOCK_NB),
        Err(Errno::EWOULDBLOCK)
    );

    // Releasing the other lets the upgrade through.
    task.sys_flock(fd_a, FlockOp::LOCK_UN).unwrap();
    task.sys_flock(fd_b, FlockOp::LOCK_EX | FlockOp::LOCK_NB)
        .unwrap();

    // A dup of fd_b shares the lock owner, so it "holds" the lock too.
    let dup = task.sys_dup(fd_b).unwrap() as i32;
    task.sys_flock(dup, FlockOp::LOCK_EX | FlockOp::LOCK_NB)
        .unwrap();

    // Closing every descriptor of the description releases the lock.
    task.sys_close(fd_b).unwrap();
    task.sys_close(dup).unwrap();
    task.sys_flock(fd_a, FlockOp::LOCK_EX | FlockOp::LOCK_NB)
        .unwrap();

    // Bad operation words are rejected.
    assert_eq!(
        task.sys_flock(fd_a, FlockOp::LOCK_SH | FlockOp::LOCK_EX),
        Err(Errno::EINVAL)
    );
}

#[test]
fn blocking_flock_wakes_on_release() {
    let (env, task) = setup();
    env.platform.add_host_file("/tmp/contended", b"");
    poke_cstr(env.platform, SCRATCH, "/tmp/contended");
    let fd = task.sys_open(SCRATCH, OpenFlags::empty(), 0).unwrap() as i32;
    task.sys_flock(fd, FlockOp::LOCK_EX).unwrap();

    // A second task (CLONE_FILES sibling) blocks on the same file until the
    // holder unlocks.
    let flags = CloneFlags::VM
        | CloneFlags::FS
        | CloneFlags::FILES
        | CloneFlags::SIGHAND
        | CloneFlags::THREAD;
    task.sys_clone(flags, 0, 0, 0, 0, 0).unwrap();
    let sibling = env.take_spawned();

    let handle = std::thread::spawn(move || {
        sibling.attach();
        // The descriptor table is shared, so the sibling opens its own
        // description of the same file.
        let fd2 = sibling.sys_open(SCRATCH, OpenFlags::empty(), 0).unwrap() as i32;
        sibling.sys_flock(fd2, FlockOp::LOCK_EX).unwrap();
        sibling.sys_flock(fd2, FlockOp::LOCK_UN).unwrap();
        sibling.sys_exit(0);
    });

    std::thread::sleep(core::time::Duration::from_millis(20));
    task.sys_flock(fd, FlockOp::LOCK_UN).unwrap();
    handle.join().unwrap();
}

#[test]
fn getdents64_walks_a_directory() {
    let (env, task) = setup();
    env.platform.add_host_file("/tmp/one", b"1");
    env.platform.add_host_file("/tmp/two", b"2");

    poke_cstr(env.platform, SCRATCH, "/tmp");
    let fd = task
        .sys_open(SCRATCH, OpenFlags::O_DIRECTORY, 0)
        .unwrap() as i32;
    let n = task.sys_getdents64(fd, SCRATCH + 0x1000, 4096).unwrap();
    assert!(n > 0);
    // A second call resumes where the first stopped; eventually empty.
    let mut guard = 0;
    loop {
        let more = task.sys_getdents64(fd, SCRATCH + 0x1000, 4096).unwrap();
        if more == 0 {
            break;
        }
        guard += 1;
        assert!(guard < 16);
    }
}

// ---------------------------------------------------------------------------
// Processes

#[test]
fn fork_exit_wait_reaps_exactly_once() {
    let (env, task) = setup();
    let before = env.kernel.process_count();

    let child_pid = task.sys_fork().unwrap() as i32;
    assert!(child_pid > 1);
    assert_eq!(env.kernel.process_count(), before + 1);

    let child = env.take_spawned();
    child.attach();
    assert_eq!(child.process().pid(), child_pid);
    assert_eq!(child.process().ppid(), task.process().pid());
    // The child's exit makes it a zombie retained in the table.
    let _ = child.sys_exit(5);
    assert_eq!(
        env.kernel.exit_status_of(child_pid),
        Some(ExitStatus::Exited(5))
    );
    drop(child);
    assert_eq!(env.kernel.process_count(), before + 1);

    // The parent reaps it and gets the status word.
    let status_addr = SCRATCH + 0x10;
    let reaped = task
        .sys_wait4(child_pid, status_addr, WaitOptions::empty(), 0)
        .unwrap();
    assert_eq!(reaped, child_pid as u32);
    let mut status = [0u8; 4];
    env.platform
        .read_guest(status_addr as usize, &mut status)
        .unwrap();
    assert_eq!(u32::from_le_bytes(status), wstatus::exited(5));

    // Reaping is exactly-once: the record is gone and a second wait fails.
    assert_eq!(env.kernel.process_count(), before);
    assert_eq!(
        task.sys_wait4(child_pid, 0, WaitOptions::empty(), 0),
        Err(Errno::ECHILD)
    );
}

#[test]
fn wait_with_wnohang_returns_zero_while_child_runs() {
    let (env, task) = setup();
    let child_pid = task.sys_fork().unwrap() as i32;
    let child = env.take_spawned();

    assert_eq!(
        task.sys_wait4(-1, 0, WaitOptions::WNOHANG, 0).unwrap(),
        0
    );

    let _ = child.sys_exit(0);
    drop(child);
    assert_eq!(
        task.sys_wait4(-1, 0, WaitOptions::WNOHANG, 0).unwrap(),
        child_pid as u32
    );
}

#[test]
fn blocking_wait_sees_concurrent_exit() {
    let (env, task) = setup();
    let child_pid = task.sys_fork().unwrap() as i32;
    let child = env.take_spawned();

    let handle = std::thread::spawn(move || {
        child.attach();
        std::thread::sleep(core::time::Duration::from_millis(20));
        let _ = child.sys_exit(42);
    });

    // Blocks until the child's zombie transition wakes the wait; the
    // wakeup must not be missable.
    let reaped = task
        .sys_wait4(child_pid, SCRATCH, WaitOptions::empty(), 0)
        .unwrap();
    assert_eq!(reaped, child_pid as u32);
    let mut status = [0u8; 4];
    env.platform.read_guest(SCRATCH as usize, &mut status).unwrap();
    assert_eq!(u32::from_le_bytes(status), wstatus::exited(42));
    handle.join().unwrap();
}

#[test]
fn fork_copies_fd_table_clone_files_shares_it() {
    let (env, task) = setup();
    env.platform.add_host_file("/tmp/seen", b"");
    poke_cstr(env.platform, SCRATCH, "/tmp/seen");

    // Plain fork: the child's table is an independent copy.
    task.sys_fork().unwrap();
    let forked = env.take_spawned();
    let fd = forked.sys_open(SCRATCH, OpenFlags::empty(), 0).unwrap();
    assert!(task.fd_file(fd as i32).is_err() || {
        // The slot may coincide with an existing parent fd; what matters is
        // that the parent's entry is not the child's file.
        !Arc::ptr_eq(
            &task.fd_file(fd as i32).unwrap(),
            &forked.fd_file(fd as i32).unwrap(),
        )
    });
    let _ = forked.sys_exit(0);
    drop(forked);
    task.sys_wait4(-1, 0, WaitOptions::empty(), 0).unwrap();

    // CLONE_FILES: descriptors installed by one task appear in the other.
    let flags = CloneFlags::VM
        | CloneFlags::FS
        | CloneFlags::FILES
        | CloneFlags::SIGHAND
        | CloneFlags::THREAD;
    task.sys_clone(flags, 0, 0, 0, 0, 0).unwrap();
    let sibling = env.take_spawned();
    let fd = sibling.sys_open(SCRATCH, OpenFlags::empty(), 0).unwrap();
    assert!(Arc::ptr_eq(
        &task.fd_file(fd as i32).unwrap(),
        &sibling.fd_file(fd as i32).unwrap(),
    ));
    let _ = sibling.sys_exit(0);
}

#[test]
fn concurrent_opens_on_shared_table_get_distinct_fds() {
    let (env, task) = setup();
    for i in 0..8 {
        env.platform
            .add_host_file(&format!("/tmp/file{i}"), b"x");
    }
    let flags = CloneFlags::VM
        | CloneFlags::FS
        | CloneFlags::FILES
        | CloneFlags::SIGHAND
        | CloneFlags::THREAD;
    task.sys_clone(flags, 0, 0, 0, 0, 0).unwrap();
    let sibling = env.take_spawned();

    // Each task opens four distinct files concurrently through the shared
    // table.
    for (i, base) in [(0u32, SCRATCH), (4u32, SCRATCH + 0x4000)] {
        for j in 0..4 {
            poke_cstr(
                env.platform,
                base + j * 0x100,
                &format!("/tmp/file{}", i + j),
            );
        }
    }
    let sibling_fds = std::thread::spawn(move || {
        sibling.attach();
        let mut fds = Vec::new();
        for j in 0..4u32 {
            fds.push(
                sibling
                    .sys_open(SCRATCH + 0x4000 + j * 0x100, OpenFlags::empty(), 0)
                    .unwrap(),
            );
        }
        (sibling, fds)
    });
    let mut my_fds = Vec::new();
    for j in 0..4u32 {
        my_fds.push(
            task.sys_open(SCRATCH + j * 0x100, OpenFlags::empty(), 0)
                .unwrap(),
        );
    }
    let (sibling, other_fds) = sibling_fds.join().unwrap();

    // No collisions across the eight concurrent allocations.
    let mut all: Vec<u32> = my_fds.iter().chain(other_fds.iter()).copied().collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 8, "fd collision: {my_fds:?} vs {other_fds:?}");
    let _ = sibling.sys_exit(0);
}

#[test]
fn exec_replaces_address_space_and_honors_cloexec() {
    let (env, task) = setup();
    env.platform.add_host_executable("/bin/other", b"OTHER");
    env.platform.add_host_file("/tmp/keep", b"");
    env.platform.add_host_file("/tmp/drop", b"");

    poke_cstr(env.platform, SCRATCH, "/tmp/keep");
    let keep = task.sys_open(SCRATCH, OpenFlags::empty(), 0).unwrap() as i32;
    poke_cstr(env.platform, SCRATCH + 0x100, "/tmp/drop");
    let drop_fd = task
        .sys_open(SCRATCH + 0x100, OpenFlags::O_CLOEXEC, 0)
        .unwrap() as i32;

    // A pre-exec mapping to prove replacement.
    let premap = task
        .sys_mmap2(
            0,
            PAGE_SIZE as u32,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            -1,
            0,
        )
        .unwrap();
    let pid_before = task.process().pid();

    // execve("/bin/other", ["other"], []).
    poke_cstr(env.platform, SCRATCH + 0x200, "/bin/other");
    poke_cstr(env.platform, SCRATCH + 0x300, "other");
    poke_words(env.platform, SCRATCH + 0x400, &[SCRATCH + 0x300, 0]);
    poke_words(env.platform, SCRATCH + 0x500, &[0]);
    let control = task
        .sys_execve(SCRATCH + 0x200, SCRATCH + 0x400, SCRATCH + 0x500)
        .unwrap();
    match control {
        crate::Control::Exec { entry_point, .. } => assert_eq!(entry_point, IMAGE_BASE),
        _ => panic!("execve did not produce an exec control transfer"),
    }

    // Pid preserved; pre-exec mappings gone; cloexec swept, others kept.
    assert_eq!(task.process().pid(), pid_before);
    let mm = task.mm().unwrap();
    assert!(!mm.contains_range(premap as usize, PAGE_SIZE));
    assert!(task.fd_file(keep).is_ok());
    assert_eq!(task.fd_file(drop_fd).unwrap_err(), Errno::EBADF);
}

#[test]
fn exec_of_non_executable_fails() {
    let (env, task) = setup();
    env.platform.add_host_file("/tmp/plain", b"data");
    env.platform.add_host_executable("/bin/bad", b"#!bad");

    poke_cstr(env.platform, SCRATCH, "/tmp/plain");
    poke_words(env.platform, SCRATCH + 0x100, &[0]);
    assert_eq!(
        task.sys_execve(SCRATCH, SCRATCH + 0x100, SCRATCH + 0x100)
            .map(|_| ()),
        Err(Errno::EACCES)
    );

    poke_cstr(env.platform, SCRATCH + 0x200, "/bin/bad");
    assert_eq!(
        task.sys_execve(SCRATCH + 0x200, SCRATCH + 0x100, SCRATCH + 0x100)
            .map(|_| ()),
        Err(Errno::ENOEXEC)
    );
}

#[test]
fn vfork_blocks_parent_until_child_exits() {
    let (env, task) = setup();
    let start = std::time::Instant::now();

    // The child exits 20ms after being spawned; vfork must not return
    // before that.
    let spawned = env.spawned.clone();
    let driver = std::thread::spawn(move || {
        loop {
            if let Some((child, _)) = spawned.lock().unwrap().pop() {
                child.attach();
                std::thread::sleep(core::time::Duration::from_millis(20));
                let _ = child.sys_exit(0);
                break;
            }
            std::thread::yield_now();
        }
    });

    task.sys_vfork().unwrap();
    assert!(start.elapsed() >= core::time::Duration::from_millis(15));
    driver.join().unwrap();
    task.sys_wait4(-1, 0, WaitOptions::empty(), 0).unwrap();
}

#[test]
fn orphans_reparent_to_init() {
    let (env, task) = setup();
    assert_eq!(task.process().pid(), 1);

    // init forks A; A forks B; A exits. B must be re-parented to init.
    task.sys_fork().unwrap();
    let a = env.take_spawned();
    a.attach();
    let b_pid = a.sys_fork().unwrap() as i32;
    let b = env.take_spawned();
    b.attach();

    let a_pid = a.process().pid();
    let _ = a.sys_exit(0);
    drop(a);
    assert_eq!(
        task.sys_wait4(a_pid, 0, WaitOptions::empty(), 0).unwrap(),
        a_pid as u32
    );

    assert_eq!(b.process().ppid(), 1);
    let _ = b.sys_exit(9);
    drop(b);
    // init can reap the grandchild it inherited.
    let status_addr = SCRATCH;
    assert_eq!(
        task.sys_wait4(-1, status_addr, WaitOptions::empty(), 0)
            .unwrap(),
        b_pid as u32
    );
    let mut status = [0u8; 4];
    env.platform
        .read_guest(status_addr as usize, &mut status)
        .unwrap();
    assert_eq!(u32::from_le_bytes(status), wstatus::exited(9));
}

#[test]
fn kill_stop_continue_and_fatal_signals() {
    let (env, task) = setup();
    let child_pid = task.sys_fork().unwrap() as i32;
    let child = env.take_spawned();

    let handle = std::thread::spawn(move || {
        child.attach();
        // Simulated guest loop: run until told to exit.
        loop {
            match child.prepare_to_run_guest() {
                ContinueOperation::ExitThread => break,
                ContinueOperation::ResumeGuest => {
                    std::thread::sleep(core::time::Duration::from_millis(1));
                    child.wait_state.finish_running_guest();
                }
            }
        }
        drop(child);
    });

    // Stop the child and observe it via WUNTRACED.
    task.sys_kill(child_pid, Signal::SIGSTOP.as_i32()).unwrap();
    let reported = task
        .sys_wait4(
            child_pid,
            SCRATCH,
            WaitOptions::WUNTRACED,
            0,
        )
        .unwrap();
    assert_eq!(reported, child_pid as u32);
    let mut status = [0u8; 4];
    env.platform.read_guest(SCRATCH as usize, &mut status).unwrap();
    assert_eq!(
        u32::from_le_bytes(status),
        wstatus::stopped(Signal::SIGSTOP.as_i32())
    );
    assert!(matches!(
        env.kernel.0.processes.get(child_pid).unwrap().task_state(),
        TaskState::Stopped(_)
    ));

    // Continue it and observe via WCONTINUED.
    task.sys_kill(child_pid, Signal::SIGCONT.as_i32()).unwrap();
    let reported = task
        .sys_wait4(child_pid, SCRATCH, WaitOptions::WCONTINUED, 0)
        .unwrap();
    assert_eq!(reported, child_pid as u32);
    env.platform.read_guest(SCRATCH as usize, &mut status).unwrap();
    assert_eq!(u32::from_le_bytes(status), wstatus::CONTINUED);

    // SIGKILL terminates it; wait reports the signal.
    task.sys_kill(child_pid, Signal::SIGKILL.as_i32()).unwrap();
    let reaped = task
        .sys_wait4(child_pid, SCRATCH, WaitOptions::empty(), 0)
        .unwrap();
    assert_eq!(reaped, child_pid as u32);
    env.platform.read_guest(SCRATCH as usize, &mut status).unwrap();
    assert_eq!(
        u32::from_le_bytes(status),
        wstatus::signaled(Signal::SIGKILL.as_i32())
    );
    handle.join().unwrap();

    // Signalling a vanished pid is ESRCH.
    assert_eq!(
        task.sys_kill(child_pid, Signal::SIGTERM.as_i32()),
        Err(Errno::ESRCH)
    );
}

#[test]
fn process_group_calls_and_wait_by_group() {
    let (env, task) = setup();
    // Put the first child in its own group, keyed by its pid.
    let c1 = task.sys_fork().unwrap() as i32;
    let child1 = env.take_spawned();
    task.sys_setpgid(c1, c1).unwrap();
    assert_eq!(task.sys_getpgid(c1).unwrap(), c1);

    let c2 = task.sys_fork().unwrap() as i32;
    let child2 = env.take_spawned();
    assert_eq!(task.sys_getpgid(c2).unwrap(), task.process().pgid());

    let _ = child1.sys_exit(1);
    let _ = child2.sys_exit(2);
    drop(child1);
    drop(child2);

    // wait for -pgid only matches the child moved into that group.
    assert_eq!(
        task.sys_wait4(-c1, 0, WaitOptions::empty(), 0).unwrap(),
        c1 as u32
    );
    assert_eq!(
        task.sys_wait4(-1, 0, WaitOptions::empty(), 0).unwrap(),
        c2 as u32
    );

    // setsid moves a non-leader into a fresh session.
    let c3 = task.sys_fork().unwrap() as i32;
    let child3 = env.take_spawned();
    child3.attach();
    assert_eq!(child3.sys_setsid().unwrap(), c3);
    assert_eq!(child3.sys_getpgid(0).unwrap(), c3);
    // A group leader cannot setsid again.
    assert_eq!(child3.sys_setsid(), Err(Errno::EPERM));
    let _ = child3.sys_exit(0);
    task.sys_wait4(c3, 0, WaitOptions::empty(), 0).unwrap();
}

#[test]
fn nanosleep_completes_and_pause_is_interruptible_only() {
    let (env, task) = setup();
    // A short sleep runs to its timeout.
    poke_words(env.platform, SCRATCH, &[0, 5_000_000]); // 5 ms
    assert_eq!(task.sys_nanosleep(SCRATCH, 0), Ok(()));
    // Bad nanoseconds are rejected.
    poke_words(env.platform, SCRATCH, &[0, 2_000_000_000]);
    assert_eq!(task.sys_nanosleep(SCRATCH, 0), Err(Errno::EINVAL));
}

#[test]
fn cwd_tracking_and_path_resolution() {
    let (env, task) = setup();
    env.platform.add_host_dir("/tmp/sub");
    env.platform.add_host_file("/tmp/sub/x", b"x");

    poke_cstr(env.platform, SCRATCH, "/tmp/sub");
    task.sys_chdir(SCRATCH).unwrap();
    let len = task.sys_getcwd(SCRATCH + 0x100, 64).unwrap();
    let mut buf = vec![0u8; len];
    env.platform
        .read_guest((SCRATCH + 0x100) as usize, &mut buf)
        .unwrap();
    assert_eq!(&buf[..len - 1], b"/tmp/sub");

    // Relative opens resolve against the new cwd.
    poke_cstr(env.platform, SCRATCH + 0x200, "x");
    assert!(task.sys_open(SCRATCH + 0x200, OpenFlags::empty(), 0).is_ok());

    // A cwd that is not a directory is refused.
    poke_cstr(env.platform, SCRATCH + 0x300, "/tmp/sub/x");
    assert_eq!(task.sys_chdir(SCRATCH + 0x300), Err(Errno::ENOTDIR));

    // ERANGE when the buffer cannot hold the cwd and terminator.
    assert_eq!(task.sys_getcwd(SCRATCH + 0x100, 4), Err(Errno::ERANGE));
}

#[test]
fn umask_applies_to_creation_modes() {
    let (env, task) = setup();
    assert_eq!(task.sys_umask(0o027).unwrap(), 0o022);
    assert_eq!(task.sys_umask(0o027).unwrap(), 0o027);

    poke_cstr(env.platform, SCRATCH, "/tmp/masked");
    let fd = task
        .sys_open(
            SCRATCH,
            OpenFlags::O_CREAT | OpenFlags::O_RDWR,
            0o666,
        )
        .unwrap() as i32;
    task.sys_close(fd).unwrap();
    let status = env
        .platform
        .status("/tmp/masked", true)
        .map(|s| s.mode)
        .unwrap();
    assert_eq!(status, 0o640);
}

#[test]
fn uname_and_sysinfo_marshal() {
    let (env, task) = setup();
    task.sys_uname(SCRATCH).unwrap();
    let mut sysname = [0u8; 5];
    env.platform.read_guest(SCRATCH as usize, &mut sysname).unwrap();
    assert_eq!(&sysname, b"Linux");
    let mut machine = [0u8; 4];
    // machine is the fifth 65-byte field.
    env.platform
        .read_guest(SCRATCH as usize + 4 * 65, &mut machine)
        .unwrap();
    assert_eq!(&machine, b"i686");

    task.sys_sysinfo(SCRATCH + 0x1000).unwrap();
    let mut procs = [0u8; 2];
    // procs sits after uptime, loads[3], and six memory words.
    env.platform
        .read_guest((SCRATCH + 0x1000) as usize + 40, &mut procs)
        .unwrap();
    assert_eq!(u16::from_le_bytes(procs) as usize, env.kernel.process_count());
}
