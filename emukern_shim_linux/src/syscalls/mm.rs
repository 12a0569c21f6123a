// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Memory-management syscalls: `brk`, `mmap2`, `munmap`, `mprotect`,
//! `madvise`.

use emukern::mm::{AreaBacking, MapError, MapRequestFlags, PAGE_SIZE};
use emukern::platform::HostFile as _;
use emukern::platform::page_mgmt::MemoryRegionPermissions;

use emukern_common_linux::{Addr, MadviseAdvice, MapFlags, ProtFlags, errno::Errno};

use crate::{KernelPlatform, MAX_KERNEL_BUF_SIZE, Task, bounded_kernel_buf};

fn permissions_from_prot(prot: ProtFlags) -> MemoryRegionPermissions {
    let mut perms = MemoryRegionPermissions::empty();
    perms.set(
        MemoryRegionPermissions::READ,
        prot.contains(ProtFlags::PROT_READ),
    );
    perms.set(
        MemoryRegionPermissions::WRITE,
        prot.contains(ProtFlags::PROT_WRITE),
    );
    perms.set(
        MemoryRegionPermissions::EXEC,
        prot.contains(ProtFlags::PROT_EXEC),
    );
    perms
}

impl<P: KernelPlatform> Task<P> {
    /// `brk` always reports the current break: the new one on success, the
    /// historical one when the request cannot be honored.
    pub(crate) fn sys_brk(&self, addr: Addr) -> Result<u32, Errno> {
        let mm = self.mm()?;
        if addr == 0 {
            return Ok(mm.current_break() as u32);
        }
        match mm.set_break(addr as usize) {
            Ok(new_break) => Ok(new_break as u32),
            Err(_) => Ok(mm.current_break() as u32),
        }
    }

    pub(crate) fn sys_mmap2(
        &self,
        addr: Addr,
        length: u32,
        prot: ProtFlags,
        flags: MapFlags,
        fd: i32,
        pgoffset: u32,
    ) -> Result<u32, Errno> {
        if length == 0 {
            return Err(Errno::EINVAL);
        }
        let shared = flags.contains(MapFlags::MAP_SHARED);
        let private = flags.contains(MapFlags::MAP_PRIVATE);
        if shared == private {
            return Err(Errno::EINVAL);
        }

        let mut request = MapRequestFlags::empty();
        request.set(MapRequestFlags::FIXED, flags.contains(MapFlags::MAP_FIXED));
        request.set(MapRequestFlags::SHARED, shared);
        request.set(
            MapRequestFlags::GROWS_DOWN,
            flags.contains(MapFlags::MAP_GROWSDOWN),
        );
        let permissions = permissions_from_prot(prot);
        let mm = self.mm()?;

        let chosen = if flags.contains(MapFlags::MAP_ANONYMOUS) {
            mm.map_anonymous(addr as usize, length as usize, permissions, request)
        } else {
            let file = self.fd_file(fd)?;
            if !file.readable() {
                return Err(Errno::EACCES);
            }
            let offset = u64::from(pgoffset) * PAGE_SIZE as u64;
            let backing = AreaBacking::File {
                file: file.backing_id,
                offset,
            };
            // Private file mappings read their contents at map time; the
            // pages are writable while this runs even for read-only
            // mappings.
            let init = |base: usize| -> Result<(), MapError> {
                let mut kernel_buf = bounded_kernel_buf(length as usize);
                let mut done = 0usize;
                while done < length as usize {
                    let chunk = (length as usize - done).min(MAX_KERNEL_BUF_SIZE);
                    let n = file
                        .host
                        .read(&mut kernel_buf[..chunk], Some(offset + done as u64))
                        .map_err(|_| MapError::PopulateFailed)?;
                    if n == 0 {
                        // Past EOF reads as zeros, which the fresh pages
                        // already are.
                        break;
                    }
                    self.write_user_bytes((base + done) as Addr, &kernel_buf[..n])
                        .map_err(|_| MapError::PopulateFailed)?;
                    done += n;
                }
                Ok(())
            };
            mm.map(
                addr as usize,
                length as usize,
                permissions,
                request,
                backing,
                Some(init),
            )
        };

        match chosen {
            Ok(start) => Ok(start as u32),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn sys_munmap(&self, addr: Addr, length: u32) -> Result<(), Errno> {
        let mm = self.mm()?;
        mm.unmap(addr as usize, length as usize).map_err(Errno::from)
    }

    pub(crate) fn sys_mprotect(&self, addr: Addr, length: u32, prot: ProtFlags) -> Result<(), Errno> {
        let mm = self.mm()?;
        mm.protect(addr as usize, length as usize, permissions_from_prot(prot))
            .map_err(Errno::from)
    }

    pub(crate) fn sys_madvise(
        &self,
        addr: Addr,
        length: u32,
        advice: MadviseAdvice,
    ) -> Result<(), Errno> {
        let mm = self.mm()?;
        // All recognized advice is currently a validated no-op; the logical
        // state of the mappings never changes.
        let _ = advice;
        mm.advise(addr as usize, length as usize).map_err(Errno::from)
    }
}
