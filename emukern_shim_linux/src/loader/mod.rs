// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Program launch: the loader capability, address-space construction from a
//! program image, and the i386 initial-stack layout.
//!
//! Parsing executables is the embedder's concern (the instruction emulator
//! already understands the binaries it runs); this module consumes the
//! resulting [`ProgramImage`] and builds the guest-visible layout the way
//! `execve` requires: segments mapped at their addresses, the break set
//! just past the image, and a stack prepared with argv/envp.

use alloc::string::String;
use alloc::vec::Vec;

use emukern::mm::{MapRequestFlags, PAGE_SIZE};
use emukern::platform::page_mgmt::{MemoryRegionPermissions, PageManagementProvider};
use emukern::platform::{FileProvider, HostFileType, HostOpenFlags};
use emukern::utils::{align_down, align_up};
use thiserror::Error;

use emukern_common_linux::{Addr, errno::Errno};

use crate::{KernelPlatform, Space, StartContext, Task};

/// Default stack reservation for a fresh image.
pub const DEFAULT_STACK_SIZE: usize = 8 << 20; // 8 MiB

/// One loadable piece of a program image.
pub struct Segment {
    /// Guest virtual placement (need not be page-aligned).
    pub vaddr: Addr,
    /// Total in-memory size; anything past `data` is zero-filled.
    pub mem_size: u32,
    /// File-provided contents, placed at `vaddr`.
    pub data: Vec<u8>,
    pub permissions: MemoryRegionPermissions,
}

/// A loaded program, ready to be laid out in an address space.
pub struct ProgramImage {
    pub entry_point: Addr,
    /// Where the heap begins (typically the end of the data segment).
    pub initial_break: Addr,
    pub segments: Vec<Segment>,
}

/// Builds a [`ProgramImage`] from an opened executable.
pub trait ProgramLoader<P: KernelPlatform>: Send + Sync {
    fn load(&self, file: &P::File) -> Result<ProgramImage, LoadError>;
}

/// Errors from the loader capability.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("not an executable this loader understands")]
    BadFormat,
    #[error("host i/o failure: {0}")]
    Io(#[from] emukern::platform::HostIoError),
}

impl From<LoadError> for Errno {
    fn from(value: LoadError) -> Self {
        match value {
            LoadError::BadFormat => Errno::ENOEXEC,
            LoadError::Io(err) => err.into(),
        }
    }
}

impl<P: KernelPlatform> Task<P> {
    /// Loads `path` and replaces the calling process's address space with
    /// the fresh layout. Shared by launch and `execve`; the file descriptor
    /// table is deliberately untouched here.
    pub(crate) fn load_program(
        &self,
        path: &str,
        argv: &[String],
        envp: &[String],
    ) -> Result<StartContext, Errno> {
        let resolved = self.resolve_path(path);
        let status = self.platform().status(&resolved, true)?;
        if status.file_type == HostFileType::Directory {
            return Err(Errno::EISDIR);
        }
        if status.file_type != HostFileType::Regular || status.mode & 0o111 == 0 {
            return Err(Errno::EACCES);
        }
        let file = self.platform().open(&resolved, HostOpenFlags::READ, 0)?;
        let image = self.global.loader.load(&file)?;

        // All prior mappings are discarded wholesale. The swap happens
        // before any population so the guest-memory capability (which
        // follows the current task's space) targets the new image.
        let space = alloc::sync::Arc::new(Space::new(self.platform()).map_err(|_| Errno::ENOMEM)?);
        *self.process.mm.lock() = Some(space.clone());

        let mut image_end: usize = 0;
        for segment in &image.segments {
            if segment.mem_size == 0 {
                continue;
            }
            let start = align_down(segment.vaddr as usize, PAGE_SIZE);
            let end = align_up(segment.vaddr as usize + segment.mem_size as usize, PAGE_SIZE);
            image_end = image_end.max(end);
            // Map writable for population, then drop to the segment's
            // declared permissions.
            space
                .map_anonymous(
                    start,
                    end - start,
                    MemoryRegionPermissions::READ | MemoryRegionPermissions::WRITE,
                    MapRequestFlags::FIXED,
                )
                .map_err(|_| Errno::ENOMEM)?;
            if !segment.data.is_empty() {
                self.write_user_bytes(segment.vaddr, &segment.data)?;
            }
            let final_perms = segment.permissions;
            if final_perms != (MemoryRegionPermissions::READ | MemoryRegionPermissions::WRITE) {
                space
                    .protect(start, end - start, final_perms)
                    .map_err(|_| Errno::ENOMEM)?;
            }
        }

        let brk_base = (image.initial_break as usize).max(image_end);
        space.init_break(align_up(brk_base, PAGE_SIZE));

        let stack_pointer = self.map_initial_stack(&space, argv, envp)?;
        self.process.set_comm_from_path(&resolved);

        Ok(StartContext::Fresh {
            entry_point: image.entry_point,
            stack_pointer,
        })
    }

    /// Reserves the stack at the top of the task range and writes the
    /// classic i386 process start block: strings, then `argc`, the argv
    /// vector, and the envp vector, with the stack pointer left on `argc`.
    fn map_initial_stack(
        &self,
        space: &Space<P>,
        argv: &[String],
        envp: &[String],
    ) -> Result<Addr, Errno> {
        let stack_top = <P as PageManagementProvider<{ PAGE_SIZE }>>::TASK_ADDR_MAX;
        let stack_base = stack_top - DEFAULT_STACK_SIZE;
        space
            .map_anonymous(
                stack_base,
                DEFAULT_STACK_SIZE,
                MemoryRegionPermissions::READ | MemoryRegionPermissions::WRITE,
                MapRequestFlags::FIXED | MapRequestFlags::GROWS_DOWN,
            )
            .map_err(|_| Errno::ENOMEM)?;

        let mut sp = stack_top as Addr;
        let mut push_string = |task: &Task<P>, sp: &mut Addr, s: &str| -> Result<Addr, Errno> {
            let bytes = s.as_bytes();
            *sp -= bytes.len() as Addr + 1;
            task.write_user_bytes(*sp, bytes)?;
            task.write_user::<u8>(*sp + bytes.len() as Addr, 0)?;
            Ok(*sp)
        };

        let mut envp_ptrs = Vec::with_capacity(envp.len());
        for s in envp.iter().rev() {
            envp_ptrs.push(push_string(self, &mut sp, s)?);
        }
        envp_ptrs.reverse();
        let mut argv_ptrs = Vec::with_capacity(argv.len());
        for s in argv.iter().rev() {
            argv_ptrs.push(push_string(self, &mut sp, s)?);
        }
        argv_ptrs.reverse();

        // argc + argv entries + NULL + envp entries + NULL.
        let vector_words = 1 + argv_ptrs.len() + 1 + envp_ptrs.len() + 1;
        sp &= !0xf;
        sp -= (vector_words * core::mem::size_of::<Addr>()) as Addr;
        sp &= !0xf;

        let mut cursor = sp;
        let mut push_word = |task: &Task<P>, cursor: &mut Addr, word: Addr| -> Result<(), Errno> {
            task.write_user::<Addr>(*cursor, word)?;
            *cursor += core::mem::size_of::<Addr>() as Addr;
            Ok(())
        };
        push_word(self, &mut cursor, argv_ptrs.len() as Addr)?;
        for ptr in &argv_ptrs {
            push_word(self, &mut cursor, *ptr)?;
        }
        push_word(self, &mut cursor, 0)?;
        for ptr in &envp_ptrs {
            push_word(self, &mut cursor, *ptr)?;
        }
        push_word(self, &mut cursor, 0)?;

        Ok(sp)
    }
}
