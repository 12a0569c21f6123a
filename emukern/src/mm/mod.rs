//! Memory management: the guest virtual address space.

mod vmem;

#[cfg(test)]
mod tests;

use core::ops::Range;

use alloc::vec::Vec;

pub use vmem::{
    AdviseError, AreaBacking, BrkError, FileBackingId, MapError, PAGE_SIZE, PageRange,
    ProtectError, UnmapError, VmArea, VmFlags,
};
use vmem::{InsertBehavior, Vmem};

use crate::{
    platform::page_mgmt::{MemoryRegionPermissions, PageManagementProvider},
    sync::{RawSyncPrimitivesProvider, RwLock},
    utils::align_up,
};

bitflags::bitflags! {
    /// Options for [`AddressSpace::map`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapRequestFlags: u8 {
        /// Use the requested range exactly, unmapping any overlap first.
        const FIXED = 1 << 0;
        /// The mapping is shared rather than private.
        const SHARED = 1 << 1;
        /// The mapping is a downward-growing stack.
        const GROWS_DOWN = 1 << 2;
    }
}

/// One guest virtual address space.
///
/// Holds the region table behind a reader-writer lock so that concurrent
/// lookups coexist with exclusive mutation; a thread group sharing an
/// address space (`CLONE_VM`) shares one of these through an `Arc`, and
/// every mutating operation is serialized by the internal lock regardless
/// of how the space is reached.
pub struct AddressSpace<Platform, const ALIGN: usize>
where
    Platform: RawSyncPrimitivesProvider + PageManagementProvider<ALIGN>,
{
    vmem: RwLock<Platform, Vmem<Platform::Backing, ALIGN>>,
}

impl<Platform, const ALIGN: usize> AddressSpace<Platform, ALIGN>
where
    Platform: RawSyncPrimitivesProvider + PageManagementProvider<ALIGN>,
{
    /// Creates an empty address space with a fresh host backing.
    pub fn new(platform: &Platform) -> Result<Self, MapError> {
        let backing = platform.new_backing()?;
        Ok(Self {
            vmem: RwLock::new(Vmem::new(
                backing,
                Platform::TASK_ADDR_MIN,
                Platform::TASK_ADDR_MAX,
            )),
        })
    }

    /// Creates a new mapping.
    ///
    /// With [`MapRequestFlags::FIXED`], `hint` is the exact (page-aligned,
    /// nonzero) placement and overlapping regions are unmapped first.
    /// Otherwise the lowest free gap at or above `hint` is chosen (anywhere
    /// in the task range when `hint` is zero). Returns the chosen start
    /// address.
    ///
    /// `init` runs once the pages exist and before they become visible at
    /// their final permissions; file-backed mappings use it to populate
    /// contents.
    pub fn map(
        &self,
        hint: usize,
        length: usize,
        permissions: MemoryRegionPermissions,
        flags: MapRequestFlags,
        backing: AreaBacking,
        init: Option<impl FnOnce(usize) -> Result<(), MapError>>,
    ) -> Result<usize, MapError> {
        if hint % ALIGN != 0 {
            return Err(MapError::Unaligned);
        }
        let length = checked_page_len::<ALIGN>(length)?;

        let mut vm_flags = VmFlags::from(permissions) | VmFlags::VM_MAY_ACCESS_FLAGS;
        if flags.contains(MapRequestFlags::SHARED) {
            vm_flags |= VmFlags::VM_SHARED;
        }
        if flags.contains(MapRequestFlags::GROWS_DOWN) {
            vm_flags |= VmFlags::VM_GROWSDOWN;
        }
        let vma = VmArea::new(vm_flags, backing);

        let mut vmem = self.vmem.write();
        if flags.contains(MapRequestFlags::FIXED) {
            if hint == 0 {
                return Err(MapError::InvalidRange);
            }
            let range = PageRange::new(hint, hint.checked_add(length).ok_or(MapError::InvalidLength)?)
                .ok_or(MapError::Unaligned)?;
            vmem.insert_mapping(range, vma, InsertBehavior::Replace, init)
        } else {
            let start = vmem
                .find_free_range(hint, length)
                .ok_or(MapError::OutOfMemory)?;
            let range = PageRange::new(start, start + length).ok_or(MapError::Unaligned)?;
            vmem.insert_mapping(range, vma, InsertBehavior::NoReplace, init)
        }
    }

    /// [`map`](Self::map) of anonymous zero-filled memory.
    pub fn map_anonymous(
        &self,
        hint: usize,
        length: usize,
        permissions: MemoryRegionPermissions,
        flags: MapRequestFlags,
    ) -> Result<usize, MapError> {
        self.map(
            hint,
            length,
            permissions,
            flags,
            AreaBacking::Anonymous,
            None::<fn(usize) -> Result<(), MapError>>,
        )
    }

    /// Removes any mapping overlapping `[addr, addr + length)`, splitting
    /// partially covered regions. Unmapping a hole is not an error.
    pub fn unmap(&self, addr: usize, length: usize) -> Result<(), UnmapError> {
        if addr % ALIGN != 0 {
            return Err(UnmapError::Unaligned);
        }
        if length == 0 {
            return Err(UnmapError::InvalidLength);
        }
        let length = align_up(length, ALIGN);
        let end = addr.checked_add(length).ok_or(UnmapError::InvalidLength)?;
        let mut vmem = self.vmem.write();
        vmem.remove_covered(addr..end);
        Ok(())
    }

    /// Updates protection on `[addr, addr + length)`, which must be fully
    /// mapped; regions are split at the boundaries.
    pub fn protect(
        &self,
        addr: usize,
        length: usize,
        permissions: MemoryRegionPermissions,
    ) -> Result<(), ProtectError> {
        if addr % ALIGN != 0 {
            return Err(ProtectError::Unaligned);
        }
        if length == 0 {
            return Ok(());
        }
        let length = align_up(length, ALIGN);
        let end = addr
            .checked_add(length)
            .ok_or(ProtectError::InvalidLength)?;
        let range = PageRange::new(addr, end).ok_or(ProtectError::Unaligned)?;
        let mut vmem = self.vmem.write();
        vmem.protect_mapping(range, permissions)
    }

    /// Memory advice. Validates the range and otherwise leaves the logical
    /// state untouched; advice never fails the caller's mappings.
    pub fn advise(&self, addr: usize, length: usize) -> Result<(), AdviseError> {
        if addr % ALIGN != 0 {
            return Err(AdviseError::Unaligned);
        }
        if length == 0 {
            return Ok(());
        }
        let length = align_up(length, ALIGN);
        addr.checked_add(length).ok_or(AdviseError::InvalidLength)?;
        Ok(())
    }

    /// Establishes the heap base (and initial break). Called by the loader
    /// once the program image is in place.
    pub fn init_break(&self, base: usize) {
        let mut vmem = self.vmem.write();
        vmem.heap_base = base;
        vmem.brk = base;
    }

    /// The current program break.
    pub fn current_break(&self) -> usize {
        self.vmem.read().brk
    }

    /// Moves the program break to `new_brk`, growing or shrinking the heap
    /// run at page granularity. On success returns the new break; the
    /// caller reports [`current_break`](Self::current_break) to the guest on
    /// failure (brk's "always returns the current break" contract).
    pub fn set_break(&self, new_brk: usize) -> Result<usize, BrkError> {
        let mut vmem = self.vmem.write();
        if vmem.heap_base == 0 {
            return Err(BrkError::Unset);
        }
        if new_brk < vmem.heap_base {
            return Err(BrkError::InvalidBreak);
        }
        let old_end = align_up(vmem.brk, ALIGN);
        let new_end = align_up(new_brk, ALIGN);
        if new_end > vmem.addr_max() {
            return Err(BrkError::OutOfMemory);
        }

        match new_end.cmp(&old_end) {
            core::cmp::Ordering::Equal => {}
            core::cmp::Ordering::Greater => {
                if vmem.overlaps(&(old_end..new_end)) {
                    return Err(BrkError::OutOfMemory);
                }
                let range = PageRange::new(old_end, new_end).expect("break ends are page-aligned");
                let heap = VmArea::new(
                    VmFlags::VM_READ | VmFlags::VM_WRITE | VmFlags::VM_MAY_ACCESS_FLAGS,
                    AreaBacking::Anonymous,
                );
                vmem.insert_mapping(
                    range,
                    heap,
                    InsertBehavior::NoReplace,
                    None::<fn(usize) -> Result<(), MapError>>,
                )
                .map_err(|_| BrkError::OutOfMemory)?;
            }
            core::cmp::Ordering::Less => {
                vmem.remove_covered(new_end..old_end);
            }
        }
        vmem.brk = new_brk;
        Ok(new_brk)
    }

    /// Copy-on-write duplicate of this address space (fork).
    pub fn fork_duplicate(&self) -> Result<Self, MapError> {
        let vmem = self.vmem.read();
        Ok(Self {
            vmem: RwLock::new(vmem.duplicate()?),
        })
    }

    /// Discards every mapping and resets the break (exec replaces the space
    /// wholesale; teardown unwinds it).
    pub fn clear(&self) {
        self.vmem.write().clear();
    }

    /// Snapshot of all regions, in address order.
    pub fn mappings(&self) -> Vec<(Range<usize>, VmArea)> {
        self.vmem
            .read()
            .iter()
            .map(|(r, vma)| (r.clone(), *vma))
            .collect()
    }

    /// Total mapped length in bytes.
    pub fn mapped_len(&self) -> usize {
        self.vmem.read().iter().map(|(r, _)| r.end - r.start).sum()
    }

    /// Whether `[addr, addr + length)` is entirely covered by mappings.
    pub fn contains_range(&self, addr: usize, length: usize) -> bool {
        let Some(end) = addr.checked_add(length) else {
            return false;
        };
        if addr == end {
            return true;
        }
        self.vmem.read().fully_mapped(&(addr..end))
    }
}

/// Validates a user-supplied length: nonzero, and page-rounded without
/// overflow.
fn checked_page_len<const ALIGN: usize>(length: usize) -> Result<usize, MapError> {
    if length == 0 {
        return Err(MapError::InvalidLength);
    }
    let rounded = length
        .checked_add(ALIGN - 1)
        .ok_or(MapError::InvalidLength)?
        & !(ALIGN - 1);
    Ok(rounded)
}
