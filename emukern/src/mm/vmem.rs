//! Region bookkeeping for one guest virtual address space.
//!
//! `Vmem` owns the ordered, non-overlapping set of page-aligned regions
//! backed by a [`PageBacking`], held in a [`RangeMap`] so that inserts and
//! removals split and coalesce neighbors for free. All host memory effects
//! are delegated to the backing; everything here is metadata.

use core::ops::Range;

use alloc::vec::Vec;
use rangemap::RangeMap;
use thiserror::Error;

use crate::platform::page_mgmt::{
    AllocationError, MemoryRegionPermissions, PageBacking, PermissionUpdateError,
};

/// Page size in bytes for the guest ABI this core models.
pub const PAGE_SIZE: usize = 4096;

bitflags::bitflags! {
    /// Flags describing the properties of a memory region.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        /// Readable.
        const VM_READ = 1 << 0;
        /// Writable.
        const VM_WRITE = 1 << 1;
        /// Executable.
        const VM_EXEC = 1 << 2;
        /// Shared (writes reach the backing object).
        const VM_SHARED = 1 << 3;

        /// `protect` may turn on VM_READ.
        const VM_MAYREAD = 1 << 4;
        /// `protect` may turn on VM_WRITE.
        const VM_MAYWRITE = 1 << 5;
        /// `protect` may turn on VM_EXEC.
        const VM_MAYEXEC = 1 << 6;

        /// The region is a stack that notionally grows downward.
        const VM_GROWSDOWN = 1 << 8;

        const VM_ACCESS_FLAGS = Self::VM_READ.bits()
            | Self::VM_WRITE.bits()
            | Self::VM_EXEC.bits();
        const VM_MAY_ACCESS_FLAGS = Self::VM_MAYREAD.bits()
            | Self::VM_MAYWRITE.bits()
            | Self::VM_MAYEXEC.bits();
    }
}

impl From<MemoryRegionPermissions> for VmFlags {
    fn from(value: MemoryRegionPermissions) -> Self {
        let mut flags = VmFlags::empty();
        flags.set(
            VmFlags::VM_READ,
            value.contains(MemoryRegionPermissions::READ),
        );
        flags.set(
            VmFlags::VM_WRITE,
            value.contains(MemoryRegionPermissions::WRITE),
        );
        flags.set(
            VmFlags::VM_EXEC,
            value.contains(MemoryRegionPermissions::EXEC),
        );
        flags.set(
            VmFlags::VM_SHARED,
            value.contains(MemoryRegionPermissions::SHARED),
        );
        flags
    }
}

impl From<VmFlags> for MemoryRegionPermissions {
    fn from(value: VmFlags) -> Self {
        let mut perms = MemoryRegionPermissions::empty();
        perms.set(
            MemoryRegionPermissions::READ,
            value.contains(VmFlags::VM_READ),
        );
        perms.set(
            MemoryRegionPermissions::WRITE,
            value.contains(VmFlags::VM_WRITE),
        );
        perms.set(
            MemoryRegionPermissions::EXEC,
            value.contains(VmFlags::VM_EXEC),
        );
        perms.set(
            MemoryRegionPermissions::SHARED,
            value.contains(VmFlags::VM_SHARED),
        );
        perms
    }
}

/// A non-empty range of `ALIGN`-aligned addresses.
#[derive(Clone, Copy)]
pub struct PageRange<const ALIGN: usize> {
    pub start: usize,
    pub end: usize,
}

impl<const ALIGN: usize> From<PageRange<ALIGN>> for Range<usize> {
    fn from(range: PageRange<ALIGN>) -> Self {
        range.start..range.end
    }
}

impl<const ALIGN: usize> PageRange<ALIGN> {
    /// Returns `None` if the range is misaligned or empty.
    pub fn new(start: usize, end: usize) -> Option<Self> {
        if start % ALIGN != 0 || end % ALIGN != 0 {
            return None;
        }
        if start >= end {
            return None;
        }
        Some(Self { start, end })
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// A `PageRange` is never empty by construction.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Identifies the file object backing a mapped region. Assigned by the fd
/// layer; opaque here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileBackingId(pub u64);

/// What backs a region's contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AreaBacking {
    Anonymous,
    File { file: FileBackingId, offset: u64 },
}

/// Virtual memory area: uniform flags and backing over a contiguous range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmArea {
    flags: VmFlags,
    backing: AreaBacking,
}

impl VmArea {
    #[inline]
    pub fn new(flags: VmFlags, backing: AreaBacking) -> Self {
        Self { flags, backing }
    }

    #[inline]
    pub fn flags(self) -> VmFlags {
        self.flags
    }

    #[inline]
    pub fn backing(self) -> AreaBacking {
        self.backing
    }

    #[inline]
    pub fn is_file_backed(self) -> bool {
        matches!(self.backing, AreaBacking::File { .. })
    }
}

/// How an explicitly addressed insert treats existing mappings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum InsertBehavior {
    /// Fail with `AddressInUse` if anything overlaps.
    NoReplace,
    /// Unmap any overlapping regions first (`MAP_FIXED`).
    Replace,
}

pub(super) struct Vmem<B: PageBacking<ALIGN>, const ALIGN: usize> {
    backing: B,
    addr_min: usize,
    addr_max: usize,
    /// Base of the heap run; zero until the loader establishes it.
    pub(super) heap_base: usize,
    /// Current program break (not page-rounded).
    pub(super) brk: usize,
    vmas: RangeMap<usize, VmArea>,
}

impl<B: PageBacking<ALIGN>, const ALIGN: usize> Vmem<B, ALIGN> {
    pub(super) fn new(backing: B, addr_min: usize, addr_max: usize) -> Self {
        debug_assert!(addr_min % ALIGN == 0 && addr_max % ALIGN == 0);
        Self {
            backing,
            addr_min,
            addr_max,
            heap_base: 0,
            brk: 0,
            vmas: RangeMap::new(),
        }
    }

    pub(super) fn addr_max(&self) -> usize {
        self.addr_max
    }

    /// All regions, in address order.
    pub(super) fn iter(&self) -> impl Iterator<Item = (&Range<usize>, &VmArea)> {
        self.vmas.iter()
    }

    /// Regions partially or completely covered by `range`.
    pub(super) fn overlapping(
        &self,
        range: Range<usize>,
    ) -> impl DoubleEndedIterator<Item = (&Range<usize>, &VmArea)> {
        self.vmas.overlapping(range)
    }

    pub(super) fn overlaps(&self, range: &Range<usize>) -> bool {
        self.vmas.overlaps(range)
    }

    /// Whether `range` is entirely covered by mapped regions.
    pub(super) fn fully_mapped(&self, range: &Range<usize>) -> bool {
        self.vmas.overlaps(range) && self.vmas.gaps(range).next().is_none()
    }

    /// Insert a region, reserving host memory behind it.
    ///
    /// With [`InsertBehavior::Replace`], any overlapping regions are removed
    /// first (guest `MAP_FIXED` overwrite semantics). `init` runs after the
    /// pages are reserved writable and before the final permissions are
    /// applied, so file contents can be populated even into mappings that
    /// end up read-only.
    pub(super) fn insert_mapping(
        &mut self,
        range: PageRange<ALIGN>,
        vma: VmArea,
        behavior: InsertBehavior,
        init: Option<impl FnOnce(usize) -> Result<(), MapError>>,
    ) -> Result<usize, MapError> {
        let (start, end) = (range.start, range.end);
        if start < self.addr_min || end > self.addr_max {
            return Err(MapError::InvalidRange);
        }
        match behavior {
            InsertBehavior::NoReplace => {
                if self.vmas.overlaps(&(start..end)) {
                    return Err(MapError::AddressInUse);
                }
            }
            InsertBehavior::Replace => self.remove_covered(start..end),
        }

        let final_perms = MemoryRegionPermissions::from(vma.flags);
        let needs_write_window =
            init.is_some() && !final_perms.contains(MemoryRegionPermissions::WRITE);
        let reserve_perms = if needs_write_window {
            final_perms | MemoryRegionPermissions::WRITE
        } else {
            final_perms
        };
        self.backing.reserve(start..end, reserve_perms)?;

        if let Some(init) = init
            && let Err(err) = init(start)
        {
            // Unwind the reservation; the mapping never becomes visible.
            // SAFETY: the range was just reserved and is not yet published.
            let _ = unsafe { self.backing.release(start..end) };
            return Err(err);
        }

        if needs_write_window {
            // SAFETY: nothing references the freshly created range yet.
            unsafe { self.backing.update_permissions(start..end, final_perms) }
                .map_err(|_| MapError::OutOfMemory)?;
        }

        self.vmas.insert(start..end, vma);
        Ok(start)
    }

    /// Release every mapped page inside `range` and drop the metadata.
    /// Partially covered regions are contracted; unmapped holes are skipped
    /// (idempotent).
    pub(super) fn remove_covered(&mut self, range: Range<usize>) {
        let covered: Vec<Range<usize>> = self
            .vmas
            .overlapping(range.clone())
            .map(|(r, _)| r.start.max(range.start)..r.end.min(range.end))
            .collect();
        for piece in covered {
            // SAFETY: the caller of unmap/replace guarantees the guest no
            // longer relies on these pages.
            let _ = unsafe { self.backing.release(piece) };
        }
        self.vmas.remove(range);
    }

    /// Change the access permissions of `range`, which must be entirely
    /// mapped. Regions are split at the boundaries as needed.
    pub(super) fn protect_mapping(
        &mut self,
        range: PageRange<ALIGN>,
        permissions: MemoryRegionPermissions,
    ) -> Result<(), ProtectError> {
        let range: Range<usize> = range.into();
        if !self.fully_mapped(&range) {
            return Err(ProtectError::NotMapped(range));
        }

        let flags = VmFlags::from(permissions) & VmFlags::VM_ACCESS_FLAGS;
        let mut to_change = Vec::new();
        for (r, vma) in self.vmas.overlapping(range.clone()) {
            to_change.push((r.start, r.end, *vma));
        }

        for (start, end, vma) in to_change {
            if vma.flags & VmFlags::VM_ACCESS_FLAGS == flags {
                continue;
            }
            // Turning on VM_x requires the corresponding VM_MAYx ceiling
            // (shifting MAY bits down aligns them with the access bits).
            if (!(vma.flags.bits() >> 4) & flags.bits()) & VmFlags::VM_ACCESS_FLAGS.bits() != 0 {
                return Err(ProtectError::NoAccess {
                    old: vma.flags,
                    new: flags,
                });
            }

            let intersection = range.start.max(start)..range.end.min(end);
            // SAFETY: the caller of protect guarantees no access relying on
            // the old permissions is in flight.
            unsafe {
                self.backing
                    .update_permissions(intersection.clone(), permissions)
            }
            .map_err(ProtectError::Backing)?;

            let new_flags = (vma.flags & !VmFlags::VM_ACCESS_FLAGS) | flags;
            self.vmas.remove(start..end);
            self.vmas
                .insert(intersection.clone(), VmArea::new(new_flags, vma.backing));
            let before = start..intersection.start;
            let after = intersection.end..end;
            if !before.is_empty() {
                self.vmas.insert(before, vma);
            }
            if !after.is_empty() {
                self.vmas.insert(after, vma);
            }
        }

        Ok(())
    }

    /// Lowest free gap of at least `len` bytes at or above `hint`, falling
    /// back to the bottom of the task range when nothing fits above the
    /// hint.
    pub(super) fn find_free_range(&self, hint: usize, len: usize) -> Option<usize> {
        debug_assert!(hint % ALIGN == 0 && len % ALIGN == 0 && len > 0);
        if len > self.addr_max - self.addr_min {
            return None;
        }
        let search = |from: usize| -> Option<usize> {
            let outer = from..self.addr_max;
            if outer.is_empty() {
                return None;
            }
            // `gaps` yields maximal unmapped subranges in ascending order.
            for gap in self.vmas.gaps(&outer) {
                if gap.end - gap.start >= len {
                    return Some(gap.start);
                }
            }
            None
        };
        let from = hint.max(self.addr_min);
        match search(from) {
            Some(addr) => Some(addr),
            None if from > self.addr_min => search(self.addr_min),
            None => None,
        }
    }

    /// Copy-on-write duplicate of this address space (fork).
    pub(super) fn duplicate(&self) -> Result<Self, AllocationError> {
        Ok(Self {
            backing: self.backing.duplicate()?,
            addr_min: self.addr_min,
            addr_max: self.addr_max,
            heap_base: self.heap_base,
            brk: self.brk,
            vmas: self.vmas.clone(),
        })
    }

    /// Drop every region and reset the break (exec, teardown).
    pub(super) fn clear(&mut self) {
        let all: Vec<Range<usize>> = self.vmas.iter().map(|(r, _)| r.clone()).collect();
        for range in all {
            // SAFETY: clear is only reached once the guest image is being
            // discarded wholesale.
            let _ = unsafe { self.backing.release(range) };
        }
        self.vmas = RangeMap::new();
        self.heap_base = 0;
        self.brk = 0;
    }
}

/// Errors from creating mappings.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    #[error("argument is not page-aligned")]
    Unaligned,
    #[error("length is zero or overflows the address range")]
    InvalidLength,
    #[error("range lies outside the addressable task range")]
    InvalidRange,
    #[error("address already in use")]
    AddressInUse,
    #[error("no free gap of sufficient length")]
    OutOfMemory,
    #[error("failed to populate mapping contents")]
    PopulateFailed,
}

impl From<AllocationError> for MapError {
    fn from(value: AllocationError) -> Self {
        match value {
            AllocationError::Unaligned => MapError::Unaligned,
            AllocationError::InvalidRange => MapError::InvalidRange,
            AllocationError::AddressInUse => MapError::AddressInUse,
            AllocationError::OutOfMemory => MapError::OutOfMemory,
        }
    }
}

/// Errors from removing mappings.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    #[error("argument is not page-aligned")]
    Unaligned,
    #[error("length is zero or overflows the address range")]
    InvalidLength,
}

/// Errors from protecting mappings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtectError {
    #[error("argument is not page-aligned")]
    Unaligned,
    #[error("length is zero or overflows the address range")]
    InvalidLength,
    #[error("range {0:?} is not fully mapped")]
    NotMapped(Range<usize>),
    #[error("permissions {new:?} exceed the ceiling of {old:?}")]
    NoAccess { old: VmFlags, new: VmFlags },
    #[error("backing refused the permission change: {0}")]
    Backing(#[from] PermissionUpdateError),
}

/// Errors from adjusting the program break.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrkError {
    #[error("program break has not been initialized")]
    Unset,
    #[error("requested break below the heap base")]
    InvalidBreak,
    #[error("break growth collides with an existing mapping or exhausts the address range")]
    OutOfMemory,
}

/// Errors from memory advice.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdviseError {
    #[error("argument is not page-aligned")]
    Unaligned,
    #[error("length overflows the address range")]
    InvalidLength,
}
