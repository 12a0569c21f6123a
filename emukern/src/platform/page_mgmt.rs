//! Host memory reservation behind guest address spaces.
//!
//! Every guest address space is backed by one [`PageBacking`] object handed
//! out by the platform's [`PageManagementProvider`]. The core only performs
//! metadata bookkeeping; reserving, releasing, and reprotecting the actual
//! host memory is delegated here.

use core::ops::Range;

use thiserror::Error;

bitflags::bitflags! {
    /// Access permissions of a reserved region.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemoryRegionPermissions: u8 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const EXEC   = 1 << 2;
        const SHARED = 1 << 3;
    }
}

/// Provider of per-address-space host memory backings.
///
/// `ALIGN` is the page size; every range crossing this interface is
/// `ALIGN`-aligned. `TASK_ADDR_MIN..TASK_ADDR_MAX` bounds the
/// guest-addressable range.
pub trait PageManagementProvider<const ALIGN: usize> {
    /// Lowest guest address the core may hand out.
    const TASK_ADDR_MIN: usize;
    /// One past the highest guest address the core may hand out.
    const TASK_ADDR_MAX: usize;

    type Backing: PageBacking<ALIGN>;

    /// Create an empty backing for a fresh address space.
    fn new_backing(&self) -> Result<Self::Backing, AllocationError>;
}

/// The host memory behind one guest address space.
///
/// Dropping a backing releases every reservation it still holds; the core
/// relies on this for address-space teardown.
pub trait PageBacking<const ALIGN: usize>: Send + Sync {
    /// Reserve host memory for the guest range with the given permissions.
    fn reserve(
        &self,
        range: Range<usize>,
        permissions: MemoryRegionPermissions,
    ) -> Result<(), AllocationError>;

    /// Release the host memory behind the guest range.
    ///
    /// # Safety
    ///
    /// The caller must ensure the guest range is no longer accessed.
    unsafe fn release(&self, range: Range<usize>) -> Result<(), DeallocationError>;

    /// Change the permissions of an already-reserved guest range.
    ///
    /// # Safety
    ///
    /// The caller must ensure no access relying on the old permissions is in
    /// flight.
    unsafe fn update_permissions(
        &self,
        range: Range<usize>,
        permissions: MemoryRegionPermissions,
    ) -> Result<(), PermissionUpdateError>;

    /// Produce a copy-on-write duplicate of this backing, covering the same
    /// reservations with the same contents. Backs `fork`.
    fn duplicate(&self) -> Result<Self, AllocationError>
    where
        Self: Sized;
}

/// Errors from reserving host memory.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    #[error("range is not page-aligned")]
    Unaligned,
    #[error("range lies outside the addressable task range")]
    InvalidRange,
    #[error("address already reserved")]
    AddressInUse,
    #[error("host memory exhausted")]
    OutOfMemory,
}

/// Errors from releasing host memory.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeallocationError {
    #[error("range is not page-aligned")]
    Unaligned,
    #[error("range was not reserved")]
    AlreadyUnallocated,
}

/// Errors from updating permissions.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionUpdateError {
    #[error("range is not page-aligned")]
    Unaligned,
    #[error("range was not reserved")]
    NotAllocated,
}
