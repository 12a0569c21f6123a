//! # EmuKern
//!
//! The process & address-space emulation core underneath a guest Linux
//! personality.
//!
//! This crate is the host-agnostic half of a usermode kernel: it owns the
//! virtual address-space manager, the descriptor slot table, synchronization
//! primitives, and the interruptible-wait infrastructure, all expressed
//! against a set of [`platform`] capability traits. The Linux-flavored
//! semantics (process table, syscall handlers, ABI marshaling) live in the
//! `emukern_shim_linux` crate on top of this one.
//!
//! To use EmuKern, provide a type implementing the relevant [`platform`]
//! traits; the instruction emulator and its host glue sit on the other side
//! of those traits.

#![no_std]

extern crate alloc;

pub mod event;
pub mod fd;
pub mod mm;
pub mod platform;
pub mod sync;
pub mod utils;

/// Print a line to the platform's debug log.
///
/// The first argument is anything implementing
/// [`platform::DebugLogProvider`]; the rest are `format!`-style arguments.
#[macro_export]
macro_rules! log_println {
    ($platform:expr, $($arg:tt)*) => {{
        use $crate::platform::DebugLogProvider as _;
        let msg = ::alloc::format!("{}\n", ::core::format_args!($($arg)*));
        $platform.debug_log_print(&msg);
    }};
}
