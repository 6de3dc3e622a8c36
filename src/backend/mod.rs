//! Pluggable access backends.
//!
//! A backend performs memory reads and writes on the target on behalf of
//! debug clients.  The debug server selects one at startup and drives it
//! through the [`Backend`] trait:
//!
//! - [`SerialBackend`] - the full sequenced transport over a shared serial
//!   link.  Requests complete asynchronously, as `update()` is called.
//! - [`RamBackend`] - a synchronous backend over a block of memory.  Stands
//!   in for directly mapped targets (PCIe, memory-mapped I/O), where requests
//!   complete before `read()`/`write()` return.
//!
//! Either way, every accepted request produces exactly one
//! [`AccessReport`](crate::access::AccessReport), delivered to the callback
//! supplied with it.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod ram;
pub mod serial;

pub use crate::access::ClientId;
pub use crate::engine::Status;
pub use ram::RamBackend;
pub use serial::SerialBackend;

use crate::Result;
use crate::access::ReportFn;

/// Backend trait.
pub trait Backend {
    /// Read `len` bytes at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidLength`] if `len` is 0, more than
    /// [`crate::access::MAX_ACCESS`] or the range wraps the address space.
    /// `on_done` is not called in that case.
    fn read(
        &mut self,
        address: u32,
        len: usize,
        client: ClientId,
        on_done: ReportFn,
    ) -> Result<()>;

    /// Write `data` at `address`.
    ///
    /// # Errors
    ///
    /// As for [`Backend::read()`].
    fn write(
        &mut self,
        address: u32,
        data: &[u8],
        client: ClientId,
        on_done: ReportFn,
    ) -> Result<()>;

    /// Make progress on outstanding requests.
    ///
    /// # Errors
    ///
    /// Fatal backend failures.  Outstanding requests have been reported as
    /// failed when this returns an error.
    fn update(&mut self) -> Result<Status>;

    /// Abandon all outstanding requests, reporting each as failed.
    fn free(&mut self);
}
