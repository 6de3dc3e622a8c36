//! I/O traits for the raw serial link and the time source.
//!
//! This module contains the two seams between the transport and the platform
//! it runs on.  Neither is tied to an operating system or async runtime.
//!
//! # Possible implementations
//!
//! - For PC-based applications: a serial port opened in raw, non-blocking
//!   mode, and a clock backed by a monotonic timer
//! - For tests: in-memory byte queues, possibly wired to a simulated target,
//!   and a manually advanced clock
//!
//! # Blocking
//!
//! The transport is poll-driven.  [`SerialIo::read()`] must not block when no
//! data is available; it returns `Ok(0)` instead.  Readiness polling (for
//! example `select()` or `poll()` on the port) belongs to the application's
//! event loop, which calls `update()` when the port is readable or when a
//! previous `update()` asked to be called again soon.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::time::Duration;

/// Raw serial transport trait.
pub trait SerialIo {
    /// The error type returned by the transport.
    ///
    /// This allows implementations to use their own error types
    /// (e.g., `std::io::Error` for a tty).
    type Error: core::fmt::Debug;

    /// Read whatever raw bytes are available into `buf`.
    ///
    /// # Returns
    ///
    /// The number of bytes read.  `Ok(0)` means no data is available right
    /// now; it does not signal end of file.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails, or the port has been
    /// closed.  The transport treats this as fatal.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write all of `data` to the port.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write fails.  The transport treats
    /// this as fatal.
    fn write(&mut self, data: &[u8]) -> Result<(), Self::Error>;
}

/// Monotonic time source used for reply timeouts.
pub trait Clock {
    /// Time elapsed since an arbitrary, fixed epoch.
    fn now(&self) -> Duration;
}
