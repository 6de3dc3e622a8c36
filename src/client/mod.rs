//! Client-side memory interface.
//!
//! Host tooling (expression evaluators, loaders, register dumpers) wants a
//! plain "read these bytes, write those bytes" interface rather than
//! callbacks and update loops.  [`AsyncDebugClient`] provides that on top of
//! any [`crate::backend::Backend`], via the [`AsyncMemory`] trait.
//!
//! See [`AsyncDebugClient`] for async client usage, for example on a Host.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(feature = "async")]
pub mod futures;

#[cfg(feature = "async")]
pub use futures::{AsyncDebugClient, AsyncDelay, AsyncMemory};

/// Bus outcome of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    /// Every byte transferred
    Ok,
    /// The target reported a bus fault for the chunk starting at `address`.
    /// Chunks after it were not attempted.
    Fault {
        /// First address of the faulting chunk
        address: u32,
        /// Fault code reported by the target
        code: u32,
    },
}

impl BusStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, BusStatus::Ok)
    }
}
