//! Debug command transport for a target processor reached over a shared serial
//! link.
//!
//! This crate lets a debug host issue bus reads and writes to a target's
//! debug port across a byte-oriented, lossy serial channel, while the same
//! wire continues to carry an unrelated application byte stream (typically
//! the target's console).
//!
//! `no_std`.  Requires `alloc`.
//!
//! ## Architecture
//!
//! The transport is built in layers, leaves first:
//!
//! - [`mux`] - shares the wire between an *application* stream and a *debug*
//!   stream using three reserved control bytes and escaping, and delimits
//!   debug packets.
//! - [`packet`] - the fixed debug packet layout (command/sequence byte, up to
//!   30 payload bytes, CRC-8) and the receive-side packet assembler.
//! - [`sequencer`] - a sliding window of up to 16 sequence-numbered slots.
//!   Replies arrive strictly in order, so a reply for a later sequence number
//!   proves the acks before it were lost, and those commands are reissued
//!   straight away instead of waiting for a timeout.
//! - [`queue`] - an ordered queue of commands and barriers, with a completion
//!   callback per operation.  A barrier holds back everything behind it until
//!   every earlier command has been acknowledged.
//! - [`engine`] - ties the above together into a single poll-driven
//!   [`engine::CommandEngine::update()`] step.
//! - [`access`] - decomposes arbitrary `(address, length)` reads and writes
//!   into legal bulk and volatile bus operations, and reassembles replies.
//!
//! On top of that sit:
//!
//! - [`backend`] - the pluggable backend contract (`read`, `write`,
//!   `update`, `free`) with a serial implementation using the full stack and a
//!   synchronous RAM implementation.
//! - [`protocol`] - the ASCII `Read`/`Write` command protocol spoken by
//!   remote debug clients.
//! - [`client`] - an async client exposing a plain read/write memory
//!   interface, typically used by host tooling.
//!
//! ## Scheduling
//!
//! Everything is single-threaded and cooperative.  Nothing in the core blocks:
//! the application repeatedly calls `update()`, which reads whatever bytes
//! the port has, handles complete replies, handles timeouts, issues as many
//! queued commands as the window allows and flushes the transmit buffers.
//! State that spans multiple calls lives in the slot table and queues, never
//! on a call stack.
//!
//! ## Getting Started
//!
//! 1. Implement [`io::SerialIo`] for your serial port (non-blocking reads)
//!    and [`io::Clock`] for your time source.
//! 2. Create a [`backend::SerialBackend`] with a [`engine::LinkConfig`].
//! 3. Submit reads and writes via [`backend::Backend`], then call
//!    [`backend::Backend::update()`] from your event loop until it reports
//!    [`engine::Status::Idle`].  Completion callbacks deliver an
//!    [`access::AccessReport`] per request.
//!
//! Alternatively, wrap the backend in [`client::AsyncDebugClient`] and
//! `await` reads and writes directly.
//!
//! ## Features
//!
//! Default features:
//! - `async` - Enable the async client and [`client::AsyncMemory`] trait.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod access;
pub mod backend;
pub mod client;
pub mod engine;
pub mod io;
pub mod mux;
pub mod packet;
pub mod protocol;
pub mod queue;
pub mod sequencer;

/// Debug link errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Underlying serial transport failed
    Io,
    /// No reply from the target after the configured number of retries
    RetriesExhausted,
    /// Payload too large for a packet
    PayloadTooLarge,
    /// Access length out of range, or access wraps the address space
    InvalidLength,
    /// Access outside the range reachable by the backend
    OutOfRange,
    /// Access aborted because the link failed
    Communication,
}

/// Type to represent the result of a debug link operation
pub type Result<T> = core::result::Result<T, Error>;
