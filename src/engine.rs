//! Poll-driven command engine.
//!
//! [`CommandEngine`] owns the multiplexer, the packet assembler, the
//! sequencer and the operation queue, and advances all of them in a single
//! non-blocking [`CommandEngine::update()`] step.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::time::Duration;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::io::SerialIo;
use crate::mux::Mux;
use crate::packet::PacketAssembler;
use crate::queue::{Operation, OperationQueue};
use crate::sequencer::{Sequencer, TimeoutCheck};
use crate::{Error, Result};

/// Default number of commands in flight.
pub const DEFAULT_WINDOW: usize = 4;

/// Default reply timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(50);

/// Default number of consecutive timeouts before the link is declared dead.
pub const DEFAULT_RETRIES: u32 = 3;

/// Link configuration
///
/// The defaults suit a target at 1-3 Mbaud with a hardware debug module that
/// answers each packet within a few byte times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Maximum commands in flight, 1-16.  Out of range values are clamped.
    pub window: usize,

    /// How long to wait for a reply before reissuing everything outstanding.
    pub timeout: Duration,

    /// Consecutive timeouts tolerated.  The link fails when this many
    /// timeouts occur without any reply in between.
    pub retries: u32,

    /// Minimum byte times between the start of consecutive debug packets.
    /// Gaps are filled with application bytes, or padding.  0 for none.
    pub settle: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            settle: 0,
        }
    }
}

/// Whether the engine has outstanding work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Nothing queued and nothing in flight
    Idle,
    /// Work outstanding: call `update()` again when the port is readable or
    /// after a short delay
    Busy,
}

/// The serial transport core: multiplexer, sequencer and operation queue.
pub struct CommandEngine {
    mux: Mux,
    assembler: PacketAssembler,
    sequencer: Sequencer,
    queue: OperationQueue,
}

impl CommandEngine {
    /// Create an idle engine.
    pub fn new(config: &LinkConfig) -> Self {
        debug!("New command engine: {config:?}");
        Self {
            mux: Mux::new(config.settle),
            assembler: PacketAssembler::new(),
            sequencer: Sequencer::new(config),
            queue: OperationQueue::new(),
        }
    }

    /// Queue an operation.  Nothing is sent until the next `update()`.
    pub fn queue(&mut self, op: Operation) {
        self.queue.push(op);
    }

    /// Queue a sequence of operations, in order.
    pub fn queue_all(&mut self, ops: impl IntoIterator<Item = Operation>) {
        for op in ops {
            self.queue.push(op);
        }
    }

    /// The multiplexer, for access to the application stream.
    pub fn mux(&mut self) -> &mut Mux {
        &mut self.mux
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Nothing queued, in flight or waiting for reissue.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.sequencer.is_idle()
    }

    /// Advance the link by one step.
    ///
    /// Reads whatever bytes `port` has, handles complete replies, checks for
    /// a reply timeout, issues as much queued work as the window allows and
    /// flushes everything pending to `port`.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the port fails.
    /// - [`Error::RetriesExhausted`] if the target stopped answering.  Every
    ///   outstanding operation has been failed with
    ///   [`crate::queue::Completion::Aborted`] by the time this returns, and
    ///   the engine is idle and usable again.
    pub fn update<P: SerialIo>(&mut self, port: &mut P, now: Duration) -> Result<Status> {
        self.mux.receive_from(port)?;
        let progressed = self.receive_packets();

        if self.sequencer.check_timeout(now, progressed) == TimeoutCheck::Exhausted {
            self.abort_all();
            self.mux.flush(port)?;
            return Err(Error::RetriesExhausted);
        }

        self.queue.pump(&mut self.sequencer, &mut self.mux);
        self.mux.flush(port)?;

        Ok(if self.is_idle() {
            Status::Idle
        } else {
            Status::Busy
        })
    }

    /// Fail every outstanding operation: reissue queue, in-flight commands
    /// oldest first, then the operation queue.
    pub fn abort_all(&mut self) {
        self.sequencer.abort_all();
        self.queue.abort_all();
    }

    // Returns true if any reply was accepted.
    fn receive_packets(&mut self) -> bool {
        let mut progressed = false;
        while let Some(symbol) = self.mux.receive_debug() {
            match self.assembler.push(symbol) {
                None => {}
                Some(Ok(packet)) => progressed |= self.sequencer.on_receive(&packet),
                Some(Err(e)) => trace!("Dropped debug frame: {e:?}"),
            }
        }
        progressed
    }
}

impl Default for CommandEngine {
    fn default() -> Self {
        Self::new(&LinkConfig::default())
    }
}
