//! Operation queue and barrier engine.
//!
//! Callers queue [`Operation`]s: commands to send to the target, and barriers.
//! Every operation may carry a completion callback.  The queue is pumped
//! once per update cycle:
//!
//! 1. Commands waiting for reissue are sent first, as far as the sequencer's
//!    window allows.  If any remain, nothing new is issued.
//! 2. Then queued operations are taken in order.  A command is issued if the
//!    window has room.  A barrier at the head of the queue blocks everything
//!    behind it until the sequencer is idle; it is then released, its
//!    callback fires and processing continues in the same pump.
//!
//! The result is a simple contract: nothing queued after a barrier starts
//! until everything before it has been acknowledged.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::boxed::Box;
use alloc::collections::VecDeque;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::packet::{Packet, PacketSink};
use crate::sequencer::{Refused, Sequencer};

/// How an operation completed.
#[derive(Debug, Clone, Copy)]
pub enum Completion<'a> {
    /// Command acknowledged by the target
    Acked {
        /// Packet as last transmitted
        tx: &'a Packet,
        /// Reply from the target
        rx: &'a Packet,
    },
    /// Barrier released: every earlier command was acknowledged
    Released,
    /// Operation abandoned because the link failed
    Aborted {
        /// Packet that would have been sent, for commands
        tx: Option<&'a Packet>,
    },
}

impl Completion<'_> {
    pub fn is_success(&self) -> bool {
        !matches!(self, Completion::Aborted { .. })
    }
}

/// Completion callback.  Called exactly once per operation.
pub type Callback = Box<dyn FnOnce(Completion<'_>)>;

/// A command to be sent to the target.
pub struct Command {
    pub packet: Packet,
    pub on_complete: Option<Callback>,
}

impl Command {
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            on_complete: None,
        }
    }

    pub fn with_callback(packet: Packet, f: impl FnOnce(Completion<'_>) + 'static) -> Self {
        Self {
            packet,
            on_complete: Some(Box::new(f)),
        }
    }

    pub(crate) fn acked(self, rx: &Packet) {
        let Command {
            packet,
            on_complete,
        } = self;
        if let Some(f) = on_complete {
            f(Completion::Acked { tx: &packet, rx });
        }
    }

    pub(crate) fn abort(self) {
        let Command {
            packet,
            on_complete,
        } = self;
        if let Some(f) = on_complete {
            f(Completion::Aborted { tx: Some(&packet) });
        }
    }
}

impl core::fmt::Debug for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Command")
            .field("packet", &self.packet)
            .field("callback", &self.on_complete.is_some())
            .finish()
    }
}

/// Queued operation.
pub enum Operation {
    Command(Command),
    Barrier(Option<Callback>),
}

impl Operation {
    /// Command without a callback.
    pub fn command(packet: Packet) -> Self {
        Operation::Command(Command::new(packet))
    }

    /// Command with a completion callback.
    pub fn command_with(packet: Packet, f: impl FnOnce(Completion<'_>) + 'static) -> Self {
        Operation::Command(Command::with_callback(packet, f))
    }

    /// Barrier without a callback.
    pub fn barrier() -> Self {
        Operation::Barrier(None)
    }

    /// Barrier with a callback, fired when the barrier is released.
    pub fn barrier_with(f: impl FnOnce(Completion<'_>) + 'static) -> Self {
        Operation::Barrier(Some(Box::new(f)))
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self, Operation::Barrier(_))
    }

    pub(crate) fn abort(self) {
        match self {
            Operation::Command(command) => command.abort(),
            Operation::Barrier(Some(f)) => f(Completion::Aborted { tx: None }),
            Operation::Barrier(None) => {}
        }
    }
}

impl core::fmt::Debug for Operation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Operation::Command(command) => command.fmt(f),
            Operation::Barrier(cb) => f
                .debug_struct("Barrier")
                .field("callback", &cb.is_some())
                .finish(),
        }
    }
}

/// FIFO of operations not yet issued.
#[derive(Debug, Default)]
pub struct OperationQueue {
    ops: VecDeque<Operation>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation.
    pub fn push(&mut self, op: Operation) {
        self.ops.push_back(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Issue as much work as the sequencer accepts.
    ///
    /// Returns the number of commands transmitted.
    pub fn pump<S: PacketSink>(&mut self, sequencer: &mut Sequencer, sink: &mut S) -> usize {
        let mut issued = sequencer.reissue(sink);
        if sequencer.reissue_pending() > 0 {
            return issued;
        }

        while let Some(op) = self.ops.pop_front() {
            match op {
                Operation::Command(command) => match sequencer.issue(command, sink) {
                    Ok(_) => issued += 1,
                    Err(Refused(command)) => {
                        self.ops.push_front(Operation::Command(command));
                        break;
                    }
                },
                Operation::Barrier(cb) => {
                    if !sequencer.is_idle() {
                        self.ops.push_front(Operation::Barrier(cb));
                        break;
                    }
                    trace!("Barrier released");
                    if let Some(f) = cb {
                        f(Completion::Released);
                    }
                }
            }
        }

        issued
    }

    /// Remove every queued operation, failing each callback.
    pub fn abort_all(&mut self) {
        while let Some(op) = self.ops.pop_front() {
            op.abort();
        }
    }
}
