//! Byte multiplexer sharing one serial wire between an application stream and
//! the debug stream.
//!
//! Three byte values are reserved on the wire:
//!
//! - [`SELECT_APP`] - subsequent bytes belong to the application stream
//! - [`SELECT_DEBUG`] - subsequent bytes belong to the debug stream
//! - [`ESCAPE`] - the next byte is the one's complement of a data byte
//!
//! Any data byte equal to one of these is sent as `ESCAPE, !byte`.
//!
//! Debug packets are delimited by a stream select: when the receiver
//! switches away from the debug stream (or re-selects it) while debug bytes
//! are pending, it inserts an end-of-packet marker.  An interrupted packet is
//! therefore always terminated rather than merged with the next one.
//!
//! On transmit, each debug packet can carry a settle delay: the minimum
//! number of bytes that must go out on the wire before the next debug packet
//! completes, giving the target time to send its reply.  Application bytes
//! fill that gap when available, [`SELECT_APP`] bytes (a no-op when repeated)
//! otherwise.
//!
//! Nothing here blocks.  [`Mux::send()`] only buffers; [`Mux::flush()`]
//! performs the interleaving and writes to the port.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::collections::VecDeque;
use alloc::vec::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::io::SerialIo;
use crate::packet::{MAX_FRAME, Packet, PacketSink};
use crate::{Error, Result};

/// Select the application stream.
pub const SELECT_APP: u8 = 0xFE;

/// Select the debug stream.
pub const SELECT_DEBUG: u8 = 0xFD;

/// The next byte is one's complemented.
pub const ESCAPE: u8 = 0xFC;

/// Capacity of each receive buffer, and size of the raw staging buffer.
pub const BUFFER_SIZE: usize = 256;

/// Logical stream on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    App,
    Debug,
}

/// Symbol received on the debug stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugSymbol {
    /// Data byte
    Byte(u8),
    /// Packet delimiter
    EndOfPacket,
}

#[derive(Debug, Clone, Copy)]
enum DebugTx {
    Byte(u8),
    End { settle: usize },
}

fn is_control(byte: u8) -> bool {
    matches!(byte, SELECT_APP | SELECT_DEBUG | ESCAPE)
}

#[derive(Debug)]
struct RxState {
    stream: Stream,
    escaping: bool,
    // A debug byte arrived since the last delimiter
    packet_open: bool,
    // Application bytes were dropped since the last receive_app()
    app_overflow: bool,
}

#[derive(Debug)]
struct TxState {
    stream: Stream,
    // Bytes still to send before the next packet may go out
    delay: usize,
    packet: [u8; MAX_FRAME],
    packet_len: usize,
    packet_settle: usize,
    packet_ready: bool,
}

/// Multiplexer/framer for one serial connection.
#[derive(Debug)]
pub struct Mux {
    settle: usize,
    app_rx: VecDeque<u8>,
    debug_rx: VecDeque<DebugSymbol>,
    app_tx: VecDeque<u8>,
    debug_tx: VecDeque<DebugTx>,
    raw_rx: [u8; BUFFER_SIZE],
    raw_rx_len: usize,
    raw_rx_pos: usize,
    raw_tx: Vec<u8>,
    rx: RxState,
    tx: TxState,
}

impl Mux {
    /// Create a new multiplexer.
    ///
    /// Arguments:
    /// - `settle` - settle delay applied to packets sent via
    ///   [`PacketSink::transmit()`]
    pub fn new(settle: usize) -> Self {
        Self {
            settle,
            app_rx: VecDeque::with_capacity(BUFFER_SIZE),
            debug_rx: VecDeque::with_capacity(BUFFER_SIZE),
            app_tx: VecDeque::new(),
            debug_tx: VecDeque::new(),
            raw_rx: [0; BUFFER_SIZE],
            raw_rx_len: 0,
            raw_rx_pos: 0,
            raw_tx: Vec::with_capacity(BUFFER_SIZE),
            rx: RxState {
                stream: Stream::App,
                escaping: false,
                packet_open: false,
                app_overflow: false,
            },
            tx: TxState {
                stream: Stream::App,
                delay: 0,
                packet: [0; MAX_FRAME],
                packet_len: 0,
                packet_settle: 0,
                packet_ready: false,
            },
        }
    }

    /// Buffer a data byte for transmission on `stream`.
    pub fn send(&mut self, stream: Stream, byte: u8) {
        match stream {
            Stream::App => self.app_tx.push_back(byte),
            Stream::Debug => self.debug_tx.push_back(DebugTx::Byte(byte)),
        }
    }

    /// Terminate the debug packet being buffered.
    ///
    /// At least `settle` bytes will be sent after this packet before the next
    /// debug packet completes.
    pub fn end_packet(&mut self, settle: usize) {
        self.debug_tx.push_back(DebugTx::End { settle });
    }

    /// Pop a byte received on the application stream.
    ///
    /// The application buffer holds the most recent [`BUFFER_SIZE`] bytes.
    /// Older bytes are dropped if it is not drained.
    pub fn receive_app(&mut self) -> Option<u8> {
        self.rx.app_overflow = false;
        self.app_rx.pop_front()
    }

    /// Pop a symbol received on the debug stream.
    pub fn receive_debug(&mut self) -> Option<DebugSymbol> {
        self.debug_rx.pop_front()
    }

    /// Whether transmit data is waiting for a [`Self::flush()`].
    pub fn tx_pending(&self) -> bool {
        !self.app_tx.is_empty() || !self.debug_tx.is_empty()
    }

    /// Read available bytes from `port` and route them into the receive
    /// buffers.
    ///
    /// A new read is only issued once the previous raw buffer has been fully
    /// routed; routing pauses while the debug buffer is full.  The
    /// application stream never holds up the debug stream.
    ///
    /// Returns the number of raw bytes read from the port by this call.
    pub fn receive_from<P: SerialIo>(&mut self, port: &mut P) -> Result<usize> {
        let mut read = 0;
        if self.raw_rx_pos >= self.raw_rx_len {
            read = port.read(&mut self.raw_rx).map_err(|e| {
                error!("Failed to read from serial port: {e:?}");
                Error::Io
            })?;
            self.raw_rx_len = read;
            self.raw_rx_pos = 0;
        }

        while self.raw_rx_pos < self.raw_rx_len && !self.rx_full() {
            let byte = self.raw_rx[self.raw_rx_pos];
            self.route(byte);
            self.raw_rx_pos += 1;
        }

        Ok(read)
    }

    /// Route raw wire bytes which have already been read.
    ///
    /// Returns the number of bytes consumed, which is less than
    /// `bytes.len()` if the debug buffer filled up.
    pub fn ingest(&mut self, bytes: &[u8]) -> usize {
        for (ii, &byte) in bytes.iter().enumerate() {
            if self.rx_full() {
                return ii;
            }
            self.route(byte);
        }
        bytes.len()
    }

    /// Interleave all buffered transmit data and write it to `port`.
    pub fn flush<P: SerialIo>(&mut self, port: &mut P) -> Result<()> {
        while !self.app_tx.is_empty() || !self.debug_tx.is_empty() {
            self.stage_packet();
            self.send_filler();
            if self.tx.packet_ready {
                self.send_staged_packet();
            }
        }

        if !self.raw_tx.is_empty() {
            port.write(&self.raw_tx).map_err(|e| {
                error!("Failed to write to serial port: {e:?}");
                Error::Io
            })?;
            self.raw_tx.clear();
        }

        Ok(())
    }
}

// Internal functions
impl Mux {
    fn rx_full(&self) -> bool {
        self.debug_rx.len() >= BUFFER_SIZE
    }

    fn push_app(&mut self, byte: u8) {
        if self.app_rx.len() >= BUFFER_SIZE {
            if !self.rx.app_overflow {
                warn!("Application receive buffer full, dropping oldest bytes");
                self.rx.app_overflow = true;
            }
            self.app_rx.pop_front();
        }
        self.app_rx.push_back(byte);
    }

    fn terminate_rx_packet(&mut self) {
        if self.rx.packet_open {
            self.debug_rx.push_back(DebugSymbol::EndOfPacket);
            self.rx.packet_open = false;
        }
    }

    fn route(&mut self, byte: u8) {
        let byte = match byte {
            SELECT_APP => {
                self.terminate_rx_packet();
                self.rx.stream = Stream::App;
                return;
            }
            SELECT_DEBUG => {
                self.terminate_rx_packet();
                self.rx.stream = Stream::Debug;
                return;
            }
            ESCAPE => {
                self.rx.escaping = true;
                return;
            }
            _ if self.rx.escaping => {
                self.rx.escaping = false;
                !byte
            }
            _ => byte,
        };

        match self.rx.stream {
            Stream::App => self.push_app(byte),
            Stream::Debug => {
                self.debug_rx.push_back(DebugSymbol::Byte(byte));
                self.rx.packet_open = true;
            }
        }
    }

    fn tick(&mut self) {
        self.tx.delay = self.tx.delay.saturating_sub(1);
    }

    fn push_data(&mut self, byte: u8) {
        if is_control(byte) {
            self.raw_tx.push(ESCAPE);
            self.raw_tx.push(!byte);
        } else {
            self.raw_tx.push(byte);
        }
    }

    fn select(&mut self, stream: Stream) {
        self.raw_tx.push(match stream {
            Stream::App => SELECT_APP,
            Stream::Debug => SELECT_DEBUG,
        });
        self.tx.stream = stream;
    }

    // Move debug bytes into the packet buffer until a complete packet is
    // staged.
    fn stage_packet(&mut self) {
        while !self.tx.packet_ready {
            let Some(symbol) = self.debug_tx.pop_front() else {
                break;
            };
            match symbol {
                DebugTx::Byte(byte) => {
                    if self.tx.packet_len < MAX_FRAME {
                        self.tx.packet[self.tx.packet_len] = byte;
                    }
                    self.tx.packet_len += 1;
                }
                DebugTx::End { settle } => {
                    if self.tx.packet_len <= MAX_FRAME {
                        self.tx.packet_ready = true;
                        self.tx.packet_settle = settle;
                        // The packet itself plus its select byte count
                        // towards the delay.  This is approximate.
                        self.tx.delay = self.tx.delay.saturating_sub(self.tx.packet_len + 1);
                    } else {
                        warn!(
                            "Dropped {} byte debug packet, the target accepts at most {MAX_FRAME}",
                            self.tx.packet_len
                        );
                        self.tx.packet_len = 0;
                    }
                }
            }
        }
    }

    // Send application bytes, either as padding while a staged packet must
    // wait, or because there is no staged packet.
    fn send_filler(&mut self) {
        while self.tx.delay > 0 || !self.tx.packet_ready {
            let Some(byte) = self.app_tx.pop_front() else {
                break;
            };
            if self.tx.stream != Stream::App {
                self.select(Stream::App);
                self.tick();
            }
            self.push_data(byte);
            self.tick();
        }
    }

    fn send_staged_packet(&mut self) {
        // Nothing else to send, so pad with no-op selects
        while self.tx.delay > 0 {
            self.select(Stream::App);
            self.tick();
        }

        if self.tx.stream != Stream::Debug {
            self.select(Stream::Debug);
        }

        let packet = self.tx.packet;
        for &byte in &packet[..self.tx.packet_len] {
            self.push_data(byte);
        }

        self.tx.delay = self.tx.packet_settle;
        self.tx.packet_ready = false;
        self.tx.packet_len = 0;

        // Something must follow the packet so the target sees it complete.
        // If another packet is coming, re-selecting debug does that.
        if self.debug_tx.is_empty() {
            self.select(Stream::App);
        } else {
            self.select(Stream::Debug);
        }
        self.tick();
    }
}

impl PacketSink for Mux {
    fn transmit(&mut self, packet: &Packet) {
        trace!("tx packet {:02X} {:02X?} ({:02X})", packet.command(), packet.data(), packet.crc());
        for byte in packet.encode() {
            self.debug_tx.push_back(DebugTx::Byte(byte));
        }
        self.end_packet(self.settle);
    }
}
