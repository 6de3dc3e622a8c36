//! Debug packet codec.
//!
//! On the debug stream, every packet has the layout
//!
//! ```text
//! [command: 1][data: 0..30][crc: 1]
//! ```
//!
//! The high nibble of the command byte is the [`Opcode`], the low nibble the
//! sequence number.  The CRC is CRC-8 (polynomial 0x07, MSB first, not
//! reflected, initial value 0) over the command byte followed by the data
//! bytes.
//!
//! Packets are delimited by the multiplexer, not by a length field, so the
//! receive side accumulates debug bytes in a [`PacketAssembler`] until it sees
//! an end-of-packet marker.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use crc::{CRC_8_SMBUS, Crc};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::mux::DebugSymbol;
use crate::{Error, Result};

/// Maximum number of payload bytes in a packet.
pub const MAX_PAYLOAD: usize = 30;

/// Maximum size of an encoded packet: command, payload and CRC.  The
/// hardware's receive buffer has the same limit.
pub const MAX_FRAME: usize = MAX_PAYLOAD + 2;

/// Number of distinct sequence numbers.
pub const SEQUENCE_SPACE: usize = 16;

const SEQUENCE_MASK: u8 = 0x0F;
const OPCODE_MASK: u8 = 0xF0;

// Poly 0x07, init 0, no reflection, no final xor.
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Compute the packet CRC over a command byte and payload.
pub fn crc8(command: u8, data: &[u8]) -> u8 {
    let mut digest = CRC8.digest();
    digest.update(&[command]);
    digest.update(data);
    digest.finalize()
}

/// Debug command opcodes, as they appear in the high nibble of the command
/// byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Select the 4 KiB page used by subsequent bulk writes
    SetPage = 0xA0,
    /// Write up to 7 words at a row of the current page
    BulkWrite = 0xB0,
    /// Read up to 7 words
    BulkRead = 0xC0,
    /// Load address, data and flags for a volatile access
    VolatilePrepare = 0xD0,
    /// Perform the prepared volatile access and report its fault status
    VolatileExecute = 0xE0,
}

impl Opcode {
    /// Decode the opcode from a command byte, ignoring the sequence number.
    pub fn from_command(command: u8) -> Option<Self> {
        match command & OPCODE_MASK {
            0xA0 => Some(Opcode::SetPage),
            0xB0 => Some(Opcode::BulkWrite),
            0xC0 => Some(Opcode::BulkRead),
            0xD0 => Some(Opcode::VolatilePrepare),
            0xE0 => Some(Opcode::VolatileExecute),
            _ => None,
        }
    }
}

/// Reasons a received frame was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame shorter than 2 bytes or longer than [`MAX_FRAME`]
    Length(usize),
    /// CRC did not match
    Checksum { expected: u8, received: u8 },
}

/// A debug packet.
///
/// The CRC is always consistent with the command byte and payload: it is
/// computed on construction and recomputed whenever the sequence number is
/// changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    command: u8,
    data: heapless::Vec<u8, MAX_PAYLOAD>,
    crc: u8,
}

impl Packet {
    /// Create a packet for `opcode` with sequence number 0.
    pub fn new(opcode: Opcode, data: &[u8]) -> Result<Self> {
        Self::from_parts(opcode as u8, data)
    }

    /// Create a packet from a raw command byte.
    pub fn from_parts(command: u8, data: &[u8]) -> Result<Self> {
        let data = heapless::Vec::from_slice(data).map_err(|_| Error::PayloadTooLarge)?;
        let crc = crc8(command, &data);
        Ok(Self { command, data, crc })
    }

    /// Decode a complete frame, as delimited on the debug stream.
    pub fn decode(frame: &[u8]) -> core::result::Result<Self, DecodeError> {
        if frame.len() < 2 || frame.len() > MAX_FRAME {
            return Err(DecodeError::Length(frame.len()));
        }

        let command = frame[0];
        let received = frame[frame.len() - 1];
        let payload = &frame[1..frame.len() - 1];
        let expected = crc8(command, payload);
        if expected != received {
            return Err(DecodeError::Checksum { expected, received });
        }

        let data = heapless::Vec::from_slice(payload)
            .map_err(|_| DecodeError::Length(frame.len()))?;
        Ok(Self {
            command,
            data,
            crc: received,
        })
    }

    /// Encoded bytes: command, payload, CRC.
    pub fn encode(&self) -> impl Iterator<Item = u8> + '_ {
        core::iter::once(self.command)
            .chain(self.data.iter().copied())
            .chain(core::iter::once(self.crc))
    }

    /// Length of the encoded packet.
    pub fn encoded_len(&self) -> usize {
        self.data.len() + 2
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_command(self.command)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn crc(&self) -> u8 {
        self.crc
    }

    /// Sequence number, from the low nibble of the command byte.
    pub fn sequence(&self) -> u8 {
        self.command & SEQUENCE_MASK
    }

    /// Replace the sequence number, keeping the opcode.
    pub fn set_sequence(&mut self, sequence: u8) {
        self.command = (self.command & OPCODE_MASK) | (sequence & SEQUENCE_MASK);
        self.crc = crc8(self.command, &self.data);
    }
}

/// Destination for outbound packets.
pub trait PacketSink {
    /// Queue a packet for transmission.  Never blocks.
    fn transmit(&mut self, packet: &Packet);
}

/// Accumulates debug stream symbols into frames and decodes them.
///
/// One per receive direction; the engine owns the host's.
#[derive(Debug)]
pub struct PacketAssembler {
    buf: [u8; MAX_FRAME],
    len: usize,
}

impl PacketAssembler {
    /// Create an empty assembler.
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_FRAME],
            len: 0,
        }
    }

    /// Feed one debug stream symbol.
    ///
    /// Returns `None` while a frame is still being accumulated, and the
    /// decode result once an end-of-packet marker arrives.  Bytes beyond
    /// [`MAX_FRAME`] are counted but not stored, so an oversized frame is
    /// reported as a length error.
    pub fn push(&mut self, symbol: DebugSymbol) -> Option<core::result::Result<Packet, DecodeError>> {
        match symbol {
            DebugSymbol::Byte(byte) => {
                if self.len < MAX_FRAME {
                    self.buf[self.len] = byte;
                }
                self.len = self.len.saturating_add(1);
                None
            }
            DebugSymbol::EndOfPacket => {
                let len = core::mem::take(&mut self.len);
                if len > MAX_FRAME {
                    return Some(Err(DecodeError::Length(len)));
                }
                Some(Packet::decode(&self.buf[..len]))
            }
        }
    }
}

impl Default for PacketAssembler {
    fn default() -> Self {
        Self::new()
    }
}
