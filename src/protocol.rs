//! Text command protocol spoken by remote debug clients.
//!
//! Commands are ASCII and terminated by `;`:
//!
//! ```text
//! Read,<address: 1-8 hex digits>,<count: 1-4 decimal digits>
//! Write,<address: 1-8 hex digits>,<count: 1-4 decimal digits>,<data: 2*count hex digits>
//! Stop
//! ```
//!
//! At most 4096 bytes are transferred per command.  Each command gets
//! exactly one reply line, for example:
//!
//! ```text
//! OK, Read, OK, 00001000, 4, DEADBEEF;
//! OK, Write, Fault, 00001000, 4, 0000000B;
//! Error, Read, CommunicationError;
//! ```

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::boxed::Box;
use alloc::format;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt::Write;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::access::{self, AccessKind, AccessReport, AccessResult, ClientId, MAX_ACCESS};
use crate::{Error, Result};
use crate::backend::Backend;

/// Longest command accepted, excluding the terminator.
pub const MAX_COMMAND: usize = 8448;

const TERMINATOR: u8 = b';';

/// A parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read { address: u32, len: usize },
    Write { address: u32, data: Vec<u8> },
    Stop,
}

/// Commands that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Read,
    Write,
}

impl Verb {
    fn as_str(self) -> &'static str {
        match self {
            Verb::Read => "Read",
            Verb::Write => "Write",
        }
    }
}

impl From<AccessKind> for Verb {
    fn from(kind: AccessKind) -> Self {
        match kind {
            AccessKind::Read => Verb::Read,
            AccessKind::Write => Verb::Write,
        }
    }
}

/// Rejected commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Malformed arguments
    Syntax(Verb),
    /// Count outside 1-4096
    InvalidBufSize(Verb),
    /// Range runs past the end of the address space
    OutOfRange(Verb),
    /// Command name not recognised
    UnknownCommand(String),
    /// Command longer than [`MAX_COMMAND`]
    BufferOverrun,
}

impl RequestError {
    /// Reply line for the client.
    pub fn reply(&self) -> String {
        match self {
            RequestError::Syntax(verb) => format!("Error, {}, Syntax;\n", verb.as_str()),
            RequestError::InvalidBufSize(verb) => {
                format!("Error, {}, InvalidBufSize;\n", verb.as_str())
            }
            RequestError::OutOfRange(verb) => {
                format!("Error, {}, OutOfMappedRange;\n", verb.as_str())
            }
            RequestError::UnknownCommand(name) => format!("Error, {name}, UnknownCommand;\n"),
            RequestError::BufferOverrun => String::from("Error, PacketBufferOverrun;\n"),
        }
    }
}

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn hex_nibble(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    }
}

/// Parse one command, without its terminator.
pub fn parse_request(command: &str) -> core::result::Result<Request, RequestError> {
    let (name, args) = match command.split_once(',') {
        Some((name, args)) => (name, Some(args)),
        None => (command, None),
    };
    let verb = match name {
        "Stop" => return Ok(Request::Stop),
        "Read" => Verb::Read,
        "Write" => Verb::Write,
        _ => return Err(RequestError::UnknownCommand(name.into())),
    };
    let syntax = || RequestError::Syntax(verb);

    let mut fields = args.ok_or_else(syntax)?.split(',');

    let address = fields.next().unwrap_or_default();
    if address.is_empty() || address.len() > 8 || !is_hex(address) {
        return Err(syntax());
    }
    let address = u32::from_str_radix(address, 16).map_err(|_| syntax())?;

    let count = fields.next().unwrap_or_default();
    if count.len() > 4 || !count.bytes().all(|b| b.is_ascii_digit()) {
        return Err(syntax());
    }
    let len = count.parse::<usize>().unwrap_or(0);
    if len == 0 || len > MAX_ACCESS {
        return Err(RequestError::InvalidBufSize(verb));
    }
    access::check_range(address, len).map_err(|_| RequestError::OutOfRange(verb))?;

    let request = match verb {
        Verb::Read => Request::Read { address, len },
        Verb::Write => {
            let hex = fields.next().ok_or_else(syntax)?;
            if hex.len() != len * 2 || !is_hex(hex) {
                return Err(syntax());
            }
            let data = hex
                .as_bytes()
                .chunks(2)
                .map(|pair| hex_nibble(pair[0]) << 4 | hex_nibble(pair[1]))
                .collect();
            Request::Write { address, data }
        }
    };

    if fields.next().is_some() {
        return Err(syntax());
    }
    Ok(request)
}

/// Reply line for a completed request.
pub fn format_report(report: &AccessReport) -> String {
    let verb = Verb::from(report.kind).as_str();
    let (address, len) = (report.address, report.len);
    match &report.result {
        AccessResult::Data(data) => {
            let mut reply = format!("OK, {verb}, OK, {address:08X}, {len}, ");
            for byte in data {
                // Writing to a String cannot fail
                let _ = write!(reply, "{byte:02X}");
            }
            reply.push_str(";\n");
            reply
        }
        AccessResult::Done => format!("OK, {verb}, OK, {address:08X}, {len};\n"),
        AccessResult::Fault(code) => {
            format!("OK, {verb}, Fault, {address:08X}, {len}, {code:08X};\n")
        }
        AccessResult::CommunicationError => format!("Error, {verb}, CommunicationError;\n"),
        AccessResult::OutOfRange => format!("Error, {verb}, OutOfMappedRange;\n"),
    }
}

/// Splits a client's byte stream into commands.
///
/// Only letters, digits and commas are kept; everything else between
/// terminators (whitespace, line endings) is dropped.
#[derive(Debug, Default)]
pub struct RequestReader {
    buf: String,
    overrun: bool,
}

impl RequestReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte.  Returns a command, or an overrun error, when a
    /// terminator arrives.
    pub fn push(&mut self, byte: u8) -> Option<core::result::Result<String, RequestError>> {
        match byte {
            TERMINATOR => {
                let command = core::mem::take(&mut self.buf);
                if core::mem::take(&mut self.overrun) {
                    warn!("Command longer than {MAX_COMMAND} bytes discarded");
                    return Some(Err(RequestError::BufferOverrun));
                }
                Some(Ok(command))
            }
            b',' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' => {
                if self.buf.len() >= MAX_COMMAND {
                    self.overrun = true;
                } else {
                    self.buf.push(byte as char);
                }
                None
            }
            _ => None,
        }
    }
}

/// What the server should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Handle one command from `client`, submitting reads and writes to
/// `backend`.
///
/// `on_reply` receives the command's single reply line: immediately for
/// rejected commands and `Stop`, or once the backend completes the request.
///
/// # Errors
///
/// Propagates errors from the backend's `read()`/`write()` other than
/// [`Error::InvalidLength`], after replying to the client.
pub fn dispatch<B: Backend + ?Sized>(
    backend: &mut B,
    client: ClientId,
    command: &str,
    on_reply: impl FnOnce(String) + 'static,
) -> Result<Flow> {
    let request = match parse_request(command) {
        Ok(request) => request,
        Err(e) => {
            debug!("Client {client}: rejected {command:?}: {e:?}");
            on_reply(e.reply());
            return Ok(Flow::Continue);
        }
    };

    let (verb, address, data, len) = match request {
        Request::Read { address, len } => (Verb::Read, address, None, len),
        Request::Write { address, data } => (Verb::Write, address, Some(data), 0),
        Request::Stop => {
            info!("Client {client} requested stop");
            on_reply(String::from("OK, Stop;\n"));
            return Ok(Flow::Stop);
        }
    };

    // Shared so a rejected submission can still be answered
    let reply = Rc::new(RefCell::new(Some(on_reply)));
    let on_done = {
        let reply = reply.clone();
        Box::new(move |report: AccessReport| {
            let on_reply = reply.borrow_mut().take();
            if let Some(on_reply) = on_reply {
                on_reply(format_report(&report));
            }
        })
    };
    let submitted = match data {
        Some(data) => backend.write(address, &data, client, on_done),
        None => backend.read(address, len, client, on_done),
    };

    let Err(e) = submitted else {
        return Ok(Flow::Continue);
    };
    warn!("Client {client}: backend rejected {command:?}: {e:?}");
    let on_reply = reply.borrow_mut().take();
    if let Some(on_reply) = on_reply {
        on_reply(match e {
            Error::InvalidLength => RequestError::InvalidBufSize(verb).reply(),
            _ => format!("Error, {}, CommunicationError;\n", verb.as_str()),
        });
    }
    match e {
        Error::InvalidLength => Ok(Flow::Continue),
        _ => Err(e),
    }
}
