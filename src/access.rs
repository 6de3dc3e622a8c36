//! Bus access decomposer.
//!
//! Turns an arbitrary `(address, length)` read or write into operations the
//! target's debug module can perform, and reassembles the replies.
//!
//! The hardware offers two kinds of access:
//!
//! - Bulk: up to 7 words per packet using the module's auto-increment
//!   pointer.  Never crosses a 4 KiB page.  Bulk writes additionally start
//!   on a 28 byte row of the page selected by a preceding SetPage.  Faults
//!   during a bulk burst are not reported.
//! - Volatile: a single byte, half-word or word at any address, performed
//!   in two phases (prepare, then execute) and reporting a fault status.
//!
//! Bulk is used while at least 8 bytes remain, so the final access of every
//! request is volatile and its fault status speaks for the request.
//!
//! Each request ends with a barrier.  Its callback fires once every
//! constituent operation has completed and delivers an [`AccessReport`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::packet::{Opcode, Packet};
use crate::queue::{Completion, Operation};
use crate::{Error, Result};

/// Hardware page size.  Bulk accesses never cross a page.
pub const PAGE_SIZE: u32 = 4096;

/// Largest single request.
pub const MAX_ACCESS: usize = 4096;

/// Most words a bulk packet carries.
pub const BULK_MAX_WORDS: usize = 7;

/// Bulk writes start on a row of this many bytes within the page.
pub const BULK_ROW_BYTES: u32 = 28;

/// Fewest bytes remaining for a bulk access to be used.
const BULK_MIN_REMAIN: usize = 8;

const WRITE_ENABLE: u8 = 0x08;
const FAULT_FLAG: u8 = 0x01;

/// Identifies the client a request was made on behalf of.
pub type ClientId = usize;

/// One page-clipped piece of a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageChunk {
    /// First address of the chunk
    pub address: u32,
    /// Base address of the page containing the chunk
    pub base: u32,
    /// Offset of the chunk's first byte within the page
    pub start_offset: u32,
    /// Offset one past the chunk's last byte within the page
    pub stop_offset: u32,
    /// Bytes in the chunk
    pub num_bytes: usize,
}

/// Splits a byte range at page boundaries.
#[derive(Debug, Clone)]
pub struct PageIter {
    page_size: u32,
    address: u32,
    remain: usize,
}

impl PageIter {
    /// `page_size` must be a power of two.
    pub fn new(address: u32, len: usize, page_size: u32) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            page_size,
            address,
            remain: len,
        }
    }
}

impl Iterator for PageIter {
    type Item = PageChunk;

    fn next(&mut self) -> Option<PageChunk> {
        if self.remain == 0 {
            return None;
        }

        let base = self.address & !(self.page_size - 1);
        let start_offset = self.address - base;
        let num_bytes = ((self.page_size - start_offset) as usize).min(self.remain);
        let chunk = PageChunk {
            address: self.address,
            base,
            start_offset,
            stop_offset: start_offset + num_bytes as u32,
            num_bytes,
        };

        self.address = self.address.wrapping_add(num_bytes as u32);
        self.remain -= num_bytes;
        Some(chunk)
    }
}

/// Access width of a volatile write.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte = 1,
    Half = 2,
    Word = 4,
}

/// One bus-level step of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOp {
    /// Select the page for following bulk writes
    SetPage { base: u32 },
    /// Read `words` words from `address`
    BulkRead { address: u32, words: usize },
    /// Write `words` words at `address`, a row boundary
    BulkWrite { address: u32, words: usize },
    /// Read the word at `aligned`, keeping `len` bytes from `address`
    VolatileRead { aligned: u32, address: u32, len: usize },
    /// Write `width` bytes at `address`, which is naturally aligned
    VolatileWrite { address: u32, width: Width },
}

impl BusOp {
    /// Address and length of the part of the request this step transfers.
    /// `None` for steps that transfer nothing.
    pub fn span(&self) -> Option<(u32, usize)> {
        match *self {
            BusOp::SetPage { .. } => None,
            BusOp::BulkRead { address, words } | BusOp::BulkWrite { address, words } => {
                Some((address, words * 4))
            }
            BusOp::VolatileRead { address, len, .. } => Some((address, len)),
            BusOp::VolatileWrite { address, width } => Some((address, width as usize)),
        }
    }

    pub fn is_volatile(&self) -> bool {
        matches!(
            self,
            BusOp::VolatileRead { .. } | BusOp::VolatileWrite { .. }
        )
    }
}

/// Check a single request: 1 to [`MAX_ACCESS`] bytes, not wrapping the
/// 32-bit address space.
pub fn check_range(address: u32, len: usize) -> Result<()> {
    if len == 0 || len > MAX_ACCESS || address as u64 + len as u64 > 1 << 32 {
        return Err(Error::InvalidLength);
    }
    Ok(())
}

fn bulk_words(remain: usize) -> usize {
    if remain > BULK_MAX_WORDS * 4 + 4 {
        BULK_MAX_WORDS
    } else {
        (remain - 4) / 4
    }
}

/// Plan the bus steps for a read.
pub fn plan_read(address: u32, len: usize) -> Result<Vec<BusOp>> {
    check_range(address, len)?;

    let mut ops = Vec::new();
    let mut remain = len;
    for chunk in PageIter::new(address, len, PAGE_SIZE) {
        let mut cur = chunk.address;
        let mut left = chunk.num_bytes;
        while left > 0 {
            let step = if cur % 4 == 0 && remain >= BULK_MIN_REMAIN {
                let words = bulk_words(remain).min(left / 4);
                ops.push(BusOp::BulkRead { address: cur, words });
                words * 4
            } else {
                let aligned = cur & !3;
                let len = (4 - (cur - aligned) as usize).min(remain);
                ops.push(BusOp::VolatileRead {
                    aligned,
                    address: cur,
                    len,
                });
                len
            };
            cur = cur.wrapping_add(step as u32);
            left -= step;
            remain -= step;
        }
    }
    Ok(ops)
}

/// Plan the bus steps for a write.  SetPage steps are included before the
/// first bulk write on each page.
pub fn plan_write(address: u32, len: usize) -> Result<Vec<BusOp>> {
    check_range(address, len)?;

    let mut ops = Vec::new();
    let mut remain = len;
    let mut page = None;
    for chunk in PageIter::new(address, len, PAGE_SIZE) {
        let mut cur = chunk.address;
        let mut left = chunk.num_bytes;
        while left > 0 {
            let step = if (cur % PAGE_SIZE) % BULK_ROW_BYTES == 0 && remain >= BULK_MIN_REMAIN {
                let words = bulk_words(remain).min(left / 4);
                if page != Some(chunk.base) {
                    ops.push(BusOp::SetPage { base: chunk.base });
                    page = Some(chunk.base);
                }
                ops.push(BusOp::BulkWrite { address: cur, words });
                words * 4
            } else {
                let width = if cur % 4 == 0 && remain >= 4 {
                    Width::Word
                } else if cur % 2 == 0 && remain >= 2 {
                    Width::Half
                } else {
                    Width::Byte
                };
                ops.push(BusOp::VolatileWrite {
                    address: cur,
                    width,
                });
                width as usize
            };
            cur = cur.wrapping_add(step as u32);
            left -= step;
            remain -= step;
        }
    }
    Ok(ops)
}

/// Read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// Outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessResult {
    /// Read completed, with the data
    Data(Vec<u8>),
    /// Write completed
    Done,
    /// The final access faulted, with the fault code reported by the target
    Fault(u32),
    /// The link failed before the request completed
    CommunicationError,
    /// The backend cannot reach the address range
    OutOfRange,
}

/// Delivered once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessReport {
    pub client: ClientId,
    pub kind: AccessKind,
    pub address: u32,
    pub len: usize,
    pub result: AccessResult,
}

/// Receives the report for a request.
pub type ReportFn = Box<dyn FnOnce(AccessReport)>;

// State shared between a request's operation callbacks.
struct Request {
    client: ClientId,
    kind: AccessKind,
    address: u32,
    len: usize,
    buffer: Vec<u8>,
    fault: Option<u32>,
}

impl Request {
    // Store bytes received for `address`, dropping any outside the request.
    fn store(&mut self, address: u32, data: &[u8]) {
        for (ii, &byte) in data.iter().enumerate() {
            let offset = address.wrapping_add(ii as u32).wrapping_sub(self.address) as usize;
            if let Some(slot) = self.buffer.get_mut(offset) {
                *slot = byte;
            }
        }
    }
}

type Shared = Rc<RefCell<Request>>;

fn be_word(bytes: &[u8]) -> Option<u32> {
    let word: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(word))
}

/// Build the operations for a read of `len` bytes at `address`.
///
/// `on_done` receives the report when the final barrier is released, or
/// when the link fails.
pub fn read_operations(
    client: ClientId,
    address: u32,
    len: usize,
    on_done: impl FnOnce(AccessReport) + 'static,
) -> Result<Vec<Operation>> {
    let plan = plan_read(address, len)?;
    debug!(
        "Read {len} bytes at {address:#010X}: {} bus operations",
        plan.len()
    );
    let request = Rc::new(RefCell::new(Request {
        client,
        kind: AccessKind::Read,
        address,
        len,
        buffer: vec![0; len],
        fault: None,
    }));
    build(&plan, &request, &[], on_done)
}

/// Build the operations for a write of `data` at `address`.
pub fn write_operations(
    client: ClientId,
    address: u32,
    data: &[u8],
    on_done: impl FnOnce(AccessReport) + 'static,
) -> Result<Vec<Operation>> {
    let plan = plan_write(address, data.len())?;
    debug!(
        "Write {} bytes at {address:#010X}: {} bus operations",
        data.len(),
        plan.len()
    );
    let request = Rc::new(RefCell::new(Request {
        client,
        kind: AccessKind::Write,
        address,
        len: data.len(),
        buffer: Vec::new(),
        fault: None,
    }));
    build(&plan, &request, data, on_done)
}

fn build(
    plan: &[BusOp],
    request: &Shared,
    data: &[u8],
    on_done: impl FnOnce(AccessReport) + 'static,
) -> Result<Vec<Operation>> {
    let base = request.borrow().address;
    let mut ops = Vec::new();

    for op in plan {
        match *op {
            BusOp::SetPage { base: page } => {
                let payload = [(page >> 24) as u8, (page >> 16) as u8, (page >> 8) as u8 & 0xF0];
                ops.push(Operation::barrier());
                ops.push(Operation::command(Packet::new(Opcode::SetPage, &payload)?));
                ops.push(Operation::barrier());
            }
            BusOp::BulkRead { address, words } => {
                let mut payload = [0u8; 5];
                payload[..4].copy_from_slice(&address.to_be_bytes());
                payload[4] = address.wrapping_add(words as u32 * 4) as u8;
                let state = request.clone();
                ops.push(Operation::command_with(
                    Packet::new(Opcode::BulkRead, &payload)?,
                    move |completion| {
                        if let Completion::Acked { tx, rx } = completion {
                            match be_word(tx.data()) {
                                Some(at) => state.borrow_mut().store(at, rx.data()),
                                None => warn!("Bulk read echo without an address"),
                            }
                        }
                    },
                ));
            }
            BusOp::BulkWrite { address, words } => {
                let offset = address.wrapping_sub(base) as usize;
                let bytes = data
                    .get(offset..offset + words * 4)
                    .ok_or(Error::InvalidLength)?;
                let mut payload = [0u8; 1 + BULK_MAX_WORDS * 4];
                payload[0] = (address % PAGE_SIZE / BULK_ROW_BYTES) as u8;
                payload[1..=bytes.len()].copy_from_slice(bytes);
                ops.push(Operation::command(Packet::new(
                    Opcode::BulkWrite,
                    &payload[..=bytes.len()],
                )?));
            }
            BusOp::VolatileRead { aligned, .. } => {
                volatile(&mut ops, request, aligned, [0; 4], 0, true)?;
            }
            BusOp::VolatileWrite { address, width } => {
                let offset = address.wrapping_sub(base) as usize;
                let bytes = data
                    .get(offset..offset + width as usize)
                    .ok_or(Error::InvalidLength)?;
                let lanes: [u8; 4] = core::array::from_fn(|ii| bytes[ii % bytes.len()]);
                let shift = 4 - (address & 3) as usize - width as usize;
                let mask = ((1u8 << width as u8) - 1) << shift;
                let flags = mask << 4 | WRITE_ENABLE;
                volatile(&mut ops, request, address & !3, lanes, flags, false)?;
            }
        }
    }

    let state = request.clone();
    ops.push(Operation::barrier_with(move |completion| {
        let mut request = state.borrow_mut();
        let result = if !completion.is_success() {
            AccessResult::CommunicationError
        } else if let Some(code) = request.fault {
            AccessResult::Fault(code)
        } else {
            match request.kind {
                AccessKind::Read => AccessResult::Data(core::mem::take(&mut request.buffer)),
                AccessKind::Write => AccessResult::Done,
            }
        };
        let report = AccessReport {
            client: request.client,
            kind: request.kind,
            address: request.address,
            len: request.len,
            result,
        };
        drop(request);
        on_done(report);
    }));

    Ok(ops)
}

// Queue the prepare, barrier, execute, barrier quadruple of a volatile
// access to the word at `aligned`.
fn volatile(
    ops: &mut Vec<Operation>,
    request: &Shared,
    aligned: u32,
    data: [u8; 4],
    flags: u8,
    read: bool,
) -> Result<()> {
    let mut payload = [0u8; 9];
    payload[..4].copy_from_slice(&aligned.to_be_bytes());
    payload[4..8].copy_from_slice(&data);
    payload[8] = flags;
    ops.push(Operation::command(Packet::new(
        Opcode::VolatilePrepare,
        &payload,
    )?));
    ops.push(Operation::barrier());

    let state = request.clone();
    ops.push(Operation::command_with(
        Packet::new(Opcode::VolatileExecute, &[])?,
        move |completion| {
            let Completion::Acked { rx, .. } = completion else {
                return;
            };
            let (Some(word), Some(&status)) = (be_word(rx.data()), rx.data().get(4)) else {
                warn!("Short volatile reply: {} bytes", rx.len());
                return;
            };
            let mut request = state.borrow_mut();
            if status & FAULT_FLAG != 0 {
                request.fault = Some(word);
            } else {
                request.fault = None;
                if read {
                    request.store(aligned, &word.to_be_bytes());
                }
            }
        },
    ));
    ops.push(Operation::barrier());
    Ok(())
}
