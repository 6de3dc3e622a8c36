//! Synchronous backend over a block of memory.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::vec;
use alloc::vec::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::access::{AccessKind, AccessReport, AccessResult, ClientId, ReportFn, check_range};
use crate::backend::Backend;
use crate::engine::Status;
use crate::Result;

/// Backend over a memory window mapped at `base`.
///
/// Requests complete before `read()`/`write()` return.  Accesses that fall
/// outside the window are reported as [`AccessResult::OutOfRange`].
#[derive(Debug, Clone)]
pub struct RamBackend {
    base: u32,
    memory: Vec<u8>,
}

impl RamBackend {
    /// Create a zero-filled window of `size` bytes at `base`.
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            memory: vec![0; size],
        }
    }

    /// Create a window at `base` holding `memory`.
    pub fn with_memory(base: u32, memory: Vec<u8>) -> Self {
        Self { base, memory }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    // Offset of the range within the window, if it lies wholly inside.
    fn window(&self, address: u32, len: usize) -> Option<usize> {
        let offset = address.checked_sub(self.base)? as usize;
        let end = offset.checked_add(len)?;
        (end <= self.memory.len()).then_some(offset)
    }
}

impl Backend for RamBackend {
    fn read(
        &mut self,
        address: u32,
        len: usize,
        client: ClientId,
        on_done: ReportFn,
    ) -> Result<()> {
        check_range(address, len)?;
        let result = match self.window(address, len) {
            Some(offset) => AccessResult::Data(self.memory[offset..offset + len].to_vec()),
            None => {
                debug!("Read {len} bytes at {address:#010X} outside mapped window");
                AccessResult::OutOfRange
            }
        };
        on_done(AccessReport {
            client,
            kind: AccessKind::Read,
            address,
            len,
            result,
        });
        Ok(())
    }

    fn write(
        &mut self,
        address: u32,
        data: &[u8],
        client: ClientId,
        on_done: ReportFn,
    ) -> Result<()> {
        check_range(address, data.len())?;
        let result = match self.window(address, data.len()) {
            Some(offset) => {
                self.memory[offset..offset + data.len()].copy_from_slice(data);
                AccessResult::Done
            }
            None => {
                debug!(
                    "Write {} bytes at {address:#010X} outside mapped window",
                    data.len()
                );
                AccessResult::OutOfRange
            }
        };
        on_done(AccessReport {
            client,
            kind: AccessKind::Write,
            address,
            len: data.len(),
            result,
        });
        Ok(())
    }

    fn update(&mut self) -> Result<Status> {
        Ok(Status::Idle)
    }

    fn free(&mut self) {}
}
