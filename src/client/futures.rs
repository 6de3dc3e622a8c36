//! Asynchronous Client - typically used by a Host.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::boxed::Box;
use alloc::rc::Rc;
use async_trait::async_trait;
use core::cell::RefCell;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::access::{AccessReport, AccessResult, ClientId, MAX_ACCESS, PageIter};
use crate::backend::Backend;
use crate::client::BusStatus;
use crate::{Error, Result};

/// Yield delay for async polling loops.
///
/// Application must provide an implementation of this trait in order for the
/// async client to be able to yield while waiting for the backend to
/// complete a request.
///
/// This trait keeps `dbglink` free of any specific async runtime.
///
/// Example:
///
/// ```ignore
/// use embassy_time::{Duration, Timer};
/// struct Delay;
/// impl AsyncDelay for Delay {
///     async fn delay() {
///         Timer::after(Duration::from_millis(1)).await;
///     }
/// }
/// ```
pub trait AsyncDelay {
    fn delay() -> impl Future<Output = ()>;
}

/// Byte-addressed access to target memory.
#[async_trait(?Send)]
pub trait AsyncMemory {
    /// Fill `buf` from target memory starting at `address`.
    ///
    /// A bus fault is not an error: it is reported as
    /// [`BusStatus::Fault`], and the contents of `buf` from the faulting
    /// chunk onwards are unspecified.
    async fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<BusStatus>;

    /// Write `data` to target memory starting at `address`.
    async fn write(&mut self, address: u32, data: &[u8]) -> Result<BusStatus>;
}

/// Async client over a [`Backend`].
///
/// Transfers of any length are split into chunks that neither exceed
/// [`MAX_ACCESS`] bytes nor cross a 4 KiB boundary.  Chunks are submitted
/// one at a time; the backend is polled with `update()` and [`AsyncDelay`]
/// between polls until each completes.
///
/// Example usage:
///
/// ```ignore
/// use dbglink::backend::SerialBackend;
/// use dbglink::client::{AsyncDebugClient, AsyncDelay, AsyncMemory};
/// use dbglink::engine::LinkConfig;
///
/// let backend = SerialBackend::new(port, clock, &LinkConfig::default());
/// let mut client = AsyncDebugClient::<_, Delay>::new(backend, 0);
/// let mut buf = [0u8; 64];
/// let status = client.read(0x2000_0000, &mut buf).await?;
/// ```
pub struct AsyncDebugClient<B: Backend, D: AsyncDelay> {
    backend: B,
    client: ClientId,
    _delay: core::marker::PhantomData<D>,
}

impl<B: Backend, D: AsyncDelay> AsyncDebugClient<B, D> {
    /// Create a new AsyncDebugClient
    ///
    /// Arguments:
    /// - `backend`: backend to submit requests to
    /// - `client`: client ID attached to every request
    pub fn new(backend: B, client: ClientId) -> Self {
        Self {
            backend,
            client,
            _delay: core::marker::PhantomData,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_inner(self) -> B {
        self.backend
    }

    // Submit one chunk and wait for its report.
    async fn transfer(
        &mut self,
        address: u32,
        len: usize,
        data: Option<&[u8]>,
    ) -> Result<AccessReport> {
        let slot: Rc<RefCell<Option<AccessReport>>> = Rc::new(RefCell::new(None));
        let on_done = {
            let slot = slot.clone();
            Box::new(move |report: AccessReport| *slot.borrow_mut() = Some(report))
        };

        match data {
            Some(data) => self.backend.write(address, data, self.client, on_done)?,
            None => self.backend.read(address, len, self.client, on_done)?,
        }

        loop {
            if let Some(report) = slot.borrow_mut().take() {
                return Ok(report);
            }

            // A fatal error takes precedence over the failure report it
            // produced
            if let Err(e) = self.backend.update() {
                warn!("Backend failed during transfer at {address:#010X}: {e:?}");
                return Err(e);
            }
            if let Some(report) = slot.borrow_mut().take() {
                return Ok(report);
            }

            // Yield with reasonable delay to avoid spinning too fast
            D::delay().await;
        }
    }
}

fn check_range(address: u32, len: usize) -> Result<()> {
    if address as u64 + len as u64 > 1 << 32 {
        return Err(Error::InvalidLength);
    }
    Ok(())
}

// Map a failed report onto the client's error type.
fn failure(report: &AccessReport) -> Error {
    match report.result {
        AccessResult::OutOfRange => Error::OutOfRange,
        _ => Error::Communication,
    }
}

#[async_trait(?Send)]
impl<B: Backend, D: AsyncDelay> AsyncMemory for AsyncDebugClient<B, D> {
    async fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<BusStatus> {
        check_range(address, buf.len())?;
        debug!("Client read of {} bytes at {address:#010X}", buf.len());

        for chunk in PageIter::new(address, buf.len(), MAX_ACCESS as u32) {
            let offset = chunk.address.wrapping_sub(address) as usize;
            let report = self.transfer(chunk.address, chunk.num_bytes, None).await?;
            match &report.result {
                AccessResult::Data(data) if data.len() == chunk.num_bytes => {
                    buf[offset..offset + chunk.num_bytes].copy_from_slice(data);
                }
                AccessResult::Fault(code) => {
                    return Ok(BusStatus::Fault {
                        address: chunk.address,
                        code: *code,
                    });
                }
                _ => return Err(failure(&report)),
            }
        }
        Ok(BusStatus::Ok)
    }

    async fn write(&mut self, address: u32, data: &[u8]) -> Result<BusStatus> {
        check_range(address, data.len())?;
        debug!("Client write of {} bytes at {address:#010X}", data.len());

        for chunk in PageIter::new(address, data.len(), MAX_ACCESS as u32) {
            let offset = chunk.address.wrapping_sub(address) as usize;
            let bytes = &data[offset..offset + chunk.num_bytes];
            let report = self.transfer(chunk.address, chunk.num_bytes, Some(bytes)).await?;
            match &report.result {
                AccessResult::Done => {}
                AccessResult::Fault(code) => {
                    return Ok(BusStatus::Fault {
                        address: chunk.address,
                        code: *code,
                    });
                }
                _ => return Err(failure(&report)),
            }
        }
        Ok(BusStatus::Ok)
    }
}
