//! Serial backend: the sequenced transport.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::Result;
use crate::access::{self, ClientId, ReportFn};
use crate::backend::Backend;
use crate::engine::{CommandEngine, LinkConfig, Status};
use crate::io::{Clock, SerialIo};
use crate::mux::Stream;

/// Backend driving a target over a serial link shared with the target's
/// application stream.
///
/// Application bytes can be exchanged through [`SerialBackend::send_app()`]
/// and [`SerialBackend::receive_app()`]; they travel on the same wire as
/// the debug packets.
pub struct SerialBackend<P: SerialIo, C: Clock> {
    port: P,
    clock: C,
    engine: CommandEngine,
}

impl<P: SerialIo, C: Clock> SerialBackend<P, C> {
    /// Create a new SerialBackend
    ///
    /// Arguments:
    /// - `port`: the serial port, opened in raw non-blocking mode
    /// - `clock`: time source for reply timeouts
    /// - `config`: link configuration
    pub fn new(port: P, clock: C, config: &LinkConfig) -> Self {
        Self {
            port,
            clock,
            engine: CommandEngine::new(config),
        }
    }

    pub fn engine(&self) -> &CommandEngine {
        &self.engine
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Queue application bytes.  Sent on the next `update()`.
    pub fn send_app(&mut self, data: &[u8]) {
        let mux = self.engine.mux();
        for &byte in data {
            mux.send(Stream::App, byte);
        }
    }

    /// Next received application byte.
    pub fn receive_app(&mut self) -> Option<u8> {
        self.engine.mux().receive_app()
    }

    /// Release the port and clock.  Outstanding requests are failed.
    pub fn into_parts(mut self) -> (P, C) {
        self.engine.abort_all();
        (self.port, self.clock)
    }
}

impl<P: SerialIo, C: Clock> Backend for SerialBackend<P, C> {
    fn read(
        &mut self,
        address: u32,
        len: usize,
        client: ClientId,
        on_done: ReportFn,
    ) -> Result<()> {
        let ops = access::read_operations(client, address, len, on_done)?;
        self.engine.queue_all(ops);
        Ok(())
    }

    fn write(
        &mut self,
        address: u32,
        data: &[u8],
        client: ClientId,
        on_done: ReportFn,
    ) -> Result<()> {
        let ops = access::write_operations(client, address, data, on_done)?;
        self.engine.queue_all(ops);
        Ok(())
    }

    fn update(&mut self) -> Result<Status> {
        let now = self.clock.now();
        self.engine.update(&mut self.port, now)
    }

    fn free(&mut self) {
        debug!("Freeing serial backend");
        self.engine.abort_all();
    }
}
