// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Simulated target and host-side plumbing shared by the integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;
use std::pin::pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use dbglink::access::{AccessReport, ReportFn};
use dbglink::backend::{Backend, SerialBackend, Status};
use dbglink::engine::LinkConfig;
use dbglink::io::{Clock, SerialIo};
use dbglink::mux::{Mux, Stream};
use dbglink::packet::{Opcode, Packet, PacketAssembler, PacketSink};
use dbglink::{Error, Result};

/// Collects everything written to it.
#[derive(Default)]
struct Bytes(Vec<u8>);

impl SerialIo for Bytes {
    type Error = ();

    fn read(&mut self, _buf: &mut [u8]) -> core::result::Result<usize, ()> {
        Ok(0)
    }

    fn write(&mut self, data: &[u8]) -> core::result::Result<(), ()> {
        self.0.extend_from_slice(data);
        Ok(())
    }
}

/// Hardware model of the target's debug module, console and memory.
pub struct Target {
    mux: Mux,
    assembler: PacketAssembler,
    to_host: VecDeque<u8>,

    memory: BTreeMap<u32, u8>,
    faults: Vec<(Range<u32>, u32)>,
    page: u32,
    prepared: Option<(u32, [u8; 4], u8)>,

    /// Application bytes received from the host
    pub app_rx: Vec<u8>,
    /// Opcodes of every command received, in order, including repeats
    pub commands: Vec<Opcode>,
    /// Ignore the next N commands entirely
    pub drop_commands: usize,
    /// Execute the next N commands but lose their replies
    pub drop_replies: usize,
    /// Execute the next N commands but flip a bit in each reply on the wire
    pub corrupt_replies: usize,
    /// Never reply
    pub silent: bool,
}

impl Target {
    pub fn new() -> Self {
        Self {
            mux: Mux::new(0),
            assembler: PacketAssembler::new(),
            to_host: VecDeque::new(),
            memory: BTreeMap::new(),
            faults: Vec::new(),
            page: 0,
            prepared: None,
            app_rx: Vec::new(),
            commands: Vec::new(),
            drop_commands: 0,
            drop_replies: 0,
            corrupt_replies: 0,
            silent: false,
        }
    }

    pub fn load(&mut self, address: u32, data: &[u8]) {
        for (ii, &byte) in data.iter().enumerate() {
            self.memory.insert(address + ii as u32, byte);
        }
    }

    pub fn peek(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len as u32).map(|ii| self.byte(address + ii)).collect()
    }

    /// Volatile accesses to words in `range` fault with `code`.
    pub fn add_fault(&mut self, range: Range<u32>, code: u32) {
        self.faults.push((range, code));
    }

    /// Queue console output for the host.
    pub fn send_app(&mut self, data: &[u8]) {
        for &byte in data {
            self.mux.send(Stream::App, byte);
        }
        self.flush();
    }

    fn byte(&self, address: u32) -> u8 {
        self.memory.get(&address).copied().unwrap_or(0)
    }

    fn fault_at(&self, address: u32) -> Option<u32> {
        self.faults
            .iter()
            .find(|(range, _)| range.contains(&address))
            .map(|(_, code)| *code)
    }

    fn receive(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let n = self.mux.ingest(data);
            data = &data[n..];
            self.process();
        }
    }

    fn process(&mut self) {
        while let Some(byte) = self.mux.receive_app() {
            self.app_rx.push(byte);
        }
        while let Some(symbol) = self.mux.receive_debug() {
            if let Some(Ok(packet)) = self.assembler.push(symbol) {
                self.handle(&packet);
            }
        }
        self.flush();
    }

    fn flush(&mut self) {
        let mut out = Bytes::default();
        self.mux.flush(&mut out).unwrap();
        self.to_host.extend(out.0);
    }

    fn handle(&mut self, rx: &Packet) {
        if self.drop_commands > 0 {
            self.drop_commands -= 1;
            return;
        }
        let Some(opcode) = rx.opcode() else {
            return;
        };
        self.commands.push(opcode);

        let data = rx.data();
        let reply: Vec<u8> = match opcode {
            Opcode::SetPage => {
                self.page = u32::from_be_bytes([data[0], data[1], data[2] & 0xF0, 0]);
                Vec::new()
            }
            Opcode::BulkWrite => {
                let address = self.page + data[0] as u32 * 28;
                self.load(address, &data[1..]);
                Vec::new()
            }
            Opcode::BulkRead => {
                let address = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                let words = data[4].wrapping_sub(address as u8) as usize / 4;
                self.peek(address, words * 4)
            }
            Opcode::VolatilePrepare => {
                let address = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                self.prepared = Some((address, [data[4], data[5], data[6], data[7]], data[8]));
                Vec::new()
            }
            Opcode::VolatileExecute => {
                let (address, lanes, flags) = self.prepared.unwrap_or((0, [0; 4], 0));
                match self.fault_at(address) {
                    Some(code) => {
                        let mut reply = code.to_be_bytes().to_vec();
                        reply.push(1);
                        reply
                    }
                    None => {
                        if flags & 0x08 != 0 {
                            let mask = flags >> 4;
                            for lane in 0..4 {
                                if mask & (8 >> lane) != 0 {
                                    self.memory.insert(address + lane as u32, lanes[lane]);
                                }
                            }
                        }
                        let mut reply = self.peek(address, 4);
                        reply.push(0);
                        reply
                    }
                }
            }
        };

        if self.silent {
            return;
        }
        if self.drop_replies > 0 {
            self.drop_replies -= 1;
            return;
        }
        let reply = Packet::from_parts(rx.command(), &reply).unwrap();
        if self.corrupt_replies > 0 {
            self.corrupt_replies -= 1;
            let mut bytes: Vec<u8> = reply.encode().collect();
            bytes[1] ^= 0x10;
            for byte in bytes {
                self.mux.send(Stream::Debug, byte);
            }
            self.mux.end_packet(0);
            return;
        }
        self.mux.transmit(&reply);
    }
}

/// Host end of the wire, connected straight to a [`Target`].
pub struct SimPort {
    pub target: Target,
    pub broken: bool,
}

impl SimPort {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            broken: false,
        }
    }
}

impl SerialIo for SimPort {
    type Error = &'static str;

    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Self::Error> {
        if self.broken {
            return Err("port closed");
        }
        let mut n = 0;
        while n < buf.len() {
            let Some(byte) = self.target.to_host.pop_front() else {
                break;
            };
            buf[n] = byte;
            n += 1;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> core::result::Result<(), Self::Error> {
        if self.broken {
            return Err("port closed");
        }
        self.target.receive(data);
        Ok(())
    }
}

/// Clock advanced by hand.
#[derive(Clone, Default)]
pub struct ManualClock(Rc<Cell<Duration>>);

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        self.0.set(self.0.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.0.get()
    }
}

/// Clock that moves forward 1ms every time it is read.
#[derive(Default)]
pub struct StepClock(Cell<Duration>);

impl Clock for StepClock {
    fn now(&self) -> Duration {
        let now = self.0.get() + Duration::from_millis(1);
        self.0.set(now);
        now
    }
}

pub type SimBackend = SerialBackend<SimPort, ManualClock>;

pub fn backend(config: &LinkConfig) -> (SimBackend, ManualClock) {
    let clock = ManualClock::default();
    let backend = SerialBackend::new(SimPort::new(Target::new()), clock.clone(), config);
    (backend, clock)
}

pub fn target(backend: &mut SimBackend) -> &mut Target {
    &mut backend.port_mut().target
}

/// Call `update()` until idle, advancing the clock `step` per call.
pub fn run(backend: &mut impl Backend, clock: &ManualClock, step: Duration) -> Result<()> {
    for _ in 0..10_000 {
        if backend.update()? == Status::Idle {
            return Ok(());
        }
        clock.advance(step);
    }
    panic!("backend never went idle");
}

/// Reports delivered so far.
#[derive(Clone, Default)]
pub struct Reports(Rc<RefCell<Vec<AccessReport>>>);

impl Reports {
    pub fn callback(&self) -> ReportFn {
        let reports = self.0.clone();
        Box::new(move |report: AccessReport| reports.borrow_mut().push(report))
    }

    pub fn take(&self) -> Vec<AccessReport> {
        std::mem::take(&mut *self.0.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }
}

pub fn read(backend: &mut impl Backend, address: u32, len: usize, reports: &Reports) {
    backend.read(address, len, 0, reports.callback()).unwrap();
}

pub fn write(backend: &mut impl Backend, address: u32, data: &[u8], reports: &Reports) {
    backend.write(address, data, 0, reports.callback()).unwrap();
}

/// Poll a future to completion.  The futures under test never wait on
/// external wakeups, so busy polling is enough.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    let mut fut = pin!(fut);
    let mut cx = Context::from_waker(Waker::noop());
    loop {
        if let Poll::Ready(output) = fut.as_mut().poll(&mut cx) {
            return output;
        }
    }
}

/// Expect `result` to be the retry exhaustion error.
pub fn assert_exhausted(result: Result<()>) {
    assert_eq!(result, Err(Error::RetriesExhausted));
}
