//! Test support utilities - only compiled in test builds.

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    convert::Infallible,
    vec::Vec,
};

use embedded_hal::{
    delay::DelayNs,
    digital::{ErrorType, InputPin, OutputPin},
    i2c::ErrorKind,
};

use crate::transport::{
    LinkError,
    arbiter::BusArbiter,
    bus::frame::{decode_write, encode_read_response},
    event::{EventMask, LinkEvent, ObserverError},
    hal::{BusDriver, SerialDriver},
    queue::{Direction, TransferOutcome},
    regs::RegisterTable,
};

/// Standard test configuration: 64 bytes of register storage.
pub type TestTable = RegisterTable<64>;

pub type TestArbiter<'a> = BusArbiter<'a, MockBus, MockPin, MockDelay>;

/// Register map used across tests (32 bytes in total).
///
/// | addr | size |     | addr | size |
/// |------|------|-----|------|------|
/// | 0x00 | 1    |     | 0x20 | 1    |
/// | 0x01 | 2    |     | 0x21 | 2    |
/// | 0x02 | 4    |     | 0x22 | 1    |
/// | 0x03 | 3    |     | 0x23 | 4    |
/// | 0x04 | 8    |     | 0x30 | 2    |
/// | 0x10 | 1    |     | 0x31 | 2    |
/// | 0x11 | 1    |     |      |      |
pub fn test_sizes() -> [u16; 256] {
    let mut sizes = [0u16; 256];
    for (addr, size) in [
        (0x00, 1),
        (0x01, 2),
        (0x02, 4),
        (0x03, 3),
        (0x04, 8),
        (0x10, 1),
        (0x11, 1),
        (0x20, 1),
        (0x21, 2),
        (0x22, 1),
        (0x23, 4),
        (0x30, 2),
        (0x31, 2),
    ] {
        sizes[addr] = size;
    }
    sizes
}

/// Owned copy of a delivered [`LinkEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub kind: EventMask,
    pub register: Option<u8>,
    pub value: u32,
    pub data: Vec<u8>,
    pub error: Option<LinkError>,
}

/// Owned copy of a [`TransferOutcome`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOutcome {
    pub success: bool,
    pub register: u8,
    pub value: u32,
    pub length: usize,
    pub data: Vec<u8>,
    pub error: Option<LinkError>,
}

thread_local! {
    static EVENTS: RefCell<Vec<RecordedEvent>> = const { RefCell::new(Vec::new()) };
    static OUTCOMES: RefCell<Vec<RecordedOutcome>> = const { RefCell::new(Vec::new()) };
}

/// Observer that records every event on the current test thread.
pub fn record_event(event: &LinkEvent<'_>) -> Result<(), ObserverError> {
    EVENTS.with(|events| {
        events.borrow_mut().push(RecordedEvent {
            kind: event.kind,
            register: event.register,
            value: event.value,
            data: event.data.to_vec(),
            error: event.error,
        })
    });
    Ok(())
}

pub fn take_events() -> Vec<RecordedEvent> {
    EVENTS.with(|events| core::mem::take(&mut *events.borrow_mut()))
}

pub fn failing_observer(_: &LinkEvent<'_>) -> Result<(), ObserverError> {
    Err(ObserverError)
}

/// Completion callback that records every outcome on the current test thread.
pub fn record_outcome(outcome: &TransferOutcome<'_>) {
    OUTCOMES.with(|outcomes| {
        outcomes.borrow_mut().push(RecordedOutcome {
            success: outcome.success,
            register: outcome.register,
            value: outcome.value,
            length: outcome.length,
            data: outcome.data.to_vec(),
            error: outcome.error,
        })
    });
}

pub fn take_outcomes() -> Vec<RecordedOutcome> {
    OUTCOMES.with(|outcomes| core::mem::take(&mut *outcomes.borrow_mut()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    BlockingRead,
    BlockingWrite,
}

/// One hardware operation seen by [`MockBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusOp {
    pub kind: OpKind,
    pub device: u8,
    pub register: u8,
    /// Wire length.
    pub len: usize,
    /// Wire bytes of a write.
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockBusError(pub ErrorKind);

impl embedded_hal::i2c::Error for MockBusError {
    fn kind(&self) -> ErrorKind {
        self.0
    }
}

/// Simulated bus with register-addressed devices behind it.
///
/// Devices decode written frames with the register map in `sizes` and
/// answer reads from `memory` (zeros for registers never written).
/// Non-blocking operations stay in flight until [`MockBus::finish_in_flight`].
pub struct MockBus {
    pub ops: Vec<BusOp>,
    pub memory: BTreeMap<(u8, u8), Vec<u8>>,
    pub sizes: [u16; 256],
    pub use_crc: bool,
    /// Raw wire responses served before anything from `memory`.
    pub replies: VecDeque<Vec<u8>>,
    /// Number of upcoming read responses to corrupt.
    pub corrupt_reads: usize,
    pub fail_starts: bool,
    pub fail_blocking: bool,
    pub peripheral_busy: bool,
    pub in_flight: Option<Direction>,
    /// Operations started while another one was in flight.
    pub overlaps: usize,
    pub inits: usize,
    pub deinits: usize,
    rx: Vec<u8>,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            memory: BTreeMap::new(),
            sizes: test_sizes(),
            use_crc: true,
            replies: VecDeque::new(),
            corrupt_reads: 0,
            fail_starts: false,
            fail_blocking: false,
            peripheral_busy: false,
            in_flight: None,
            overlaps: 0,
            inits: 0,
            deinits: 0,
            rx: Vec::new(),
        }
    }

    /// Completes the in-flight operation, returning its direction.
    pub fn finish_in_flight(&mut self) -> Option<Direction> {
        self.in_flight.take()
    }

    /// Sizes of the registers a wire of `wire_len` bytes starting at `register` spans.
    fn burst(&self, register: u8, wire_len: usize) -> Vec<u16> {
        let mut sizes = Vec::new();
        let mut len = 0;
        let mut reg = register as usize;
        while len < wire_len && reg < self.sizes.len() && self.sizes[reg] != 0 {
            sizes.push(self.sizes[reg]);
            len += self.sizes[reg] as usize + usize::from(self.use_crc);
            reg += 1;
        }
        sizes
    }

    fn store(&mut self, device: u8, register: u8, wire: &[u8]) {
        let sizes = self.burst(register, wire.len());
        let Ok(payload) = decode_write(device, register, &sizes, wire, self.use_crc) else {
            return;
        };
        let mut offset = 0;
        for (i, &size) in sizes.iter().enumerate() {
            let end = offset + size as usize;
            self.memory
                .insert((device, register.wrapping_add(i as u8)), payload[offset..end].to_vec());
            offset = end;
        }
    }

    fn response(&mut self, device: u8, register: u8, len: usize) -> Vec<u8> {
        let mut wire = match self.replies.pop_front() {
            Some(reply) => reply,
            None => {
                let sizes = self.burst(register, len);
                let mut payload = Vec::new();
                for (i, &size) in sizes.iter().enumerate() {
                    match self.memory.get(&(device, register.wrapping_add(i as u8))) {
                        Some(bytes) => payload.extend_from_slice(bytes),
                        None => payload.resize(payload.len() + size as usize, 0),
                    }
                }
                encode_read_response(device, register, &sizes, &payload, self.use_crc)
                    .map(|w| w.to_vec())
                    .unwrap_or_else(|_| std::vec![0; len])
            }
        };
        if self.corrupt_reads > 0 {
            self.corrupt_reads -= 1;
            if let Some(last) = wire.last_mut() {
                *last ^= 0x01;
            }
        }
        wire
    }

    fn record(&mut self, kind: OpKind, device: u8, register: u8, len: usize, bytes: &[u8]) {
        self.ops.push(BusOp {
            kind,
            device,
            register,
            len,
            bytes: bytes.to_vec(),
        });
    }

    /// Operations of `kind`, in order.
    pub fn ops_of(&self, kind: OpKind) -> Vec<&BusOp> {
        self.ops.iter().filter(|op| op.kind == kind).collect()
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusDriver for MockBus {
    type Error = MockBusError;

    fn init(&mut self) -> Result<(), Self::Error> {
        self.inits += 1;
        Ok(())
    }

    fn deinit(&mut self) {
        self.deinits += 1;
        self.in_flight = None;
    }

    fn is_peripheral_busy(&mut self) -> bool {
        self.peripheral_busy
    }

    fn read(&mut self, device: u8, register: u8, buf: &mut [u8], _timeout_ms: u32) -> Result<(), Self::Error> {
        self.record(OpKind::BlockingRead, device, register, buf.len(), &[]);
        if self.fail_blocking {
            return Err(MockBusError(ErrorKind::Bus));
        }
        let wire = self.response(device, register, buf.len());
        for (dst, src) in buf.iter_mut().zip(wire) {
            *dst = src;
        }
        Ok(())
    }

    fn write(&mut self, device: u8, register: u8, data: &[u8], _timeout_ms: u32) -> Result<(), Self::Error> {
        self.record(OpKind::BlockingWrite, device, register, data.len(), data);
        if self.fail_blocking {
            return Err(MockBusError(ErrorKind::Bus));
        }
        self.store(device, register, data);
        Ok(())
    }

    fn start_read(&mut self, device: u8, register: u8, len: usize) -> Result<(), Self::Error> {
        if self.in_flight.is_some() {
            self.overlaps += 1;
        }
        self.record(OpKind::Read, device, register, len, &[]);
        if self.fail_starts {
            return Err(MockBusError(ErrorKind::ArbitrationLoss));
        }
        self.rx = self.response(device, register, len);
        self.in_flight = Some(Direction::Read);
        Ok(())
    }

    fn start_write(&mut self, device: u8, register: u8, data: &[u8]) -> Result<(), Self::Error> {
        if self.in_flight.is_some() {
            self.overlaps += 1;
        }
        self.record(OpKind::Write, device, register, data.len(), data);
        if self.fail_starts {
            return Err(MockBusError(ErrorKind::ArbitrationLoss));
        }
        self.store(device, register, data);
        self.in_flight = Some(Direction::Write);
        Ok(())
    }

    fn received(&self) -> &[u8] {
        &self.rx
    }
}

/// Completes in-flight bus operations until the arbiter goes idle.
/// Returns the number of completions delivered.
pub fn pump(arbiter: &TestArbiter<'_>) -> usize {
    let mut count = 0;
    while let Some(kind) = arbiter.with_driver(|d| d.finish_in_flight()).flatten() {
        arbiter.on_transfer_complete(kind);
        count += 1;
    }
    count
}

/// Output pin recording every level it was driven to; input pin reading `low`.
#[derive(Debug, Default)]
pub struct MockPin {
    /// `true` for high.
    pub levels: Vec<bool>,
    pub low: bool,
}

impl ErrorType for MockPin {
    type Error = Infallible;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.levels.push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.levels.push(true);
        Ok(())
    }
}

impl InputPin for MockPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.low)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(self.low)
    }
}

/// Delay that only accumulates the requested time.
#[derive(Debug, Default)]
pub struct MockDelay {
    pub elapsed_ns: u64,
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns += u64::from(ns);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockSerialError;

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::Other
    }
}

/// UART recording transmitted frames.
#[derive(Debug, Default)]
pub struct MockSerial {
    pub sent: Vec<Vec<u8>>,
    pub aborts: usize,
    pub receives_started: usize,
    pub fail_transmit: bool,
    pub transmitting: bool,
}

impl SerialDriver for MockSerial {
    type Error = MockSerialError;

    fn start_transmit(&mut self, frame: &[u8]) -> Result<(), Self::Error> {
        if self.fail_transmit {
            return Err(MockSerialError);
        }
        self.sent.push(frame.to_vec());
        Ok(())
    }

    fn is_transmitting(&mut self) -> bool {
        self.transmitting
    }

    fn start_receive(&mut self) -> Result<(), Self::Error> {
        self.receives_started += 1;
        Ok(())
    }

    fn abort(&mut self) {
        self.aborts += 1;
    }
}
