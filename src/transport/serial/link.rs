use core::cell::RefCell;

use critical_section::Mutex;
use embedded_hal::delay::DelayNs;
use embedded_io::{Error as _, ErrorKind};
use heapless::Deque;

use crate::transport::{
    LinkError,
    config::{SERIAL_RX_CAPACITY, SerialConfig},
    event::{EventMask, LinkEvent, Observer},
    hal::SerialDriver,
    link::{LinkCore, ModuleLink},
    queue::{Direction, Notify, Payload, Transfer, TransferCallback},
    serial::frame::{self, ErrorCode, FrameDecoder, Inbound, request},
};

struct SerialWire<S> {
    driver: S,
    rx: Deque<u8, SERIAL_RX_CAPACITY>,
    decoder: FrameDecoder,
    /// A request is out and its response has not arrived yet.
    awaiting: bool,
    ticks_left: u16,
    /// Reported from interrupt context, handled by the foreground.
    fault: Option<LinkError>,
    last_error: Option<ErrorCode>,
}

/// Link to one device on a dedicated UART.
///
/// One request is on the line at a time. Responses, acknowledgements and
/// unsolicited device messages are decoded in [`ModuleLink::loop_tasks`] (or
/// while a synchronous call polls) from the bytes the receive interrupt hands
/// to [`SerialLink::on_receive`].
///
/// # Type Parameters
/// - `S`: UART driver
/// - `D`: Delay used while a synchronous call polls
/// - `N`: Register table storage in bytes
pub struct SerialLink<S, D, const N: usize = 64>
where
    S: SerialDriver,
    D: DelayNs,
{
    core: LinkCore<N>,
    config: SerialConfig,
    wire: Mutex<RefCell<SerialWire<S>>>,
    delay: RefCell<D>,
}

impl<S, D, const N: usize> SerialLink<S, D, N>
where
    S: SerialDriver,
    D: DelayNs,
{
    pub fn new(driver: S, sizes: &[u16], delay: D, config: SerialConfig) -> Result<Self, LinkError> {
        Ok(Self {
            core: LinkCore::new(sizes, config.retries)?,
            config,
            wire: Mutex::new(RefCell::new(SerialWire {
                driver,
                rx: Deque::new(),
                decoder: FrameDecoder::new(),
                awaiting: false,
                ticks_left: 0,
                fault: None,
                last_error: None,
            })),
            delay: RefCell::new(delay),
        })
    }

    fn with_wire<R>(&self, f: impl FnOnce(&mut SerialWire<S>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.wire.borrow_ref_mut(cs)))
    }

    /// Arms reception.
    pub fn init(&self) -> Result<(), LinkError> {
        self.with_wire(|w| w.driver.start_receive())
            .map_err(|e| LinkError::Serial(e.kind()))
    }

    pub fn core(&self) -> &LinkCore<N> {
        &self.core
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    pub fn with_driver<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        self.with_wire(|w| f(&mut w.driver))
    }

    /// Receive interrupt entry point.
    pub fn on_receive(&self, chunk: &[u8]) {
        self.with_wire(|w| {
            for &byte in chunk {
                if w.rx.push_back(byte).is_err() {
                    w.fault
                        .get_or_insert(LinkError::Serial(ErrorKind::OutOfMemory));
                    break;
                }
            }
        });
    }

    /// UART error interrupt entry point. The link is reset from the foreground.
    pub fn on_error(&self, kind: ErrorKind) {
        self.with_wire(|w| w.fault = Some(LinkError::Serial(kind)));
    }

    /// Error code behind the `ERROR` event currently being delivered.
    ///
    /// `None` outside of `ERROR` observers.
    pub fn last_error(&self) -> Option<ErrorCode> {
        self.with_wire(|w| w.last_error)
    }

    fn submit(&self, transfer: Transfer) -> Result<(), LinkError> {
        self.core.enqueue(transfer)?;
        self.start_next();
        Ok(())
    }

    /// Sends the head request unless one is already out.
    fn start_next(&self) {
        let idle = self.with_wire(|w| !w.awaiting && !w.driver.is_transmitting());
        if !idle {
            return;
        }
        let Some(transfer) = self.core.begin() else {
            return;
        };

        let use_crc = self.config.use_crc;
        let ticks = self.config.command_timeout_ticks;
        let encoded = match transfer.wire_direction() {
            Direction::Read => frame::encode(request::READ, transfer.register(), &[], use_crc),
            Direction::Write => frame::encode(
                request::WRITE,
                transfer.register(),
                transfer.data(),
                use_crc,
            ),
        };
        let sent = encoded.and_then(|encoded| {
            self.with_wire(|w| {
                w.driver
                    .start_transmit(&encoded)
                    .map_err(|e| LinkError::Serial(e.kind()))?;
                w.awaiting = true;
                w.ticks_left = ticks;
                Ok(())
            })
        });
        if let Err(err) = sent {
            log::warn!("request for reg {:#04x} not sent: {}", transfer.register(), err);
            self.reset_link();
            self.core.finish(Err(err));
        }
    }

    fn take_awaiting(&self) -> bool {
        self.with_wire(|w| core::mem::replace(&mut w.awaiting, false))
    }

    /// Decodes buffered bytes, one frame per critical section.
    fn process_received(&self) {
        let use_crc = self.config.use_crc;
        loop {
            let next = self.with_wire(|w| {
                while let Some(byte) = w.rx.pop_front() {
                    if let Some(body) = w.decoder.push(byte) {
                        return Some(body);
                    }
                }
                None
            });
            let Some(body) = next else {
                break;
            };
            match body.and_then(|body| frame::parse(&body, use_crc)) {
                Ok(inbound) => self.on_inbound(inbound),
                Err(LinkError::Checksum) => self.report_error(ErrorCode::LocalCrc, LinkError::Checksum),
                Err(err) => self.report_error(ErrorCode::LocalFormat, err),
            }
        }
    }

    fn on_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::ReadData { register, data } => {
                self.complete_response(register, Direction::Read, &data)
            }
            Inbound::WriteAck { register } => {
                self.complete_response(register, Direction::Write, &[])
            }
            Inbound::Change { register, data } => {
                self.core
                    .register_changed(register, &[data.len() as u16], &data)
            }
            Inbound::DeviceReset => {
                self.core.device_reset(0);
                if self.take_awaiting() {
                    self.core.finish(Err(LinkError::BusReset));
                }
            }
            Inbound::Error(code) => self.report_error(code, LinkError::Remote(code)),
        }
    }

    fn complete_response(&self, register: u8, direction: Direction, data: &[u8]) {
        let awaiting = self.with_wire(|w| w.awaiting);
        let active = self
            .core
            .active()
            .filter(|t| awaiting && t.register() == register && t.wire_direction() == direction);
        let Some(active) = active else {
            match direction {
                // unsolicited data is still the device's current value
                Direction::Read => {
                    self.core
                        .register_changed(register, &[data.len() as u16], data)
                }
                Direction::Write => log::debug!("unexpected write ack for {:#04x}", register),
            }
            return;
        };

        self.take_awaiting();
        if direction == Direction::Read && data.len() != active.len() {
            self.core.finish(Err(LinkError::Format));
        } else {
            self.core.finish(Ok(data));
        }
    }

    /// Publishes `code` through an `ERROR` event, then fails the request on
    /// the line, if any, with `error`.
    fn report_error(&self, code: ErrorCode, error: LinkError) {
        log::warn!("serial error {:?} ({:#06x})", code, code.raw());
        self.with_wire(|w| w.last_error = Some(code));
        self.core.emit(
            &LinkEvent::new(EventMask::ERROR)
                .with_value(u32::from(code.raw()))
                .with_error(error),
        );
        self.with_wire(|w| w.last_error = None);

        if self.take_awaiting() {
            self.core.finish(Err(error));
        }
    }

    /// Aborts the line, drops buffered bytes and re-arms reception.
    /// Returns whether a request was waiting for its response.
    fn reset_link(&self) -> bool {
        let (was_awaiting, restarted) = self.with_wire(|w| {
            w.driver.abort();
            w.rx.clear();
            w.decoder.reset();
            let was_awaiting = core::mem::replace(&mut w.awaiting, false);
            (was_awaiting, w.driver.start_receive().map_err(|e| e.kind()))
        });
        if let Err(kind) = restarted {
            log::error!("failed to re-arm serial reception: {:?}", kind);
        }
        was_awaiting
    }

    fn handle_fault(&self) {
        let Some(fault) = self.with_wire(|w| w.fault.take()) else {
            return;
        };
        log::warn!("serial line fault: {}", fault);
        self.core
            .emit(&LinkEvent::new(EventMask::ERROR).with_error(fault));
        if self.reset_link() {
            self.core.finish(Err(fault));
        }
    }

    fn tick_command_timeout(&self) {
        let expired = self.with_wire(|w| {
            if !w.awaiting {
                return false;
            }
            w.ticks_left = w.ticks_left.saturating_sub(1);
            w.ticks_left == 0
        });
        if expired {
            log::warn!("serial request timed out");
            self.reset_link();
            self.core.force_fail(LinkError::Timeout);
        }
    }

    /// Queues `transfer` and polls the line until it completes.
    fn run_blocking(&self, transfer: Transfer) -> Result<Transfer, LinkError> {
        let seq = self
            .core
            .enqueue(transfer.with_notify(Notify::Blocking))?;

        let mut waited = 0;
        loop {
            self.handle_fault();
            self.start_next();
            self.process_received();
            if let Some(done) = self.core.take_completed(seq) {
                return match done.error {
                    Some(err) => Err(err),
                    None => Ok(done),
                };
            }
            if waited >= self.config.blocking_timeout_ms {
                break;
            }
            self.delay.borrow_mut().delay_ms(1);
            waited += 1;
        }

        log::warn!("blocking request {} timed out", seq);
        if self.core.is_active_seq(seq) {
            self.reset_link();
            self.core.force_fail(LinkError::Timeout);
        }
        self.core.orphan(seq);
        Err(LinkError::Timeout)
    }
}

impl<S, D, const N: usize> ModuleLink for SerialLink<S, D, N>
where
    S: SerialDriver,
    D: DelayNs,
{
    fn register_size(&self, addr: u8) -> usize {
        self.core.register_size(addr)
    }

    fn read_register(&self, addr: u8) -> Result<Payload, LinkError> {
        let sizes = self.core.with_registers(|r| r.burst_sizes(addr, 1))?;
        self.run_blocking(Transfer::read(addr, &sizes)?)
            .map(|done| done.data)
    }

    fn write_register(&self, addr: u8, data: &[u8]) -> Result<(), LinkError> {
        let sizes = self.core.with_registers(|r| r.burst_sizes(addr, 1))?;
        self.run_blocking(Transfer::write(addr, &sizes, data)?)
            .map(|_| ())
    }

    fn read_register_async(
        &self,
        addr: u8,
        callback: Option<TransferCallback>,
    ) -> Result<(), LinkError> {
        let sizes = self.core.with_registers(|r| r.burst_sizes(addr, 1))?;
        self.submit(Transfer::read(addr, &sizes)?.with_callback(callback))
    }

    fn write_register_async(
        &self,
        addr: u8,
        data: &[u8],
        callback: Option<TransferCallback>,
    ) -> Result<(), LinkError> {
        let sizes = self.core.with_registers(|r| r.burst_sizes(addr, 1))?;
        self.submit(Transfer::write(addr, &sizes, data)?.with_callback(callback))
    }

    fn write_and_verify_async(
        &self,
        addr: u8,
        data: &[u8],
        callback: Option<TransferCallback>,
    ) -> Result<(), LinkError> {
        let sizes = self.core.with_registers(|r| r.burst_sizes(addr, 1))?;
        self.submit(
            Transfer::write(addr, &sizes, data)?
                .verified()
                .with_callback(callback),
        )
    }

    fn on_event(&self, mask: EventMask, observer: Observer, id: u16) -> Result<(), LinkError> {
        self.core.on_event(mask, observer, id)
    }

    fn remove_observer(&self, id: u16) -> bool {
        self.core.remove_observer(id)
    }

    fn loop_tasks(&self) {
        self.handle_fault();
        self.process_received();
        self.tick_command_timeout();
        self.core.drain_completed(|op, done| {
            log::debug!("no handler for {:?} on reg {:#04x}", op, done.register())
        });
        self.start_next();
    }
}
