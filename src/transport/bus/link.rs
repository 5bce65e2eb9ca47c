use core::cell::RefCell;

use critical_section::Mutex;
use embedded_hal::delay::DelayNs;

use crate::transport::{
    LinkError,
    arbiter::{BusClient, ClientToken, SharedBus},
    bus::frame,
    config::{BUS_WIRE_CAPACITY, BusLinkConfig},
    event::{EventMask, LinkEvent, Observer},
    link::{LinkCore, ModuleLink},
    overlay::InterruptOverlay,
    queue::{Direction, Payload, Transfer, TransferCallback},
};

pub(crate) struct WireState {
    pub(crate) token: Option<ClientToken>,
    /// An operation of this link is on the bus.
    pub(crate) outstanding: bool,
    pub(crate) overlay: Option<InterruptOverlay>,
}

/// Link to one device on a shared bus.
///
/// The link must be attached to the bus it was created with before any
/// asynchronous transfer is submitted:
///
/// ```ignore
/// let arbiter = BusArbiter::new(driver, reset_pin, delay, BusConfig::new());
/// let dsp = BusLink::new(&arbiter, 0x34, &DSP_SIZES, delay, BusLinkConfig::new())?;
/// arbiter.attach(&dsp)?;
/// ```
///
/// # Type Parameters
/// - `D`: Delay used while a synchronous call waits for the bus
/// - `N`: Register table storage in bytes
pub struct BusLink<'a, D, const N: usize = 64>
where
    D: DelayNs,
{
    bus: &'a dyn SharedBus,
    device: u8,
    config: BusLinkConfig,
    pub(crate) core: LinkCore<N>,
    wire: Mutex<RefCell<WireState>>,
    delay: RefCell<D>,
}

impl<'a, D, const N: usize> BusLink<'a, D, N>
where
    D: DelayNs,
{
    /// Creates a link to the device at 7-bit address `device`.
    ///
    /// # Errors
    /// * [`LinkError::MalformedSizeTable`] - `sizes` is not 256 entries or
    ///   does not fit `N` bytes
    pub fn new(
        bus: &'a dyn SharedBus,
        device: u8,
        sizes: &[u16],
        delay: D,
        config: BusLinkConfig,
    ) -> Result<Self, LinkError> {
        Ok(Self {
            bus,
            device,
            config,
            core: LinkCore::new(sizes, config.retries)?,
            wire: Mutex::new(RefCell::new(WireState {
                token: None,
                outstanding: false,
                overlay: None,
            })),
            delay: RefCell::new(delay),
        })
    }

    pub(crate) fn with_wire<R>(&self, f: impl FnOnce(&mut WireState) -> R) -> R {
        critical_section::with(|cs| f(&mut self.wire.borrow_ref_mut(cs)))
    }

    pub(crate) fn bus(&self) -> &'a dyn SharedBus {
        self.bus
    }

    pub fn device(&self) -> u8 {
        self.device
    }

    pub fn config(&self) -> &BusLinkConfig {
        &self.config
    }

    /// Register table, queue and observers of this link.
    pub fn core(&self) -> &LinkCore<N> {
        &self.core
    }

    pub fn is_attached(&self) -> bool {
        self.with_wire(|w| w.token.is_some())
    }

    /// Synchronously reads `count` consecutive registers in one transaction.
    pub fn read_registers(&self, first: u8, count: usize) -> Result<Payload, LinkError> {
        let sizes = self.core.with_registers(|r| r.burst_sizes(first, count))?;
        self.run_blocking(&Transfer::read(first, &sizes)?)
    }

    /// Synchronously writes `count` consecutive registers in one transaction.
    ///
    /// # Errors
    /// * [`LinkError::SizeMismatch`] - `data` does not cover the registers exactly
    pub fn write_registers(&self, first: u8, count: usize, data: &[u8]) -> Result<(), LinkError> {
        let sizes = self.core.with_registers(|r| r.burst_sizes(first, count))?;
        self.run_blocking(&Transfer::write(first, &sizes, data)?)
            .map(|_| ())
    }

    pub fn read_registers_async(
        &self,
        first: u8,
        count: usize,
        callback: Option<TransferCallback>,
    ) -> Result<(), LinkError> {
        let sizes = self.core.with_registers(|r| r.burst_sizes(first, count))?;
        self.submit(Transfer::read(first, &sizes)?.with_callback(callback))
    }

    pub fn write_registers_async(
        &self,
        first: u8,
        count: usize,
        data: &[u8],
        callback: Option<TransferCallback>,
    ) -> Result<(), LinkError> {
        let sizes = self.core.with_registers(|r| r.burst_sizes(first, count))?;
        self.submit(Transfer::write(first, &sizes, data)?.with_callback(callback))
    }

    /// Queues `transfer` and kicks the bus.
    pub(crate) fn submit(&self, transfer: Transfer) -> Result<(), LinkError> {
        if !self.is_attached() {
            return Err(LinkError::NotAttached);
        }
        self.core.enqueue(transfer)?;
        self.bus.start_next();
        Ok(())
    }

    fn run_blocking(&self, transfer: &Transfer) -> Result<Payload, LinkError> {
        let attempts = u16::from(self.config.retries) + 1;
        let mut last = LinkError::Timeout;

        for attempt in 1..=attempts {
            match self.attempt_blocking(transfer) {
                Ok(payload) => {
                    let stored = match transfer.direction {
                        Direction::Read => payload.as_slice(),
                        Direction::Write => transfer.data(),
                    };
                    self.core
                        .register_changed(transfer.register(), transfer.sizes(), stored);
                    return Ok(payload);
                }
                Err(err) if err.is_retryable() => {
                    log::debug!(
                        "dev {:#04x} reg {:#04x} attempt {} failed: {}",
                        self.device,
                        transfer.register(),
                        attempt,
                        err
                    );
                    last = err;
                }
                Err(err) => {
                    last = err;
                    break;
                }
            }
        }

        log::warn!(
            "dev {:#04x} reg {:#04x} failed: {}",
            self.device,
            transfer.register(),
            last
        );
        self.core.emit(
            &LinkEvent::new(EventMask::ERROR)
                .with_register(transfer.register())
                .with_error(last),
        );
        Err(last)
    }

    /// One blocking attempt, waiting in 1 ms steps while the bus is busy.
    fn attempt_blocking(&self, transfer: &Transfer) -> Result<Payload, LinkError> {
        let mut waited = 0;
        loop {
            let result = match transfer.direction {
                Direction::Read => self.read_once(transfer),
                Direction::Write => self.write_once(transfer),
            };
            match result {
                Err(LinkError::Busy) if waited < self.config.blocking_timeout_ms => {
                    self.delay.borrow_mut().delay_ms(1);
                    waited += 1;
                }
                Err(LinkError::Busy) => return Err(LinkError::Timeout),
                other => return other,
            }
        }
    }

    fn read_once(&self, transfer: &Transfer) -> Result<Payload, LinkError> {
        let use_crc = self.config.use_crc;
        let len = frame::read_len(transfer.sizes(), use_crc);
        let mut wire = [0u8; BUS_WIRE_CAPACITY];
        let buf = wire.get_mut(..len).ok_or(LinkError::TooLong)?;
        self.bus.read_blocking(self.device, transfer.register(), buf)?;
        frame::decode_read(self.device, transfer.register(), transfer.sizes(), buf, use_crc)
    }

    fn write_once(&self, transfer: &Transfer) -> Result<Payload, LinkError> {
        let wire = frame::encode_write(
            self.device,
            transfer.register(),
            transfer.sizes(),
            transfer.data(),
            self.config.use_crc,
        )?;
        self.bus
            .write_blocking(self.device, transfer.register(), &wire)?;
        Ok(Payload::new())
    }

    fn start_wire(&self, token: ClientToken, transfer: &Transfer) -> Result<(), LinkError> {
        let register = transfer.register();
        match transfer.wire_direction() {
            Direction::Read => {
                let len = frame::read_len(transfer.sizes(), self.config.use_crc);
                self.bus.begin_read(token, self.device, register, len)
            }
            Direction::Write => {
                let wire = frame::encode_write(
                    self.device,
                    register,
                    transfer.sizes(),
                    transfer.data(),
                    self.config.use_crc,
                )?;
                self.bus.begin_write(token, self.device, register, &wire)
            }
        }
    }
}

impl<D, const N: usize> BusClient for BusLink<'_, D, N>
where
    D: DelayNs,
{
    fn attached(&self, token: ClientToken) {
        self.with_wire(|w| w.token = Some(token));
    }

    fn detached(&self) {
        self.with_wire(|w| {
            w.token = None;
            w.outstanding = false;
        });
    }

    fn try_start(&self) -> bool {
        let Some(token) = self.with_wire(|w| if w.outstanding { None } else { w.token }) else {
            return false;
        };
        let Some(transfer) = self.core.begin() else {
            return false;
        };

        self.with_wire(|w| w.outstanding = true);
        match self.start_wire(token, &transfer) {
            Ok(()) => true,
            Err(LinkError::Busy) => {
                self.with_wire(|w| w.outstanding = false);
                self.core.abandon();
                false
            }
            Err(err) => {
                self.with_wire(|w| w.outstanding = false);
                log::warn!(
                    "dev {:#04x} failed to start transfer: {}",
                    self.device,
                    err
                );
                self.core.finish(Err(err));
                if matches!(err, LinkError::Bus(_)) {
                    self.bus.reset();
                }
                false
            }
        }
    }

    fn on_transfer_done(&self, result: Result<&[u8], LinkError>) {
        let was_outstanding = self.with_wire(|w| core::mem::replace(&mut w.outstanding, false));
        if !was_outstanding {
            log::debug!("dev {:#04x}: completion without transfer", self.device);
            return;
        }
        let Some(active) = self.core.active() else {
            return;
        };

        let decoded = match (result, active.wire_direction()) {
            (Ok(wire), Direction::Read) => frame::decode_read(
                self.device,
                active.register(),
                active.sizes(),
                wire,
                self.config.use_crc,
            ),
            (Ok(_), Direction::Write) => Ok(Payload::new()),
            (Err(err), _) => Err(err),
        };
        match decoded {
            Ok(payload) => self.core.finish(Ok(&payload)),
            Err(err) => self.core.finish(Err(err)),
        };
    }

    fn on_bus_reset(&self) {
        let was_outstanding = self.with_wire(|w| core::mem::replace(&mut w.outstanding, false));
        if was_outstanding && self.core.is_active() {
            self.core.abandon();
        }
    }
}

impl<D, const N: usize> ModuleLink for BusLink<'_, D, N>
where
    D: DelayNs,
{
    fn register_size(&self, addr: u8) -> usize {
        self.core.register_size(addr)
    }

    fn read_register(&self, addr: u8) -> Result<Payload, LinkError> {
        self.read_registers(addr, 1)
    }

    fn write_register(&self, addr: u8, data: &[u8]) -> Result<(), LinkError> {
        self.write_registers(addr, 1, data)
    }

    fn read_register_async(
        &self,
        addr: u8,
        callback: Option<TransferCallback>,
    ) -> Result<(), LinkError> {
        self.read_registers_async(addr, 1, callback)
    }

    fn write_register_async(
        &self,
        addr: u8,
        data: &[u8],
        callback: Option<TransferCallback>,
    ) -> Result<(), LinkError> {
        self.write_registers_async(addr, 1, data, callback)
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
        self.tick_interrupt_guard();
        self.core
            .drain_completed(|op, done| self.on_internal(op, done));
        self.bus.start_next();
    }
}

#[cfg(test)]
mod tests {
    use embedded_hal::i2c::ErrorKind;
    use proptest::prelude::*;

    use super::*;
    use crate::transport::{
        arbiter::BusArbiter,
        config::BusConfig,
        test_support::{
            MockBus, MockDelay, MockPin, OpKind, TestArbiter, pump, record_event, record_outcome,
            take_events, take_outcomes, test_sizes,
        },
    };

    type TestLink<'a> = BusLink<'a, MockDelay>;

    fn arbiter<'a>() -> TestArbiter<'a> {
        BusArbiter::new(MockBus::new(), MockPin::default(), MockDelay::default(), BusConfig::new())
    }

    fn link<'a>(bus: &'a TestArbiter<'a>, device: u8, config: BusLinkConfig) -> TestLink<'a> {
        BusLink::new(bus, device, &test_sizes(), MockDelay::default(), config).unwrap()
    }

    fn count(arb: &TestArbiter<'_>, kind: OpKind) -> usize {
        arb.with_driver(|d| d.ops_of(kind).len()).unwrap()
    }

    proptest! {
        #[test]
        fn sync_write_then_read_round_trips(value in any::<u32>(), which in 0usize..3) {
            let (addr, width) = [(0x00u8, 1usize), (0x01, 2), (0x02, 4)][which];
            let arb = arbiter();
            let dev = link(&arb, 0x20, BusLinkConfig::new());
            let bytes = value.to_le_bytes();

            dev.write_register(addr, &bytes[..width]).unwrap();
            let back = dev.read_register(addr).unwrap();

            prop_assert_eq!(back.as_slice(), &bytes[..width]);
            prop_assert_eq!(count(&arb, OpKind::BlockingRead), 1);
        }
    }

    #[test]
    fn typed_accessors_go_over_the_wire() {
        let arb = arbiter();
        let dev = link(&arb, 0x20, BusLinkConfig::new());
        dev.write_register16(0x01, 0xBEEF).unwrap();
        assert_eq!(
            arb.with_driver(|d| d.memory.get(&(0x20, 0x01)).cloned()),
            Some(Some(std::vec![0xEF, 0xBE]))
        );
        assert_eq!(dev.read_register16(0x01), Ok(0xBEEF));
        assert!(matches!(
            dev.read_register8(0x01),
            Err(LinkError::SizeMismatch { .. })
        ));
        assert_eq!(dev.read_register(0x05), Err(LinkError::InvalidRegister(0x05)));
    }

    #[test]
    fn sync_checksum_failure_is_retried() {
        let arb = arbiter();
        let dev = link(&arb, 0x20, BusLinkConfig::new());
        arb.with_driver(|d| {
            d.memory.insert((0x20, 0x00), std::vec![0x42]);
            d.corrupt_reads = 1;
        });

        assert_eq!(dev.read_register8(0x00), Ok(0x42));
        assert_eq!(count(&arb, OpKind::BlockingRead), 2);
    }

    #[test]
    fn sync_failure_after_retries_raises_and_emits_error() {
        take_events();
        let arb = arbiter();
        let dev = link(&arb, 0x20, BusLinkConfig::new().with_retries(2));
        dev.on_event(EventMask::ERROR, record_event, 0).unwrap();
        arb.with_driver(|d| d.fail_blocking = true);

        assert_eq!(
            dev.write_register(0x00, &[1]),
            Err(LinkError::Bus(ErrorKind::Bus))
        );
        assert_eq!(count(&arb, OpKind::BlockingWrite), 3);
        let events = take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].register, Some(0x00));
    }

    #[test]
    fn burst_read_is_one_transaction() {
        let arb = arbiter();
        let dev = link(&arb, 0x20, BusLinkConfig::new());
        arb.with_driver(|d| {
            d.memory.insert((0x20, 0x20), std::vec![0x01]);
            d.memory.insert((0x20, 0x21), std::vec![0x02, 0x03]);
            d.memory.insert((0x20, 0x22), std::vec![0x04]);
        });

        let payload = dev.read_registers(0x20, 3).unwrap();
        assert_eq!(payload.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(arb.with_driver(|d| d.ops[0].len), Some(7));
        assert_eq!(dev.core().with_registers(|r| r.reg_u16(0x21)), Ok(0x0302));
    }

    #[test]
    fn async_requires_attachment() {
        let arb = arbiter();
        let dev = link(&arb, 0x20, BusLinkConfig::new());
        assert_eq!(
            dev.read_register_async(0x00, None),
            Err(LinkError::NotAttached)
        );
    }

    #[test]
    fn async_read_updates_table_then_calls_back_once() {
        take_events();
        take_outcomes();
        let arb = arbiter();
        let dev = link(&arb, 0x20, BusLinkConfig::new());
        arb.attach(&dev).unwrap();
        dev.on_event(EventMask::REGISTER_CHANGED, record_event, 0)
            .unwrap();
        arb.with_driver(|d| d.memory.insert((0x20, 0x01), std::vec![0x34, 0x12]));

        dev.read_register_async(0x01, Some(record_outcome)).unwrap();
        assert_eq!(pump(&arb), 1);
        assert_eq!(take_events().len(), 1);
        assert_eq!(dev.core().with_registers(|r| r.reg_u16(0x01)), Ok(0x1234));

        dev.loop_tasks();
        dev.loop_tasks();
        let outcomes = take_outcomes();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].value, 0x1234);
        assert_eq!(outcomes[0].length, 2);
    }

    #[test]
    fn async_retry_bound_is_exact() {
        take_outcomes();
        let arb = arbiter();
        let dev = link(&arb, 0x20, BusLinkConfig::new().with_retries(2));
        arb.attach(&dev).unwrap();
        arb.with_driver(|d| d.corrupt_reads = usize::MAX);

        dev.read_register_async(0x00, Some(record_outcome)).unwrap();
        pump(&arb);
        dev.loop_tasks();

        assert_eq!(count(&arb, OpKind::Read), 3);
        let outcomes = take_outcomes();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].success);
        assert_eq!(outcomes[0].error, Some(LinkError::Checksum));
    }

    #[test]
    fn verified_write_reports_mismatch() {
        take_outcomes();
        let arb = arbiter();
        let dev = link(&arb, 0x20, BusLinkConfig::new());
        arb.attach(&dev).unwrap();
        let bogus = frame::encode_read_response(0x20, 0x00, &[1], &[0x99], true).unwrap();
        arb.with_driver(|d| d.replies.push_back(bogus.to_vec()));

        dev.write_and_verify_async(0x00, &[0x55], Some(record_outcome))
            .unwrap();
        pump(&arb);
        dev.loop_tasks();

        let outcomes = take_outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].error, Some(LinkError::VerifyMismatch));
        assert_eq!(count(&arb, OpKind::Write), 1);
        assert_eq!(count(&arb, OpKind::Read), 1);
    }

    #[test]
    fn sync_write_and_verify_round_trips() {
        let arb = arbiter();
        let dev = link(&arb, 0x20, BusLinkConfig::new());
        assert_eq!(dev.write_and_verify(0x23, &[1, 2, 3, 4]), Ok(()));
    }

    #[test]
    fn links_never_overlap_on_the_bus() {
        take_outcomes();
        let arb = arbiter();
        let a = link(&arb, 0x20, BusLinkConfig::new());
        let b = link(&arb, 0x21, BusLinkConfig::new());
        let c = link(&arb, 0x22, BusLinkConfig::new());
        let links = [&a, &b, &c];
        for dev in links {
            arb.attach(dev).unwrap();
        }

        for round in 0..4u8 {
            for dev in links {
                if round % 2 == 0 {
                    dev.write_register_async(0x30, &[round, 0], Some(record_outcome))
                        .unwrap();
                } else {
                    dev.read_register_async(0x30, Some(record_outcome)).unwrap();
                }
            }
            // complete a single operation between enqueue rounds
            if let Some(kind) = arb.with_driver(|d| d.finish_in_flight()).flatten() {
                arb.on_transfer_complete(kind);
            }
        }
        pump(&arb);
        for dev in links {
            dev.loop_tasks();
        }

        assert_eq!(arb.with_driver(|d| d.overlaps), Some(0));
        let outcomes = take_outcomes();
        assert_eq!(outcomes.len(), 12);
        assert!(outcomes.iter().all(|o| o.success));
        assert_eq!(arb.with_driver(|d| d.ops.len()), Some(12));
    }

    #[test]
    fn registration_order_and_fifo_decide_bus_order() {
        let arb = arbiter();
        let b = link(&arb, 0x30, BusLinkConfig::new());
        let a = link(&arb, 0x40, BusLinkConfig::new());
        arb.attach(&b).unwrap();
        arb.attach(&a).unwrap();

        arb.with_driver(|d| d.peripheral_busy = true);
        a.write_register_async(0x02, &[1, 2, 3, 4], None).unwrap();
        a.read_register_async(0x01, None).unwrap();
        b.read_register_async(0x00, None).unwrap();
        assert_eq!(arb.with_driver(|d| d.ops.len()), Some(0));

        arb.with_driver(|d| d.peripheral_busy = false);
        arb.start_next();
        pump(&arb);

        let ops: std::vec::Vec<(OpKind, u8, usize)> = arb
            .with_driver(|d| d.ops.iter().map(|op| (op.kind, op.device, op.len)).collect())
            .unwrap();
        assert_eq!(
            ops,
            std::vec![
                (OpKind::Read, 0x30, 2),
                (OpKind::Write, 0x40, 5),
                (OpKind::Read, 0x40, 3),
            ]
        );
    }

    #[test]
    fn bus_error_mid_transfer_resets_once_and_resumes() {
        take_outcomes();
        let arb = arbiter();
        let dev = link(&arb, 0x20, BusLinkConfig::new());
        arb.attach(&dev).unwrap();

        dev.write_register_async(0x00, &[1], Some(record_outcome))
            .unwrap();
        dev.write_register_async(0x20, &[2], Some(record_outcome))
            .unwrap();
        assert_eq!(arb.with_driver(|d| d.ops.len()), Some(1));

        arb.on_bus_error(ErrorKind::Bus);
        assert_eq!(arb.reset_count(), 1);
        assert!(arb.is_active());
        assert_eq!(arb.with_driver(|d| d.ops.len()), Some(2));

        pump(&arb);
        dev.loop_tasks();
        assert_eq!(arb.reset_count(), 1);
        let outcomes = take_outcomes();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.success));
    }

    #[test]
    fn start_failure_fails_transfer_and_resets_bus() {
        take_outcomes();
        let arb = arbiter();
        let dev = link(&arb, 0x20, BusLinkConfig::new().with_retries(0));
        arb.attach(&dev).unwrap();
        arb.with_driver(|d| d.fail_starts = true);

        dev.write_register_async(0x00, &[1], Some(record_outcome))
            .unwrap();
        dev.loop_tasks();

        assert_eq!(arb.reset_count(), 1);
        let outcomes = take_outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            outcomes[0].error,
            Some(LinkError::Bus(ErrorKind::ArbitrationLoss))
        );
    }

    #[test]
    fn crc_less_devices_carry_plain_payload() {
        let arb = arbiter();
        arb.with_driver(|d| d.use_crc = false);
        let dev = link(&arb, 0x20, BusLinkConfig::new().with_crc(false));
        dev.write_register(0x01, &[5, 6]).unwrap();
        assert_eq!(arb.with_driver(|d| d.ops[0].bytes.clone()), Some(std::vec![5, 6]));
        assert_eq!(dev.read_register16(0x01), Ok(0x0605));
    }
}
