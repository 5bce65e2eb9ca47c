//! Serializes every link on one shared bus into a single hardware operation.
//!
//! ```text
//!   BusLink A ──┐                         ┌── on_transfer_complete (ISR)
//!   BusLink B ──┼──▶ BusArbiter ──▶ BusDriver
//!   BusLink C ──┘    (one active op)      └── on_bus_error (ISR)
//! ```
//!
//! Whenever the bus goes idle, links are scanned in registration order and
//! the first one with queued work is started, so earlier links take priority. A hardware error, an operation that stays outstanding too long, or a
//! peripheral that stays busy while nothing is outstanding all lead to a full
//! reset of the bus.

use core::cell::RefCell;

use critical_section::Mutex;
use embedded_hal::{
    delay::DelayNs,
    digital::OutputPin,
    i2c::{Error as _, ErrorKind},
};
use heapless::Vec;

use crate::transport::{
    LinkError,
    config::{BUS_WIRE_CAPACITY, BusConfig},
    hal::BusDriver,
    queue::Direction,
};

/// Identity the arbiter assigns to an attached client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientToken(u16);

/// A link that issues operations through a [`SharedBus`].
///
/// Every method may be called from interrupt context.
pub trait BusClient {
    fn attached(&self, token: ClientToken);

    fn detached(&self);

    /// Starts the link's next queued operation. Returns whether one was started.
    fn try_start(&self) -> bool;

    /// The link's outstanding operation finished. `Ok` carries the raw bytes
    /// of a read and is empty for a write.
    fn on_transfer_done(&self, result: Result<&[u8], LinkError>);

    /// The bus was reset; the link has no operation outstanding any more.
    fn on_bus_reset(&self);
}

/// Operations a link may request from the bus it is attached to.
pub trait SharedBus {
    /// True while an operation is outstanding or the peripheral reports busy.
    fn is_busy(&self) -> bool;

    /// Starts a non-blocking read of `len` bytes.
    ///
    /// # Errors
    /// * [`LinkError::Busy`] - another operation is outstanding
    /// * [`LinkError::NotAttached`] - `token` is unknown
    /// * [`LinkError::Bus`] - the driver refused to start
    fn begin_read(
        &self,
        token: ClientToken,
        device: u8,
        register: u8,
        len: usize,
    ) -> Result<(), LinkError>;

    fn begin_write(
        &self,
        token: ClientToken,
        device: u8,
        register: u8,
        data: &[u8],
    ) -> Result<(), LinkError>;

    /// Blocking read. Fails with [`LinkError::Busy`] instead of waiting.
    fn read_blocking(&self, device: u8, register: u8, buf: &mut [u8]) -> Result<(), LinkError>;

    fn write_blocking(&self, device: u8, register: u8, data: &[u8]) -> Result<(), LinkError>;

    /// Starts the next queued operation if the bus is idle.
    fn start_next(&self);

    fn reset(&self);
}

#[derive(Clone, Copy)]
struct Client<'a> {
    token: ClientToken,
    link: &'a dyn BusClient,
}

#[derive(Debug, Clone, Copy)]
struct ActiveOp {
    token: ClientToken,
    direction: Direction,
    ticks_left: u16,
}

struct ArbiterState<'a, B, P, D, const L: usize> {
    /// `None` while checked out by a blocking operation.
    driver: Option<B>,
    reset_pin: P,
    delay: D,
    clients: [Option<Client<'a>>; L],
    next_token: u16,
    active: Option<ActiveOp>,
    busy_ticks: u16,
    resetting: bool,
    reset_again: bool,
    resets: u32,
}

impl<'a, B, P, D, const L: usize> ArbiterState<'a, B, P, D, L>
where
    B: BusDriver,
{
    fn client(&self, token: ClientToken) -> Option<&'a dyn BusClient> {
        self.clients
            .iter()
            .flatten()
            .find(|c| c.token == token)
            .map(|c| c.link)
    }

    fn client_count(&self) -> usize {
        self.clients.iter().take_while(|c| c.is_some()).count()
    }

    fn is_busy(&mut self) -> bool {
        if self.active.is_some() {
            return true;
        }
        match self.driver.as_mut() {
            Some(driver) => driver.is_peripheral_busy(),
            None => true,
        }
    }
}

/// Owner of one physical shared bus.
///
/// The reset line is active low: it is driven low for `reset_settle_ms`, then
/// released and given the same time to settle.
///
/// # Type Parameters
/// - `B`: Bus peripheral driver
/// - `P`: Hardware reset line
/// - `D`: Delay used for the reset settle time
/// - `L`: Maximum number of attached links
pub struct BusArbiter<'a, B, P, D, const L: usize = 8>
where
    B: BusDriver,
    P: OutputPin,
    D: DelayNs,
{
    state: Mutex<RefCell<ArbiterState<'a, B, P, D, L>>>,
    config: BusConfig,
}

impl<'a, B, P, D, const L: usize> BusArbiter<'a, B, P, D, L>
where
    B: BusDriver,
    P: OutputPin,
    D: DelayNs,
{
    pub fn new(driver: B, reset_pin: P, delay: D, config: BusConfig) -> Self {
        Self {
            state: Mutex::new(RefCell::new(ArbiterState {
                driver: Some(driver),
                reset_pin,
                delay,
                clients: [None; L],
                next_token: 0,
                active: None,
                busy_ticks: 0,
                resetting: false,
                reset_again: false,
                resets: 0,
            })),
            config,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ArbiterState<'a, B, P, D, L>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.state.borrow_ref_mut(cs)))
    }

    /// Releases the reset line and brings the peripheral up.
    pub fn init(&self) -> Result<(), LinkError> {
        self.with_state(|s| {
            if s.reset_pin.set_high().is_err() {
                log::warn!("failed to release bus reset line");
            }
            match s.driver.as_mut() {
                Some(driver) => driver.init().map_err(|e| LinkError::Bus(e.kind())),
                None => Err(LinkError::Busy),
            }
        })
    }

    /// Registers a link. Registration order is start priority.
    pub fn attach(&self, link: &'a dyn BusClient) -> Result<ClientToken, LinkError> {
        let token = self.with_state(|s| {
            let slot = s
                .clients
                .iter()
                .position(Option::is_none)
                .ok_or(LinkError::ClientTableFull)?;
            let token = ClientToken(s.next_token);
            s.next_token = s.next_token.wrapping_add(1);
            s.clients[slot] = Some(Client { token, link });
            Ok(token)
        })?;
        link.attached(token);
        Ok(token)
    }

    /// Removes a link, keeping the order of the others.
    pub fn detach(&self, token: ClientToken) -> bool {
        let removed = self.with_state(|s| {
            let pos = s
                .clients
                .iter()
                .position(|c| matches!(c, Some(c) if c.token == token))?;
            let client = s.clients[pos].take();
            s.clients[pos..].rotate_left(1);
            client
        });
        match removed {
            Some(client) => {
                client.link.detached();
                true
            }
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.with_state(|s| s.client_count())
    }

    /// Whether an asynchronous operation is outstanding.
    pub fn is_active(&self) -> bool {
        self.with_state(|s| s.active.is_some())
    }

    pub fn reset_count(&self) -> u32 {
        self.with_state(|s| s.resets)
    }

    /// Runs `f` on the driver unless a blocking operation has it checked out.
    pub fn with_driver<R>(&self, f: impl FnOnce(&mut B) -> R) -> Option<R> {
        self.with_state(|s| s.driver.as_mut().map(f))
    }

    /// Transfer-complete interrupt entry point.
    ///
    /// Hands the result to the owning link, then starts the next queued
    /// operation.
    pub fn on_transfer_complete(&self, kind: Direction) {
        let done = self.with_state(|s| {
            let op = match s.active {
                Some(op) if op.direction == kind => op,
                Some(op) => {
                    log::warn!("{:?} completion while {:?} is active", kind, op.direction);
                    return None;
                }
                None => {
                    log::debug!("spurious {:?} completion", kind);
                    return None;
                }
            };
            s.active = None;
            s.busy_ticks = 0;

            let mut data: Vec<u8, BUS_WIRE_CAPACITY> = Vec::new();
            let mut result = Ok(());
            if kind == Direction::Read {
                if let Some(driver) = s.driver.as_ref() {
                    result = data
                        .extend_from_slice(driver.received())
                        .map_err(|_| LinkError::TooLong);
                }
            }
            Some((s.client(op.token), result.map(|_| data)))
        });

        if let Some((client, result)) = done {
            match client {
                Some(link) => {
                    let result = match &result {
                        Ok(data) => Ok(data.as_slice()),
                        Err(err) => Err(*err),
                    };
                    link.on_transfer_done(result);
                }
                None => log::debug!("completion for detached client dropped"),
            }
        }
        self.start_next();
    }

    /// Bus-error interrupt entry point.
    pub fn on_bus_error(&self, kind: ErrorKind) {
        log::warn!("bus error interrupt: {:?}", kind);
        self.reset_with(LinkError::Bus(kind));
    }

    /// Foreground watchdog, called once per loop period.
    pub fn tick(&self) {
        let busy_limit = self.config.peripheral_busy_timeout_ticks;
        let fault = self.with_state(|s| {
            if let Some(op) = s.active.as_mut() {
                op.ticks_left = op.ticks_left.saturating_sub(1);
                return (op.ticks_left == 0).then_some("operation still pending");
            }
            let busy = s
                .driver
                .as_mut()
                .is_some_and(|driver| driver.is_peripheral_busy());
            if !busy {
                s.busy_ticks = 0;
                return None;
            }
            s.busy_ticks = s.busy_ticks.saturating_add(1);
            (s.busy_ticks >= busy_limit).then_some("peripheral busy while idle")
        });

        match fault {
            Some(reason) => {
                log::warn!("bus watchdog: {}", reason);
                self.reset_with(LinkError::Timeout);
            }
            None => self.start_next(),
        }
    }

    /// Resets the bus, reporting the active operation as failed with `error`.
    ///
    /// A reset requested while one is running (a link failing to start
    /// during the restart) is folded into another pass of the same loop.
    fn reset_with(&self, error: LinkError) {
        let first = self.with_state(|s| {
            if s.resetting {
                s.reset_again = true;
                false
            } else {
                s.resetting = true;
                true
            }
        });
        if !first {
            return;
        }

        let settle = self.config.reset_settle_ms;
        loop {
            let (failed, clients, count) = self.with_state(|s| {
                s.resets = s.resets.wrapping_add(1);
                s.busy_ticks = 0;
                let failed = s.active.take().and_then(|op| s.client(op.token));

                if let Some(driver) = s.driver.as_mut() {
                    driver.deinit();
                }
                if s.reset_pin.set_low().is_err() {
                    log::warn!("failed to assert bus reset line");
                }
                s.delay.delay_ms(settle);
                if s.reset_pin.set_high().is_err() {
                    log::warn!("failed to release bus reset line");
                }
                s.delay.delay_ms(settle);
                if let Some(driver) = s.driver.as_mut() {
                    if let Err(err) = driver.init() {
                        log::error!("bus init after reset failed: {:?}", err.kind());
                    }
                }
                (failed, s.clients, s.resets)
            });

            log::warn!("bus reset #{}: {}", count, error);
            if let Some(link) = failed {
                link.on_transfer_done(Err(error));
            }
            for client in clients.iter().flatten() {
                client.link.on_bus_reset();
            }
            self.start_next();

            let again = self.with_state(|s| {
                if s.reset_again {
                    s.reset_again = false;
                    true
                } else {
                    s.resetting = false;
                    false
                }
            });
            if !again {
                break;
            }
        }
    }

    fn begin(
        &self,
        token: ClientToken,
        direction: Direction,
        start: impl FnOnce(&mut B) -> Result<(), B::Error>,
    ) -> Result<(), LinkError> {
        let ticks = self.config.nonidle_timeout_ticks;
        self.with_state(|s| {
            if s.client(token).is_none() {
                return Err(LinkError::NotAttached);
            }
            if s.is_busy() {
                return Err(LinkError::Busy);
            }
            let driver = s.driver.as_mut().ok_or(LinkError::Busy)?;
            start(driver).map_err(|e| LinkError::Bus(e.kind()))?;
            s.active = Some(ActiveOp {
                token,
                direction,
                ticks_left: ticks,
            });
            s.busy_ticks = 0;
            Ok(())
        })
    }

    /// Checks the driver out for a blocking operation so no interrupt path
    /// can touch it, runs `op` outside the critical section, checks it back in.
    fn blocking(&self, op: impl FnOnce(&mut B) -> Result<(), B::Error>) -> Result<(), LinkError> {
        let mut driver = self.with_state(|s| {
            if s.is_busy() {
                return Err(LinkError::Busy);
            }
            s.driver.take().ok_or(LinkError::Busy)
        })?;

        let result = op(&mut driver).map_err(|e| LinkError::Bus(e.kind()));
        self.with_state(|s| s.driver = Some(driver));

        match result {
            Ok(()) => self.start_next(),
            Err(err) => self.reset_with(err),
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn with_reset_pin<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        self.with_state(|s| f(&mut s.reset_pin))
    }
}

impl<'a, B, P, D, const L: usize> SharedBus for BusArbiter<'a, B, P, D, L>
where
    B: BusDriver,
    P: OutputPin,
    D: DelayNs,
{
    fn is_busy(&self) -> bool {
        self.with_state(|s| s.is_busy())
    }

    fn begin_read(
        &self,
        token: ClientToken,
        device: u8,
        register: u8,
        len: usize,
    ) -> Result<(), LinkError> {
        if len == 0 {
            return Err(LinkError::ZeroLength);
        }
        self.begin(token, Direction::Read, |driver| {
            driver.start_read(device, register, len)
        })
    }

    fn begin_write(
        &self,
        token: ClientToken,
        device: u8,
        register: u8,
        data: &[u8],
    ) -> Result<(), LinkError> {
        if data.is_empty() {
            return Err(LinkError::ZeroLength);
        }
        self.begin(token, Direction::Write, |driver| {
            driver.start_write(device, register, data)
        })
    }

    fn read_blocking(&self, device: u8, register: u8, buf: &mut [u8]) -> Result<(), LinkError> {
        let timeout = self.config.blocking_timeout_ms;
        self.blocking(|driver| driver.read(device, register, buf, timeout))
    }

    fn write_blocking(&self, device: u8, register: u8, data: &[u8]) -> Result<(), LinkError> {
        let timeout = self.config.blocking_timeout_ms;
        self.blocking(|driver| driver.write(device, register, data, timeout))
    }

    /// Starts the first client, in registration order, that has queued work.
    fn start_next(&self) {
        let clients = self.with_state(|s| s.clients);
        for client in clients.iter().flatten() {
            if self.is_busy() {
                return;
            }
            if client.link.try_start() {
                return;
            }
        }
    }

    fn reset(&self) {
        self.reset_with(LinkError::BusReset);
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;
    use crate::transport::test_support::{MockBus, MockDelay, MockPin, OpKind, TestArbiter};

    /// Client that writes one byte per queued op and re-queues failures.
    struct FakeClient<'b> {
        bus: &'b dyn SharedBus,
        device: u8,
        token: Cell<Option<ClientToken>>,
        queued: Cell<u8>,
        done: Cell<u8>,
        failed: Cell<u8>,
        resets: Cell<u8>,
    }

    impl<'b> FakeClient<'b> {
        fn new(bus: &'b dyn SharedBus, device: u8) -> Self {
            Self {
                bus,
                device,
                token: Cell::new(None),
                queued: Cell::new(0),
                done: Cell::new(0),
                failed: Cell::new(0),
                resets: Cell::new(0),
            }
        }
    }

    impl BusClient for FakeClient<'_> {
        fn attached(&self, token: ClientToken) {
            self.token.set(Some(token));
        }

        fn detached(&self) {
            self.token.set(None);
        }

        fn try_start(&self) -> bool {
            let Some(token) = self.token.get() else {
                return false;
            };
            if self.queued.get() == 0 {
                return false;
            }
            if self.bus.begin_write(token, self.device, 0, &[1]).is_ok() {
                self.queued.set(self.queued.get() - 1);
                true
            } else {
                false
            }
        }

        fn on_transfer_done(&self, result: Result<&[u8], LinkError>) {
            match result {
                Ok(_) => self.done.set(self.done.get() + 1),
                Err(_) => {
                    self.failed.set(self.failed.get() + 1);
                    self.queued.set(self.queued.get() + 1);
                }
            }
        }

        fn on_bus_reset(&self) {
            self.resets.set(self.resets.get() + 1);
        }
    }

    fn arbiter<'a>() -> TestArbiter<'a> {
        BusArbiter::new(MockBus::new(), MockPin::default(), MockDelay::default(), BusConfig::new())
    }

    #[test]
    fn attach_order_survives_detach() {
        let arb = arbiter();
        let a = FakeClient::new(&arb, 1);
        let b = FakeClient::new(&arb, 2);
        let c = FakeClient::new(&arb, 3);
        let ta = arb.attach(&a).unwrap();
        arb.attach(&b).unwrap();
        arb.attach(&c).unwrap();
        assert_eq!(arb.client_count(), 3);

        assert!(arb.detach(ta));
        assert!(!arb.detach(ta));
        assert!(a.token.get().is_none());
        assert_eq!(arb.client_count(), 2);

        b.queued.set(1);
        c.queued.set(1);
        arb.start_next();
        assert_eq!(arb.with_driver(|d| d.ops[0].device), Some(2));
    }

    #[test]
    fn begin_rejects_when_busy_or_unknown() {
        let arb = arbiter();
        let a = FakeClient::new(&arb, 1);
        let token = arb.attach(&a).unwrap();

        arb.begin_read(token, 1, 0, 2).unwrap();
        assert!(arb.is_busy());
        assert_eq!(arb.begin_read(token, 1, 0, 2), Err(LinkError::Busy));
        assert_eq!(arb.write_blocking(1, 0, &[1]), Err(LinkError::Busy));

        arb.detach(token);
        assert_eq!(
            arb.begin_write(token, 1, 0, &[1]),
            Err(LinkError::NotAttached)
        );
    }

    #[test]
    fn peripheral_busy_counts_as_busy() {
        let arb = arbiter();
        arb.with_driver(|d| d.peripheral_busy = true);
        assert!(arb.is_busy());
        assert!(!arb.is_active());
    }

    #[test]
    fn earlier_client_drains_first() {
        let arb = arbiter();
        let a = FakeClient::new(&arb, 1);
        let b = FakeClient::new(&arb, 2);
        arb.attach(&a).unwrap();
        arb.attach(&b).unwrap();
        a.queued.set(2);
        b.queued.set(2);

        arb.start_next();
        while let Some(kind) = arb.with_driver(|d| d.finish_in_flight()).flatten() {
            arb.on_transfer_complete(kind);
        }

        let devices: std::vec::Vec<u8> = arb.with_driver(|d| d.ops.iter().map(|op| op.device).collect()).unwrap();
        assert_eq!(devices, std::vec![1, 1, 2, 2]);
        assert_eq!((a.done.get(), b.done.get()), (2, 2));
        assert_eq!(arb.with_driver(|d| d.overlaps), Some(0));
    }

    #[test]
    fn bus_error_resets_once_and_restarts() {
        let arb = arbiter();
        let a = FakeClient::new(&arb, 1);
        let b = FakeClient::new(&arb, 2);
        arb.attach(&a).unwrap();
        arb.attach(&b).unwrap();
        a.queued.set(1);
        b.queued.set(1);

        arb.start_next();
        assert_eq!(arb.with_driver(|d| d.ops.len()), Some(1));

        arb.with_driver(|d| d.finish_in_flight());
        arb.on_bus_error(ErrorKind::Bus);

        assert_eq!(arb.reset_count(), 1);
        assert_eq!(a.failed.get(), 1);
        assert_eq!((a.resets.get(), b.resets.get()), (1, 1));
        assert_eq!(arb.with_driver(|d| (d.deinits, d.inits)), Some((1, 1)));
        assert_eq!(arb.with_reset_pin(|p| p.levels.clone()), std::vec![false, true]);

        // next queued operation started right after the reset
        assert!(arb.is_active());
        assert_eq!(arb.with_driver(|d| d.ops.len()), Some(2));
    }

    #[test]
    fn pending_operation_times_out() {
        let arb: TestArbiter<'_> = BusArbiter::new(
            MockBus::new(),
            MockPin::default(),
            MockDelay::default(),
            BusConfig::new().with_nonidle_timeout_ticks(3),
        );
        let a = FakeClient::new(&arb, 1);
        arb.attach(&a).unwrap();
        a.queued.set(1);
        arb.start_next();

        arb.tick();
        arb.tick();
        assert_eq!(arb.reset_count(), 0);
        arb.tick();
        assert_eq!(arb.reset_count(), 1);
        assert_eq!(a.failed.get(), 1);
    }

    #[test]
    fn busy_peripheral_while_idle_times_out() {
        let arb = arbiter();
        arb.with_driver(|d| d.peripheral_busy = true);
        for _ in 0..9 {
            arb.tick();
        }
        assert_eq!(arb.reset_count(), 0);
        arb.tick();
        assert_eq!(arb.reset_count(), 1);
    }

    #[test]
    fn reset_settles_with_delay() {
        let arb = arbiter();
        arb.reset();
        assert_eq!(arb.reset_count(), 1);
        assert!(arb.with_state(|s| s.delay.elapsed_ns) >= 2_000_000);
    }

    #[test]
    fn blocking_ops_run_when_idle() {
        let arb = arbiter();
        arb.write_blocking(0x20, 0x05, &[1, 2]).unwrap();
        let mut buf = [0u8; 2];
        arb.read_blocking(0x20, 0x05, &mut buf).unwrap();

        let kinds: std::vec::Vec<OpKind> = arb.with_driver(|d| d.ops.iter().map(|op| op.kind).collect()).unwrap();
        assert_eq!(kinds, std::vec![OpKind::BlockingWrite, OpKind::BlockingRead]);
    }

    #[test]
    fn failed_blocking_op_resets_bus() {
        let arb = arbiter();
        arb.with_driver(|d| d.fail_blocking = true);
        assert!(matches!(
            arb.write_blocking(0x20, 0x05, &[1]),
            Err(LinkError::Bus(_))
        ));
        assert_eq!(arb.reset_count(), 1);
        assert!(arb.with_driver(|_| ()).is_some());
    }

    #[test]
    fn start_failure_is_reported_to_caller() {
        let arb = arbiter();
        let a = FakeClient::new(&arb, 1);
        let token = arb.attach(&a).unwrap();
        arb.with_driver(|d| d.fail_starts = true);
        assert!(matches!(
            arb.begin_write(token, 1, 0, &[1]),
            Err(LinkError::Bus(_))
        ));
        assert!(!arb.is_active());
    }
}
