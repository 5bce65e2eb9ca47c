//! Queue, observer and register-table machinery shared by every wire format,
//! and the [`ModuleLink`] trait device drivers program against.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::transport::{
    LinkError,
    event::{EventMask, LinkEvent, Observer, ObserverList, ObserverSet, deliver},
    queue::{Direction, InternalOp, Notify, Payload, Step, Transfer, TransferCallback, TransferQueue},
    regs::{RegisterTable, check_width, scalar},
};

/// Generates typed synchronous accessors on top of the byte-level ones.
macro_rules! impl_typed_link_access {
    ($bits:literal, $type:ty, $width:literal) => {
        paste::paste! {
            #[doc = "Synchronously reads a " $bits "-bit register (little-endian)."]
            #[doc = ""]
            #[doc = "# Errors"]
            #[doc = "* [`LinkError::SizeMismatch`] - register is not " $width " bytes wide"]
            #[doc = "* any wire error once retries are exhausted"]
            fn [<read_register $bits>](&self, addr: u8) -> Result<$type, LinkError> {
                let width = check_width(self.register_size(addr), addr, $width)?;
                let bytes = self.read_register(addr)?;
                let mut raw = [0u8; $width];
                raw[..width].copy_from_slice(&bytes[..width]);
                Ok(<$type>::from_le_bytes(raw))
            }

            #[doc = "Synchronously writes a " $bits "-bit register (little-endian)."]
            fn [<write_register $bits>](&self, addr: u8, value: $type) -> Result<(), LinkError> {
                let width = check_width(self.register_size(addr), addr, $width)?;
                self.write_register(addr, &value.to_le_bytes()[..width])
            }
        }
    };
}

/// Register-level access to one device, independent of the wire format.
///
/// Synchronous calls poll for completion and must only be made from the
/// foreground loop. Asynchronous calls enqueue a descriptor and return; the
/// callback fires exactly once from [`ModuleLink::loop_tasks`], after any
/// retries, whether the transfer succeeded or not.
pub trait ModuleLink {
    /// Declared size of a register, 0 if undefined.
    fn register_size(&self, addr: u8) -> usize;

    fn read_register(&self, addr: u8) -> Result<Payload, LinkError>;

    fn write_register(&self, addr: u8, data: &[u8]) -> Result<(), LinkError>;

    fn read_register_async(
        &self,
        addr: u8,
        callback: Option<TransferCallback>,
    ) -> Result<(), LinkError>;

    fn write_register_async(
        &self,
        addr: u8,
        data: &[u8],
        callback: Option<TransferCallback>,
    ) -> Result<(), LinkError>;

    /// Writes, reads the register back and reports success only if both match.
    fn write_and_verify_async(
        &self,
        addr: u8,
        data: &[u8],
        callback: Option<TransferCallback>,
    ) -> Result<(), LinkError>;

    /// Registers an observer. See [`ObserverList`] for identifier rules.
    fn on_event(&self, mask: EventMask, observer: Observer, id: u16) -> Result<(), LinkError>;

    fn remove_observer(&self, id: u16) -> bool;

    /// Periodic foreground work: completions, timeouts and link upkeep.
    fn loop_tasks(&self);

    /// Synchronous write followed by a read-back comparison.
    ///
    /// # Errors
    /// * [`LinkError::VerifyMismatch`] - the device returned different bytes
    fn write_and_verify(&self, addr: u8, data: &[u8]) -> Result<(), LinkError> {
        self.write_register(addr, data)?;
        let back = self.read_register(addr)?;
        if back.as_slice() == data {
            Ok(())
        } else {
            Err(LinkError::VerifyMismatch)
        }
    }

    impl_typed_link_access!(8, u8, 1);
    impl_typed_link_access!(16, u16, 2);
    impl_typed_link_access!(32, u32, 4);
}

pub(crate) struct CoreState<const N: usize> {
    pub(crate) registers: RegisterTable<N>,
    pub(crate) queue: TransferQueue,
    pub(crate) observers: ObserverList,
}

impl<const N: usize> CoreState<N> {
    /// Stores `payload` across consecutive registers and snapshots the
    /// `REGISTER_CHANGED` observers to notify once the lock is released.
    fn store(&mut self, first: u8, sizes: &[u16], payload: &[u8]) -> Result<ObserverSet, LinkError> {
        let mut offset = 0;
        for (i, &size) in sizes.iter().enumerate() {
            let end = offset + size as usize;
            let chunk = payload.get(offset..end).ok_or(LinkError::Format)?;
            self.registers.store(first.wrapping_add(i as u8), chunk)?;
            offset = end;
        }
        Ok(self.observers.matching(EventMask::REGISTER_CHANGED))
    }
}

/// One `REGISTER_CHANGED` event per register of a stored payload.
fn notify_changed(observers: &[Observer], first: u8, sizes: &[u16], payload: &[u8]) {
    if observers.is_empty() {
        return;
    }
    let mut offset = 0;
    for (i, &size) in sizes.iter().enumerate() {
        let Some(chunk) = payload.get(offset..offset + size as usize) else {
            return;
        };
        offset += size as usize;
        let event = LinkEvent::new(EventMask::REGISTER_CHANGED)
            .with_register(first.wrapping_add(i as u8))
            .with_value(scalar(chunk))
            .with_data(chunk);
        deliver(observers, &event);
    }
}

/// Transfer queue, observers and register table of one link, behind the
/// global critical section.
///
/// Wire-specific links own a `LinkCore` and feed it hardware results through
/// [`LinkCore::finish`]. No borrow of the state is held while observers or
/// callbacks run, so they may call back into the link.
pub struct LinkCore<const N: usize> {
    state: Mutex<RefCell<CoreState<N>>>,
    retries: u8,
}

impl<const N: usize> LinkCore<N> {
    pub fn new(sizes: &[u16], retries: u8) -> Result<Self, LinkError> {
        let state = CoreState {
            registers: RegisterTable::new(sizes)?,
            queue: TransferQueue::new(),
            observers: ObserverList::new(),
        };
        Ok(Self {
            state: Mutex::new(RefCell::new(state)),
            retries,
        })
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut CoreState<N>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.state.borrow_ref_mut(cs)))
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    pub fn with_registers<R>(&self, f: impl FnOnce(&RegisterTable<N>) -> R) -> R {
        self.with_state(|s| f(&s.registers))
    }

    /// Local mutation of the cached register values. Nothing goes on the wire.
    pub fn with_registers_mut<R>(&self, f: impl FnOnce(&mut RegisterTable<N>) -> R) -> R {
        self.with_state(|s| f(&mut s.registers))
    }

    pub fn register_size(&self, addr: u8) -> usize {
        self.with_state(|s| s.registers.size(addr))
    }

    pub fn on_event(&self, mask: EventMask, observer: Observer, id: u16) -> Result<(), LinkError> {
        self.with_state(|s| s.observers.register(observer, mask, id))
    }

    pub fn remove_observer(&self, id: u16) -> bool {
        self.with_state(|s| s.observers.unregister(id))
    }

    /// Delivers `event` to matching observers in registration order.
    pub fn emit(&self, event: &LinkEvent<'_>) {
        let observers = self.with_state(|s| s.observers.matching(event.kind));
        deliver(&observers, event);
    }

    /// Stores bytes read from, or acknowledged by, the device and notifies
    /// `REGISTER_CHANGED` observers once per register.
    ///
    /// The table is updated before any observer runs.
    pub fn register_changed(&self, first: u8, sizes: &[u16], payload: &[u8]) {
        match self.with_state(|s| s.store(first, sizes, payload)) {
            Ok(observers) => notify_changed(&observers, first, sizes, payload),
            Err(err) => log::warn!("dropping update of register {:#04x}: {}", first, err),
        }
    }

    /// Marks every register stale and notifies `DEVICE_RESET` observers.
    pub fn device_reset(&self, value: u32) {
        log::info!("device reset reported");
        self.with_state(|s| s.registers.invalidate());
        self.emit(&LinkEvent::new(EventMask::DEVICE_RESET).with_value(value));
    }

    pub(crate) fn enqueue(&self, transfer: Transfer) -> Result<u32, LinkError> {
        self.with_state(|s| s.queue.enqueue(transfer))
    }

    pub(crate) fn begin(&self) -> Option<Transfer> {
        self.with_state(|s| s.queue.begin())
    }

    pub(crate) fn abandon(&self) {
        self.with_state(|s| s.queue.abandon())
    }

    pub(crate) fn active(&self) -> Option<Transfer> {
        self.with_state(|s| s.queue.active().cloned())
    }

    pub fn is_active(&self) -> bool {
        self.with_state(|s| s.queue.is_active())
    }

    pub fn has_startable(&self) -> bool {
        self.with_state(|s| s.queue.has_startable())
    }

    pub fn pending_len(&self) -> usize {
        self.with_state(|s| s.queue.pending_len())
    }

    /// Finishes the active attempt with the decoded wire result.
    ///
    /// The table update and the queue step happen under one critical
    /// section, so an interrupt-side completion cannot slip in between.
    /// Observers run afterwards, still before any completion callback.
    pub(crate) fn finish(&self, result: Result<&[u8], LinkError>) -> Step {
        let retries = self.retries;
        let finished = self.with_state(|s| {
            let active = s.queue.active()?.clone();
            let stored = match result {
                Ok(received) if active.updates_table() => {
                    let bytes = match active.wire_direction() {
                        Direction::Read => received,
                        Direction::Write => active.data(),
                    };
                    Some(s.store(active.register, &active.sizes, bytes))
                }
                _ => None,
            };
            let step = s.queue.finish(result, retries);
            Some((active, stored, step))
        });
        let Some((active, stored, step)) = finished else {
            return Step::Idle;
        };

        match (stored, result) {
            (Some(Ok(observers)), Ok(received)) => {
                let bytes = match active.wire_direction() {
                    Direction::Read => received,
                    Direction::Write => active.data(),
                };
                notify_changed(&observers, active.register, &active.sizes, bytes);
            }
            (Some(Err(err)), _) => {
                log::warn!("dropping update of register {:#04x}: {}", active.register, err)
            }
            _ => {}
        }
        self.report(&active, step);
        step
    }

    /// Completes the active descriptor with `error` without retrying.
    pub(crate) fn force_fail(&self, error: LinkError) -> Step {
        let Some(active) = self.active() else {
            return Step::Idle;
        };
        let step = self.with_state(|s| s.queue.force_fail(error));
        self.report(&active, step);
        step
    }

    fn report(&self, active: &Transfer, step: Step) {
        if let Step::Completed(Err(err)) = step {
            log::warn!(
                "transfer reg {:#04x} failed after {} attempt(s): {}",
                active.register,
                active.attempts,
                err
            );
            self.emit(
                &LinkEvent::new(EventMask::ERROR)
                    .with_register(active.register)
                    .with_error(err),
            );
        }
    }

    /// Hands completed descriptors to their callbacks.
    ///
    /// Link-private follow-ups go to `internal`. Results nobody waits for any
    /// more are dropped.
    pub(crate) fn drain_completed(&self, mut internal: impl FnMut(InternalOp, &Transfer)) {
        while let Some(done) = self.with_state(|s| s.queue.pop_completed()) {
            match done.notify {
                Notify::None => {}
                Notify::Callback(callback) => callback(&done.outcome()),
                Notify::Blocking => {
                    log::debug!("dropping result of abandoned blocking transfer {}", done.seq)
                }
                Notify::Internal(op) => internal(op, &done),
            }
        }
    }

    pub(crate) fn take_completed(&self, seq: u32) -> Option<Transfer> {
        self.with_state(|s| s.queue.take_completed(seq))
    }

    pub(crate) fn orphan(&self, seq: u32) {
        self.with_state(|s| s.queue.orphan(seq))
    }

    pub(crate) fn is_active_seq(&self, seq: u32) -> bool {
        self.with_state(|s| s.queue.is_active_seq(seq))
    }
}
