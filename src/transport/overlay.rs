//! Interrupt mask/flags register convention for shared-bus devices.
//!
//! A device asserts its interrupt line when any unmasked flag is set. The
//! link then reads the flags register, writes back the complement of what it
//! read to clear exactly those bits, and hands the read value to observers.
//!
//! ```text
//!   line low ─▶ guard free? ─▶ read flags ─▶ write !flags ─▶ release guard
//!                                  │
//!                                  ├─ flags == sentinel ─▶ DEVICE_RESET
//!                                  └─ otherwise ────────▶ INTERRUPT(value = flags)
//! ```
//!
//! Only one read-and-clear round trip runs at a time. The guard releases when
//! the clear write completes, when the flags read fails, or after
//! `handling_timeout_ticks` loop ticks.

use embedded_hal::{delay::DelayNs, digital::InputPin};

use crate::transport::{
    LinkError,
    bus::BusLink,
    config::OverlayConfig,
    event::{EventMask, LinkEvent},
    link::ModuleLink,
    queue::{InternalOp, Notify, Transfer, TransferCallback},
    regs::{RegisterTable, scalar},
};

/// What a flags value means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    DeviceReset,
    Interrupt,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct InterruptOverlay {
    config: OverlayConfig,
    /// Width of both registers, 1 or 2 bytes.
    width: usize,
    handling: bool,
    ticks_left: u16,
}

impl InterruptOverlay {
    /// # Errors
    /// * [`LinkError::InterruptRegisters`] - registers missing, of unequal
    ///   size, or wider than 2 bytes
    pub(crate) fn new<const N: usize>(
        config: OverlayConfig,
        registers: &RegisterTable<N>,
    ) -> Result<Self, LinkError> {
        let mask = registers.size(config.mask_register);
        let flags = registers.size(config.flags_register);
        if mask != flags || !(1..=2).contains(&mask) {
            return Err(LinkError::InterruptRegisters);
        }
        Ok(Self {
            config,
            width: mask,
            handling: false,
            ticks_left: 0,
        })
    }

    /// Takes the guard. Returns false if a round trip is already running.
    pub(crate) fn try_begin(&mut self) -> bool {
        if self.handling {
            return false;
        }
        self.handling = true;
        self.ticks_left = self.config.handling_timeout_ticks;
        true
    }

    pub(crate) fn release(&mut self) {
        self.handling = false;
    }

    pub(crate) fn is_handling(&self) -> bool {
        self.handling
    }

    /// Counts the guard down. Returns true when it expired on this tick.
    pub(crate) fn tick(&mut self) -> bool {
        if !self.handling {
            return false;
        }
        self.ticks_left = self.ticks_left.saturating_sub(1);
        if self.ticks_left == 0 {
            self.handling = false;
            return true;
        }
        false
    }

    fn width_mask(&self) -> u32 {
        if self.width == 1 { 0xFF } else { 0xFFFF }
    }

    /// Value that clears exactly the bits set in `flags`.
    pub(crate) fn clear_value(&self, flags: u32) -> u32 {
        !flags & self.width_mask()
    }

    pub(crate) fn classify(&self, flags: u32) -> Dispatch {
        if flags == u32::from(self.config.reset_sentinel) {
            Dispatch::DeviceReset
        } else {
            Dispatch::Interrupt
        }
    }
}

impl<'a, D, const N: usize> BusLink<'a, D, N>
where
    D: DelayNs,
{
    /// Enables interrupt handling on this link.
    ///
    /// # Errors
    /// * [`LinkError::InterruptRegisters`] - the register table does not
    ///   define a usable mask/flags pair at the configured addresses
    pub fn with_interrupts(self, config: OverlayConfig) -> Result<Self, LinkError> {
        let overlay = self
            .core
            .with_registers(|r| InterruptOverlay::new(config, r))?;
        self.with_wire(|w| w.overlay = Some(overlay));
        Ok(self)
    }

    fn overlay(&self) -> Option<InterruptOverlay> {
        self.with_wire(|w| w.overlay)
    }

    fn release_interrupt_guard(&self) {
        self.with_wire(|w| {
            if let Some(overlay) = w.overlay.as_mut() {
                overlay.release();
            }
        });
    }

    /// Whether a read-and-clear round trip is running.
    pub fn is_handling_interrupt(&self) -> bool {
        self.overlay().is_some_and(|o| o.is_handling())
    }

    /// Interrupt-line entry point, from the pin's edge interrupt.
    ///
    /// Starts a read-and-clear round trip unless one is already running.
    ///
    /// # Errors
    /// * [`LinkError::InterruptRegisters`] - interrupts are not enabled
    /// * [`LinkError::QueueFull`] - the flags read could not be queued
    pub fn on_interrupt(&self) -> Result<(), LinkError> {
        let started = self.with_wire(|w| w.overlay.as_mut().map(InterruptOverlay::try_begin));
        let overlay = match started {
            None => return Err(LinkError::InterruptRegisters),
            Some(false) => return Ok(()),
            Some(true) => self.overlay().ok_or(LinkError::InterruptRegisters)?,
        };

        let queued = Transfer::read(overlay.config.flags_register, &[overlay.width as u16])
            .and_then(|t| {
                self.core
                    .enqueue(t.with_notify(Notify::Internal(InternalOp::InterruptFlags)))
            });
        if let Err(err) = queued {
            self.release_interrupt_guard();
            return Err(err);
        }
        self.bus().start_next();
        Ok(())
    }

    /// Foreground poll of an active-low interrupt line. Returns whether a
    /// round trip was started.
    pub fn poll_interrupt_line<P: InputPin>(&self, pin: &mut P) -> Result<bool, LinkError> {
        if self.is_handling_interrupt() {
            return Ok(false);
        }
        let asserted = match pin.is_low() {
            Ok(low) => low,
            Err(_) => {
                log::warn!("dev {:#04x}: failed to read interrupt line", self.device());
                false
            }
        };
        if !asserted {
            return Ok(false);
        }
        self.on_interrupt()?;
        Ok(self.is_handling_interrupt())
    }

    /// Writes the mask register and reads it back.
    pub fn set_interrupt_mask_async(
        &self,
        mask: u16,
        callback: Option<TransferCallback>,
    ) -> Result<(), LinkError> {
        let overlay = self.overlay().ok_or(LinkError::InterruptRegisters)?;
        let bytes = mask.to_le_bytes();
        self.write_and_verify_async(overlay.config.mask_register, &bytes[..overlay.width], callback)
    }

    pub fn set_interrupt_mask(&self, mask: u16) -> Result<(), LinkError> {
        let overlay = self.overlay().ok_or(LinkError::InterruptRegisters)?;
        let bytes = mask.to_le_bytes();
        self.write_and_verify(overlay.config.mask_register, &bytes[..overlay.width])
    }

    /// Mask as last seen on the wire, from the register table.
    pub fn interrupt_mask(&self) -> Result<u16, LinkError> {
        let overlay = self.overlay().ok_or(LinkError::InterruptRegisters)?;
        self.core
            .with_registers(|r| r.at(overlay.config.mask_register).map(|b| scalar(b) as u16))
    }

    pub(crate) fn tick_interrupt_guard(&self) {
        let expired = self.with_wire(|w| w.overlay.as_mut().is_some_and(InterruptOverlay::tick));
        if expired {
            log::warn!("dev {:#04x}: interrupt handling timed out", self.device());
        }
    }

    /// Completion of a link-private transfer.
    pub(crate) fn on_internal(&self, op: InternalOp, done: &Transfer) {
        match op {
            InternalOp::InterruptFlags => self.on_flags_read(done),
            InternalOp::InterruptClear => {
                if !done.outcome().success {
                    log::warn!("dev {:#04x}: failed to clear interrupt flags", self.device());
                }
                self.release_interrupt_guard();
            }
        }
    }

    fn on_flags_read(&self, done: &Transfer) {
        let Some(overlay) = self.overlay() else {
            return;
        };
        let outcome = done.outcome();
        if !outcome.success {
            log::warn!("dev {:#04x}: failed to read interrupt flags", self.device());
            self.release_interrupt_guard();
            return;
        }

        let flags = outcome.value;
        let register = overlay.config.flags_register;
        let clear = overlay.clear_value(flags).to_le_bytes();
        let queued = Transfer::write(register, &[overlay.width as u16], &clear[..overlay.width])
            .and_then(|t| {
                self.core
                    .enqueue(t.with_notify(Notify::Internal(InternalOp::InterruptClear)))
            });
        match queued {
            Ok(_) => self.bus().start_next(),
            Err(err) => {
                log::warn!("dev {:#04x}: cannot queue flag clear: {}", self.device(), err);
                self.release_interrupt_guard();
            }
        }

        match overlay.classify(flags) {
            Dispatch::DeviceReset => self.core.device_reset(flags),
            Dispatch::Interrupt => self.core.emit(
                &LinkEvent::new(EventMask::INTERRUPT)
                    .with_register(register)
                    .with_value(flags)
                    .with_data(outcome.data),
            ),
        }
    }
}
