//! Hardware primitives the transport consumes.
//!
//! Pin and delay needs are covered by `embedded-hal` directly
//! ([`OutputPin`](embedded_hal::digital::OutputPin) for the bus reset line,
//! [`InputPin`](embedded_hal::digital::InputPin) for interrupt lines,
//! [`DelayNs`](embedded_hal::delay::DelayNs) for settle and poll delays).
//! The traits here describe the bus and UART peripherals, which need both a
//! blocking and an interrupt-driven path that `embedded-hal` does not combine.

/// One physical shared bus with register-addressed transfers.
///
/// Non-blocking transfers complete through an interrupt that the firmware
/// forwards to [`BusArbiter::on_transfer_complete`](crate::transport::arbiter::BusArbiter::on_transfer_complete)
/// or [`BusArbiter::on_bus_error`](crate::transport::arbiter::BusArbiter::on_bus_error).
pub trait BusDriver {
    type Error: embedded_hal::i2c::Error;

    /// Brings the peripheral up, including its hardware watchdogs.
    fn init(&mut self) -> Result<(), Self::Error>;

    fn deinit(&mut self);

    /// Peripheral-level busy state (e.g. the bus is held low), independent of
    /// whether this driver has an operation outstanding.
    fn is_peripheral_busy(&mut self) -> bool;

    /// Blocking register read of `buf.len()` bytes.
    fn read(
        &mut self,
        device: u8,
        register: u8,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<(), Self::Error>;

    fn write(
        &mut self,
        device: u8,
        register: u8,
        data: &[u8],
        timeout_ms: u32,
    ) -> Result<(), Self::Error>;

    /// Starts a non-blocking read of `len` bytes into a driver-owned buffer.
    fn start_read(&mut self, device: u8, register: u8, len: usize) -> Result<(), Self::Error>;

    /// Starts a non-blocking write. The driver copies `data`.
    fn start_write(&mut self, device: u8, register: u8, data: &[u8]) -> Result<(), Self::Error>;

    /// Bytes of the last completed non-blocking read.
    fn received(&self) -> &[u8];
}

/// One dedicated UART line.
///
/// Received bytes arrive through
/// [`SerialLink::on_receive`](crate::transport::serial::SerialLink::on_receive)
/// from the firmware's receive interrupt.
pub trait SerialDriver {
    type Error: embedded_io::Error;

    /// Starts transmitting a complete frame. The driver copies `frame`.
    fn start_transmit(&mut self, frame: &[u8]) -> Result<(), Self::Error>;

    fn is_transmitting(&mut self) -> bool;

    /// (Re)arms chunked reception.
    fn start_receive(&mut self) -> Result<(), Self::Error>;

    /// Aborts any transmission and reception in progress.
    fn abort(&mut self);
}
