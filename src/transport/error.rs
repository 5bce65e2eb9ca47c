use embedded_hal::i2c::ErrorKind as BusErrorKind;
use embedded_io::ErrorKind as SerialErrorKind;

use crate::transport::serial::ErrorCode;

/// Errors raised by register tables, the bus arbiter and device links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// Register has a declared size of zero.
    #[error("register {0:#04x} is not defined")]
    InvalidRegister(u8),
    /// Typed accessor width does not match the declared register size.
    #[error("register {register:#04x} is {actual} bytes, accessor expects {expected}")]
    SizeMismatch {
        register: u8,
        expected: usize,
        actual: usize,
    },
    /// Size table has the wrong length or does not fit the backing buffer.
    #[error("register size table is malformed")]
    MalformedSizeTable,
    /// Operation attempted with zero length.
    #[error("operation attempted with zero length")]
    ZeroLength,
    /// Transfer exceeds the fixed frame capacity.
    #[error("transfer exceeds the maximum frame size")]
    TooLong,
    /// Burst range runs past register 0xff.
    #[error("register range runs past 0xff")]
    RegisterRange,
    /// Another hardware operation is outstanding.
    #[error("bus is busy")]
    Busy,
    /// Pending transfer queue is at capacity.
    #[error("transfer queue is full")]
    QueueFull,
    /// Arbiter has no free client slot.
    #[error("client table is full")]
    ClientTableFull,
    /// Link was used before being attached to a bus.
    #[error("link is not attached to a bus")]
    NotAttached,
    /// Shared-bus hardware reported an error.
    #[error("bus error: {0:?}")]
    Bus(BusErrorKind),
    /// Transfer was in flight when its bus or device was reset.
    #[error("link was reset")]
    BusReset,
    /// Serial hardware reported an error.
    #[error("serial error: {0:?}")]
    Serial(SerialErrorKind),
    /// Integrity check failed.
    #[error("checksum mismatch")]
    Checksum,
    /// Frame could not be parsed.
    #[error("malformed frame")]
    Format,
    /// Operation did not complete in time.
    #[error("operation timed out")]
    Timeout,
    /// Device reported an error code.
    #[error("device reported {0:?}")]
    Remote(ErrorCode),
    /// Interrupt mask/flags registers are missing, unequal or not 1 or 2 bytes.
    #[error("interrupt registers missing, unequal or of unsupported width")]
    InterruptRegisters,
    /// Read-back after a verified write returned different bytes.
    #[error("read-back does not match written value")]
    VerifyMismatch,
    /// Observer list is at capacity.
    #[error("observer table is full")]
    ObserverTableFull,
}

impl LinkError {
    /// Whether a transfer that failed with this error may be attempted again.
    ///
    /// Wire noise, integrity failures and timeouts are transient. Caller
    /// mistakes and requests the device explicitly rejected are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            LinkError::Bus(_)
            | LinkError::BusReset
            | LinkError::Serial(_)
            | LinkError::Checksum
            | LinkError::Format
            | LinkError::Timeout => true,
            LinkError::Remote(code) => code.is_retryable(),
            _ => false,
        }
    }
}
