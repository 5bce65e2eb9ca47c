//! Fixed capacities and runtime tunables.
//!
//! Capacities are compile-time constants so every queue and scratch buffer
//! can live in a `heapless` container. Timing values are runtime structs with
//! defaults matching a 10 ms foreground loop period.

/// Number of addressable registers per device.
pub const REGISTER_COUNT: usize = 256;

/// Largest payload, in bytes, a single transfer descriptor can carry.
pub const MAX_TRANSFER_BYTES: usize = 64;

/// Largest number of consecutive registers in one burst transfer.
pub const MAX_BURST_REGISTERS: usize = 16;

/// Pending (and completed) descriptors per link.
pub const QUEUE_DEPTH: usize = 8;

/// Observer registrations per link.
pub const MAX_OBSERVERS: usize = 8;

/// Shared-bus wire buffer: payload plus one checksum byte per register.
pub const BUS_WIRE_CAPACITY: usize = MAX_TRANSFER_BYTES + MAX_BURST_REGISTERS;

/// Unescaped serial frame body: type, address, payload and a 16-bit check.
pub const SERIAL_BODY_CAPACITY: usize = MAX_TRANSFER_BYTES + 4;

/// Escaped serial frame including start and end bytes.
pub const SERIAL_FRAME_CAPACITY: usize = 2 * SERIAL_BODY_CAPACITY + 2;

/// Serial receive ring fed from interrupt-delivered chunks.
pub const SERIAL_RX_CAPACITY: usize = 256;

/// Per-link transfer behaviour on the shared bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusLinkConfig {
    /// Silent retries after the first attempt.
    pub retries: u8,
    /// Append and verify a CRC-8 per register.
    pub use_crc: bool,
    /// How long a synchronous call waits for the bus to become idle.
    pub blocking_timeout_ms: u32,
}

impl BusLinkConfig {
    pub const fn new() -> Self {
        Self {
            retries: 3,
            use_crc: true,
            blocking_timeout_ms: 20,
        }
    }

    pub const fn with_retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }

    pub const fn with_crc(mut self, use_crc: bool) -> Self {
        self.use_crc = use_crc;
        self
    }

    pub const fn with_blocking_timeout_ms(mut self, ms: u32) -> Self {
        self.blocking_timeout_ms = ms;
        self
    }
}

impl Default for BusLinkConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Watchdog and reset timing for one shared bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Ticks an asynchronous operation may stay outstanding.
    pub nonidle_timeout_ticks: u16,
    /// Ticks the peripheral may report busy while no operation is outstanding.
    pub peripheral_busy_timeout_ticks: u16,
    /// Hold and settle time of the hardware reset line.
    pub reset_settle_ms: u32,
    /// Timeout handed to the driver's blocking primitives.
    pub blocking_timeout_ms: u32,
}

impl BusConfig {
    pub const fn new() -> Self {
        Self {
            nonidle_timeout_ticks: 20,
            peripheral_busy_timeout_ticks: 10,
            reset_settle_ms: 1,
            blocking_timeout_ms: 20,
        }
    }

    pub const fn with_nonidle_timeout_ticks(mut self, ticks: u16) -> Self {
        self.nonidle_timeout_ticks = ticks;
        self
    }

    pub const fn with_peripheral_busy_timeout_ticks(mut self, ticks: u16) -> Self {
        self.peripheral_busy_timeout_ticks = ticks;
        self
    }

    pub const fn with_reset_settle_ms(mut self, ms: u32) -> Self {
        self.reset_settle_ms = ms;
        self
    }

    pub const fn with_blocking_timeout_ms(mut self, ms: u32) -> Self {
        self.blocking_timeout_ms = ms;
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-to-point serial link behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfig {
    /// Silent retries after the first attempt.
    pub retries: u8,
    /// Loop ticks a request may wait for its response.
    pub command_timeout_ticks: u16,
    /// How long a synchronous call polls for its response.
    pub blocking_timeout_ms: u32,
    /// Append and verify a CRC-16 per frame.
    pub use_crc: bool,
}

impl SerialConfig {
    pub const fn new() -> Self {
        Self {
            retries: 3,
            command_timeout_ticks: 20,
            blocking_timeout_ms: 200,
            use_crc: true,
        }
    }

    pub const fn with_retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }

    pub const fn with_command_timeout_ticks(mut self, ticks: u16) -> Self {
        self.command_timeout_ticks = ticks;
        self
    }

    pub const fn with_blocking_timeout_ms(mut self, ms: u32) -> Self {
        self.blocking_timeout_ms = ms;
        self
    }

    pub const fn with_crc(mut self, use_crc: bool) -> Self {
        self.use_crc = use_crc;
        self
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Location and semantics of a device's interrupt mask/flags register pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayConfig {
    pub mask_register: u8,
    pub flags_register: u8,
    /// Flags value a device reports right after it (re)booted.
    pub reset_sentinel: u16,
    /// Loop ticks before an unfinished read-and-clear releases the guard.
    pub handling_timeout_ticks: u16,
}

impl OverlayConfig {
    pub const fn new() -> Self {
        Self {
            mask_register: 0x10,
            flags_register: 0x11,
            reset_sentinel: 0,
            handling_timeout_ticks: 10,
        }
    }

    pub const fn with_registers(mut self, mask: u8, flags: u8) -> Self {
        self.mask_register = mask;
        self.flags_register = flags;
        self
    }

    pub const fn with_reset_sentinel(mut self, sentinel: u16) -> Self {
        self.reset_sentinel = sentinel;
        self
    }

    pub const fn with_handling_timeout_ticks(mut self, ticks: u16) -> Self {
        self.handling_timeout_ticks = ticks;
        self
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self::new()
    }
}
