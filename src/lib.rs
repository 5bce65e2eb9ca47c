//! A `no_std`, no-alloc register transport for multi-chip embedded controllers.
//!
//! Every peripheral chip is modelled as a table of up to 256 byte-addressed
//! registers of fixed, declared sizes. The controller keeps a local copy of
//! that table and moves bytes to and from the device over one of two wires:
//!
//! - **Shared bus** - several devices on one I²C-style bus. A [`BusArbiter`]
//!   serializes their [`BusLink`]s, frames carry one CRC-8 per register, and
//!   a hung bus is recovered through its hardware reset line.
//! - **Point-to-point serial** - one device per UART. [`SerialLink`] frames are
//!   byte-stuffed, protected by CRC-16, and may arrive unsolicited when the
//!   device changes a register on its own.
//!
//! Both implement [`ModuleLink`], so device drivers never see the wire.
//!
//! # Features
//!
//! - **Zero heap allocation** - queues, tables and buffers are `heapless`
//! - **Interrupt safe** - shared state lives behind `critical-section`
//! - **Sync and async access** - blocking calls or queued transfers with callbacks
//! - **Bounded retries** - transient wire errors are retried silently
//! - **Observers** - register changes, errors, device resets and interrupts
//!
//! # Architecture
//!
//! ```text
//!  device drivers ──▶ ModuleLink ──┬──▶ BusLink ──▶ BusArbiter ──▶ BusDriver
//!        ▲                         │       ▲            │
//!        │                         │       └─ ISR ◀─────┘ (complete / error)
//!        │                         │
//!        │                         └──▶ SerialLink ──▶ SerialDriver
//!        │                                  ▲              │
//!        │                                  └── ISR ◀──────┘ (rx chunks / error)
//!        │
//!   observers / callbacks ◀── loop_tasks() (foreground, every tick)
//! ```
//!
//! - **Interrupt handlers** only move bytes and hand results over
//! - **`loop_tasks`** decodes, updates the table, runs callbacks and observers,
//!   and starts the next transfer
//! - **Callbacks** fire exactly once per asynchronous transfer, after retries
//!
//! # Example
//!
//! ```rust,no_run
//! use embedded_modlink::prelude::*;
//!
//! // Written once against the trait, used over either wire.
//! fn set_volume<L: ModuleLink>(amp: &L, level: u16) -> Result<u16, LinkError> {
//!     amp.write_register16(0x01, level)?;
//!     amp.read_register16(0x01)
//! }
//!
//! fn log_faults(event: &LinkEvent<'_>) -> Result<(), ObserverError> {
//!     if let Some(err) = event.error {
//!         let _ = (event.register, err);
//!     }
//!     Ok(())
//! }
//!
//! fn setup<L: ModuleLink>(amp: &L) -> Result<(), LinkError> {
//!     amp.on_event(EventMask::ERROR, log_faults, 1)?;
//!     set_volume(amp, 0x0140).map(|_| ())
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

pub mod transport;

pub use transport::{BusArbiter, BusLink, LinkError, ModuleLink, SerialLink};

pub mod prelude {
    pub use crate::transport::prelude::*;
}
