pub mod arbiter;
pub mod bus;
pub mod config;
pub mod crc;
pub mod error;
pub mod event;
pub mod hal;
pub mod link;
mod overlay;
pub mod queue;
pub mod regs;
pub mod serial;

#[cfg(test)]
mod test_support;

pub use arbiter::{BusArbiter, BusClient, ClientToken, SharedBus};
pub use bus::BusLink;
pub use config::{BusConfig, BusLinkConfig, OverlayConfig, SerialConfig};
pub use error::LinkError;
pub use event::{EventMask, LinkEvent, Observer, ObserverError};
pub use hal::{BusDriver, SerialDriver};
pub use link::{LinkCore, ModuleLink};
pub use queue::{Direction, Payload, Transfer, TransferCallback, TransferOutcome};
pub use regs::RegisterTable;
pub use serial::{ErrorCode, SerialLink};

pub mod prelude {
    pub use super::{
        BusArbiter, BusClient, BusConfig, BusDriver, BusLink, BusLinkConfig, ClientToken,
        Direction, ErrorCode, EventMask, LinkCore, LinkError, LinkEvent, ModuleLink, Observer,
        ObserverError, OverlayConfig, Payload, RegisterTable, SerialConfig, SerialDriver,
        SerialLink, SharedBus, TransferCallback, TransferOutcome,
    };
}
