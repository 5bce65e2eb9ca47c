//! Register link to one device on a dedicated serial line.

pub mod frame;
mod link;

pub use frame::{ErrorCode, FrameDecoder, Inbound};
pub use link::SerialLink;
