//! Register link to one device on a shared bus.

pub mod frame;
mod link;

pub use link::BusLink;
