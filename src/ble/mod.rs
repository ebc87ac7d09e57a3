//! BLE communication module.
//!
//! This module provides the link abstraction the session runs on, the
//! connection state machine built on top of it, and the `btleplug`
//! transport used with real hardware.

pub mod btleplug_link;
pub mod connection;
pub mod link;
pub mod uuids;

#[cfg(test)]
pub(crate) mod fake;

pub use btleplug_link::{BtleplugHandle, BtleplugLink};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use link::{BleLink, FrameSink, LinkLossSink};
pub use uuids::*;
