// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # oximeter-ble
//!
//! A cross-platform Rust library for recording readings from BLE pulse
//! oximeters that stream summary frames over a notification characteristic.
//!
//! ## Features
//!
//! - **Frame Decoding**: Turn summary frames into SpO2, pulse rate,
//!   perfusion index and finger-detection readings
//! - **Connection Management**: Connect, subscribe and tear down in one call
//!   each, with partially acquired links always released
//! - **Automatic Reconnection**: A single supervised retry loop per link
//!   loss, with a configurable delay and attempt ceiling
//! - **Consumers**: Deliver readings to any number of ordered, isolated
//!   consumers, including a CSV file store
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use oximeter_ble::{BtleplugLink, CsvReadingStore, Result, Session, SessionConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let link = Arc::new(BtleplugLink::new().await?);
//!     let config = SessionConfig::new("C4:39:30:38:17:25").with_auto_reconnect(true);
//!     let session = Session::new(config, link)?;
//!
//!     session.register_consumer(Arc::new(CsvReadingStore::create_in(".")?));
//!     session.register_fn("console", |reading| {
//!         println!("SpO2 {}%  pulse {} bpm", reading.spo2(), reading.pulse_bpm());
//!         Ok(())
//!     });
//!
//!     // Record for a minute, then disconnect and close the file.
//!     session
//!         .run_until(tokio::time::sleep(std::time::Duration::from_secs(60)))
//!         .await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. Peripherals are addressed by their
//! platform identifier rather than a MAC address.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization for [`Reading`]

// Public modules
pub mod ble;
pub mod config;
pub mod data;
pub mod error;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod supervisor;

// Re-exports for convenience
pub use config::{ReconnectPolicy, SessionConfig};
pub use error::{Error, Result};
pub use session::{
    ConsumerId, DispatchReport, FnConsumer, ReadingConsumer, Session, SessionStats,
};
pub use storage::CsvReadingStore;
pub use supervisor::{ReconnectSupervisor, RecoveryEvent};

// Re-export commonly used types from submodules
pub use ble::btleplug_link::BtleplugLink;
pub use ble::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use ble::link::BleLink;
pub use data::Reading;
pub use protocol::{decode, Rejection};
