//! Transport abstraction for the oximeter link.
//!
//! [`BleLink`] is the minimal capability surface the session needs from a
//! Bluetooth stack. [`crate::ble::BtleplugLink`] implements it on top of
//! `btleplug`; tests use an in-memory fake.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;

/// Receives raw notification frames, in the order the peripheral sent them.
pub type FrameSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Receives unsolicited link losses with an optional reason.
pub type LinkLossSink = Arc<dyn Fn(Option<String>) + Send + Sync>;

/// A Bluetooth transport able to hold a notification link to one peripheral.
///
/// Callbacks handed to [`BleLink::subscribe`] and [`BleLink::watch_link_loss`]
/// are invoked from the transport's own tasks and must return quickly.
#[async_trait]
pub trait BleLink: Send + Sync + 'static {
    /// A live link to a peripheral.
    type Handle: Send + Sync + 'static;

    /// Acquire a link to the peripheral at `address`.
    async fn connect(&self, address: &str) -> Result<Self::Handle>;

    /// Start delivering notifications from `characteristic` to `sink`.
    async fn subscribe(
        &self,
        handle: &Self::Handle,
        characteristic: &Uuid,
        sink: FrameSink,
    ) -> Result<()>;

    /// Stop delivering notifications from `characteristic`.
    async fn unsubscribe(&self, handle: &Self::Handle, characteristic: &Uuid) -> Result<()>;

    /// Release the link.
    async fn disconnect(&self, handle: &Self::Handle) -> Result<()>;

    /// Report an unsolicited drop of this link to `sink`.
    async fn watch_link_loss(&self, handle: &Self::Handle, sink: LinkLossSink) -> Result<()>;
}
