//! Error types for the oximeter-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No peripheral with the configured address could be found.
    #[error("Peripheral not found: {address}")]
    PeripheralNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// Failed to acquire a link to the peripheral.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The peripheral refused the notification subscription.
    #[error("Subscription to {characteristic} failed: {reason}")]
    SubscribeFailed {
        /// The characteristic that was subscribed to.
        characteristic: String,
        /// Description of the failure.
        reason: String,
    },

    /// Stopping notifications failed during teardown.
    #[error("Unsubscribe from {characteristic} failed: {reason}")]
    UnsubscribeFailed {
        /// The characteristic that was unsubscribed from.
        characteristic: String,
        /// Description of the failure.
        reason: String,
    },

    /// Releasing the link handle failed.
    #[error("Releasing link failed: {reason}")]
    ReleaseFailed {
        /// Description of the failure.
        reason: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// The session was created outside of a tokio runtime.
    #[error("No tokio runtime available")]
    RuntimeUnavailable,

    /// The session has been shut down.
    #[error("Session closed")]
    SessionClosed,

    /// A reading consumer reported a failure.
    #[error("Consumer {name} failed: {reason}")]
    Consumer {
        /// Name of the consumer.
        name: String,
        /// Description of the failure.
        reason: String,
    },

    /// The reading store was written to after being closed.
    #[error("Reading store closed")]
    StorageClosed,

    /// I/O error from a storage destination.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error is a link-transient condition worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Bluetooth(_)
                | Self::PeripheralNotFound { .. }
                | Self::ConnectionFailed { .. }
                | Self::SubscribeFailed { .. }
                | Self::CharacteristicNotFound { .. }
        )
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
