//! Error types for the xyfinder-rust-ble crate.

use std::sync::Arc;

use thiserror::Error;

/// The main error type for this crate.
///
/// Errors are `Clone` so that a single failure can be handed to every
/// operation drained from a device's command queue.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(Arc<btleplug::Error>),

    /// The radio is not powered on.
    #[error("Bluetooth radio is not powered on")]
    NotPoweredOn,

    /// Operation attempted with no live link and connecting failed.
    #[error("Device not connected")]
    NotConnected,

    /// Connecting to the device did not complete in time.
    #[error("Connection timed out")]
    ConnectionTimeout,

    /// A GATT operation did not complete in time.
    #[error("GATT operation timed out")]
    OperationTimeout,

    /// Unexpected disconnect or a radio-reported link failure.
    #[error("Connection error: {reason}")]
    ConnectionError {
        /// Description of the failure.
        reason: String,
    },

    /// The operation was drained because its queue was torn down.
    #[error("Operation cancelled")]
    Cancelled,

    /// No device with the given identifier is known.
    #[error("Device not found: {identifier}")]
    DeviceNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// The identifier or beacon UUID does not belong to a known family.
    #[error("Unknown device family: {identifier}")]
    UnknownFamily {
        /// The identifier that could not be classified.
        identifier: String,
    },

    /// Invalid data was received from the radio.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is one of the timeout variants.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectionTimeout | Self::OperationTimeout)
    }

    /// Whether this error means the link is unusable.
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            Self::NotPoweredOn
                | Self::NotConnected
                | Self::ConnectionTimeout
                | Self::ConnectionError { .. }
                | Self::Bluetooth(_)
        )
    }
}

impl From<btleplug::Error> for Error {
    fn from(err: btleplug::Error) -> Self {
        Self::Bluetooth(Arc::new(err))
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
