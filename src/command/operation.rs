//! GATT operations and their results.

use bytes::Bytes;

use crate::ble::uuids::GattCharacteristic;
use crate::error::{Error, Result};
use crate::events::TimeoutKind;

/// What a [`GattOperation`] does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Read the characteristic value.
    Read,
    /// Write the given value.
    Write(Bytes),
}

/// A single characteristic read or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattOperation {
    /// Target characteristic.
    pub characteristic: GattCharacteristic,
    /// Read or write.
    pub kind: OperationKind,
}

impl GattOperation {
    /// Read `characteristic`.
    pub fn read(characteristic: GattCharacteristic) -> Self {
        Self {
            characteristic,
            kind: OperationKind::Read,
        }
    }

    /// Write `value` to `characteristic`.
    pub fn write(characteristic: GattCharacteristic, value: impl Into<Bytes>) -> Self {
        Self {
            characteristic,
            kind: OperationKind::Write(value.into()),
        }
    }

    /// Whether this is a read.
    pub fn is_read(&self) -> bool {
        matches!(self.kind, OperationKind::Read)
    }

    /// Timeout phase reported if this operation does not complete in time.
    pub fn timeout_kind(&self) -> TimeoutKind {
        match self.kind {
            OperationKind::Read => TimeoutKind::GetOperation,
            OperationKind::Write(_) => TimeoutKind::SetOperation,
        }
    }
}

impl std::fmt::Display for GattOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OperationKind::Read => write!(f, "read {}", self.characteristic),
            OperationKind::Write(value) => {
                write!(f, "write {} ({} bytes)", self.characteristic, value.len())
            }
        }
    }
}

/// Result of one completed operation.
///
/// Reads carry the value read; writes carry the value written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattValue {
    /// The characteristic operated on.
    pub characteristic: GattCharacteristic,
    /// Value read or written.
    pub data: Bytes,
}

impl GattValue {
    /// Decode the value as UTF-8, trimming trailing NULs.
    pub fn as_string(&self) -> Result<String> {
        let text = std::str::from_utf8(&self.data).map_err(|e| Error::InvalidData {
            context: format!("{} is not UTF-8: {}", self.characteristic, e),
        })?;
        Ok(text.trim_end_matches('\0').to_string())
    }

    /// First byte of the value.
    pub fn as_u8(&self) -> Option<u8> {
        self.data.first().copied()
    }
}
