//! Connection state of a finder device.
//!
//! Only the command queue drives these transitions; everything else observes
//! them through [`FinderDevice::connection_state`](super::FinderDevice::connection_state)
//! or [`FinderDevice::subscribe_state`](super::FinderDevice::subscribe_state).

/// Connection state for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No link to the device.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Linked and idle.
    Connected,
    /// Linked with GATT operations outstanding.
    Communicating,
}

impl ConnectionState {
    /// Check if a link is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Communicating)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Communicating => write!(f, "Communicating"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The stable id of the device.
    pub device_id: String,
    /// The state before the change.
    pub previous: ConnectionState,
    /// The new connection state.
    pub state: ConnectionState,
}
