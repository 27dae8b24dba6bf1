// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # xyfinder-rust-ble
//!
//! A cross-platform Rust library for tracking and commanding XY Finder
//! Bluetooth Low Energy beacons.
//!
//! ## Features
//!
//! - **Presence Tracking**: `entered`, `detected` and `exited` events per
//!   device, with signal floors, family filters and staleness handling
//! - **Foreground and Background Scanning**: continuous scanning or a
//!   power-saving duty cycle
//! - **Command Queues**: ordered GATT reads and writes per device, with
//!   on-demand connection, per-operation timeouts and idle disconnect
//! - **Event Bus**: keyed subscriptions filtered by event kind
//! - **Pluggable Radio**: everything runs over the [`RadioAdapter`] trait;
//!   [`BtleplugRadio`] drives the system Bluetooth stack
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use xyfinder_rust_ble::{DeviceManager, EventKind, FinderSong, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = DeviceManager::new().await?;
//!
//!     let _presence = manager.subscribe(
//!         &[EventKind::Entered, EventKind::Exited],
//!         "presence",
//!         |event| println!("{:?}: {}", event.kind(), event.device().id()),
//!     )?;
//!
//!     manager.start_scanning().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     if let Some(device) = manager.nearest_device() {
//!         println!("Firmware: {}", manager.read_version(&device).await?);
//!         manager.find(&device, FinderSong::FindIt).await?;
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and data
//!   types

// Public modules
pub mod ble;
pub mod command;
pub mod config;
pub mod device;
pub mod device_manager;
pub mod error;
pub mod events;
pub mod scan;

// Re-exports for convenience
pub use device_manager::DeviceManager;
pub use error::{Error, Result};

// Re-export commonly used types from submodules
pub use ble::{BtleplugRadio, IBeacon, PowerState, RadioAdapter, RadioEvent, ScanMode, Sighting};
pub use command::{CommandQueue, GattOperation, GattValue, OperationKind};
pub use config::{CommandConfig, EngineConfig, ScanConfig};
pub use device::{
    ConnectionEvent, ConnectionState, DeviceFamily, DeviceSnapshot, FinderDevice, FinderSong,
    Proximity, ProximityThresholds,
};
pub use events::{
    ButtonPress, EventBus, EventKind, FinderEvent, SubscriptionHandle, TimeoutKind,
};
pub use scan::{ScanOrchestrator, ScanState, ScanStatus};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<DeviceManager>();
        let _ = std::any::TypeId::of::<FinderDevice>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<EventBus>();
        let _ = std::any::TypeId::of::<FinderEvent>();
        let _ = std::any::TypeId::of::<GattOperation>();
        let _ = std::any::TypeId::of::<ScanStatus>();
        let _ = std::any::TypeId::of::<EngineConfig>();
    }

    #[test]
    fn test_device_manager_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DeviceManager>();
        assert_send_sync::<FinderDevice>();
        assert_send_sync::<EventBus>();
    }
}
