//! BLE communication module.
//!
//! This module provides the radio-facing side of the crate: the abstract
//! radio capability the engine consumes, its btleplug implementation,
//! advertisement parsing, and the GATT catalog for XY Finder devices.

pub mod adapter;
pub mod advertising;
pub mod platform;
pub mod uuids;

pub use adapter::{PowerState, RadioAdapter, RadioEvent, ScanMode, Sighting};
pub use advertising::IBeacon;
pub use platform::BtleplugRadio;
pub use uuids::*;
