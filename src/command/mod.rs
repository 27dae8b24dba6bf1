//! GATT command execution.
//!
//! Commands are ordered lists of [`GattOperation`]s submitted to a device's
//! [`CommandQueue`]. Operations for one device run strictly in submission
//! order with at most one in flight.

pub mod operation;
pub mod queue;

pub use operation::{GattOperation, GattValue, OperationKind};
pub use queue::CommandQueue;
