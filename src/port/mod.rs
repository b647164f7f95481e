//! Device link layer.
//!
//! Provides the `DeviceLink` capability the forwarder thread drives, a real
//! serial implementation, and a mock for tests.

pub mod error;
pub mod mock;
pub mod serial_device;
pub mod traits;

pub use error::PortError;
pub use mock::MockDevice;
pub use serial_device::SerialDevice;
pub use traits::*;
