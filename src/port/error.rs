//! Device-level error types.
//!
//! Kept separate from [`crate::error::BridgeError`] so a `DeviceLink`
//! implementation never needs to know about queues or ownership.

use thiserror::Error;

/// Errors raised by a [`DeviceLink`](super::DeviceLink).
#[derive(Debug, Error)]
pub enum PortError {
    /// No device answers to this name.
    #[error("no device at {0}")]
    NotFound(String),

    /// Reading from or writing to the link failed.
    #[error("link I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Line settings the link or its driver cannot use.
    #[error("invalid line settings: {0}")]
    InvalidSettings(String),

    #[error("link is already open")]
    AlreadyOpen,

    #[error("link is not open")]
    NotOpen,

    /// Any other driver failure.
    #[error("serial driver: {0}")]
    Driver(#[from] serialport::Error),
}

impl PortError {
    pub fn not_found(device: impl Into<String>) -> Self {
        Self::NotFound(device.into())
    }

    pub fn invalid_settings(message: impl Into<String>) -> Self {
        Self::InvalidSettings(message.into())
    }

    /// Classify a driver error raised while opening `device`.
    pub fn from_open(device: &str, err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => Self::not_found(device),
            serialport::ErrorKind::InvalidInput => Self::invalid_settings(err.to_string()),
            serialport::ErrorKind::Io(kind) if kind == std::io::ErrorKind::NotFound => {
                Self::not_found(device)
            }
            _ => Self::Driver(err),
        }
    }
}
