use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::port::PortError;

/// A specialized `Result` type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Unified bridge error type.
///
/// Empty queues and read timeouts are not errors anywhere in the bridge;
/// they surface as empty results instead.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Settings could not be built. Raised before any thread starts.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The device link failed while the forwarder was driving it.
    #[error("Device I/O error on {port}: {source}")]
    DeviceIo {
        port: String,
        #[source]
        source: PortError,
    },

    /// The lock file could not be created, read or removed.
    #[error("Lock file error at '{path}': {source}")]
    LockFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Ownership of the port kept bouncing between incarnations.
    #[error("Could not claim ownership of {port} after {attempts} attempts")]
    OwnershipConflict { port: String, attempts: u32 },

    /// A bounded queue rejected a message.
    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// An inbound line was not valid UTF-8.
    #[error("Inbound message is not valid UTF-8: {0}")]
    Decode(#[from] std::string::FromUtf8Error),

    /// `run` was called while this bridge's forwarder is still alive.
    #[error("Bridge for {0} is already running")]
    AlreadyRunning(String),

    /// A handler tried to stop the dispatch loop it is running on, through
    /// a synchronous scope or a shutdown.
    #[error("Cannot suspend or stop dispatch from inside a message handler")]
    ReentrantDispatch,

    /// A worker thread could not be started.
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A worker thread panicked instead of returning.
    #[error("The {0} thread panicked")]
    ThreadPanicked(&'static str),
}

impl BridgeError {
    pub(crate) fn device(port: impl Into<String>, source: PortError) -> Self {
        Self::DeviceIo {
            port: port.into(),
            source,
        }
    }

    pub(crate) fn lock_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LockFile {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_keeps_source() {
        let err = BridgeError::device("COM5", PortError::NotOpen);
        assert_eq!(err.to_string(), "Device I/O error on COM5: link is not open");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_config_error_is_transparent() {
        let err: BridgeError = ConfigError::MissingRequired("serial.port".into()).into();
        assert_eq!(
            err.to_string(),
            "Missing required configuration: serial.port"
        );
    }

    #[test]
    fn test_decode_error_conversion() {
        let err: BridgeError = String::from_utf8(vec![0xff, 0xfe]).unwrap_err().into();
        assert!(matches!(err, BridgeError::Decode(_)));
    }
}
