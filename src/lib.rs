//! Serial Bridge Library
//!
//! Shares one serial device between several consumers in a process. A
//! single forwarder thread owns the device and shuttles lines between it and
//! two in-memory queues; a dispatch thread routes inbound lines to handlers
//! by their first character; a singleton guard makes sure only the newest
//! bridge for a given port keeps forwarding.
//!
//! # Modules
//!
//! - `bridge`: The [`Bridge`] facade applications talk to
//! - `config`: TOML configuration, environment overrides and [`PortSettings`]
//! - `dispatch`: Handler registry and the dispatch loop
//! - `error`: Unified error handling
//! - `forwarder`: The device-owning forwarder loop
//! - `guard`: Process-wide ownership markers and the lock file
//! - `logging`: Tracing subscriber setup
//! - `port`: Device link abstraction, serial and mock implementations
//! - `queue`: Thread-safe FIFO message queues

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod forwarder;
pub mod guard;
pub mod logging;
pub mod port;
pub mod queue;

// Re-export commonly used types for convenience
pub use bridge::{Bridge, SynchronousScope};
pub use config::{Config, ConfigError, ConfigLoader, ConfigResult, PortSettings};
pub use dispatch::{DispatchState, DispatchThread, Handler, HandlerRegistry};
pub use error::{BridgeError, BridgeResult};
pub use forwarder::{FailurePolicy, ForwarderExit};
pub use guard::{MemoryMarkers, SingletonGuard};
pub use port::{
    DataBits, DeviceLink, LineSettings, MockDevice, Parity, PortError, SerialDevice, StopBits,
};
pub use queue::{Message, MessageQueue, OverflowPolicy};
