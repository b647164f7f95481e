//! Configuration schema definitions.
//!
//! This module defines the structure of the configuration file using serde.
//! Every section has defaults, so an empty file is valid; only `serial.port`
//! has no default and is checked when settings are built.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::forwarder::FailurePolicy;
use crate::port::Parity;
use crate::queue::OverflowPolicy;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial line configuration
    pub serial: SerialConfig,
    /// Queue, loop and ownership configuration
    pub bridge: BridgeConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Serial line configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port identifier, e.g. `/dev/ttyACM0` or `COM5`
    pub port: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits per character (5-8)
    pub byte_size: u8,
    /// Parity: "none"/"N", "even"/"E", "odd"/"O"
    pub parity: Parity,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Read timeout in milliseconds. Unset blocks, 0 never waits.
    pub read_timeout_ms: Option<u64>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            byte_size: 8,
            parity: Parity::None,
            stop_bits: 1,
            read_timeout_ms: None,
        }
    }
}

/// Bridge section: loop cadence, queues, ownership and fault handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How long the forwarder waits for outbound work per iteration
    pub outbound_poll_timeout_ms: u64,
    /// How long a non-blocking `read` waits before returning empty
    pub inbound_poll_timeout_ms: u64,
    /// How long the dispatch loop waits for inbound work per iteration
    pub dispatch_poll_interval_ms: u64,
    /// Lock file path; defaults to `.running` in the app data directory
    pub lock_file: Option<PathBuf>,
    /// Pause between clearing a stale owner and claiming again
    pub claim_backoff_ms: u64,
    /// What the forwarder does when the device fails
    pub failure_policy: FailurePolicy,
    /// Pause after a device fault under `log_and_continue`
    pub failure_backoff_ms: u64,
    /// Maximum messages per queue; unset means unbounded
    pub queue_capacity: Option<usize>,
    /// Behaviour of a full queue
    pub overflow: OverflowPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            outbound_poll_timeout_ms: 100,
            inbound_poll_timeout_ms: 100,
            dispatch_poll_interval_ms: 10,
            lock_file: None,
            claim_backoff_ms: 100,
            failure_policy: FailurePolicy::FailFast,
            failure_backoff_ms: 500,
            queue_capacity: None,
            overflow: OverflowPolicy::Reject,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Log format: "pretty" or "compact"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty format with colors
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}
