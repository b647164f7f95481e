//! Validated, immutable settings for one bridged port.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::{ConfigError, ConfigResult};
use super::schema::{BridgeConfig, SerialConfig};
use crate::forwarder::FailurePolicy;
use crate::port::{DataBits, LineSettings, Parity, StopBits};
use crate::queue::OverflowPolicy;

/// Application name used for the per-user data directory.
pub const APP_NAME: &str = "serial-bridge";

/// File name of the ownership lock inside the data directory.
pub const LOCK_FILE_NAME: &str = ".running";

/// Everything the bridge needs to know about the port it owns.
///
/// Built once at startup, then only read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSettings {
    pub port: String,
    pub line: LineSettings,
    pub outbound_poll_timeout: Duration,
    pub inbound_poll_timeout: Duration,
    pub dispatch_poll_interval: Duration,
    pub lock_file: PathBuf,
    pub claim_backoff: Duration,
    pub failure_policy: FailurePolicy,
    pub failure_backoff: Duration,
    pub queue_capacity: Option<usize>,
    pub overflow: OverflowPolicy,
}

impl PortSettings {
    /// Settings for `port` with every other value at its default.
    pub fn new(port: impl Into<String>) -> Self {
        let bridge = BridgeConfig::default();
        Self {
            port: port.into(),
            line: LineSettings::default(),
            outbound_poll_timeout: Duration::from_millis(bridge.outbound_poll_timeout_ms),
            inbound_poll_timeout: Duration::from_millis(bridge.inbound_poll_timeout_ms),
            dispatch_poll_interval: Duration::from_millis(bridge.dispatch_poll_interval_ms),
            lock_file: default_lock_file(),
            claim_backoff: Duration::from_millis(bridge.claim_backoff_ms),
            failure_policy: bridge.failure_policy,
            failure_backoff: Duration::from_millis(bridge.failure_backoff_ms),
            queue_capacity: bridge.queue_capacity,
            overflow: bridge.overflow,
        }
    }

    /// Build settings from the serial and bridge config sections.
    ///
    /// Fails with [`ConfigError::MissingRequired`] when no port is configured.
    pub fn from_sections(serial: &SerialConfig, bridge: &BridgeConfig) -> ConfigResult<Self> {
        let port = serial
            .port
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ConfigError::MissingRequired("serial.port".to_string()))?;

        if serial.baud_rate == 0 {
            return Err(ConfigError::validation("serial.baud_rate", "must be positive"));
        }
        let data_bits = DataBits::try_from(serial.byte_size)
            .map_err(|e| ConfigError::validation("serial.byte_size", e.to_string()))?;
        let stop_bits = StopBits::try_from(serial.stop_bits)
            .map_err(|e| ConfigError::validation("serial.stop_bits", e.to_string()))?;
        if bridge.queue_capacity == Some(0) {
            return Err(ConfigError::validation(
                "bridge.queue_capacity",
                "must be at least 1 when set",
            ));
        }

        Ok(Self {
            port: port.to_string(),
            line: LineSettings {
                baud_rate: serial.baud_rate,
                data_bits,
                parity: serial.parity,
                stop_bits,
                read_timeout: serial.read_timeout_ms.map(Duration::from_millis),
            },
            outbound_poll_timeout: Duration::from_millis(bridge.outbound_poll_timeout_ms),
            inbound_poll_timeout: Duration::from_millis(bridge.inbound_poll_timeout_ms),
            dispatch_poll_interval: Duration::from_millis(bridge.dispatch_poll_interval_ms),
            lock_file: bridge.lock_file.clone().unwrap_or_else(default_lock_file),
            claim_backoff: Duration::from_millis(bridge.claim_backoff_ms),
            failure_policy: bridge.failure_policy,
            failure_backoff: Duration::from_millis(bridge.failure_backoff_ms),
            queue_capacity: bridge.queue_capacity,
            overflow: bridge.overflow,
        })
    }

    pub fn with_lock_file(mut self, path: impl AsRef<Path>) -> Self {
        self.lock_file = path.as_ref().to_path_buf();
        self
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.line.baud_rate = baud_rate;
        self
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.line.parity = parity;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.line.read_timeout = timeout;
        self
    }

    pub fn with_outbound_poll_timeout(mut self, timeout: Duration) -> Self {
        self.outbound_poll_timeout = timeout;
        self
    }

    pub fn with_inbound_poll_timeout(mut self, timeout: Duration) -> Self {
        self.inbound_poll_timeout = timeout;
        self
    }

    pub fn with_dispatch_poll_interval(mut self, interval: Duration) -> Self {
        self.dispatch_poll_interval = interval;
        self
    }

    pub fn with_claim_backoff(mut self, backoff: Duration) -> Self {
        self.claim_backoff = backoff;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy, backoff: Duration) -> Self {
        self.failure_policy = policy;
        self.failure_backoff = backoff;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        self.queue_capacity = capacity;
        self.overflow = overflow;
        self
    }
}

/// `.running` inside the per-user data directory, or the working directory
/// when no home directory can be determined.
pub fn default_lock_file() -> PathBuf {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.data_dir().join(LOCK_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(format!(".{}{}", APP_NAME, LOCK_FILE_NAME)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_port_is_fatal() {
        let err = PortSettings::from_sections(&SerialConfig::default(), &BridgeConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired(ref key) if key == "serial.port"));
    }

    #[test]
    fn test_blank_port_is_missing() {
        let serial = SerialConfig {
            port: Some("   ".into()),
            ..Default::default()
        };
        let err = PortSettings::from_sections(&serial, &BridgeConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired(_)));
    }

    #[test]
    fn test_defaults_from_sections() {
        let serial = SerialConfig {
            port: Some("COM5".into()),
            ..Default::default()
        };
        let settings = PortSettings::from_sections(&serial, &BridgeConfig::default()).unwrap();

        assert_eq!(settings, PortSettings::new("COM5"));
        assert_eq!(settings.line.read_timeout, None);
        assert_eq!(settings.outbound_poll_timeout, Duration::from_millis(100));
        assert_eq!(settings.inbound_poll_timeout, Duration::from_millis(100));
        assert_eq!(settings.dispatch_poll_interval, Duration::from_millis(10));
        assert!(settings.lock_file.ends_with(LOCK_FILE_NAME));
    }

    #[test]
    fn test_invalid_line_parameters() {
        let serial = SerialConfig {
            port: Some("COM5".into()),
            byte_size: 9,
            ..Default::default()
        };
        let err = PortSettings::from_sections(&serial, &BridgeConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { ref key, .. } if key == "serial.byte_size"));

        let serial = SerialConfig {
            port: Some("COM5".into()),
            stop_bits: 3,
            ..Default::default()
        };
        assert!(PortSettings::from_sections(&serial, &BridgeConfig::default()).is_err());
    }

    #[test]
    fn test_zero_read_timeout_means_non_blocking() {
        let serial = SerialConfig {
            port: Some("COM5".into()),
            read_timeout_ms: Some(0),
            ..Default::default()
        };
        let settings = PortSettings::from_sections(&serial, &BridgeConfig::default()).unwrap();
        assert_eq!(settings.line.read_timeout, Some(Duration::ZERO));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let serial = SerialConfig {
            port: Some("COM5".into()),
            ..Default::default()
        };
        let bridge = BridgeConfig {
            queue_capacity: Some(0),
            ..Default::default()
        };
        assert!(PortSettings::from_sections(&serial, &bridge).is_err());
    }
}
