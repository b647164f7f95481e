//! Configuration module for serial-bridge.
//!
//! This module provides TOML-based configuration with environment variable
//! overrides, and turns it into validated [`PortSettings`].
//!
//! # Configuration Resolution
//!
//! Configuration is loaded from the following locations (in order of priority):
//!
//! 1. `SERIAL_BRIDGE_CONFIG` environment variable (explicit path)
//! 2. `./serial-bridge.toml` (current directory)
//! 3. `config.toml` in the per-user config directory
//! 4. Built-in defaults (no file required)
//!
//! # Environment Overrides
//!
//! `SERIAL_PORT`, `SERIAL_BAUDRATE`, `SERIAL_BYTESIZE`, `SERIAL_PARITY`,
//! `SERIAL_STOPBITS`, `SERIAL_TIMEOUT`, `SERIAL_F2SQ_TIMEOUT`,
//! `SERIAL_F2SQ_SLEEP`, `SERIAL_OUTBOUND_POLL_MS`, `SERIAL_INBOUND_POLL_MS`,
//! `SERIAL_DISPATCH_POLL_MS`, `SERIAL_LOCK_FILE` and `SERIAL_FAILURE_POLICY`
//! override the file. `SERIAL_TIMEOUT` and the `F2SQ` keys are in seconds
//! (`0.1`), the `*_MS` keys in milliseconds.
//!
//! # Example
//!
//! ```rust,no_run
//! use serial_bridge::config::ConfigLoader;
//!
//! let loader = ConfigLoader::load()?;
//! let settings = loader.port_settings()?;
//! println!("Bridging {} at {}", settings.port, settings.line);
//! # Ok::<(), serial_bridge::config::ConfigError>(())
//! ```

mod error;
mod loader;
mod schema;
mod settings;

pub use error::{ConfigError, ConfigResult};
pub use loader::{apply_overrides, get_default_config_path, resolve_config_path, ConfigLoader};
pub use schema::{BridgeConfig, Config, LogFormat, LoggingConfig, SerialConfig};
pub use settings::{default_lock_file, PortSettings, APP_NAME, LOCK_FILE_NAME};
