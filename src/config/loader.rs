//! Configuration loader with file resolution and environment override support.

use super::error::{ConfigError, ConfigResult};
use super::schema::Config;
use super::settings::{PortSettings, APP_NAME};
use crate::forwarder::FailurePolicy;
use crate::port::Parity;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Config file name in the working directory
const LOCAL_CONFIG_FILE_NAME: &str = "serial-bridge.toml";

/// Config file name in the per-user config directory
const USER_CONFIG_FILE_NAME: &str = "config.toml";

/// Environment variable for explicit config path
const CONFIG_PATH_ENV: &str = "SERIAL_BRIDGE_CONFIG";

pub const PORT_ENV: &str = "SERIAL_PORT";
pub const BAUDRATE_ENV: &str = "SERIAL_BAUDRATE";
pub const BYTESIZE_ENV: &str = "SERIAL_BYTESIZE";
pub const PARITY_ENV: &str = "SERIAL_PARITY";
pub const STOPBITS_ENV: &str = "SERIAL_STOPBITS";
/// Read timeout in seconds, fractions allowed; `none` or empty waits forever.
pub const TIMEOUT_ENV: &str = "SERIAL_TIMEOUT";
/// Outbound and inbound poll timeout in seconds.
pub const F2SQ_TIMEOUT_ENV: &str = "SERIAL_F2SQ_TIMEOUT";
/// Dispatch poll interval in seconds.
pub const F2SQ_SLEEP_ENV: &str = "SERIAL_F2SQ_SLEEP";
pub const OUTBOUND_POLL_ENV: &str = "SERIAL_OUTBOUND_POLL_MS";
pub const INBOUND_POLL_ENV: &str = "SERIAL_INBOUND_POLL_MS";
pub const DISPATCH_POLL_ENV: &str = "SERIAL_DISPATCH_POLL_MS";
pub const LOCK_FILE_ENV: &str = "SERIAL_LOCK_FILE";
pub const FAILURE_POLICY_ENV: &str = "SERIAL_FAILURE_POLICY";

/// Configuration loader with resolution and override logic.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Resolved config file path (if any)
    pub config_path: Option<PathBuf>,
    /// The loaded configuration
    pub config: Config,
}

impl ConfigLoader {
    /// Load configuration using standard resolution order.
    ///
    /// Resolution priority (highest to lowest):
    /// 1. `SERIAL_BRIDGE_CONFIG` environment variable (explicit path)
    /// 2. `./serial-bridge.toml` (current directory)
    /// 3. `config.toml` in the per-user config directory
    /// 4. Built-in defaults (no file required)
    ///
    /// `SERIAL_*` environment variables override file values.
    pub fn load() -> ConfigResult<Self> {
        let config_path = resolve_config_path();

        let mut config = if let Some(ref path) = config_path {
            load_from_file(path)?
        } else {
            Config::default()
        };

        apply_env_overrides(&mut config)?;

        Ok(Self { config_path, config })
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }
        let mut config = load_from_file(&path)?;
        apply_env_overrides(&mut config)?;

        Ok(Self {
            config_path: Some(path),
            config,
        })
    }

    /// Create a loader with default configuration (no file).
    pub fn with_defaults() -> ConfigResult<Self> {
        let mut config = Config::default();
        apply_env_overrides(&mut config)?;

        Ok(Self {
            config_path: None,
            config,
        })
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Consume the loader and return the configuration.
    pub fn into_config(self) -> Config {
        self.config
    }

    /// Build validated port settings from the loaded configuration.
    pub fn port_settings(&self) -> ConfigResult<PortSettings> {
        self.config.port_settings()
    }
}

impl Config {
    /// Build validated port settings from the `[serial]` and `[bridge]`
    /// sections.
    pub fn port_settings(&self) -> ConfigResult<PortSettings> {
        PortSettings::from_sections(&self.serial, &self.bridge)
    }
}

/// Resolve the configuration file path using standard locations.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    let cwd_config = PathBuf::from(LOCAL_CONFIG_FILE_NAME);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    get_default_config_path().filter(|path| path.exists())
}

/// Get the default config file path for creating new config files.
pub fn get_default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.config_dir().join(USER_CONFIG_FILE_NAME))
}

/// Load configuration from a file.
fn load_from_file(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(ConfigError::ParseError)
}

/// Apply `SERIAL_*` environment variable overrides to the configuration.
fn apply_env_overrides(config: &mut Config) -> ConfigResult<()> {
    apply_overrides(config, |key| std::env::var(key).ok())
}

/// Apply overrides from any key/value source using the `SERIAL_*` key names.
pub fn apply_overrides<F>(config: &mut Config, lookup: F) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup(PORT_ENV) {
        config.serial.port = Some(val);
    }
    if let Some(val) = lookup(BAUDRATE_ENV) {
        config.serial.baud_rate = parse_var(BAUDRATE_ENV, &val, "Invalid baud rate")?;
    }
    if let Some(val) = lookup(BYTESIZE_ENV) {
        config.serial.byte_size = parse_var(BYTESIZE_ENV, &val, "Invalid byte size")?;
    }
    if let Some(val) = lookup(PARITY_ENV) {
        config.serial.parity = Parity::from_str(&val)
            .map_err(|e| ConfigError::env_parse(PARITY_ENV, e.to_string()))?;
    }
    if let Some(val) = lookup(STOPBITS_ENV) {
        config.serial.stop_bits = parse_var(STOPBITS_ENV, &val, "Invalid stop bits")?;
    }
    if let Some(val) = lookup(TIMEOUT_ENV) {
        config.serial.read_timeout_ms = if val.trim().is_empty() || val.eq_ignore_ascii_case("none") {
            None
        } else {
            Some(parse_seconds(TIMEOUT_ENV, &val)?)
        };
    }

    // The seconds-based keys go first so the `*_MS` keys can refine them.
    if let Some(val) = lookup(F2SQ_TIMEOUT_ENV) {
        let ms = parse_seconds(F2SQ_TIMEOUT_ENV, &val)?;
        config.bridge.outbound_poll_timeout_ms = ms;
        config.bridge.inbound_poll_timeout_ms = ms;
    }
    if let Some(val) = lookup(F2SQ_SLEEP_ENV) {
        config.bridge.dispatch_poll_interval_ms = parse_seconds(F2SQ_SLEEP_ENV, &val)?;
    }

    if let Some(val) = lookup(OUTBOUND_POLL_ENV) {
        config.bridge.outbound_poll_timeout_ms =
            parse_var(OUTBOUND_POLL_ENV, &val, "Invalid timeout")?;
    }
    if let Some(val) = lookup(INBOUND_POLL_ENV) {
        config.bridge.inbound_poll_timeout_ms =
            parse_var(INBOUND_POLL_ENV, &val, "Invalid timeout")?;
    }
    if let Some(val) = lookup(DISPATCH_POLL_ENV) {
        config.bridge.dispatch_poll_interval_ms =
            parse_var(DISPATCH_POLL_ENV, &val, "Invalid interval")?;
    }
    if let Some(val) = lookup(LOCK_FILE_ENV) {
        config.bridge.lock_file = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup(FAILURE_POLICY_ENV) {
        config.bridge.failure_policy = FailurePolicy::from_str(&val)
            .map_err(|message| ConfigError::env_parse(FAILURE_POLICY_ENV, message))?;
    }

    Ok(())
}

/// Parse a non-negative number of seconds into whole milliseconds.
fn parse_seconds(var: &str, value: &str) -> ConfigResult<u64> {
    let secs: f64 = parse_var(var, value, "expected a number of seconds")?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::env_parse(var, "seconds must be a non-negative number"));
    }
    let millis = Duration::try_from_secs_f64(secs)
        .map_err(|_| ConfigError::env_parse(var, "seconds out of range"))?
        .as_millis();
    u64::try_from(millis).map_err(|_| ConfigError::env_parse(var, "seconds out of range"))
}

fn parse_var<T: FromStr>(var: &str, value: &str, message: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::env_parse(var, message))
}
