//! The `DeviceLink` capability and the serial line parameters it is built from.
//!
//! The bridge never opens a serial port itself. It is handed something that
//! implements [`DeviceLink`] and moves it onto the forwarder thread, which is
//! then the only code that ever touches it.

use super::error::PortError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = PortError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            5 => Ok(Self::Five),
            6 => Ok(Self::Six),
            7 => Ok(Self::Seven),
            8 => Ok(Self::Eight),
            other => Err(PortError::invalid_settings(format!(
                "byte size must be 5, 6, 7 or 8, got {other}"
            ))),
        }
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

/// Parity checking modes.
///
/// Accepts both the long names and the single-letter forms `N`, `E`, `O`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[serde(alias = "N", alias = "n")]
    None,
    #[serde(alias = "O", alias = "o")]
    Odd,
    #[serde(alias = "E", alias = "e")]
    Even,
}

impl FromStr for Parity {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "n" | "none" => Ok(Self::None),
            "o" | "odd" => Ok(Self::Odd),
            "e" | "even" => Ok(Self::Even),
            other => Err(PortError::invalid_settings(format!("unknown parity '{other}'"))),
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "N"),
            Self::Odd => write!(f, "O"),
            Self::Even => write!(f, "E"),
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = PortError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            other => Err(PortError::invalid_settings(format!(
                "stop bits must be 1 or 2, got {other}"
            ))),
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Line parameters used to construct a serial device link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettings {
    /// Baud rate (bits per second).
    pub baud_rate: u32,

    /// Number of data bits (5, 6, 7, or 8).
    pub data_bits: DataBits,

    /// Parity checking mode.
    pub parity: Parity,

    /// Number of stop bits.
    pub stop_bits: StopBits,

    /// Read timeout.
    ///
    /// `None` blocks until a full line arrives, `Some(ZERO)` never waits,
    /// anything else bounds the wait.
    pub read_timeout: Option<Duration>,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            read_timeout: None,
        }
    }
}

impl fmt::Display for LineSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = match self.data_bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        };
        let stop = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        write!(f, "{} {}{}{}", self.baud_rate, bits, self.parity, stop)
    }
}

/// Capability over a physical or virtual serial connection.
///
/// Exactly one thread uses a link at a time, so implementations need `Send`
/// but not `Sync`.
pub trait DeviceLink: Send + fmt::Debug {
    /// Get the name/path of the underlying port.
    fn name(&self) -> &str;

    /// Open the connection. Opening an open link is an error.
    fn open(&mut self) -> Result<(), PortError>;

    /// Close the connection. Closing a closed link is an error.
    fn close(&mut self) -> Result<(), PortError>;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;

    /// Write all of `data` to the device.
    fn write(&mut self, data: &[u8]) -> Result<(), PortError>;

    /// Read one line, including its trailing `\n` when one arrived before
    /// the read timeout.
    fn read_line(&mut self) -> Result<Vec<u8>, PortError>;

    /// Number of bytes that can be read without waiting.
    fn bytes_available(&self) -> Result<usize, PortError>;
}

impl<T: DeviceLink + ?Sized> DeviceLink for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open(&mut self) -> Result<(), PortError> {
        (**self).open()
    }

    fn close(&mut self) -> Result<(), PortError> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PortError> {
        (**self).write(data)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, PortError> {
        (**self).read_line()
    }

    fn bytes_available(&self) -> Result<usize, PortError> {
        (**self).bytes_available()
    }
}
