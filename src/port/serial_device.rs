//! `DeviceLink` over a real serial port.
//!
//! Wraps the `serialport` crate and adds the line buffering the bridge needs:
//! bytes read past a `\n` are kept for the next `read_line` call.

use super::error::PortError;
use super::traits::{DeviceLink, LineSettings};
use memchr::memchr;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::debug;

/// Driver-level timeout used when the configured read timeout is "forever".
const BLOCKING_READ_SLICE: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 256;

/// Serial device link, opened lazily by [`DeviceLink::open`].
pub struct SerialDevice {
    name: String,
    line: LineSettings,
    port: Option<Box<dyn serialport::SerialPort>>,
    /// Bytes received but not yet returned as part of a line.
    pending: Vec<u8>,
}

impl SerialDevice {
    /// Create a closed device link for `port_name`.
    ///
    /// # Example
    /// ```no_run
    /// use serial_bridge::port::{DeviceLink, LineSettings, SerialDevice};
    ///
    /// let mut device = SerialDevice::new("/dev/ttyUSB0", LineSettings::default());
    /// device.open()?;
    /// device.write(b"PING\n")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(port_name: impl Into<String>, line: LineSettings) -> Self {
        Self {
            name: port_name.into(),
            line,
            port: None,
            pending: Vec::new(),
        }
    }

    /// Line parameters this device was created with.
    pub fn line_settings(&self) -> &LineSettings {
        &self.line
    }

    fn driver_timeout(&self) -> Duration {
        self.line.read_timeout.unwrap_or(BLOCKING_READ_SLICE)
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>, PortError> {
        self.port.as_mut().ok_or(PortError::NotOpen)
    }

    fn take_line(&mut self, end: usize) -> Vec<u8> {
        let rest = self.pending.split_off(end);
        std::mem::replace(&mut self.pending, rest)
    }
}

impl DeviceLink for SerialDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), PortError> {
        if self.port.is_some() {
            return Err(PortError::AlreadyOpen);
        }

        let port = serialport::new(&self.name, self.line.baud_rate)
            .data_bits(self.line.data_bits.into())
            .parity(self.line.parity.into())
            .stop_bits(self.line.stop_bits.into())
            .timeout(self.driver_timeout())
            .open()
            .map_err(|e| PortError::from_open(&self.name, e))?;

        debug!("Opened {} at {}", self.name, self.line);
        self.port = Some(port);
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), PortError> {
        // Dropping the handle closes the descriptor.
        match self.port.take() {
            Some(_) => {
                self.pending.clear();
                debug!("Closed {}", self.name);
                Ok(())
            }
            None => Err(PortError::NotOpen),
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PortError> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Vec<u8>, PortError> {
        let blocking = self.line.read_timeout.is_none();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(pos) = memchr(b'\n', &self.pending) {
                return Ok(self.take_line(pos + 1));
            }

            let port = self.port_mut()?;
            match port.read(&mut chunk) {
                Ok(0) => return Ok(std::mem::take(&mut self.pending)),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut && blocking => continue,
                // A bounded read that times out hands back whatever arrived.
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Ok(std::mem::take(&mut self.pending))
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(PortError::Io(e)),
            }
        }
    }

    fn bytes_available(&self) -> Result<usize, PortError> {
        let port = self.port.as_ref().ok_or(PortError::NotOpen)?;
        let queued = port.bytes_to_read()? as usize;
        Ok(self.pending.len() + queued)
    }
}

impl std::fmt::Debug for SerialDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialDevice")
            .field("name", &self.name)
            .field("line", &self.line.to_string())
            .field("open", &self.port.is_some())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_not_found_error() {
        let mut device = SerialDevice::new("/dev/nonexistent_port_12345", LineSettings::default());
        let result = device.open();

        assert!(result.is_err());
        assert!(!device.is_open());
    }

    #[test]
    fn test_closed_device_rejects_io() {
        let mut device = SerialDevice::new("/dev/ttyUSB0", LineSettings::default());

        assert!(matches!(device.write(b"x"), Err(PortError::NotOpen)));
        assert!(matches!(device.read_line(), Err(PortError::NotOpen)));
        assert!(matches!(device.bytes_available(), Err(PortError::NotOpen)));
        assert!(matches!(device.close(), Err(PortError::NotOpen)));
    }

    #[test]
    fn test_take_line_keeps_remainder() {
        let mut device = SerialDevice::new("/dev/ttyUSB0", LineSettings::default());
        device.pending.extend_from_slice(b"#one\n#tw");

        let end = memchr(b'\n', &device.pending).unwrap() + 1;
        assert_eq!(device.take_line(end), b"#one\n");
        assert_eq!(device.pending, b"#tw");
    }
}
