//! Mock device link for testing.
//!
//! Provides a `MockDevice` that simulates a line-oriented serial device
//! without hardware. Clones share state, so a test can keep one handle while
//! the bridge's forwarder thread owns the other.

use super::error::PortError;
use super::traits::DeviceLink;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Inner state of the mock device.
#[derive(Debug, Default)]
struct MockDeviceState {
    open: bool,
    /// Lines the "device" will produce, in order.
    inbound: VecDeque<Vec<u8>>,
    /// Every successful write, in order.
    write_log: Vec<Vec<u8>>,
    open_count: usize,
    close_count: usize,
    /// Number of upcoming writes that fail.
    failing_writes: usize,
    /// Number of upcoming reads that fail.
    failing_reads: usize,
    fail_open: bool,
}

/// Mock device link.
///
/// # Example
/// ```
/// use serial_bridge::port::{DeviceLink, MockDevice};
///
/// let mut device = MockDevice::new("MOCK0");
/// device.push_line(b"#hello\n");
///
/// device.open().unwrap();
/// assert_eq!(device.bytes_available().unwrap(), 7);
/// assert_eq!(device.read_line().unwrap(), b"#hello\n");
///
/// device.write(b"ACK\n").unwrap();
/// assert_eq!(device.written(), vec![b"ACK\n".to_vec()]);
/// ```
#[derive(Clone)]
pub struct MockDevice {
    name: String,
    state: Arc<Mutex<MockDeviceState>>,
}

impl MockDevice {
    /// Create a new, closed mock device.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockDeviceState::default())),
        }
    }

    /// Queue a line for the device to produce. It is returned verbatim by
    /// one `read_line` call.
    pub fn push_line(&self, line: &[u8]) {
        self.state.lock().inbound.push_back(line.to_vec());
    }

    /// Copy of everything written to the device so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().write_log.clone()
    }

    /// Number of lines the device has not yet produced.
    pub fn unread_lines(&self) -> usize {
        self.state.lock().inbound.len()
    }

    /// How many times the link was opened.
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// How many times the link was closed successfully.
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    /// Make the next `count` writes fail with an I/O error.
    pub fn fail_writes(&self, count: usize) {
        self.state.lock().failing_writes = count;
    }

    /// Make the next `count` reads fail with an I/O error.
    pub fn fail_reads(&self, count: usize) {
        self.state.lock().failing_reads = count;
    }

    /// Make every subsequent `open` fail as if the port did not exist.
    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }
}

impl DeviceLink for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), PortError> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(PortError::not_found(&self.name));
        }
        if state.open {
            return Err(PortError::AlreadyOpen);
        }
        state.open = true;
        state.open_count += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), PortError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(PortError::NotOpen);
        }
        state.open = false;
        state.close_count += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PortError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(PortError::NotOpen);
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(PortError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }
        state.write_log.push(data.to_vec());
        Ok(())
    }

    fn read_line(&mut self) -> Result<Vec<u8>, PortError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(PortError::NotOpen);
        }
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(PortError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated read failure",
            )));
        }
        Ok(state.inbound.pop_front().unwrap_or_default())
    }

    fn bytes_available(&self) -> Result<usize, PortError> {
        let state = self.state.lock();
        if !state.open {
            return Err(PortError::NotOpen);
        }
        // A pending read fault must be observable, so report it as data.
        if state.failing_reads > 0 {
            return Ok(1);
        }
        Ok(state.inbound.iter().map(Vec::len).sum())
    }
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("name", &self.name)
            .field("unread_lines", &self.unread_lines())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_read_in_order() {
        let mut device = MockDevice::new("MOCK0");
        device.push_line(b"first\n");
        device.push_line(b"second\n");
        device.open().unwrap();

        assert_eq!(device.read_line().unwrap(), b"first\n");
        assert_eq!(device.read_line().unwrap(), b"second\n");
        assert_eq!(device.read_line().unwrap(), b"");
        assert_eq!(device.bytes_available().unwrap(), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let observer = MockDevice::new("MOCK0");
        let mut owned = observer.clone();

        owned.open().unwrap();
        owned.write(b"Test1").unwrap();
        owned.write(b"Test2").unwrap();

        assert_eq!(observer.written(), vec![b"Test1".to_vec(), b"Test2".to_vec()]);
        assert!(observer.is_open());
    }

    #[test]
    fn test_double_close_is_reported() {
        let mut device = MockDevice::new("MOCK0");
        device.open().unwrap();
        device.close().unwrap();

        assert!(matches!(device.close(), Err(PortError::NotOpen)));
        assert_eq!(device.close_count(), 1);
    }

    #[test]
    fn test_injected_faults() {
        let mut device = MockDevice::new("MOCK0");
        device.open().unwrap();
        device.fail_writes(1);
        device.fail_reads(1);

        assert!(matches!(device.write(b"x"), Err(PortError::Io(_))));
        device.write(b"y").unwrap();
        assert_eq!(device.bytes_available().unwrap(), 1);
        assert!(device.read_line().is_err());
        assert_eq!(device.written(), vec![b"y".to_vec()]);
    }

    #[test]
    fn test_fail_open() {
        let mut device = MockDevice::new("MOCK0");
        device.fail_open(true);

        assert!(matches!(device.open(), Err(PortError::NotFound(_))));
        assert_eq!(device.open_count(), 0);
    }
}
