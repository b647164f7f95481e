//! The forwarder loop: sole owner of the device link.
//!
//! Each iteration waits briefly for outbound work, writes it, pulls one
//! inbound line if the device has data, and then checks that this
//! incarnation still holds the lock file. Losing the lock file is the only
//! way the loop is asked to stop.

use crate::error::{BridgeError, BridgeResult};
use crate::guard::LockFile;
use crate::port::{DeviceLink, PortError};
use crate::queue::MessageQueue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const FORWARDER_THREAD_NAME: &str = "serial-forwarder";

/// What the forwarder does when a device read or write fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Close the device, give up the lock file and stop with an error.
    #[default]
    FailFast,
    /// Log the fault, wait the configured backoff and keep going.
    LogAndContinue,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_fast" => Ok(Self::FailFast),
            "log_and_continue" => Ok(Self::LogAndContinue),
            other => Err(format!(
                "unknown failure policy '{other}', expected fail_fast or log_and_continue"
            )),
        }
    }
}

/// Why the forwarder loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderExit {
    /// The lock file was removed or taken over.
    LockReleased,
}

impl fmt::Display for ForwarderExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockReleased => write!(f, "lock file released"),
        }
    }
}

/// Forwarder loop state, moved onto its own thread by [`Forwarder::spawn`].
#[derive(Debug)]
pub struct Forwarder {
    device: Box<dyn DeviceLink>,
    outbound: Arc<MessageQueue>,
    inbound: Arc<MessageQueue>,
    lock: LockFile,
    poll_timeout: Duration,
    policy: FailurePolicy,
    failure_backoff: Duration,
}

impl Forwarder {
    pub fn new(
        device: Box<dyn DeviceLink>,
        outbound: Arc<MessageQueue>,
        inbound: Arc<MessageQueue>,
        lock: LockFile,
    ) -> Self {
        Self {
            device,
            outbound,
            inbound,
            lock,
            poll_timeout: Duration::from_millis(100),
            policy: FailurePolicy::default(),
            failure_backoff: Duration::from_millis(500),
        }
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy, backoff: Duration) -> Self {
        self.policy = policy;
        self.failure_backoff = backoff;
        self
    }

    /// Start the loop on a dedicated thread.
    pub fn spawn(self) -> BridgeResult<ForwarderHandle> {
        let port = self.device.name().to_string();
        let join = thread::Builder::new()
            .name(FORWARDER_THREAD_NAME.to_string())
            .spawn(move || self.run())
            .map_err(|source| BridgeError::Spawn {
                name: FORWARDER_THREAD_NAME,
                source,
            })?;
        Ok(ForwarderHandle { port, join })
    }

    /// Run the loop on the current thread until the lock file is gone or a
    /// fault ends it. The device is closed exactly once before returning.
    pub fn run(mut self) -> BridgeResult<ForwarderExit> {
        let port = self.device.name().to_string();

        if let Err(e) = self.device.open() {
            error!("Failed to open {}: {}", port, e);
            self.give_up_lock();
            return Err(BridgeError::device(port, e));
        }
        info!("Forwarding {} (poll {:?})", port, self.poll_timeout);

        let result = loop {
            if let Err(e) = self.step() {
                match self.policy {
                    FailurePolicy::FailFast => {
                        error!("Device fault on {}, stopping forwarder: {}", port, e);
                        self.give_up_lock();
                        break Err(BridgeError::device(&port, e));
                    }
                    FailurePolicy::LogAndContinue => {
                        warn!(
                            "Device fault on {}, retrying in {:?}: {}",
                            port, self.failure_backoff, e
                        );
                        thread::sleep(self.failure_backoff);
                    }
                }
            }

            if !self.lock.is_held() {
                info!("Lock file {} released, stopping forwarder", self.lock.path().display());
                break Ok(ForwarderExit::LockReleased);
            }
        };

        if let Err(e) = self.device.close() {
            warn!("Failed to close {}: {}", port, e);
        }
        result
    }

    /// One iteration: outbound first, then at most one inbound line.
    fn step(&mut self) -> Result<(), PortError> {
        if let Some(message) = self.outbound.pop_timeout(self.poll_timeout) {
            if !message.is_empty() {
                debug!("{} << {} bytes", self.device.name(), message.len());
                self.device.write(&message)?;
            }
        }

        if self.device.bytes_available()? > 0 {
            let line = self.device.read_line()?;
            if !line.is_empty() {
                debug!("{} >> {} bytes", self.device.name(), line.len());
                if let Err(e) = self.inbound.push(line) {
                    warn!("Dropped inbound line from {}: {}", self.device.name(), e);
                }
            }
        }

        Ok(())
    }

    fn give_up_lock(&self) {
        if let Err(e) = self.lock.remove_if_held() {
            warn!("Failed to remove lock file {}: {}", self.lock.path().display(), e);
        }
    }
}

/// Handle to a running forwarder thread.
#[derive(Debug)]
pub struct ForwarderHandle {
    port: String,
    join: JoinHandle<BridgeResult<ForwarderExit>>,
}

impl ForwarderHandle {
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Whether the loop has returned.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the loop to return and hand back its outcome.
    pub fn join(self) -> BridgeResult<ForwarderExit> {
        self.join
            .join()
            .map_err(|_| BridgeError::ThreadPanicked(FORWARDER_THREAD_NAME))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MockDevice;
    use std::path::Path;
    use std::time::Instant;

    struct Fixture {
        _dir: tempfile::TempDir,
        device: MockDevice,
        outbound: Arc<MessageQueue>,
        inbound: Arc<MessageQueue>,
        lock: LockFile,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::new(dir.path().join(".running"), "owner");
        lock.create().unwrap();
        Fixture {
            _dir: dir,
            device: MockDevice::new("MOCK0"),
            outbound: Arc::new(MessageQueue::unbounded("outbound")),
            inbound: Arc::new(MessageQueue::unbounded("inbound")),
            lock,
        }
    }

    fn forwarder(f: &Fixture) -> Forwarder {
        Forwarder::new(
            Box::new(f.device.clone()),
            Arc::clone(&f.outbound),
            Arc::clone(&f.inbound),
            f.lock.clone(),
        )
        .poll_timeout(Duration::from_millis(10))
    }

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn remove(path: &Path) {
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_writes_in_enqueue_order() {
        let f = fixture();
        for m in [&b"one"[..], b"two", b"three"] {
            f.outbound.push(m.to_vec()).unwrap();
        }

        let handle = forwarder(&f).spawn().unwrap();
        wait_for("writes", || f.device.written().len() == 3);
        remove(f.lock.path());

        assert_eq!(handle.join().unwrap(), ForwarderExit::LockReleased);
        assert_eq!(
            f.device.written(),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn test_empty_outbound_message_is_not_written() {
        let f = fixture();
        f.outbound.push(Vec::new()).unwrap();
        f.outbound.push(b"x".to_vec()).unwrap();

        let handle = forwarder(&f).spawn().unwrap();
        wait_for("write", || !f.device.written().is_empty());
        remove(f.lock.path());
        handle.join().unwrap();

        assert_eq!(f.device.written(), vec![b"x".to_vec()]);
    }

    #[test]
    fn test_inbound_lines_are_enqueued() {
        let f = fixture();
        f.device.push_line(b"#a\n");
        f.device.push_line(b"#b\n");

        let handle = forwarder(&f).spawn().unwrap();
        wait_for("inbound", || f.inbound.len() == 2);
        remove(f.lock.path());
        handle.join().unwrap();

        assert_eq!(f.inbound.try_pop(), Some(b"#a\n".to_vec()));
        assert_eq!(f.inbound.try_pop(), Some(b"#b\n".to_vec()));
    }

    #[test]
    fn test_exits_and_closes_once_when_lock_removed() {
        let f = fixture();
        let handle = forwarder(&f).spawn().unwrap();
        wait_for("open", || f.device.is_open());

        remove(f.lock.path());
        let started = Instant::now();
        handle.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(f.device.open_count(), 1);
        assert_eq!(f.device.close_count(), 1);
        assert!(!f.device.is_open());
    }

    #[test]
    fn test_exits_when_lock_taken_over() {
        let f = fixture();
        let handle = forwarder(&f).spawn().unwrap();
        wait_for("open", || f.device.is_open());

        std::fs::write(f.lock.path(), "newer-owner").unwrap();
        handle.join().unwrap();

        // The newer owner's lock file is left alone.
        assert!(f.lock.path().exists());
        assert_eq!(f.device.close_count(), 1);
    }

    #[test]
    fn test_fail_fast_releases_lock() {
        let f = fixture();
        f.device.fail_writes(1);
        f.outbound.push(b"boom".to_vec()).unwrap();

        let err = forwarder(&f).spawn().unwrap().join().unwrap_err();

        assert!(matches!(err, BridgeError::DeviceIo { .. }));
        assert!(!f.lock.path().exists());
        assert_eq!(f.device.close_count(), 1);
    }

    #[test]
    fn test_log_and_continue_survives_faults() {
        let f = fixture();
        f.device.fail_writes(1);
        f.device.fail_reads(1);
        f.outbound.push(b"lost".to_vec()).unwrap();
        f.outbound.push(b"kept".to_vec()).unwrap();

        let handle = forwarder(&f)
            .failure_policy(FailurePolicy::LogAndContinue, Duration::from_millis(1))
            .spawn()
            .unwrap();
        wait_for("retry", || !f.device.written().is_empty());
        remove(f.lock.path());

        assert_eq!(handle.join().unwrap(), ForwarderExit::LockReleased);
        assert_eq!(f.device.written(), vec![b"kept".to_vec()]);
    }

    #[test]
    fn test_open_failure_ends_loop() {
        let f = fixture();
        f.device.fail_open(true);

        let err = forwarder(&f).run().unwrap_err();

        assert!(matches!(err, BridgeError::DeviceIo { .. }));
        assert!(!f.lock.path().exists());
        assert_eq!(f.device.close_count(), 0);
    }

    #[test]
    fn test_failure_policy_from_str() {
        assert_eq!("fail-fast".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailFast);
        assert_eq!(
            "LOG_AND_CONTINUE".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::LogAndContinue
        );
        assert!("retry".parse::<FailurePolicy>().is_err());
    }
}
