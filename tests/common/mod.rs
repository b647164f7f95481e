//! Shared test utilities for serial-bridge integration tests.
//!
//! This module provides common test infrastructure including:
//! - Bridge construction against a temporary lock file
//! - Guards that share ownership markers between bridges
//! - Polling helpers for assertions on background threads

#![allow(dead_code)]

use parking_lot::Mutex;
use serial_bridge::guard::MarkerStore;
use serial_bridge::{Bridge, MemoryMarkers, PortSettings, SingletonGuard};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const MOCK_PORT: &str = "MOCK0";

/// Settings with short poll intervals so tests finish quickly.
pub fn fast_settings(lock_file: &Path) -> PortSettings {
    PortSettings::new(MOCK_PORT)
        .with_lock_file(lock_file)
        .with_outbound_poll_timeout(Duration::from_millis(10))
        .with_inbound_poll_timeout(Duration::from_millis(50))
        .with_dispatch_poll_interval(Duration::from_millis(5))
        .with_claim_backoff(Duration::from_millis(20))
}

/// A bridge in its own temporary directory with private markers.
pub struct TestBridge {
    pub bridge: Bridge,
    pub dir: TempDir,
}

pub fn test_bridge() -> TestBridge {
    let dir = tempfile::tempdir().expect("tempdir");
    let markers: Arc<dyn MarkerStore> = Arc::new(MemoryMarkers::new());
    let bridge = bridge_with_markers(dir.path(), &markers);
    TestBridge { bridge, dir }
}

/// A bridge whose lock file lives in `dir` and whose markers are `markers`.
/// Bridges built from the same pair contend for the same port.
pub fn bridge_with_markers(dir: &Path, markers: &Arc<dyn MarkerStore>) -> Bridge {
    let settings = fast_settings(&dir.join(".running"));
    let guard = SingletonGuard::new(Arc::clone(markers), settings.claim_backoff);
    Bridge::with_guard(settings, guard)
}

/// Handler sink that records every message it sees.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> impl Fn(&str) + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |msg: &str| seen.lock().push(msg.to_string())
    }

    pub fn messages(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

/// Poll `cond` until it holds, panicking after two seconds.
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}
