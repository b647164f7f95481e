//! Exclusive device ownership across process incarnations.
//!
//! Ownership is a pair: a marker keyed by port name and a lock file. Both
//! carry the owner id of the incarnation that set them, and they are always
//! set and cleared together.
//!
//! A supervisor that restarts the hosting process (a hot-reload wrapper, for
//! instance) leaves the marker behind in the environment it passes to the new
//! process. Finding the marker on startup therefore means "an older
//! incarnation of me may still be driving the port". The guard clears it,
//! deletes the lock file (which tells the old forwarder to stop), waits a
//! moment and claims again, so the newest incarnation always wins.
//!
//! ```text
//! incarnation A            incarnation B
//! claim: marker absent
//!   set marker, lock(A)
//!   forwarder running ...  claim: marker present
//!                            clear marker, rm lock
//!   lock gone -> exit        sleep backoff
//!                          claim: marker absent
//!                            set marker, lock(B)
//! ```
//!
//! Claims are meant to happen once, at startup, from a single thread.

use crate::error::{BridgeError, BridgeResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of the marker key; the sanitized port name follows.
pub const MARKER_PREFIX: &str = "SERIAL_BRIDGE_PORT_";

/// Claims attempted before giving up on a port that keeps being re-marked.
const MAX_CLAIM_ATTEMPTS: u32 = 3;

/// Where ownership markers live.
pub trait MarkerStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn clear(&self, key: &str);
}

/// Markers stored in the process environment.
///
/// Child processes inherit them, which is what lets a restarted incarnation
/// notice its predecessor.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvMarkers;

impl MarkerStore for EnvMarkers {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn set(&self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }

    fn clear(&self, key: &str) {
        std::env::remove_var(key);
    }
}

/// Markers held in memory, shared by every guard that holds a clone.
#[derive(Debug, Default, Clone)]
pub struct MemoryMarkers {
    markers: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryMarkers {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MarkerStore for MemoryMarkers {
    fn get(&self, key: &str) -> Option<String> {
        self.markers.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.markers.lock().insert(key.to_string(), value.to_string());
    }

    fn clear(&self, key: &str) {
        self.markers.lock().remove(key);
    }
}

/// Marker key for a port name. Anything that is not ASCII alphanumeric
/// becomes `_` so the key is a valid environment variable name.
pub fn marker_key(port: &str) -> String {
    let suffix: String = port
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{MARKER_PREFIX}{suffix}")
}

/// The lock file of one owner.
///
/// It is held while the file exists and contains the owner id. A file
/// rewritten by a newer owner is not held by the older one, even if the
/// older one never saw it disappear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockFile {
    path: PathBuf,
    owner_id: String,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>, owner_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            owner_id: owner_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Write the file, creating parent directories as needed.
    pub fn create(&self) -> BridgeResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| BridgeError::lock_file(parent, e))?;
        }
        std::fs::write(&self.path, &self.owner_id)
            .map_err(|e| BridgeError::lock_file(&self.path, e))
    }

    /// Whether the file exists and still names this owner.
    pub fn is_held(&self) -> bool {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => content.trim() == self.owner_id,
            Err(_) => false,
        }
    }

    /// Remove the file if it still names this owner. Returns whether it did.
    pub fn remove_if_held(&self) -> BridgeResult<bool> {
        if !self.is_held() {
            return Ok(false);
        }
        remove_lock_file(&self.path)
    }
}

/// Remove a lock file whoever owns it. A missing file is not an error.
fn remove_lock_file(path: &Path) -> BridgeResult<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(BridgeError::lock_file(path, e)),
    }
}

/// Proof of ownership of one port.
///
/// Dropping a token does not release ownership; call
/// [`release`](Self::release) on graceful shutdown.
#[derive(Debug)]
pub struct OwnershipToken {
    port: String,
    key: String,
    lock: LockFile,
    markers: Arc<dyn MarkerStore>,
    displaced_stale_owner: bool,
}

impl OwnershipToken {
    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn marker_key(&self) -> &str {
        &self.key
    }

    pub fn owner_id(&self) -> &str {
        self.lock.owner_id()
    }

    pub fn lock_file(&self) -> &LockFile {
        &self.lock
    }

    /// Whether this claim had to clear a marker left by an earlier incarnation.
    pub fn displaced_stale_owner(&self) -> bool {
        self.displaced_stale_owner
    }

    /// Whether both halves of the token still name this owner.
    pub fn is_held(&self) -> bool {
        self.markers.get(&self.key).as_deref() == Some(self.owner_id()) && self.lock.is_held()
    }

    /// Clear the marker and remove the lock file, leaving alone anything a
    /// newer owner has written since.
    pub fn release(self) -> BridgeResult<()> {
        if self.markers.get(&self.key).as_deref() == Some(self.owner_id()) {
            self.markers.clear(&self.key);
        }
        if self.lock.remove_if_held()? {
            info!("Released ownership of {}", self.port);
        } else {
            debug!("Ownership of {} was already taken over", self.port);
        }
        Ok(())
    }
}

/// Outcome of a single claim attempt.
#[derive(Debug)]
pub enum ClaimAttempt {
    Owned(OwnershipToken),
    AlreadyOwned,
}

/// Hands out port ownership.
#[derive(Debug, Clone)]
pub struct SingletonGuard {
    markers: Arc<dyn MarkerStore>,
    backoff: Duration,
}

impl SingletonGuard {
    pub fn new(markers: Arc<dyn MarkerStore>, backoff: Duration) -> Self {
        Self { markers, backoff }
    }

    /// Guard backed by the process environment.
    pub fn from_env(backoff: Duration) -> Self {
        Self::new(Arc::new(EnvMarkers), backoff)
    }

    /// One claim attempt with no stale-owner handling.
    pub fn try_claim(&self, port: &str, lock_path: &Path) -> BridgeResult<ClaimAttempt> {
        let key = marker_key(port);
        if self.markers.get(&key).is_some() {
            return Ok(ClaimAttempt::AlreadyOwned);
        }

        let owner_id = Uuid::new_v4().to_string();
        let lock = LockFile::new(lock_path, owner_id.as_str());
        self.markers.set(&key, &owner_id);
        if let Err(e) = lock.create() {
            self.markers.clear(&key);
            return Err(e);
        }

        Ok(ClaimAttempt::Owned(OwnershipToken {
            port: port.to_string(),
            key,
            lock,
            markers: Arc::clone(&self.markers),
            displaced_stale_owner: false,
        }))
    }

    /// Claim `port`, displacing a stale owner if one is marked.
    pub fn claim(&self, port: &str, lock_path: &Path) -> BridgeResult<OwnershipToken> {
        let key = marker_key(port);
        let mut displaced = false;

        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            match self.try_claim(port, lock_path)? {
                ClaimAttempt::Owned(mut token) => {
                    token.displaced_stale_owner = displaced;
                    info!(
                        "Claimed {} (owner {}, lock {})",
                        port,
                        token.owner_id(),
                        lock_path.display()
                    );
                    return Ok(token);
                }
                ClaimAttempt::AlreadyOwned => {
                    warn!(
                        "{} is marked as owned, assuming a stale incarnation (attempt {})",
                        port, attempt
                    );
                    self.markers.clear(&key);
                    remove_lock_file(lock_path)?;
                    displaced = true;
                    std::thread::sleep(self.backoff);
                }
            }
        }

        Err(BridgeError::OwnershipConflict {
            port: port.to_string(),
            attempts: MAX_CLAIM_ATTEMPTS,
        })
    }
}
