//! The public facade.
//!
//! A [`Bridge`] owns both queues and the handler registry, starts and stops
//! the forwarder and dispatch threads, and gives the application its ways
//! in: `write`, blocking and non-blocking `read`, handler registration and
//! the synchronous scope.
//!
//! # Architecture
//!
//! ```text
//!             write()                       ┌──────────────┐
//! app ───────────────────> outbound ──────> │  forwarder   │ <──> DeviceLink
//!                                           │  (owns link) │
//! app <── read() ───┐                       └──────┬───────┘
//!                   ├──── inbound <────────────────┘
//! handlers <── dispatch loop ┘
//! ```
//!
//! # Locking
//!
//! Whenever both are needed, the dispatch lock is taken before the active
//! link lock. Handlers run while another thread may hold the dispatch lock
//! and wait for them, so nothing a handler can call takes it.
//!
//! # Example
//!
//! ```no_run
//! use serial_bridge::{Bridge, PortSettings};
//!
//! let bridge = Bridge::new(PortSettings::new("/dev/ttyACM0"));
//! bridge.register_handler(Some('#'), |msg| println!("status: {msg}"));
//! bridge.register_handler(None, |msg| println!("other: {msg}"));
//! bridge.run_serial()?;
//!
//! let reply = bridge.synchronously(|io| {
//!     io.write(b"VERSION?\n".to_vec())?;
//!     io.read_text(true)
//! })?;
//! println!("device version: {reply}");
//!
//! bridge.shutdown()?;
//! # Ok::<(), serial_bridge::BridgeError>(())
//! ```

use crate::config::PortSettings;
use crate::dispatch::{DispatchLoop, DispatchState, DispatchThread, HandlerRegistry};
use crate::error::{BridgeError, BridgeResult};
use crate::forwarder::{Forwarder, ForwarderHandle};
use crate::guard::{OwnershipToken, SingletonGuard};
use crate::port::{DeviceLink, SerialDevice};
use crate::queue::{Message, MessageQueue};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Ownership and forwarder of a running bridge.
#[derive(Debug)]
struct ActiveLink {
    token: OwnershipToken,
    forwarder: ForwarderHandle,
}

/// Bridge between one serial device and any number of consumers.
#[derive(Debug)]
pub struct Bridge {
    settings: PortSettings,
    outbound: Arc<MessageQueue>,
    inbound: Arc<MessageQueue>,
    handlers: Arc<HandlerRegistry>,
    guard: SingletonGuard,
    dispatch: Mutex<DispatchLoop>,
    dispatch_thread: DispatchThread,
    /// Serializes synchronous scopes.
    exclusive: Mutex<()>,
    active: Mutex<Option<ActiveLink>>,
}

impl Bridge {
    /// Bridge whose ownership markers live in the process environment.
    pub fn new(settings: PortSettings) -> Self {
        let guard = SingletonGuard::from_env(settings.claim_backoff);
        Self::with_guard(settings, guard)
    }

    /// Bridge using an explicitly constructed guard.
    pub fn with_guard(settings: PortSettings, guard: SingletonGuard) -> Self {
        let outbound = Arc::new(MessageQueue::new(
            "outbound",
            settings.queue_capacity,
            settings.overflow,
        ));
        let inbound = Arc::new(MessageQueue::new(
            "inbound",
            settings.queue_capacity,
            settings.overflow,
        ));
        let handlers = Arc::new(HandlerRegistry::new());
        let dispatch = DispatchLoop::new(
            Arc::clone(&inbound),
            Arc::clone(&handlers),
            settings.dispatch_poll_interval,
        );
        let dispatch_thread = dispatch.thread();

        Self {
            settings,
            outbound,
            inbound,
            handlers,
            guard,
            dispatch: Mutex::new(dispatch),
            dispatch_thread,
            exclusive: Mutex::new(()),
            active: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &PortSettings {
        &self.settings
    }

    /// Claim the port, start the forwarder on `device` and start dispatching.
    pub fn run(&self, device: impl DeviceLink + 'static) -> BridgeResult<()> {
        // From a handler the dispatch loop is running by definition.
        if self.dispatch_thread.is_current() {
            return self.start_forwarder(device);
        }
        let mut dispatch = self.dispatch.lock();
        self.start_forwarder(device)?;
        dispatch.start()
    }

    fn start_forwarder(&self, device: impl DeviceLink + 'static) -> BridgeResult<()> {
        let mut active = self.active.lock();

        if let Some(link) = active.as_ref() {
            if !link.forwarder.is_finished() {
                return Err(BridgeError::AlreadyRunning(self.settings.port.clone()));
            }
        }
        if let Some(finished) = active.take() {
            if let Err(e) = retire(finished) {
                warn!("Previous forwarder for {} ended with: {}", self.settings.port, e);
            }
        }

        let token = self
            .guard
            .claim(&self.settings.port, &self.settings.lock_file)?;
        if token.displaced_stale_owner() {
            info!("Took over {} from a previous incarnation", self.settings.port);
        }

        let forwarder = Forwarder::new(
            Box::new(device),
            Arc::clone(&self.outbound),
            Arc::clone(&self.inbound),
            token.lock_file().clone(),
        )
        .poll_timeout(self.settings.outbound_poll_timeout)
        .failure_policy(self.settings.failure_policy, self.settings.failure_backoff);

        let forwarder = match forwarder.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(release_err) = token.release() {
                    warn!("Failed to release ownership: {}", release_err);
                }
                return Err(e);
            }
        };
        *active = Some(ActiveLink { token, forwarder });
        Ok(())
    }

    /// [`run`](Self::run) on the serial port named in the settings.
    pub fn run_serial(&self) -> BridgeResult<()> {
        self.run(SerialDevice::new(
            self.settings.port.clone(),
            self.settings.line.clone(),
        ))
    }

    /// Stop dispatching, give up ownership and wait for the forwarder.
    ///
    /// Releasing the lock file is what stops the forwarder, so this returns
    /// within about one outbound poll interval. A forwarder that had already
    /// died of a device fault reports that fault here. Calling it again is a
    /// no-op. Handlers cannot shut their own bridge down.
    pub fn shutdown(&self) -> BridgeResult<()> {
        if self.dispatch_thread.is_current() {
            return Err(BridgeError::ReentrantDispatch);
        }

        let link = {
            let mut dispatch = self.dispatch.lock();
            dispatch.stop()?;
            self.active.lock().take()
        };
        let Some(link) = link else {
            return Ok(());
        };
        let port = link.forwarder.port().to_string();
        retire(link)?;
        info!("Bridge for {} shut down", port);
        Ok(())
    }

    /// Whether this bridge owns the port and its forwarder has not exited.
    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|link| !link.forwarder.is_finished() && link.token.is_held())
    }

    /// Whether the forwarder thread is still alive, owner or not.
    pub fn forwarder_active(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|link| !link.forwarder.is_finished())
    }

    pub fn dispatch_state(&self) -> DispatchState {
        if self.dispatch_thread.is_current() {
            return DispatchState::Running;
        }
        self.dispatch.lock().state()
    }

    /// Queue bytes for the device. Never blocks.
    pub fn write(&self, message: impl Into<Message>) -> BridgeResult<()> {
        self.outbound.push(message.into())
    }

    /// Take one inbound message.
    ///
    /// Non-blocking reads wait at most the inbound poll timeout and return
    /// an empty message when nothing arrived. Blocking reads wait for as
    /// long as it takes.
    pub fn read(&self, blocking: bool) -> Message {
        if blocking {
            self.inbound.pop_blocking()
        } else {
            self.read_timeout(self.settings.inbound_poll_timeout)
                .unwrap_or_default()
        }
    }

    pub fn blocking_read(&self) -> Message {
        self.read(true)
    }

    /// Take one inbound message, waiting at most `timeout`.
    pub fn read_timeout(&self, timeout: Duration) -> Option<Message> {
        self.inbound.pop_timeout(timeout)
    }

    /// [`read`](Self::read), decoded as UTF-8.
    pub fn read_text(&self, blocking: bool) -> BridgeResult<String> {
        Ok(String::from_utf8(self.read(blocking))?)
    }

    /// [`read`](Self::read) without blocking the async runtime.
    pub async fn read_async(&self, blocking: bool) -> BridgeResult<Message> {
        let inbound = Arc::clone(&self.inbound);
        let timeout = self.settings.inbound_poll_timeout;

        tokio::task::spawn_blocking(move || {
            if blocking {
                inbound.pop_blocking()
            } else {
                inbound.pop_timeout(timeout).unwrap_or_default()
            }
        })
        .await
        .map_err(|_| BridgeError::ThreadPanicked("async read"))
    }

    /// Register a handler for messages whose first character is
    /// `identifier`, or the default handler when it is `None`.
    ///
    /// Handlers run on the dispatch thread and must not block for long.
    pub fn register_handler<F>(&self, identifier: Option<char>, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.handlers.register(identifier, Arc::new(handler));
    }

    pub fn on_message<F>(&self, identifier: char, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.register_handler(Some(identifier), handler);
    }

    pub fn on_default<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.register_handler(None, handler);
    }

    /// Suspend the dispatch loop until the returned scope is dropped.
    ///
    /// While the scope lives no handler can take a message off the inbound
    /// queue, so a write followed by a read sees the device's answer. Only one
    /// scope exists at a time; a second caller blocks here. The dispatch loop
    /// is restarted when the scope is dropped, including during a panic.
    ///
    /// A handler cannot open a scope: it would have to wait for its own
    /// thread to stop. That fails with [`BridgeError::ReentrantDispatch`].
    pub fn synchronous(&self) -> BridgeResult<SynchronousScope<'_>> {
        if self.dispatch_thread.is_current() {
            return Err(BridgeError::ReentrantDispatch);
        }

        let exclusive = self.exclusive.lock();
        let resume = self.dispatch.lock().stop()?;
        Ok(SynchronousScope {
            bridge: self,
            resume,
            _exclusive: exclusive,
        })
    }

    /// Run `f` inside a [`synchronous`](Self::synchronous) scope.
    pub fn synchronously<R>(
        &self,
        f: impl FnOnce(&SynchronousScope<'_>) -> BridgeResult<R>,
    ) -> BridgeResult<R> {
        let scope = self.synchronous()?;
        f(&scope)
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Bridge for {} did not shut down cleanly: {}", self.settings.port, e);
        }
    }
}

/// Release ownership, then collect the forwarder's outcome.
fn retire(link: ActiveLink) -> BridgeResult<()> {
    let ActiveLink { token, forwarder } = link;
    // If the lock file cannot be removed the forwarder would never notice,
    // so don't wait for it.
    token.release()?;
    let port = forwarder.port().to_string();
    let exit = forwarder.join()?;
    debug!("Forwarder for {} exited: {}", port, exit);
    Ok(())
}

/// Exclusive access to the queues with the dispatch loop suspended.
pub struct SynchronousScope<'a> {
    bridge: &'a Bridge,
    resume: bool,
    _exclusive: MutexGuard<'a, ()>,
}

impl SynchronousScope<'_> {
    pub fn write(&self, message: impl Into<Message>) -> BridgeResult<()> {
        self.bridge.write(message)
    }

    pub fn read(&self, blocking: bool) -> Message {
        self.bridge.read(blocking)
    }

    pub fn read_timeout(&self, timeout: Duration) -> Option<Message> {
        self.bridge.read_timeout(timeout)
    }

    pub fn read_text(&self, blocking: bool) -> BridgeResult<String> {
        self.bridge.read_text(blocking)
    }
}

impl Drop for SynchronousScope<'_> {
    fn drop(&mut self) {
        if !self.resume {
            return;
        }
        // Checked under the dispatch lock so a concurrent shutdown either
        // finishes first or sees the restarted loop and stops it.
        let mut dispatch = self.bridge.dispatch.lock();
        if self.bridge.active.lock().is_none() {
            return;
        }
        if let Err(e) = dispatch.start() {
            error!("Failed to restart dispatch loop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::MemoryMarkers;
    use crate::port::MockDevice;

    fn bridge(dir: &tempfile::TempDir) -> Bridge {
        let settings = PortSettings::new("MOCK0")
            .with_lock_file(dir.path().join(".running"))
            .with_outbound_poll_timeout(Duration::from_millis(10))
            .with_inbound_poll_timeout(Duration::from_millis(20))
            .with_claim_backoff(Duration::from_millis(5));
        let guard = SingletonGuard::new(Arc::new(MemoryMarkers::new()), settings.claim_backoff);
        Bridge::with_guard(settings, guard)
    }

    #[test]
    fn test_write_before_run_is_queued() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&dir);

        bridge.write("hello").unwrap();
        bridge.write(b"\x01\x02".to_vec()).unwrap();
        assert_eq!(bridge.pending_outbound(), 2);
        assert!(!bridge.is_running());
    }

    #[test]
    fn test_non_blocking_read_on_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&dir);

        assert!(bridge.read(false).is_empty());
        assert_eq!(bridge.read_text(false).unwrap(), "");
    }

    #[test]
    fn test_run_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&dir);

        bridge.run(MockDevice::new("MOCK0")).unwrap();
        let err = bridge.run(MockDevice::new("MOCK0")).unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyRunning(_)));

        bridge.shutdown().unwrap();
        bridge.shutdown().unwrap();
        assert!(!bridge.is_running());
        assert_eq!(bridge.dispatch_state(), DispatchState::Stopped);
    }

    #[test]
    fn test_scope_without_run_does_not_start_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&dir);

        bridge.synchronously(|io| io.write("x")).unwrap();
        assert_eq!(bridge.dispatch_state(), DispatchState::Stopped);
    }
}
