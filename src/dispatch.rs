//! Inbound message dispatch.
//!
//! The dispatch loop takes lines off the inbound queue, decodes them as
//! UTF-8 and calls the handler registered for the line's first character,
//! or the default handler when there is none. Handlers run on the dispatch
//! thread, one at a time, so a slow handler delays every message behind it.
//! Handlers are expected to return promptly; nothing interrupts them.

use crate::error::{BridgeError, BridgeResult};
use crate::queue::MessageQueue;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, warn};

pub const DISPATCH_THREAD_NAME: &str = "serial-dispatch";

/// Callback invoked with a decoded inbound message.
pub type Handler = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Routing table from first character to handler, plus a default.
#[derive(Default)]
pub struct HandlerRegistry {
    routes: RwLock<HashMap<char, Handler>>,
    fallback: RwLock<Option<Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for messages starting with `identifier`, or as the
    /// default handler when `identifier` is `None`. Replaces any earlier
    /// registration for the same key.
    pub fn register(&self, identifier: Option<char>, handler: Handler) {
        match identifier {
            Some(c) => {
                self.routes.write().insert(c, handler);
            }
            None => {
                *self.fallback.write() = Some(handler);
            }
        }
    }

    /// Handler for a decoded message, falling back to the default.
    pub fn resolve(&self, message: &str) -> Option<Handler> {
        let first = message.chars().next()?;
        self.routes
            .read()
            .get(&first)
            .cloned()
            .or_else(|| self.fallback.read().clone())
    }

    pub fn has_default(&self) -> bool {
        self.fallback.read().is_some()
    }

    /// Routing characters with a handler registered.
    pub fn identifiers(&self) -> Vec<char> {
        let mut keys: Vec<char> = self.routes.read().keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("identifiers", &self.identifiers())
            .field("has_default", &self.has_default())
            .finish()
    }
}

/// What happened to one inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// A handler ran. Carries the routing character.
    Handled(char),
    /// No handler matched and no default is registered.
    Unrouted,
    /// Zero-length line.
    Empty,
    /// The line was not valid UTF-8.
    Undecodable,
    /// The handler panicked.
    HandlerPanicked(char),
}

/// Decode `line` and run the matching handler on the current thread.
pub fn dispatch_line(handlers: &HandlerRegistry, line: Vec<u8>) -> Dispatched {
    if line.is_empty() {
        return Dispatched::Empty;
    }

    let text = match String::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            warn!("Skipping inbound line: {}", BridgeError::from(e));
            return Dispatched::Undecodable;
        }
    };
    debug!("dispatch << {:?}", text);

    // Non-empty valid UTF-8 always has a first char.
    let Some(first) = text.chars().next() else {
        return Dispatched::Empty;
    };
    let Some(handler) = handlers.resolve(&text) else {
        debug!("No handler for {:?}, dropping message", first);
        return Dispatched::Unrouted;
    };

    match catch_unwind(AssertUnwindSafe(|| handler(&text))) {
        Ok(()) => Dispatched::Handled(first),
        Err(_) => {
            error!("Handler for {:?} panicked on {:?}", first, text);
            Dispatched::HandlerPanicked(first)
        }
    }
}

/// Identity of the thread a [`DispatchLoop`] is running on.
///
/// Clones share the identity, so a caller can ask "am I inside a handler?"
/// without touching the loop itself, which may be locked by a thread that
/// is waiting for the dispatch thread to finish.
#[derive(Debug, Clone, Default)]
pub struct DispatchThread(Arc<Mutex<Option<ThreadId>>>);

impl DispatchThread {
    /// Whether the caller is the dispatch thread, i.e. a handler.
    pub fn is_current(&self) -> bool {
        *self.0.lock() == Some(thread::current().id())
    }

    fn set(&self, id: Option<ThreadId>) {
        *self.0.lock() = id;
    }
}

/// Whether the dispatch thread is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Stopped,
    Running,
}

/// Owner of the dispatch thread.
#[derive(Debug)]
pub struct DispatchLoop {
    inbound: Arc<MessageQueue>,
    handlers: Arc<HandlerRegistry>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    thread: DispatchThread,
}

impl DispatchLoop {
    pub fn new(
        inbound: Arc<MessageQueue>,
        handlers: Arc<HandlerRegistry>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inbound,
            handlers,
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            thread: DispatchThread::default(),
        }
    }

    /// Shared handle on the identity of the dispatch thread.
    pub fn thread(&self) -> DispatchThread {
        self.thread.clone()
    }

    pub fn state(&self) -> DispatchState {
        if self.worker.is_some() {
            DispatchState::Running
        } else {
            DispatchState::Stopped
        }
    }

    /// Spawn the dispatch thread. Does nothing if it is already running.
    pub fn start(&mut self) -> BridgeResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        // Each run gets its own flag so a thread that is still winding down
        // can never be revived by a later start.
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let inbound = Arc::clone(&self.inbound);
        let handlers = Arc::clone(&self.handlers);
        let poll_interval = self.poll_interval;
        let identity = self.thread.clone();

        let worker = thread::Builder::new()
            .name(DISPATCH_THREAD_NAME.to_string())
            .spawn(move || {
                identity.set(Some(thread::current().id()));
                while flag.load(Ordering::Acquire) {
                    if let Some(line) = inbound.pop_for_dispatch(poll_interval) {
                        dispatch_line(&handlers, line);
                    }
                }
                debug!("Dispatch loop stopped");
            })
            .map_err(|source| BridgeError::Spawn {
                name: DISPATCH_THREAD_NAME,
                source,
            })?;

        self.running = running;
        self.worker = Some(worker);
        debug!("Dispatch loop started");
        Ok(())
    }

    /// Clear the running flag and wait for the thread to finish its current
    /// message. Returns whether it had been running.
    ///
    /// Called from a handler, the thread would have to join itself; that is
    /// refused with [`BridgeError::ReentrantDispatch`] and the loop keeps
    /// running.
    pub fn stop(&mut self) -> BridgeResult<bool> {
        let Some(worker) = self.worker.take() else {
            return Ok(false);
        };
        if worker.thread().id() == thread::current().id() {
            self.worker = Some(worker);
            return Err(BridgeError::ReentrantDispatch);
        }

        self.running.store(false, Ordering::Release);
        if worker.join().is_err() {
            error!("Dispatch thread panicked");
        }
        self.thread.set(None);
        Ok(true)
    }
}

impl Drop for DispatchLoop {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            // Let the thread wind down after the current handler returns.
            self.running.store(false, Ordering::Release);
            warn!("Dispatch loop dropped by its own thread: {}", e);
        }
    }
}
