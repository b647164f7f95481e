//! Thread-safe FIFO message queues.
//!
//! Both directions of the bridge use the same [`MessageQueue`]. Each message
//! is handed to exactly one consumer. On the inbound side two kinds of
//! consumer compete, direct readers and the dispatch loop; a reader that is
//! already waiting always wins, and the dispatch loop only takes a message
//! when nobody is waiting for one.

use crate::error::{BridgeError, BridgeResult};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

/// Raw message as it travels between the device and the application.
pub type Message = Vec<u8>;

/// What a bounded queue does when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new message with [`BridgeError::QueueFull`].
    #[default]
    Reject,
    /// Discard the oldest queued message to make room.
    DropOldest,
}

/// Who is taking a message off the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claimant {
    Reader,
    Dispatcher,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Message>,
    waiting_readers: usize,
    dropped: u64,
}

impl QueueState {
    fn ready_for(&self, claimant: Claimant) -> bool {
        !self.items.is_empty() && (claimant == Claimant::Reader || self.waiting_readers == 0)
    }
}

/// Multi-producer, multi-consumer FIFO of raw messages.
#[derive(Debug)]
pub struct MessageQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
}

impl MessageQueue {
    /// Create an unbounded queue.
    pub fn unbounded(name: &'static str) -> Self {
        Self::new(name, None, OverflowPolicy::default())
    }

    /// Create a queue, bounded when `capacity` is set.
    pub fn new(name: &'static str, capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            capacity,
            overflow,
        }
    }

    /// Append a message. Never blocks.
    pub fn push(&self, message: Message) -> BridgeResult<()> {
        let mut state = self.state.lock();

        if let Some(capacity) = self.capacity {
            if state.items.len() >= capacity {
                match self.overflow {
                    OverflowPolicy::Reject => return Err(BridgeError::QueueFull { capacity }),
                    OverflowPolicy::DropOldest => {
                        state.items.pop_front();
                        state.dropped += 1;
                        warn!(
                            "{} queue full ({} messages), dropped oldest message",
                            self.name, capacity
                        );
                    }
                }
            }
        }

        state.items.push_back(message);
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    /// Take the next message if one is queued right now.
    pub fn try_pop(&self) -> Option<Message> {
        self.state.lock().items.pop_front()
    }

    /// Wait up to `timeout` for the next message.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Message> {
        self.pop(Claimant::Reader, Some(timeout))
    }

    /// Wait as long as it takes for the next message.
    pub fn pop_blocking(&self) -> Message {
        loop {
            if let Some(message) = self.pop(Claimant::Reader, None) {
                return message;
            }
        }
    }

    /// Like [`pop_timeout`](Self::pop_timeout), but yields to any waiting
    /// reader.
    pub(crate) fn pop_for_dispatch(&self, timeout: Duration) -> Option<Message> {
        self.pop(Claimant::Dispatcher, Some(timeout))
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Messages discarded by [`OverflowPolicy::DropOldest`] so far.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    fn pop(&self, claimant: Claimant, timeout: Option<Duration>) -> Option<Message> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        if claimant == Claimant::Reader {
            state.waiting_readers += 1;
        }

        let message = loop {
            if state.ready_for(claimant) {
                break state.items.pop_front();
            }
            match deadline {
                None => self.available.wait(&mut state),
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        break if state.ready_for(claimant) {
                            state.items.pop_front()
                        } else {
                            None
                        };
                    }
                }
            }
        };

        if claimant == Claimant::Reader {
            state.waiting_readers -= 1;
            // The dispatcher may have stood aside for us; let it look again.
            if state.waiting_readers == 0 && !state.items.is_empty() {
                self.available.notify_all();
            }
        }

        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pop_timeout_on_empty_queue() {
        let queue = MessageQueue::unbounded("test");
        let started = Instant::now();

        assert_eq!(queue.pop_timeout(Duration::from_millis(50)), None);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_pop_blocking_wakes_on_push() {
        let queue = Arc::new(MessageQueue::unbounded("test"));
        let producer = Arc::clone(&queue);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            producer.push(b"late".to_vec()).unwrap();
        });

        assert_eq!(queue.pop_blocking(), b"late");
        handle.join().unwrap();
    }

    #[test]
    fn test_reject_when_full() {
        let queue = MessageQueue::new("test", Some(2), OverflowPolicy::Reject);
        queue.push(b"a".to_vec()).unwrap();
        queue.push(b"b".to_vec()).unwrap();

        let err = queue.push(b"c".to_vec()).unwrap_err();
        assert!(matches!(err, BridgeError::QueueFull { capacity: 2 }));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let queue = MessageQueue::new("test", Some(2), OverflowPolicy::DropOldest);
        for m in [b"a", b"b", b"c"] {
            queue.push(m.to_vec()).unwrap();
        }

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop(), Some(b"b".to_vec()));
        assert_eq!(queue.try_pop(), Some(b"c".to_vec()));
    }

    #[test]
    fn test_dispatcher_yields_to_waiting_reader() {
        let queue = Arc::new(MessageQueue::unbounded("test"));
        let reader_queue = Arc::clone(&queue);

        let reader = thread::spawn(move || reader_queue.pop_timeout(Duration::from_secs(2)));

        // Wait until the reader is parked on the condvar.
        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.state.lock().waiting_readers == 0 {
            assert!(Instant::now() < deadline, "reader never started waiting");
            thread::sleep(Duration::from_millis(1));
        }

        queue.push(b"response".to_vec()).unwrap();
        // Taken by the reader or still queued, never handed to the dispatcher
        // while a reader waits.
        let dispatched = queue.pop_for_dispatch(Duration::from_millis(20));
        assert_eq!(dispatched, None);
        assert_eq!(reader.join().unwrap(), Some(b"response".to_vec()));
    }

    #[test]
    fn test_dispatcher_takes_message_without_readers() {
        let queue = MessageQueue::unbounded("test");
        queue.push(b"#event".to_vec()).unwrap();

        assert_eq!(
            queue.pop_for_dispatch(Duration::from_millis(10)),
            Some(b"#event".to_vec())
        );
    }

    proptest! {
        #[test]
        fn prop_messages_leave_in_push_order(messages in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..16), 0..32)
        ) {
            let queue = MessageQueue::unbounded("test");
            for m in &messages {
                queue.push(m.clone()).unwrap();
            }
            let drained: Vec<Message> = std::iter::from_fn(|| queue.try_pop()).collect();
            prop_assert_eq!(drained, messages);
        }
    }
}
