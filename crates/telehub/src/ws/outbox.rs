//! Bounded per-client outbound queue.
//!
//! The hub pushes serialized frames without ever blocking; the connection's
//! writer task drains them into the socket.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// What to do when a client's outbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame to make room for the new one.
    #[default]
    DropOldest,
    /// Close the outbox; the hub then removes the client.
    Disconnect,
}

/// Result of pushing a frame into an outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest frame.
    DroppedOldest,
    /// The outbox was full and has been closed.
    Overflowed,
    /// The outbox was already closed; the frame was discarded.
    Closed,
}

#[derive(Debug, Default)]
struct OutboxState {
    queue: VecDeque<Arc<str>>,
    closed: bool,
    dropped: u64,
}

/// A bounded, single-consumer queue of frames for one client.
#[derive(Debug)]
pub struct Outbox {
    state: Mutex<OutboxState>,
    notify: Notify,
    capacity: usize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(OutboxState {
                queue: VecDeque::with_capacity(capacity.min(64)),
                ..OutboxState::default()
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame. Never blocks.
    pub fn push(&self, frame: Arc<str>, policy: OverflowPolicy) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            if state.queue.len() < self.capacity {
                state.queue.push_back(frame);
                PushOutcome::Queued
            } else {
                match policy {
                    OverflowPolicy::DropOldest => {
                        state.queue.pop_front();
                        state.queue.push_back(frame);
                        state.dropped += 1;
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::Disconnect => {
                        state.closed = true;
                        state.queue.clear();
                        PushOutcome::Overflowed
                    }
                }
            }
        };

        self.notify.notify_one();
        outcome
    }

    /// Wait for the next frame. Returns `None` once the outbox is closed.
    pub async fn recv(&self) -> Option<Arc<str>> {
        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(frame) = state.queue.pop_front() {
                    return Some(frame);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the outbox and discard anything still queued.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.queue.clear();
        }
        self.notify.notify_one();
    }

    /// Number of frames evicted by [`OverflowPolicy::DropOldest`].
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Take every queued frame without waiting.
    #[cfg(test)]
    pub(crate) fn drain(&self) -> Vec<Arc<str>> {
        self.lock().queue.drain(..).collect()
    }
}
