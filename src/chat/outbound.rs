// Bounded per-session outbound queue

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

/// Result of pushing a line onto an outbound queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full and its oldest line was discarded
    DroppedOldest,
    /// The queue is closed, the line was discarded
    Closed,
}

struct QueueState {
    lines: VecDeque<String>,
    closed: bool,
}

/// Ordered lines awaiting delivery to one connection
///
/// Pushing never blocks: when the queue is full the oldest line is dropped.
/// A single writer task drains it with [`OutboundQueue::recv`].
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    /// Create an empty queue holding at most `capacity` lines
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                lines: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Nothing panics while holding this lock, recover from poisoning anyway
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a line without waiting
    pub fn push(&self, line: String) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            let mut outcome = PushOutcome::Queued;
            while state.lines.len() >= self.capacity {
                state.lines.pop_front();
                outcome = PushOutcome::DroppedOldest;
            }
            state.lines.push_back(line);
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    /// Wait for the next line
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn recv(&self) -> Option<String> {
        loop {
            {
                let mut state = self.lock();
                if let Some(line) = state.lines.pop_front() {
                    return Some(line);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue; the writer drains what is left and stops
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of lines waiting
    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every waiting line without blocking
    pub fn drain(&self) -> Vec<String> {
        self.lock().lines.drain(..).collect()
    }
}
