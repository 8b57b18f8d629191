use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::relay::{lock, OverflowPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueStatus {
    Open,
    /// No more pushes; whatever is buffered can still be read.
    Finished,
    /// Buffer discarded, readers see the end right away.
    Aborted,
}

struct State<T> {
    items: VecDeque<T>,
    status: QueueStatus,
    dropped: u64,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    readable: Notify,
    writable: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

/// A bounded multi-producer, single-consumer buffer sitting between the
/// relay read loops and a subscription's consumer.
pub struct EventQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity.min(64)),
                    status: QueueStatus::Open,
                    dropped: 0,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
                capacity,
                policy,
            }),
        }
    }

    /// Buffer an item. Returns false if the queue no longer accepts items.
    ///
    /// With [`OverflowPolicy::Block`] this waits for room; with
    /// [`OverflowPolicy::DropOldest`] it never waits.
    pub async fn push(&self, item: T) -> bool {
        let shared = &self.shared;
        let mut item = Some(item);

        loop {
            let notified = shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = lock(&shared.state);
                if state.status != QueueStatus::Open {
                    return false;
                }

                let full = state.items.len() >= shared.capacity;
                if full && shared.policy == OverflowPolicy::DropOldest {
                    state.items.pop_front();
                    state.dropped += 1;
                }

                if !full || shared.policy == OverflowPolicy::DropOldest {
                    if let Some(item) = item.take() {
                        state.items.push_back(item);
                    }
                    drop(state);
                    shared.readable.notify_one();
                    return true;
                }
            }

            notified.await;
        }
    }

    /// Next buffered item, waiting if the queue is empty. `None` once the
    /// queue is finished and drained, or aborted.
    pub async fn pop(&self) -> Option<T> {
        let shared = &self.shared;

        loop {
            let notified = shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = lock(&shared.state);
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    shared.writable.notify_one();
                    return Some(item);
                }

                if state.status != QueueStatus::Open {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting items; buffered ones can still be read.
    pub fn finish(&self) {
        self.set_status(QueueStatus::Finished, false);
    }

    /// Stop accepting items and throw away the buffer.
    pub fn abort(&self) {
        self.set_status(QueueStatus::Aborted, true);
    }

    fn set_status(&self, status: QueueStatus, clear: bool) {
        {
            let mut state = lock(&self.shared.state);
            if state.status == QueueStatus::Aborted {
                return;
            }
            state.status = status;
            if clear {
                state.items.clear();
            }
        }
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
    }

    pub fn is_open(&self) -> bool {
        lock(&self.shared.state).status == QueueStatus::Open
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many items [`OverflowPolicy::DropOldest`] has evicted.
    pub fn dropped(&self) -> u64 {
        lock(&self.shared.state).dropped
    }
}
