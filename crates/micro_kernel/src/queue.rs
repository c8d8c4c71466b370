//! Bounded Blocking Queue
//!
//! A capacity-limited FIFO shared between producers and consumers on different
//! threads. `push` blocks while the queue is full, `pop` blocks while it is
//! empty, and `shutdown` releases everyone: new items are refused while items
//! already queued can still be drained.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

struct QueueState<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

/// Blocking FIFO queue with a fixed capacity and cooperative shutdown
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items
    ///
    /// A capacity of zero is bumped to one so that `push` can make progress.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Append an item, waiting for room if the queue is full
    ///
    /// Returns the item back once the queue has been shut down.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        while !state.shutdown && state.items.len() >= self.capacity {
            self.not_full.wait(&mut state);
        }

        if state.shutdown {
            return Err(item);
        }

        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest item, waiting while the queue is empty
    ///
    /// Returns `None` only after shutdown, once every queued item is gone.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        while !state.shutdown && state.items.is_empty() {
            self.not_empty.wait(&mut state);
        }

        let item = state.items.pop_front();
        drop(state);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Number of queued items
    pub fn count(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Refuse further items and wake every blocked producer and consumer
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }

        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
