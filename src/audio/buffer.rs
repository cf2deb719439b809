//! Bounded chunk queue between an audio producer and its consumer
//!
//! Producers block while the queue is full, consumers block while it is
//! empty. `close()` is a one-shot transition: producers fail fast from then
//! on, consumers drain what is left and then observe end-of-stream.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of a pop
#[derive(Debug, PartialEq, Eq)]
pub enum Popped<T> {
    Item(T),
    EndOfStream,
}

/// Push rejected because the queue is closed; carries the item back
pub struct QueueClosed<T>(pub T);

impl<T> QueueClosed<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueClosed(..)")
    }
}

impl<T> fmt::Display for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("chunk queue closed")
    }
}

impl<T> std::error::Error for QueueClosed<T> {}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Fixed-capacity blocking queue of chunks
pub struct ChunkQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    pushed_count: AtomicUsize,
    dropped_count: AtomicUsize,
}

impl<T> ChunkQueue<T> {
    /// Create a queue holding at most `capacity` chunks (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            pushed_count: AtomicUsize::new(0),
            dropped_count: AtomicUsize::new(0),
        }
    }

    /// Push a chunk, blocking while the queue is full
    pub fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(QueueClosed(item));
            }
            if state.items.len() < self.capacity {
                break;
            }
            self.not_full.wait(&mut state);
        }
        state.items.push_back(item);
        self.pushed_count.fetch_add(1, Ordering::Relaxed);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push without blocking, evicting the oldest chunk when full.
    /// Returns the evicted chunk, if any.
    pub fn push_drop_oldest(&self, item: T) -> Result<Option<T>, QueueClosed<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueClosed(item));
        }
        let evicted = if state.items.len() >= self.capacity {
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
            state.items.pop_front()
        } else {
            None
        };
        state.items.push_back(item);
        self.pushed_count.fetch_add(1, Ordering::Relaxed);
        drop(state);
        self.not_empty.notify_one();
        Ok(evicted)
    }

    /// Pop a chunk, blocking while the queue is empty and open
    pub fn pop(&self) -> Popped<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Popped::Item(item);
            }
            if state.closed {
                return Popped::EndOfStream;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Pop with a deadline. `None` means the timeout elapsed first.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Popped<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(Popped::Item(item));
            }
            if state.closed {
                return Some(Popped::EndOfStream);
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Close the queue. Idempotent; wakes every blocked producer and consumer.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Discard every queued chunk, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let discarded = state.items.len();
        state.items.clear();
        drop(state);
        self.dropped_count.fetch_add(discarded, Ordering::Relaxed);
        self.not_full.notify_all();
        discarded
    }

    /// Take every queued chunk out, counting them as dropped
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let items: Vec<T> = state.items.drain(..).collect();
        drop(state);
        self.dropped_count.fetch_add(items.len(), Ordering::Relaxed);
        self.not_full.notify_all();
        items
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total chunks accepted since creation
    pub fn pushed_count(&self) -> usize {
        self.pushed_count.load(Ordering::Relaxed)
    }

    /// Chunks evicted by drop-oldest pushes or discarded by `clear`
    pub fn dropped_count(&self) -> usize {
        self.dropped_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a chunk queue
pub type SharedChunkQueue<T> = Arc<ChunkQueue<T>>;

/// Create a new shared chunk queue
pub fn create_shared_queue<T>(capacity: usize) -> SharedChunkQueue<T> {
    Arc::new(ChunkQueue::new(capacity))
}
