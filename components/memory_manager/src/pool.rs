//! Recycling of list buffers.
//!
//! When a list cell is freed its buffer is cleared and parked here so the
//! next list allocation can reuse the capacity instead of asking the system
//! allocator again.

use std::sync::atomic::{AtomicU64, Ordering};

use core_types::{Recycler, Value};
use crossbeam::queue::ArrayQueue;

/// Buffers larger than this are returned to the allocator
const MAX_POOLED_CAPACITY: usize = 4096;

/// Bounded pool of empty `Vec<Value>` buffers.
pub struct ValuePool {
    buffers: ArrayQueue<Vec<Value>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ValuePool {
    /// Pool holding at most `slots` buffers
    pub fn new(slots: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(slots.max(1)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Buffers currently parked
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffers are parked
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Takes served from the pool
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Takes that found the pool empty
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Recycler for ValuePool {
    fn take(&self) -> Option<Vec<Value>> {
        let buffer = self.buffers.pop();
        let counter = if buffer.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        buffer
    }

    fn recycle(&self, mut buffer: Vec<Value>) {
        if buffer.capacity() == 0 || buffer.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buffer.clear();
        // A full pool just lets the buffer go.
        let _ = self.buffers.push(buffer);
    }
}

impl std::fmt::Debug for ValuePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValuePool")
            .field("len", &self.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}
