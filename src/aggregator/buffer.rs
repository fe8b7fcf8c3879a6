//! Pending tick buffer between the feed and the snapshot task.
//!
//! One mutex guards both `append` and `drain`, so every appended tick lands in
//! exactly one drained batch, in arrival order.

use parking_lot::Mutex;

use crate::feed::wire::Tick;

/// Returned by [`PendingBuffer::append`] when the buffer is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("pending buffer full: {capacity} ticks awaiting drain")]
pub struct BufferFull {
    pub capacity: usize,
}

#[derive(Debug)]
pub struct PendingBuffer {
    ticks: Mutex<Vec<Tick>>,
    capacity: usize,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ticks: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append a tick. The tick is not stored when the buffer is full.
    #[inline]
    pub fn append(&self, tick: Tick) -> Result<(), BufferFull> {
        let mut ticks = self.ticks.lock();
        if ticks.len() >= self.capacity {
            return Err(BufferFull {
                capacity: self.capacity,
            });
        }
        ticks.push(tick);
        Ok(())
    }

    /// Take every buffered tick, leaving the buffer empty.
    pub fn drain(&self) -> Vec<Tick> {
        std::mem::take(&mut *self.ticks.lock())
    }

    pub fn len(&self) -> usize {
        self.ticks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.lock().is_empty()
    }
}
