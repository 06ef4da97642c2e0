//! Bounded FIFO of drafts written while the transport is not open.

use std::collections::VecDeque;

use termstream_core::Outbound;

use crate::TransportError;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Outbound drafts awaiting an open connection, in submission order.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<Outbound>,
    capacity: usize,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl OutboundQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    /// Append a draft.
    ///
    /// # Errors
    /// Returns `QueueOverflow` when full; the queue is left unchanged.
    pub fn push(&mut self, draft: Outbound) -> Result<(), TransportError> {
        if self.items.len() >= self.capacity {
            return Err(TransportError::QueueOverflow {
                capacity: self.capacity,
            });
        }
        self.items.push_back(draft);
        Ok(())
    }

    /// Put drafts that failed mid-flush back in front, keeping their order.
    ///
    /// This may exceed capacity: the drafts were already accepted once.
    pub fn requeue_front(&mut self, drafts: Vec<Outbound>) {
        for draft in drafts.into_iter().rev() {
            self.items.push_front(draft);
        }
    }

    /// Take every queued draft, oldest first, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<Outbound> {
        self.items.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
