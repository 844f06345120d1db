//! Per-symbol holding area for messages that arrive before a tracker exists.

use std::collections::VecDeque;

use crate::types::BookMessage;

/// Bounded FIFO. Overflow silently drops the oldest message; the snapshot
/// fetched when the tracker starts supersedes it.
#[derive(Debug)]
pub struct PendingBuffer {
    messages: VecDeque<BookMessage>,
    capacity: usize,
    evicted: u64,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    /// Append a message. Returns `true` if the oldest one was evicted.
    pub fn push(&mut self, message: BookMessage) -> bool {
        let evicted = if self.messages.len() >= self.capacity {
            self.messages.pop_front();
            self.evicted += 1;
            true
        } else {
            false
        };
        self.messages.push_back(message);
        evicted
    }

    /// Take the oldest message.
    pub fn pop(&mut self) -> Option<BookMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Total messages dropped on overflow since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
