use chrono::{DateTime, Utc};

use super::ChatMessage;

/// Fixed-capacity circular buffer of chat messages.
///
/// Appends are O(1); when the buffer is full the oldest message is
/// overwritten and the caller is told so it can adjust byte accounting.
/// Time-based eviction walks contiguously from the head and stops at the
/// first non-expired message, which assumes timestamps are non-decreasing
/// along buffer position.
///
/// The buffer itself carries no lock; `Room` guards it with a single
/// reader-writer lock (mutations exclusive, snapshots shared).
#[derive(Debug)]
pub struct RingBuffer {
    slots: Vec<Option<ChatMessage>>,
    head: usize,
    size: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            size: 0,
        }
    }

    /// Append a message, overwriting the oldest slot when full.
    /// Returns true when an eviction occurred.
    pub fn append(&mut self, msg: ChatMessage) -> bool {
        let capacity = self.slots.len();
        if self.size == capacity {
            self.slots[self.head] = Some(msg);
            self.head = (self.head + 1) % capacity;
            true
        } else {
            let tail = (self.head + self.size) % capacity;
            self.slots[tail] = Some(msg);
            self.size += 1;
            false
        }
    }

    /// All buffered messages, oldest first.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.iter().cloned().collect()
    }

    /// Up to `n` most-recent messages, oldest first among them.
    pub fn tail(&self, n: usize) -> Vec<ChatMessage> {
        if n == 0 {
            return Vec::new();
        }
        let skip = self.size.saturating_sub(n);
        self.iter().skip(skip).cloned().collect()
    }

    /// Drop contiguous head messages with `timestamp <= cutoff`.
    /// Returns the number of messages removed.
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let capacity = self.slots.len();
        let mut removed = 0;
        while self.size > 0 {
            match &self.slots[self.head] {
                Some(msg) if msg.timestamp <= cutoff => {
                    self.slots[self.head] = None;
                    self.head = (self.head + 1) % capacity;
                    self.size -= 1;
                    removed += 1;
                }
                _ => break,
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.size = 0;
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        let capacity = self.slots.len();
        (0..self.size).map(move |i| {
            self.slots[(self.head + i) % capacity]
                .as_ref()
                .expect("occupied slot within size window")
        })
    }
}
