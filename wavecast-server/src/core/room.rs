use chrono::{Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{AVG_MESSAGE_SIZE_BYTES, ChatMessage, ChatUser, RingBuffer};

/// One ephemeral chat room: the bounded message history and live roster for a
/// single stream.
///
/// Message state and roster state sit behind separate locks so roster reads
/// never block message reads. Byte accounting is an estimate: appends add the
/// message's estimated encoded size, evictions deduct the flat
/// [`AVG_MESSAGE_SIZE_BYTES`] constant, and the counter is floored at zero.
pub struct Room {
    stream_id: String,
    messages: RwLock<RingBuffer>,
    users: RwLock<HashMap<String, ChatUser>>,
    /// Unix seconds; non-decreasing except through explicit refresh.
    last_activity: AtomicU64,
    total_messages: AtomicU64,
    bytes_used: AtomicU64,
}

impl Room {
    pub fn new(stream_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            stream_id: stream_id.into(),
            messages: RwLock::new(RingBuffer::new(capacity)),
            users: RwLock::new(HashMap::new()),
            last_activity: AtomicU64::new(Utc::now().timestamp() as u64),
            total_messages: AtomicU64::new(0),
            bytes_used: AtomicU64::new(0),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Append a message. Never fails; when the buffer is full the oldest
    /// message is silently evicted.
    pub fn add_message(&self, msg: ChatMessage) {
        self.add_message_with(msg, |_| {});
    }

    /// Append a message and run `fanout` before the message lock is
    /// released. Keeping the enqueue inside the append's critical section is
    /// what gives every recipient queue the buffer's append order.
    pub fn add_message_with(&self, msg: ChatMessage, fanout: impl FnOnce(&ChatMessage)) {
        let size = msg.estimated_size() as u64;
        let evicted = {
            let mut messages = self.messages.write();
            let evicted = messages.append(msg.clone());
            fanout(&msg);
            evicted
        };
        self.touch();
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.bytes_used.fetch_add(size, Ordering::Relaxed);
        if evicted {
            self.debit_bytes(AVG_MESSAGE_SIZE_BYTES as u64);
        }
    }

    /// Up to `limit` most-recent messages, oldest first among them.
    pub fn messages(&self, limit: usize) -> Vec<ChatMessage> {
        self.messages.read().tail(limit)
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.read().snapshot()
    }

    /// Insert a user record, replacing any existing record for the same id.
    pub fn add_user(&self, user: ChatUser) {
        self.users.write().insert(user.user_id.clone(), user);
        self.touch();
    }

    pub fn remove_user(&self, user_id: &str) -> Option<ChatUser> {
        let removed = self.users.write().remove(user_id);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn get_user(&self, user_id: &str) -> Option<ChatUser> {
        self.users.read().get(user_id).cloned()
    }

    pub fn list_users(&self) -> Vec<ChatUser> {
        self.users.read().values().cloned().collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    /// Update per-user posting stats after an accepted message.
    pub fn note_user_message(&self, user_id: &str, chars: usize) {
        if let Some(user) = self.users.write().get_mut(user_id) {
            user.last_message_at = Some(Utc::now());
            user.message_count += 1;
            user.char_count += chars as u64;
        }
    }

    /// Mirror a rate-limit penalty onto the roster record.
    pub fn note_user_penalty(
        &self,
        user_id: &str,
        timeout_until: Option<chrono::DateTime<Utc>>,
        violations: u32,
    ) {
        if let Some(user) = self.users.write().get_mut(user_id) {
            user.timeout_until = timeout_until;
            user.violations = violations;
        }
    }

    /// Drop messages older than `retention`, deducting the per-message
    /// average from the byte estimate. Returns the number removed.
    pub fn evict_old(&self, retention: Duration) -> usize {
        let removed = self.messages.write().evict_older_than(Utc::now() - retention);
        if removed > 0 {
            self.debit_bytes(removed as u64 * AVG_MESSAGE_SIZE_BYTES as u64);
        }
        removed
    }

    pub fn message_count(&self) -> usize {
        self.messages.read().len()
    }

    pub fn lifetime_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Relaxed)
    }

    /// Last activity as unix seconds.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity
            .fetch_max(Utc::now().timestamp() as u64, Ordering::Relaxed);
    }

    fn debit_bytes(&self, amount: u64) {
        let _ = self
            .bytes_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(amount))
            });
    }
}
