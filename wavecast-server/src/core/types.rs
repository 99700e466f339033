use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Flat per-message size estimate used when deducting evicted messages from a
/// room's byte accounting. Eviction does not know the exact size of the
/// message it dropped, so the deduction is an average, not exact.
pub const AVG_MESSAGE_SIZE_BYTES: usize = 200;

/// Fixed overhead added on top of the string fields when estimating the
/// encoded size of a message (envelope framing, struct bookkeeping).
const MESSAGE_OVERHEAD_BYTES: usize = 96;

/// A single chat message. Immutable after creation; lives inside exactly one
/// room's ring buffer until it is evicted by wrap-around or retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub stream_id: String,
    pub user_id: String,
    pub username: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a new message stamped with a fresh ID and the server receipt time.
    pub fn new(
        stream_id: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            stream_id: stream_id.into(),
            user_id: user_id.into(),
            username: username.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Rough encoded size of this message including framing overhead.
    pub fn estimated_size(&self) -> usize {
        self.id.len()
            + self.stream_id.len()
            + self.user_id.len()
            + self.username.len()
            + self.message.len()
            + MESSAGE_OVERHEAD_BYTES
    }
}

/// A connected viewer inside one room's roster. Created on `join`, dropped on
/// disconnect or room teardown. Mutated only under the room's roster lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUser {
    pub user_id: String,
    pub username: String,
    pub connected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub char_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_until: Option<DateTime<Utc>>,
    pub violations: u32,
    pub is_active: bool,
}

impl ChatUser {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            connected_at: Utc::now(),
            last_message_at: None,
            message_count: 0,
            char_count: 0,
            timeout_until: None,
            violations: 0,
            is_active: true,
        }
    }
}
