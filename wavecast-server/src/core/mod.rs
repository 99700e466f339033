pub mod error;
pub mod manager;
pub mod rate_limit;
pub mod ring;
pub mod room;
pub mod types;

pub use error::{ChatError, Result};
pub use manager::{ChatManager, OUTBOUND_QUEUE_CAPACITY, OutboundSender, SessionHandle};
pub use rate_limit::{DenyCode, RateLimiter, Verdict};
pub use ring::RingBuffer;
pub use room::Room;
pub use types::{AVG_MESSAGE_SIZE_BYTES, ChatMessage, ChatUser};
