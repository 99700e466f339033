pub mod config;
pub mod core;
pub mod monitoring;
pub mod protocol;
pub mod server;

// Re-export commonly used types
pub use config::{CapacityEstimate, ChatConfig, LoggingConfig, ServerConfig};
pub use core::{
    AVG_MESSAGE_SIZE_BYTES, ChatError, ChatManager, ChatMessage, ChatUser, DenyCode,
    OUTBOUND_QUEUE_CAPACITY, RateLimiter, RingBuffer, Room, Verdict,
};
pub use monitoring::{MemoryStats, MemoryTracker};
pub use protocol::Envelope;
pub use server::{AppState, create_router};
