pub mod envelope;

pub use envelope::{Envelope, JoinData, MessageData, TypingData};
