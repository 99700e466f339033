pub mod handlers;
pub mod router;
pub mod session;

pub use handlers::{AppState, ChatStatsResponse};
pub use router::create_router;
