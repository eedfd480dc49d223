//! WebSocket broadcast server.
//!
//! Provides connection and subscription management, heartbeat liveness,
//! the client protocol types, and the HTTP upgrade handler.

mod handler;
mod heartbeat;
pub mod manager;
pub mod protocol;

pub use handler::ws_handler;
pub use heartbeat::start_heartbeat;
pub use manager::{Topic, WsManager};
pub use protocol::{ClientMessage, JobUpdate, Severity, SystemMessage};
