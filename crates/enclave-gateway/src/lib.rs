//! Real-time gateway: per-connection WebSocket sessions, room-based
//! fan-out, and rate limiting.

pub mod connection;
pub mod limiter;
pub mod router;

pub use connection::{GatewayState, Session, ws_handler};
pub use limiter::RateLimiter;
pub use router::{RoomKey, RoomRouter};
