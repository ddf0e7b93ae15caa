//! Live-update channel over WebSocket.
//!
//! Message types and the per-user connection registry live in
//! `crate::notifications`; this module only bridges sockets to the hub.

mod handler;

pub use handler::ws_handler;
