//! Live task notifications: connection registry, subscriptions and fan-out.

mod hub;
pub mod messages;

pub use hub::{Connection, ConnectionId, NotificationHub, SendFailure};
pub use messages::{msg_types, ClientMessage, ServerMessage};
