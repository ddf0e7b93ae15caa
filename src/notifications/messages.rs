//! Live-update message types.
//!
//! Every message is a flat JSON object with a `type` field. Server messages
//! carry their fields next to `type` rather than in a nested payload.

use serde::{Deserialize, Serialize};

/// Server -> Client message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ServerMessage {
    /// Build a message from any struct serializing to a JSON object.
    ///
    /// Non-object values are carried under `data`.
    pub fn new(msg_type: impl Into<String>, body: impl Serialize) -> Self {
        let fields = match serde_json::to_value(body) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(serde_json::Value::Null) | Err(_) => serde_json::Map::new(),
            Ok(other) => {
                let mut map = serde_json::Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Self {
            msg_type: msg_type.into(),
            fields,
        }
    }

    pub fn empty(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}

/// Client -> Server messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    SubscribeTask { task_id: String },
    UnsubscribeTask { task_id: String },
    GetSubscriptions,
    Heartbeat,
}

/// Reserved message type constants.
pub mod msg_types {
    pub const CONNECTED: &str = "connected";
    pub const PONG: &str = "pong";
    pub const HEARTBEAT_ACK: &str = "heartbeat_ack";
    pub const SUBSCRIBED: &str = "subscribed";
    pub const UNSUBSCRIBED: &str = "unsubscribed";
    pub const SUBSCRIPTIONS: &str = "subscriptions";
    pub const ERROR: &str = "error";
    /// Status/progress change of a task.
    pub const TASK_UPDATE: &str = "task_update";
}

/// Payloads for the connection-level messages.
pub mod system {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Connected {
        pub connection_id: u64,
        pub user_id: String,
        pub server_version: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct HeartbeatAck {
        pub timestamp: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct TaskRef {
        pub task_id: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Subscriptions {
        pub task_ids: Vec<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Error {
        pub code: String,
        pub message: String,
    }

    impl Error {
        pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
            Self {
                code: code.into(),
                message: message.into(),
            }
        }
    }
}

/// Body of a `task_update` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskUpdate {
    pub task_id: String,
    pub user_id: String,
    pub status: String,
    pub progress: u8,
    pub message: Option<String>,
    pub timestamp: i64,
    pub data: serde_json::Value,
}

/// Body of a broadcast task event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    pub task_id: String,
    pub timestamp: i64,
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_message_is_flat() {
        let msg = ServerMessage::new(
            msg_types::TASK_UPDATE,
            TaskUpdate {
                task_id: "t1".to_string(),
                user_id: "u1".to_string(),
                status: "PROGRESS".to_string(),
                progress: 50,
                message: Some("half done".to_string()),
                timestamp: 1_700_000_000,
                data: json!({"page": 2}),
            },
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "task_update",
                "task_id": "t1",
                "user_id": "u1",
                "status": "PROGRESS",
                "progress": 50,
                "message": "half done",
                "timestamp": 1_700_000_000,
                "data": {"page": 2},
            })
        );

        let parsed: ServerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn empty_and_scalar_bodies() {
        let pong = serde_json::to_value(ServerMessage::empty(msg_types::PONG)).unwrap();
        assert_eq!(pong, json!({"type": "pong"}));

        let scalar = ServerMessage::new("custom", 42);
        assert_eq!(scalar.field("data"), Some(&json!(42)));
    }

    #[test]
    fn client_messages_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe_task","task_id":"abc"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SubscribeTask {
                task_id: "abc".to_string()
            }
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"get_subscriptions"}"#).unwrap();
        assert_eq!(msg, ClientMessage::GetSubscriptions);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe_task"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }
}
