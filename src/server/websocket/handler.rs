//! WebSocket route handler.
//!
//! Handles upgrade, the message loop and cleanup.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::jobs::{Actor, JobError, JobStore};
use crate::notifications::messages::system;
use crate::notifications::{msg_types, ClientMessage, ConnectionId, NotificationHub, ServerMessage};
use crate::server::request_user::RequestUser;
use crate::server::state::{GuardedJobStore, GuardedNotificationHub};

/// Route handler for `GET /ws`.
pub async fn ws_handler(
    user: RequestUser,
    ws: WebSocketUpgrade,
    State(hub): State<GuardedNotificationHub>,
    State(store): State<GuardedJobStore>,
) -> Response {
    debug!("WebSocket upgrade for user {}", user.user_id);
    ws.on_upgrade(move |socket| handle_socket(socket, user.actor(), hub, store))
}

async fn handle_socket(
    socket: WebSocket,
    actor: Actor,
    hub: GuardedNotificationHub,
    store: GuardedJobStore,
) {
    let connection = hub.connect(&actor.user_id);
    debug!(
        "WebSocket connected: user {} connection {}",
        actor.user_id, connection.id
    );

    let (ws_sink, ws_stream) = socket.split();

    // The hub queues the `connected` ack before anything else.
    let outgoing_handle = tokio::spawn(forward_outgoing(ws_sink, connection.receiver));

    process_incoming(ws_stream, &actor, connection.id, &hub, store.as_ref()).await;

    debug!(
        "WebSocket disconnected: user {} connection {}",
        actor.user_id, connection.id
    );
    outgoing_handle.abort();
    hub.disconnect(&actor.user_id, connection.id);
}

/// Forward messages from the connection's channel to the socket, then close
/// it once the channel ends.
async fn forward_outgoing(
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outgoing_rx: mpsc::Receiver<ServerMessage>,
) {
    while let Some(msg) = outgoing_rx.recv().await {
        match serde_json::to_string(&msg) {
            Ok(json) => {
                if ws_sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Failed to serialize WebSocket message: {}", e);
            }
        }
    }
    // The hub released this connection.
    let _ = ws_sink.send(Message::Close(None)).await;
}

async fn process_incoming(
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    actor: &Actor,
    connection_id: ConnectionId,
    hub: &NotificationHub,
    store: &dyn JobStore,
) {
    while let Some(result) = ws_stream.next().await {
        let reply = match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => handle_client_message(actor, msg, hub, store),
                Err(e) => {
                    debug!("Failed to parse client message: {}", e);
                    ServerMessage::new(
                        msg_types::ERROR,
                        system::Error::new("parse_error", format!("Invalid message format: {}", e)),
                    )
                }
            },
            Ok(Message::Binary(_)) => {
                debug!("Received binary message, ignoring");
                continue;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => {
                debug!("Received close frame");
                break;
            }
            Err(e) => {
                debug!("WebSocket error: {}", e);
                break;
            }
        };
        if hub
            .send_to_connection(&actor.user_id, connection_id, reply)
            .is_err()
        {
            break;
        }
    }
}

/// Apply a client message and build the reply for it.
fn handle_client_message(
    actor: &Actor,
    msg: ClientMessage,
    hub: &NotificationHub,
    store: &dyn JobStore,
) -> ServerMessage {
    match msg {
        ClientMessage::Ping => ServerMessage::empty(msg_types::PONG),
        ClientMessage::Heartbeat => ServerMessage::new(
            msg_types::HEARTBEAT_ACK,
            system::HeartbeatAck {
                timestamp: chrono::Utc::now().timestamp(),
            },
        ),
        ClientMessage::SubscribeTask { task_id } => {
            let allowed = store.get(&task_id).and_then(|record| {
                if record.is_manageable_by(actor) {
                    Ok(())
                } else {
                    Err(JobError::Permission(format!(
                        "task {} belongs to another user",
                        task_id
                    )))
                }
            });
            match allowed {
                Ok(()) => {
                    hub.subscribe(&actor.user_id, &task_id);
                    ServerMessage::new(msg_types::SUBSCRIBED, system::TaskRef { task_id })
                }
                Err(e) => {
                    debug!("User {} cannot subscribe to {}: {}", actor.user_id, task_id, e);
                    ServerMessage::new(msg_types::ERROR, system::Error::new(e.code(), e.to_string()))
                }
            }
        }
        ClientMessage::UnsubscribeTask { task_id } => {
            hub.unsubscribe(&actor.user_id, &task_id);
            ServerMessage::new(msg_types::UNSUBSCRIBED, system::TaskRef { task_id })
        }
        ClientMessage::GetSubscriptions => ServerMessage::new(
            msg_types::SUBSCRIPTIONS,
            system::Subscriptions {
                task_ids: hub.subscriptions_of(&actor.user_id),
            },
        ),
    }
}
