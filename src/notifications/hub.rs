//! Notification hub.
//!
//! Tracks live connections per user and which users follow which tasks,
//! then fans task events out to them. All index state sits behind a single
//! mutex that is held for mutation and snapshotting only; sends happen after
//! the lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::messages::{msg_types, system, ServerMessage, TaskEvent, TaskUpdate};
use crate::server::metrics;

pub type ConnectionId = u64;

/// Why a message did not reach a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The connection's writer is gone. The connection gets removed.
    Closed,
    /// The connection is not keeping up. Only this message is dropped.
    Lagging,
}

impl SendFailure {
    fn as_str(&self) -> &'static str {
        match self {
            SendFailure::Closed => "closed",
            SendFailure::Lagging => "lagging",
        }
    }
}

#[derive(Default)]
struct HubState {
    /// user_id -> (connection_id -> outgoing channel)
    connections: HashMap<String, HashMap<ConnectionId, mpsc::Sender<ServerMessage>>>,
    /// task_id -> subscribed user_ids
    task_subscribers: HashMap<String, HashSet<String>>,
    /// user_id -> subscribed task_ids
    user_subscriptions: HashMap<String, HashSet<String>>,
}

impl HubState {
    fn subscription_count(&self) -> usize {
        self.user_subscriptions.values().map(HashSet::len).sum()
    }

    fn connection_count(&self) -> usize {
        self.connections.values().map(HashMap::len).sum()
    }

    /// Removes a connection; drops the user's subscriptions with the last one.
    /// Returns true if the connection existed.
    fn remove_connection(&mut self, user_id: &str, connection_id: ConnectionId) -> bool {
        let Some(user_conns) = self.connections.get_mut(user_id) else {
            return false;
        };
        if user_conns.remove(&connection_id).is_none() {
            return false;
        }
        if user_conns.is_empty() {
            self.connections.remove(user_id);
            if let Some(tasks) = self.user_subscriptions.remove(user_id) {
                for task_id in tasks {
                    self.unlink(&task_id, user_id);
                }
            }
        }
        true
    }

    fn unlink(&mut self, task_id: &str, user_id: &str) {
        if let Some(users) = self.task_subscribers.get_mut(task_id) {
            users.remove(user_id);
            if users.is_empty() {
                self.task_subscribers.remove(task_id);
            }
        }
    }

    fn senders_of(&self, user_id: &str, out: &mut Vec<Recipient>) {
        if let Some(user_conns) = self.connections.get(user_id) {
            for (connection_id, sender) in user_conns {
                out.push(Recipient {
                    user_id: user_id.to_string(),
                    connection_id: *connection_id,
                    sender: sender.clone(),
                });
            }
        }
    }
}

struct Recipient {
    user_id: String,
    connection_id: ConnectionId,
    sender: mpsc::Sender<ServerMessage>,
}

/// A freshly registered connection.
pub struct Connection {
    pub id: ConnectionId,
    pub receiver: mpsc::Receiver<ServerMessage>,
}

/// Process-local fan-out of task events to subscribed connections.
pub struct NotificationHub {
    state: Mutex<HubState>,
    next_connection_id: AtomicU64,
    buffer: usize,
    server_version: String,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl NotificationHub {
    /// `buffer` is the number of outgoing messages queued per connection.
    pub fn new(buffer: usize) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            next_connection_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            server_version: format!("{}-{}", env!("CARGO_PKG_VERSION"), env!("GIT_HASH")),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // Index operations never panic midway, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_gauges(state: &HubState) {
        metrics::set_live_connections(state.connection_count());
        metrics::set_live_subscriptions(state.subscription_count());
    }

    /// Register a connection for `user_id`.
    ///
    /// The returned receiver already holds the `connected` acknowledgement.
    pub fn connect(&self, user_id: &str) -> Connection {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        let ack = ServerMessage::new(
            msg_types::CONNECTED,
            system::Connected {
                connection_id: id,
                user_id: user_id.to_string(),
                server_version: self.server_version.clone(),
            },
        );
        // Fresh channel with capacity >= 1.
        let _ = tx.try_send(ack);

        let mut state = self.lock();
        state
            .connections
            .entry(user_id.to_string())
            .or_default()
            .insert(id, tx);
        Self::publish_gauges(&state);
        debug!("Hub: user {} connected ({})", user_id, id);

        Connection { id, receiver: rx }
    }

    /// Remove a connection. The user's last connection takes all of that
    /// user's subscriptions with it.
    pub fn disconnect(&self, user_id: &str, connection_id: ConnectionId) {
        let mut state = self.lock();
        if state.remove_connection(user_id, connection_id) {
            debug!("Hub: user {} disconnected ({})", user_id, connection_id);
        }
        Self::publish_gauges(&state);
    }

    /// Idempotent.
    pub fn subscribe(&self, user_id: &str, task_id: &str) {
        let mut state = self.lock();
        state
            .task_subscribers
            .entry(task_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        state
            .user_subscriptions
            .entry(user_id.to_string())
            .or_default()
            .insert(task_id.to_string());
        Self::publish_gauges(&state);
    }

    /// Idempotent.
    pub fn unsubscribe(&self, user_id: &str, task_id: &str) {
        let mut state = self.lock();
        state.unlink(task_id, user_id);
        if let Some(tasks) = state.user_subscriptions.get_mut(user_id) {
            tasks.remove(task_id);
            if tasks.is_empty() {
                state.user_subscriptions.remove(user_id);
            }
        }
        Self::publish_gauges(&state);
    }

    /// Task ids `user_id` currently follows, sorted.
    pub fn subscriptions_of(&self, user_id: &str) -> Vec<String> {
        let state = self.lock();
        let mut tasks: Vec<String> = state
            .user_subscriptions
            .get(user_id)
            .map(|tasks| tasks.iter().cloned().collect())
            .unwrap_or_default();
        tasks.sort();
        tasks
    }

    /// User ids following `task_id`, sorted.
    pub fn subscribers_of(&self, task_id: &str) -> Vec<String> {
        let state = self.lock();
        let mut users: Vec<String> = state
            .task_subscribers
            .get(task_id)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.lock()
            .connections
            .get(user_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.lock().connection_count()
    }

    /// Drop every connection and subscription.
    ///
    /// Releasing the senders lets each writer flush what is already queued
    /// and then close its socket. Returns the number of connections dropped.
    pub fn shutdown(&self) -> usize {
        let mut state = self.lock();
        let closed = state.connection_count();
        *state = HubState::default();
        Self::publish_gauges(&state);
        debug!("Hub: shut down, {} connections released", closed);
        closed
    }

    /// Send a message to a single connection. Fails only if the connection
    /// is unknown; delivery itself is best-effort.
    pub fn send_to_connection(
        &self,
        user_id: &str,
        connection_id: ConnectionId,
        message: ServerMessage,
    ) -> Result<(), SendFailure> {
        let sender = {
            let state = self.lock();
            state
                .connections
                .get(user_id)
                .and_then(|conns| conns.get(&connection_id))
                .cloned()
        };
        let Some(sender) = sender else {
            return Err(SendFailure::Closed);
        };
        let recipient = Recipient {
            user_id: user_id.to_string(),
            connection_id,
            sender,
        };
        self.deliver(vec![recipient], &message);
        Ok(())
    }

    /// Deliver a status update for `task_id` to the originating user and to
    /// every subscriber of the task, each connection once.
    ///
    /// Returns how many connections accepted the message.
    pub fn publish_update(
        &self,
        task_id: &str,
        originating_user: &str,
        status: &str,
        progress: u8,
        message: Option<&str>,
        data: serde_json::Value,
    ) -> usize {
        let recipients = {
            let state = self.lock();
            let mut users: HashSet<&str> = HashSet::new();
            users.insert(originating_user);
            if let Some(subscribers) = state.task_subscribers.get(task_id) {
                users.extend(subscribers.iter().map(String::as_str));
            }
            let mut recipients = Vec::new();
            for user in users {
                state.senders_of(user, &mut recipients);
            }
            recipients
        };
        if recipients.is_empty() {
            return 0;
        }

        let update = ServerMessage::new(
            msg_types::TASK_UPDATE,
            TaskUpdate {
                task_id: task_id.to_string(),
                user_id: originating_user.to_string(),
                status: status.to_string(),
                progress,
                message: message.map(str::to_string),
                timestamp: chrono::Utc::now().timestamp(),
                data,
            },
        );
        self.deliver(recipients, &update)
    }

    /// Deliver an arbitrary event to every subscriber of `task_id`.
    pub fn broadcast_event(&self, task_id: &str, event_type: &str, data: serde_json::Value) -> usize {
        let recipients = {
            let state = self.lock();
            let mut recipients = Vec::new();
            if let Some(subscribers) = state.task_subscribers.get(task_id) {
                for user in subscribers {
                    state.senders_of(user, &mut recipients);
                }
            }
            recipients
        };
        if recipients.is_empty() {
            return 0;
        }

        let event = ServerMessage::new(
            event_type,
            TaskEvent {
                task_id: task_id.to_string(),
                timestamp: chrono::Utc::now().timestamp(),
                data,
            },
        );
        self.deliver(recipients, &event)
    }

    /// Send to a snapshot of connections. Closed connections are removed
    /// afterwards; a failure never stops delivery to the rest.
    fn deliver(&self, recipients: Vec<Recipient>, message: &ServerMessage) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for recipient in recipients {
            let outcome = match recipient.sender.try_send(message.clone()) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => Err(SendFailure::Lagging),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(SendFailure::Closed),
            };
            match outcome {
                Ok(()) => {
                    delivered += 1;
                    metrics::record_notification_sent(&message.msg_type);
                }
                Err(failure) => {
                    warn!(
                        "Hub: dropping {} for user {} connection {} ({})",
                        message.msg_type,
                        recipient.user_id,
                        recipient.connection_id,
                        failure.as_str()
                    );
                    metrics::record_notification_failure(failure.as_str());
                    if failure == SendFailure::Closed {
                        closed.push((recipient.user_id, recipient.connection_id));
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut state = self.lock();
            for (user_id, connection_id) in closed {
                state.remove_connection(&user_id, connection_id);
            }
            Self::publish_gauges(&state);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(conn: &mut Connection) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = conn.receiver.try_recv() {
            out.push(msg);
        }
        out
    }

    fn updates(conn: &mut Connection) -> Vec<ServerMessage> {
        drain(conn)
            .into_iter()
            .filter(|m| m.msg_type == msg_types::TASK_UPDATE)
            .collect()
    }

    #[test]
    fn connect_sends_ack() {
        let hub = NotificationHub::new(8);
        let mut conn = hub.connect("u1");

        let msgs = drain(&mut conn);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg_type, msg_types::CONNECTED);
        assert_eq!(msgs[0].field("connection_id"), Some(&json!(conn.id)));
        assert_eq!(hub.connection_count("u1"), 1);
    }

    #[test]
    fn connection_ids_are_unique() {
        let hub = NotificationHub::new(8);
        let a = hub.connect("u1");
        let b = hub.connect("u1");
        assert_ne!(a.id, b.id);
        assert_eq!(hub.connection_count("u1"), 2);
    }

    #[test]
    fn subscribe_unsubscribe_round_trip() {
        let hub = NotificationHub::new(8);
        hub.subscribe("u1", "t0");
        let before = (hub.subscriptions_of("u1"), hub.subscribers_of("t1"));

        hub.subscribe("u1", "t1");
        hub.subscribe("u1", "t1");
        assert_eq!(hub.subscriptions_of("u1"), vec!["t0", "t1"]);
        assert_eq!(hub.subscribers_of("t1"), vec!["u1"]);

        hub.unsubscribe("u1", "t1");
        hub.unsubscribe("u1", "t1");
        assert_eq!(
            (hub.subscriptions_of("u1"), hub.subscribers_of("t1")),
            before
        );
    }

    #[test]
    fn last_disconnect_removes_all_subscriptions() {
        let hub = NotificationHub::new(8);
        let a = hub.connect("u1");
        let b = hub.connect("u1");
        hub.subscribe("u1", "t1");
        hub.subscribe("u1", "t2");
        hub.subscribe("u2", "t1");

        hub.disconnect("u1", a.id);
        assert_eq!(hub.subscriptions_of("u1"), vec!["t1", "t2"]);

        hub.disconnect("u1", b.id);
        assert!(hub.subscriptions_of("u1").is_empty());
        assert_eq!(hub.subscribers_of("t1"), vec!["u2"]);
        assert!(hub.subscribers_of("t2").is_empty());
        assert_eq!(hub.connection_count("u1"), 0);
    }

    #[test]
    fn disconnect_unknown_connection_is_harmless() {
        let hub = NotificationHub::new(8);
        let conn = hub.connect("u1");
        hub.subscribe("u1", "t1");
        hub.disconnect("u1", conn.id + 100);
        hub.disconnect("nobody", 1);
        assert_eq!(hub.subscriptions_of("u1"), vec!["t1"]);
    }

    #[tokio::test]
    async fn shutdown_flushes_then_closes_connections() {
        let hub = NotificationHub::new(8);
        let mut a = hub.connect("u1");
        let mut b = hub.connect("u2");
        hub.subscribe("u2", "T");
        hub.publish_update("T", "u1", "PROGRESS", 20, None, json!(null));

        assert_eq!(hub.shutdown(), 2);
        assert_eq!(hub.total_connections(), 0);
        assert!(hub.subscriptions_of("u2").is_empty());
        assert!(hub.subscribers_of("T").is_empty());

        for conn in [&mut a, &mut b] {
            let first = conn.receiver.recv().await.unwrap();
            assert_eq!(first.msg_type, msg_types::CONNECTED);
            let second = conn.receiver.recv().await.unwrap();
            assert_eq!(second.msg_type, msg_types::TASK_UPDATE);
            assert!(conn.receiver.recv().await.is_none());
        }

        assert_eq!(hub.publish_update("T", "u1", "SUCCESS", 100, None, json!(null)), 0);
        assert!(hub.send_to_connection("u1", a.id, ServerMessage::empty(msg_types::PONG)).is_err());
    }

    #[test]
    fn publish_without_audience_is_noop() {
        let hub = NotificationHub::new(8);
        assert_eq!(
            hub.publish_update("t1", "u1", "PROGRESS", 10, None, json!(null)),
            0
        );
        assert_eq!(hub.broadcast_event("t1", "custom", json!({})), 0);
    }

    #[test]
    fn publish_reaches_owner_and_subscribers_once() {
        let hub = NotificationHub::new(8);
        let mut a = hub.connect("u1");
        let mut b = hub.connect("u2");
        hub.subscribe("u1", "T");
        hub.subscribe("u2", "T");

        let delivered = hub.publish_update("T", "u1", "PROGRESS", 50, Some("half done"), json!(null));
        assert_eq!(delivered, 2);

        let to_a = updates(&mut a);
        let to_b = updates(&mut b);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_a[0].field("progress"), Some(&json!(50)));
        assert_eq!(to_b[0].field("message"), Some(&json!("half done")));
        assert_eq!(to_b[0].field("user_id"), Some(&json!("u1")));
    }

    #[test]
    fn owner_gets_updates_without_subscribing() {
        let hub = NotificationHub::new(8);
        let mut owner = hub.connect("u1");
        let mut other = hub.connect("u2");

        hub.publish_update("T", "u1", "SUCCESS", 100, None, json!({"pages": 3}));
        assert_eq!(updates(&mut owner).len(), 1);
        assert!(updates(&mut other).is_empty());
    }

    #[test]
    fn broadcast_only_reaches_subscribers() {
        let hub = NotificationHub::new(8);
        let mut sub = hub.connect("u1");
        let mut owner = hub.connect("u2");
        hub.subscribe("u1", "T");

        assert_eq!(hub.broadcast_event("T", "document_ready", json!({"doc": 1})), 1);
        let msgs: Vec<_> = drain(&mut sub)
            .into_iter()
            .filter(|m| m.msg_type == "document_ready")
            .collect();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].field("task_id"), Some(&json!("T")));
        assert!(drain(&mut owner)
            .iter()
            .all(|m| m.msg_type == msg_types::CONNECTED));
    }

    #[test]
    fn closed_connection_is_dropped_without_affecting_others() {
        let hub = NotificationHub::new(8);
        let dead = hub.connect("u1");
        let mut alive = hub.connect("u1");
        let mut other = hub.connect("u2");
        hub.subscribe("u2", "T");
        drop(dead.receiver);

        let delivered = hub.publish_update("T", "u1", "PROGRESS", 5, None, json!(null));
        assert_eq!(delivered, 2);
        assert_eq!(updates(&mut alive).len(), 1);
        assert_eq!(updates(&mut other).len(), 1);
        assert_eq!(hub.connection_count("u1"), 1);
    }

    #[test]
    fn closed_last_connection_cascades_subscriptions() {
        let hub = NotificationHub::new(8);
        let dead = hub.connect("u2");
        hub.subscribe("u2", "T");
        drop(dead.receiver);

        assert_eq!(hub.broadcast_event("T", "custom", json!(null)), 0);
        assert!(hub.subscribers_of("T").is_empty());
        assert!(hub.subscriptions_of("u2").is_empty());
    }

    #[test]
    fn lagging_connection_keeps_its_place() {
        let hub = NotificationHub::new(1);
        let mut slow = hub.connect("u1");
        // Buffer already holds the ack.
        assert_eq!(hub.publish_update("T", "u1", "PROGRESS", 1, None, json!(null)), 0);
        assert_eq!(hub.connection_count("u1"), 1);

        drain(&mut slow);
        assert_eq!(hub.publish_update("T", "u1", "PROGRESS", 2, None, json!(null)), 1);
    }

    #[test]
    fn send_to_connection_targets_one() {
        let hub = NotificationHub::new(8);
        let mut a = hub.connect("u1");
        let mut b = hub.connect("u1");
        drain(&mut a);
        drain(&mut b);

        hub.send_to_connection("u1", a.id, ServerMessage::empty(msg_types::PONG))
            .unwrap();
        assert_eq!(drain(&mut a).len(), 1);
        assert!(drain(&mut b).is_empty());
        assert_eq!(
            hub.send_to_connection("u1", 999, ServerMessage::empty(msg_types::PONG)),
            Err(SendFailure::Closed)
        );
    }
}
