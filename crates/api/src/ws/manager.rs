use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use crackq_core::job_events::{CHANNEL_ALL_JOBS, CHANNEL_USER_JOBS};
use crackq_core::types::{DbId, Timestamp};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use super::protocol::{JobUpdate, SystemMessage};

/// Channel sender half for pushing messages to a WebSocket connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// A subscription topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Updates for one job.
    Job(DbId),
    /// Every job update.
    AllJobs,
    /// Updates for jobs owned by the connection's user.
    UserJobs,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Job(id) => write!(f, "job:{id}"),
            Topic::AllJobs => write!(f, "channel:{CHANNEL_ALL_JOBS}"),
            Topic::UserJobs => write!(f, "channel:{CHANNEL_USER_JOBS}"),
        }
    }
}

/// Metadata for a single WebSocket connection.
pub struct WsConnection {
    /// Owner binding supplied by the transport, if any.
    pub user_id: Option<DbId>,
    pub sender: WsSender,
    pub connected_at: Timestamp,
    /// Last inbound frame of any kind.
    pub last_seen: Instant,
    pub subscriptions: HashSet<Topic>,
}

impl WsConnection {
    fn wants(&self, update: &JobUpdate) -> bool {
        self.subscriptions.contains(&Topic::Job(update.id))
            || self.subscriptions.contains(&Topic::AllJobs)
            || (self.subscriptions.contains(&Topic::UserJobs)
                && update.owner_id.is_some()
                && self.user_id == update.owner_id)
    }
}

/// Why a subscription request was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("connection not registered")]
    UnknownConnection,
    #[error("the user_jobs channel needs a connection bound to a user")]
    NoOwner,
}

/// Manages all active WebSocket connections and their subscriptions.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
/// shared across the application.
pub struct WsManager {
    connections: RwLock<HashMap<String, WsConnection>>,
}

impl WsManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new connection.
    ///
    /// Returns the receiver half of the message channel so the caller can
    /// forward messages to the WebSocket sink.
    pub async fn add(
        &self,
        conn_id: String,
        user_id: Option<DbId>,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = WsConnection {
            user_id,
            sender: tx,
            connected_at: chrono::Utc::now(),
            last_seen: Instant::now(),
            subscriptions: HashSet::new(),
        };
        self.connections.write().await.insert(conn_id, conn);
        rx
    }

    /// Remove a connection and all of its subscriptions.
    pub async fn remove(&self, conn_id: &str) {
        self.connections.write().await.remove(conn_id);
    }

    pub async fn subscribe(&self, conn_id: &str, topic: Topic) -> Result<(), SubscribeError> {
        let mut conns = self.connections.write().await;
        let conn = conns
            .get_mut(conn_id)
            .ok_or(SubscribeError::UnknownConnection)?;
        if topic == Topic::UserJobs && conn.user_id.is_none() {
            return Err(SubscribeError::NoOwner);
        }
        conn.subscriptions.insert(topic);
        Ok(())
    }

    /// Drop a subscription. Unsubscribing from a topic never subscribed is
    /// not an error.
    pub async fn unsubscribe(&self, conn_id: &str, topic: Topic) -> Result<(), SubscribeError> {
        let mut conns = self.connections.write().await;
        let conn = conns
            .get_mut(conn_id)
            .ok_or(SubscribeError::UnknownConnection)?;
        conn.subscriptions.remove(&topic);
        Ok(())
    }

    pub async fn subscriptions(&self, conn_id: &str) -> Vec<Topic> {
        self.connections
            .read()
            .await
            .get(conn_id)
            .map(|c| c.subscriptions.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Record inbound activity for liveness tracking.
    pub async fn touch(&self, conn_id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(conn_id) {
            conn.last_seen = Instant::now();
        }
    }

    /// Send a message to one connection. Returns `false` if it is gone.
    pub async fn send_to(&self, conn_id: &str, message: Message) -> bool {
        match self.connections.read().await.get(conn_id) {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Deliver a job update once to every connection subscribed to the
    /// job, to `all_jobs`, or to `user_jobs` with a matching owner.
    ///
    /// Returns the number of deliveries. Connections whose channel is
    /// closed are dropped; delivery failures never propagate further.
    pub async fn broadcast_job_update(&self, update: &JobUpdate) -> usize {
        let message = update.to_message();
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let conns = self.connections.read().await;
            for (id, conn) in conns.iter().filter(|(_, c)| c.wants(update)) {
                if conn.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(id.clone());
                }
            }
        }
        self.drop_dead(dead).await;
        delivered
    }

    /// Send a system message to every connection.
    pub async fn broadcast_system(&self, message: &SystemMessage) -> usize {
        let message = message.to_message();
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let conns = self.connections.read().await;
            for (id, conn) in conns.iter() {
                if conn.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(id.clone());
                }
            }
        }
        self.drop_dead(dead).await;
        delivered
    }

    async fn drop_dead(&self, dead: Vec<String>) {
        if dead.is_empty() {
            return;
        }
        let mut conns = self.connections.write().await;
        for id in dead {
            conns.remove(&id);
            tracing::debug!(conn_id = %id, "Dropped WebSocket connection with closed channel");
        }
    }

    /// Close and remove every connection with no inbound traffic for
    /// longer than `timeout`. Returns the evicted connection ids.
    pub async fn evict_stale(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut conns = self.connections.write().await;
        let stale: Vec<String> = conns
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(conn) = conns.remove(id) {
                let _ = conn.sender.send(Message::Close(None));
                tracing::info!(conn_id = %id, "Closing unresponsive WebSocket connection");
            }
        }
        stale
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a Close frame to every connection, then clear the map.
    pub async fn shutdown_all(&self) {
        let mut conns = self.connections.write().await;
        let count = conns.len();
        for conn in conns.values() {
            let _ = conn.sender.send(Message::Close(None));
        }
        conns.clear();
        tracing::info!(count, "Closed all WebSocket connections");
    }

    /// Send a Ping frame to every connected client.
    pub async fn ping_all(&self) {
        let conns = self.connections.read().await;
        for conn in conns.values() {
            let _ = conn.sender.send(Message::Ping(Bytes::new()));
        }
    }
}

impl Default for WsManager {
    fn default() -> Self {
        Self::new()
    }
}
