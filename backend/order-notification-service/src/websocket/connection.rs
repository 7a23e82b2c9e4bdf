use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use uuid::Uuid;

use super::OutboundMessage;

/// Opaque connection identifier assigned at accept time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("outbound queue full")]
    Full,

    #[error("outbound queue closed")]
    Closed,

    #[error("failed to serialize message: {0}")]
    Serialization(String),
}

/// One live WebSocket session
///
/// Owns the sending half of a bounded outbound queue. Closing the
/// connection drops that sender, which ends the writer pump once the
/// queued messages are drained, and flips the `closed` signal that the
/// reader pump waits on.
pub struct Connection {
    id: ConnectionId,
    topic: String,
    order_id: Option<String>,
    user_id: Option<String>,
    user_type: Option<String>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Single-subscriber session watching one order
    pub fn for_order(
        order_id: impl Into<String>,
        topic: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        Self::build(topic.into(), Some(order_id.into()), None, None, capacity)
    }

    /// Topic session for a named user
    pub fn for_subscriber(
        user_id: impl Into<String>,
        user_type: Option<String>,
        topic: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        Self::build(topic.into(), None, Some(user_id.into()), user_type, capacity)
    }

    fn build(
        topic: String,
        order_id: Option<String>,
        user_id: Option<String>,
        user_type: Option<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            topic,
            order_id: order_id.filter(|id| !id.is_empty()),
            user_id,
            user_type,
            outbound: Mutex::new(Some(tx)),
            closed,
        });
        (conn, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn order_id(&self) -> Option<&str> {
        self.order_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn user_type(&self) -> Option<&str> {
        self.user_type.as_deref()
    }

    /// Non-blocking enqueue of an already serialized message.
    pub fn enqueue(&self, message: String) -> Result<(), EnqueueError> {
        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            None => Err(EnqueueError::Closed),
            Some(tx) => tx.try_send(message).map_err(|e| match e {
                TrySendError::Full(_) => EnqueueError::Full,
                TrySendError::Closed(_) => EnqueueError::Closed,
            }),
        }
    }

    /// Serializes and enqueues an envelope addressed to this connection.
    pub fn send_message(&self, message: &OutboundMessage) -> Result<(), EnqueueError> {
        let json = message
            .to_json()
            .map_err(|e| EnqueueError::Serialization(e.to_string()))?;
        self.enqueue(json)
    }

    /// Closes the outbound queue. Returns `true` only for the call that
    /// actually closed it, so repeated closes are harmless.
    pub fn close(&self) -> bool {
        let sender = self.outbound.lock().take();
        match sender {
            Some(tx) => {
                drop(tx);
                self.closed.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so the wait can only end by the flag flipping.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("order_id", &self.order_id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
