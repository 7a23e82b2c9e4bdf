use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{Connection, ConnectionId, EnqueueError, OutboundMessage};
use crate::metrics;

/// Snapshot of the registry served by `GET /api/connections`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub order_sessions: usize,
    pub topics: BTreeMap<String, usize>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    /// order id -> the single connection watching it
    by_order: HashMap<String, ConnectionId>,
}

impl Inner {
    fn remove(&mut self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let conn = self.connections.remove(id)?;
        if let Some(order_id) = conn.order_id() {
            if self.by_order.get(order_id) == Some(id) {
                self.by_order.remove(order_id);
            }
        }
        Some(conn)
    }

    /// Enqueues onto one connection; a full or closed queue evicts it.
    fn deliver(&mut self, conn: &Arc<Connection>, message: &OutboundMessage) -> bool {
        match conn.send_message(message) {
            Ok(()) => true,
            Err(EnqueueError::Serialization(e)) => {
                tracing::error!(connection_id = %conn.id(), error = %e, "Failed to encode outbound message");
                false
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %conn.id(),
                    reason = %e,
                    "Dropping slow or dead connection"
                );
                metrics::record_slow_consumer_eviction();
                if let Some(evicted) = self.remove(conn.id()) {
                    evicted.close();
                }
                false
            }
        }
    }
}

/// Registry of live connections
///
/// One mutex guards both the connection set and the order index so
/// they never disagree. Every operation only does non-blocking work
/// while the lock is held.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. An order session replaces any earlier session
    /// for the same order, which is closed.
    pub fn register(&self, conn: Arc<Connection>) {
        let total = {
            let mut inner = self.inner.lock();
            if let Some(order_id) = conn.order_id() {
                if let Some(prior_id) = inner.by_order.insert(order_id.to_string(), conn.id().clone()) {
                    if &prior_id != conn.id() {
                        if let Some(prior) = inner.connections.remove(&prior_id) {
                            tracing::info!(
                                order_id,
                                prior_connection = %prior_id,
                                connection_id = %conn.id(),
                                "Replacing existing order session"
                            );
                            prior.close();
                        }
                    }
                }
            }
            inner.connections.insert(conn.id().clone(), conn.clone());
            inner.connections.len()
        };

        metrics::set_active_connections(total);
        tracing::debug!(
            connection_id = %conn.id(),
            topic = conn.topic(),
            order_id = conn.order_id(),
            user_id = conn.user_id(),
            total,
            "Connection registered"
        );
    }

    /// Removes and closes a connection. Unknown or already removed ids are a no-op.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let (removed, total) = {
            let mut inner = self.inner.lock();
            let removed = inner.remove(id);
            (removed, inner.connections.len())
        };

        match removed {
            Some(conn) => {
                conn.close();
                metrics::set_active_connections(total);
                tracing::debug!(connection_id = %id, total, "Connection unregistered");
                true
            }
            None => false,
        }
    }

    /// Closes the session watching `order_id`, if any.
    pub fn close_order_connection(&self, order_id: &str) -> bool {
        let holder = self.inner.lock().by_order.get(order_id).cloned();
        match holder {
            Some(id) => self.unregister(&id),
            None => false,
        }
    }

    /// Delivers to the single session watching `order_id`.
    pub fn dispatch_to_order(&self, order_id: &str, kind: &str, payload: &serde_json::Value) -> bool {
        let (delivered, total) = {
            let mut inner = self.inner.lock();
            let conn = inner
                .by_order
                .get(order_id)
                .and_then(|id| inner.connections.get(id))
                .cloned();
            let delivered = match conn {
                Some(conn) => {
                    let message = OutboundMessage::new(kind, conn.topic(), payload.clone());
                    inner.deliver(&conn, &message)
                }
                None => false,
            };
            (delivered, inner.connections.len())
        };

        metrics::set_active_connections(total);
        if delivered {
            metrics::record_delivered("order", 1);
        } else {
            tracing::debug!(order_id, kind, "No live session for order");
        }
        delivered
    }

    /// Delivers to every connection subscribed to `topic`.
    pub fn dispatch_to_topic(&self, topic: &str, kind: &str, payload: &serde_json::Value) -> usize {
        let message = OutboundMessage::new(kind, topic, payload.clone());
        let (delivered, total) = {
            let mut inner = self.inner.lock();
            let recipients: Vec<Arc<Connection>> = inner
                .connections
                .values()
                .filter(|c| c.topic() == topic)
                .cloned()
                .collect();
            let delivered = recipients
                .iter()
                .filter(|conn| inner.deliver(conn, &message))
                .count();
            (delivered, inner.connections.len())
        };

        metrics::set_active_connections(total);
        metrics::record_delivered("topic", delivered);
        delivered
    }

    /// Delivers to connections on `topic` whose user id is in `user_ids`.
    pub fn dispatch_to_users(
        &self,
        user_ids: &[String],
        topic: &str,
        kind: &str,
        payload: &serde_json::Value,
    ) -> usize {
        let message = OutboundMessage::new(kind, topic, payload.clone());
        let (delivered, total) = {
            let mut inner = self.inner.lock();
            let recipients: Vec<Arc<Connection>> = inner
                .connections
                .values()
                .filter(|c| c.topic() == topic)
                .filter(|c| {
                    c.user_id()
                        .map_or(false, |uid| user_ids.iter().any(|target| target == uid))
                })
                .cloned()
                .collect();
            let delivered = recipients
                .iter()
                .filter(|conn| inner.deliver(conn, &message))
                .count();
            (delivered, inner.connections.len())
        };

        metrics::set_active_connections(total);
        metrics::record_delivered("users", delivered);
        delivered
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.lock().connections.get(id).cloned()
    }

    pub fn order_connection(&self, order_id: &str) -> Option<Arc<Connection>> {
        let inner = self.inner.lock();
        inner
            .by_order
            .get(order_id)
            .and_then(|id| inner.connections.get(id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ConnectionStats {
        let inner = self.inner.lock();
        let mut topics = BTreeMap::new();
        for conn in inner.connections.values() {
            *topics.entry(conn.topic().to_string()).or_insert(0) += 1;
        }
        ConnectionStats {
            total_connections: inner.connections.len(),
            order_sessions: inner.by_order.len(),
            topics,
        }
    }

    /// Closes every connection, used on shutdown.
    pub fn close_all(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut inner = self.inner.lock();
            inner.by_order.clear();
            inner.connections.drain().map(|(_, c)| c).collect()
        };
        for conn in &drained {
            conn.close();
        }
        metrics::set_active_connections(0);
        tracing::info!(closed = drained.len(), "Closed all connections");
    }
}
