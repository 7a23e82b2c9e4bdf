use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use super::{ChangeEvent, ChangeStream, OperationType, OrderStore, StoreError, StoreResult};
use crate::models::Order;

const FEED_CAPACITY: usize = 1024;

/// In-process order store with a broadcast change feed
///
/// Every write publishes a change event carrying the full document,
/// including the `notified_at` write-back, the same way a real feed would.
pub struct MemoryOrderStore {
    orders: RwLock<HashMap<String, Order>>,
    feed: broadcast::Sender<ChangeEvent>,
    failing_writes: AtomicU32,
    notified_writes: AtomicU32,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            orders: RwLock::new(HashMap::new()),
            feed,
            failing_writes: AtomicU32::new(0),
            notified_writes: AtomicU32::new(0),
        }
    }

    /// Seeds an order without publishing a change event.
    pub fn seed(&self, order: Order) {
        self.orders.write().insert(order.id.clone(), order);
    }

    /// Inserts or replaces an order and publishes the change.
    pub fn upsert(&self, order: Order) -> StoreResult<()> {
        let operation = {
            let mut orders = self.orders.write();
            let op = if orders.contains_key(&order.id) {
                OperationType::Update
            } else {
                OperationType::Insert
            };
            orders.insert(order.id.clone(), order.clone());
            op
        };
        self.publish(ChangeEvent::for_order(operation, &order)?);
        Ok(())
    }

    /// Changes the status of an existing order and publishes the update.
    pub fn set_status(&self, id: &str, status: &str) -> StoreResult<Order> {
        let updated = {
            let mut orders = self.orders.write();
            let order = orders
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            order.status = status.to_string();
            order.clone()
        };
        self.publish(ChangeEvent::for_order(OperationType::Update, &updated)?);
        Ok(updated)
    }

    /// Publishes a raw change event, e.g. a replayed or malformed document.
    pub fn publish(&self, event: ChangeEvent) {
        // No receivers just means nobody is watching yet.
        let _ = self.feed.send(event);
    }

    /// Makes the next `count` calls to `mark_notified` fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of successful `mark_notified` writes
    pub fn notified_writes(&self) -> u32 {
        self.notified_writes.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: &str) -> Option<Order> {
        self.orders.read().get(id).cloned()
    }
}

impl Default for MemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn find_all(&self) -> StoreResult<Vec<Order>> {
        Ok(self.orders.read().values().cloned().collect())
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Order>> {
        Ok(self.get(id))
    }

    async fn watch(&self) -> StoreResult<ChangeStream> {
        let stream = BroadcastStream::new(self.feed.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) if event.operation.carries_document() => Some(Ok(event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "In-memory change feed lagged");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn mark_notified(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let failing = self.failing_writes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_writes.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }

        let updated = {
            let mut orders = self.orders.write();
            let order = orders
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            order.notified_at = Some(at);
            order.clone()
        };
        self.notified_writes.fetch_add(1, Ordering::SeqCst);
        self.publish(ChangeEvent::for_order(OperationType::Update, &updated)?);
        Ok(())
    }
}
