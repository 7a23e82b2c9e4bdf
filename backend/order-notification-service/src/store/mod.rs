/// Persisted order store and its change feed
///
/// The watcher only depends on the `OrderStore` trait:
/// 1. Bulk read of every order (snapshot preload)
/// 2. Point read by id (subscribe-time conflict check)
/// 3. A continuous mutation feed carrying the full updated document
/// 4. Update-by-id for the `notified_at` write-back
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Order;

pub use memory::MemoryOrderStore;
pub use postgres::PgOrderStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Continuous stream of order mutations
pub type ChangeStream = BoxStream<'static, StoreResult<ChangeEvent>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("change feed error: {0}")]
    Feed(String),

    #[error("order not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
}

impl OperationType {
    /// Operations that carry a full document worth inspecting
    pub fn carries_document(&self) -> bool {
        matches!(
            self,
            OperationType::Insert | OperationType::Update | OperationType::Replace
        )
    }
}

/// One mutation observed on the order store
///
/// The document stays raw JSON so a malformed entry can be skipped
/// by the consumer without tearing down the feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub operation: OperationType,
    pub document_key: String,
    #[serde(default)]
    pub full_document: Option<serde_json::Value>,
}

impl ChangeEvent {
    pub fn for_order(operation: OperationType, order: &Order) -> StoreResult<Self> {
        Ok(Self {
            operation,
            document_key: order.id.clone(),
            full_document: Some(serde_json::to_value(order)?),
        })
    }

    pub fn decode_order(&self) -> StoreResult<Order> {
        let doc = self.full_document.clone().ok_or_else(|| {
            StoreError::Feed(format!("change for {} has no full document", self.document_key))
        })?;
        Ok(serde_json::from_value(doc)?)
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_all(&self) -> StoreResult<Vec<Order>>;

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Order>>;

    /// Opens the mutation feed, filtered to insert/update/replace.
    async fn watch(&self) -> StoreResult<ChangeStream>;

    async fn mark_notified(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;
}
