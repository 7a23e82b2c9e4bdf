use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

use super::{ChangeEvent, ChangeStream, OrderStore, StoreError, StoreResult};
use crate::models::Order;

/// NOTIFY channel written by the `orders_change_feed` trigger
pub const CHANGE_CHANNEL: &str = "order_changes";

/// Postgres-backed order store
///
/// The change feed is `LISTEN order_changes`; the trigger installed by
/// the bundled migration publishes the full row on every insert/update.
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await?;
        info!(max_connections, "Connected to order database");
        Ok(Self::new(pool))
    }

    /// Applies the bundled migrations (orders table and change-feed trigger).
    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {}", e)))?;
        info!("Order store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn order_from_row(row: &PgRow) -> Result<Order, sqlx::Error> {
        Ok(Order {
            id: row.try_get("id")?,
            restaurant_id: row.try_get("restaurant_id")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            notified_at: row.try_get("notified_at")?,
        })
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn find_all(&self) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT id, restaurant_id, status, created_at, notified_at
            FROM orders
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let orders = rows
            .iter()
            .map(Self::order_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        debug!(count = orders.len(), "Fetched orders for preload");
        Ok(orders)
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT id, restaurant_id, status, created_at, notified_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(Self::order_from_row)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn watch(&self) -> StoreResult<ChangeStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        info!(channel = CHANGE_CHANNEL, "Listening for order changes");

        let stream = listener.into_stream().filter_map(|item| async move {
            match item {
                Ok(notification) => {
                    match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                        Ok(event) if event.operation.carries_document() => Some(Ok(event)),
                        Ok(_) => None,
                        Err(e) => {
                            // A bad envelope only loses this one change.
                            warn!(error = %e, "Skipping undecodable order change notification");
                            None
                        }
                    }
                }
                Err(e) => Some(Err(StoreError::Feed(e.to_string()))),
            }
        });

        Ok(stream.boxed())
    }

    async fn mark_notified(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET notified_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        debug!(order_id = %id, notified_at = %at, "Order marked as notified");
        Ok(())
    }
}
