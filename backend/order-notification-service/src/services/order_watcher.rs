/// Order change-feed watcher
///
/// Turns the store's mutation feed into completion notifications:
/// 1. Preload: every stored order seeds the snapshot cache
/// 2. Transition detection: a status entering the terminal value fires once
/// 3. At-most-once guard: `notified_at` in the document or the cache suppresses repeats
/// 4. Write-back: `notified_at` is persisted on a spawned task with retry
/// 5. Cleanup: the order's session is closed after the completion message
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use super::NotifierHandle;
use crate::config::WatcherConfig;
use crate::metrics;
use crate::models::{NotificationEvent, Order};
use crate::store::{ChangeEvent, ChangeStream, OrderStore, StoreError};

const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("failed to preload orders: {0}")]
    Preload(#[source] StoreError),

    #[error("failed to open order change feed: {0}")]
    Subscribe(#[source] StoreError),
}

/// Retry policy for the `notified_at` write-back
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 100,
            max_backoff_ms: 5000,
        }
    }
}

impl From<&WatcherConfig> for RetryPolicy {
    fn from(config: &WatcherConfig) -> Self {
        Self {
            max_retries: config.write_max_retries,
            backoff_ms: config.write_backoff_ms,
            max_backoff_ms: config.write_max_backoff_ms,
        }
    }
}

impl RetryPolicy {
    /// Calculate backoff duration for retry attempt
    pub fn get_backoff(&self, attempt: u32) -> Duration {
        let backoff = self
            .backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        Duration::from_millis(backoff.min(self.max_backoff_ms))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Read-only view of the watcher's snapshot cache
#[derive(Clone)]
pub struct SnapshotView {
    inner: Arc<RwLock<HashMap<String, Order>>>,
}

impl SnapshotView {
    pub fn get(&self, order_id: &str) -> Option<Order> {
        self.inner.read().get(order_id).cloned()
    }

    /// When the watcher recorded a completion for this order, if it has.
    pub fn notified_at(&self, order_id: &str) -> Option<DateTime<Utc>> {
        self.inner.read().get(order_id).and_then(Order::notified)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct OrderChangeWatcher {
    store: Arc<dyn OrderStore>,
    notifier: NotifierHandle,
    terminal_status: String,
    retention: chrono::Duration,
    sweep_period: Duration,
    retry: RetryPolicy,
    snapshot: Arc<RwLock<HashMap<String, Order>>>,
}

impl OrderChangeWatcher {
    pub fn new(store: Arc<dyn OrderStore>, notifier: NotifierHandle, config: &WatcherConfig) -> Self {
        let retention_secs = config.snapshot_retention_secs;
        Self {
            store,
            notifier,
            terminal_status: config.terminal_status.clone(),
            retention: chrono::Duration::seconds(retention_secs.min(u32::MAX as u64) as i64),
            sweep_period: Duration::from_secs(retention_secs.max(1)).min(MAX_SWEEP_PERIOD),
            retry: RetryPolicy::from(config),
            snapshot: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn snapshot(&self) -> SnapshotView {
        SnapshotView {
            inner: self.snapshot.clone(),
        }
    }

    /// Loads every stored order into the cache. Returns how many were loaded.
    pub async fn preload(&self) -> Result<usize, WatcherError> {
        let orders = self.store.find_all().await.map_err(WatcherError::Preload)?;
        let count = orders.len();
        let mut snapshot = self.snapshot.write();
        for order in orders {
            snapshot.insert(order.id.clone(), order);
        }
        info!(count, "Order snapshot preloaded");
        Ok(count)
    }

    /// Preloads, opens the feed, then watches it on a background task.
    ///
    /// Startup failures are returned; once running, a broken feed ends
    /// the task with an error log and is not reopened.
    pub async fn start(self, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>, WatcherError> {
        self.preload().await?;
        let feed = self.store.watch().await.map_err(WatcherError::Subscribe)?;
        info!(terminal_status = %self.terminal_status, "Order change watcher started");
        Ok(tokio::spawn(self.run(feed, shutdown)))
    }

    async fn run(self, mut feed: ChangeStream, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = interval_at(Instant::now() + self.sweep_period, self.sweep_period);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Order change watcher stopping");
                        break;
                    }
                }

                next = feed.next() => match next {
                    Some(Ok(change)) => {
                        self.handle_change(change).await;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Order change feed failed, watcher stopped");
                        break;
                    }
                    None => {
                        error!("Order change feed ended, watcher stopped");
                        break;
                    }
                },

                _ = sweep.tick() => {
                    self.evict_notified(Utc::now());
                }
            }
        }
    }

    /// Decodes one feed entry; an undecodable document is skipped.
    pub async fn handle_change(&self, change: ChangeEvent) -> bool {
        if !change.operation.carries_document() {
            debug!(
                document_key = %change.document_key,
                operation = ?change.operation,
                "Ignoring change without a live document"
            );
            return false;
        }
        match change.decode_order() {
            Ok(order) => self.handle_order(order).await,
            Err(e) => {
                warn!(
                    document_key = %change.document_key,
                    error = %e,
                    "Skipping undecodable order document"
                );
                false
            }
        }
    }

    /// Applies one observed order document. Returns `true` when it
    /// produced a completion notification.
    pub async fn handle_order(&self, order: Order) -> bool {
        let now = Utc::now();

        // Check-and-set happens in one write section; the watcher task is
        // the only writer, so nothing interleaves between the two.
        let fire = {
            let mut snapshot = self.snapshot.write();
            let prior = snapshot.get(&order.id);

            let completion = order.status == self.terminal_status
                && prior.map_or(true, |p| p.status != self.terminal_status);
            let already_notified = order
                .notified()
                .or_else(|| prior.and_then(|p| p.notified()));

            let mut latest = order.clone();
            latest.notified_at = already_notified;

            let fire = completion && already_notified.is_none();
            if fire {
                latest.notified_at = Some(now);
            } else if completion {
                debug!(order_id = %order.id, "Completion already notified, skipping");
            }
            snapshot.insert(order.id.clone(), latest);
            fire
        };

        if !fire {
            return false;
        }

        metrics::record_order_completed();
        info!(order_id = %order.id, restaurant_id = %order.restaurant_id, "Order completed");

        if let Err(e) = self
            .notifier
            .trigger(NotificationEvent::order_completed(&order))
            .await
        {
            error!(order_id = %order.id, error = %e, "Failed to submit completion event");
        }

        self.spawn_write_back(order.id.clone(), now);

        if let Err(e) = self.notifier.close_order(order.id.clone()).await {
            warn!(order_id = %order.id, error = %e, "Failed to request order session close");
        }
        true
    }

    fn spawn_write_back(&self, order_id: String, at: DateTime<Utc>) -> JoinHandle<()> {
        let store = self.store.clone();
        let policy = self.retry.clone();

        tokio::spawn(async move {
            let mut attempt = 0;
            loop {
                match store.mark_notified(&order_id, at).await {
                    Ok(()) => {
                        debug!(order_id = %order_id, attempt, "notified_at persisted");
                        return;
                    }
                    Err(StoreError::NotFound(_)) => {
                        warn!(order_id = %order_id, "Order vanished before notified_at write-back");
                        return;
                    }
                    Err(e) if policy.should_retry(attempt) => {
                        let backoff = policy.get_backoff(attempt);
                        warn!(
                            order_id = %order_id,
                            attempt = attempt + 1,
                            max_retries = policy.max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "notified_at write-back failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        metrics::record_notified_write_failure();
                        error!(
                            order_id = %order_id,
                            attempts = attempt + 1,
                            error = %e,
                            "Giving up on notified_at write-back"
                        );
                        return;
                    }
                }
            }
        })
    }

    /// Drops cache entries notified longer ago than the retention window.
    pub fn evict_notified(&self, now: DateTime<Utc>) -> usize {
        let mut snapshot = self.snapshot.write();
        let before = snapshot.len();
        snapshot.retain(|_, order| match order.notified() {
            Some(at) => now - at < self.retention,
            None => true,
        });
        let evicted = before - snapshot.len();
        if evicted > 0 {
            debug!(evicted, remaining = snapshot.len(), "Evicted notified orders from snapshot");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{NotificationManager, RouterCommand};
    use crate::store::MemoryOrderStore;
    use crate::websocket::ConnectionRegistry;
    use tokio::sync::mpsc;

    fn watcher_with_store(store: Arc<MemoryOrderStore>) -> (OrderChangeWatcher, NotificationManager) {
        let (manager, handle) = NotificationManager::new(ConnectionRegistry::new(), 16);
        let config = WatcherConfig {
            write_backoff_ms: 1,
            write_max_backoff_ms: 5,
            ..WatcherConfig::default()
        };
        (OrderChangeWatcher::new(store, handle, &config), manager)
    }

    async fn wait_for_writes(store: &MemoryOrderStore, expected: u32) {
        for _ in 0..100 {
            if store.notified_writes() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} notified writes, saw {}", expected, store.notified_writes());
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.get_backoff(0), Duration::from_millis(100));
        assert_eq!(policy.get_backoff(2), Duration::from_millis(400));
        assert_eq!(policy.get_backoff(10), Duration::from_millis(5000));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[tokio::test]
    async fn test_status_sequence_fires_once() {
        let store = Arc::new(MemoryOrderStore::new());
        let (watcher, _manager) = watcher_with_store(store.clone());
        store.seed(Order::new("o1", "r1", "pending"));
        watcher.preload().await.unwrap();

        assert!(!watcher.handle_order(Order::new("o1", "r1", "preparing")).await);
        assert!(watcher.handle_order(Order::new("o1", "r1", "fulfilled")).await);
        // Replay of the same document.
        assert!(!watcher.handle_order(Order::new("o1", "r1", "fulfilled")).await);

        wait_for_writes(&store, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.notified_writes(), 1);
        assert!(watcher.snapshot().get("o1").unwrap().is_notified());
    }

    #[tokio::test]
    async fn test_completion_without_prior_status_fires() {
        let store = Arc::new(MemoryOrderStore::new());
        let (watcher, _manager) = watcher_with_store(store.clone());
        store.seed(Order::new("o1", "r1", "pending"));

        // Cache is empty: the watcher restarted and never saw o1.
        assert!(watcher.snapshot().is_empty());
        assert!(watcher.handle_order(Order::new("o1", "r1", "fulfilled")).await);
        assert!(!watcher.handle_order(Order::new("o1", "r1", "fulfilled")).await);
    }

    #[tokio::test]
    async fn test_document_already_notified_is_skipped() {
        let store = Arc::new(MemoryOrderStore::new());
        let (watcher, _manager) = watcher_with_store(store.clone());

        let mut order = Order::new("o1", "r1", "fulfilled");
        order.notified_at = Some(Utc::now());
        assert!(!watcher.handle_order(order).await);
        assert_eq!(store.notified_writes(), 0);
    }

    #[tokio::test]
    async fn test_completion_queues_event_then_close() {
        let store = Arc::new(MemoryOrderStore::new());
        store.seed(Order::new("o7", "r1", "ready"));
        let (watcher, mut manager) = watcher_with_store(store.clone());
        watcher.preload().await.unwrap();

        assert!(watcher.handle_order(Order::new("o7", "r1", "fulfilled")).await);

        let rx: &mut mpsc::Receiver<RouterCommand> = manager.intake();
        match rx.recv().await {
            Some(RouterCommand::Event(event)) => {
                assert_eq!(event.target_ids, vec!["o7".to_string()]);
                assert_eq!(event.kind.as_str(), "order_completed");
            }
            other => panic!("expected completion event, got {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(RouterCommand::CloseOrder(id)) if id == "o7"));
    }

    #[tokio::test]
    async fn test_write_back_retries_transient_failures() {
        let store = Arc::new(MemoryOrderStore::new());
        store.seed(Order::new("o1", "r1", "pending"));
        store.fail_next_writes(2);
        let (watcher, _manager) = watcher_with_store(store.clone());
        watcher.preload().await.unwrap();

        assert!(watcher.handle_order(Order::new("o1", "r1", "fulfilled")).await);
        wait_for_writes(&store, 1).await;
        assert!(store.get("o1").unwrap().is_notified());
    }

    #[tokio::test]
    async fn test_malformed_document_is_skipped() {
        let store = Arc::new(MemoryOrderStore::new());
        let (watcher, _manager) = watcher_with_store(store.clone());

        let change = ChangeEvent {
            operation: crate::store::OperationType::Update,
            document_key: "bad".into(),
            full_document: Some(serde_json::json!({"id": 5})),
        };
        assert!(!watcher.handle_change(change).await);
        assert!(watcher.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_delete_carrying_document_is_ignored() {
        let store = Arc::new(MemoryOrderStore::new());
        let (watcher, _manager) = watcher_with_store(store.clone());

        let deleted = Order::new("o1", "r1", "fulfilled");
        let change = ChangeEvent::for_order(crate::store::OperationType::Delete, &deleted).unwrap();
        assert!(change.full_document.is_some());

        assert!(!watcher.handle_change(change).await);
        assert!(watcher.snapshot().is_empty());
        assert_eq!(store.notified_writes(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_reports_notified_before_write_back_lands() {
        let store = Arc::new(MemoryOrderStore::new());
        store.seed(Order::new("o1", "r1", "preparing"));
        store.fail_next_writes(100);
        let (watcher, _manager) = watcher_with_store(store.clone());

        assert!(watcher.handle_order(Order::new("o1", "r1", "fulfilled")).await);
        assert!(watcher.snapshot().notified_at("o1").is_some());
        assert!(watcher.snapshot().notified_at("o2").is_none());
        assert!(!store.get("o1").unwrap().is_notified());
    }

    #[tokio::test]
    async fn test_evict_notified_after_retention() {
        let store = Arc::new(MemoryOrderStore::new());
        let (watcher, _manager) = watcher_with_store(store.clone());
        store.seed(Order::new("open", "r1", "pending"));
        store.seed(Order::new("done", "r1", "preparing"));
        watcher.preload().await.unwrap();
        assert!(watcher.handle_order(Order::new("done", "r1", "fulfilled")).await);

        assert_eq!(watcher.evict_notified(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(watcher.evict_notified(later), 1);
        assert!(watcher.snapshot().get("done").is_none());
        assert!(watcher.snapshot().get("open").is_some());
    }
}
