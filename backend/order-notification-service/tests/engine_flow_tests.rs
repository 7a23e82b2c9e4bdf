/// End-to-end engine tests over the in-memory store
///
/// memory store feed -> watcher -> router -> registry -> connection queue
use order_notification_service::{
    config::WatcherConfig,
    models::{EventType, NotificationEvent, Order},
    store::{ChangeEvent, OperationType},
    Connection, ConnectionRegistry, MemoryOrderStore, NotificationManager, NotifierHandle,
    OrderChangeWatcher, OutboundMessage,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_test::assert_ok;

struct Engine {
    registry: ConnectionRegistry,
    notifier: NotifierHandle,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    async fn start(store: Arc<MemoryOrderStore>) -> Self {
        let registry = ConnectionRegistry::new();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (manager, notifier) = NotificationManager::new(registry.clone(), 100);
        let router = tokio::spawn(manager.run(shutdown_rx.clone()));

        let config = WatcherConfig {
            write_backoff_ms: 1,
            write_max_backoff_ms: 10,
            ..WatcherConfig::default()
        };
        let watcher = OrderChangeWatcher::new(store.clone(), notifier.clone(), &config);
        let watcher_task = watcher
            .start(shutdown_rx)
            .await
            .expect("watcher should start");

        Self {
            registry,
            notifier,
            shutdown,
            tasks: vec![router, watcher_task],
        }
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        for task in self.tasks {
            timeout(Duration::from_secs(2), task)
                .await
                .expect("task did not stop")
                .unwrap();
        }
    }
}

async fn next_message(rx: &mut mpsc::Receiver<String>) -> Option<OutboundMessage> {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for message")
        .map(|raw| OutboundMessage::from_json(&raw).unwrap())
}

async fn wait_until_notified(store: &MemoryOrderStore, order_id: &str) {
    for _ in 0..200 {
        if store.get(order_id).map_or(false, |o| o.is_notified()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("order {} was never marked notified", order_id);
}

#[tokio::test]
async fn test_completion_delivered_once_then_session_closed() {
    let store = Arc::new(MemoryOrderStore::new());
    store.seed(Order::new("o1", "r1", "pending"));
    let engine = Engine::start(store.clone()).await;

    let (conn, mut rx) = Connection::for_order("o1", "orders", 16);
    engine.registry.register(conn.clone());

    assert_ok!(store.set_status("o1", "preparing"));
    assert_ok!(store.set_status("o1", "fulfilled"));

    let message = next_message(&mut rx).await.expect("completion message");
    assert_eq!(message.kind, "order_completed");
    assert_eq!(message.topic, "orders");
    assert_eq!(message.payload["order_id"], "o1");
    assert_eq!(message.payload["status"], "fulfilled");

    // The close is queued behind the message on the router.
    assert!(next_message(&mut rx).await.is_none());
    assert!(conn.is_closed());
    assert!(engine.registry.order_connection("o1").is_none());

    wait_until_notified(&store, "o1").await;
    assert_eq!(store.notified_writes(), 1);

    engine.stop().await;
}

#[tokio::test]
async fn test_replayed_completion_does_not_fire_again() {
    let store = Arc::new(MemoryOrderStore::new());
    let engine = Engine::start(store.clone()).await;

    // Watcher never saw this order before it turned up fulfilled.
    assert_ok!(store.upsert(Order::new("o1", "r1", "fulfilled")));
    wait_until_notified(&store, "o1").await;

    let (late, mut late_rx) = Connection::for_order("o1", "orders", 16);
    engine.registry.register(late);

    let replay = ChangeEvent::for_order(OperationType::Update, &Order::new("o1", "r1", "fulfilled"))
        .unwrap();
    store.publish(replay);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(late_rx.try_recv().is_err());
    assert_eq!(store.notified_writes(), 1);

    engine.stop().await;
}

#[tokio::test]
async fn test_malformed_feed_document_does_not_stop_watcher() {
    let store = Arc::new(MemoryOrderStore::new());
    store.seed(Order::new("o2", "r1", "ready"));
    let engine = Engine::start(store.clone()).await;

    let (conn, mut rx) = Connection::for_order("o2", "orders", 16);
    engine.registry.register(conn);

    store.publish(ChangeEvent {
        operation: OperationType::Update,
        document_key: "broken".into(),
        full_document: Some(json!({"status": ["not", "a", "string"]})),
    });
    assert_ok!(store.set_status("o2", "fulfilled"));

    let message = next_message(&mut rx).await.expect("completion after bad document");
    assert_eq!(message.kind, "order_completed");

    engine.stop().await;
}

#[tokio::test]
async fn test_write_back_survives_transient_store_failures() {
    let store = Arc::new(MemoryOrderStore::new());
    store.seed(Order::new("o3", "r1", "preparing"));
    store.fail_next_writes(2);
    let engine = Engine::start(store.clone()).await;

    assert_ok!(store.set_status("o3", "fulfilled"));
    wait_until_notified(&store, "o3").await;
    assert_eq!(store.notified_writes(), 1);

    engine.stop().await;
}

#[tokio::test]
async fn test_topic_broadcast_evicts_slow_consumer() {
    let store = Arc::new(MemoryOrderStore::new());
    let engine = Engine::start(store).await;

    let (slow, _slow_rx) = Connection::for_subscriber("slow", None, "promotions", 1);
    let (fast, mut fast_rx) = Connection::for_subscriber("fast", None, "promotions", 16);
    engine.registry.register(slow.clone());
    engine.registry.register(fast);

    for n in 0..3 {
        let event = NotificationEvent::new(
            EventType::from("promo"),
            "promotions",
            Vec::new(),
            json!({ "n": n }),
        );
        assert_ok!(engine.notifier.trigger(event).await);
    }

    for n in 0..3 {
        let message = next_message(&mut fast_rx).await.expect("broadcast message");
        assert_eq!(message.payload["n"], n);
        assert_eq!(message.kind, "promo");
    }
    assert!(slow.is_closed());
    assert_eq!(engine.registry.len(), 1);

    engine.stop().await;
}

#[tokio::test]
async fn test_targeted_user_event_on_custom_topic() {
    let store = Arc::new(MemoryOrderStore::new());
    let engine = Engine::start(store).await;

    let (alice, mut alice_rx) =
        Connection::for_subscriber("alice", Some("restaurant".into()), "kitchen", 16);
    let (bob, mut bob_rx) = Connection::for_subscriber("bob", None, "kitchen", 16);
    engine.registry.register(alice);
    engine.registry.register(bob);

    let event = NotificationEvent::new(
        EventType::OrderAccepted,
        "kitchen",
        vec!["alice".to_string()],
        json!({ "order_id": "o9" }),
    );
    assert_ok!(engine.notifier.trigger(event).await);

    let message = next_message(&mut alice_rx).await.expect("targeted message");
    assert_eq!(message.kind, "order_accepted");
    assert_eq!(message.topic, "kitchen");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bob_rx.try_recv().is_err());

    engine.stop().await;
}
