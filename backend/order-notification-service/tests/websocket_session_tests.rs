/// WebSocket session tests against a live server and client
use awc::{ws, Client};
use futures::{Stream, StreamExt};
use order_notification_service::{models::Order, MemoryOrderStore, OutboundMessage};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

mod support;

use support::{build_state, start_server};

async fn next_frame<S, E>(connection: &mut S) -> ws::Frame
where
    S: Stream<Item = Result<ws::Frame, E>> + Unpin,
    E: std::fmt::Debug,
{
    timeout(Duration::from_secs(2), connection.next())
        .await
        .expect("timed out waiting for frame")
        .expect("connection ended")
        .expect("frame data")
}

async fn next_message<S, E>(connection: &mut S) -> OutboundMessage
where
    S: Stream<Item = Result<ws::Frame, E>> + Unpin,
    E: std::fmt::Debug,
{
    match next_frame(connection).await {
        ws::Frame::Text(bytes) => {
            let text = String::from_utf8(bytes.to_vec()).unwrap();
            OutboundMessage::from_json(&text).unwrap()
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[actix_rt::test]
async fn test_order_session_registers_and_gets_one_welcome() {
    let store = Arc::new(MemoryOrderStore::new());
    store.seed(Order::new("o1", "r1", "preparing"));
    let (state, _manager) = build_state(store);
    let (addr, handle) = start_server(state.clone()).await.expect("start server");

    let (_resp, mut connection) = Client::new()
        .ws(format!("http://{addr}/ws/orderNotification?order_id=o1&topic=orders"))
        .connect()
        .await
        .expect("connect websocket client");

    let welcome = next_message(&mut connection).await;
    assert_eq!(welcome.kind, "welcome");
    assert_eq!(welcome.topic, "orders");
    assert_eq!(welcome.payload["order_id"], "o1");

    let registered = state.registry.order_connection("o1").expect("order session registered");
    assert_eq!(registered.topic(), "orders");
    assert_eq!(state.registry.len(), 1);

    // The next frame is the dispatched event, not a second welcome.
    assert!(state
        .registry
        .dispatch_to_order("o1", "order_ready", &json!({ "order_id": "o1" })));
    let message = next_message(&mut connection).await;
    assert_eq!(message.kind, "order_ready");

    handle.stop(true).await;
}

#[actix_rt::test]
async fn test_second_order_session_evicts_first() {
    let store = Arc::new(MemoryOrderStore::new());
    store.seed(Order::new("o1", "r1", "preparing"));
    let (state, _manager) = build_state(store);
    let (addr, handle) = start_server(state.clone()).await.expect("start server");
    let url = format!("http://{addr}/ws/orderNotification?order_id=o1&topic=orders");
    let client = Client::new();

    let (_resp, mut first) = client.ws(url.as_str()).connect().await.expect("first connect");
    assert_eq!(next_message(&mut first).await.kind, "welcome");
    let first_id = state.registry.order_connection("o1").unwrap().id().clone();

    let (_resp, mut second) = client.ws(url.as_str()).connect().await.expect("second connect");
    assert_eq!(next_message(&mut second).await.kind, "welcome");

    match next_frame(&mut first).await {
        ws::Frame::Close(reason) => {
            assert_eq!(reason.map(|r| r.code), Some(ws::CloseCode::Normal));
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    let current = state.registry.order_connection("o1").expect("second session registered");
    assert_ne!(current.id(), &first_id);
    assert!(state.registry.get(&first_id).is_none());
    assert_eq!(state.registry.stats().order_sessions, 1);

    assert!(state
        .registry
        .dispatch_to_order("o1", "order_ready", &json!({})));
    assert_eq!(next_message(&mut second).await.kind, "order_ready");

    handle.stop(true).await;
}

#[actix_rt::test]
async fn test_topic_session_receives_user_and_topic_events() {
    let (state, _manager) = build_state(Arc::new(MemoryOrderStore::new()));
    let (addr, handle) = start_server(state.clone()).await.expect("start server");

    let (_resp, mut connection) = Client::new()
        .ws(format!(
            "http://{addr}/ws/notifications?user_id=u1&user_type=customer&topic=promotions"
        ))
        .connect()
        .await
        .expect("connect websocket client");

    let welcome = next_message(&mut connection).await;
    assert_eq!(welcome.kind, "welcome");
    assert_eq!(welcome.topic, "promotions");
    assert_eq!(welcome.payload["user_id"], "u1");
    assert_eq!(welcome.payload["user_type"], "customer");

    let stats = state.registry.stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.order_sessions, 0);
    assert_eq!(stats.topics.get("promotions"), Some(&1));

    let delivered = state.registry.dispatch_to_users(
        &["u1".to_string()],
        "promotions",
        "promo",
        &json!({ "code": "2x1" }),
    );
    assert_eq!(delivered, 1);
    let message = next_message(&mut connection).await;
    assert_eq!(message.kind, "promo");
    assert_eq!(message.payload["code"], "2x1");

    assert_eq!(
        state
            .registry
            .dispatch_to_topic("promotions", "broadcast", &json!({})),
        1
    );
    assert_eq!(next_message(&mut connection).await.kind, "broadcast");

    handle.stop(true).await;
}
