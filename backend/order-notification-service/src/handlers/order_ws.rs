use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use tracing::{info, warn};

use super::spawn_pumps;
use crate::error::{AppError, Result};
use crate::models::ORDERS_TOPIC;
use crate::state::AppState;
use crate::websocket::{Connection, OutboundMessage, PumpSettings};

const MAX_ORDER_ID_LEN: usize = 128;

#[derive(Debug, Deserialize)]
pub struct OrderWsQuery {
    pub order_id: Option<String>,
    pub topic: Option<String>,
}

/// Order ids are opaque store keys: ASCII alphanumerics, `-` and `_`.
pub fn is_valid_order_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ORDER_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Validates the subscribe request against the store and the watcher cache before upgrading.
pub async fn check_order_subscription(state: &AppState, query: &OrderWsQuery) -> Result<String> {
    let order_id = query
        .order_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("order_id is required".to_string()))?;

    if !is_valid_order_id(order_id) {
        return Err(AppError::BadRequest("Invalid order ID format".to_string()));
    }

    let order = state
        .store
        .find_by_id(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Order not found".to_string()))?;

    // The store lags the watcher while the write-back is pending or failed.
    if let Some(notified_at) = order
        .notified()
        .or_else(|| state.snapshot.notified_at(&order.id))
    {
        return Err(AppError::AlreadyNotified { notified_at });
    }

    Ok(order.id)
}

/// Single-subscriber watch session for one order
///
/// Endpoint: GET /ws/orderNotification?order_id=..&topic=orders
pub async fn order_notification_ws(
    req: HttpRequest,
    body: web::Payload,
    query: web::Query<OrderWsQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let order_id = check_order_subscription(&state, &query).await?;
    let topic = query
        .topic
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(ORDERS_TOPIC)
        .to_string();

    let (response, session, stream) =
        actix_ws::handle(&req, body).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let ws_config = &state.config.websocket;
    let (conn, outbound) =
        Connection::for_order(order_id.as_str(), topic.as_str(), ws_config.outbound_queue_capacity);
    state.registry.register(conn.clone());

    if let Err(e) = conn.send_message(&OutboundMessage::order_welcome(&topic, &order_id)) {
        warn!(connection_id = %conn.id(), error = %e, "Failed to queue welcome message");
    }

    info!(connection_id = %conn.id(), order_id = %order_id, topic = %topic, "Order session opened");

    spawn_pumps(
        conn,
        outbound,
        session,
        stream,
        state.registry.clone(),
        PumpSettings::from(ws_config),
    );

    Ok(response)
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/orderNotification", web::get().to(order_notification_ws));
}
