use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use tracing::{info, warn};

use super::spawn_pumps;
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::websocket::{Connection, OutboundMessage, PumpSettings};

#[derive(Debug, Deserialize)]
pub struct TopicWsQuery {
    pub user_id: Option<String>,
    pub user_type: Option<String>,
    pub topic: Option<String>,
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("{} is required", name)))
}

/// Topic session for a user; any number per user and topic
///
/// Endpoint: GET /ws/notifications?user_id=..&user_type=..&topic=..
pub async fn notifications_ws(
    req: HttpRequest,
    body: web::Payload,
    query: web::Query<TopicWsQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let user_id = required(&query.user_id, "user_id")?;
    let topic = required(&query.topic, "topic")?;
    let user_type = query
        .user_type
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let (response, session, stream) =
        actix_ws::handle(&req, body).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let ws_config = &state.config.websocket;
    let (conn, outbound) = Connection::for_subscriber(
        user_id,
        user_type.clone(),
        topic,
        ws_config.outbound_queue_capacity,
    );
    state.registry.register(conn.clone());

    let welcome = OutboundMessage::subscriber_welcome(topic, user_id, user_type.as_deref());
    if let Err(e) = conn.send_message(&welcome) {
        warn!(connection_id = %conn.id(), error = %e, "Failed to queue welcome message");
    }

    info!(connection_id = %conn.id(), user_id, topic, "Topic session opened");

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
    cfg.route("/ws/notifications", web::get().to(notifications_ws));
}
