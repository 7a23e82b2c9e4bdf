/// Notification injection and engine status handlers
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::models::{NotifyRequest, OrderNotifyRequest};
use crate::state::AppState;

/// Service banner
///
/// GET /
pub async fn index() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "Order notification engine is running" }))
}

pub async fn health() -> &'static str {
    "OK"
}

/// Queue an arbitrary event on the router
///
/// POST /api/notify
pub async fn notify(
    state: web::Data<AppState>,
    req: web::Json<NotifyRequest>,
) -> Result<HttpResponse> {
    let req = req.into_inner();
    req.validate().map_err(AppError::BadRequest)?;

    let event = req.into_event();
    debug!(kind = %event.kind, topic = %event.topic, targets = event.target_ids.len(), "Notification requested");

    state
        .notifier
        .trigger(event)
        .await
        .map_err(|e| AppError::ServiceUnavailable(e.to_string()))?;

    Ok(HttpResponse::Ok().json(json!({ "status": "notification sent" })))
}

/// Queue an order status event for the order's watch session
///
/// POST /api/notify/order
pub async fn notify_order(
    state: web::Data<AppState>,
    req: web::Json<OrderNotifyRequest>,
) -> Result<HttpResponse> {
    let req = req.into_inner();
    req.validate().map_err(AppError::BadRequest)?;

    let order_id = req.order_id.clone();
    let event = req.into_event();
    info!(order_id = %order_id, kind = %event.kind, "Order status notification requested");

    state
        .notifier
        .trigger(event)
        .await
        .map_err(|e| AppError::ServiceUnavailable(e.to_string()))?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "order notification sent",
        "order_id": order_id,
    })))
}

/// Live connection statistics
///
/// GET /api/connections
pub async fn connections(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.registry.stats())
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index))
        .route("/health", web::get().to(health))
        .service(
            web::scope("/api")
                .app_data(
                    web::JsonConfig::default()
                        .error_handler(|err, _req| AppError::BadRequest(err.to_string()).into()),
                )
                .route("/notify", web::post().to(notify))
                .route("/notify/order", web::post().to(notify_order))
                .route("/connections", web::get().to(connections)),
        );
}
