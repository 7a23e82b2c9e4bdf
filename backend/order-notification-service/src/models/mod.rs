use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Topic used for single-order watch sessions
pub const ORDERS_TOPIC: &str = "orders";

/// Order projection tracked by the change-feed watcher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    #[serde(default)]
    pub restaurant_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        alias = "notifiedAt",
        skip_serializing_if = "Option::is_none"
    )]
    pub notified_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(id: impl Into<String>, restaurant_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            restaurant_id: restaurant_id.into(),
            status: status.into(),
            created_at: Some(Utc::now()),
            notified_at: None,
        }
    }

    /// A timestamp at or before the Unix epoch counts as unset.
    pub fn notified(&self) -> Option<DateTime<Utc>> {
        self.notified_at.filter(|at| at.timestamp() > 0)
    }

    pub fn is_notified(&self) -> bool {
        self.notified().is_some()
    }
}

/// Domain event tag carried as the `type` of every outbound message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    OrderCreated,
    OrderUpdated,
    OrderAccepted,
    OrderRejected,
    OrderInProcess,
    OrderReady,
    OrderDelivered,
    OrderCancelled,
    OrderCompleted,
    PaymentConfirmed,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::OrderCreated => "order_created",
            EventType::OrderUpdated => "order_updated",
            EventType::OrderAccepted => "order_accepted",
            EventType::OrderRejected => "order_rejected",
            EventType::OrderInProcess => "order_in_process",
            EventType::OrderReady => "order_ready",
            EventType::OrderDelivered => "order_delivered",
            EventType::OrderCancelled => "order_cancelled",
            EventType::OrderCompleted => "order_completed",
            EventType::PaymentConfirmed => "payment_confirmed",
            EventType::Custom(s) => s.as_str(),
        }
    }

    /// Maps an order status reported by the order API to its event tag.
    /// Unknown statuses are reported as a generic update.
    pub fn from_order_status(status: &str) -> Self {
        match status {
            "created" => EventType::OrderCreated,
            "updated" => EventType::OrderUpdated,
            "accepted" => EventType::OrderAccepted,
            "rejected" => EventType::OrderRejected,
            "in_process" => EventType::OrderInProcess,
            "ready" => EventType::OrderReady,
            "delivered" => EventType::OrderDelivered,
            "cancelled" => EventType::OrderCancelled,
            _ => EventType::OrderUpdated,
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "order_created" => EventType::OrderCreated,
            "order_updated" => EventType::OrderUpdated,
            "order_accepted" => EventType::OrderAccepted,
            "order_rejected" => EventType::OrderRejected,
            "order_in_process" => EventType::OrderInProcess,
            "order_ready" => EventType::OrderReady,
            "order_delivered" => EventType::OrderDelivered,
            "order_cancelled" => EventType::OrderCancelled,
            "order_completed" => EventType::OrderCompleted,
            "payment_confirmed" => EventType::PaymentConfirmed,
            _ => EventType::Custom(s),
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        EventType::from(s.to_string())
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        match t {
            EventType::Custom(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event submitted to the notification router
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub topic: String,
    #[serde(default)]
    pub target_ids: Vec<String>,
    pub payload: serde_json::Value,
}

impl NotificationEvent {
    pub fn new(
        kind: EventType,
        topic: impl Into<String>,
        target_ids: Vec<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            topic: topic.into(),
            target_ids,
            payload,
        }
    }

    /// Completion event for one order, targeted at that order's watcher
    pub fn order_completed(order: &Order) -> Self {
        let payload = serde_json::json!({
            "order_id": order.id,
            "restaurant_id": order.restaurant_id,
            "status": order.status,
            "timestamp": Utc::now().to_rfc3339(),
            "message": "Your order has been completed",
        });
        Self::new(
            EventType::OrderCompleted,
            ORDERS_TOPIC,
            vec![order.id.clone()],
            payload,
        )
    }
}

/// Body of `POST /api/notify`
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub topic: String,
    #[serde(default)]
    pub target_ids: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NotifyRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.kind.trim().is_empty() {
            return Err("Field 'type' is required".to_string());
        }
        if self.topic.trim().is_empty() {
            return Err("Field 'topic' is required".to_string());
        }
        if self.payload.is_null() {
            return Err("Field 'payload' is required".to_string());
        }
        Ok(())
    }

    pub fn into_event(self) -> NotificationEvent {
        NotificationEvent::new(
            EventType::from(self.kind),
            self.topic,
            self.target_ids,
            self.payload,
        )
    }
}

/// Body of `POST /api/notify/order`
#[derive(Debug, Clone, Deserialize)]
pub struct OrderNotifyRequest {
    pub order_id: String,
    pub status: String,
    pub restaurant_id: String,
    #[serde(default)]
    pub order_detail: Option<serde_json::Value>,
}

impl OrderNotifyRequest {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("order_id", &self.order_id),
            ("status", &self.status),
            ("restaurant_id", &self.restaurant_id),
        ] {
            if value.trim().is_empty() {
                return Err(format!("Field '{}' is required", name));
            }
        }
        Ok(())
    }

    pub fn into_event(self) -> NotificationEvent {
        let payload = serde_json::json!({
            "order_id": self.order_id,
            "status": self.status,
            "restaurant_id": self.restaurant_id,
            "detail": self.order_detail,
        });
        NotificationEvent::new(
            EventType::from_order_status(&self.status),
            ORDERS_TOPIC,
            vec![self.order_id],
            payload,
        )
    }
}
