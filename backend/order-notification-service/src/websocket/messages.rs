/// Outbound message envelope delivered to every peer
use serde::{Deserialize, Serialize};

pub const WELCOME_TYPE: &str = "welcome";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    /// Always the recipient connection's topic
    pub topic: String,
    pub payload: serde_json::Value,
}

impl OutboundMessage {
    pub fn new(kind: impl Into<String>, topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            topic: topic.into(),
            payload,
        }
    }

    /// Greeting for an order watch session
    pub fn order_welcome(topic: &str, order_id: &str) -> Self {
        Self::new(
            WELCOME_TYPE,
            topic,
            serde_json::json!({
                "message": "Websocket connection established",
                "order_id": order_id,
                "time": chrono::Utc::now().to_rfc3339(),
            }),
        )
    }

    /// Greeting for a topic/user session
    pub fn subscriber_welcome(topic: &str, user_id: &str, user_type: Option<&str>) -> Self {
        Self::new(
            WELCOME_TYPE,
            topic,
            serde_json::json!({
                "message": "Websocket connection established",
                "user_id": user_id,
                "user_type": user_type,
                "time": chrono::Utc::now().to_rfc3339(),
            }),
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
