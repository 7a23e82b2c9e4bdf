use actix_ws::{CloseCode, CloseReason, Message, ProtocolError};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, warn};

use super::{Connection, ConnectionRegistry};
use crate::config::WebSocketConfig;

/// Transport timings shared by both pumps
#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_message_size: usize,
}

impl From<&WebSocketConfig> for PumpSettings {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            write_wait: config.write_wait(),
            pong_wait: config.pong_wait(),
            ping_period: config.ping_period(),
            max_message_size: config.max_message_size,
        }
    }
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self::from(&WebSocketConfig::default())
    }
}

#[derive(Debug, Error)]
#[error("websocket session closed")]
pub struct SessionClosed;

/// Outgoing half of a WebSocket session
#[async_trait(?Send)]
pub trait FrameSink: Clone {
    async fn text(&mut self, text: String) -> Result<(), SessionClosed>;

    async fn ping(&mut self, payload: &[u8]) -> Result<(), SessionClosed>;

    async fn pong(&mut self, payload: &[u8]) -> Result<(), SessionClosed>;

    async fn close(self, reason: Option<CloseReason>) -> Result<(), SessionClosed>;
}

#[async_trait(?Send)]
impl FrameSink for actix_ws::Session {
    async fn text(&mut self, text: String) -> Result<(), SessionClosed> {
        actix_ws::Session::text(self, text)
            .await
            .map_err(|_| SessionClosed)
    }

    async fn ping(&mut self, payload: &[u8]) -> Result<(), SessionClosed> {
        actix_ws::Session::ping(self, payload)
            .await
            .map_err(|_| SessionClosed)
    }

    async fn pong(&mut self, payload: &[u8]) -> Result<(), SessionClosed> {
        actix_ws::Session::pong(self, payload)
            .await
            .map_err(|_| SessionClosed)
    }

    async fn close(self, reason: Option<CloseReason>) -> Result<(), SessionClosed> {
        actix_ws::Session::close(self, reason)
            .await
            .map_err(|_| SessionClosed)
    }
}

/// Inbound side: only watches liveness and closure.
///
/// Every inbound frame extends the read deadline by `pong_wait`; the
/// writer's periodic ping is what keeps a healthy peer talking. Exits on
/// timeout, protocol error, peer close, or when the registry closes the
/// connection, and always unregisters on the way out.
pub async fn read_pump<S, F>(
    conn: Arc<Connection>,
    registry: ConnectionRegistry,
    mut sink: F,
    stream: S,
    settings: PumpSettings,
) where
    S: Stream<Item = Result<Message, ProtocolError>>,
    F: FrameSink,
{
    futures::pin_mut!(stream);

    loop {
        let next = tokio::select! {
            _ = conn.closed() => {
                debug!(connection_id = %conn.id(), "Reader stopping, connection closed");
                break;
            }
            next = timeout(settings.pong_wait, stream.next()) => next,
        };

        match next {
            Err(_) => {
                warn!(connection_id = %conn.id(), "Read deadline exceeded, peer presumed dead");
                break;
            }
            Ok(None) => {
                debug!(connection_id = %conn.id(), "WebSocket stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(connection_id = %conn.id(), error = %e, "WebSocket protocol error");
                break;
            }
            Ok(Some(Ok(message))) => match message {
                Message::Ping(payload) => {
                    if sink.pong(&payload).await.is_err() {
                        break;
                    }
                }
                Message::Pong(_) => {}
                Message::Text(text) if text.len() > settings.max_message_size => {
                    warn!(
                        connection_id = %conn.id(),
                        size = text.len(),
                        max = settings.max_message_size,
                        "Inbound message over read limit, closing"
                    );
                    break;
                }
                Message::Binary(data) if data.len() > settings.max_message_size => {
                    warn!(
                        connection_id = %conn.id(),
                        size = data.len(),
                        max = settings.max_message_size,
                        "Inbound message over read limit, closing"
                    );
                    break;
                }
                Message::Text(_) => {}
                Message::Binary(data) => {
                    debug!(connection_id = %conn.id(), size = data.len(), "Ignoring binary frame");
                }
                Message::Close(reason) => {
                    debug!(connection_id = %conn.id(), ?reason, "Peer closed connection");
                    break;
                }
                _ => {}
            },
        }
    }

    registry.unregister(conn.id());
}

/// Outbound side: drains the queue and probes the peer.
///
/// A closed queue means the registry let go of the connection, which is
/// answered with a normal close frame. A failed or late write tears the
/// connection down.
pub async fn write_pump<F>(
    conn: Arc<Connection>,
    registry: ConnectionRegistry,
    sink: F,
    mut outbound: mpsc::Receiver<String>,
    settings: PumpSettings,
) where
    F: FrameSink,
{
    let mut writer = sink.clone();
    let mut ping = interval_at(Instant::now() + settings.ping_period, settings.ping_period);

    let graceful = loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(text) => match timeout(settings.write_wait, writer.text(text)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        debug!(connection_id = %conn.id(), "Write failed, session gone");
                        break false;
                    }
                    Err(_) => {
                        warn!(connection_id = %conn.id(), "Write deadline exceeded");
                        break false;
                    }
                },
                None => break true,
            },
            _ = ping.tick() => {
                match timeout(settings.write_wait, writer.ping(b"")).await {
                    Ok(Ok(())) => {}
                    _ => {
                        warn!(connection_id = %conn.id(), "Ping failed");
                        break false;
                    }
                }
            }
        }
    };

    registry.unregister(conn.id());

    let reason = if graceful {
        CloseReason {
            code: CloseCode::Normal,
            description: None,
        }
    } else {
        CloseReason {
            code: CloseCode::Error,
            description: Some("write failure".into()),
        }
    };
    // The session may already be gone; nothing left to release either way.
    let _ = timeout(settings.write_wait, sink.close(Some(reason))).await;
    debug!(connection_id = %conn.id(), graceful, "Writer stopped");
}
