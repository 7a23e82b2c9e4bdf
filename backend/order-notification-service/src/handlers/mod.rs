/// HTTP and WebSocket handlers
pub mod notifications;
pub mod order_ws;
pub mod topic_ws;

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::websocket::{read_pump, write_pump, Connection, ConnectionRegistry, PumpSettings};

pub use notifications::register_routes as register_notifications;
pub use order_ws::register_routes as register_order_ws;
pub use topic_ws::register_routes as register_topic_ws;

/// Starts the reader and writer for an upgraded session on the current
/// actix worker. The stream and session are `!Send`, so both run local.
pub(crate) fn spawn_pumps(
    conn: Arc<Connection>,
    outbound: mpsc::Receiver<String>,
    session: actix_ws::Session,
    stream: actix_ws::MessageStream,
    registry: ConnectionRegistry,
    settings: PumpSettings,
) {
    actix_rt::spawn(read_pump(
        conn.clone(),
        registry.clone(),
        session.clone(),
        stream,
        settings,
    ));
    actix_rt::spawn(write_pump(conn, registry, session, outbound, settings));
}
