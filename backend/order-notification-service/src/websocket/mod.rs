/// WebSocket real-time notification engine
///
/// Architecture:
/// 1. Connection: one live session with a bounded outbound queue
/// 2. ConnectionRegistry: the live connection set, one lock for every access path
/// 3. Pumps: reader (liveness) and writer (queue drain + pings) per connection
/// 4. OutboundMessage: the `{type, topic, payload}` envelope sent to peers

pub mod connection;
pub mod messages;
pub mod pumps;
pub mod registry;

pub use connection::{Connection, ConnectionId, EnqueueError};
pub use messages::OutboundMessage;
pub use pumps::{read_pump, write_pump, FrameSink, PumpSettings};
pub use registry::{ConnectionRegistry, ConnectionStats};
