pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;
pub mod store;
pub mod websocket;

pub use config::Config;
pub use error::{AppError, Result};
pub use services::{NotificationManager, NotifierHandle, OrderChangeWatcher};
pub use state::AppState;
pub use store::{MemoryOrderStore, OrderStore, PgOrderStore};
pub use websocket::{Connection, ConnectionRegistry, OutboundMessage};
