use std::sync::Arc;

use crate::{
    config::Config,
    services::{NotifierHandle, SnapshotView},
    store::OrderStore,
    websocket::ConnectionRegistry,
};

/// Components shared by every HTTP and WebSocket handler, built once in `main`
#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub notifier: NotifierHandle,
    pub store: Arc<dyn OrderStore>,
    /// Watcher cache; holds completions whose write-back has not landed yet
    pub snapshot: SnapshotView,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        registry: ConnectionRegistry,
        notifier: NotifierHandle,
        store: Arc<dyn OrderStore>,
        snapshot: SnapshotView,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            notifier,
            store,
            snapshot,
            config,
        }
    }
}
