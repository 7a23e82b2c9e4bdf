#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use actix_web::{dev::ServerHandle, web, App, HttpServer};
use order_notification_service::{
    config::{AppConfig, DatabaseConfig, StoreBackend, WatcherConfig},
    handlers::{register_notifications, register_order_ws, register_topic_ws},
    AppState, Config, ConnectionRegistry, MemoryOrderStore, NotificationManager,
    OrderChangeWatcher, OrderStore,
};

pub fn test_config() -> Config {
    Config {
        app: AppConfig {
            env: "test".to_string(),
            port: 0,
        },
        database: DatabaseConfig {
            backend: StoreBackend::Memory,
            url: String::new(),
            max_connections: 1,
            run_migrations: false,
        },
        websocket: Default::default(),
        notifier: Default::default(),
        watcher: WatcherConfig {
            write_backoff_ms: 1,
            write_max_backoff_ms: 5,
            ..WatcherConfig::default()
        },
    }
}

/// State wired the way `main` wires it. The watcher is returned
/// unstarted so tests can feed it orders directly.
pub fn build_state_with_watcher(
    store: Arc<MemoryOrderStore>,
) -> (AppState, NotificationManager, OrderChangeWatcher) {
    let config = test_config();
    let registry = ConnectionRegistry::new();
    let (manager, notifier) = NotificationManager::new(registry.clone(), 16);
    let store: Arc<dyn OrderStore> = store;
    let watcher = OrderChangeWatcher::new(store.clone(), notifier.clone(), &config.watcher);
    let state = AppState::new(
        registry,
        notifier,
        store,
        watcher.snapshot(),
        Arc::new(config),
    );
    (state, manager, watcher)
}

pub fn build_state(store: Arc<MemoryOrderStore>) -> (AppState, NotificationManager) {
    let (state, manager, _watcher) = build_state_with_watcher(store);
    (state, manager)
}

pub async fn start_server(state: AppState) -> std::io::Result<(SocketAddr, ServerHandle)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(|cfg| {
                register_notifications(cfg);
                register_order_ws(cfg);
                register_topic_ws(cfg);
            })
    })
    .workers(1)
    .listen(listener)?
    .run();

    let handle = server.handle();
    actix_rt::spawn(server);
    Ok((addr, handle))
}
