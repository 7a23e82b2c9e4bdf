use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use order_notification_service::{
    config::{DatabaseConfig, StoreBackend},
    handlers::{register_notifications, register_order_ws, register_topic_ws},
    logging, metrics, AppError, AppState, Config, ConnectionRegistry, MemoryOrderStore,
    NotificationManager, OrderChangeWatcher, OrderStore, PgOrderStore,
};
use std::io;
use std::sync::Arc;
use tokio::sync::watch;

async fn build_store(config: &DatabaseConfig) -> Result<Arc<dyn OrderStore>, AppError> {
    match config.backend {
        StoreBackend::Postgres => {
            let store = PgOrderStore::connect(&config.url, config.max_connections).await?;
            if config.run_migrations {
                store.run_migrations().await?;
            }
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory order store; orders are not persisted");
            Ok(Arc::new(MemoryOrderStore::new()))
        }
    }
}

fn startup_error(e: impl std::fmt::Display) -> io::Error {
    tracing::error!("Startup failed: {}", e);
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    logging::init_tracing();

    let config = Arc::new(Config::from_env().map_err(startup_error)?);
    tracing::info!(
        env = %config.app.env,
        store = ?config.database.backend,
        "Starting order notification service"
    );

    let store = build_store(&config.database).await.map_err(startup_error)?;

    let registry = ConnectionRegistry::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (manager, notifier) =
        NotificationManager::new(registry.clone(), config.notifier.queue_capacity);
    let router = tokio::spawn(manager.run(shutdown_rx.clone()));

    let watcher = OrderChangeWatcher::new(store.clone(), notifier.clone(), &config.watcher);
    let snapshot = watcher.snapshot();
    let watcher_task = watcher
        .start(shutdown_rx.clone())
        .await
        .map_err(startup_error)?;

    let state = AppState::new(registry.clone(), notifier, store, snapshot, config.clone());

    let addr = format!("0.0.0.0:{}", config.app.port);
    tracing::info!("Starting HTTP server on {}", addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .wrap(metrics::MetricsMiddleware)
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .configure(|cfg| {
                register_notifications(cfg);
                register_order_ws(cfg);
                register_topic_ws(cfg);
            })
    })
    .bind(&addr)
    .map_err(|e| startup_error(AppError::StartServer(e.to_string())))?
    .run()
    .await;

    tracing::info!("HTTP server stopped, shutting down engine");
    let _ = shutdown_tx.send(true);
    registry.close_all();
    if let Err(e) = router.await {
        tracing::error!("Notification router task failed: {}", e);
    }
    if let Err(e) = watcher_task.await {
        tracing::error!("Order watcher task failed: {}", e);
    }

    server
}
