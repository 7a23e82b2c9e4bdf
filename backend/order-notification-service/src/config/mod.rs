use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub websocket: WebSocketConfig,
    pub notifier: NotifierConfig,
    pub watcher: WatcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub port: u16,
}

/// Which order store implementation backs the change feed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(StoreBackend::Postgres),
            "memory" | "mem" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    pub url: String,
    pub max_connections: u32,
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    pub outbound_queue_capacity: usize,
    pub write_wait_secs: u64,
    pub pong_wait_secs: u64,
    pub max_message_size: usize,
}

impl WebSocketConfig {
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Must stay below the pong wait so the peer sees a probe before its deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            write_wait_secs: 10,
            pong_wait_secs: 60,
            max_message_size: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub queue_capacity: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self { queue_capacity: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub terminal_status: String,
    /// How long a notified order stays in the snapshot cache
    pub snapshot_retention_secs: u64,
    pub write_max_retries: u32,
    pub write_backoff_ms: u64,
    pub write_max_backoff_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            terminal_status: "fulfilled".to_string(),
            snapshot_retention_secs: 3600,
            write_max_retries: 3,
            write_backoff_ms: 100,
            write_max_backoff_ms: 5000,
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var_or(key, default)
        .parse()
        .map_err(|e| AppError::Config(format!("{}: {}", key, e)))
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("No .env file loaded: {}", e);
        }

        let defaults_ws = WebSocketConfig::default();
        let defaults_watcher = WatcherConfig::default();

        let config = Config {
            app: AppConfig {
                env: var_or("APP_ENV", "development"),
                port: parse_var("PORT", "8080")?,
            },
            database: DatabaseConfig {
                backend: parse_var("STORE_BACKEND", "postgres")?,
                url: var_or("DATABASE_URL", "postgres://localhost/mipedido"),
                max_connections: parse_var("DATABASE_MAX_CONNECTIONS", "10")?,
                run_migrations: parse_var("RUN_MIGRATIONS", "true")?,
            },
            websocket: WebSocketConfig {
                outbound_queue_capacity: parse_var(
                    "WS_OUTBOUND_QUEUE_CAPACITY",
                    &defaults_ws.outbound_queue_capacity.to_string(),
                )?,
                write_wait_secs: parse_var(
                    "WS_WRITE_WAIT_SECS",
                    &defaults_ws.write_wait_secs.to_string(),
                )?,
                pong_wait_secs: parse_var(
                    "WS_PONG_WAIT_SECS",
                    &defaults_ws.pong_wait_secs.to_string(),
                )?,
                max_message_size: parse_var(
                    "WS_MAX_MESSAGE_SIZE",
                    &defaults_ws.max_message_size.to_string(),
                )?,
            },
            notifier: NotifierConfig {
                queue_capacity: parse_var("NOTIFIER_QUEUE_CAPACITY", "100")?,
            },
            watcher: WatcherConfig {
                terminal_status: var_or("ORDER_TERMINAL_STATUS", &defaults_watcher.terminal_status),
                snapshot_retention_secs: parse_var(
                    "SNAPSHOT_RETENTION_SECS",
                    &defaults_watcher.snapshot_retention_secs.to_string(),
                )?,
                write_max_retries: parse_var(
                    "NOTIFIED_WRITE_MAX_RETRIES",
                    &defaults_watcher.write_max_retries.to_string(),
                )?,
                write_backoff_ms: parse_var(
                    "NOTIFIED_WRITE_BACKOFF_MS",
                    &defaults_watcher.write_backoff_ms.to_string(),
                )?,
                write_max_backoff_ms: parse_var(
                    "NOTIFIED_WRITE_MAX_BACKOFF_MS",
                    &defaults_watcher.write_max_backoff_ms.to_string(),
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.websocket.outbound_queue_capacity == 0 {
            return Err(AppError::Config(
                "WS_OUTBOUND_QUEUE_CAPACITY must be greater than zero".to_string(),
            ));
        }
        if self.notifier.queue_capacity == 0 {
            return Err(AppError::Config(
                "NOTIFIER_QUEUE_CAPACITY must be greater than zero".to_string(),
            ));
        }
        if self.websocket.pong_wait_secs == 0 {
            return Err(AppError::Config(
                "WS_PONG_WAIT_SECS must be greater than zero".to_string(),
            ));
        }
        if self.watcher.terminal_status.trim().is_empty() {
            return Err(AppError::Config(
                "ORDER_TERMINAL_STATUS must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_period_below_pong_wait() {
        let ws = WebSocketConfig::default();
        assert_eq!(ws.pong_wait(), Duration::from_secs(60));
        assert_eq!(ws.ping_period(), Duration::from_secs(54));
        assert!(ws.ping_period() < ws.pong_wait());
    }

    #[test]
    fn test_store_backend_parsing() {
        assert_eq!("postgres".parse::<StoreBackend>(), Ok(StoreBackend::Postgres));
        assert_eq!(" Memory ".parse::<StoreBackend>(), Ok(StoreBackend::Memory));
        assert!("mongo".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_defaults_match_engine_limits() {
        assert_eq!(WebSocketConfig::default().outbound_queue_capacity, 256);
        assert_eq!(WebSocketConfig::default().max_message_size, 512);
        assert_eq!(NotifierConfig::default().queue_capacity, 100);
        assert_eq!(WatcherConfig::default().terminal_status, "fulfilled");
    }
}
