//! Configuration management
//!
//! [`Config::load`] reads the environment once at start-up; the resulting struct
//! is handed to every component that needs it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::config::StorageConfig;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/catalog";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default CORS allowed origin for local development.
pub const DEFAULT_CORS_ALLOWED_ORIGIN: &str = "http://localhost:3000";

// ============================================================================
// Import Configuration Constants
// ============================================================================

/// Rows committed per upsert transaction.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Directory where direct uploads are staged before import.
pub const DEFAULT_UPLOAD_DIR: &str = "./uploads";

/// Largest accepted direct upload (100 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Interval between worker heartbeats while a job is processing.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// A processing job without a heartbeat for this long is considered abandoned.
pub const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 120;

/// Upper bound on a single progress publish.
pub const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 500;

/// Bounded wait of the live-progress gateway between channel polls.
pub const DEFAULT_STREAM_POLL_INTERVAL_MS: u64 = 1000;

/// Number of import workers per process.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 2;

/// Per-request webhook timeout.
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 5;

/// Concurrent webhook deliveries per event.
pub const DEFAULT_WEBHOOK_MAX_CONCURRENCY: usize = 8;

/// Postgres accepts at most this many bind parameters per statement.
pub const POSTGRES_MAX_BIND_PARAMS: usize = 65_535;

/// Bind parameters used by one row of the bulk upsert.
pub const UPSERT_BINDS_PER_ROW: usize = 4;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cors: CorsConfig,
    pub import: ImportConfig,
    pub webhooks: WebhookConfig,
    /// Remote object storage; direct uploads still work without it
    pub storage: Option<StorageConfig>,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

/// Which queue carries import tasks to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Durable Postgres-backed apalis queue consumed by `worker` processes
    #[default]
    Apalis,
    /// In-process tasks spawned by the server itself
    Local,
}

impl std::str::FromStr for QueueBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "apalis" | "postgres" => Ok(QueueBackend::Apalis),
            "local" | "inline" => Ok(QueueBackend::Local),
            _ => Err(anyhow::anyhow!("Invalid queue backend: {}", s)),
        }
    }
}

/// Bulk import configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    pub batch_size: usize,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub heartbeat_interval_secs: u64,
    pub lease_timeout_secs: u64,
    pub publish_timeout_ms: u64,
    pub stream_poll_interval_ms: u64,
    pub worker_concurrency: usize,
    pub queue: QueueBackend,
}

impl ImportConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn stream_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stream_poll_interval_ms)
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            lease_timeout_secs: DEFAULT_LEASE_TIMEOUT_SECS,
            publish_timeout_ms: DEFAULT_PUBLISH_TIMEOUT_MS,
            stream_poll_interval_ms: DEFAULT_STREAM_POLL_INTERVAL_MS,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            queue: QueueBackend::default(),
        }
    }
}

/// Outbound webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub timeout_secs: u64,
    pub max_concurrency: usize,
}

impl WebhookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_WEBHOOK_TIMEOUT_SECS,
            max_concurrency: DEFAULT_WEBHOOK_MAX_CONCURRENCY,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let queue = match std::env::var("IMPORT_QUEUE") {
            Ok(value) => value.parse()?,
            Err(_) => QueueBackend::default(),
        };

        let storage = if std::env::var("S3_BUCKET").is_ok() {
            Some(StorageConfig::from_env()?)
        } else {
            None
        };

        let config = Config {
            server: ServerConfig {
                host: std::env::var("CATALOG_HOST")
                    .unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
                port: env_or("CATALOG_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: env_or(
                    "CATALOG_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                ),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
            },
            cors: CorsConfig {
                allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| DEFAULT_CORS_ALLOWED_ORIGIN.to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                allow_credentials: env_or("CORS_ALLOW_CREDENTIALS", true),
            },
            import: ImportConfig {
                batch_size: env_or("IMPORT_BATCH_SIZE", DEFAULT_BATCH_SIZE),
                upload_dir: std::env::var("IMPORT_UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_UPLOAD_DIR)),
                max_upload_bytes: env_or("IMPORT_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
                heartbeat_interval_secs: env_or(
                    "IMPORT_HEARTBEAT_INTERVAL",
                    DEFAULT_HEARTBEAT_INTERVAL_SECS,
                ),
                lease_timeout_secs: env_or("IMPORT_LEASE_TIMEOUT", DEFAULT_LEASE_TIMEOUT_SECS),
                publish_timeout_ms: env_or("IMPORT_PUBLISH_TIMEOUT_MS", DEFAULT_PUBLISH_TIMEOUT_MS),
                stream_poll_interval_ms: env_or(
                    "IMPORT_STREAM_POLL_MS",
                    DEFAULT_STREAM_POLL_INTERVAL_MS,
                ),
                worker_concurrency: env_or("IMPORT_WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY),
                queue,
            },
            webhooks: WebhookConfig {
                timeout_secs: env_or("WEBHOOK_TIMEOUT", DEFAULT_WEBHOOK_TIMEOUT_SECS),
                max_concurrency: env_or("WEBHOOK_MAX_CONCURRENCY", DEFAULT_WEBHOOK_MAX_CONCURRENCY),
            },
            storage,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.import.batch_size == 0 {
            anyhow::bail!("Import batch_size must be greater than 0");
        }

        if self.import.batch_size * UPSERT_BINDS_PER_ROW > POSTGRES_MAX_BIND_PARAMS {
            anyhow::bail!(
                "Import batch_size ({}) exceeds the statement parameter limit (max {} rows)",
                self.import.batch_size,
                POSTGRES_MAX_BIND_PARAMS / UPSERT_BINDS_PER_ROW
            );
        }

        if self.import.worker_concurrency == 0 {
            anyhow::bail!("Import worker_concurrency must be greater than 0");
        }

        if self.import.heartbeat_interval_secs == 0 {
            anyhow::bail!("Import heartbeat interval must be greater than 0");
        }

        if self.import.lease_timeout_secs <= self.import.heartbeat_interval_secs {
            anyhow::bail!(
                "Import lease timeout ({}s) must exceed the heartbeat interval ({}s)",
                self.import.lease_timeout_secs,
                self.import.heartbeat_interval_secs
            );
        }

        if self.webhooks.max_concurrency == 0 {
            anyhow::bail!("Webhook max_concurrency must be greater than 0");
        }

        if self.cors.allowed_origins.is_empty() {
            tracing::warn!("No CORS origins configured - all origins will be allowed");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            cors: CorsConfig {
                allowed_origins: vec![DEFAULT_CORS_ALLOWED_ORIGIN.to_string()],
                allow_credentials: true,
            },
            import: ImportConfig::default(),
            webhooks: WebhookConfig::default(),
            storage: None,
        }
    }
}
