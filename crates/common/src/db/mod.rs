//! Database layer for Cevra
//!
//! Provides:
//! - SeaORM entity models
//! - Repository pattern for data access (one impl block per entity)
//! - Connection pool management
//! - Schema bootstrap from the entity definitions

pub mod models;
mod repository;

pub use repository::{ChatSummary, LastMessage, Repository, StatusCounts};

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use models::*;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Schema};
use std::time::Duration;
use tracing::info;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    /// Primary connection (for writes)
    pub primary: DatabaseConnection,

    /// Read replica connection (optional)
    pub replica: Option<DatabaseConnection>,
}

impl DbPool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to primary database...");

        let primary = Database::connect(connect_options(&config.url, config))
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to connect to primary: {}", e),
            })?;

        // Connect to replica if configured
        let replica = if let Some(ref read_url) = config.read_url {
            info!("Connecting to read replica...");

            let replica_conn = Database::connect(connect_options(read_url, config))
                .await
                .map_err(|e| AppError::DatabaseConnection {
                    message: format!("Failed to connect to replica: {}", e),
                })?;

            Some(replica_conn)
        } else {
            None
        };

        info!("Database connections established");

        Ok(Self { primary, replica })
    }

    /// Private SQLite database living as long as the pool, with the schema
    /// already in place.
    pub async fn in_memory() -> Result<Self> {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        };
        let pool = Self::new(&config).await?;
        pool.ensure_schema().await?;
        Ok(pool)
    }

    /// Get the connection for reads (replica if available, otherwise primary)
    pub fn read(&self) -> &DatabaseConnection {
        self.replica.as_ref().unwrap_or(&self.primary)
    }

    /// Get the connection for writes (always primary)
    pub fn write(&self) -> &DatabaseConnection {
        &self.primary
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        self.primary
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Primary ping failed: {}", e),
            })?;

        if let Some(ref replica) = self.replica {
            replica
                .execute_unprepared("SELECT 1")
                .await
                .map_err(|e| AppError::DatabaseConnection {
                    message: format!("Replica ping failed: {}", e),
                })?;
        }

        Ok(())
    }

    /// Create the tables and lookup indexes described by the entities when
    /// they do not exist yet. Parents are created before children.
    pub async fn ensure_schema(&self) -> Result<()> {
        let conn = self.write();
        let backend = conn.get_database_backend();
        let schema = Schema::new(backend);

        let mut tables = vec![
            schema.create_table_from_entity(StorageEntity),
            schema.create_table_from_entity(ItemEntity),
            schema.create_table_from_entity(ChatEntity),
            schema.create_table_from_entity(ChatMessageEntity),
            schema.create_table_from_entity(CheckpointEntity),
        ];
        for table in tables.iter_mut() {
            table.if_not_exists();
            conn.execute(backend.build(&*table)).await?;
        }

        let indexes = schema
            .create_index_from_entity(ItemEntity)
            .into_iter()
            .chain(schema.create_index_from_entity(ChatEntity))
            .chain(schema.create_index_from_entity(ChatMessageEntity));
        for mut index in indexes {
            index.if_not_exists();
            conn.execute(backend.build(&index)).await?;
        }

        info!(tables = tables.len(), "Database schema ensured");
        Ok(())
    }
}

fn connect_options(url: &str, config: &DatabaseConfig) -> ConnectOptions {
    let mut opts = ConnectOptions::new(url);

    // Every pooled connection to an in-memory SQLite URL would open its own
    // empty database, so those pools are pinned to a single connection.
    if is_in_memory_sqlite(url) {
        opts.max_connections(1).min_connections(1);
    } else {
        opts.max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs));
    }

    opts.connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .sqlx_logging(false);
    opts
}

fn is_in_memory_sqlite(url: &str) -> bool {
    url.starts_with("sqlite") && (url.contains(":memory:") || url.contains("mode=memory"))
}
