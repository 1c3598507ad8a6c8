//! Repository pattern for database operations
//!
//! Provides a clean interface for all data access operations with proper
//! error handling and transaction support. Each entity gets its own
//! `impl Repository` block in a sibling module.

mod chats;
mod checkpoints;
mod items;
mod storages;

pub use chats::{ChatSummary, LastMessage};
pub use items::StatusCounts;

use crate::db::DbPool;
use crate::errors::Result;
use sea_orm::DatabaseConnection;

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Repository;
    use crate::db::models::Storage;
    use crate::db::DbPool;

    pub async fn repository() -> Repository {
        Repository::new(DbPool::in_memory().await.unwrap())
    }

    /// Reads go to a replica that never receives any writes
    pub async fn lagging_repository() -> Repository {
        let primary = DbPool::in_memory().await.unwrap().primary;
        let replica = DbPool::in_memory().await.unwrap().primary;
        Repository::new(DbPool {
            primary,
            replica: Some(replica),
        })
    }

    pub async fn storage(repo: &Repository, name: &str) -> Storage {
        repo.create_storage(name.to_string(), None, format!("{}_test", name))
            .await
            .unwrap()
    }
}
