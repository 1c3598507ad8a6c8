//! pgvector backend
//!
//! All collections share one `vector_chunks` table partitioned by the
//! `collection` column; `vector_collections` records which collections
//! exist. Queries run through sqlx on the sea-orm Postgres pool.

use super::{
    sort_by_score, ChunkDocument, ChunkMetadata, MetadataFilter, ScoredChunk, VectorCollection,
    VectorStore,
};
use crate::db::DbPool;
use crate::embeddings::Embedder;
use crate::errors::{AppError, Result};
use ::pgvector::Vector;
use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DbBackend};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Vector store backed by PostgreSQL with the pgvector extension
pub struct PgVectorStore {
    pool: PgPool,
    embedder: Arc<dyn Embedder>,
}

impl PgVectorStore {
    pub fn new(pool: PgPool, embedder: Arc<dyn Embedder>) -> Self {
        Self { pool, embedder }
    }

    /// Share the primary connection pool of the relational store
    pub fn from_pool(db: &DbPool, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let conn = db.write();
        if conn.get_database_backend() != DbBackend::Postgres {
            return Err(AppError::Configuration {
                message: "the pgvector backend needs a PostgreSQL database".to_string(),
            });
        }

        Ok(Self::new(
            conn.get_postgres_connection_pool().clone(),
            embedder,
        ))
    }

    /// Create the extension, tables and indexes when missing
    pub async fn initialize(&self) -> Result<()> {
        let dimension = self.embedder.dimension();

        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vector_collections (
                name TEXT PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // The dimension is fixed when the table is first created
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS vector_chunks (
                id UUID PRIMARY KEY,
                collection TEXT NOT NULL REFERENCES vector_collections(name) ON DELETE CASCADE,
                content TEXT NOT NULL,
                source TEXT NOT NULL,
                page INT4 NOT NULL,
                storage_id UUID NOT NULL,
                file_id UUID NOT NULL,
                chunk_index INT4 NOT NULL,
                embedding vector({dimension}) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_vector_chunks_owner \
             ON vector_chunks (collection, storage_id, file_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_vector_chunks_embedding \
             ON vector_chunks USING hnsw (embedding vector_cosine_ops)",
        )
        .execute(&self.pool)
        .await?;

        info!(dimension, "pgvector schema ready");
        Ok(())
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn create_collection(&self, name: &str) -> Result<()> {
        sqlx::query("INSERT INTO vector_collections (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM vector_collections WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        collection_exists(&self.pool, name).await
    }

    fn collection(&self, name: &str) -> Arc<dyn VectorCollection> {
        Arc::new(PgCollection {
            name: name.to_string(),
            pool: self.pool.clone(),
            embedder: self.embedder.clone(),
        })
    }

    fn backend_name(&self) -> &'static str {
        "pgvector"
    }
}

async fn collection_exists<'e, E>(executor: E, name: &str) -> Result<bool>
where
    E: sqlx::PgExecutor<'e>,
{
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM vector_collections WHERE name = $1)")
            .bind(name)
            .fetch_one(executor)
            .await?;
    Ok(exists)
}

struct PgCollection {
    name: String,
    pool: PgPool,
    embedder: Arc<dyn Embedder>,
}

impl PgCollection {
    fn missing(&self) -> AppError {
        AppError::CollectionNotFound {
            name: self.name.clone(),
        }
    }
}

#[async_trait]
impl VectorCollection for PgCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, documents: &[ChunkDocument]) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        if embeddings.len() != documents.len() {
            return Err(AppError::EmbeddingError {
                message: format!(
                    "expected {} embeddings, received {}",
                    documents.len(),
                    embeddings.len()
                ),
            });
        }

        let mut tx = self.pool.begin().await?;
        if !collection_exists(&mut *tx, &self.name).await? {
            return Err(self.missing());
        }

        for (document, embedding) in documents.iter().zip(embeddings) {
            let metadata = &document.metadata;
            sqlx::query(
                r#"
                INSERT INTO vector_chunks
                    (id, collection, content, source, page, storage_id, file_id, chunk_index, embedding)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&self.name)
            .bind(&document.text)
            .bind(&metadata.source)
            .bind(metadata.page as i32)
            .bind(metadata.storage_id)
            .bind(metadata.file_id)
            .bind(metadata.chunk_index as i32)
            .bind(Vector::from(embedding))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(collection = %self.name, count = documents.len(), "Chunks upserted");
        Ok(documents.len())
    }

    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        if !collection_exists(&self.pool, &self.name).await? {
            return Err(self.missing());
        }

        let embedding = Vector::from(self.embedder.embed(query).await?);
        let rows = sqlx::query(
            r#"
            SELECT content, source, page, storage_id, file_id, chunk_index,
                   (1 - (embedding <=> $2))::float4 AS score
            FROM vector_chunks
            WHERE collection = $1
            ORDER BY embedding <=> $2
            LIMIT $3
            "#,
        )
        .bind(&self.name)
        .bind(embedding)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = rows
            .into_iter()
            .map(|row| {
                Ok(ScoredChunk {
                    text: row.try_get("content")?,
                    metadata: ChunkMetadata {
                        source: row.try_get("source")?,
                        page: row.try_get::<i32, _>("page")?.max(0) as u32,
                        storage_id: row.try_get("storage_id")?,
                        file_id: row.try_get("file_id")?,
                        chunk_index: row.try_get::<i32, _>("chunk_index")?.max(0) as u32,
                    },
                    score: row.try_get("score")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

        // The HNSW scan is approximate, keep the contract exact
        sort_by_score(&mut hits);
        Ok(hits)
    }

    async fn delete_by_filter(&self, filter: &MetadataFilter) -> Result<u64> {
        filter.ensure_not_empty()?;
        if !collection_exists(&self.pool, &self.name).await? {
            return Err(self.missing());
        }

        let result = sqlx::query(
            r#"
            DELETE FROM vector_chunks
            WHERE collection = $1
              AND ($2::uuid IS NULL OR storage_id = $2)
              AND ($3::uuid IS NULL OR file_id = $3)
            "#,
        )
        .bind(&self.name)
        .bind(filter.storage_id)
        .bind(filter.file_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
