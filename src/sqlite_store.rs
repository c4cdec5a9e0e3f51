//! SQLite-backed [`VectorStore`] implementation.
//!
//! Each mutation runs in one transaction, so a concurrent query sees
//! either the complete old chunk set of a source or the complete new one.
//! Similarity search is a brute-force cosine scan over the stored blobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use research_copilot_core::embedding::{blob_to_vec, vec_to_blob};
use research_copilot_core::error::{CopilotError, Result};
use research_copilot_core::models::{Chunk, ContentType, Document, EvidenceItem, SourceSummary};
use research_copilot_core::store::{rank_by_similarity, validate_chunks, QueryFilter, VectorStore};

use crate::config::Config;
use crate::{db, migrate};

/// SQLite implementation of the [`VectorStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and bring the schema up to date.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The stored document row for `source`, if any.
    pub async fn document(&self, source: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT source, content_type, content, ingested_at, content_hash FROM documents WHERE source = ?",
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| {
            let kind: String = row.get("content_type");
            let content_type = ContentType::parse(&kind).ok_or_else(|| {
                CopilotError::Store(format!("unknown content type '{}' for '{}'", kind, source))
            })?;
            let ts: i64 = row.get("ingested_at");
            Ok(Document {
                source: row.get("source"),
                content_type,
                content: row.get("content"),
                ingested_at: DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_default(),
                content_hash: row.get("content_hash"),
            })
        })
        .transpose()
    }
}

fn db_err(err: sqlx::Error) -> CopilotError {
    CopilotError::Store(err.to_string())
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    let index: i64 = row.get("chunk_index");
    let start: i64 = row.get("start_offset");
    let end: i64 = row.get("end_offset");
    let overlap: i64 = row.get("overlap");
    let page: Option<i64> = row.get("page");
    let blob: Vec<u8> = row.get("embedding");
    Chunk {
        id: row.get("id"),
        source: row.get("source"),
        index: index as usize,
        text: row.get("text"),
        start: start as usize,
        end: end as usize,
        overlap: overlap as usize,
        page: page.map(|p| p as u32),
        hash: row.get("hash"),
        embedding: blob_to_vec(&blob),
    }
}

const CHUNK_COLUMNS: &str =
    "source, chunk_index, id, text, start_offset, end_offset, overlap, page, hash, embedding";

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert(&self, document: &Document, chunks: &[Chunk]) -> Result<usize> {
        validate_chunks(document, chunks)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("DELETE FROM chunks WHERE source = ?")
            .bind(&document.source)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO documents (source, content_type, content, ingested_at, content_hash)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                content_type = excluded.content_type,
                content = excluded.content,
                ingested_at = excluded.ingested_at,
                content_hash = excluded.content_hash
            "#,
        )
        .bind(&document.source)
        .bind(document.content_type.as_str())
        .bind(&document.content)
        .bind(document.ingested_at.timestamp())
        .bind(&document.content_hash)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (source, chunk_index, id, text, start_offset, end_offset,
                                    overlap, page, hash, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.source)
            .bind(chunk.index as i64)
            .bind(&chunk.id)
            .bind(&chunk.text)
            .bind(chunk.start as i64)
            .bind(chunk.end as i64)
            .bind(chunk.overlap as i64)
            .bind(chunk.page.map(i64::from))
            .bind(&chunk.hash)
            .bind(vec_to_blob(&chunk.embedding))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(chunks.len())
    }

    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<EvidenceItem>> {
        let rows = sqlx::query(&format!("SELECT {} FROM chunks", CHUNK_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let candidates: Vec<Chunk> = rows
            .iter()
            .map(row_to_chunk)
            .filter(|c| filter.matches(&c.source))
            .collect();

        Ok(rank_by_similarity(embedding, candidates.iter(), k))
    }

    async fn delete(&self, source: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE source = ?")
            .bind(source)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        if !exists {
            return Err(CopilotError::NotFound {
                source_name: source.to_string(),
            });
        }

        let removed = sqlx::query("DELETE FROM chunks WHERE source = ?")
            .bind(source)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        sqlx::query("DELETE FROM documents WHERE source = ?")
            .bind(source)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(removed as usize)
    }

    async fn reset(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("DELETE FROM chunks")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let removed = sqlx::query("DELETE FROM documents")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        tx.commit().await.map_err(db_err)?;
        Ok(removed as usize)
    }

    async fn list_sources(&self) -> Result<Vec<SourceSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT d.source AS source, COUNT(c.chunk_index) AS chunk_count
            FROM documents d
            LEFT JOIN chunks c ON c.source = d.source
            GROUP BY d.source
            ORDER BY d.source
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| {
                let count: i64 = row.get("chunk_count");
                SourceSummary {
                    source: row.get("source"),
                    chunk_count: count as usize,
                }
            })
            .collect())
    }

    async fn chunks_for(&self, source: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE source = ? ORDER BY chunk_index",
            CHUNK_COLUMNS
        ))
        .bind(source)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(row_to_chunk).collect())
    }
}
