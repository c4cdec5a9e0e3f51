//! Schema for the durable vector store.
//!
//! Every statement is idempotent, so migrations run on each open.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::debug;

use crate::config::Config;
use crate::db;

/// Create the database file and schema (`copilot init`).
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per ingested source
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            source TEXT PRIMARY KEY,
            content_type TEXT NOT NULL,
            content TEXT NOT NULL,
            ingested_at INTEGER NOT NULL,
            content_hash TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Chunks are keyed by (source, chunk_index); embeddings are LE f32 blobs
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            source TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            id TEXT NOT NULL,
            text TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            overlap INTEGER NOT NULL,
            page INTEGER,
            hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (source, chunk_index),
            FOREIGN KEY (source) REFERENCES documents(source) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_id ON chunks(id)")
        .execute(pool)
        .await?;

    debug!("schema up to date");
    Ok(())
}
