//! Wiring: config → SQLite store + embedder + model → [`Copilot`].

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use research_copilot_core::models::ContentType;
use research_copilot_core::{Copilot, CopilotError, IngestReport};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::extract::extract_pdf_pages;
use crate::llm::create_model;
use crate::sqlite_store::SqliteStore;

/// Build the engine described by `config`, opening (and migrating) the
/// SQLite database.
pub async fn build_copilot(config: &Config) -> Result<Copilot> {
    let store = SqliteStore::open(config).await?;
    let embedder = create_embedder(&config.embedding)?;
    let model = create_model(&config.llm)?;

    info!(
        db = %config.db.path.display(),
        embedder = embedder.model_name(),
        model = model.model_name(),
        "copilot ready"
    );

    Ok(Copilot::new(
        Arc::new(store),
        embedder,
        model,
        config.engine_config(),
    )?)
}

/// Extract a PDF off the async runtime and ingest its pages under `source`.
pub async fn ingest_pdf(
    copilot: &Copilot,
    bytes: Vec<u8>,
    source: &str,
) -> research_copilot_core::Result<IngestReport> {
    let pages = tokio::task::spawn_blocking(move || extract_pdf_pages(&bytes))
        .await
        .map_err(|e| CopilotError::InvalidInput(format!("{}: extraction task failed: {}", source, e)))?
        .map_err(|e| CopilotError::InvalidInput(format!("{}: {}", source, e)))?;

    copilot.ingest_pages(source, ContentType::Pdf, pages).await
}
