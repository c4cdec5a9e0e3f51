//! `copilot documents list|show|delete|reset`.

use anyhow::Result;

use crate::app::build_copilot;
use crate::config::Config;

pub async fn run_list(config: &Config) -> Result<()> {
    let copilot = build_copilot(config).await?;
    let documents = copilot.list_documents().await?;

    if documents.is_empty() {
        println!("No documents.");
        return Ok(());
    }

    for doc in &documents {
        println!("{}  ({} chunks)", doc.source, doc.chunk_count);
    }
    Ok(())
}

pub async fn run_show(config: &Config, source: &str) -> Result<()> {
    let copilot = build_copilot(config).await?;
    let chunks = copilot.document_chunks(source).await?;

    if chunks.is_empty() {
        anyhow::bail!("source not found: {}", source);
    }

    println!("--- {} ({} chunks) ---", source, chunks.len());
    for chunk in &chunks {
        match chunk.page {
            Some(page) => println!("[chunk {} | page {} | {}..{}]", chunk.index, page, chunk.start, chunk.end),
            None => println!("[chunk {} | {}..{}]", chunk.index, chunk.start, chunk.end),
        }
        println!("{}", chunk.text);
        println!();
    }
    Ok(())
}

pub async fn run_delete(config: &Config, source: &str) -> Result<()> {
    let copilot = build_copilot(config).await?;
    let removed = copilot.delete_document(source).await?;
    println!("Deleted '{}' ({} chunks).", source, removed);
    Ok(())
}

pub async fn run_reset(config: &Config) -> Result<()> {
    let copilot = build_copilot(config).await?;
    let removed = copilot.reset_documents().await?;
    println!("Removed {} documents.", removed);
    Ok(())
}
