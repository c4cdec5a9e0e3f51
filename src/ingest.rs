//! `copilot ingest pdf|text`: read a file, ingest it, report chunk counts.

use anyhow::{Context, Result};
use std::path::Path;

use research_copilot_core::IngestReport;

use crate::app::{build_copilot, ingest_pdf};
use crate::config::Config;

/// Source name for a file when `--source` is not given: its file name.
fn default_source(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub async fn run_ingest_pdf(config: &Config, path: &Path, source: Option<String>) -> Result<()> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let source = source.unwrap_or_else(|| default_source(path));

    let copilot = build_copilot(config).await?;
    let report = ingest_pdf(&copilot, bytes, &source).await?;
    print_report(&report);
    Ok(())
}

pub async fn run_ingest_text(config: &Config, path: &Path, source: Option<String>) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let source = source.unwrap_or_else(|| default_source(path));

    let copilot = build_copilot(config).await?;
    let report = copilot.ingest_text(&text, Some(&source)).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &IngestReport) {
    println!("Ingested '{}' ({})", report.source, report.content_type.as_str());
    println!("  chunks: {}", report.chunks);
    println!("  content_hash: {}", report.content_hash);
}
