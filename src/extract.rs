//! PDF text extraction.
//!
//! Produces one [`Page`] per PDF page, numbered from 1, so chunks can carry
//! the page they start on. Pages with no extractable text come back empty;
//! the chunker skips them.

use research_copilot_core::models::Page;

/// Extraction error. Malformed input never panics the caller.
#[derive(Debug)]
pub enum ExtractError {
    Pdf(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extract text page by page from an in-memory PDF.
pub fn extract_pdf_pages(bytes: &[u8]) -> Result<Vec<Page>, ExtractError> {
    if !bytes.starts_with(b"%PDF") {
        return Err(ExtractError::Pdf("missing %PDF header".to_string()));
    }

    // pdf-extract panics on some malformed fonts and streams.
    let pages = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes))
        .map_err(|_| ExtractError::Pdf("parser panicked on malformed input".to_string()))?
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;

    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(i, text)| Page {
            number: i as u32 + 1,
            text,
        })
        .collect())
}
