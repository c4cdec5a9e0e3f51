//! Core data models that flow through ingestion and retrieval.
//!
//! A [`Document`] is identified by its source name. Its [`Chunk`]s are
//! identified by `(source, index)` and have no existence outside the
//! vector store. [`EvidenceItem`]s are per-query and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of content a document was ingested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Pdf,
    Text,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Pdf => "pdf",
            ContentType::Text => "text",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(ContentType::Pdf),
            "text" => Some(ContentType::Text),
            _ => None,
        }
    }
}

/// An ingested document. The source name is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub source: String,
    pub content_type: ContentType,
    /// The normalized text the chunks were cut from.
    pub content: String,
    pub ingested_at: DateTime<Utc>,
    /// SHA-256 of `content`.
    pub content_hash: String,
}

impl Document {
    pub fn new(source: &str, content_type: ContentType, content: String) -> Self {
        let content_hash = sha256_hex(content.as_bytes());
        Self {
            source: source.to_string(),
            content_type,
            content,
            ingested_at: Utc::now(),
            content_hash,
        }
    }
}

/// One extraction unit. Plain text is a single page numbered 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub number: u32,
    pub text: String,
}

/// A chunk before it has been embedded.
///
/// Offsets are character (not byte) offsets into the document content;
/// `end` is exclusive. `overlap` is the number of leading characters shared
/// with the previous chunk (0 for the first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDraft {
    pub index: usize,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub overlap: usize,
    pub page: Option<u32>,
    pub hash: String,
}

/// A stored chunk: draft metadata plus its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub source: String,
    pub index: usize,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub overlap: usize,
    pub page: Option<u32>,
    pub hash: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

impl Chunk {
    /// Attach an embedding to a draft. The id is a digest of
    /// `(source, index, text)` so re-ingesting identical content yields
    /// identical ids.
    pub fn from_draft(source: &str, draft: ChunkDraft, embedding: Vec<f32>) -> Self {
        let id = chunk_id(source, draft.index, &draft.text);
        Self {
            id,
            source: source.to_string(),
            index: draft.index,
            text: draft.text,
            start: draft.start,
            end: draft.end,
            overlap: draft.overlap,
            page: draft.page,
            hash: draft.hash,
            embedding,
        }
    }

    pub fn char_len(&self) -> usize {
        self.end - self.start
    }
}

/// A chunk ranked against a specific query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub chunk: Chunk,
    /// Cosine similarity to the query embedding.
    pub score: f32,
    /// 1-based rank; doubles as the citation identifier in prompts.
    pub rank: usize,
}

impl EvidenceItem {
    /// Short preview for display, cut on a char boundary.
    pub fn preview(&self, max_chars: usize) -> String {
        let mut out: String = self.chunk.text.chars().take(max_chars).collect();
        if self.chunk.text.chars().count() > max_chars {
            out.push_str("...");
        }
        out
    }
}

/// Per-source entry returned by `list_sources`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub source: String,
    pub chunk_count: usize,
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn chunk_id(source: &str, index: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update((index as u64).to_le_bytes());
    hasher.update(text.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}
