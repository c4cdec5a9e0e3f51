//! Vector store abstraction.
//!
//! The [`VectorStore`] trait is the only durable state the pipeline
//! needs: chunks keyed by `(source, index)` together with their
//! embeddings. Backends are passed explicitly to every operation; there
//! is no ambient "current collection".
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert`](VectorStore::upsert) | Atomically replace all chunks for a source |
//! | [`query`](VectorStore::query) | Top-k cosine similarity search |
//! | [`delete`](VectorStore::delete) | Remove one source, `NotFound` if absent |
//! | [`reset`](VectorStore::reset) | Remove everything |
//! | [`list_sources`](VectorStore::list_sources) | Source names with chunk counts |
//! | [`chunks_for`](VectorStore::chunks_for) | Ordered chunks of one source |
//!
//! Implementations must be `Send + Sync`. Per-source write serialization
//! and reset exclusivity are layered on top by [`GuardedStore`].

pub mod guarded;
pub mod memory;

pub use guarded::{GuardedStore, ResetPolicy, SourceLease, SourceLeases};
pub use memory::InMemoryStore;

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embedding::cosine_similarity;
use crate::error::{CopilotError, Result};
use crate::models::{Chunk, Document, EvidenceItem, SourceSummary};

/// Optional restrictions on a similarity query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Only return chunks from these sources.
    pub sources: Option<Vec<String>>,
}

impl QueryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, source: &str) -> bool {
        match &self.sources {
            Some(list) => list.iter().any(|s| s == source),
            None => true,
        }
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Replace every chunk stored for `document.source` with `chunks`.
    ///
    /// Concurrent queries observe either the full old set or the full new
    /// set, never a mix. Returns the number of chunks stored.
    async fn upsert(&self, document: &Document, chunks: &[Chunk]) -> Result<usize>;

    /// Best-first evidence for `embedding`. `k` is clamped to the number of
    /// candidate chunks; fewer than `k` results is not an error.
    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<EvidenceItem>>;

    /// Remove a source and all of its chunks. Returns the chunk count removed.
    async fn delete(&self, source: &str) -> Result<usize>;

    /// Remove every source. Returns the number of sources removed.
    async fn reset(&self) -> Result<usize>;

    /// Stored sources with chunk counts, ordered by source name.
    async fn list_sources(&self) -> Result<Vec<SourceSummary>>;

    /// Chunks of one source in index order (empty if the source is absent).
    async fn chunks_for(&self, source: &str) -> Result<Vec<Chunk>>;
}

/// Reject chunk sets that would break the per-document invariants:
/// every chunk belongs to `document` and indices run `0..n` in order.
pub fn validate_chunks(document: &Document, chunks: &[Chunk]) -> Result<()> {
    if document.source.trim().is_empty() {
        return Err(CopilotError::InvalidInput("source name is empty".into()));
    }
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.source != document.source {
            return Err(CopilotError::InvalidInput(format!(
                "chunk {} belongs to '{}', not '{}'",
                chunk.id, chunk.source, document.source
            )));
        }
        if chunk.index != i {
            return Err(CopilotError::InvalidInput(format!(
                "chunk indices for '{}' are not contiguous: expected {}, got {}",
                document.source, i, chunk.index
            )));
        }
        if chunk.text.is_empty() {
            return Err(CopilotError::InvalidInput(format!(
                "chunk {} of '{}' is empty",
                i, document.source
            )));
        }
    }
    Ok(())
}

/// Score `candidates` against `embedding` and keep the best `k`.
///
/// Ordering is score descending, then lower chunk index, then source name,
/// so equal inputs always rank identically. Ranks are 1-based.
pub fn rank_by_similarity<'a, I>(embedding: &[f32], candidates: I, k: usize) -> Vec<EvidenceItem>
where
    I: IntoIterator<Item = &'a Chunk>,
{
    let mut scored: Vec<(f32, &Chunk)> = candidates
        .into_iter()
        .map(|c| (cosine_similarity(embedding, &c.embedding), c))
        .collect();

    scored.sort_by(|(sa, a), (sb, b)| {
        sb.partial_cmp(sa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.index.cmp(&b.index))
            .then_with(|| a.source.cmp(&b.source))
    });
    scored.truncate(k);

    scored
        .into_iter()
        .enumerate()
        .map(|(i, (score, chunk))| EvidenceItem {
            chunk: chunk.clone(),
            score,
            rank: i + 1,
        })
        .collect()
}
