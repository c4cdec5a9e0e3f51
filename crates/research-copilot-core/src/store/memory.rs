//! In-memory [`VectorStore`] for tests and ephemeral sessions.
//!
//! Each source maps to an immutable `Arc<Vec<Chunk>>` behind a
//! `std::sync::RwLock`. An upsert builds the replacement set first and then
//! swaps it in under the write lock, so readers see all-old or all-new.
//! Query is brute-force cosine similarity over every stored vector.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{CopilotError, Result};
use crate::models::{Chunk, Document, EvidenceItem, SourceSummary};

use super::{rank_by_similarity, validate_chunks, QueryFilter, VectorStore};

struct Entry {
    _document: Document,
    chunks: Arc<Vec<Chunk>>,
}

/// In-memory store. Contents are lost when it is dropped.
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Entry>>> {
        self.entries.read().map_err(CopilotError::store)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Entry>>> {
        self.entries.write().map_err(CopilotError::store)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn upsert(&self, document: &Document, chunks: &[Chunk]) -> Result<usize> {
        validate_chunks(document, chunks)?;
        let entry = Entry {
            _document: document.clone(),
            chunks: Arc::new(chunks.to_vec()),
        };
        self.write()?.insert(document.source.clone(), entry);
        Ok(chunks.len())
    }

    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<EvidenceItem>> {
        // Snapshot the per-source sets so scoring runs without the lock.
        let snapshot: Vec<Arc<Vec<Chunk>>> = self
            .read()?
            .iter()
            .filter(|(source, _)| filter.matches(source))
            .map(|(_, entry)| Arc::clone(&entry.chunks))
            .collect();

        Ok(rank_by_similarity(
            embedding,
            snapshot.iter().flat_map(|set| set.iter()),
            k,
        ))
    }

    async fn delete(&self, source: &str) -> Result<usize> {
        match self.write()?.remove(source) {
            Some(entry) => Ok(entry.chunks.len()),
            None => Err(CopilotError::NotFound {
                source_name: source.to_string(),
            }),
        }
    }

    async fn reset(&self) -> Result<usize> {
        let mut entries = self.write()?;
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }

    async fn list_sources(&self) -> Result<Vec<SourceSummary>> {
        let mut out: Vec<SourceSummary> = self
            .read()?
            .iter()
            .map(|(source, entry)| SourceSummary {
                source: source.clone(),
                chunk_count: entry.chunks.len(),
            })
            .collect();
        out.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(out)
    }

    async fn chunks_for(&self, source: &str) -> Result<Vec<Chunk>> {
        Ok(self
            .read()?
            .get(source)
            .map(|entry| entry.chunks.as_ref().clone())
            .unwrap_or_default())
    }
}
