//! Retrieval orchestrator: query text in, ranked evidence out.
//!
//! 1. Embed the query (prefixed with the previous question when history
//!    is supplied, so follow-ups like "and why?" stay on topic).
//! 2. Fetch candidates from the [`VectorStore`].
//! 3. Drop candidates below `min_similarity`. Never pad back up to `k`.
//! 4. Collapse adjacent chunks of one source whose spans overlap by more
//!    than half of the shorter one, keeping the higher score.
//! 5. Re-rank `1..=n`; the rank is the citation identifier.
//!
//! An empty [`EvidenceSet`] is a valid result and means "no grounding".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embedding::Embedder;
use crate::error::{CopilotError, Result};
use crate::memory::Turn;
use crate::models::EvidenceItem;
use crate::store::{QueryFilter, VectorStore};

/// Overlap fraction above which adjacent chunks count as duplicates.
const DEDUP_OVERLAP_RATIO: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalParams {
    /// Default number of evidence items.
    pub k: usize,
    /// Upper bound for a caller-supplied `k`.
    pub max_k: usize,
    /// Similarity floor; candidates scoring below it are dropped.
    pub min_similarity: f32,
    /// Retrieval cache entries; 0 disables caching.
    pub cache_capacity: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            k: 5,
            max_k: 20,
            min_similarity: 0.1,
            cache_capacity: 256,
        }
    }
}

impl RetrievalParams {
    /// Clamp a requested `k` into `1..=max_k`, falling back to the default.
    pub fn effective_k(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.k).clamp(1, self.max_k.max(1))
    }
}

/// Ranked, deduplicated evidence for one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSet {
    pub items: Vec<EvidenceItem>,
}

impl EvidenceSet {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Citation identifiers a model may use for this set.
    pub fn ids(&self) -> Vec<u32> {
        self.items.iter().map(|e| e.rank as u32).collect()
    }

    pub fn chunk_ids(&self) -> Vec<String> {
        self.items.iter().map(|e| e.chunk.id.clone()).collect()
    }

    pub fn get(&self, id: u32) -> Option<&EvidenceItem> {
        self.items.iter().find(|e| e.rank as u32 == id)
    }

    pub fn contains_source(&self, source: &str) -> bool {
        self.items.iter().any(|e| e.chunk.source == source)
    }
}

pub struct Retriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    params: RetrievalParams,
    cache: RetrievalCache,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        params: RetrievalParams,
    ) -> Self {
        Self {
            store,
            embedder,
            cache: RetrievalCache::new(params.cache_capacity),
            params,
        }
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    pub fn cache(&self) -> &RetrievalCache {
        &self.cache
    }

    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        history: Option<&[Turn]>,
    ) -> Result<EvidenceSet> {
        let query = query.trim();
        if query.is_empty() {
            return Err(CopilotError::InvalidInput("query is empty".into()));
        }
        let k = k.clamp(1, self.params.max_k.max(1));
        // The embedder sees exactly the text the cache is keyed on.
        let search_text = match history.and_then(|turns| turns.last()) {
            Some(prev) => cache_text(&format!("{}\n{}", prev.query, query)),
            None => cache_text(query),
        };

        let generation = self.cache.generation();
        if let Some(hit) = self.cache.get(&search_text, k) {
            debug!(k, items = hit.len(), "retrieval cache hit");
            return Ok(hit);
        }

        let embedding = self.embedder.embed(&search_text).await?;
        // Over-fetch so deduplication does not starve the result.
        let candidates = self
            .store
            .query(&embedding, k.saturating_mul(2), &QueryFilter::all())
            .await?;
        let fetched = candidates.len();

        let evidence = assemble(candidates, k, self.params.min_similarity);
        debug!(k, fetched, kept = evidence.len(), "retrieved evidence");

        self.cache.insert(&search_text, k, &evidence, generation);
        Ok(evidence)
    }
}

/// Floor, dedup, truncate and re-rank store candidates.
///
/// `candidates` must already be sorted best-first.
pub fn assemble(candidates: Vec<EvidenceItem>, k: usize, min_similarity: f32) -> EvidenceSet {
    let mut kept: Vec<EvidenceItem> = Vec::with_capacity(k);
    for item in candidates {
        if item.score < min_similarity {
            continue;
        }
        if kept.iter().any(|prev| is_duplicate(prev, &item)) {
            continue;
        }
        kept.push(item);
        if kept.len() == k {
            break;
        }
    }
    for (i, item) in kept.iter_mut().enumerate() {
        item.rank = i + 1;
    }
    EvidenceSet { items: kept }
}

fn is_duplicate(a: &EvidenceItem, b: &EvidenceItem) -> bool {
    let (a, b) = (&a.chunk, &b.chunk);
    if a.source != b.source || a.index.abs_diff(b.index) != 1 {
        return false;
    }
    let shared = a.end.min(b.end).saturating_sub(a.start.max(b.start));
    let shorter = a.char_len().min(b.char_len());
    shorter > 0 && shared as f32 / shorter as f32 > DEDUP_OVERLAP_RATIO
}

type CacheKey = (String, usize);

struct CacheInner {
    entries: HashMap<CacheKey, (u64, EvidenceSet)>,
    tick: u64,
}

/// Bounded least-recently-used cache of evidence sets.
///
/// Any write to the store bumps a generation counter; results computed
/// under an older generation are never inserted.
pub struct RetrievalCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
    generation: AtomicU64,
}

impl RetrievalCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                tick: 0,
            }),
            generation: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn get(&self, query: &str, k: usize) -> Option<EvidenceSet> {
        if self.capacity == 0 {
            return None;
        }
        let mut inner = self.inner.lock().ok()?;
        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.entries.get_mut(&(cache_text(query), k))?;
        entry.0 = tick;
        Some(entry.1.clone())
    }

    fn insert(&self, query: &str, k: usize, evidence: &EvidenceSet, generation: u64) {
        if self.capacity == 0 {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if self.generation() != generation {
            return;
        }
        if inner.entries.len() >= self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, (used, _))| *used)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                inner.entries.remove(&key);
            }
        }
        inner.tick += 1;
        let tick = inner.tick;
        inner
            .entries
            .insert((cache_text(query), k), (tick, evidence.clone()));
    }

    /// Drop everything. Called after an upsert or reset.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
        }
    }

    /// Drop entries that cite `source`. Called after a delete; entries that
    /// never ranked the source are unaffected by its removal.
    pub fn evict_source(&self, source: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.retain(|_, (_, set)| !set.contains_source(source));
        }
    }
}

/// Cache key text. Case is kept: the embedder may be case-sensitive.
fn cache_text(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}
