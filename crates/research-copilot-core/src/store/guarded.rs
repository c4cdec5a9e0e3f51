//! Per-source mutation leases layered over any [`VectorStore`].
//!
//! Leases live in an arena keyed by source name. An upsert or delete holds
//! the global gate shared and its source lease exclusively, so mutations of
//! different sources run in parallel while two mutations of the same source
//! are serialized. Reset takes the gate exclusively. Reads never touch the
//! gate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info};

use crate::error::{CopilotError, Result};
use crate::models::{Chunk, Document, EvidenceItem, SourceSummary};

use super::{QueryFilter, VectorStore};

/// What reset does when mutations are in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetPolicy {
    /// Block until in-flight upserts and deletes settle.
    #[default]
    Wait,
    /// Fail immediately with [`CopilotError::Conflict`].
    Fail,
}

/// Held for the duration of one source mutation.
pub struct SourceLease {
    source: String,
    _source_guard: OwnedMutexGuard<()>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl SourceLease {
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Arena of per-source mutexes plus the global reset gate.
#[derive(Default)]
pub struct SourceLeases {
    arena: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    gate: Arc<RwLock<()>>,
}

impl SourceLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive mutation rights on `source`.
    pub async fn acquire(&self, source: &str) -> Result<SourceLease> {
        let gate = Arc::clone(&self.gate).read_owned().await;
        let slot = {
            let mut arena = self.arena.lock().map_err(CopilotError::store)?;
            // Drop slots nobody holds or waits on.
            arena.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(arena.entry(source.to_string()).or_default())
        };
        let guard = slot.lock_owned().await;
        Ok(SourceLease {
            source: source.to_string(),
            _source_guard: guard,
            _gate: gate,
        })
    }

    /// Number of sources with a live lease or waiter.
    pub fn active(&self) -> usize {
        self.arena
            .lock()
            .map(|arena| arena.values().filter(|s| Arc::strong_count(s) > 1).count())
            .unwrap_or(0)
    }

    async fn exclusive(&self, policy: ResetPolicy) -> Result<tokio::sync::OwnedRwLockWriteGuard<()>> {
        match policy {
            ResetPolicy::Wait => Ok(Arc::clone(&self.gate).write_owned().await),
            ResetPolicy::Fail => Arc::clone(&self.gate).try_write_owned().map_err(|_| {
                CopilotError::Conflict {
                    source_name: "*".to_string(),
                    reason: "reset refused while documents are being modified".to_string(),
                }
            }),
        }
    }
}

/// A [`VectorStore`] wrapper that enforces per-source mutual exclusion.
pub struct GuardedStore<S: ?Sized = dyn VectorStore> {
    inner: Arc<S>,
    leases: SourceLeases,
    policy: ResetPolicy,
}

impl<S: VectorStore + ?Sized> GuardedStore<S> {
    pub fn new(inner: Arc<S>, policy: ResetPolicy) -> Self {
        Self {
            inner,
            leases: SourceLeases::new(),
            policy,
        }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    pub fn leases(&self) -> &SourceLeases {
        &self.leases
    }

    pub fn policy(&self) -> ResetPolicy {
        self.policy
    }
}

#[async_trait]
impl<S: VectorStore + ?Sized> VectorStore for GuardedStore<S> {
    async fn upsert(&self, document: &Document, chunks: &[Chunk]) -> Result<usize> {
        let lease = self.leases.acquire(&document.source).await?;
        let stored = self.inner.upsert(document, chunks).await?;
        debug!(source = lease.source(), chunks = stored, "upsert committed");
        Ok(stored)
    }

    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<EvidenceItem>> {
        self.inner.query(embedding, k, filter).await
    }

    async fn delete(&self, source: &str) -> Result<usize> {
        let lease = self.leases.acquire(source).await?;
        let removed = self.inner.delete(source).await?;
        debug!(source = lease.source(), chunks = removed, "delete committed");
        Ok(removed)
    }

    async fn reset(&self) -> Result<usize> {
        let _exclusive = self.leases.exclusive(self.policy).await?;
        let removed = self.inner.reset().await?;
        info!(sources = removed, "store reset");
        Ok(removed)
    }

    async fn list_sources(&self) -> Result<Vec<SourceSummary>> {
        self.inner.list_sources().await
    }

    async fn chunks_for(&self, source: &str) -> Result<Vec<Chunk>> {
        self.inner.chunks_for(source).await
    }
}
