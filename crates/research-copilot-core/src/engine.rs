//! The [`Copilot`] engine: ingest, ask, and document management over an
//! explicitly supplied vector store, embedder and language model.
//!
//! # Write path
//!
//! ```text
//! pages ─▶ normalize ─▶ chunk ─▶ embed (batched) ─▶ GuardedStore::upsert ─▶ clear cache
//! ```
//!
//! # Read path
//!
//! ```text
//! query ─▶ Retriever ─▶ Synthesizer (+ session history) ─▶ Answer ─▶ append Turn
//!                    └▶ model stream ─▶ StreamingCoordinator ─▶ AnswerStream
//! ```

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chunk::{chunk_pages, chunk_text, normalize_text, ChunkingConfig};
use crate::embedding::{check_batch, Embedder};
use crate::error::{CopilotError, Result};
use crate::memory::{MemoryBudget, SessionStore, Turn};
use crate::models::{Chunk, ChunkDraft, ContentType, Document, Page, SourceSummary};
use crate::prompt::{build_prompt, insufficient_text, NO_EVIDENCE_REASON};
use crate::retrieve::{RetrievalParams, Retriever};
use crate::store::{GuardedStore, ResetPolicy, VectorStore};
use crate::stream::{drive, AnswerStream, StreamState, StreamingCoordinator};
use crate::synth::{Answer, LanguageModel, Synthesizer, TextStream};

/// Source name used when pasted text arrives without one.
pub const DEFAULT_TEXT_SOURCE: &str = "pasted_text";

/// Tuning for every pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalParams,
    pub memory: MemoryBudget,
    pub repair_attempts: usize,
    pub reset_policy: ResetPolicy,
    pub embed_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalParams::default(),
            memory: MemoryBudget::default(),
            repair_attempts: 1,
            reset_policy: ResetPolicy::Wait,
            embed_batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub source: String,
    pub content_type: ContentType,
    pub chunks: usize,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResponse {
    pub turn_id: String,
    pub session_id: Option<String>,
    pub answer: Answer,
}

pub struct Copilot {
    store: Arc<GuardedStore>,
    embedder: Arc<dyn Embedder>,
    retriever: Retriever,
    synthesizer: Synthesizer,
    sessions: Arc<SessionStore>,
    config: EngineConfig,
}

impl Copilot {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn LanguageModel>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.chunking.validate()?;
        let store = Arc::new(GuardedStore::new(store, config.reset_policy));
        let retriever = Retriever::new(
            Arc::clone(&store) as Arc<dyn VectorStore>,
            Arc::clone(&embedder),
            config.retrieval,
        );
        Ok(Self {
            store,
            embedder,
            retriever,
            synthesizer: Synthesizer::new(model, config.repair_attempts),
            sessions: Arc::new(SessionStore::new(config.memory)),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<GuardedStore> {
        &self.store
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    // ── Ingest ──────────────────────────────────────────────────────────

    /// Ingest extracted pages (one per PDF page). Replaces any earlier
    /// version of `source`.
    pub async fn ingest_pages(
        &self,
        source: &str,
        content_type: ContentType,
        pages: Vec<Page>,
    ) -> Result<IngestReport> {
        let source = checked_source(source)?;
        let pages: Vec<Page> = pages
            .into_iter()
            .map(|p| Page {
                number: p.number,
                text: normalize_text(&p.text),
            })
            .collect();
        let (content, drafts) = chunk_pages(&pages, &self.config.chunking)?;
        self.store_document(source, content_type, content, drafts).await
    }

    /// Ingest pasted or plain-file text.
    pub async fn ingest_text(&self, text: &str, source: Option<&str>) -> Result<IngestReport> {
        let source = match source.map(str::trim) {
            Some(s) if !s.is_empty() => s,
            _ => DEFAULT_TEXT_SOURCE,
        };
        let content = normalize_text(text);
        let drafts = chunk_text(&content, &self.config.chunking)?;
        self.store_document(source, ContentType::Text, content, drafts)
            .await
    }

    async fn store_document(
        &self,
        source: &str,
        content_type: ContentType,
        content: String,
        drafts: Vec<ChunkDraft>,
    ) -> Result<IngestReport> {
        if drafts.is_empty() {
            return Err(CopilotError::InvalidInput(format!(
                "no extractable text in '{}'",
                source
            )));
        }

        let texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
        let vectors = self
            .embed_all(&texts)
            .await
            .map_err(|e| e.context(source))?;

        let chunks: Vec<Chunk> = drafts
            .into_iter()
            .zip(vectors)
            .map(|(draft, vector)| Chunk::from_draft(source, draft, vector))
            .collect();
        let document = Document::new(source, content_type, content);

        let stored = self
            .store
            .upsert(&document, &chunks)
            .await
            .map_err(|e| e.context(source))?;
        self.retriever.cache().clear();

        info!(source, chunks = stored, kind = content_type.as_str(), "ingested document");
        Ok(IngestReport {
            source: source.to_string(),
            content_type,
            chunks: stored,
            content_hash: document.content_hash,
        })
    }

    async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let batch_size = self.config.embed_batch_size.max(1);
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size) {
            let vectors = self.embedder.embed_batch(batch).await?;
            check_batch(batch.len(), self.embedder.dims(), &vectors)?;
            out.extend(vectors);
        }
        Ok(out)
    }

    // ── Query ───────────────────────────────────────────────────────────

    /// Answer `query` from stored evidence. With a session id the recent
    /// turns of that session shape retrieval and the prompt, and the new
    /// turn is appended.
    pub async fn ask(
        &self,
        query: &str,
        session_id: Option<&str>,
        top_k: Option<usize>,
    ) -> Result<AskResponse> {
        let history = self.history(session_id).await?;
        let k = self.config.retrieval.effective_k(top_k);
        let turn_id = uuid::Uuid::new_v4().to_string();

        let evidence = self
            .retriever
            .retrieve(query, k, non_empty(&history))
            .await
            .map_err(|e| e.context(&format!("turn {}", turn_id)))?;
        let answer = self
            .synthesizer
            .synthesize(query, &evidence, &history)
            .await
            .map_err(|e| e.context(&format!("turn {}", turn_id)))?;

        debug!(turn = %turn_id, status = answer.status(), evidence = evidence.len(), "answered");

        if let Some(id) = session_id {
            let mut turn = Turn::new(
                query,
                &answer.text(),
                evidence.chunk_ids(),
                answer.citations().to_vec(),
            );
            turn.id = turn_id.clone();
            record_turn(&self.sessions, id, turn).await?;
        }

        Ok(AskResponse {
            turn_id,
            session_id: session_id.map(str::to_string),
            answer,
        })
    }

    /// Stream an answer. Retrieval errors are returned directly; model
    /// errors and cancellation end the stream in a failed terminal state.
    pub async fn ask_stream(
        &self,
        query: &str,
        session_id: Option<&str>,
        top_k: Option<usize>,
    ) -> Result<AnswerStream> {
        let history = self.history(session_id).await?;
        let k = self.config.retrieval.effective_k(top_k);
        let turn_id = uuid::Uuid::new_v4().to_string();

        let evidence = self
            .retriever
            .retrieve(query, k, non_empty(&history))
            .await
            .map_err(|e| e.context(&format!("turn {}", turn_id)))?;

        let (answer_stream, events, cancel) = AnswerStream::channel(&turn_id);
        let coordinator = StreamingCoordinator::new(&turn_id, evidence.ids());
        let chunk_ids = evidence.chunk_ids();

        let upstream: futures::future::BoxFuture<'static, Result<TextStream>> = if evidence
            .is_empty()
        {
            debug!(turn = %turn_id, "no evidence, streaming fixed answer");
            let text = insufficient_text(NO_EVIDENCE_REASON);
            Box::pin(async move {
                let once = stream::once(async move { Ok::<_, CopilotError>(text) });
                Ok::<TextStream, CopilotError>(once.boxed())
            })
        } else {
            let prompt = build_prompt(query, &evidence, &history);
            let model = Arc::clone(self.synthesizer.model());
            Box::pin(async move { model.generate_stream(&prompt).await })
        };

        let sessions = Arc::clone(&self.sessions);
        let session_id = session_id.map(str::to_string);
        let query = query.to_string();
        tokio::spawn(async move {
            let outcome = drive(coordinator, evidence.items, upstream, events, cancel).await;
            if let (Some(id), false) = (
                session_id,
                matches!(outcome.state, StreamState::Failed { .. }),
            ) {
                let mut turn = Turn::new(&query, &outcome.text, chunk_ids, outcome.citations);
                turn.id = outcome.turn_id;
                if let Err(e) = record_turn(&sessions, &id, turn).await {
                    tracing::warn!(session = %id, error = %e, "failed to record streamed turn");
                }
            }
        });

        Ok(answer_stream)
    }

    async fn history(&self, session_id: Option<&str>) -> Result<Vec<Turn>> {
        match session_id {
            Some(id) => self.sessions.recent_turns(id).await,
            None => Ok(Vec::new()),
        }
    }

    // ── Document management ─────────────────────────────────────────────

    pub async fn list_documents(&self) -> Result<Vec<SourceSummary>> {
        self.store.list_sources().await
    }

    /// Chunks of one document in index order.
    pub async fn document_chunks(&self, source: &str) -> Result<Vec<Chunk>> {
        self.store.chunks_for(source).await
    }

    pub async fn delete_document(&self, source: &str) -> Result<usize> {
        let removed = self.store.delete(source).await?;
        self.retriever.cache().evict_source(source);
        info!(source, chunks = removed, "deleted document");
        Ok(removed)
    }

    pub async fn reset_documents(&self) -> Result<usize> {
        let removed = self.store.reset().await?;
        self.retriever.cache().clear();
        info!(sources = removed, "reset documents");
        Ok(removed)
    }

    // ── Sessions ────────────────────────────────────────────────────────

    pub fn create_session(&self) -> Result<String> {
        self.sessions.create()
    }

    pub fn end_session(&self, session_id: &str) -> Result<bool> {
        self.sessions.remove(session_id)
    }
}

/// Append a finished turn. A session ended while the turn was in flight
/// stays ended; the turn is dropped.
async fn record_turn(sessions: &SessionStore, session_id: &str, turn: Turn) -> Result<()> {
    match sessions.append(session_id, turn).await {
        Err(CopilotError::SessionNotFound { .. }) => {
            debug!(session = session_id, "session ended mid-turn, turn not recorded");
            Ok(())
        }
        other => other,
    }
}

fn checked_source(source: &str) -> Result<&str> {
    let source = source.trim();
    if source.is_empty() {
        return Err(CopilotError::InvalidInput("source name is empty".into()));
    }
    Ok(source)
}

fn non_empty(turns: &[Turn]) -> Option<&[Turn]> {
    if turns.is_empty() {
        None
    } else {
        Some(turns)
    }
}
