//! End-to-end tests for the ingest / ask / manage pipeline using the
//! in-memory store, the offline hashed embedder, and a recording model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use research_copilot_core::chunk::{chunk_text, normalize_text, ChunkingConfig};
use research_copilot_core::embedding::{Embedder, HashedEmbedder};
use research_copilot_core::engine::{Copilot, EngineConfig};
use research_copilot_core::error::{CopilotError, Result};
use research_copilot_core::models::{ContentType, Page};
use research_copilot_core::store::{InMemoryStore, QueryFilter, ResetPolicy, VectorStore};
use research_copilot_core::stream::{StreamEvent, StreamState, CANCELLED_REASON};
use research_copilot_core::synth::{Answer, LanguageModel, TextStream};

// ─── Test Model ─────────────────────────────────────────────────────

/// Returns a canned reply and records every prompt it receives.
struct RecordingModel {
    reply: String,
    parts: Vec<String>,
    hang_after_parts: bool,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl RecordingModel {
    fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            parts: vec![reply.to_string()],
            hang_after_parts: false,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn streaming(parts: &[&str], hang_after_parts: bool) -> Self {
        Self {
            reply: parts.concat(),
            parts: parts.iter().map(|p| p.to_string()).collect(),
            hang_after_parts,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record(&self, prompt: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
    }
}

#[async_trait]
impl LanguageModel for RecordingModel {
    fn model_name(&self) -> &str {
        "recording"
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        self.record(prompt);
        Ok(self.reply.clone())
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TextStream> {
        self.record(prompt);
        let items: Vec<Result<String>> = self.parts.iter().cloned().map(Ok).collect();
        let base = stream::iter(items);
        if self.hang_after_parts {
            Ok(base.chain(stream::pending()).boxed())
        } else {
            Ok(base.boxed())
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn engine_with(model: Arc<RecordingModel>, config: EngineConfig) -> Copilot {
    Copilot::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(HashedEmbedder::new(256)),
        model,
        config,
    )
    .unwrap()
}

fn engine(model: Arc<RecordingModel>) -> Copilot {
    engine_with(model, EngineConfig::default())
}

const RUST_NOTES: &str = "Rust guarantees memory safety without a garbage collector.\n\n\
    Ownership and borrowing rules are checked at compile time by the borrow checker.\n\n\
    Lifetimes describe how long references stay valid.";

// ─── Ingest ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_idempotent_ingest() {
    let copilot = engine(Arc::new(RecordingModel::replying("x [1].")));
    let text = RUST_NOTES.repeat(20);

    let first = copilot.ingest_text(&text, Some("rust")).await.unwrap();
    let chunks_a = copilot.document_chunks("rust").await.unwrap();
    let second = copilot.ingest_text(&text, Some("rust")).await.unwrap();
    let chunks_b = copilot.document_chunks("rust").await.unwrap();

    assert!(first.chunks > 1);
    assert_eq!(first.chunks, second.chunks);
    assert_eq!(first.content_hash, second.content_hash);
    assert_eq!(chunks_a, chunks_b);

    let docs = copilot.list_documents().await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].chunk_count, first.chunks);
}

#[tokio::test]
async fn test_lossless_reconstruction_from_store() {
    let config = EngineConfig {
        chunking: ChunkingConfig {
            max_chunk_chars: 120,
            overlap_chars: 25,
        },
        ..EngineConfig::default()
    };
    let copilot = engine_with(Arc::new(RecordingModel::replying("x [1].")), config);
    let text = RUST_NOTES.repeat(5);
    copilot.ingest_text(&text, Some("rust")).await.unwrap();

    let chunks = copilot.document_chunks("rust").await.unwrap();
    let rebuilt: String = chunks
        .iter()
        .flat_map(|c| c.text.chars().skip(c.overlap))
        .collect();
    assert_eq!(rebuilt, normalize_text(&text));
    assert!(chunks.iter().all(|c| !c.text.is_empty()));
}

#[tokio::test]
async fn test_three_page_pdf_scenario() {
    let config = EngineConfig {
        chunking: ChunkingConfig {
            max_chunk_chars: 1000,
            overlap_chars: 100,
        },
        ..EngineConfig::default()
    };
    let copilot = engine_with(Arc::new(RecordingModel::replying("x [1].")), config);
    let pages = vec![
        Page { number: 1, text: "a".repeat(798) },
        Page { number: 2, text: "b".repeat(798) },
        Page { number: 3, text: "c".repeat(800) },
    ];
    let report = copilot
        .ingest_pages("paper.pdf", ContentType::Pdf, pages)
        .await
        .unwrap();
    assert_eq!(report.chunks, 3);

    let chunks = copilot.document_chunks("paper.pdf").await.unwrap();
    assert!(chunks.iter().all(|c| c.text.chars().count() <= 1000));
    assert_eq!(chunks[0].end - chunks[1].start, 100);
    assert_eq!(chunks[1].end - chunks[2].start, 100);
    assert_eq!(
        chunks.iter().map(|c| c.page).collect::<Vec<_>>(),
        vec![Some(1), Some(1), Some(2)]
    );
}

#[tokio::test]
async fn test_empty_text_is_rejected() {
    let copilot = engine(Arc::new(RecordingModel::replying("x [1].")));
    let err = copilot.ingest_text("   \n\n  ", Some("blank")).await.unwrap_err();
    assert!(matches!(err, CopilotError::InvalidInput(ref m) if m.contains("blank")));

    let err = copilot
        .ingest_pages("scan.pdf", ContentType::Pdf, vec![Page { number: 1, text: String::new() }])
        .await
        .unwrap_err();
    assert!(matches!(err, CopilotError::InvalidInput(_)));
    assert!(copilot.list_documents().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_parallel_ingest_of_different_sources() {
    let copilot = Arc::new(engine(Arc::new(RecordingModel::replying("x [1]."))));
    let (a, b) = tokio::join!(
        copilot.ingest_text("alpha document about rivers", Some("a")),
        copilot.ingest_text("beta document about mountains", Some("b")),
    );
    a.unwrap();
    b.unwrap();
    let names: Vec<String> = copilot
        .list_documents()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.source)
        .collect();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_queries_never_see_mixed_versions() {
    let config = EngineConfig {
        chunking: ChunkingConfig {
            max_chunk_chars: 60,
            overlap_chars: 10,
        },
        ..EngineConfig::default()
    };
    let copilot = Arc::new(engine_with(
        Arc::new(RecordingModel::replying("x [1].")),
        config,
    ));
    let v1 = "version one text about glaciers. ".repeat(10);
    let v2 = "version two text about glaciers and deserts. ".repeat(7);
    copilot.ingest_text(&v1, Some("doc")).await.unwrap();

    let writer = {
        let copilot = Arc::clone(&copilot);
        let (v1, v2) = (v1.clone(), v2.clone());
        tokio::spawn(async move {
            for i in 0..40 {
                let text = if i % 2 == 0 { &v2 } else { &v1 };
                copilot.ingest_text(text, Some("doc")).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let drafts_of = |text: &str| -> std::collections::HashSet<(usize, String)> {
        chunk_text(&normalize_text(text), &config.chunking)
            .unwrap()
            .into_iter()
            .map(|d| (d.index, d.text))
            .collect()
    };
    let (old_set, new_set) = (drafts_of(&v1), drafts_of(&v2));

    for _ in 0..40 {
        let observed: std::collections::HashSet<(usize, String)> = copilot
            .document_chunks("doc")
            .await
            .unwrap()
            .into_iter()
            .map(|c| (c.index, c.text))
            .collect();
        assert!(
            observed == old_set || observed == new_set,
            "observed a mix of old and new chunks"
        );
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();
}

#[tokio::test]
async fn test_query_during_reingest_sees_one_version() {
    let config = EngineConfig {
        chunking: ChunkingConfig {
            max_chunk_chars: 60,
            overlap_chars: 10,
        },
        ..EngineConfig::default()
    };
    let copilot = Arc::new(engine_with(
        Arc::new(RecordingModel::replying("Glaciers move slowly [1].")),
        config,
    ));
    let old_text = "oldtag glacier note. ".repeat(12);
    let new_text = "newtag glacier desert note. ".repeat(9);
    copilot.ingest_text(&old_text, Some("doc")).await.unwrap();

    let texts_of = |text: &str| -> HashSet<String> {
        chunk_text(&normalize_text(text), &config.chunking)
            .unwrap()
            .into_iter()
            .map(|d| d.text)
            .collect()
    };
    let (old_set, new_set) = (texts_of(&old_text), texts_of(&new_text));
    assert!(old_set.is_disjoint(&new_set));

    let writer = {
        let copilot = Arc::clone(&copilot);
        let (old_text, new_text) = (old_text.clone(), new_text.clone());
        tokio::spawn(async move {
            for i in 0..40 {
                let text = if i % 2 == 0 { &new_text } else { &old_text };
                copilot.ingest_text(text, Some("doc")).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let query = HashedEmbedder::new(256).embed("glacier note").await.unwrap();
    for _ in 0..40 {
        // Every stored chunk comes back, so the hit set must equal one version.
        let hits: HashSet<String> = copilot
            .store()
            .query(&query, 1_000, &QueryFilter::all())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.chunk.text)
            .collect();
        assert!(
            hits == old_set || hits == new_set,
            "query mixed old and new chunks: {:?}",
            hits
        );

        let reply = copilot.ask("glacier note", None, Some(10)).await.unwrap();
        let evidence: HashSet<String> = reply
            .answer
            .evidence()
            .iter()
            .map(|e| e.chunk.text.clone())
            .collect();
        assert!(
            evidence.is_subset(&old_set) || evidence.is_subset(&new_set),
            "evidence mixed old and new chunks: {:?}",
            evidence
        );
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();
}

// ─── Ask ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ask_without_documents_never_calls_model() {
    let model = Arc::new(RecordingModel::replying("Invented [1]."));
    let copilot = engine(Arc::clone(&model));

    let reply = copilot.ask("What is Rust?", None, None).await.unwrap();
    assert!(matches!(reply.answer, Answer::InsufficientEvidence { .. }));
    assert!(reply.answer.citations().is_empty());
    assert!(reply.answer.text().starts_with("INSUFFICIENT_EVIDENCE"));
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_unrelated_query_gets_no_grounding() {
    let model = Arc::new(RecordingModel::replying("Invented [1]."));
    let config = EngineConfig {
        retrieval: research_copilot_core::retrieve::RetrievalParams {
            min_similarity: 0.5,
            ..Default::default()
        },
        ..EngineConfig::default()
    };
    let copilot = engine_with(Arc::clone(&model), config);
    copilot.ingest_text(RUST_NOTES, Some("rust")).await.unwrap();

    let reply = copilot.ask("zebra xylophone", None, None).await.unwrap();
    assert!(matches!(reply.answer, Answer::InsufficientEvidence { .. }));
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_valid_answer_cites_only_supplied_evidence() {
    let model = Arc::new(RecordingModel::replying(
        "Rust is memory safe without a garbage collector [1].",
    ));
    let copilot = engine(Arc::clone(&model));
    copilot.ingest_text(RUST_NOTES, Some("rust")).await.unwrap();

    let reply = copilot
        .ask("Does Rust use a garbage collector?", None, Some(3))
        .await
        .unwrap();
    match &reply.answer {
        Answer::Valid {
            citations, evidence, ..
        } => {
            assert!(!citations.is_empty());
            for id in citations {
                assert!(evidence.iter().any(|e| e.rank as u32 == *id));
            }
        }
        other => panic!("expected a valid answer, got {:?}", other),
    }
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn test_invalid_citation_is_surfaced_with_warning() {
    let model = Arc::new(RecordingModel::replying("Rust has a garbage collector [9]."));
    let copilot = engine(Arc::clone(&model));
    copilot.ingest_text(RUST_NOTES, Some("rust")).await.unwrap();

    let reply = copilot.ask("garbage collector in Rust", None, None).await.unwrap();
    match &reply.answer {
        Answer::InvalidCitations { invalid, text, .. } => {
            assert_eq!(invalid, &vec![9]);
            assert_eq!(text, "Rust has a garbage collector [9].");
        }
        other => panic!("expected invalid citations, got {:?}", other),
    }
    // One initial attempt plus one repair.
    assert_eq!(model.calls(), 2);
    assert!(reply.answer.warning().is_some());
}

#[tokio::test]
async fn test_session_history_feeds_next_turn() {
    let model = Arc::new(RecordingModel::replying("Borrow checking happens at compile time [1]."));
    let copilot = engine(Arc::clone(&model));
    copilot.ingest_text(RUST_NOTES, Some("rust")).await.unwrap();
    let session = copilot.create_session().unwrap();

    copilot
        .ask("When does the borrow checker run?", Some(&session), None)
        .await
        .unwrap();
    copilot
        .ask("And what does it check?", Some(&session), None)
        .await
        .unwrap();

    let turns = copilot.sessions().recent_turns(&session).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].query, "When does the borrow checker run?");

    let prompts = model.prompts.lock().unwrap();
    assert!(!prompts[0].contains("CONVERSATION SO FAR"));
    assert!(prompts[1].contains("User: When does the borrow checker run?"));
}

#[tokio::test]
async fn test_ask_with_unknown_session_is_not_found() {
    let model = Arc::new(RecordingModel::replying("Ownership [1]."));
    let copilot = engine(Arc::clone(&model));
    copilot.ingest_text(RUST_NOTES, Some("rust")).await.unwrap();

    let err = copilot
        .ask("What is ownership?", Some("forged-id"), None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CopilotError::SessionNotFound {
            session_id: "forged-id".into()
        }
    );
    assert!(copilot
        .ask_stream("What is ownership?", Some("forged-id"), None)
        .await
        .is_err());
    assert_eq!(model.calls(), 0);
    assert!(copilot.sessions().is_empty());
}

// ─── Stream ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stream_with_unsupplied_citation_completes_with_warning() {
    let model = Arc::new(RecordingModel::streaming(&["Chlorophyll absorbs ", "light [", "7]."], false));
    let copilot = engine(Arc::clone(&model));
    for source in ["bio-1", "bio-2", "bio-3"] {
        copilot
            .ingest_text(
                &format!("{} notes: photosynthesis uses chlorophyll to absorb light.", source),
                Some(source),
            )
            .await
            .unwrap();
    }

    let answer = copilot
        .ask_stream("photosynthesis chlorophyll light", None, Some(3))
        .await
        .unwrap();
    let events: Vec<StreamEvent> = answer.collect().await;

    let supplied = match &events[0] {
        StreamEvent::Evidence(items) => items.len(),
        other => panic!("expected evidence first, got {:?}", other),
    };
    assert_eq!(supplied, 3);

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Delta(d) => Some(d.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "Chlorophyll absorbs light [7].");

    match events.last() {
        Some(StreamEvent::Terminal(outcome)) => {
            assert_eq!(
                outcome.state,
                StreamState::CompleteWithWarning { invalid: vec![7] }
            );
            assert_eq!(outcome.text, streamed);
        }
        other => panic!("expected terminal event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_without_documents_is_fixed_answer() {
    let model = Arc::new(RecordingModel::streaming(&["never"], false));
    let copilot = engine(Arc::clone(&model));

    let outcome = copilot
        .ask_stream("anything", None, None)
        .await
        .unwrap()
        .collect_outcome()
        .await
        .unwrap();
    assert_eq!(outcome.state, StreamState::Complete);
    assert!(outcome.insufficient_evidence);
    assert!(outcome.text.starts_with("INSUFFICIENT_EVIDENCE"));
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_stream_cancel_fails_turn_and_skips_memory() {
    let model = Arc::new(RecordingModel::streaming(&["Partial answer "], true));
    let copilot = engine(Arc::clone(&model));
    copilot.ingest_text(RUST_NOTES, Some("rust")).await.unwrap();
    let session = copilot.create_session().unwrap();

    let mut answer = copilot
        .ask_stream("borrow checker", Some(&session), None)
        .await
        .unwrap();
    let cancel = answer.cancel_handle();

    assert!(matches!(answer.next().await, Some(StreamEvent::Evidence(_))));
    assert_eq!(
        answer.next().await,
        Some(StreamEvent::Delta("Partial answer ".into()))
    );
    cancel.cancel();

    let terminal = tokio::time::timeout(Duration::from_secs(2), answer.collect_outcome())
        .await
        .expect("stream must end promptly after cancel")
        .unwrap();
    assert_eq!(
        terminal.state,
        StreamState::Failed {
            reason: CANCELLED_REASON.into()
        }
    );
    assert_eq!(terminal.text, "Partial answer ");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(copilot
        .sessions()
        .recent_turns(&session)
        .await
        .unwrap()
        .is_empty());
}

/// Streams one canned reply once released.
struct GatedModel {
    release: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl LanguageModel for GatedModel {
    fn model_name(&self) -> &str {
        "gated"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        self.release.notified().await;
        Ok("Borrow checking runs at compile time [1].".into())
    }
}

#[tokio::test]
async fn test_stream_finishing_after_session_end_does_not_recreate_it() {
    let release = Arc::new(tokio::sync::Notify::new());
    let copilot = Copilot::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(HashedEmbedder::new(256)),
        Arc::new(GatedModel {
            release: Arc::clone(&release),
        }),
        EngineConfig::default(),
    )
    .unwrap();
    copilot.ingest_text(RUST_NOTES, Some("rust")).await.unwrap();
    let session = copilot.create_session().unwrap();

    let mut answer = copilot
        .ask_stream("When does the borrow checker run?", Some(&session), None)
        .await
        .unwrap();
    assert!(matches!(answer.next().await, Some(StreamEvent::Evidence(_))));

    assert!(copilot.end_session(&session).unwrap());
    release.notify_one();

    let outcome = answer.collect_outcome().await.unwrap();
    assert_eq!(outcome.state, StreamState::Complete);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!copilot.sessions().contains(&session));
    assert!(copilot.sessions().recent_turns(&session).await.is_err());
}

// ─── Document management ────────────────────────────────────────────

#[tokio::test]
async fn test_deletion_completeness() {
    let copilot = engine(Arc::new(RecordingModel::replying("x [1].")));
    copilot
        .ingest_text("Volcanoes erupt magma and ash.", Some("geo"))
        .await
        .unwrap();
    copilot.ingest_text(RUST_NOTES, Some("rust")).await.unwrap();

    // Warm the cache with an answer that ranks "geo".
    let before = copilot
        .retriever()
        .retrieve("volcanoes magma", 5, None)
        .await
        .unwrap();
    assert!(before.contains_source("geo"));

    assert_eq!(copilot.delete_document("geo").await.unwrap(), 1);
    let names: Vec<String> = copilot
        .list_documents()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.source)
        .collect();
    assert_eq!(names, vec!["rust".to_string()]);

    let after = copilot
        .retriever()
        .retrieve("volcanoes magma", 5, None)
        .await
        .unwrap();
    assert!(!after.contains_source("geo"));

    let err = copilot.delete_document("geo").await.unwrap_err();
    assert_eq!(
        err,
        CopilotError::NotFound {
            source_name: "geo".into()
        }
    );
}

#[tokio::test]
async fn test_reset_isolation() {
    let copilot = engine(Arc::new(RecordingModel::replying("x [1].")));
    for i in 0..5 {
        copilot
            .ingest_text(&format!("document number {}", i), Some(&format!("doc-{}", i)))
            .await
            .unwrap();
    }
    assert_eq!(copilot.reset_documents().await.unwrap(), 5);
    assert!(copilot.list_documents().await.unwrap().is_empty());
    assert!(copilot
        .retriever()
        .retrieve("document number", 5, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_reset_conflicts_under_fail_policy() {
    let config = EngineConfig {
        reset_policy: ResetPolicy::Fail,
        ..EngineConfig::default()
    };
    let copilot = engine_with(Arc::new(RecordingModel::replying("x [1].")), config);
    copilot.ingest_text(RUST_NOTES, Some("rust")).await.unwrap();

    let lease = copilot.store().leases().acquire("rust").await.unwrap();
    let err = copilot.reset_documents().await.unwrap_err();
    assert!(matches!(err, CopilotError::Conflict { .. }));
    assert!(err.is_retryable());
    drop(lease);

    assert_eq!(copilot.reset_documents().await.unwrap(), 1);
}
