//! Integration tests for the SQLite vector store against a temp database.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use research_copilot::config::Config;
use research_copilot::sqlite_store::SqliteStore;
use research_copilot_core::chunk::{chunk_text, normalize_text, ChunkingConfig};
use research_copilot_core::embedding::{Embedder, HashedEmbedder};
use research_copilot_core::error::{CopilotError, Result};
use research_copilot_core::models::{Chunk, ChunkDraft, ContentType, Document, Page};
use research_copilot_core::store::{QueryFilter, VectorStore};
use research_copilot_core::synth::LanguageModel;
use research_copilot_core::{Answer, Copilot, EngineConfig};

async fn open_store() -> (TempDir, SqliteStore) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal();
    config.db.path = tmp.path().join("nested").join("copilot.sqlite");
    let store = SqliteStore::open(&config).await.unwrap();
    (tmp, store)
}

fn document(source: &str, vectors: &[Vec<f32>]) -> (Document, Vec<Chunk>) {
    let doc = Document::new(source, ContentType::Pdf, format!("{} body", source));
    let chunks = vectors
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let text = format!("{} chunk {}", source, i);
            Chunk::from_draft(
                source,
                ChunkDraft {
                    index: i,
                    start: i * 10,
                    end: i * 10 + text.chars().count(),
                    text,
                    overlap: if i == 0 { 0 } else { 3 },
                    page: Some(i as u32 + 1),
                    hash: format!("h{}", i),
                },
                v.clone(),
            )
        })
        .collect();
    (doc, chunks)
}

#[tokio::test]
async fn test_upsert_roundtrips_chunk_metadata() {
    let (_tmp, store) = open_store().await;
    let (doc, chunks) = document("paper.pdf", &[vec![1.0, 0.0], vec![0.0, 1.0]]);

    assert_eq!(store.upsert(&doc, &chunks).await.unwrap(), 2);
    assert_eq!(store.chunks_for("paper.pdf").await.unwrap(), chunks);

    let stored = store.document("paper.pdf").await.unwrap().unwrap();
    assert_eq!(stored.content_type, ContentType::Pdf);
    assert_eq!(stored.content_hash, doc.content_hash);
    assert_eq!(stored.ingested_at.timestamp(), doc.ingested_at.timestamp());
    assert!(store.document("other.pdf").await.unwrap().is_none());
}

#[tokio::test]
async fn test_upsert_replaces_previous_chunks() {
    let (_tmp, store) = open_store().await;
    let (doc, chunks) = document("a", &[vec![1.0, 0.0], vec![0.5, 0.5], vec![0.0, 1.0]]);
    store.upsert(&doc, &chunks).await.unwrap();

    let (doc, fewer) = document("a", &[vec![0.0, 1.0]]);
    store.upsert(&doc, &fewer).await.unwrap();

    assert_eq!(store.chunks_for("a").await.unwrap(), fewer);
    let listed = store.list_sources().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].chunk_count, 1);
}

#[tokio::test]
async fn test_upsert_rejects_gapped_indices() {
    let (_tmp, store) = open_store().await;
    let (doc, mut chunks) = document("a", &[vec![1.0], vec![1.0]]);
    chunks.remove(0);

    let err = store.upsert(&doc, &chunks).await.unwrap_err();
    assert!(matches!(err, CopilotError::InvalidInput(_)));
    assert!(store.list_sources().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_query_ranks_and_filters() {
    let (_tmp, store) = open_store().await;
    let (a, ca) = document("a", &[vec![1.0, 0.0], vec![0.0, 1.0]]);
    let (b, cb) = document("b", &[vec![0.8, 0.6]]);
    store.upsert(&a, &ca).await.unwrap();
    store.upsert(&b, &cb).await.unwrap();

    let hits = store.query(&[1.0, 0.0], 10, &QueryFilter::all()).await.unwrap();
    let order: Vec<(&str, usize)> = hits
        .iter()
        .map(|h| (h.chunk.source.as_str(), h.chunk.index))
        .collect();
    assert_eq!(order, vec![("a", 0), ("b", 0), ("a", 1)]);
    assert_eq!(hits.iter().map(|h| h.rank).collect::<Vec<_>>(), vec![1, 2, 3]);

    let top = store.query(&[1.0, 0.0], 1, &QueryFilter::all()).await.unwrap();
    assert_eq!(top.len(), 1);

    let only_b = QueryFilter {
        sources: Some(vec!["b".to_string()]),
    };
    let hits = store.query(&[1.0, 0.0], 10, &only_b).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.source, "b");
}

#[tokio::test]
async fn test_delete_and_missing_source() {
    let (_tmp, store) = open_store().await;
    let (doc, chunks) = document("a", &[vec![1.0], vec![1.0]]);
    store.upsert(&doc, &chunks).await.unwrap();

    assert_eq!(store.delete("a").await.unwrap(), 2);
    assert!(store.chunks_for("a").await.unwrap().is_empty());
    assert!(store.document("a").await.unwrap().is_none());

    match store.delete("a").await {
        Err(CopilotError::NotFound { source_name }) => assert_eq!(source_name, "a"),
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reset_and_list_order() {
    let (_tmp, store) = open_store().await;
    for name in ["zeta", "alpha", "mid"] {
        let (doc, chunks) = document(name, &[vec![1.0]]);
        store.upsert(&doc, &chunks).await.unwrap();
    }

    let names: Vec<String> = store
        .list_sources()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.source)
        .collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);

    assert_eq!(store.reset().await.unwrap(), 3);
    assert!(store.list_sources().await.unwrap().is_empty());
    assert!(store.query(&[1.0], 5, &QueryFilter::all()).await.unwrap().is_empty());
    assert_eq!(store.reset().await.unwrap(), 0);
}

#[tokio::test]
async fn test_reopen_keeps_data() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal();
    config.db.path = tmp.path().join("copilot.sqlite");

    {
        let store = SqliteStore::open(&config).await.unwrap();
        let (doc, chunks) = document("kept", &[vec![0.0, 1.0]]);
        store.upsert(&doc, &chunks).await.unwrap();
        store.pool().close().await;
    }

    let store = SqliteStore::open(&config).await.unwrap();
    let chunks = store.chunks_for("kept").await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].embedding, vec![0.0, 1.0]);
}

struct EchoFirstSource;

#[async_trait]
impl LanguageModel for EchoFirstSource {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        Ok("Attention weighs every token against every other token [1].".to_string())
    }
}

#[tokio::test]
async fn test_copilot_over_sqlite() {
    let (_tmp, store) = open_store().await;
    let store = Arc::new(store);
    let copilot = Copilot::new(
        Arc::clone(&store) as Arc<dyn VectorStore>,
        Arc::new(HashedEmbedder::new(512)),
        Arc::new(EchoFirstSource),
        EngineConfig::default(),
    )
    .unwrap();

    let pages = vec![
        Page {
            number: 1,
            text: "Self attention weighs every token against every other token.".into(),
        },
        Page {
            number: 2,
            text: "Positional encodings inject order information.".into(),
        },
    ];
    let report = copilot
        .ingest_pages("attention.pdf", ContentType::Pdf, pages)
        .await
        .unwrap();
    assert_eq!(report.chunks, 1);

    let stored = store.document("attention.pdf").await.unwrap().unwrap();
    assert_eq!(stored.content_hash, report.content_hash);

    let response = copilot
        .ask("How does self attention weigh each token?", None, None)
        .await
        .unwrap();
    match &response.answer {
        Answer::Valid { citations, evidence, .. } => {
            assert_eq!(citations, &vec![1]);
            assert_eq!(evidence[0].chunk.source, "attention.pdf");
            assert_eq!(evidence[0].chunk.page, Some(1));
        }
        other => panic!("expected a valid answer, got {:?}", other),
    }

    assert_eq!(copilot.delete_document("attention.pdf").await.unwrap(), 1);
    let response = copilot
        .ask("How does self attention weigh each token?", None, None)
        .await
        .unwrap();
    assert_eq!(response.answer.status(), "insufficient_evidence");
}

#[tokio::test]
async fn test_query_during_reingest_sees_one_version() {
    let (_tmp, store) = open_store().await;
    let store = Arc::new(store);
    let chunking = ChunkingConfig {
        max_chunk_chars: 60,
        overlap_chars: 10,
    };
    let copilot = Arc::new(
        Copilot::new(
            Arc::clone(&store) as Arc<dyn VectorStore>,
            Arc::new(HashedEmbedder::new(256)),
            Arc::new(EchoFirstSource),
            EngineConfig {
                chunking,
                ..EngineConfig::default()
            },
        )
        .unwrap(),
    );

    let old_text = "oldtag glacier note. ".repeat(12);
    let new_text = "newtag glacier desert note. ".repeat(9);
    copilot.ingest_text(&old_text, Some("doc")).await.unwrap();

    let texts_of = |text: &str| -> HashSet<String> {
        chunk_text(&normalize_text(text), &chunking)
            .unwrap()
            .into_iter()
            .map(|d| d.text)
            .collect()
    };
    let (old_set, new_set) = (texts_of(&old_text), texts_of(&new_text));

    let writer = {
        let copilot = Arc::clone(&copilot);
        let (old_text, new_text) = (old_text.clone(), new_text.clone());
        tokio::spawn(async move {
            for i in 0..20 {
                let text = if i % 2 == 0 { &new_text } else { &old_text };
                copilot.ingest_text(text, Some("doc")).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let query = HashedEmbedder::new(256).embed("glacier note").await.unwrap();
    for _ in 0..20 {
        let hits: HashSet<String> = store
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
