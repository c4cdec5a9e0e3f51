//! # Research Copilot Core
//!
//! Retrieval and grounded-generation pipeline for Research Copilot:
//! chunking, the vector-store abstraction, retrieval, citation-enforced
//! synthesis, streaming, and conversation memory.
//!
//! External collaborators are traits: [`embedding::Embedder`],
//! [`synth::LanguageModel`] and [`store::VectorStore`]. Concrete network
//! providers and the SQLite store live in the `research-copilot` app
//! crate; this crate carries only in-memory and offline implementations.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use research_copilot_core::embedding::HashedEmbedder;
//! use research_copilot_core::engine::{Copilot, EngineConfig};
//! use research_copilot_core::store::InMemoryStore;
//! # use research_copilot_core::synth::LanguageModel;
//! # async fn run(model: Arc<dyn LanguageModel>) -> research_copilot_core::error::Result<()> {
//! let copilot = Copilot::new(
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(HashedEmbedder::new(256)),
//!     model,
//!     EngineConfig::default(),
//! )?;
//! copilot.ingest_text("Rust has no garbage collector.", Some("notes")).await?;
//! let reply = copilot.ask("Does Rust have a GC?", None, None).await?;
//! println!("{}", reply.answer.text());
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod citation;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod memory;
pub mod models;
pub mod prompt;
pub mod retrieve;
pub mod store;
pub mod stream;
pub mod synth;

pub use engine::{AskResponse, Copilot, EngineConfig, IngestReport};
pub use error::{CopilotError, Result};
pub use synth::Answer;
