//! # Research Copilot
//!
//! A local-first research copilot: ingest PDFs and notes, then ask
//! questions answered only from that material, with every claim citing
//! the evidence it came from.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │ PDF / text  │──▶│ Chunk+Embed  │──▶│  SQLite  │
//! │  ingest     │   │  (core)      │   │ vectors  │
//! └─────────────┘   └──────────────┘   └────┬─────┘
//!                                           │ retrieve
//!                                           ▼
//!                   ┌──────────────┐   ┌──────────┐
//!                   │ LLM (Ollama) │◀──│ Prompt + │
//!                   │              │──▶│ citations│
//!                   └──────────────┘   └────┬─────┘
//!                          ┌────────────────┤
//!                          ▼                ▼
//!                     ┌──────────┐    ┌──────────┐
//!                     │   CLI    │    │   HTTP   │
//!                     │(copilot) │    │ (axum)   │
//!                     └──────────┘    └──────────┘
//! ```
//!
//! The pipeline itself (chunking, retrieval, synthesis, streaming, memory)
//! lives in `research_copilot_core`; this crate supplies the concrete
//! store, providers, and surfaces.
//!
//! ## Quick Start
//!
//! ```bash
//! copilot init
//! copilot ingest pdf ./papers/attention.pdf
//! copilot ask "What does multi-head attention add?" --stream
//! copilot serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | Durable vector store |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | Language-model gateways |
//! | [`extract`] | PDF text extraction |
//! | [`app`] | Engine wiring |
//! | [`ingest`], [`ask`], [`documents`] | CLI commands |
//! | [`server`] | HTTP server |

pub mod app;
pub mod ask;
pub mod config;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod server;
pub mod sqlite_store;
