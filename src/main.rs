//! # Research Copilot CLI (`copilot`)
//!
//! ## Usage
//!
//! ```bash
//! copilot --config ./config/copilot.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `copilot init` | Create the SQLite database and run schema migrations |
//! | `copilot ingest pdf <path>` | Extract and ingest a PDF |
//! | `copilot ingest text <path>` | Ingest a plain-text file |
//! | `copilot ask "<question>"` | Answer from ingested material, with citations |
//! | `copilot documents list` | List stored sources |
//! | `copilot documents show <source>` | Print a source's chunks |
//! | `copilot documents delete <source>` | Remove one source |
//! | `copilot documents reset` | Remove every source |
//! | `copilot serve` | Start the HTTP server |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `warn`).

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use research_copilot::{ask, config, documents, ingest, migrate, server};

/// Research Copilot: grounded, citation-enforced answers over your own
/// documents.
#[derive(Parser)]
#[command(
    name = "copilot",
    about = "Research Copilot: grounded, citation-enforced answers over your own documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/copilot.toml`. See `config/copilot.example.toml`.
    #[arg(long, global = true, default_value = "./config/copilot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Ingest a document, replacing any earlier version with the same source name.
    Ingest {
        #[command(subcommand)]
        kind: IngestKind,
    },

    /// Ask a question answered only from ingested material.
    Ask {
        /// The question.
        question: String,

        /// Number of evidence chunks (clamped to `retrieval.max_top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Print the answer as it is generated.
        #[arg(long)]
        stream: bool,
    },

    /// Inspect and manage stored documents.
    Documents {
        #[command(subcommand)]
        action: DocumentsAction,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum IngestKind {
    /// Extract text from a PDF page by page and ingest it.
    Pdf {
        path: PathBuf,
        /// Source name (defaults to the file name).
        #[arg(long)]
        source: Option<String>,
    },
    /// Ingest a UTF-8 text file.
    Text {
        path: PathBuf,
        /// Source name (defaults to the file name).
        #[arg(long)]
        source: Option<String>,
    },
}

#[derive(Subcommand)]
enum DocumentsAction {
    /// List stored sources with chunk counts.
    List,
    /// Print the chunks of one source.
    Show { source: String },
    /// Remove one source and all of its chunks.
    Delete { source: String },
    /// Remove every source.
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { kind } => match kind {
            IngestKind::Pdf { path, source } => {
                ingest::run_ingest_pdf(&cfg, &path, source).await?;
            }
            IngestKind::Text { path, source } => {
                ingest::run_ingest_text(&cfg, &path, source).await?;
            }
        },
        Commands::Ask {
            question,
            top_k,
            stream,
        } => {
            ask::run_ask(&cfg, &question, top_k, stream).await?;
        }
        Commands::Documents { action } => match action {
            DocumentsAction::List => documents::run_list(&cfg).await?,
            DocumentsAction::Show { source } => documents::run_show(&cfg, &source).await?,
            DocumentsAction::Delete { source } => documents::run_delete(&cfg, &source).await?,
            DocumentsAction::Reset => documents::run_reset(&cfg).await?,
        },
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
