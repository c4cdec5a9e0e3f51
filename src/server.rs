//! HTTP API over the [`Copilot`] engine.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/ingest/pdf?source=<name>` | Ingest a PDF sent as the raw request body |
//! | `POST` | `/ingest/text` | Ingest pasted text (`{"text", "source_name"?}`) |
//! | `POST` | `/ask` | Grounded answer with sources |
//! | `POST` | `/ask/stream` | Same, as newline-delimited JSON events |
//! | `GET`  | `/documents` | Stored sources with chunk counts |
//! | `DELETE` | `/documents/{source}` | Remove one source |
//! | `POST` | `/documents/reset` | Remove every source |
//! | `POST` | `/sessions` | Open a conversation session |
//! | `DELETE` | `/sessions/{id}` | Drop a session and its memory |
//!
//! # Streaming
//!
//! `/ask/stream` emits one JSON object per line: a `sources` event first,
//! then `token` events as the model produces text, then exactly one `done`
//! event carrying the terminal state (`complete`, `complete_with_warning`,
//! or `failed`). Closing the connection cancels generation.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "source not found: paper.pdf" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request` | 400 |
//! | `not_found` | 404 |
//! | `cancelled` | 408 |
//! | `conflict` | 409 |
//! | `embedding_unavailable`, `model_unavailable` | 503 |
//! | `store_error` | 500 |

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use research_copilot_core::models::{EvidenceItem, SourceSummary};
use research_copilot_core::stream::{StreamEvent, StreamState};
use research_copilot_core::{Answer, Copilot, CopilotError, IngestReport};

use crate::app::{build_copilot, ingest_pdf};
use crate::config::Config;

/// Characters of chunk text shown per source.
const PREVIEW_CHARS: usize = 240;

/// Upload cap for `/ingest/pdf`.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    copilot: Arc<Copilot>,
}

/// Build the engine from `config` and serve until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let copilot = Arc::new(build_copilot(config).await?);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "listening");
    eprintln!("Research Copilot listening on http://{}", config.server.bind);
    serve(listener, copilot).await
}

/// Serve on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, copilot: Arc<Copilot>) -> anyhow::Result<()> {
    axum::serve(listener, router(copilot)).await?;
    Ok(())
}

pub fn router(copilot: Arc<Copilot>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/ingest/pdf", post(handle_ingest_pdf))
        .route("/ingest/text", post(handle_ingest_text))
        .route("/ask", post(handle_ask))
        .route("/ask/stream", post(handle_ask_stream))
        .route("/documents", get(handle_list_documents))
        .route("/documents/reset", post(handle_reset_documents))
        .route("/documents/{source}", delete(handle_delete_document))
        .route("/sessions", post(handle_create_session))
        .route("/sessions/{id}", delete(handle_end_session))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(AppState { copilot })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<CopilotError> for AppError {
    fn from(err: CopilotError) -> Self {
        let status = match &err {
            CopilotError::NotFound { .. } | CopilotError::SessionNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            CopilotError::Conflict { .. } => StatusCode::CONFLICT,
            CopilotError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CopilotError::EmbeddingUnavailable(_) | CopilotError::ModelUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CopilotError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            CopilotError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(code = err.kind(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

// ============ Shared views ============

/// One piece of evidence as shown to clients. `id` is the citation number.
#[derive(Debug, Serialize)]
struct SourceView {
    id: usize,
    source: String,
    page: Option<u32>,
    score: f32,
    chunk_id: String,
    start: usize,
    end: usize,
    chunk_preview: String,
}

impl From<&EvidenceItem> for SourceView {
    fn from(item: &EvidenceItem) -> Self {
        SourceView {
            id: item.rank,
            source: item.chunk.source.clone(),
            page: item.chunk.page,
            score: item.score,
            chunk_id: item.chunk.id.clone(),
            start: item.chunk.start,
            end: item.chunk.end,
            chunk_preview: item.preview(PREVIEW_CHARS),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Ingest ============

#[derive(Deserialize)]
struct IngestPdfParams {
    source: Option<String>,
}

async fn handle_ingest_pdf(
    State(state): State<AppState>,
    Query(params): Query<IngestPdfParams>,
    body: Bytes,
) -> Result<Json<IngestReport>, AppError> {
    let source = params
        .source
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| bad_request("source query parameter is required"))?;
    if body.is_empty() {
        return Err(bad_request("request body must contain a PDF"));
    }
    let report = ingest_pdf(&state.copilot, body.to_vec(), &source).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct IngestTextRequest {
    text: String,
    #[serde(default, alias = "source")]
    source_name: Option<String>,
}

async fn handle_ingest_text(
    State(state): State<AppState>,
    Json(req): Json<IngestTextRequest>,
) -> Result<Json<IngestReport>, AppError> {
    let report = state
        .copilot
        .ingest_text(&req.text, req.source_name.as_deref())
        .await?;
    Ok(Json(report))
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct AskResponseBody {
    turn_id: String,
    session_id: Option<String>,
    status: &'static str,
    answer: String,
    citations: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
    sources: Vec<SourceView>,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponseBody>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let response = state
        .copilot
        .ask(&req.question, req.session_id.as_deref(), req.top_k)
        .await?;

    let answer: &Answer = &response.answer;
    Ok(Json(AskResponseBody {
        turn_id: response.turn_id.clone(),
        session_id: response.session_id.clone(),
        status: answer.status(),
        answer: answer.text(),
        citations: answer.citations().to_vec(),
        warning: answer.warning(),
        sources: answer.evidence().iter().map(SourceView::from).collect(),
    }))
}

// ============ POST /ask/stream ============

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamLine {
    Sources {
        turn_id: String,
        sources: Vec<SourceView>,
    },
    Token {
        text: String,
    },
    Done {
        turn_id: String,
        state: &'static str,
        citations: Vec<u32>,
        insufficient_evidence: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        invalid: Option<Vec<u32>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl StreamLine {
    fn from_event(turn_id: &str, event: StreamEvent) -> Self {
        match event {
            StreamEvent::Evidence(items) => StreamLine::Sources {
                turn_id: turn_id.to_string(),
                sources: items.iter().map(SourceView::from).collect(),
            },
            StreamEvent::Delta(text) => StreamLine::Token { text },
            StreamEvent::Terminal(outcome) => {
                let state = outcome.state.name();
                let (invalid, reason) = match outcome.state {
                    StreamState::CompleteWithWarning { invalid } => (Some(invalid), None),
                    StreamState::Failed { reason } => (None, Some(reason)),
                    StreamState::Complete | StreamState::Streaming => (None, None),
                };
                StreamLine::Done {
                    turn_id: outcome.turn_id,
                    state,
                    citations: outcome.citations,
                    insufficient_evidence: outcome.insufficient_evidence,
                    invalid,
                    reason,
                }
            }
        }
    }

    fn to_ndjson(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"type\":\"done\",\"state\":\"failed\",\"reason\":\"encode error: {}\"}}",
                e
            )
        });
        line.push('\n');
        line
    }
}

async fn handle_ask_stream(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Response, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let answer_stream = state
        .copilot
        .ask_stream(&req.question, req.session_id.as_deref(), req.top_k)
        .await?;

    let turn_id = answer_stream.turn_id().to_string();
    let lines = answer_stream.map(move |event| {
        Ok::<_, std::convert::Infallible>(StreamLine::from_event(&turn_id, event).to_ndjson())
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

// ============ Documents ============

#[derive(Serialize)]
struct DocumentsResponse {
    documents: Vec<SourceSummary>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
) -> Result<Json<DocumentsResponse>, AppError> {
    Ok(Json(DocumentsResponse {
        documents: state.copilot.list_documents().await?,
    }))
}

#[derive(Serialize)]
struct DeleteResponse {
    source: String,
    chunks_removed: usize,
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let removed = state.copilot.delete_document(&source).await?;
    Ok(Json(DeleteResponse {
        source,
        chunks_removed: removed,
    }))
}

#[derive(Serialize)]
struct ResetResponse {
    sources_removed: usize,
}

async fn handle_reset_documents(
    State(state): State<AppState>,
) -> Result<Json<ResetResponse>, AppError> {
    Ok(Json(ResetResponse {
        sources_removed: state.copilot.reset_documents().await?,
    }))
}

// ============ Sessions ============

#[derive(Serialize)]
struct SessionResponse {
    session_id: String,
}

async fn handle_create_session(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<SessionResponse>), AppError> {
    let session_id = state.copilot.create_session()?;
    Ok((StatusCode::CREATED, Json(SessionResponse { session_id })))
}

async fn handle_end_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.copilot.end_session(&id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CopilotError::SessionNotFound { session_id: id }.into())
    }
}
