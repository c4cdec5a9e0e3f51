//! Streaming answer delivery with end-of-stream citation validation.
//!
//! [`StreamingCoordinator`] is the pure state machine:
//!
//! ```text
//! STREAMING --finish--> COMPLETE | COMPLETE_WITH_WARNING
//!     \------fail-----> FAILED
//! ```
//!
//! Increments are forwarded as they arrive and are never validated on
//! their own, since a marker may be split across increments. The full
//! text is validated once, on finish. Text already delivered is never
//! retracted; a warning or failure only adds terminal metadata.
//!
//! [`AnswerStream`] is the transport-neutral consumer side: a
//! `futures::Stream` of [`StreamEvent`]s fed by [`drive`], which can be
//! cancelled through a [`CancelHandle`] or by dropping the stream.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::citation::validate;
use crate::error::Result;
use crate::models::EvidenceItem;
use crate::prompt::is_insufficient_marker;
use crate::synth::TextStream;

/// Reason recorded when the consumer cancels.
pub const CANCELLED_REASON: &str = "cancelled";

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StreamState {
    Streaming,
    Complete,
    CompleteWithWarning { invalid: Vec<u32> },
    Failed { reason: String },
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamState::Streaming)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamState::Streaming => "streaming",
            StreamState::Complete => "complete",
            StreamState::CompleteWithWarning { .. } => "complete_with_warning",
            StreamState::Failed { .. } => "failed",
        }
    }
}

/// Terminal summary of one streamed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOutcome {
    pub turn_id: String,
    pub state: StreamState,
    /// Everything delivered so far, verbatim.
    pub text: String,
    pub citations: Vec<u32>,
    pub insufficient_evidence: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The evidence supplied to the model; sent first.
    Evidence(Vec<EvidenceItem>),
    Delta(String),
    /// Always the last event.
    Terminal(StreamOutcome),
}

/// Per-request state machine. Holds the accumulated text and the ids that
/// were supplied to the model.
#[derive(Debug, Clone)]
pub struct StreamingCoordinator {
    turn_id: String,
    supplied: Vec<u32>,
    text: String,
    state: StreamState,
    citations: Vec<u32>,
    insufficient: bool,
}

impl StreamingCoordinator {
    pub fn new(turn_id: &str, supplied: Vec<u32>) -> Self {
        Self {
            turn_id: turn_id.to_string(),
            supplied,
            text: String::new(),
            state: StreamState::Streaming,
            citations: Vec::new(),
            insufficient: false,
        }
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Accept an increment. Returns `false` once the stream is terminal.
    pub fn push(&mut self, delta: &str) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.text.push_str(delta);
        true
    }

    /// Validate the full text and settle on a completed state. A second
    /// call returns the existing outcome unchanged.
    pub fn finish(&mut self) -> StreamOutcome {
        if !self.state.is_terminal() {
            if is_insufficient_marker(&self.text).is_some() {
                self.insufficient = true;
                self.state = StreamState::Complete;
            } else {
                let report = validate(&self.text, &self.supplied);
                self.state = if report.is_valid() {
                    StreamState::Complete
                } else {
                    StreamState::CompleteWithWarning {
                        invalid: report.invalid.clone(),
                    }
                };
                self.citations = report.cited;
            }
        }
        self.outcome()
    }

    /// Settle on `FAILED`. Delivered text is kept.
    pub fn fail(&mut self, reason: &str) -> StreamOutcome {
        if !self.state.is_terminal() {
            self.state = StreamState::Failed {
                reason: reason.to_string(),
            };
        }
        self.outcome()
    }

    fn outcome(&self) -> StreamOutcome {
        StreamOutcome {
            turn_id: self.turn_id.clone(),
            state: self.state.clone(),
            text: self.text.clone(),
            citations: self.citations.clone(),
            insufficient_evidence: self.insufficient,
        }
    }
}

/// Cancels an in-flight [`AnswerStream`]. Cloneable; any clone cancels.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Consumer half of a streamed answer.
pub struct AnswerStream {
    turn_id: String,
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancelHandle,
}

impl AnswerStream {
    /// Create the consumer half together with the pieces [`drive`] needs.
    pub fn channel(turn_id: &str) -> (Self, mpsc::Sender<StreamEvent>, watch::Receiver<bool>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let stream = Self {
            turn_id: turn_id.to_string(),
            rx,
            cancel: CancelHandle {
                tx: Arc::new(cancel_tx),
            },
        };
        (stream, tx, cancel_rx)
    }

    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Drain the stream and return its terminal outcome.
    pub async fn collect_outcome(mut self) -> Option<StreamOutcome> {
        while let Some(event) = self.next().await {
            if let StreamEvent::Terminal(outcome) = event {
                return Some(outcome);
            }
        }
        None
    }
}

impl Stream for AnswerStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Every handle is gone, so nobody is listening any more.
            return;
        }
    }
}

/// Send one event unless the consumer cancels first.
async fn emit(
    events: &mpsc::Sender<StreamEvent>,
    cancel: &mut watch::Receiver<bool>,
    event: StreamEvent,
) -> bool {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

/// Pump `upstream` through `coordinator` into `events` until the model
/// finishes, errors, or the consumer cancels. Returns the terminal outcome,
/// which is also sent as the final event when the consumer is still there.
///
/// On cancellation the upstream stream is dropped immediately, which
/// releases the underlying model request.
pub async fn drive<F>(
    mut coordinator: StreamingCoordinator,
    evidence: Vec<EvidenceItem>,
    upstream: F,
    events: mpsc::Sender<StreamEvent>,
    mut cancel: watch::Receiver<bool>,
) -> StreamOutcome
where
    F: Future<Output = Result<TextStream>> + Send,
{
    let outcome = pump(&mut coordinator, evidence, upstream, &events, &mut cancel).await;

    match &outcome.state {
        StreamState::Complete => info!(turn = %outcome.turn_id, "stream complete"),
        StreamState::CompleteWithWarning { invalid } => {
            warn!(turn = %outcome.turn_id, ?invalid, "stream complete with invalid citations")
        }
        StreamState::Failed { reason } => warn!(turn = %outcome.turn_id, %reason, "stream failed"),
        StreamState::Streaming => {}
    }

    // The consumer may be gone or may have cancelled with a full buffer
    // it will never drain; the outcome is still returned to the caller.
    let terminal = StreamEvent::Terminal(outcome.clone());
    if *cancel.borrow() {
        let _ = events.try_send(terminal);
    } else {
        emit(&events, &mut cancel, terminal).await;
    }
    outcome
}

async fn pump<F>(
    coordinator: &mut StreamingCoordinator,
    evidence: Vec<EvidenceItem>,
    upstream: F,
    events: &mpsc::Sender<StreamEvent>,
    cancel: &mut watch::Receiver<bool>,
) -> StreamOutcome
where
    F: Future<Output = Result<TextStream>> + Send,
{
    if !emit(events, cancel, StreamEvent::Evidence(evidence)).await {
        return coordinator.fail(CANCELLED_REASON);
    }

    let opened = tokio::select! {
        biased;
        _ = cancelled(cancel) => return coordinator.fail(CANCELLED_REASON),
        opened = upstream => opened,
    };
    let mut upstream = match opened {
        Ok(s) => s,
        Err(e) => return coordinator.fail(&e.to_string()),
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled(cancel) => return coordinator.fail(CANCELLED_REASON),
            next = upstream.next() => next,
        };
        match next {
            Some(Ok(delta)) => {
                if delta.is_empty() {
                    continue;
                }
                coordinator.push(&delta);
                if !emit(events, cancel, StreamEvent::Delta(delta)).await {
                    debug!("consumer went away mid-stream");
                    return coordinator.fail(CANCELLED_REASON);
                }
            }
            Some(Err(e)) => return coordinator.fail(&e.to_string()),
            None => return coordinator.finish(),
        }
    }
}
