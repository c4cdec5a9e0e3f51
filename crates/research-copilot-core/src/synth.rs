//! Citation-enforced answer synthesis.
//!
//! The model is only ever asked to answer from supplied evidence. With no
//! evidence the model is not called at all. Model output is checked by
//! [`classify`]; a violation triggers up to `repair_attempts` re-prompts,
//! after which the last output is surfaced with its warning rather than
//! suppressed.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::citation::{validate, CitationReport};
use crate::error::{CopilotError, Result};
use crate::memory::Turn;
use crate::models::EvidenceItem;
use crate::prompt::{
    build_prompt, insufficient_text, is_insufficient_marker, repair_prompt, NO_EVIDENCE_REASON,
};
use crate::retrieve::EvidenceSet;

/// Lazy, finite, non-restartable sequence of text increments.
pub type TextStream = BoxStream<'static, Result<String>>;

/// External language-model gateway. Failures surface as
/// [`CopilotError::ModelUnavailable`].
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Stream the completion. The default delivers the blocking result as
    /// one increment.
    async fn generate_stream(&self, prompt: &str) -> Result<TextStream> {
        let text = self.generate(prompt).await?;
        Ok(stream::once(async move { Ok::<_, CopilotError>(text) }).boxed())
    }
}

/// A synthesized answer. Every consumer must handle all three outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Answer {
    /// Cites at least one supplied id and nothing else.
    Valid {
        text: String,
        citations: Vec<u32>,
        /// Sentences without a marker; informational only.
        uncited_sentences: Vec<String>,
        evidence: Vec<EvidenceItem>,
    },
    /// No grounding was available, or the model declined.
    InsufficientEvidence { reason: String },
    /// Cites an id that was not supplied, or cites nothing.
    InvalidCitations {
        text: String,
        citations: Vec<u32>,
        invalid: Vec<u32>,
        evidence: Vec<EvidenceItem>,
    },
}

impl Answer {
    pub fn insufficient(reason: &str) -> Self {
        Answer::InsufficientEvidence {
            reason: reason.to_string(),
        }
    }

    pub fn text(&self) -> String {
        match self {
            Answer::Valid { text, .. } | Answer::InvalidCitations { text, .. } => text.clone(),
            Answer::InsufficientEvidence { reason } => insufficient_text(reason),
        }
    }

    pub fn citations(&self) -> &[u32] {
        match self {
            Answer::Valid { citations, .. } | Answer::InvalidCitations { citations, .. } => {
                citations
            }
            Answer::InsufficientEvidence { .. } => &[],
        }
    }

    pub fn evidence(&self) -> &[EvidenceItem] {
        match self {
            Answer::Valid { evidence, .. } | Answer::InvalidCitations { evidence, .. } => evidence,
            Answer::InsufficientEvidence { .. } => &[],
        }
    }

    /// Human-readable warning for answers that failed validation.
    pub fn warning(&self) -> Option<String> {
        match self {
            Answer::InvalidCitations { invalid, .. } if invalid.is_empty() => {
                Some("answer contains no citations".to_string())
            }
            Answer::InvalidCitations { invalid, .. } => Some(format!(
                "answer cites evidence that was not supplied: {:?}",
                invalid
            )),
            _ => None,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Answer::Valid { .. } => "valid",
            Answer::InsufficientEvidence { .. } => "insufficient_evidence",
            Answer::InvalidCitations { .. } => "invalid_citations",
        }
    }
}

/// Map raw model output onto an [`Answer`]. Pure and deterministic.
pub fn classify(text: &str, evidence: &EvidenceSet) -> Answer {
    if let Some(reason) = is_insufficient_marker(text) {
        return Answer::InsufficientEvidence { reason };
    }
    let report = validate(text, &evidence.ids());
    answer_from_report(text, report, evidence)
}

fn answer_from_report(text: &str, report: CitationReport, evidence: &EvidenceSet) -> Answer {
    if report.is_valid() {
        Answer::Valid {
            text: text.to_string(),
            citations: report.cited,
            uncited_sentences: report.uncited_sentences,
            evidence: evidence.items.clone(),
        }
    } else {
        Answer::InvalidCitations {
            text: text.to_string(),
            citations: report.cited,
            invalid: report.invalid,
            evidence: evidence.items.clone(),
        }
    }
}

pub struct Synthesizer {
    model: Arc<dyn LanguageModel>,
    repair_attempts: usize,
}

impl Synthesizer {
    pub fn new(model: Arc<dyn LanguageModel>, repair_attempts: usize) -> Self {
        Self {
            model,
            repair_attempts,
        }
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    pub async fn synthesize(
        &self,
        query: &str,
        evidence: &EvidenceSet,
        history: &[Turn],
    ) -> Result<Answer> {
        if evidence.is_empty() {
            debug!("no evidence, skipping model call");
            return Ok(Answer::insufficient(NO_EVIDENCE_REASON));
        }

        let prompt = build_prompt(query, evidence, history);
        let supplied = evidence.ids();
        let mut output = self.model.generate(&prompt).await?;

        for attempt in 1..=self.repair_attempts {
            if is_insufficient_marker(&output).is_some() {
                break;
            }
            let report = validate(&output, &supplied);
            if report.is_fully_grounded() {
                break;
            }
            debug!(
                attempt,
                invalid = ?report.invalid,
                uncited = report.uncited_sentences.len(),
                "citation rules violated, re-prompting"
            );
            output = self.model.generate(&repair_prompt(&prompt, &report)).await?;
        }

        let output = output.trim();
        let answer = classify(output, evidence);
        if let Some(warning) = answer.warning() {
            warn!(model = self.model.model_name(), "{}", warning);
        }
        Ok(answer)
    }
}
