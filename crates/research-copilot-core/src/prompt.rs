//! Prompt construction for citation-constrained answers.

use crate::citation::CitationReport;
use crate::memory::Turn;
use crate::retrieve::EvidenceSet;

/// Prefix a model uses to decline when the evidence does not answer.
pub const INSUFFICIENT_EVIDENCE_MARKER: &str = "INSUFFICIENT_EVIDENCE";

/// Reason given when retrieval produced no evidence at all.
pub const NO_EVIDENCE_REASON: &str = "No relevant chunks retrieved.";

/// Fixed answer text for [`NO_EVIDENCE_REASON`].
pub fn insufficient_text(reason: &str) -> String {
    format!("{}: {}", INSUFFICIENT_EVIDENCE_MARKER, reason)
}

/// If `text` is a declined answer, return its reason.
pub fn is_insufficient_marker(text: &str) -> Option<String> {
    let rest = text.trim_start().strip_prefix(INSUFFICIENT_EVIDENCE_MARKER)?;
    let reason = rest.trim_start_matches(':').trim();
    Some(if reason.is_empty() {
        "the evidence does not answer the question".to_string()
    } else {
        reason.to_string()
    })
}

pub fn build_prompt(question: &str, evidence: &EvidenceSet, history: &[Turn]) -> String {
    let blocks: Vec<String> = evidence
        .items
        .iter()
        .map(|item| {
            let page = match item.chunk.page {
                Some(p) => format!(" | page {}", p),
                None => String::new(),
            };
            format!(
                "[{}] SOURCE: {}{}\nEVIDENCE:\n{}\n",
                item.rank,
                item.chunk.source,
                page,
                item.chunk.text.trim()
            )
        })
        .collect();

    let mut prompt = String::from("You are Research Copilot.\n\n");
    prompt.push_str("You must answer using ONLY the EVIDENCE blocks below.\n");
    prompt.push_str("If the evidence does not contain the answer, output exactly:\n");
    prompt.push_str(&format!("{}: <what is missing>\n\n", INSUFFICIENT_EVIDENCE_MARKER));
    prompt.push_str("EVIDENCE:\n");
    prompt.push_str(&blocks.join("\n"));

    if !history.is_empty() {
        prompt.push_str("\nCONVERSATION SO FAR (context only; its citations refer to older evidence and must not be reused):\n");
        for turn in history {
            prompt.push_str(&format!("User: {}\nAssistant: {}\n", turn.query.trim(), turn.answer.trim()));
        }
    }

    let ids: Vec<String> = evidence.ids().iter().map(|id| format!("[{}]", id)).collect();
    prompt.push_str(&format!(
        "\nQUESTION:\n{}\n\nSTRICT RULES (must follow):\n\
         - Do NOT use outside knowledge.\n\
         - Do NOT guess.\n\
         - Every sentence MUST end with citations like [1] or [1][2].\n\
         - The only valid citations are: {}.\n\
         - Only cite evidence blocks that directly support that sentence.\n\
         - If you cannot cite a sentence, do not write it.\n\n\
         OUTPUT FORMAT (exact headings):\n\
         SIMPLE_EXPLANATION:\n<2-4 sentences, each ends with citations>\n\n\
         TECHNICAL_EXPLANATION:\n<2-4 sentences, each ends with citations>\n\n\
         KEY_EVIDENCE:\n\
         - <1 bullet quoting/paraphrasing the most relevant evidence> [#]\n\
         - <optional 2nd bullet> [#]\n",
        question.trim(),
        ids.join(", ")
    ));
    prompt
}

/// Re-ask after a rule violation, naming what went wrong.
pub fn repair_prompt(prompt: &str, report: &CitationReport) -> String {
    let mut out = String::from(prompt);
    out.push_str("\nREPAIR INSTRUCTIONS:\n");
    out.push_str("- Your previous answer violated the citation rules.\n");
    if !report.invalid.is_empty() {
        let bad: Vec<String> = report.invalid.iter().map(|id| format!("[{}]", id)).collect();
        out.push_str(&format!(
            "- These citations do not exist and must not be used: {}.\n",
            bad.join(", ")
        ));
    }
    if report.is_missing() {
        out.push_str("- Your answer contained no citations.\n");
    }
    out.push_str("- Rewrite the entire answer strictly following the rules.\n");
    out.push_str("- Every sentence must end with citations like [1] or [1][2].\n");
    out.push_str(&format!(
        "- If you cannot answer from evidence, output {}.\n",
        INSUFFICIENT_EVIDENCE_MARKER
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::citation::validate;
    use crate::models::{Chunk, ChunkDraft, EvidenceItem};

    fn evidence() -> EvidenceSet {
        let items = ["alpha text", "beta text"]
            .iter()
            .enumerate()
            .map(|(i, t)| EvidenceItem {
                chunk: Chunk::from_draft(
                    "paper.pdf",
                    ChunkDraft {
                        index: i,
                        text: t.to_string(),
                        start: 0,
                        end: t.len(),
                        overlap: 0,
                        page: Some(i as u32 + 1),
                        hash: String::new(),
                    },
                    vec![],
                ),
                score: 0.9,
                rank: i + 1,
            })
            .collect();
        EvidenceSet { items }
    }

    #[test]
    fn test_prompt_enumerates_evidence_with_ids() {
        let p = build_prompt("What is alpha?", &evidence(), &[]);
        assert!(p.contains("[1] SOURCE: paper.pdf | page 1\nEVIDENCE:\nalpha text"));
        assert!(p.contains("[2] SOURCE: paper.pdf | page 2"));
        assert!(p.contains("The only valid citations are: [1], [2]."));
        assert!(p.contains("QUESTION:\nWhat is alpha?"));
        assert!(!p.contains("CONVERSATION SO FAR"));
    }

    #[test]
    fn test_prompt_includes_history() {
        let history = vec![Turn::new("earlier q", "earlier a [1]", vec![], vec![1])];
        let p = build_prompt("follow up", &evidence(), &history);
        assert!(p.contains("User: earlier q\nAssistant: earlier a [1]"));
    }

    #[test]
    fn test_repair_names_bad_ids() {
        let report = validate("claim [9]", &[1, 2]);
        let p = repair_prompt("BASE", &report);
        assert!(p.starts_with("BASE\nREPAIR INSTRUCTIONS:"));
        assert!(p.contains("[9]"));
    }

    #[test]
    fn test_insufficient_marker() {
        assert_eq!(
            is_insufficient_marker("INSUFFICIENT_EVIDENCE: no dates given").as_deref(),
            Some("no dates given")
        );
        assert!(is_insufficient_marker("  INSUFFICIENT_EVIDENCE").is_some());
        assert!(is_insufficient_marker("The answer is [1].").is_none());
        assert_eq!(
            insufficient_text(NO_EVIDENCE_REASON),
            "INSUFFICIENT_EVIDENCE: No relevant chunks retrieved."
        );
    }
}
