//! Citation marker parsing and validation.
//!
//! Answers cite evidence by rank: `[1]`, `[1][3]` or `[1, 3]`. Validation
//! is pure and deterministic so it can be tested against canned model
//! output and shared by the blocking and streaming paths.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[\s*(\d+(?:\s*,\s*\d+)*)\s*\]").expect("citation pattern is valid")
    })
}

/// Citation ids in order of first appearance, without duplicates.
pub fn parse_citations(text: &str) -> Vec<u32> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for cap in marker_re().captures_iter(text) {
        for part in cap[1].split(',') {
            if let Ok(id) = part.trim().parse::<u32>() {
                if seen.insert(id) {
                    out.push(id);
                }
            }
        }
    }
    out
}

pub fn has_citation(text: &str) -> bool {
    marker_re().is_match(text)
}

/// Outcome of checking an answer against the ids that were supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationReport {
    /// Every id cited, first appearance first.
    pub cited: Vec<u32>,
    /// Cited ids that were not supplied.
    pub invalid: Vec<u32>,
    /// Sentences carrying no citation marker.
    pub uncited_sentences: Vec<String>,
}

impl CitationReport {
    /// At least one citation and none unresolvable.
    pub fn is_valid(&self) -> bool {
        !self.cited.is_empty() && self.invalid.is_empty()
    }

    /// The answer cites nothing at all.
    pub fn is_missing(&self) -> bool {
        self.cited.is_empty()
    }

    /// Valid, and every sentence carries a citation.
    pub fn is_fully_grounded(&self) -> bool {
        self.is_valid() && self.uncited_sentences.is_empty()
    }

    /// Cited ids that were supplied.
    pub fn resolved(&self) -> Vec<u32> {
        self.cited
            .iter()
            .copied()
            .filter(|id| !self.invalid.contains(id))
            .collect()
    }
}

pub fn validate(text: &str, supplied: &[u32]) -> CitationReport {
    let cited = parse_citations(text);
    let invalid = cited
        .iter()
        .copied()
        .filter(|id| !supplied.contains(id))
        .collect();
    let uncited_sentences = sentences(text)
        .into_iter()
        .filter(|s| !has_citation(s))
        .collect();
    CitationReport {
        cited,
        invalid,
        uncited_sentences,
    }
}

/// Heuristic sentence split: one line is at least one sentence, and a
/// line splits after `.`, `!` or `?` followed by whitespace. Section
/// headings such as `KEY_EVIDENCE:` are skipped.
fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || is_heading(line) {
            continue;
        }
        let mut current = String::new();
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            current.push(c);
            let boundary = matches!(c, '.' | '!' | '?')
                && chars.peek().is_some_and(|next| next.is_whitespace());
            if boundary {
                push_sentence(&mut out, &current);
                current.clear();
            }
        }
        push_sentence(&mut out, &current);
    }
    out
}

fn push_sentence(out: &mut Vec<String>, s: &str) {
    let s = s.trim();
    if s.chars().any(|c| c.is_alphanumeric()) {
        out.push(s.to_string());
    }
}

fn is_heading(line: &str) -> bool {
    match line.strip_suffix(':') {
        Some(name) => {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c == '_' || c == ' ')
        }
        None => false,
    }
}
