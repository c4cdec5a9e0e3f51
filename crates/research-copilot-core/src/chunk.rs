//! Overlapping, boundary-aware text chunker.
//!
//! Splits document text into [`ChunkDraft`]s of at most `max_chunk_chars`
//! characters. Consecutive chunks share exactly `overlap_chars` characters,
//! and every chunk is a verbatim slice of the input, so de-overlapping and
//! concatenating the chunks reproduces the input exactly (see
//! [`reconstruct`]).
//!
//! # Algorithm
//!
//! 1. Open a window of `max_chunk_chars` characters at the current start.
//! 2. If the window reaches the end of the text, emit it and stop.
//! 3. Otherwise snap the window end back to the last paragraph break,
//!    else the last sentence end, else the last whitespace. Paragraph and
//!    sentence breaks count anywhere past the overlap. A whitespace snap is
//!    only taken if the chunk keeps at least half the window; otherwise the
//!    window is hard-cut.
//! 4. Start the next window `overlap_chars` before the end just emitted.
//!
//! Offsets are character offsets, not byte offsets, so multi-byte UTF-8
//! text never splits inside a code point.
//!
//! # Example
//!
//! ```rust
//! use research_copilot_core::chunk::{chunk_text, reconstruct, ChunkingConfig};
//!
//! let cfg = ChunkingConfig { max_chunk_chars: 40, overlap_chars: 10 };
//! let text = "First paragraph here.\n\nSecond paragraph, a bit longer than the first.";
//! let chunks = chunk_text(text, &cfg).unwrap();
//! assert!(chunks.len() > 1);
//! assert_eq!(reconstruct(&chunks), text);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{CopilotError, Result};
use crate::models::{sha256_hex, ChunkDraft, Page};

/// Separator inserted between extracted pages.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Chunk size and overlap, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub max_chunk_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 900,
            overlap_chars: 150,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_chars == 0 {
            return Err(CopilotError::InvalidInput(
                "max_chunk_chars must be > 0".to_string(),
            ));
        }
        if self.overlap_chars >= self.max_chunk_chars {
            return Err(CopilotError::InvalidInput(format!(
                "overlap_chars ({}) must be < max_chunk_chars ({})",
                self.overlap_chars, self.max_chunk_chars
            )));
        }
        Ok(())
    }

    /// Smallest chunk length a paragraph or sentence snap may produce.
    fn min_structural_len(&self) -> usize {
        self.overlap_chars + 1
    }

    /// Smallest chunk length a whitespace snap may produce.
    fn min_word_len(&self) -> usize {
        (self.max_chunk_chars / 2).max(self.min_structural_len())
    }
}

/// Chunk plain text. Chunks carry no page number.
///
/// Returns an empty vector for empty input; a chunk is never empty.
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Result<Vec<ChunkDraft>> {
    chunk_with_pages(text, &[], config)
}

/// Join pages with [`PAGE_SEPARATOR`] and chunk the result.
///
/// Pages whose text is blank are skipped. Each chunk records the page its
/// first character belongs to, even when the chunk runs onto the next page.
/// Returns the joined document text alongside the chunks.
pub fn chunk_pages(pages: &[Page], config: &ChunkingConfig) -> Result<(String, Vec<ChunkDraft>)> {
    let mut content = String::new();
    let mut page_starts: Vec<(usize, u32)> = Vec::new();
    let mut offset = 0usize;

    for page in pages.iter().filter(|p| !p.text.trim().is_empty()) {
        if !content.is_empty() {
            content.push_str(PAGE_SEPARATOR);
            offset += PAGE_SEPARATOR.chars().count();
        }
        page_starts.push((offset, page.number));
        content.push_str(&page.text);
        offset += page.text.chars().count();
    }

    let chunks = chunk_with_pages(&content, &page_starts, config)?;
    Ok((content, chunks))
}

fn chunk_with_pages(
    text: &str,
    page_starts: &[(usize, u32)],
    config: &ChunkingConfig,
) -> Result<Vec<ChunkDraft>> {
    config.validate()?;

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    // byte_at[i] is the byte offset of char i; byte_at[total] == text.len().
    let byte_at: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut prev_end = 0usize;

    while start < total {
        let window_end = (start + config.max_chunk_chars).min(total);
        let end = if window_end == total {
            total
        } else {
            snap_end(&chars, start, window_end, config)
        };

        let overlap = if chunks.is_empty() { 0 } else { prev_end - start };
        let slice = &text[byte_at[start]..byte_at[end]];

        chunks.push(ChunkDraft {
            index: chunks.len(),
            text: slice.to_string(),
            start,
            end,
            overlap,
            page: page_for(page_starts, start),
            hash: sha256_hex(slice.as_bytes()),
        });

        if end == total {
            break;
        }
        prev_end = end;
        start = end - config.overlap_chars;
    }

    Ok(chunks)
}

/// Pick the chunk end inside `(start + overlap ..= window_end)`.
///
/// The end always lies past `start + overlap_chars`, so the next window
/// starts strictly after this one.
fn snap_end(chars: &[char], start: usize, window_end: usize, config: &ChunkingConfig) -> usize {
    let candidates = |min_len: usize| (start + min_len..=window_end).rev();
    let structural = config.min_structural_len();

    // Paragraph break: end just after a blank line.
    if let Some(e) =
        candidates(structural).find(|&e| e >= 2 && chars[e - 1] == '\n' && chars[e - 2] == '\n')
    {
        return e;
    }
    // Sentence end: terminal punctuation followed by whitespace.
    if let Some(e) = candidates(structural).find(|&e| {
        e >= 2 && chars[e - 1].is_whitespace() && matches!(chars[e - 2], '.' | '!' | '?')
    }) {
        return e;
    }
    // Word boundary, only when it keeps at least half the window.
    if let Some(e) =
        candidates(config.min_word_len()).find(|&e| e >= 1 && chars[e - 1].is_whitespace())
    {
        return e;
    }
    window_end
}

fn page_for(page_starts: &[(usize, u32)], offset: usize) -> Option<u32> {
    page_starts
        .iter()
        .take_while(|(start, _)| *start <= offset)
        .last()
        .map(|(_, number)| *number)
}

/// Rebuild the source text from ordered chunks by dropping each chunk's
/// overlapping prefix.
pub fn reconstruct(chunks: &[ChunkDraft]) -> String {
    let mut out = String::new();
    for c in chunks {
        out.extend(c.text.chars().skip(c.overlap));
    }
    out
}

/// Tidy extracted or pasted text: trim each line, collapse runs of
/// spaces/tabs, and keep at most one blank line between paragraphs.
pub fn normalize_text(raw: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = false;

    for line in raw.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            if !lines.is_empty() && !blank_run {
                lines.push(String::new());
            }
            blank_run = true;
        } else {
            lines.push(collapsed);
            blank_run = false;
        }
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}
