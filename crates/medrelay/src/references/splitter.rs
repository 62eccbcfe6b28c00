//! Separation of trailing citation blocks from generated text
//!
//! Citations start with a blank line followed by a bracketed number:
//!
//! ```text
//! Diagnosis: X.
//!
//! [1] Paper A
//! [2] Paper B
//! ```

use std::sync::LazyLock;

use regex::Regex;

/// Start of a citation block: blank line then `[<digits>]`
static CITATION_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\n\[\d+\]").expect("valid citation boundary regex"));

/// A suffix that may become a boundary once more text arrives
static PARTIAL_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n(?:\n(?:\[\d*)?)?\z").expect("valid partial boundary regex"));

/// A contiguous block of citation lines at the very end of the text
static TRAILING_CITATIONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\n\n(\[\d+\][^\n]*(?:\n+\[\d+\][^\n]*)*)\s*\z")
        .expect("valid trailing citations regex")
});

/// Split finished text into `(body, references)`
///
/// Text without a trailing citation block comes back unchanged with an
/// empty reference string.
pub fn split_references(text: &str) -> (String, String) {
    match TRAILING_CITATIONS.captures(text) {
        Some(caps) => {
            let start = caps.get(0).map_or(text.len(), |m| m.start());
            let references = caps.get(1).map_or("", |m| m.as_str());
            (text[..start].to_string(), references.trim_end().to_string())
        }
        None => (text.to_string(), String::new()),
    }
}

/// Streaming splitter for one relay
///
/// Text before the first boundary passes through; the boundary and
/// everything after it, across all later chunks, is withheld. A chunk
/// ending in what could be the start of a boundary (`\n`, `\n\n`,
/// `\n\n[12`) is held back until the next chunk decides it.
#[derive(Debug, Default)]
pub struct ReferenceSplitter {
    pending: String,
    references: String,
    withholding: bool,
}

impl ReferenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the boundary has been seen
    pub fn is_withholding(&self) -> bool {
        self.withholding
    }

    /// Feed one text increment; returns the part that may be shown now
    pub fn push(&mut self, chunk: &str) -> Option<String> {
        if self.withholding {
            self.references.push_str(chunk);
            return None;
        }

        self.pending.push_str(chunk);

        if let Some(m) = CITATION_BOUNDARY.find(&self.pending) {
            let visible = self.pending[..m.start()].to_string();
            // skip the blank line, keep the `[n]`
            self.references = self.pending[m.start() + 2..].to_string();
            self.pending.clear();
            self.withholding = true;
            return non_empty(visible);
        }

        let held = PARTIAL_BOUNDARY
            .find(&self.pending)
            .map_or(0, |m| self.pending.len() - m.start());
        let cut = self.pending.len() - held;
        let visible: String = self.pending.drain(..cut).collect();
        non_empty(visible)
    }

    /// End of stream: returns any held-back visible text and the
    /// accumulated references (empty when no boundary was seen)
    pub fn finish(&mut self) -> (Option<String>, String) {
        let visible = non_empty(std::mem::take(&mut self.pending));
        let references = std::mem::take(&mut self.references).trim_end().to_string();
        (visible, references)
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}
