//! Capture redaction — private-block stripping and sensitive-pattern masking.
//!
//! Runs before anything touches the pipeline. Two transforms in order:
//! `<private>…</private>` blocks are removed entirely, then every configured
//! sensitive pattern replaces its matches with [`REDACTION_MARKER`]. Pattern
//! compilation errors are skipped with a warning; redaction never aborts a
//! capture.

use regex::{Regex, RegexBuilder};
use std::sync::OnceLock;

pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Built-in sensitive patterns: provider key prefixes and long opaque runs.
const BUILTIN_PATTERNS: &[&str] = &[
    // Provider API key prefixes
    r"sk-[A-Za-z0-9_-]{16,}",
    r"(?:ghp|gho|ghu|ghs|ghr)_[A-Za-z0-9]{36,}",
    r"xox[bapsr]-[A-Za-z0-9-]{10,}",
    r"AKIA[0-9A-Z]{16}",
    r"AIza[0-9A-Za-z_-]{35}",
    r"bearer\s+[A-Za-z0-9._~+/-]{20,}=*",
    // High-entropy base64-like runs
    r"[A-Za-z0-9+/=_-]{24,}",
];

fn private_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // (?s) so blocks spanning line boundaries are stripped; non-greedy, non-nested.
    RE.get_or_init(|| Regex::new(r"(?s)<private>.*?</private>").expect("valid pattern"))
}

/// Compiled redactor holding the built-in and user-configured patterns.
pub struct Redactor {
    patterns: Vec<Regex>,
    min_capture_len: usize,
}

impl Redactor {
    /// Build from config. Invalid user patterns are skipped (fail open) with
    /// a logged warning.
    pub fn new(config: &crate::config::RedactionConfig) -> Self {
        let mut patterns = Vec::new();
        for source in BUILTIN_PATTERNS
            .iter()
            .copied()
            .chain(config.patterns.iter().map(String::as_str))
        {
            match RegexBuilder::new(source).case_insensitive(true).build() {
                Ok(re) => patterns.push(re),
                Err(e) => {
                    tracing::warn!(pattern = source, error = %e, "skipping invalid redaction pattern");
                }
            }
        }
        Self {
            patterns,
            min_capture_len: config.min_capture_len,
        }
    }

    /// Apply both transforms. Returns `None` when the redacted output is too
    /// short to be worth capturing.
    pub fn redact(&self, input: &str) -> Option<String> {
        let stripped = private_block_re().replace_all(input, "");

        let mut out = stripped.into_owned();
        for re in &self.patterns {
            out = re.replace_all(&out, REDACTION_MARKER).into_owned();
        }

        if out.trim().len() < self.min_capture_len {
            return None;
        }
        Some(out)
    }

    /// Redact without the minimum-length gate, for chat messages.
    pub fn redact_unbounded(&self, input: &str) -> String {
        let stripped = private_block_re().replace_all(input, "");
        let mut out = stripped.into_owned();
        for re in &self.patterns {
            out = re.replace_all(&out, REDACTION_MARKER).into_owned();
        }
        out
    }
}
