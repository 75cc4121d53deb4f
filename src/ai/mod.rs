//! AI capability interfaces and the provider chain.
//!
//! The core consumes compression, embedding, reranking, and entity extraction
//! through these traits; concrete provider SDKs are wired by the host at
//! startup. Failures are classified as [`MemError::Retryable`] (rate-limit,
//! 5xx, timeout) or [`MemError::Config`] (unauthorized, bad request);
//! [`ChainedCompressor`] is the sole retry site and makes compression
//! infallible from the caller's perspective by degrading to the deterministic
//! basic extractor.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{MemError, Result};
use crate::memory::types::{Observation, ObservationDraft, Session, SummaryDraft};
use crate::modes::Mode;

/// Default embedding dimension (all-MiniLM-class models).
pub const EMBEDDING_DIM: usize = 384;

/// A redacted raw capture handed to the compressor.
#[derive(Debug, Clone)]
pub struct Capture {
    pub session_id: String,
    pub tool_name: String,
    pub tool_output: String,
}

/// Turns a raw capture into a distilled observation body.
#[async_trait]
pub trait Compressor: Send + Sync {
    async fn compress(&self, capture: &Capture, mode: &Mode) -> Result<ObservationDraft>;

    /// Summarize a session's active observations.
    async fn summarize(
        &self,
        session: &Session,
        observations: &[Observation],
    ) -> Result<SummaryDraft>;

    fn name(&self) -> &str;
}

/// Computes fixed-dimension vectors. May be absent entirely.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// One candidate handed to the reranker: title plus snippet.
#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub id: String,
    pub title: String,
    pub snippet: String,
}

/// Orders candidates by relevance to a query. Returns indices into the
/// candidate slice, best first. Failures revert the caller to RRF order.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: &[RerankCandidate]) -> Result<Vec<usize>>;
}

/// Entities and relationships extracted from one observation.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelationship>,
}

#[derive(Debug, Clone)]
pub struct ExtractedEntity {
    pub entity_type: String,
    pub name: String,
    pub description: Option<String>,
}

/// Directed edge between two extracted entities, by (type, name).
#[derive(Debug, Clone)]
pub struct ExtractedRelationship {
    pub from: (String, String),
    pub relationship_type: String,
    pub to: (String, String),
}

/// Extracts domain entities and relationships from an observation.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, observation: &Observation, mode: &Mode) -> Result<Extraction>;
}

/// Run an AI call under the configured timeout; a timeout is a retryable
/// failure like any other transient provider error.
pub async fn with_timeout<T>(
    duration: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(MemError::Retryable(format!(
            "AI call timed out after {}s",
            duration.as_secs()
        ))),
    }
}

// ── Provider chain ────────────────────────────────────────────────────────────

/// Tries a primary compressor and falls through an ordered list of fallback
/// providers on retryable failures. Config errors short-circuit the chain:
/// the AI path is disabled for the rest of the run and every capture goes
/// through the basic extractor.
pub struct ChainedCompressor {
    providers: Vec<Arc<dyn Compressor>>,
    timeout: Duration,
    attempts_per_provider: u32,
    config_failed: AtomicBool,
}

impl ChainedCompressor {
    pub fn new(providers: Vec<Arc<dyn Compressor>>, timeout: Duration) -> Self {
        Self {
            providers,
            timeout,
            attempts_per_provider: 2,
            config_failed: AtomicBool::new(false),
        }
    }

    /// `true` once a config error has disabled the AI path.
    pub fn degraded(&self) -> bool {
        self.config_failed.load(Ordering::Relaxed)
    }

    /// Compress a capture. Infallible: the AI path's retryable failures are
    /// handled here, and exhaustion or configuration errors degrade to the
    /// basic extractor.
    pub async fn compress(&self, capture: &Capture, mode: &Mode) -> ObservationDraft {
        if !self.degraded() {
            match self.try_providers(capture, mode).await {
                Ok(draft) => return draft,
                Err(MemError::Config(msg)) => {
                    tracing::warn!(
                        error = %msg,
                        "AI provider misconfigured, degrading to basic extraction"
                    );
                    self.config_failed.store(true, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "all compression providers failed, using basic extraction");
                }
            }
        }
        basic_extract(capture)
    }

    /// Summarize with the same chain semantics; degrades to a deterministic
    /// stitched summary.
    pub async fn summarize(
        &self,
        session: &Session,
        observations: &[Observation],
    ) -> SummaryDraft {
        if !self.degraded() {
            for provider in &self.providers {
                match with_timeout(self.timeout, provider.summarize(session, observations)).await
                {
                    Ok(draft) => return draft,
                    Err(MemError::Config(msg)) => {
                        tracing::warn!(provider = provider.name(), error = %msg, "summarizer misconfigured");
                        self.config_failed.store(true, Ordering::Relaxed);
                        break;
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::debug!(provider = provider.name(), error = %e, "summarizer failed, trying next");
                    }
                    Err(e) => {
                        tracing::warn!(provider = provider.name(), error = %e, "summarizer error");
                        break;
                    }
                }
            }
        }
        basic_summary(observations)
    }

    async fn try_providers(&self, capture: &Capture, mode: &Mode) -> Result<ObservationDraft> {
        let mut last_err = MemError::Retryable("no compression providers configured".into());

        for provider in &self.providers {
            for attempt in 1..=self.attempts_per_provider {
                match with_timeout(self.timeout, provider.compress(capture, mode)).await {
                    Ok(draft) => return Ok(draft),
                    Err(e) if e.is_retryable() => {
                        tracing::debug!(
                            provider = provider.name(),
                            attempt,
                            error = %e,
                            "retryable compression failure"
                        );
                        last_err = e;
                    }
                    // Config errors short-circuit with no fallback.
                    Err(e) => return Err(e),
                }
            }
        }
        Err(last_err)
    }
}

// ── Basic extraction fallback ─────────────────────────────────────────────────

const BASIC_NARRATIVE_LINES: usize = 6;
const BASIC_NARRATIVE_CHARS: usize = 500;

/// Deterministic best-effort extraction used when the AI provider is
/// unavailable: tool name as title, the first lines of output as narrative,
/// path-like tokens as files.
pub fn basic_extract(capture: &Capture) -> ObservationDraft {
    let narrative: String = {
        let joined = capture
            .tool_output
            .lines()
            .take(BASIC_NARRATIVE_LINES)
            .collect::<Vec<_>>()
            .join("\n");
        truncate_chars(&joined, BASIC_NARRATIVE_CHARS)
    };

    let files = detect_paths(&capture.tool_output);

    ObservationDraft {
        observation_type: None, // defaults to discovery at persist time
        title: format!("{} capture", capture.tool_name),
        subtitle: None,
        narrative: if narrative.trim().is_empty() {
            format!("output of {}", capture.tool_name)
        } else {
            narrative
        },
        facts: Vec::new(),
        concepts: Vec::new(),
        files_read: files,
        files_modified: Vec::new(),
        raw_tool_output: Some(capture.tool_output.clone()),
        tool_name: Some(capture.tool_name.clone()),
        importance: Some(3),
        scope: None,
        discovery_tokens: crate::memory::types::approx_tokens(&capture.tool_output),
    }
}

fn basic_summary(observations: &[Observation]) -> SummaryDraft {
    let mut concepts: Vec<String> = Vec::new();
    let mut files: Vec<String> = Vec::new();
    let mut decisions: Vec<String> = Vec::new();
    for obs in observations {
        for c in &obs.concepts {
            if !concepts.iter().any(|x| x.eq_ignore_ascii_case(c)) {
                concepts.push(c.clone());
            }
        }
        for f in &obs.files_modified {
            if !files.contains(f) {
                files.push(f.clone());
            }
        }
        if obs.observation_type == crate::memory::types::ObservationType::Decision {
            decisions.push(obs.title.clone());
        }
    }

    let titles: Vec<&str> = observations
        .iter()
        .rev()
        .take(5)
        .map(|o| o.title.as_str())
        .collect();

    SummaryDraft {
        summary: format!(
            "Session with {} observations. Recent work: {}",
            observations.len(),
            titles.join("; ")
        ),
        key_decisions: decisions,
        files_modified: files,
        concepts,
        ..SummaryDraft::default()
    }
}

/// Path-like tokens: contain a separator and end in a short extension, or
/// start with a known source directory.
pub fn detect_paths(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    for token in text.split(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | ',' | ';' | '"' | '\'' | '`')) {
        let token = token.trim_matches(|c: char| matches!(c, ':' | '.' | '!' | '?'));
        if token.len() < 3 || token.len() > 200 {
            continue;
        }
        let looks_like_path = token.contains('/')
            && token
                .rsplit('.')
                .next()
                .map(|ext| ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
                .unwrap_or(false)
            && token.contains('.');
        if looks_like_path && !found.contains(&token.to_string()) {
            found.push(token.to_string());
        }
    }
    found
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let end = text
        .char_indices()
        .take_while(|(i, _)| *i < max_chars)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(max_chars);
    text[..end].to_string()
}

// ── Deterministic entity extraction ───────────────────────────────────────────

/// Entity extraction grounded in the observation's own structure: concepts
/// and files become entities (when the mode allows those types) and each
/// concept links to each touched file.
pub struct BasicEntityExtractor;

#[async_trait]
impl EntityExtractor for BasicEntityExtractor {
    async fn extract(&self, observation: &Observation, mode: &Mode) -> Result<Extraction> {
        let mut extraction = Extraction::default();

        let concept_allowed = mode.entity_types.iter().any(|t| t == "concept");
        let file_allowed = mode.entity_types.iter().any(|t| t == "file");
        let relationship = mode
            .relationship_types
            .first()
            .cloned()
            .unwrap_or_else(|| "relates_to".into());

        if concept_allowed {
            for concept in &observation.concepts {
                extraction.entities.push(ExtractedEntity {
                    entity_type: "concept".into(),
                    name: concept.clone(),
                    description: None,
                });
            }
        }

        let mut files = observation.files_modified.clone();
        for f in &observation.files_read {
            if !files.contains(f) {
                files.push(f.clone());
            }
        }
        if file_allowed {
            for file in &files {
                extraction.entities.push(ExtractedEntity {
                    entity_type: "file".into(),
                    name: file.clone(),
                    description: None,
                });
            }
        }

        if concept_allowed && file_allowed {
            for concept in &observation.concepts {
                for file in &files {
                    extraction.relationships.push(ExtractedRelationship {
                        from: ("concept".into(), concept.clone()),
                        relationship_type: relationship.clone(),
                        to: ("file".into(), file.clone()),
                    });
                }
            }
        }

        Ok(extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{ObservationType, Scope};
    use crate::modes::default_mode;

    fn capture(output: &str) -> Capture {
        Capture {
            session_id: "s1".into(),
            tool_name: "Bash".into(),
            tool_output: output.into(),
        }
    }

    struct FailingCompressor {
        kind: fn() -> MemError,
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Compressor for FailingCompressor {
        async fn compress(&self, _: &Capture, _: &Mode) -> Result<ObservationDraft> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err((self.kind)())
        }

        async fn summarize(&self, _: &Session, _: &[Observation]) -> Result<SummaryDraft> {
            Err((self.kind)())
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    struct OkCompressor;

    #[async_trait]
    impl Compressor for OkCompressor {
        async fn compress(&self, capture: &Capture, _: &Mode) -> Result<ObservationDraft> {
            Ok(ObservationDraft {
                observation_type: Some(ObservationType::Discovery),
                title: format!("compressed {}", capture.tool_name),
                narrative: "ai narrative".into(),
                ..ObservationDraft::default()
            })
        }

        async fn summarize(&self, _: &Session, _: &[Observation]) -> Result<SummaryDraft> {
            Ok(SummaryDraft {
                summary: "ai summary".into(),
                ..SummaryDraft::default()
            })
        }

        fn name(&self) -> &str {
            "ok"
        }
    }

    #[test]
    fn basic_extract_detects_paths_and_truncates() {
        let output = "modified src/auth.ts and read docs/setup.md\nplus some other text";
        let draft = basic_extract(&capture(output));
        assert_eq!(draft.title, "Bash capture");
        assert!(draft.files_read.contains(&"src/auth.ts".to_string()));
        assert!(draft.files_read.contains(&"docs/setup.md".to_string()));
        assert_eq!(draft.importance, Some(3));
        assert!(draft.discovery_tokens > 0);

        let long = "x".repeat(2000);
        let draft = basic_extract(&capture(&long));
        assert!(draft.narrative.len() <= 500);
    }

    #[test]
    fn detect_paths_ignores_plain_words() {
        let found = detect_paths("nothing here looks like: a path, just words. v1.2.3");
        assert!(found.is_empty());
        let found = detect_paths("touched crates/core/src/lib.rs today");
        assert_eq!(found, vec!["crates/core/src/lib.rs".to_string()]);
    }

    #[tokio::test]
    async fn chain_falls_through_retryable_to_next_provider() {
        let failing = Arc::new(FailingCompressor {
            kind: || MemError::Retryable("rate limit".into()),
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let chain = ChainedCompressor::new(
            vec![failing.clone(), Arc::new(OkCompressor)],
            Duration::from_secs(5),
        );

        let draft = chain.compress(&capture("output"), &default_mode()).await;
        assert_eq!(draft.title, "compressed Bash");
        assert_eq!(failing.calls.load(Ordering::Relaxed), 2);
        assert!(!chain.degraded());
    }

    #[tokio::test]
    async fn config_error_short_circuits_and_degrades() {
        let failing = Arc::new(FailingCompressor {
            kind: || MemError::Config("unauthorized".into()),
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let chain = ChainedCompressor::new(
            vec![failing.clone(), Arc::new(OkCompressor)],
            Duration::from_secs(5),
        );

        let draft = chain.compress(&capture("some tool output"), &default_mode()).await;
        // No fallback to the second provider; basic extraction instead.
        assert_eq!(draft.title, "Bash capture");
        assert_eq!(failing.calls.load(Ordering::Relaxed), 1);
        assert!(chain.degraded());

        // Subsequent calls skip the AI path entirely.
        chain.compress(&capture("more output"), &default_mode()).await;
        assert_eq!(failing.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausted_chain_uses_basic_extraction() {
        let chain = ChainedCompressor::new(
            vec![Arc::new(FailingCompressor {
                kind: || MemError::Retryable("503".into()),
                calls: std::sync::atomic::AtomicU32::new(0),
            })],
            Duration::from_secs(5),
        );
        let draft = chain.compress(&capture("tool said things"), &default_mode()).await;
        assert_eq!(draft.title, "Bash capture");
        assert!(!chain.degraded());
    }

    #[tokio::test]
    async fn empty_chain_is_basic_extraction() {
        let chain = ChainedCompressor::new(vec![], Duration::from_secs(5));
        let draft = chain.compress(&capture("plain output"), &default_mode()).await;
        assert_eq!(draft.title, "Bash capture");
    }

    #[tokio::test]
    async fn basic_entity_extraction_links_concepts_to_files() {
        let obs = Observation {
            id: "o1".into(),
            session_id: "s1".into(),
            scope: Scope::Project,
            observation_type: ObservationType::Feature,
            title: "t".into(),
            subtitle: None,
            narrative: "n".into(),
            facts: vec![],
            concepts: vec!["auth".into()],
            files_read: vec!["src/lib.rs".into()],
            files_modified: vec!["src/auth.rs".into()],
            raw_tool_output: None,
            tool_name: None,
            created_at: "2026-01-01T00:00:00Z".into(),
            token_count: 1,
            discovery_tokens: 1,
            importance: 3,
            revision_of: None,
            superseded_by: None,
            superseded_at: None,
            deleted_at: None,
        };

        let extraction = BasicEntityExtractor
            .extract(&obs, &default_mode())
            .await
            .unwrap();
        assert_eq!(extraction.entities.len(), 3);
        assert_eq!(extraction.relationships.len(), 2);
        assert_eq!(extraction.relationships[0].relationship_type, "relates_to");
    }
}
