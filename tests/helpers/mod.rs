#![allow(dead_code)]

use async_trait::async_trait;
use open_mem::ai::{Capture, Compressor, Embedder, EMBEDDING_DIM};
use open_mem::config::MemConfig;
use open_mem::engine::{MemoryEngine, Providers};
use open_mem::memory::types::{
    Observation, ObservationDraft, ObservationType, Session, SummaryDraft,
};
use open_mem::memory::{sessions, store};
use open_mem::modes::Mode;
use open_mem::Result;
use rusqlite::Connection;
use std::sync::Arc;

/// Open a fresh in-memory database with schema, migrations, and the vec
/// table applied.
pub fn test_db() -> Connection {
    open_mem::db::open_memory_database().unwrap()
}

/// Create (or fetch) a session for a project path. The project path doubles
/// as the session id so tests stay readable.
pub fn seed_session(conn: &Connection, project: &str) -> String {
    sessions::get_or_create(conn, Some(project), project)
        .unwrap()
        .id
}

/// Insert an observation through the full write path. Returns the record.
pub fn seed_observation(
    conn: &mut Connection,
    session_id: &str,
    title: &str,
    narrative: &str,
    concepts: &[&str],
    files: &[&str],
) -> Observation {
    let draft = ObservationDraft {
        observation_type: Some(ObservationType::Discovery),
        title: title.into(),
        narrative: narrative.into(),
        concepts: concepts.iter().map(|s| s.to_string()).collect(),
        files_modified: files.iter().map(|s| s.to_string()).collect(),
        discovery_tokens: 100,
        ..ObservationDraft::default()
    };
    store::create(conn, session_id, &draft).unwrap()
}

/// Deterministic unit vector with a spike at `seed`.
pub fn spike_embedding(seed: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[seed % EMBEDDING_DIM] = 1.0;
    v
}

/// Deterministic text embedder: words hash to dimensions, so identical
/// texts embed identically and unrelated texts land far apart.
pub struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for word in text.split_whitespace() {
            let mut h: u64 = 5381;
            for b in word.to_lowercase().bytes() {
                h = h.wrapping_mul(33) ^ b as u64;
            }
            v[(h % EMBEDDING_DIM as u64) as usize] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }
}

/// A compressor that echoes the capture into a draft without any AI.
pub struct EchoCompressor;

#[async_trait]
impl Compressor for EchoCompressor {
    async fn compress(&self, capture: &Capture, _: &Mode) -> Result<ObservationDraft> {
        // `#tagged` words become concepts so tests can steer extraction.
        let concepts: Vec<String> = capture
            .tool_output
            .split_whitespace()
            .filter_map(|w| w.strip_prefix('#'))
            .map(str::to_string)
            .collect();
        Ok(ObservationDraft {
            observation_type: Some(ObservationType::Discovery),
            title: format!("{}: {}", capture.tool_name, first_words(&capture.tool_output, 6)),
            narrative: capture.tool_output.clone(),
            concepts,
            files_modified: open_mem::ai::detect_paths(&capture.tool_output),
            raw_tool_output: Some(capture.tool_output.clone()),
            tool_name: Some(capture.tool_name.clone()),
            discovery_tokens: open_mem::memory::types::approx_tokens(&capture.tool_output),
            ..ObservationDraft::default()
        })
    }

    async fn summarize(&self, _: &Session, observations: &[Observation]) -> Result<SummaryDraft> {
        Ok(SummaryDraft {
            summary: format!("session covered {} observations", observations.len()),
            key_decisions: observations
                .iter()
                .filter(|o| o.observation_type == ObservationType::Decision)
                .map(|o| o.title.clone())
                .collect(),
            ..SummaryDraft::default()
        })
    }

    fn name(&self) -> &str {
        "echo"
    }
}

fn first_words(text: &str, n: usize) -> String {
    text.split_whitespace().take(n).collect::<Vec<_>>().join(" ")
}

/// An engine rooted at a temp directory, wired with the echo compressor and
/// the hash embedder.
pub fn test_engine() -> (MemoryEngine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let providers = Providers {
        compressors: vec![Arc::new(EchoCompressor)],
        embedder: Some(Arc::new(HashEmbedder)),
        reranker: None,
        extractor: None,
    };
    let engine = MemoryEngine::open(dir.path(), MemConfig::default(), providers).unwrap();
    (engine, dir)
}

/// An engine with no AI providers at all: basic extraction, no vectors.
pub fn bare_engine() -> (MemoryEngine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let engine =
        MemoryEngine::open(dir.path(), MemConfig::default(), Providers::default()).unwrap();
    (engine, dir)
}
