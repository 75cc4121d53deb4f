use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::memory::types::ObservationType;

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct MemConfig {
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub redaction: RedactionConfig,
    pub retrieval: RetrievalConfig,
    pub context: ContextConfig,
    pub mode: ModeConfig,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    /// Directory holding `memory.db`, relative to the project root.
    pub data_dir: String,
    /// Optional user-scope second database (absolute or `~/`-relative).
    pub user_db_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    pub batch_size: usize,
    /// Interval trigger for the queue processor, in seconds.
    pub process_interval_secs: u64,
    pub max_retries: u32,
    /// `processing` rows older than this revert to `pending` on startup.
    pub stale_claim_secs: i64,
    /// Timeout applied to every AI call.
    pub ai_timeout_secs: u64,
    pub conflict_resolution: bool,
    pub entity_extraction: bool,
    pub summarize_on_session_end: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct RedactionConfig {
    /// Extra case-insensitive patterns applied after the built-in set.
    pub patterns: Vec<String>,
    /// Captures shorter than this after redaction are suppressed.
    pub min_capture_len: usize,
    /// User chat messages are truncated to this many characters.
    pub chat_capture_cap: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrievalConfig {
    pub default_limit: usize,
    pub rrf_k: usize,
    /// Each ranker gathers `limit * candidate_multiplier` candidates pre-fusion.
    pub candidate_multiplier: usize,
    pub reranking_enabled: bool,
    pub reranking_max_candidates: usize,
    /// Brute-force similarity scans the most recent N rows of a type.
    pub similar_recent_n: usize,
    /// Cosine similarity at or above which a candidate is dropped as a duplicate.
    pub duplicate_threshold: f64,
    /// Cosine similarity at or above which a candidate supersedes its neighbour.
    pub supersede_threshold: f64,
    pub embedding_dimensions: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct ContextConfig {
    pub max_index_entries: usize,
    pub full_observation_count: usize,
    pub max_context_tokens: usize,
    /// Observation types eligible for the index; empty means all.
    pub index_types: Vec<ObservationType>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct ModeConfig {
    pub mode_id: String,
    /// Directory of mode JSON files; `None` uses only the built-in mode.
    pub modes_dir: Option<String>,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            redaction: RedactionConfig::default(),
            retrieval: RetrievalConfig::default(),
            context: ContextConfig::default(),
            mode: ModeConfig::default(),
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: ".open-mem".into(),
            user_db_path: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            process_interval_secs: 30,
            max_retries: 3,
            stale_claim_secs: 300,
            ai_timeout_secs: 30,
            conflict_resolution: true,
            entity_extraction: true,
            summarize_on_session_end: true,
        }
    }
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            min_capture_len: 16,
            chat_capture_cap: 2000,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            rrf_k: 60,
            candidate_multiplier: 3,
            reranking_enabled: false,
            reranking_max_candidates: 20,
            similar_recent_n: 200,
            duplicate_threshold: 0.97,
            supersede_threshold: 0.88,
            embedding_dimensions: 384,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_index_entries: 50,
            full_observation_count: 5,
            max_context_tokens: 2000,
            index_types: Vec::new(),
        }
    }
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            mode_id: "code".into(),
            modes_dir: None,
        }
    }
}

impl MemConfig {
    /// Load config for a project: defaults ← `<root>/.open-mem/config.json` ← env.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = project_root.join(".open-mem").join("config.json");
        Self::load_from(&path)
    }

    /// Load from a specific JSON file path, then apply env var overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            serde_json::from_str(&contents).context("failed to parse config JSON")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MemConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (OPEN_MEM_DATA_DIR, OPEN_MEM_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("OPEN_MEM_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("OPEN_MEM_LOG_LEVEL") {
            self.log_level = val;
        }
    }

    /// Resolve the database path for a project root.
    pub fn db_path(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.storage.data_dir).join("memory.db")
    }

    /// Resolve the optional user-scope database path, expanding `~`.
    pub fn user_db_path(&self) -> Option<PathBuf> {
        self.storage.user_db_path.as_deref().map(expand_tilde)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// Resolve the "main" repository root for a directory that may be inside a
/// git worktree.
///
/// If the directory's `.git` entry is a worktree pointer file and the common
/// git directory differs from the worktree's git directory, the parent of the
/// common directory is returned. In every other case (plain repository,
/// non-repository, unreadable metadata) the input is returned unchanged.
pub fn canonical_project_root(dir: &Path) -> PathBuf {
    match worktree_main_root(dir) {
        Some(root) => root,
        None => dir.to_path_buf(),
    }
}

fn worktree_main_root(dir: &Path) -> Option<PathBuf> {
    let git_entry = dir.join(".git");
    if !git_entry.is_file() {
        return None;
    }

    // Worktree `.git` files hold a single `gitdir: <path>` line.
    let contents = std::fs::read_to_string(&git_entry).ok()?;
    let gitdir_raw = contents.strip_prefix("gitdir:")?.trim();
    let gitdir = resolve_relative(dir, gitdir_raw);

    let commondir_file = gitdir.join("commondir");
    let common_raw = std::fs::read_to_string(commondir_file).ok()?;
    let common = resolve_relative(&gitdir, common_raw.trim());
    let common = common.canonicalize().unwrap_or(common);
    let gitdir = gitdir.canonicalize().unwrap_or(gitdir);

    if common == gitdir {
        return None;
    }
    common.parent().map(Path::to_path_buf)
}

fn resolve_relative(base: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
