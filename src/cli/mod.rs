pub mod doctor;
pub mod export;
pub mod import;
pub mod process;
pub mod search;
pub mod stats;

use anyhow::Result;
use std::path::Path;

use crate::config::MemConfig;
use crate::engine::{MemoryEngine, Providers};

/// Open an engine for the current project directory with no AI providers
/// wired; CLI commands run against the degraded (deterministic) stack.
pub fn open_engine(project_dir: &Path) -> Result<MemoryEngine> {
    let config = MemConfig::load(project_dir)?;
    let engine = MemoryEngine::open(project_dir, config, Providers::default())?;
    Ok(engine)
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
