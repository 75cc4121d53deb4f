use anyhow::{Context, Result};
use std::path::Path;

use crate::engine::{ExportData, ImportStrategy, MemoryEngine};

/// Import observations from a JSON export file.
///
/// `merge` skips observations whose id already exists; `overwrite` clears
/// the database first and preserves ids and lineage pointers.
pub fn import(engine: &MemoryEngine, file: &Path, overwrite: bool) -> Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read import file: {}", file.display()))?;

    let data: ExportData =
        serde_json::from_str(&json).context("failed to parse import JSON")?;

    let strategy = if overwrite {
        ImportStrategy::Overwrite
    } else {
        ImportStrategy::Merge
    };

    println!(
        "Importing {} observations across {} sessions...",
        data.observations.len(),
        data.sessions.len()
    );

    let report = engine.import(&data, strategy)?;

    println!("Import complete:");
    println!("  Sessions:     {}", report.sessions);
    println!("  Observations: {}", report.observations);
    if report.skipped > 0 {
        println!("  Skipped:      {} (already exist)", report.skipped);
    }

    Ok(())
}
