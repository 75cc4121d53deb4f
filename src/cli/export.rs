use anyhow::Result;

use crate::engine::MemoryEngine;
use crate::memory::types::ObservationType;

/// Export active observations (and their sessions) as JSON to stdout.
pub fn export(
    engine: &MemoryEngine,
    observation_type: Option<ObservationType>,
    limit: Option<usize>,
) -> Result<()> {
    let data = engine.export(observation_type, limit)?;

    let json = serde_json::to_string_pretty(&data)?;
    println!("{json}");

    eprintln!(
        "Exported {} observations across {} sessions.",
        data.observations.len(),
        data.sessions.len()
    );

    Ok(())
}
