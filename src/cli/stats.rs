use anyhow::Result;

use crate::engine::MemoryEngine;
use crate::memory::types::ObservationType;

/// Display memory statistics in the terminal.
pub fn stats(engine: &MemoryEngine) -> Result<()> {
    let response = engine.stats()?;

    println!("Memory Statistics — {}", engine.project_path());
    println!("{}", "=".repeat(40));
    println!("  Total observations:  {}", response.total_observations);
    println!("  Active:              {}", response.active_observations);
    println!("  Superseded:          {}", response.superseded_observations);
    println!("  Tombstoned:          {}", response.tombstoned_observations);
    println!();

    println!("By Type:");
    for t in ObservationType::ALL {
        let count = response.by_type.get(t.as_str()).copied().unwrap_or(0);
        println!("  {:<12} {}", t.as_str(), count);
    }
    println!();

    println!("Sessions:              {}", response.sessions);
    println!("Summaries:             {}", response.summaries);
    println!("Entities:              {}", response.entities);
    println!("Relationships:         {}", response.relationships);
    println!();

    println!(
        "Token economics:       {} discovery → {} distilled",
        response.total_discovery_tokens, response.total_token_count
    );
    println!(
        "Database size:         {}",
        super::format_bytes(response.db_size_bytes)
    );

    if let Some(ref oldest) = response.oldest_observation {
        println!("Oldest observation:    {oldest}");
    }
    if let Some(ref newest) = response.newest_observation {
        println!("Newest observation:    {newest}");
    }

    Ok(())
}
