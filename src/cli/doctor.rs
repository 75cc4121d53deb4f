//! CLI `doctor` command — run database diagnostics and print a health report.

use anyhow::Result;

use crate::engine::MemoryEngine;

/// Run database diagnostics and print a health report.
pub fn doctor(engine: &MemoryEngine) -> Result<()> {
    let report = engine.health()?;
    let queue = engine.queue_status()?;

    println!("open-mem Health Report");
    println!("======================");
    println!();
    println!("Project:           {}", engine.project_path());
    println!("Schema version:    {}", report.schema_version);
    println!(
        "sqlite-vec:        {}",
        report
            .sqlite_vec_version
            .as_deref()
            .map(|v| format!("v{v}"))
            .unwrap_or_else(|| "unavailable (vector search disabled)".into())
    );
    println!();
    println!("Row counts:");
    println!("  Observations:    {}", report.observation_count);
    println!("  Sessions:        {}", report.session_count);
    println!("  Entities:        {}", report.entity_count);
    println!();
    println!("Queue:");
    println!("  Pending:         {}", queue.pending);
    println!("  Processing:      {}", queue.processing);
    println!("  Failed:          {}", queue.failed);
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery steps:");
        println!("  1. Export from a good copy: open-mem export > backup.json");
        println!("  2. Remove .open-mem/memory.db and reimport:");
        println!("     open-mem import --overwrite backup.json");
    }

    Ok(())
}
