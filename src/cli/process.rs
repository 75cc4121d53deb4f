use anyhow::Result;

use crate::engine::MemoryEngine;

/// Drain the pending capture queue once and report what remains.
pub async fn process(engine: &MemoryEngine) -> Result<()> {
    let before = engine.queue_status()?;
    println!(
        "Processing queue: {} pending, {} failed",
        before.pending, before.failed
    );

    engine.process_now().await;

    let after = engine.queue_status()?;
    println!(
        "Done: {} pending, {} failed remain",
        after.pending, after.failed
    );

    if engine.compression_degraded() {
        eprintln!("Note: AI compression is degraded; captures used basic extraction.");
    }

    Ok(())
}
