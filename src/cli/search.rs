use anyhow::Result;

use crate::engine::MemoryEngine;
use crate::memory::search::{SearchRequest, SearchStrategy};

/// Run a search from the command line and print ranked results.
pub async fn search(
    engine: &MemoryEngine,
    query: &str,
    strategy: SearchStrategy,
    concepts: Vec<String>,
    files: Vec<String>,
    limit: usize,
) -> Result<()> {
    let mut request = SearchRequest::new(query, engine.project_path());
    request.strategy = strategy;
    request.concepts = concepts;
    request.files = files;
    request.limit = limit;

    let results = engine.search(request).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for result in &results {
        let obs = &result.observation;
        println!(
            "{:>3}. [{}] {} ({})",
            result.rank, obs.observation_type, obs.title, obs.created_at
        );
        println!("     signals: {}", result.explain.matched_by.join(", "));
        if let Some(similarity) = result.vector_similarity {
            println!("     similarity: {similarity:.3}");
        }
        println!("     id: {}", obs.id);
    }

    eprintln!("{} result(s).", results.len());
    Ok(())
}
