//! Progressive-disclosure context assembly.
//!
//! On session start the engine injects a compact index of what exists in
//! memory, full detail for only the most recent observations, the last
//! session summary, and a memory-economics footer. The assembler fills in
//! priority order (index lines, then detail blocks, then summary) under a
//! hard token budget; a detail block that would sever at the boundary is
//! omitted entirely, so the fragment is always well-formed.

use crate::config::ContextConfig;
use crate::memory::types::{approx_tokens, Observation, SessionSummary};

/// The assembled prompt fragment and its approximate cost.
#[derive(Debug, Clone)]
pub struct ContextFragment {
    pub text: String,
    pub token_estimate: usize,
}

/// Assemble the session-start fragment.
///
/// `observations` must be project-scoped active rows, most recent first.
pub fn assemble(
    observations: &[Observation],
    last_summary: Option<&SessionSummary>,
    config: &ContextConfig,
) -> ContextFragment {
    let eligible: Vec<&Observation> = observations
        .iter()
        .filter(|o| {
            config.index_types.is_empty() || config.index_types.contains(&o.observation_type)
        })
        .take(config.max_index_entries)
        .collect();

    let footer = economics_footer(&eligible);
    let footer_tokens = approx_tokens(&footer) as usize;
    let budget = config.max_context_tokens.saturating_sub(footer_tokens);

    let mut spent = 0usize;
    let mut sections: Vec<String> = Vec::new();

    // 1. Index lines, most recent first.
    let mut index_lines: Vec<String> = Vec::new();
    let header = "## Memory index";
    let header_tokens = approx_tokens(header) as usize;
    if !eligible.is_empty() && spent + header_tokens <= budget {
        let mut block_spent = header_tokens;
        for obs in &eligible {
            let line = index_line(obs);
            let cost = approx_tokens(&line) as usize;
            if spent + block_spent + cost > budget {
                break;
            }
            block_spent += cost;
            index_lines.push(line);
        }
        if !index_lines.is_empty() {
            spent += block_spent;
            sections.push(format!("{header}\n{}", index_lines.join("\n")));
        }
    }

    // 2. Full detail for the most recent observations, in order; blocks are
    // atomic, and truncation stops at the first block that does not fit.
    let mut detail_blocks: Vec<String> = Vec::new();
    for obs in eligible.iter().take(config.full_observation_count) {
        let block = detail_block(obs);
        let cost = approx_tokens(&block) as usize;
        if spent + cost > budget {
            break;
        }
        spent += cost;
        detail_blocks.push(block);
    }
    if !detail_blocks.is_empty() {
        sections.push(detail_blocks.join("\n\n"));
    }

    // 3. Last session summary key fields, also atomic.
    if let Some(summary) = last_summary {
        let block = summary_block(summary);
        let cost = approx_tokens(&block) as usize;
        if spent + cost <= budget {
            spent += cost;
            sections.push(block);
        }
    }

    sections.push(footer);
    spent += footer_tokens;

    ContextFragment {
        text: sections.join("\n\n"),
        token_estimate: spent,
    }
}

/// Compacting variant: compressed narratives and key decisions with a budget
/// split of 40% index, 40% observation details, 20% decisions. Each returned
/// string is one context block.
pub fn assemble_compacting(
    observations: &[Observation],
    last_summary: Option<&SessionSummary>,
    max_tokens: usize,
) -> Vec<String> {
    let index_budget = max_tokens * 40 / 100;
    let detail_budget = max_tokens * 40 / 100;
    let decision_budget = max_tokens * 20 / 100;

    let mut blocks = Vec::new();

    let mut spent = 0usize;
    let mut lines = Vec::new();
    for obs in observations {
        let line = index_line(obs);
        let cost = approx_tokens(&line) as usize;
        if spent + cost > index_budget {
            break;
        }
        spent += cost;
        lines.push(line);
    }
    if !lines.is_empty() {
        blocks.push(lines.join("\n"));
    }

    let mut spent = 0usize;
    let mut details = Vec::new();
    for obs in observations {
        let block = format!("{}: {}", obs.title, obs.narrative);
        let cost = approx_tokens(&block) as usize;
        if spent + cost > detail_budget {
            break;
        }
        spent += cost;
        details.push(block);
    }
    if !details.is_empty() {
        blocks.push(details.join("\n"));
    }

    if let Some(summary) = last_summary {
        let mut spent = 0usize;
        let mut decisions = Vec::new();
        for decision in &summary.key_decisions {
            let cost = approx_tokens(decision) as usize;
            if spent + cost > decision_budget {
                break;
            }
            spent += cost;
            decisions.push(format!("- {decision}"));
        }
        if !decisions.is_empty() {
            blocks.push(format!("Key decisions:\n{}", decisions.join("\n")));
        }
    }

    blocks
}

/// `icon [type] title (~Nt) — file1, file2`
fn index_line(obs: &Observation) -> String {
    let tokens = approx_tokens(&obs.narrative);
    let mut line = format!(
        "{} [{}] {} (~{}t)",
        obs.observation_type.icon(),
        obs.observation_type,
        obs.title,
        tokens
    );

    let mut files: Vec<&str> = obs.files_modified.iter().map(String::as_str).collect();
    for f in &obs.files_read {
        if !files.contains(&f.as_str()) {
            files.push(f);
        }
    }
    if !files.is_empty() {
        files.truncate(3);
        line.push_str(&format!(" — {}", files.join(", ")));
    }
    line
}

fn detail_block(obs: &Observation) -> String {
    let mut block = format!("### {}\n{}", obs.title, obs.narrative);
    if !obs.facts.is_empty() {
        let facts: Vec<String> = obs.facts.iter().map(|f| format!("- {f}")).collect();
        block.push_str(&format!("\n{}", facts.join("\n")));
    }
    block
}

fn summary_block(summary: &SessionSummary) -> String {
    let mut block = format!("## Last session\n{}", summary.summary);
    if !summary.key_decisions.is_empty() {
        block.push_str(&format!("\nDecisions: {}", summary.key_decisions.join("; ")));
    }
    if let Some(next) = &summary.next_steps {
        block.push_str(&format!("\nNext steps: {next}"));
    }
    block
}

/// Raw capture cost vs injected cost, with percent savings.
fn economics_footer(observations: &[&Observation]) -> String {
    let discovered: u64 = observations.iter().map(|o| o.discovery_tokens as u64).sum();
    let injected: u64 = observations.iter().map(|o| o.token_count as u64).sum();
    let saved_pct = if discovered > 0 {
        100 - (injected * 100 / discovered).min(100)
    } else {
        0
    };
    format!("Memory economics: {discovered} discovery tokens distilled to {injected} (~{saved_pct}% saved)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{ObservationType, Scope};

    fn obs(title: &str, narrative_tokens: usize, created_at: &str) -> Observation {
        Observation {
            id: format!("id-{title}"),
            session_id: "s1".into(),
            scope: Scope::Project,
            observation_type: ObservationType::Discovery,
            title: title.into(),
            subtitle: None,
            narrative: "word".repeat(narrative_tokens),
            facts: vec![],
            concepts: vec![],
            files_read: vec![],
            files_modified: vec!["src/main.rs".into()],
            raw_tool_output: None,
            tool_name: None,
            created_at: created_at.into(),
            token_count: narrative_tokens as u32,
            discovery_tokens: (narrative_tokens * 10) as u32,
            importance: 3,
            revision_of: None,
            superseded_by: None,
            superseded_at: None,
            deleted_at: None,
        }
    }

    fn config(entries: usize, full: usize, budget: usize) -> ContextConfig {
        ContextConfig {
            max_index_entries: entries,
            full_observation_count: full,
            max_context_tokens: budget,
            index_types: Vec::new(),
        }
    }

    #[test]
    fn budget_scenario_fits_all_parts() {
        // Three recent observations of 40/30/50 tokens under a 200 budget.
        let observations = vec![
            obs("newest", 40, "2026-01-03T00:00:00Z"),
            obs("middle", 30, "2026-01-02T00:00:00Z"),
            obs("oldest", 50, "2026-01-01T00:00:00Z"),
        ];
        let fragment = assemble(&observations, None, &config(3, 1, 200));

        for title in ["newest", "middle", "oldest"] {
            assert!(fragment.text.contains(title), "missing index line for {title}");
        }
        // Full narrative of the most recent observation only.
        assert!(fragment.text.contains(&"word".repeat(40)));
        assert!(!fragment.text.contains(&"word".repeat(50)));
        assert!(fragment.text.contains("Memory economics"));
        assert!(fragment.token_estimate <= 200);
    }

    #[test]
    fn never_exceeds_budget() {
        let observations: Vec<Observation> = (0..20)
            .map(|i| obs(&format!("obs-{i}"), 100, "2026-01-01T00:00:00Z"))
            .collect();
        for budget in [50, 120, 400, 1000] {
            let fragment = assemble(&observations, None, &config(20, 5, budget));
            assert!(
                fragment.token_estimate <= budget,
                "estimate {} over budget {budget}",
                fragment.token_estimate
            );
            assert!(approx_tokens(&fragment.text) as usize <= budget + 30);
        }
    }

    #[test]
    fn detail_block_is_atomic() {
        // Budget fits the index but severs the detail block: it must be
        // omitted entirely, not truncated.
        let observations = vec![obs("big", 300, "2026-01-01T00:00:00Z")];
        let fragment = assemble(&observations, None, &config(3, 1, 60));
        assert!(fragment.text.contains("[discovery] big"));
        assert!(!fragment.text.contains(&"word".repeat(300)));
    }

    #[test]
    fn detail_truncation_stops_at_first_oversized_block() {
        // The most recent observation's block does not fit; a smaller, older
        // one would. Truncation is sequential, so neither is emitted rather
        // than skipping ahead to the better-fitting block.
        let mut newest = obs("newest-big", 300, "2026-01-02T00:00:00Z");
        newest.narrative = "huge".repeat(300);
        let older = obs("older-small", 10, "2026-01-01T00:00:00Z");

        let fragment = assemble(&[newest, older], None, &config(3, 2, 120));
        assert!(fragment.text.contains("newest-big"));
        assert!(fragment.text.contains("older-small"));
        assert!(!fragment.text.contains(&"huge".repeat(300)));
        assert!(!fragment.text.contains(&"word".repeat(10)));
        assert!(fragment.token_estimate <= 120);
    }

    #[test]
    fn type_filter_limits_index() {
        let mut decision = obs("the-decision", 10, "2026-01-02T00:00:00Z");
        decision.observation_type = ObservationType::Decision;
        let discovery = obs("the-discovery", 10, "2026-01-01T00:00:00Z");

        let cfg = ContextConfig {
            index_types: vec![ObservationType::Decision],
            ..config(10, 0, 500)
        };
        let fragment = assemble(&[decision, discovery], None, &cfg);
        assert!(fragment.text.contains("the-decision"));
        assert!(!fragment.text.contains("the-discovery"));
    }

    #[test]
    fn summary_appears_when_budget_allows() {
        let observations = vec![obs("one", 10, "2026-01-01T00:00:00Z")];
        let summary = SessionSummary {
            id: "sum".into(),
            session_id: "s1".into(),
            summary: "Finished the migration".into(),
            key_decisions: vec!["kept sqlite".into()],
            files_modified: vec![],
            concepts: vec![],
            request: None,
            investigated: None,
            learned: None,
            completed: None,
            next_steps: Some("wire the dashboard".into()),
            token_count: 12,
            created_at: "2026-01-01T00:00:00Z".into(),
        };

        let fragment = assemble(&observations, Some(&summary), &config(5, 1, 500));
        assert!(fragment.text.contains("Finished the migration"));
        assert!(fragment.text.contains("kept sqlite"));
        assert!(fragment.text.contains("wire the dashboard"));
    }

    #[test]
    fn economics_footer_reports_savings() {
        let observations = vec![obs("one", 10, "2026-01-01T00:00:00Z")];
        let fragment = assemble(&observations, None, &config(5, 0, 500));
        // 100 discovery tokens distilled to 10 → 90% saved.
        assert!(fragment.text.contains("100 discovery tokens"));
        assert!(fragment.text.contains("~90% saved"));
    }

    #[test]
    fn compacting_split_produces_blocks() {
        let observations: Vec<Observation> = (0..5)
            .map(|i| obs(&format!("obs-{i}"), 20, "2026-01-01T00:00:00Z"))
            .collect();
        let summary = SessionSummary {
            id: "sum".into(),
            session_id: "s1".into(),
            summary: "s".into(),
            key_decisions: vec!["decision one".into(), "decision two".into()],
            files_modified: vec![],
            concepts: vec![],
            request: None,
            investigated: None,
            learned: None,
            completed: None,
            next_steps: None,
            token_count: 1,
            created_at: "2026-01-01T00:00:00Z".into(),
        };

        let blocks = assemble_compacting(&observations, Some(&summary), 400);
        assert_eq!(blocks.len(), 3);
        assert!(blocks[2].contains("decision one"));

        let total: usize = blocks.iter().map(|b| approx_tokens(b) as usize).sum();
        assert!(total <= 400);
    }

    #[test]
    fn empty_memory_still_produces_footer() {
        let fragment = assemble(&[], None, &config(5, 1, 200));
        assert!(fragment.text.contains("Memory economics"));
    }
}
