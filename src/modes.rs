//! Mode bundles — named sets of observation types, concept vocabulary,
//! entity types, and relationship types.
//!
//! Modes load from JSON files in a configured directory and may `extends`
//! another mode. Resolution tracks a visited set; a cyclic `extends` chain
//! falls back to the built-in default mode (`code`) without error.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub const DEFAULT_MODE_ID: &str = "code";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default)]
    pub observation_types: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub relationship_types: Vec<String>,
}

/// The built-in `code` mode used when no mode files exist or resolution
/// falls back.
pub fn default_mode() -> Mode {
    Mode {
        id: DEFAULT_MODE_ID.into(),
        extends: None,
        observation_types: vec![
            "decision".into(),
            "bugfix".into(),
            "feature".into(),
            "refactor".into(),
            "discovery".into(),
            "change".into(),
        ],
        concepts: vec![
            "architecture".into(),
            "authentication".into(),
            "testing".into(),
            "performance".into(),
            "configuration".into(),
            "error-handling".into(),
            "database".into(),
            "api".into(),
        ],
        entity_types: vec!["file".into(), "concept".into(), "tool".into()],
        relationship_types: vec!["relates_to".into(), "touches".into(), "mentions".into()],
    }
}

/// Resolve a mode id against a directory of `<id>.json` files, merging
/// `extends` chains parent-first. Missing files, parse failures, and cycles
/// all fall back to [`default_mode`].
pub fn resolve_mode(modes_dir: Option<&Path>, id: &str) -> Mode {
    let Some(dir) = modes_dir else {
        return default_mode();
    };

    let mut visited: HashSet<String> = HashSet::new();
    let mut chain: Vec<Mode> = Vec::new();
    let mut cursor = id.to_string();

    loop {
        if !visited.insert(cursor.clone()) {
            tracing::warn!(mode = %id, at = %cursor, "cyclic mode extends chain, using default mode");
            return default_mode();
        }

        let mode = match load_mode_file(dir, &cursor) {
            Some(mode) => mode,
            None if cursor == DEFAULT_MODE_ID => default_mode(),
            None => {
                tracing::warn!(mode = %cursor, "mode file missing, using default mode");
                return default_mode();
            }
        };

        let next = mode.extends.clone();
        chain.push(mode);
        match next {
            Some(parent) => cursor = parent,
            None => break,
        }
    }

    // Parents first, then children override / extend.
    let mut resolved = default_mode();
    resolved.id = id.to_string();
    resolved.extends = None;
    for mode in chain.into_iter().rev() {
        if !mode.observation_types.is_empty() {
            resolved.observation_types = mode.observation_types;
        }
        merge_unique(&mut resolved.concepts, mode.concepts);
        merge_unique(&mut resolved.entity_types, mode.entity_types);
        merge_unique(&mut resolved.relationship_types, mode.relationship_types);
    }
    resolved
}

fn load_mode_file(dir: &Path, id: &str) -> Option<Mode> {
    let path = dir.join(format!("{id}.json"));
    let contents = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<Mode>(&contents) {
        Ok(mode) => Some(mode),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unparseable mode file");
            None
        }
    }
}

fn merge_unique(into: &mut Vec<String>, from: Vec<String>) {
    for item in from {
        if !into.iter().any(|existing| existing.eq_ignore_ascii_case(&item)) {
            into.push(item);
        }
    }
}
