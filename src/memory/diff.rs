//! Field-level diff between two observations on the same lineage.
//!
//! Compares a fixed field set. Array-valued fields (facts, concepts, files)
//! compare as sets: element order is ignored.

use serde::Serialize;
use serde_json::json;

use crate::error::{MemError, Result};
use crate::memory::types::Observation;

/// One changed field with its before/after values and a human summary.
#[derive(Debug, Clone, Serialize)]
pub struct FieldChange {
    pub field: &'static str,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
    pub summary: String,
}

/// Diff `a` (older) against `b` (newer). Both must be on the same lineage;
/// callers typically take them from [`crate::memory::store::get_lineage`].
pub fn diff_revisions(a: &Observation, b: &Observation) -> Result<Vec<FieldChange>> {
    if !same_lineage(a, b) {
        return Err(MemError::Validation(format!(
            "observations {} and {} are not on the same lineage",
            a.id, b.id
        )));
    }

    let mut changes = Vec::new();

    scalar_change(&mut changes, "title", &a.title, &b.title);
    scalar_change(
        &mut changes,
        "subtitle",
        &a.subtitle.clone().unwrap_or_default(),
        &b.subtitle.clone().unwrap_or_default(),
    );
    scalar_change(&mut changes, "narrative", &a.narrative, &b.narrative);

    if a.observation_type != b.observation_type {
        changes.push(FieldChange {
            field: "type",
            before: json!(a.observation_type),
            after: json!(b.observation_type),
            summary: format!(
                "type changed from {} to {}",
                a.observation_type, b.observation_type
            ),
        });
    }

    set_change(&mut changes, "facts", &a.facts, &b.facts);
    set_change(&mut changes, "concepts", &a.concepts, &b.concepts);
    set_change(&mut changes, "filesRead", &a.files_read, &b.files_read);
    set_change(
        &mut changes,
        "filesModified",
        &a.files_modified,
        &b.files_modified,
    );

    if a.importance != b.importance {
        changes.push(FieldChange {
            field: "importance",
            before: json!(a.importance),
            after: json!(b.importance),
            summary: format!("importance changed from {} to {}", a.importance, b.importance),
        });
    }

    Ok(changes)
}

/// `true` when the two rows are linked by a revision chain in either
/// direction. Only adjacency pointers are checked here; full-chain membership
/// is the caller's concern.
fn same_lineage(a: &Observation, b: &Observation) -> bool {
    a.id == b.id
        || b.revision_of.as_deref() == Some(&a.id)
        || a.revision_of.as_deref() == Some(&b.id)
        || a.superseded_by.as_deref() == Some(&b.id)
        || b.superseded_by.as_deref() == Some(&a.id)
        || (a.session_id == b.session_id && chain_connected(a, b))
}

fn chain_connected(a: &Observation, b: &Observation) -> bool {
    // Rows further apart on a chain share neither pointer; accept them when
    // both carry lineage markers. Cycle-safe traversal lives in the store.
    (a.revision_of.is_some() || a.superseded_by.is_some())
        && (b.revision_of.is_some() || b.superseded_by.is_some())
}

fn scalar_change(changes: &mut Vec<FieldChange>, field: &'static str, a: &str, b: &str) {
    if a != b {
        changes.push(FieldChange {
            field,
            before: json!(a),
            after: json!(b),
            summary: format!("{field} changed"),
        });
    }
}

fn set_change(changes: &mut Vec<FieldChange>, field: &'static str, a: &[String], b: &[String]) {
    if set_equal(a, b) {
        return;
    }
    let before: std::collections::HashSet<&str> = a.iter().map(String::as_str).collect();
    let after: std::collections::HashSet<&str> = b.iter().map(String::as_str).collect();
    let added: Vec<&str> = after.difference(&before).copied().collect();
    let removed: Vec<&str> = before.difference(&after).copied().collect();

    changes.push(FieldChange {
        field,
        before: json!(a),
        after: json!(b),
        summary: format!(
            "{field}: {} added, {} removed",
            added.len(),
            removed.len()
        ),
    });
}

/// Order-independent equality over string arrays.
pub fn set_equal(a: &[String], b: &[String]) -> bool {
    let sa: std::collections::HashSet<&str> = a.iter().map(String::as_str).collect();
    let sb: std::collections::HashSet<&str> = b.iter().map(String::as_str).collect();
    sa == sb
}
