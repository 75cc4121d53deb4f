//! Observation repository — the write path and row-level reads.
//!
//! `create` assigns identity and writes the row plus its FTS entry in one
//! transaction. `update` never mutates: it creates a successor row and marks
//! the predecessor superseded atomically. `delete` tombstones the row and
//! removes it from the FTS and vector indexes, leaving it addressable by id
//! for audit. Vector-path failures degrade to empty results so hybrid search
//! loses a signal instead of erroring.

use rusqlite::{params, types::ToSql, Connection, OptionalExtension, Transaction};

use crate::error::{MemError, Result};
use crate::memory::embedding_to_bytes;
use crate::memory::types::{
    approx_tokens, Observation, ObservationDraft, ObservationPatch, ObservationState,
    ObservationType, Scope,
};

const OBS_COLUMNS: &str = "id, session_id, scope, type, title, subtitle, narrative, facts, \
     concepts, files_read, files_modified, raw_tool_output, tool_name, created_at, \
     token_count, discovery_tokens, importance, revision_of, superseded_by, \
     superseded_at, deleted_at";

/// Filters accepted by [`search`]. All provided filters are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub query: String,
    pub project_path: Option<String>,
    pub session_id: Option<String>,
    pub observation_type: Option<ObservationType>,
    pub importance_min: Option<u8>,
    pub importance_max: Option<u8>,
    pub created_after: Option<String>,
    pub created_before: Option<String>,
    pub concepts: Vec<String>,
    pub files: Vec<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Options for [`list_by_project`].
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub limit: usize,
    pub offset: usize,
    pub observation_type: Option<ObservationType>,
    pub session_id: Option<String>,
    pub state: ObservationState,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            observation_type: None,
            session_id: None,
            state: ObservationState::Current,
        }
    }
}

// ── Write path ────────────────────────────────────────────────────────────────

/// Create a new observation from a draft. Assigns id and `created_at`,
/// computes token costs once, writes the row and its FTS entry, and bumps the
/// session's observation count.
pub fn create(conn: &mut Connection, session_id: &str, draft: &ObservationDraft) -> Result<Observation> {
    validate_draft(draft)?;

    let tx = conn.transaction()?;
    let obs = insert_observation(&tx, session_id, draft, None)?;
    tx.commit()?;
    Ok(obs)
}

/// Create a revision: a new active row with the patched fields copied from
/// the existing row; the predecessor is marked superseded in the same
/// transaction. Fails with `NotFound` when `id` is absent or not active.
pub fn update(conn: &mut Connection, id: &str, patch: &ObservationPatch) -> Result<Observation> {
    if let Some(importance) = patch.importance {
        validate_importance(importance)?;
    }

    let tx = conn.transaction()?;

    let old = fetch_by_id(&tx, id)?
        .filter(Observation::is_active)
        .ok_or_else(|| MemError::NotFound(format!("active observation {id}")))?;

    let draft = ObservationDraft {
        observation_type: Some(patch.observation_type.unwrap_or(old.observation_type)),
        title: patch.title.clone().unwrap_or_else(|| old.title.clone()),
        subtitle: patch.subtitle.clone().or_else(|| old.subtitle.clone()),
        narrative: patch
            .narrative
            .clone()
            .unwrap_or_else(|| old.narrative.clone()),
        facts: patch.facts.clone().unwrap_or_else(|| old.facts.clone()),
        concepts: patch
            .concepts
            .clone()
            .unwrap_or_else(|| old.concepts.clone()),
        files_read: patch
            .files_read
            .clone()
            .unwrap_or_else(|| old.files_read.clone()),
        files_modified: patch
            .files_modified
            .clone()
            .unwrap_or_else(|| old.files_modified.clone()),
        raw_tool_output: old.raw_tool_output.clone(),
        tool_name: old.tool_name.clone(),
        importance: Some(patch.importance.unwrap_or(old.importance)),
        scope: Some(old.scope),
        discovery_tokens: old.discovery_tokens,
    };

    let new = insert_observation(&tx, &old.session_id, &draft, Some(&old.id))?;

    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE observations SET superseded_by = ?1, superseded_at = ?2 WHERE id = ?3",
        params![new.id, now, old.id],
    )?;
    // The predecessor leaves the KNN index; its FTS row is state-filtered out.
    vec_delete(&tx, &old.id);

    tx.commit()?;
    Ok(new)
}

/// Tombstone an active observation: sets `deletedAt` and removes the FTS and
/// vector entries. The row stays addressable by id for audit.
pub fn delete(conn: &mut Connection, id: &str) -> Result<()> {
    let tx = conn.transaction()?;

    let rowid: i64 = tx
        .query_row(
            "SELECT rowid FROM observations \
             WHERE id = ?1 AND superseded_by IS NULL AND deleted_at IS NULL",
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| MemError::NotFound(format!("active observation {id}")))?;

    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE observations SET deleted_at = ?1 WHERE id = ?2",
        params![now, id],
    )?;
    tx.execute(
        "DELETE FROM observations_fts WHERE rowid = ?1",
        params![rowid],
    )?;
    vec_delete(&tx, id);

    tx.commit()?;
    Ok(())
}

fn insert_observation(
    tx: &Transaction,
    session_id: &str,
    draft: &ObservationDraft,
    revision_of: Option<&str>,
) -> Result<Observation> {
    let id = uuid::Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let session_exists: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM sessions WHERE id = ?1",
        params![session_id],
        |row| row.get(0),
    )?;
    if !session_exists {
        return Err(MemError::NotFound(format!("session {session_id}")));
    }

    let observation_type = draft.observation_type.unwrap_or(ObservationType::Discovery);
    let importance = draft.importance.unwrap_or(3);
    validate_importance(importance)?;

    // Token costs are computed once at creation and never mutated.
    let distilled = format!(
        "{} {} {}",
        draft.title,
        draft.narrative,
        draft.facts.join(" ")
    );
    let token_count = approx_tokens(&distilled);

    tx.execute(
        "INSERT INTO observations \
         (id, session_id, scope, type, title, subtitle, narrative, facts, concepts, \
          files_read, files_modified, raw_tool_output, tool_name, created_at, \
          token_count, discovery_tokens, importance, revision_of) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            id,
            session_id,
            draft.scope.unwrap_or_default().as_str(),
            observation_type.as_str(),
            draft.title,
            draft.subtitle,
            draft.narrative,
            serde_json::to_string(&draft.facts)?,
            serde_json::to_string(&draft.concepts)?,
            serde_json::to_string(&draft.files_read)?,
            serde_json::to_string(&draft.files_modified)?,
            draft.raw_tool_output,
            draft.tool_name,
            now,
            token_count,
            draft.discovery_tokens,
            importance,
            revision_of,
        ],
    )?;
    let rowid = tx.last_insert_rowid();

    insert_fts(tx, rowid, &id, draft)?;

    tx.execute(
        "UPDATE sessions SET observation_count = observation_count + 1 WHERE id = ?1",
        params![session_id],
    )?;

    fetch_by_id(tx, &id)?.ok_or_else(|| MemError::Internal("created row vanished".into()))
}

fn insert_fts(tx: &Transaction, rowid: i64, id: &str, draft: &ObservationDraft) -> Result<()> {
    let mut files = draft.files_read.clone();
    files.extend(draft.files_modified.iter().cloned());
    tx.execute(
        "INSERT INTO observations_fts (rowid, title, narrative, facts, concepts, files, id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            rowid,
            draft.title,
            draft.narrative,
            draft.facts.join("\n"),
            draft.concepts.join(" "),
            files.join("\n"),
            id,
        ],
    )?;
    Ok(())
}

fn validate_draft(draft: &ObservationDraft) -> Result<()> {
    if draft.title.trim().is_empty() {
        return Err(MemError::Validation("title must not be empty".into()));
    }
    if draft.narrative.trim().is_empty() {
        return Err(MemError::Validation("narrative must not be empty".into()));
    }
    if let Some(importance) = draft.importance {
        validate_importance(importance)?;
    }
    Ok(())
}

fn validate_importance(importance: u8) -> Result<()> {
    if !(1..=5).contains(&importance) {
        return Err(MemError::Validation(format!(
            "importance must be 1..=5, got {importance}"
        )));
    }
    Ok(())
}

/// Insert a fully-formed observation verbatim, preserving id, timestamps,
/// and lineage pointers. Used by import; active rows also get an FTS entry.
pub fn insert_raw(conn: &mut Connection, obs: &Observation) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO observations \
         (id, session_id, scope, type, title, subtitle, narrative, facts, concepts, \
          files_read, files_modified, raw_tool_output, tool_name, created_at, \
          token_count, discovery_tokens, importance, revision_of, superseded_by, \
          superseded_at, deleted_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
                 ?18, ?19, ?20, ?21)",
        params![
            obs.id,
            obs.session_id,
            obs.scope.as_str(),
            obs.observation_type.as_str(),
            obs.title,
            obs.subtitle,
            obs.narrative,
            serde_json::to_string(&obs.facts)?,
            serde_json::to_string(&obs.concepts)?,
            serde_json::to_string(&obs.files_read)?,
            serde_json::to_string(&obs.files_modified)?,
            obs.raw_tool_output,
            obs.tool_name,
            obs.created_at,
            obs.token_count,
            obs.discovery_tokens,
            obs.importance,
            obs.revision_of,
            obs.superseded_by,
            obs.superseded_at,
            obs.deleted_at,
        ],
    )?;

    if obs.is_active() {
        let rowid = tx.last_insert_rowid();
        let draft = ObservationDraft {
            observation_type: Some(obs.observation_type),
            title: obs.title.clone(),
            subtitle: obs.subtitle.clone(),
            narrative: obs.narrative.clone(),
            facts: obs.facts.clone(),
            concepts: obs.concepts.clone(),
            files_read: obs.files_read.clone(),
            files_modified: obs.files_modified.clone(),
            raw_tool_output: obs.raw_tool_output.clone(),
            tool_name: obs.tool_name.clone(),
            importance: Some(obs.importance),
            scope: Some(obs.scope),
            discovery_tokens: obs.discovery_tokens,
        };
        insert_fts(&tx, rowid, &obs.id, &draft)?;
    }

    tx.execute(
        "UPDATE sessions SET observation_count = observation_count + 1 WHERE id = ?1",
        params![obs.session_id],
    )?;

    tx.commit()?;
    Ok(())
}

// ── Reads ─────────────────────────────────────────────────────────────────────

/// Active-only read. Superseded and tombstoned rows return `None`.
pub fn get(conn: &Connection, id: &str) -> Result<Option<Observation>> {
    Ok(fetch_by_id(conn, id)?.filter(Observation::is_active))
}

/// Audit read: returns the row regardless of lineage state.
pub fn get_including_archived(conn: &Connection, id: &str) -> Result<Option<Observation>> {
    fetch_by_id(conn, id)
}

/// Project-scoped listing, paginated stably over `createdAt DESC, id DESC`.
pub fn list_by_project(
    conn: &Connection,
    project_path: &str,
    opts: &ListOptions,
) -> Result<Vec<Observation>> {
    let mut sql = format!(
        "SELECT {cols} FROM observations o \
         JOIN sessions s ON s.id = o.session_id \
         WHERE s.project_path = ?1",
        cols = qualified_columns()
    );
    let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(project_path.to_string())];

    push_state_clause(&mut sql, opts.state);
    if let Some(t) = opts.observation_type {
        params.push(Box::new(t.as_str().to_string()));
        sql.push_str(&format!(" AND o.type = ?{}", params.len()));
    }
    if let Some(ref sid) = opts.session_id {
        params.push(Box::new(sid.clone()));
        sql.push_str(&format!(" AND o.session_id = ?{}", params.len()));
    }

    params.push(Box::new(opts.limit as i64));
    sql.push_str(&format!(
        " ORDER BY o.created_at DESC, o.id DESC LIMIT ?{}",
        params.len()
    ));
    params.push(Box::new(opts.offset as i64));
    sql.push_str(&format!(" OFFSET ?{}", params.len()));

    query_observations(conn, &sql, &params)
}

/// Cross-session window of active rows strictly before then strictly after
/// `ts`, concatenated in chronological order.
pub fn get_around_timestamp(
    conn: &Connection,
    ts: &str,
    before: usize,
    after: usize,
    project_path: &str,
) -> Result<Vec<Observation>> {
    let before_sql = format!(
        "SELECT {cols} FROM observations o \
         JOIN sessions s ON s.id = o.session_id \
         WHERE s.project_path = ?1 AND o.created_at < ?2 \
           AND o.superseded_by IS NULL AND o.deleted_at IS NULL \
         ORDER BY o.created_at DESC, o.id DESC LIMIT ?3",
        cols = qualified_columns()
    );
    let after_sql = format!(
        "SELECT {cols} FROM observations o \
         JOIN sessions s ON s.id = o.session_id \
         WHERE s.project_path = ?1 AND o.created_at > ?2 \
           AND o.superseded_by IS NULL AND o.deleted_at IS NULL \
         ORDER BY o.created_at ASC, o.id ASC LIMIT ?3",
        cols = qualified_columns()
    );

    let params: Vec<Box<dyn ToSql>> = vec![
        Box::new(project_path.to_string()),
        Box::new(ts.to_string()),
        Box::new(before as i64),
    ];
    let mut earlier = query_observations(conn, &before_sql, &params)?;
    earlier.reverse();

    let params: Vec<Box<dyn ToSql>> = vec![
        Box::new(project_path.to_string()),
        Box::new(ts.to_string()),
        Box::new(after as i64),
    ];
    let later = query_observations(conn, &after_sql, &params)?;

    earlier.extend(later);
    Ok(earlier)
}

/// Full revision chain from oldest to newest: follows `revisionOf` backwards
/// then `supersededBy` forwards from `id`. Cycle-safe via a visited set.
pub fn get_lineage(conn: &Connection, id: &str) -> Result<Vec<Observation>> {
    let start = fetch_by_id(conn, id)?
        .ok_or_else(|| MemError::NotFound(format!("observation {id}")))?;

    let mut visited: std::collections::HashSet<String> = std::collections::HashSet::new();
    visited.insert(start.id.clone());

    let mut chain = std::collections::VecDeque::new();
    chain.push_back(start.clone());

    let mut cursor = start.revision_of.clone();
    while let Some(prev_id) = cursor {
        if !visited.insert(prev_id.clone()) {
            break;
        }
        match fetch_by_id(conn, &prev_id)? {
            Some(prev) => {
                cursor = prev.revision_of.clone();
                chain.push_front(prev);
            }
            None => break,
        }
    }

    let mut cursor = start.superseded_by;
    while let Some(next_id) = cursor {
        if !visited.insert(next_id.clone()) {
            break;
        }
        match fetch_by_id(conn, &next_id)? {
            Some(next) => {
                cursor = next.superseded_by.clone();
                chain.push_back(next);
            }
            None => break,
        }
    }

    Ok(chain.into())
}

// ── Full-text search ──────────────────────────────────────────────────────────

/// FTS match with conjunctive filters, ranked by the FTS rank score ascending
/// (lower is better). Project isolation goes through the session join.
pub fn search(conn: &Connection, q: &SearchQuery) -> Result<Vec<(Observation, f64)>> {
    let escaped = escape_fts_query(&q.query);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = format!(
        "SELECT {cols}, f.rank FROM observations_fts f \
         JOIN observations o ON o.id = f.id \
         JOIN sessions s ON s.id = o.session_id \
         WHERE observations_fts MATCH ?1 \
           AND o.superseded_by IS NULL AND o.deleted_at IS NULL",
        cols = qualified_columns()
    );
    let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(escaped)];
    push_filters(&mut sql, &mut params, q);

    // Over-fetch so post-filters on set membership still fill the page.
    let fetch = (q.limit + q.offset).max(1) * 4;
    params.push(Box::new(fetch as i64));
    sql.push_str(&format!(" ORDER BY f.rank ASC LIMIT ?{}", params.len()));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok((row_to_observation(row)?, row.get::<_, f64>(21)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let filtered: Vec<(Observation, f64)> = rows
        .into_iter()
        .filter(|(obs, _)| matches_set_filters(obs, &q.concepts, &q.files))
        .skip(q.offset)
        .take(q.limit)
        .collect();
    Ok(filtered)
}

/// FTS over the concepts column only, rank ascending.
pub fn search_by_concept(
    conn: &Connection,
    concept: &str,
    limit: usize,
    project_path: Option<&str>,
) -> Result<Vec<(Observation, f64)>> {
    search_column(conn, "concepts", concept, limit, project_path)
}

/// FTS over the files column only, rank ascending.
pub fn search_by_file(
    conn: &Connection,
    file: &str,
    limit: usize,
    project_path: Option<&str>,
) -> Result<Vec<(Observation, f64)>> {
    search_column(conn, "files", file, limit, project_path)
}

fn search_column(
    conn: &Connection,
    column: &str,
    term: &str,
    limit: usize,
    project_path: Option<&str>,
) -> Result<Vec<(Observation, f64)>> {
    let clean = term.replace('"', "");
    if clean.trim().is_empty() {
        return Ok(Vec::new());
    }
    let match_expr = format!("{column} : \"{clean}\"");

    let mut sql = format!(
        "SELECT {cols}, f.rank FROM observations_fts f \
         JOIN observations o ON o.id = f.id \
         JOIN sessions s ON s.id = o.session_id \
         WHERE observations_fts MATCH ?1 \
           AND o.superseded_by IS NULL AND o.deleted_at IS NULL",
        cols = qualified_columns()
    );
    let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(match_expr)];
    if let Some(project) = project_path {
        params.push(Box::new(project.to_string()));
        sql.push_str(&format!(" AND s.project_path = ?{}", params.len()));
    }
    params.push(Box::new(limit as i64));
    sql.push_str(&format!(" ORDER BY f.rank ASC LIMIT ?{}", params.len()));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok((row_to_observation(row)?, row.get::<_, f64>(21)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Escape a user query for FTS5 MATCH syntax: each word quoted, implicit AND.
pub fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| {
            let clean = word.replace('"', "");
            format!("\"{clean}\"")
        })
        .filter(|w| w != "\"\"")
        .collect::<Vec<_>>()
        .join(" ")
}

fn push_filters(sql: &mut String, params: &mut Vec<Box<dyn ToSql>>, q: &SearchQuery) {
    if let Some(ref project) = q.project_path {
        params.push(Box::new(project.clone()));
        sql.push_str(&format!(" AND s.project_path = ?{}", params.len()));
    }
    if let Some(ref sid) = q.session_id {
        params.push(Box::new(sid.clone()));
        sql.push_str(&format!(" AND o.session_id = ?{}", params.len()));
    }
    if let Some(t) = q.observation_type {
        params.push(Box::new(t.as_str().to_string()));
        sql.push_str(&format!(" AND o.type = ?{}", params.len()));
    }
    if let Some(min) = q.importance_min {
        params.push(Box::new(min as i64));
        sql.push_str(&format!(" AND o.importance >= ?{}", params.len()));
    }
    if let Some(max) = q.importance_max {
        params.push(Box::new(max as i64));
        sql.push_str(&format!(" AND o.importance <= ?{}", params.len()));
    }
    if let Some(ref after) = q.created_after {
        params.push(Box::new(after.clone()));
        sql.push_str(&format!(" AND o.created_at >= ?{}", params.len()));
    }
    if let Some(ref before) = q.created_before {
        params.push(Box::new(before.clone()));
        sql.push_str(&format!(" AND o.created_at <= ?{}", params.len()));
    }
}

/// Conjunction over set-valued filters, case-insensitive membership.
pub fn matches_set_filters(obs: &Observation, concepts: &[String], files: &[String]) -> bool {
    let has = |haystack: &[String], needle: &str| {
        haystack.iter().any(|c| c.eq_ignore_ascii_case(needle))
    };
    for concept in concepts {
        if !has(&obs.concepts, concept) {
            return false;
        }
    }
    for file in files {
        if !has(&obs.files_read, file) && !has(&obs.files_modified, file) {
            return false;
        }
    }
    true
}

// ── Vector operations ─────────────────────────────────────────────────────────

/// Store the raw embedding on the observation row (used by the brute-force
/// similarity path).
pub fn set_embedding(conn: &Connection, id: &str, embedding: &[f32]) -> Result<()> {
    let updated = conn.execute(
        "UPDATE observations SET embedding = ?1 WHERE id = ?2",
        params![embedding_to_bytes(embedding), id],
    )?;
    if updated == 0 {
        return Err(MemError::NotFound(format!("observation {id}")));
    }
    Ok(())
}

/// Brute-force cosine similarity over the most recent `recent_n` active rows
/// of a type. Used only for dedupe/conflict evaluation.
pub fn find_similar(
    conn: &Connection,
    embedding: &[f32],
    observation_type: ObservationType,
    threshold: f64,
    limit: usize,
    recent_n: usize,
) -> Result<Vec<(Observation, f64)>> {
    let sql = format!(
        "SELECT {cols}, o.embedding FROM observations o \
         WHERE o.type = ?1 AND o.embedding IS NOT NULL \
           AND o.superseded_by IS NULL AND o.deleted_at IS NULL \
         ORDER BY o.created_at DESC, o.id DESC LIMIT ?2",
        cols = qualified_columns()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![observation_type.as_str(), recent_n as i64],
            |row| {
                let obs = row_to_observation(row)?;
                let blob: Vec<u8> = row.get(21)?;
                Ok((obs, blob))
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut scored: Vec<(Observation, f64)> = rows
        .into_iter()
        .filter_map(|(obs, blob)| {
            let vector = bytes_to_embedding(&blob);
            let sim = crate::memory::cosine_similarity(embedding, &vector);
            (sim >= threshold).then_some((obs, sim))
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    Ok(scored)
}

/// Replace the vector-index entry for an observation (delete + insert).
pub fn vec_upsert(conn: &mut Connection, id: &str, vector: &[f32]) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM observations_vec WHERE id = ?1",
        params![id],
    )?;
    tx.execute(
        "INSERT INTO observations_vec (id, embedding) VALUES (?1, ?2)",
        params![id, embedding_to_bytes(vector)],
    )?;
    tx.commit()?;
    Ok(())
}

/// Native KNN search. Returns `(id, distance)` pairs ordered by distance.
/// Failures degrade to empty so hybrid search loses a signal, not the query.
pub fn vec_search(conn: &Connection, query: &[f32], k: usize) -> Vec<(String, f64)> {
    let result = (|| -> rusqlite::Result<Vec<(String, f64)>> {
        let mut stmt = conn.prepare(
            "SELECT id, distance FROM observations_vec \
             WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![embedding_to_bytes(query), k as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    })();

    match result {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, "vector search failed, degrading to empty");
            Vec::new()
        }
    }
}

/// KNN restricted to a candidate id set. Over-fetches then filters, since
/// vec0 MATCH cannot be combined with an IN constraint.
pub fn vec_search_subset(
    conn: &Connection,
    query: &[f32],
    candidate_ids: &[String],
    k: usize,
) -> Vec<(String, f64)> {
    if candidate_ids.is_empty() {
        return Vec::new();
    }
    let candidates: std::collections::HashSet<&str> =
        candidate_ids.iter().map(String::as_str).collect();
    vec_search(conn, query, k + candidate_ids.len())
        .into_iter()
        .filter(|(id, _)| candidates.contains(id.as_str()))
        .take(k)
        .collect()
}

fn vec_delete(tx: &Transaction, id: &str) {
    if let Err(e) = tx.execute("DELETE FROM observations_vec WHERE id = ?1", params![id]) {
        tracing::warn!(id, error = %e, "failed to remove vector entry");
    }
}

fn bytes_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

// ── Row mapping ───────────────────────────────────────────────────────────────

fn qualified_columns() -> String {
    OBS_COLUMNS
        .split(", ")
        .map(|c| format!("o.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn push_state_clause(sql: &mut String, state: ObservationState) {
    match state {
        ObservationState::Current => {
            sql.push_str(" AND o.superseded_by IS NULL AND o.deleted_at IS NULL")
        }
        ObservationState::Superseded => {
            sql.push_str(" AND o.superseded_by IS NOT NULL AND o.deleted_at IS NULL")
        }
        ObservationState::Deleted => sql.push_str(" AND o.deleted_at IS NOT NULL"),
        ObservationState::All => {}
    }
}

fn fetch_by_id(conn: &Connection, id: &str) -> Result<Option<Observation>> {
    let sql = format!("SELECT {OBS_COLUMNS} FROM observations WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id], row_to_observation)
        .optional()?)
}

fn query_observations(
    conn: &Connection,
    sql: &str,
    params: &[Box<dyn ToSql>],
) -> Result<Vec<Observation>> {
    let mut stmt = conn.prepare(sql)?;
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), row_to_observation)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn row_to_observation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Observation> {
    let scope_str: String = row.get(2)?;
    let type_str: String = row.get(3)?;
    let parse_list = |idx: usize| -> rusqlite::Result<Vec<String>> {
        let raw: String = row.get(idx)?;
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    };

    Ok(Observation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        scope: scope_str.parse().unwrap_or(Scope::Project),
        observation_type: type_str
            .parse()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        title: row.get(4)?,
        subtitle: row.get(5)?,
        narrative: row.get(6)?,
        facts: parse_list(7)?,
        concepts: parse_list(8)?,
        files_read: parse_list(9)?,
        files_modified: parse_list(10)?,
        raw_tool_output: row.get(11)?,
        tool_name: row.get(12)?,
        created_at: row.get(13)?,
        token_count: row.get(14)?,
        discovery_tokens: row.get(15)?,
        importance: row.get(16)?,
        revision_of: row.get(17)?,
        superseded_by: row.get(18)?,
        superseded_at: row.get(19)?,
        deleted_at: row.get(20)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::sessions;

    fn test_db() -> Connection {
        db::open_memory_database().unwrap()
    }

    fn seed_session(conn: &Connection, project: &str) -> String {
        sessions::get_or_create(conn, None, project).unwrap().id
    }

    fn draft(title: &str, narrative: &str) -> ObservationDraft {
        ObservationDraft {
            observation_type: Some(ObservationType::Discovery),
            title: title.into(),
            narrative: narrative.into(),
            discovery_tokens: 100,
            ..ObservationDraft::default()
        }
    }

    #[test]
    fn create_writes_row_and_fts() {
        let mut conn = test_db();
        let sid = seed_session(&conn, "/project/alpha");

        let obs = create(&mut conn, &sid, &draft("Parser rewrite", "rewrote the parser")).unwrap();
        assert!(obs.is_active());
        assert!(obs.token_count > 0);
        assert_eq!(obs.discovery_tokens, 100);

        let fts_id: String = conn
            .query_row(
                "SELECT id FROM observations_fts WHERE observations_fts MATCH 'parser'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(fts_id, obs.id);

        // Session observation count is bumped.
        let count: u32 = conn
            .query_row(
                "SELECT observation_count FROM sessions WHERE id = ?1",
                params![sid],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn create_rejects_empty_title() {
        let mut conn = test_db();
        let sid = seed_session(&conn, "/p");
        let err = create(&mut conn, &sid, &draft("", "narrative")).unwrap_err();
        assert!(matches!(err, MemError::Validation(_)));
    }

    #[test]
    fn create_rejects_unknown_session() {
        let mut conn = test_db();
        let err = create(&mut conn, "missing", &draft("t", "n")).unwrap_err();
        assert!(matches!(err, MemError::NotFound(_)));
    }

    #[test]
    fn update_creates_revision_chain() {
        let mut conn = test_db();
        let sid = seed_session(&conn, "/p");
        let o1 = create(&mut conn, &sid, &draft("Fact", "x")).unwrap();

        let patch = ObservationPatch {
            narrative: Some("y".into()),
            ..ObservationPatch::default()
        };
        let o2 = update(&mut conn, &o1.id, &patch).unwrap();

        assert_ne!(o1.id, o2.id);
        assert_eq!(o2.revision_of.as_deref(), Some(o1.id.as_str()));
        assert_eq!(o2.narrative, "y");
        assert_eq!(o2.title, "Fact");

        // Predecessor: gone from active reads, visible to audit reads.
        assert!(get(&conn, &o1.id).unwrap().is_none());
        let archived = get_including_archived(&conn, &o1.id).unwrap().unwrap();
        assert_eq!(archived.superseded_by.as_deref(), Some(o2.id.as_str()));
        assert!(archived.superseded_at.is_some());

        let lineage = get_lineage(&conn, &o2.id).unwrap();
        let ids: Vec<&str> = lineage.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec![o1.id.as_str(), o2.id.as_str()]);

        // Lineage from the head resolves the same chain.
        let lineage = get_lineage(&conn, &o1.id).unwrap();
        assert_eq!(lineage.len(), 2);
    }

    #[test]
    fn update_of_superseded_row_fails() {
        let mut conn = test_db();
        let sid = seed_session(&conn, "/p");
        let o1 = create(&mut conn, &sid, &draft("Fact", "x")).unwrap();
        let patch = ObservationPatch {
            narrative: Some("y".into()),
            ..ObservationPatch::default()
        };
        update(&mut conn, &o1.id, &patch).unwrap();

        let err = update(&mut conn, &o1.id, &patch).unwrap_err();
        assert!(matches!(err, MemError::NotFound(_)));
    }

    #[test]
    fn delete_tombstones_and_clears_indexes() {
        let mut conn = test_db();
        let sid = seed_session(&conn, "/p");
        let obs = create(&mut conn, &sid, &draft("hide-me", "should disappear")).unwrap();
        vec_upsert(&mut conn, &obs.id, &vec![1.0f32; crate::ai::EMBEDDING_DIM]).unwrap();

        delete(&mut conn, &obs.id).unwrap();

        assert!(get(&conn, &obs.id).unwrap().is_none());
        let audited = get_including_archived(&conn, &obs.id).unwrap().unwrap();
        assert!(audited.deleted_at.is_some());

        let fts_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM observations_fts WHERE observations_fts MATCH '\"hide-me\"'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(fts_count, 0);

        let vec_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM observations_vec WHERE id = ?1",
                params![obs.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(vec_count, 0);

        assert!(matches!(
            delete(&mut conn, &obs.id).unwrap_err(),
            MemError::NotFound(_)
        ));
    }

    #[test]
    fn search_is_project_scoped() {
        let mut conn = test_db();
        let alpha = seed_session(&conn, "/project/alpha");
        let beta = seed_session(&conn, "/project/beta");

        let mut d = draft("Alpha JWT authentication pattern", "JWT auth in alpha");
        d.concepts = vec!["JWT".into(), "authentication".into()];
        create(&mut conn, &alpha, &d).unwrap();

        let mut d = draft("Beta JWT token validation", "JWT validation in beta");
        d.concepts = vec!["JWT".into(), "validation".into()];
        create(&mut conn, &beta, &d).unwrap();

        let results = search(
            &conn,
            &SearchQuery {
                query: "JWT".into(),
                project_path: Some("/project/alpha".into()),
                limit: 10,
                ..SearchQuery::default()
            },
        )
        .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].0.title.starts_with("Alpha"));
    }

    #[test]
    fn search_by_concept_uses_concept_column_only() {
        let mut conn = test_db();
        let sid = seed_session(&conn, "/p");

        let mut d = draft("Auth work", "narrative without the tag");
        d.concepts = vec!["authentication".into()];
        let tagged = create(&mut conn, &sid, &d).unwrap();

        // The word appears in the narrative but not as a concept.
        create(
            &mut conn,
            &sid,
            &draft("Other", "we discussed authentication here"),
        )
        .unwrap();

        let results = search_by_concept(&conn, "authentication", 10, Some("/p")).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, tagged.id);
    }

    #[test]
    fn search_by_file_matches_both_file_sets() {
        let mut conn = test_db();
        let sid = seed_session(&conn, "/p");

        let mut d = draft("Auth change", "edited the auth module");
        d.files_modified = vec!["src/auth.ts".into()];
        let modified = create(&mut conn, &sid, &d).unwrap();

        let mut d = draft("Auth read", "read the auth module");
        d.files_read = vec!["src/auth.ts".into()];
        let read = create(&mut conn, &sid, &d).unwrap();

        let results = search_by_file(&conn, "src/auth.ts", 10, Some("/p")).unwrap();
        let ids: Vec<&str> = results.iter().map(|(o, _)| o.id.as_str()).collect();
        assert!(ids.contains(&modified.id.as_str()));
        assert!(ids.contains(&read.id.as_str()));
    }

    #[test]
    fn list_by_project_filters_state() {
        let mut conn = test_db();
        let sid = seed_session(&conn, "/p");
        let o1 = create(&mut conn, &sid, &draft("One", "n")).unwrap();
        let patch = ObservationPatch {
            narrative: Some("revised".into()),
            ..ObservationPatch::default()
        };
        let o2 = update(&mut conn, &o1.id, &patch).unwrap();

        let current = list_by_project(&conn, "/p", &ListOptions::default()).unwrap();
        let ids: Vec<&str> = current.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec![o2.id.as_str()]);

        let superseded = list_by_project(
            &conn,
            "/p",
            &ListOptions {
                state: ObservationState::Superseded,
                ..ListOptions::default()
            },
        )
        .unwrap();
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].id, o1.id);

        let all = list_by_project(
            &conn,
            "/p",
            &ListOptions {
                state: ObservationState::All,
                ..ListOptions::default()
            },
        )
        .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn around_timestamp_window_is_chronological() {
        let mut conn = test_db();
        let sid = seed_session(&conn, "/p");
        let mut ids = Vec::new();
        for i in 0..5 {
            let obs = create(&mut conn, &sid, &draft(&format!("Obs {i}"), "n")).unwrap();
            ids.push((obs.id.clone(), obs.created_at.clone()));
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let anchor = &ids[2].1;
        let window = get_around_timestamp(&conn, anchor, 2, 2, "/p").unwrap();
        let got: Vec<&str> = window.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(
            got,
            vec![ids[0].0.as_str(), ids[1].0.as_str(), ids[3].0.as_str(), ids[4].0.as_str()]
        );
    }

    #[test]
    fn find_similar_respects_type_and_threshold() {
        let mut conn = test_db();
        let sid = seed_session(&conn, "/p");

        let mut spike_a = vec![0.0f32; crate::ai::EMBEDDING_DIM];
        spike_a[0] = 1.0;
        let mut spike_b = vec![0.0f32; crate::ai::EMBEDDING_DIM];
        spike_b[7] = 1.0;

        let mut d = draft("Similar", "n");
        d.observation_type = Some(ObservationType::Decision);
        let near = create(&mut conn, &sid, &d).unwrap();
        set_embedding(&conn, &near.id, &spike_a).unwrap();

        let far = create(&mut conn, &sid, &draft("Far", "n")).unwrap();
        set_embedding(&conn, &far.id, &spike_b).unwrap();

        let hits = find_similar(&conn, &spike_a, ObservationType::Decision, 0.8, 5, 100).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, near.id);
        assert!(hits[0].1 > 0.99);

        // Discovery-typed rows are not considered for a decision query.
        let hits = find_similar(&conn, &spike_b, ObservationType::Decision, 0.8, 5, 100).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn vec_search_roundtrip_and_subset() {
        let mut conn = test_db();
        let sid = seed_session(&conn, "/p");
        let a = create(&mut conn, &sid, &draft("A", "n")).unwrap();
        let b = create(&mut conn, &sid, &draft("B", "n")).unwrap();

        let mut spike_a = vec![0.0f32; crate::ai::EMBEDDING_DIM];
        spike_a[0] = 1.0;
        let mut spike_b = vec![0.0f32; crate::ai::EMBEDDING_DIM];
        spike_b[1] = 1.0;
        vec_upsert(&mut conn, &a.id, &spike_a).unwrap();
        vec_upsert(&mut conn, &b.id, &spike_b).unwrap();

        let hits = vec_search(&conn, &spike_a, 2);
        assert_eq!(hits[0].0, a.id);

        let subset = vec_search_subset(&conn, &spike_a, &[b.id.clone()], 2);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].0, b.id);
    }

    #[test]
    fn escape_fts_query_quotes_words() {
        assert_eq!(escape_fts_query("hello world"), "\"hello\" \"world\"");
        assert_eq!(escape_fts_query("a \"quoted\" term"), "\"a\" \"quoted\" \"term\"");
        assert_eq!(escape_fts_query("  "), "");
    }
}
