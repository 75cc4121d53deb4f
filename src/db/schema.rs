//! SQL DDL for all open-mem tables.
//!
//! Defines `sessions`, `observations`, `observations_fts` (FTS5),
//! `observations_vec` (vec0), `session_summaries`, `pending_messages`,
//! `entities`, `entity_relationships`, and `schema_meta`. All DDL uses
//! `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

/// All schema DDL statements for the row tables.
const SCHEMA_SQL: &str = r#"
-- Session lifecycle rows; every observation belongs to exactly one session
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    project_path TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active','idle','completed')),
    observation_count INTEGER NOT NULL DEFAULT 0,
    summary_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_path);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

-- Immutable distilled memory records with revision lineage
CREATE TABLE IF NOT EXISTS observations (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    scope TEXT NOT NULL DEFAULT 'project' CHECK(scope IN ('project','user')),
    type TEXT NOT NULL CHECK(type IN ('decision','bugfix','feature','refactor','discovery','change')),
    title TEXT NOT NULL,
    subtitle TEXT,
    narrative TEXT NOT NULL,
    facts TEXT NOT NULL DEFAULT '[]',
    concepts TEXT NOT NULL DEFAULT '[]',
    files_read TEXT NOT NULL DEFAULT '[]',
    files_modified TEXT NOT NULL DEFAULT '[]',
    raw_tool_output TEXT,
    tool_name TEXT,
    created_at TEXT NOT NULL,
    token_count INTEGER NOT NULL DEFAULT 0,
    discovery_tokens INTEGER NOT NULL DEFAULT 0,
    importance INTEGER NOT NULL DEFAULT 3 CHECK(importance BETWEEN 1 AND 5),
    embedding BLOB,
    revision_of TEXT,
    superseded_by TEXT,
    superseded_at TEXT,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_observations_session ON observations(session_id);
CREATE INDEX IF NOT EXISTS idx_observations_type ON observations(type);
CREATE INDEX IF NOT EXISTS idx_observations_created ON observations(created_at);
CREATE INDEX IF NOT EXISTS idx_observations_superseded ON observations(superseded_by);

-- Full-text search (BM25) over the human-facing columns
CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    title,
    narrative,
    facts,
    concepts,
    files,
    id UNINDEXED
);

-- AI-generated per-session summaries
CREATE TABLE IF NOT EXISTS session_summaries (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    summary TEXT NOT NULL,
    key_decisions TEXT NOT NULL DEFAULT '[]',
    files_modified TEXT NOT NULL DEFAULT '[]',
    concepts TEXT NOT NULL DEFAULT '[]',
    request TEXT,
    investigated TEXT,
    learned TEXT,
    completed TEXT,
    next_steps TEXT,
    token_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_summaries_session ON session_summaries(session_id);

-- Durable queue of raw captures awaiting compression
CREATE TABLE IF NOT EXISTS pending_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    tool_output TEXT NOT NULL,
    call_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','processing','completed','failed')),
    retry_count INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    created_at TEXT NOT NULL,
    claimed_at TEXT,
    UNIQUE(session_id, call_id)
);

CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_messages(status, created_at);

-- Knowledge graph: entities deduped case-insensitively on (type, name)
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    name TEXT NOT NULL COLLATE NOCASE,
    description TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(entity_type, name)
);

CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(name);

-- Directed edges with the introducing observation as provenance
CREATE TABLE IF NOT EXISTS entity_relationships (
    id TEXT PRIMARY KEY,
    from_entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relationship_type TEXT NOT NULL,
    to_entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    observation_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(from_entity_id, relationship_type, to_entity_id)
);

CREATE INDEX IF NOT EXISTS idx_relationships_from ON entity_relationships(from_entity_id);
CREATE INDEX IF NOT EXISTS idx_relationships_to ON entity_relationships(to_entity_id);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all row tables and the FTS index. Idempotent.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

/// Create the vec0 virtual table with the configured embedding dimension.
///
/// Separate from [`init_schema`] because the dimension comes from config and
/// sqlite-vec uses its own DDL syntax. Returns `Err` when the extension is
/// unavailable; callers treat that as "vector search disabled".
pub fn init_vec_table(conn: &Connection, dimensions: usize) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS observations_vec USING vec0(
            id TEXT PRIMARY KEY,
            embedding FLOAT[{dimensions}]
        );"
    ))?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('embedding_dimensions', ?1)",
        [dimensions.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_vec_table(&conn, 384).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "sessions",
            "observations",
            "session_summaries",
            "pending_messages",
            "entities",
            "entity_relationships",
            "schema_meta",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }

        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        init_vec_table(&conn, 384).unwrap();
        init_vec_table(&conn, 384).unwrap();
    }
}
