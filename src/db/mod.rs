pub mod lock;
pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Handle returned by [`open_database`]: the connection plus the vector
/// capability flag the search orchestrator reads to decide whether the
/// semantic branch is available.
pub struct OpenedDatabase {
    pub conn: Connection,
    pub vector_enabled: bool,
}

/// Open (or create) the memory database at the given path, with extensions
/// loaded and schema initialized.
///
/// Directory creation failures are fatal; vec0 table creation failures are
/// not — vector search degrades to disabled.
pub fn open_database(path: impl AsRef<Path>, dimensions: usize) -> Result<OpenedDatabase> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let conn = Connection::open(path).with_context(|| {
        format!(
            "failed to open database at {}. If the file is corrupt, \
             restore from an `open-mem export` backup and start fresh.",
            path.display()
        )
    })?;

    // WAL for concurrent readers alongside the single writer
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // Wait up to 5 seconds for locks instead of failing immediately
    conn.pragma_update(None, "busy_timeout", "5000")?;

    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;

    let vector_enabled = match schema::init_vec_table(&conn, dimensions) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "vec0 table unavailable, vector search disabled");
            false
        }
    };

    if let Ok(Some(stored)) = migrations::get_embedding_dimensions(&conn) {
        if stored != dimensions {
            tracing::warn!(
                stored,
                configured = dimensions,
                "embedding dimension changed since the vec table was created"
            );
        }
    }

    let integrity: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
    if integrity != "ok" {
        anyhow::bail!("database integrity check failed: {integrity}");
    }

    tracing::info!(path = %path.display(), vector_enabled, "database initialized");
    Ok(OpenedDatabase {
        conn,
        vector_enabled,
    })
}

/// Result of a full database health check, surfaced on the query surface.
#[derive(Debug, serde::Serialize)]
pub struct HealthReport {
    pub schema_version: u32,
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub sqlite_vec_version: Option<String>,
    pub observation_count: i64,
    pub session_count: i64,
    pub pending_count: i64,
    pub entity_count: i64,
}

/// Run a comprehensive health check on the database.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let schema_version =
        migrations::get_schema_version(conn).context("failed to read schema version")?;

    let integrity_details: String = conn
        .pragma_query_value(None, "integrity_check", |row| row.get(0))
        .context("failed to run integrity check")?;
    let integrity_ok = integrity_details == "ok";

    let sqlite_vec_version: Option<String> = conn
        .query_row("SELECT vec_version()", [], |row| row.get(0))
        .ok();

    let count = |sql: &str| -> i64 { conn.query_row(sql, [], |row| row.get(0)).unwrap_or(0) };

    Ok(HealthReport {
        schema_version,
        integrity_ok,
        integrity_details,
        sqlite_vec_version,
        observation_count: count("SELECT COUNT(*) FROM observations"),
        session_count: count("SELECT COUNT(*) FROM sessions"),
        pending_count: count("SELECT COUNT(*) FROM pending_messages WHERE status = 'pending'"),
        entity_count: count("SELECT COUNT(*) FROM entities"),
    })
}

/// Open an in-memory database for testing.
pub fn open_memory_database() -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;
    schema::init_vec_table(&conn, crate::ai::EMBEDDING_DIM)
        .context("failed to create vec table")?;
    Ok(conn)
}
