use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::memory::types::ObservationType;

/// Memory-store statistics for the dashboard surface.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_observations: u64,
    pub active_observations: u64,
    pub superseded_observations: u64,
    pub tombstoned_observations: u64,
    pub by_type: HashMap<String, u64>,
    pub sessions: u64,
    pub summaries: u64,
    pub entities: u64,
    pub relationships: u64,
    /// What the raw captures would have cost in tokens.
    pub total_discovery_tokens: u64,
    /// What the distilled observations cost in tokens.
    pub total_token_count: u64,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_observation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_observation: Option<String>,
}

/// Compute store statistics, optionally scoped to a project.
///
/// `db_path` is used for file size; pass `None` for in-memory databases.
pub fn memory_stats(
    conn: &Connection,
    project_path: Option<&str>,
    db_path: Option<&Path>,
) -> Result<StatsResponse> {
    let (total, active, superseded, tombstoned) = count_observations(conn, project_path)?;
    let by_type = count_by_type(conn, project_path)?;
    let (discovery_tokens, token_count) = token_totals(conn, project_path)?;
    let (oldest, newest) = time_range(conn, project_path)?;

    let count_scoped = |sql_all: &str, sql_scoped: &str| -> Result<u64> {
        let n: i64 = match project_path {
            Some(p) => conn.query_row(sql_scoped, params![p], |r| r.get(0))?,
            None => conn.query_row(sql_all, [], |r| r.get(0))?,
        };
        Ok(n as u64)
    };

    let sessions = count_scoped(
        "SELECT COUNT(*) FROM sessions",
        "SELECT COUNT(*) FROM sessions WHERE project_path = ?1",
    )?;
    let summaries = count_scoped(
        "SELECT COUNT(*) FROM session_summaries",
        "SELECT COUNT(*) FROM session_summaries ss \
         JOIN sessions s ON s.id = ss.session_id WHERE s.project_path = ?1",
    )?;
    let (entities, relationships) = crate::memory::graph::counts(conn)?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StatsResponse {
        total_observations: total,
        active_observations: active,
        superseded_observations: superseded,
        tombstoned_observations: tombstoned,
        by_type,
        sessions,
        summaries,
        entities,
        relationships,
        total_discovery_tokens: discovery_tokens,
        total_token_count: token_count,
        db_size_bytes,
        oldest_observation: oldest,
        newest_observation: newest,
    })
}

fn scoped_from(project_path: Option<&str>) -> &'static str {
    if project_path.is_some() {
        "FROM observations o JOIN sessions s ON s.id = o.session_id WHERE s.project_path = ?1"
    } else {
        "FROM observations o WHERE 1=1"
    }
}

fn count_observations(
    conn: &Connection,
    project_path: Option<&str>,
) -> Result<(u64, u64, u64, u64)> {
    let sql = format!(
        "SELECT COUNT(*), \
         SUM(o.superseded_by IS NULL AND o.deleted_at IS NULL), \
         SUM(o.superseded_by IS NOT NULL AND o.deleted_at IS NULL), \
         SUM(o.deleted_at IS NOT NULL) \
         {}",
        scoped_from(project_path)
    );
    let map = |row: &rusqlite::Row<'_>| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Option<i64>>(1)?.unwrap_or(0),
            row.get::<_, Option<i64>>(2)?.unwrap_or(0),
            row.get::<_, Option<i64>>(3)?.unwrap_or(0),
        ))
    };
    let (total, active, superseded, tombstoned) = match project_path {
        Some(p) => conn.query_row(&sql, params![p], map)?,
        None => conn.query_row(&sql, [], map)?,
    };
    Ok((
        total as u64,
        active as u64,
        superseded as u64,
        tombstoned as u64,
    ))
}

fn count_by_type(conn: &Connection, project_path: Option<&str>) -> Result<HashMap<String, u64>> {
    let sql = format!(
        "SELECT o.type, COUNT(*) {} GROUP BY o.type",
        scoped_from(project_path)
    );

    let mut map = HashMap::new();
    for t in ObservationType::ALL {
        map.insert(t.as_str().to_string(), 0);
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<(String, i64)> = match project_path {
        Some(p) => stmt
            .query_map(params![p], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?,
        None => stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?,
    };

    for (t, count) in rows {
        map.insert(t, count as u64);
    }
    Ok(map)
}

fn token_totals(conn: &Connection, project_path: Option<&str>) -> Result<(u64, u64)> {
    let sql = format!(
        "SELECT COALESCE(SUM(o.discovery_tokens), 0), COALESCE(SUM(o.token_count), 0) \
         {} AND o.superseded_by IS NULL AND o.deleted_at IS NULL",
        scoped_from(project_path)
    );
    let map = |row: &rusqlite::Row<'_>| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?));
    let (discovery, distilled) = match project_path {
        Some(p) => conn.query_row(&sql, params![p], map)?,
        None => conn.query_row(&sql, [], map)?,
    };
    Ok((discovery as u64, distilled as u64))
}

fn time_range(
    conn: &Connection,
    project_path: Option<&str>,
) -> Result<(Option<String>, Option<String>)> {
    let sql = format!(
        "SELECT MIN(o.created_at), MAX(o.created_at) {}",
        scoped_from(project_path)
    );
    let map = |row: &rusqlite::Row<'_>| {
        Ok((
            row.get::<_, Option<String>>(0)?,
            row.get::<_, Option<String>>(1)?,
        ))
    };
    let range = match project_path {
        Some(p) => conn.query_row(&sql, params![p], map)?,
        None => conn.query_row(&sql, [], map)?,
    };
    Ok(range)
}
