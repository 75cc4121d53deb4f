//! Session and summary repositories.
//!
//! Sessions are created (or fetched) on first capture, marked idle when the
//! host reports idle, and completed on session end. Summaries are written by
//! the queue processor's summarize work items.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{MemError, Result};
use crate::memory::types::{
    approx_tokens, Session, SessionStatus, SessionSummary, SummaryDraft,
};

/// Fetch a session by id, creating an active one for `project_path` when
/// absent. A provided id is reused so host-assigned session ids stick.
pub fn get_or_create(
    conn: &Connection,
    id: Option<&str>,
    project_path: &str,
) -> Result<Session> {
    if let Some(id) = id {
        if let Some(existing) = get(conn, id)? {
            return Ok(existing);
        }
    }

    let session = Session {
        id: id.map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string()),
        project_path: project_path.to_string(),
        started_at: chrono::Utc::now().to_rfc3339(),
        ended_at: None,
        status: SessionStatus::Active,
        observation_count: 0,
        summary_id: None,
    };

    conn.execute(
        "INSERT INTO sessions (id, project_path, started_at, status, observation_count) \
         VALUES (?1, ?2, ?3, ?4, 0)",
        params![
            session.id,
            session.project_path,
            session.started_at,
            session.status.as_str()
        ],
    )?;

    tracing::debug!(id = %session.id, project = %session.project_path, "session created");
    Ok(session)
}

/// Insert a fully-formed session verbatim (import path). The observation
/// count restarts at zero and is rebuilt as rows are inserted.
pub fn insert_raw(conn: &Connection, session: &Session) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO sessions \
         (id, project_path, started_at, ended_at, status, observation_count, summary_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![
            session.id,
            session.project_path,
            session.started_at,
            session.ended_at,
            session.status.as_str(),
            session.summary_id,
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<Session>> {
    Ok(conn
        .query_row(
            "SELECT id, project_path, started_at, ended_at, status, observation_count, summary_id \
             FROM sessions WHERE id = ?1",
            params![id],
            row_to_session,
        )
        .optional()?)
}

/// Sessions for a project, most recent first.
pub fn list_by_project(
    conn: &Connection,
    project_path: &str,
    limit: usize,
) -> Result<Vec<Session>> {
    let mut stmt = conn.prepare(
        "SELECT id, project_path, started_at, ended_at, status, observation_count, summary_id \
         FROM sessions WHERE project_path = ?1 \
         ORDER BY started_at DESC, id DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![project_path, limit as i64], row_to_session)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Transition a session's status. Completing a session stamps `ended_at`.
pub fn set_status(conn: &Connection, id: &str, status: SessionStatus) -> Result<()> {
    let updated = match status {
        SessionStatus::Completed => conn.execute(
            "UPDATE sessions SET status = ?1, ended_at = ?2 WHERE id = ?3",
            params![status.as_str(), chrono::Utc::now().to_rfc3339(), id],
        )?,
        _ => conn.execute(
            "UPDATE sessions SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?,
    };
    if updated == 0 {
        return Err(MemError::NotFound(format!("session {id}")));
    }
    Ok(())
}

// ── Summaries ─────────────────────────────────────────────────────────────────

/// Persist a summary draft for a session and link it from the session row.
pub fn save_summary(
    conn: &Connection,
    session_id: &str,
    draft: &SummaryDraft,
) -> Result<SessionSummary> {
    let id = uuid::Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let token_count = approx_tokens(&format!(
        "{} {} {}",
        draft.summary,
        draft.key_decisions.join(" "),
        draft.learned.as_deref().unwrap_or("")
    ));

    conn.execute(
        "INSERT INTO session_summaries \
         (id, session_id, summary, key_decisions, files_modified, concepts, \
          request, investigated, learned, completed, next_steps, token_count, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            id,
            session_id,
            draft.summary,
            serde_json::to_string(&draft.key_decisions)?,
            serde_json::to_string(&draft.files_modified)?,
            serde_json::to_string(&draft.concepts)?,
            draft.request,
            draft.investigated,
            draft.learned,
            draft.completed,
            draft.next_steps,
            token_count,
            now,
        ],
    )?;

    let updated = conn.execute(
        "UPDATE sessions SET summary_id = ?1 WHERE id = ?2",
        params![id, session_id],
    )?;
    if updated == 0 {
        return Err(MemError::NotFound(format!("session {session_id}")));
    }

    get_summary(conn, &id)?
        .ok_or_else(|| MemError::Internal("saved summary vanished".into()))
}

pub fn get_summary(conn: &Connection, id: &str) -> Result<Option<SessionSummary>> {
    Ok(conn
        .query_row(
            "SELECT id, session_id, summary, key_decisions, files_modified, concepts, \
             request, investigated, learned, completed, next_steps, token_count, created_at \
             FROM session_summaries WHERE id = ?1",
            params![id],
            row_to_summary,
        )
        .optional()?)
}

/// The most recent summary for a project, if any session has one.
pub fn latest_summary(conn: &Connection, project_path: &str) -> Result<Option<SessionSummary>> {
    Ok(conn
        .query_row(
            "SELECT ss.id, ss.session_id, ss.summary, ss.key_decisions, ss.files_modified, \
             ss.concepts, ss.request, ss.investigated, ss.learned, ss.completed, \
             ss.next_steps, ss.token_count, ss.created_at \
             FROM session_summaries ss \
             JOIN sessions s ON s.id = ss.session_id \
             WHERE s.project_path = ?1 \
             ORDER BY ss.created_at DESC, ss.id DESC LIMIT 1",
            params![project_path],
            row_to_summary,
        )
        .optional()?)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let status_str: String = row.get(4)?;
    Ok(Session {
        id: row.get(0)?,
        project_path: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        status: status_str.parse().unwrap_or(SessionStatus::Active),
        observation_count: row.get(5)?,
        summary_id: row.get(6)?,
    })
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionSummary> {
    let parse_list = |idx: usize| -> rusqlite::Result<Vec<String>> {
        let raw: String = row.get(idx)?;
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    };
    Ok(SessionSummary {
        id: row.get(0)?,
        session_id: row.get(1)?,
        summary: row.get(2)?,
        key_decisions: parse_list(3)?,
        files_modified: parse_list(4)?,
        concepts: parse_list(5)?,
        request: row.get(6)?,
        investigated: row.get(7)?,
        learned: row.get(8)?,
        completed: row.get(9)?,
        next_steps: row.get(10)?,
        token_count: row.get(11)?,
        created_at: row.get(12)?,
    })
}
