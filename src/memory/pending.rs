//! Durable queue of raw captures awaiting compression.
//!
//! At-least-once semantics: every enqueued capture either becomes an
//! observation, is explicitly dropped by conflict resolution, or ends up
//! `failed` after the retry budget. Claims are transactional so a crash
//! mid-batch leaves rows in `processing`; [`revert_stale`] returns them to
//! `pending` on the next startup.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::memory::types::{PendingMessage, PendingStatus};

/// Reserved tool name for summarize work items enqueued on session end.
pub const SUMMARIZE_TOOL: &str = "__summarize__";

/// Persist a capture. Idempotent on `(session_id, call_id)`: re-enqueueing
/// the same capture is a no-op. Returns the row id, or `None` for a
/// duplicate.
pub fn enqueue(
    conn: &Connection,
    session_id: &str,
    tool_name: &str,
    tool_output: &str,
    call_id: &str,
) -> Result<Option<i64>> {
    let now = chrono::Utc::now().to_rfc3339();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO pending_messages \
         (session_id, tool_name, tool_output, call_id, status, created_at) \
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
        params![session_id, tool_name, tool_output, call_id, now],
    )?;

    if inserted == 0 {
        return Ok(None);
    }
    Ok(Some(conn.last_insert_rowid()))
}

/// Enqueue a summarize work item for a session. Idempotent per session.
pub fn enqueue_summarize(conn: &Connection, session_id: &str) -> Result<Option<i64>> {
    enqueue(
        conn,
        session_id,
        SUMMARIZE_TOOL,
        "",
        &format!("summarize:{session_id}"),
    )
}

/// Atomically claim up to `batch_size` oldest pending rows, marking them
/// `processing`. Claimed rows are invisible to other claimants. Rows within a
/// session come back in ascending `created_at` order.
pub fn claim(conn: &mut Connection, batch_size: usize) -> Result<Vec<PendingMessage>> {
    let tx = conn.transaction()?;
    let now = chrono::Utc::now().to_rfc3339();

    let batch = {
        let mut stmt = tx.prepare(
            "SELECT id, session_id, tool_name, tool_output, call_id, status, \
             retry_count, error, created_at \
             FROM pending_messages WHERE status = 'pending' \
             ORDER BY created_at ASC, id ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![batch_size as i64], row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    {
        let mut mark = tx.prepare(
            "UPDATE pending_messages SET status = 'processing', claimed_at = ?1 WHERE id = ?2",
        )?;
        for msg in &batch {
            mark.execute(params![now, msg.id])?;
        }
    }

    tx.commit()?;

    Ok(batch
        .into_iter()
        .map(|mut m| {
            m.status = PendingStatus::Processing;
            m
        })
        .collect())
}

/// Terminal success: the row is deleted.
pub fn complete(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM pending_messages WHERE id = ?1", params![id])?;
    Ok(())
}

/// Record a failure. Returns the row to `pending` while retries remain,
/// otherwise marks it `failed` with the last error.
pub fn fail(conn: &Connection, id: i64, error: &str, max_retries: u32) -> Result<PendingStatus> {
    let retry_count: u32 = conn
        .query_row(
            "SELECT retry_count FROM pending_messages WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    let new_count = retry_count + 1;
    let status = if new_count < max_retries {
        PendingStatus::Pending
    } else {
        PendingStatus::Failed
    };

    conn.execute(
        "UPDATE pending_messages \
         SET status = ?1, retry_count = ?2, error = ?3, claimed_at = NULL \
         WHERE id = ?4",
        params![status.as_str(), new_count, error, id],
    )?;

    Ok(status)
}

/// Revert `processing` rows whose claim is older than `stale_secs` back to
/// `pending`. Run at startup to recover from a crash mid-batch.
pub fn revert_stale(conn: &Connection, stale_secs: i64) -> Result<usize> {
    let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(stale_secs)).to_rfc3339();
    let reverted = conn.execute(
        "UPDATE pending_messages SET status = 'pending', claimed_at = NULL \
         WHERE status = 'processing' AND claimed_at < ?1",
        params![cutoff],
    )?;
    if reverted > 0 {
        tracing::warn!(reverted, "reverted stale processing claims to pending");
    }
    Ok(reverted)
}

/// Counts by status, surfaced as queue status on the query surface.
#[derive(Debug, Default, serde::Serialize)]
pub struct QueueStatus {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
}

pub fn queue_status(conn: &Connection) -> Result<QueueStatus> {
    let mut status = QueueStatus::default();
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM pending_messages GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (s, count) = row?;
        match s.as_str() {
            "pending" => status.pending = count as u64,
            "processing" => status.processing = count as u64,
            "failed" => status.failed = count as u64,
            _ => {}
        }
    }
    Ok(status)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingMessage> {
    let status_str: String = row.get(5)?;
    Ok(PendingMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        tool_name: row.get(2)?,
        tool_output: row.get(3)?,
        call_id: row.get(4)?,
        status: status_str.parse().unwrap_or(PendingStatus::Pending),
        retry_count: row.get(6)?,
        error: row.get(7)?,
        created_at: row.get(8)?,
    })
}
