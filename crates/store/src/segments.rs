use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use segflow_core::types::Segment;
use segflow_core::{EngineError, SegflowResult};

use crate::db::{parse_ts, ts};

pub fn insert(conn: &Connection, segment: &Segment) -> SegflowResult<()> {
    conn.execute(
        "INSERT INTO segments (id, evaluator, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            segment.id,
            segment.evaluator,
            ts(&segment.created_at),
            ts(&segment.updated_at)
        ],
    )?;
    Ok(())
}

pub fn update_evaluator(
    conn: &Connection,
    id: &str,
    evaluator: &str,
    now: DateTime<Utc>,
) -> SegflowResult<()> {
    conn.execute(
        "UPDATE segments SET evaluator = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, evaluator, ts(&now)],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> SegflowResult<Option<Segment>> {
    let row = conn
        .query_row(
            "SELECT id, evaluator, created_at, updated_at FROM segments WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((id, evaluator, created_at, updated_at)) => Ok(Some(Segment {
            id,
            evaluator,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })),
        None => Ok(None),
    }
}

pub fn require(conn: &Connection, id: &str) -> SegflowResult<Segment> {
    get(conn, id)?.ok_or_else(|| EngineError::not_found("segment", id))
}

pub fn list(conn: &Connection) -> SegflowResult<Vec<Segment>> {
    let mut stmt =
        conn.prepare("SELECT id, evaluator, created_at, updated_at FROM segments ORDER BY id")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, evaluator, created_at, updated_at)| {
            Ok(Segment {
                id,
                evaluator,
                created_at: parse_ts(&created_at)?,
                updated_at: parse_ts(&updated_at)?,
            })
        })
        .collect()
}

/// Deletes the segment; memberships and triggers cascade.
pub fn delete(conn: &Connection, id: &str) -> SegflowResult<bool> {
    let rows = conn.execute("DELETE FROM segments WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

// ─── Event triggers ─────────────────────────────────────────────────────────

pub fn set_triggers(
    conn: &Connection,
    segment_id: &str,
    triggers: &BTreeSet<String>,
) -> SegflowResult<()> {
    conn.execute(
        "DELETE FROM segment_event_triggers WHERE segment_id = ?1",
        params![segment_id],
    )?;
    let mut stmt =
        conn.prepare("INSERT INTO segment_event_triggers (segment_id, event) VALUES (?1, ?2)")?;
    for event in triggers {
        stmt.execute(params![segment_id, event])?;
    }
    Ok(())
}

pub fn triggers_for(conn: &Connection, segment_id: &str) -> SegflowResult<BTreeSet<String>> {
    let mut stmt =
        conn.prepare("SELECT event FROM segment_event_triggers WHERE segment_id = ?1")?;
    let rows = stmt
        .query_map(params![segment_id], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(rows)
}

pub fn triggered_by(conn: &Connection, event_name: &str) -> SegflowResult<Vec<Segment>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.evaluator, s.created_at, s.updated_at
         FROM segments s
         JOIN segment_event_triggers t ON t.segment_id = s.id
         WHERE t.event = ?1
         ORDER BY s.id",
    )?;
    let rows = stmt
        .query_map(params![event_name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, evaluator, created_at, updated_at)| {
            Ok(Segment {
                id,
                evaluator,
                created_at: parse_ts(&created_at)?,
                updated_at: parse_ts(&updated_at)?,
            })
        })
        .collect()
}

// ─── Memberships ────────────────────────────────────────────────────────────

pub fn members(conn: &Connection, segment_id: &str) -> SegflowResult<BTreeSet<String>> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM segment_memberships WHERE segment_id = ?1")?;
    let rows = stmt
        .query_map(params![segment_id], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(rows)
}

pub fn member_add(conn: &Connection, user_id: &str, segment_id: &str) -> SegflowResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO segment_memberships (user_id, segment_id) VALUES (?1, ?2)",
        params![user_id, segment_id],
    )?;
    Ok(())
}

pub fn member_remove(conn: &Connection, user_id: &str, segment_id: &str) -> SegflowResult<()> {
    conn.execute(
        "DELETE FROM segment_memberships WHERE user_id = ?1 AND segment_id = ?2",
        params![user_id, segment_id],
    )?;
    Ok(())
}

pub fn is_member(conn: &Connection, user_id: &str, segment_id: &str) -> SegflowResult<bool> {
    let mut stmt = conn.prepare(
        "SELECT 1 FROM segment_memberships WHERE user_id = ?1 AND segment_id = ?2",
    )?;
    Ok(stmt.exists(params![user_id, segment_id])?)
}

pub fn memberships_for_user(conn: &Connection, user_id: &str) -> SegflowResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT segment_id FROM segment_memberships WHERE user_id = ?1 ORDER BY segment_id",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
