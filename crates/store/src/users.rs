use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use segflow_core::types::{Attributes, User};
use segflow_core::{EngineError, SegflowResult};

use crate::db::{attrs_from_json, attrs_to_json, parse_ts, ts};

pub fn insert(conn: &Connection, user: &User) -> SegflowResult<()> {
    conn.execute(
        "INSERT INTO users (id, attributes, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            user.id,
            attrs_to_json(&user.attributes)?,
            ts(&user.created_at),
            ts(&user.updated_at)
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> SegflowResult<Option<User>> {
    let row = conn
        .query_row(
            "SELECT id, attributes, created_at, updated_at FROM users WHERE id = ?1",
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
        Some((id, attributes, created_at, updated_at)) => Ok(Some(User {
            id,
            attributes: attrs_from_json(&attributes)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })),
        None => Ok(None),
    }
}

pub fn require(conn: &Connection, id: &str) -> SegflowResult<User> {
    get(conn, id)?.ok_or_else(|| EngineError::not_found("user", id))
}

pub fn update_attributes(
    conn: &Connection,
    id: &str,
    attributes: &Attributes,
    now: DateTime<Utc>,
) -> SegflowResult<()> {
    conn.execute(
        "UPDATE users SET attributes = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, attrs_to_json(attributes)?, ts(&now)],
    )?;
    Ok(())
}

/// Deletes the user; events, memberships, executions and history go with it
/// via foreign-key cascades.
pub fn delete(conn: &Connection, id: &str) -> SegflowResult<bool> {
    let rows = conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}
