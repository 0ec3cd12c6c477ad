use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use segflow_core::types::{Attributes, Event};
use segflow_core::SegflowResult;

use crate::db::{attrs_from_json, attrs_to_json, parse_ts, ts};

pub fn insert(
    conn: &Connection,
    user_id: &str,
    name: &str,
    attributes: &Attributes,
    now: DateTime<Utc>,
) -> SegflowResult<Event> {
    conn.execute(
        "INSERT INTO events (name, user_id, attributes, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![name, user_id, attrs_to_json(attributes)?, ts(&now)],
    )?;
    Ok(Event {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        user_id: user_id.to_string(),
        attributes: attributes.clone(),
        created_at: now,
    })
}

pub fn list_for_user(conn: &Connection, user_id: &str) -> SegflowResult<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, user_id, attributes, created_at FROM events
         WHERE user_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, name, user_id, attributes, created_at)| {
            Ok(Event {
                id,
                name,
                user_id,
                attributes: attrs_from_json(&attributes)?,
                created_at: parse_ts(&created_at)?,
            })
        })
        .collect()
}
