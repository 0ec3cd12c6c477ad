//! Append-only ledger of accepted configurations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use segflow_core::SegflowResult;

use crate::db::ts;

/// Latest accepted configuration, newest by `created_at` (id breaks ties).
pub fn latest(conn: &Connection) -> SegflowResult<Option<(i64, String)>> {
    let row = conn
        .query_row(
            "SELECT id, config_json FROM configs ORDER BY created_at DESC, id DESC LIMIT 1",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    Ok(row)
}

pub fn append(conn: &Connection, config_json: &str, now: DateTime<Utc>) -> SegflowResult<i64> {
    conn.execute(
        "INSERT INTO configs (config_json, created_at) VALUES (?1, ?2)",
        params![config_json, ts(&now)],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn count(conn: &Connection) -> SegflowResult<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM configs", [], |row| row.get(0))?;
    Ok(count)
}
