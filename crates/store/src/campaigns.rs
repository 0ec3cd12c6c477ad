use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use segflow_core::types::{Campaign, CampaignBehavior};
use segflow_core::{EngineError, SegflowResult};

use crate::db::{parse_ts, ts};

pub fn insert(conn: &Connection, campaign: &Campaign) -> SegflowResult<()> {
    let behavior = match campaign.behavior {
        CampaignBehavior::Static => "static",
        CampaignBehavior::Dynamic => "dynamic",
    };
    conn.execute(
        "INSERT INTO campaigns (id, flow, behavior, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![campaign.id, campaign.flow, behavior, ts(&campaign.created_at)],
    )?;

    let mut stmt = conn.prepare(
        "INSERT INTO campaign_segments (campaign_id, segment_id, role) VALUES (?1, ?2, ?3)",
    )?;
    for segment_id in &campaign.segments {
        stmt.execute(params![campaign.id, segment_id, "include"])?;
    }
    for segment_id in &campaign.exclude_segments {
        stmt.execute(params![campaign.id, segment_id, "exclude"])?;
    }
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> SegflowResult<Option<Campaign>> {
    let row = conn
        .query_row(
            "SELECT id, flow, behavior, created_at FROM campaigns WHERE id = ?1",
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
        Some((id, flow, behavior, created_at)) => Ok(Some(assemble(
            conn, id, flow, &behavior, &created_at,
        )?)),
        None => Ok(None),
    }
}

pub fn require(conn: &Connection, id: &str) -> SegflowResult<Campaign> {
    get(conn, id)?.ok_or_else(|| EngineError::not_found("campaign", id))
}

pub fn list(conn: &Connection) -> SegflowResult<Vec<Campaign>> {
    let mut stmt =
        conn.prepare("SELECT id, flow, behavior, created_at FROM campaigns ORDER BY id")?;
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
        .map(|(id, flow, behavior, created_at)| assemble(conn, id, flow, &behavior, &created_at))
        .collect()
}

fn assemble(
    conn: &Connection,
    id: String,
    flow: String,
    behavior: &str,
    created_at: &str,
) -> SegflowResult<Campaign> {
    let behavior = match behavior {
        "static" => CampaignBehavior::Static,
        "dynamic" => CampaignBehavior::Dynamic,
        other => {
            return Err(EngineError::Validation(format!(
                "unknown campaign behavior `{other}`"
            )))
        }
    };

    let mut stmt = conn.prepare(
        "SELECT segment_id, role FROM campaign_segments WHERE campaign_id = ?1 ORDER BY segment_id",
    )?;
    let links = stmt
        .query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut segments = Vec::new();
    let mut exclude_segments = Vec::new();
    for (segment_id, role) in links {
        if role == "exclude" {
            exclude_segments.push(segment_id);
        } else {
            segments.push(segment_id);
        }
    }

    Ok(Campaign {
        id,
        flow,
        behavior,
        segments,
        exclude_segments,
        created_at: parse_ts(created_at)?,
    })
}

/// Deletes the campaign row; segment links and memberships cascade.
/// Executions are the caller's responsibility (terminate, then delete).
pub fn delete(conn: &Connection, id: &str) -> SegflowResult<bool> {
    let rows = conn.execute("DELETE FROM campaigns WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

pub fn referencing_segment(conn: &Connection, segment_id: &str) -> SegflowResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT campaign_id FROM campaign_segments WHERE segment_id = ?1
         ORDER BY campaign_id",
    )?;
    let rows = stmt
        .query_map(params![segment_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ─── Memberships ────────────────────────────────────────────────────────────

pub fn member_add(
    conn: &Connection,
    user_id: &str,
    campaign_id: &str,
    now: DateTime<Utc>,
) -> SegflowResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO campaign_memberships (user_id, campaign_id, created_at)
         VALUES (?1, ?2, ?3)",
        params![user_id, campaign_id, ts(&now)],
    )?;
    Ok(())
}

pub fn member_remove(conn: &Connection, user_id: &str, campaign_id: &str) -> SegflowResult<()> {
    conn.execute(
        "DELETE FROM campaign_memberships WHERE user_id = ?1 AND campaign_id = ?2",
        params![user_id, campaign_id],
    )?;
    Ok(())
}

pub fn is_member(conn: &Connection, user_id: &str, campaign_id: &str) -> SegflowResult<bool> {
    let mut stmt = conn.prepare(
        "SELECT 1 FROM campaign_memberships WHERE user_id = ?1 AND campaign_id = ?2",
    )?;
    Ok(stmt.exists(params![user_id, campaign_id])?)
}

pub fn members(conn: &Connection, campaign_id: &str) -> SegflowResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM campaign_memberships WHERE campaign_id = ?1 ORDER BY user_id",
    )?;
    let rows = stmt
        .query_map(params![campaign_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
