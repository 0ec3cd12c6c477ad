//! Execution and history state machine.
//!
//! `claim_due` realizes the ordering guarantee: due rows are selected and
//! flipped to `running` inside the caller's transaction, so a concurrent
//! tick cannot claim the same (user, campaign) pair.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use segflow_core::types::{Attributes, Execution, ExecutionStatus, HistoryStep};
use segflow_core::{EngineError, SegflowResult};

use crate::db::{attrs_from_json, attrs_to_json, parse_ts, ts};

/// A due execution claimed by a tick, carrying the status it had before the
/// flip to `running`.
#[derive(Debug, Clone)]
pub struct ClaimedExecution {
    pub user_id: String,
    pub campaign_id: String,
    pub prior_status: ExecutionStatus,
}

pub fn create(
    conn: &Connection,
    user_id: &str,
    campaign_id: &str,
    now: DateTime<Utc>,
) -> SegflowResult<()> {
    // OR IGNORE keeps a terminal row from an earlier enrollment in place:
    // a user re-entering a campaign does not restart its flow.
    conn.execute(
        "INSERT OR IGNORE INTO executions
         (user_id, campaign_id, status, sleep_until, error, created_at, updated_at)
         VALUES (?1, ?2, 'pending', ?3, NULL, ?3, ?3)",
        params![user_id, campaign_id, ts(&now)],
    )?;
    Ok(())
}

pub fn get(
    conn: &Connection,
    user_id: &str,
    campaign_id: &str,
) -> SegflowResult<Option<Execution>> {
    let row = conn
        .query_row(
            "SELECT status, sleep_until, error FROM executions
             WHERE user_id = ?1 AND campaign_id = ?2",
            params![user_id, campaign_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((status, sleep_until, error)) => Ok(Some(Execution {
            user_id: user_id.to_string(),
            campaign_id: campaign_id.to_string(),
            status: parse_status(&status)?,
            sleep_until: parse_ts(&sleep_until)?,
            error,
        })),
        None => Ok(None),
    }
}

pub fn sleep_until(
    conn: &Connection,
    user_id: &str,
    campaign_id: &str,
    until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> SegflowResult<()> {
    conn.execute(
        "UPDATE executions SET status = 'sleeping', sleep_until = ?3, updated_at = ?4
         WHERE user_id = ?1 AND campaign_id = ?2",
        params![user_id, campaign_id, ts(&until), ts(&now)],
    )?;
    Ok(())
}

pub fn complete(
    conn: &Connection,
    user_id: &str,
    campaign_id: &str,
    now: DateTime<Utc>,
) -> SegflowResult<()> {
    conn.execute(
        "UPDATE executions SET status = 'completed', updated_at = ?3
         WHERE user_id = ?1 AND campaign_id = ?2",
        params![user_id, campaign_id, ts(&now)],
    )?;
    Ok(())
}

pub fn fail(
    conn: &Connection,
    user_id: &str,
    campaign_id: &str,
    message: &str,
    now: DateTime<Utc>,
) -> SegflowResult<()> {
    conn.execute(
        "UPDATE executions SET status = 'failed', error = ?3, updated_at = ?4
         WHERE user_id = ?1 AND campaign_id = ?2",
        params![user_id, campaign_id, message, ts(&now)],
    )?;
    Ok(())
}

/// Idempotent: a missing row or an already-terminal row is left alone.
pub fn terminate(
    conn: &Connection,
    user_id: &str,
    campaign_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> SegflowResult<()> {
    conn.execute(
        "UPDATE executions SET status = 'terminated', error = ?3, updated_at = ?4
         WHERE user_id = ?1 AND campaign_id = ?2
           AND status IN ('pending', 'sleeping', 'running')",
        params![user_id, campaign_id, reason, ts(&now)],
    )?;
    Ok(())
}

pub fn terminate_all_for_campaign(
    conn: &Connection,
    campaign_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> SegflowResult<usize> {
    let rows = conn.execute(
        "UPDATE executions SET status = 'terminated', error = ?2, updated_at = ?3
         WHERE campaign_id = ?1 AND status IN ('pending', 'sleeping', 'running')",
        params![campaign_id, reason, ts(&now)],
    )?;
    Ok(rows)
}

/// Claim every due pending/sleeping row and mark it running. The flip
/// happens in the caller's transaction, so a concurrent tick observes
/// `running` and skips.
pub fn claim_due(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: Option<i64>,
) -> SegflowResult<Vec<ClaimedExecution>> {
    let now_s = ts(&now);
    let mut sql = String::from(
        "SELECT user_id, campaign_id, status FROM executions
         WHERE status IN ('pending', 'sleeping') AND sleep_until <= ?1
         ORDER BY sleep_until, user_id, campaign_id",
    );
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {n}"));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![now_s], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut claimed = Vec::with_capacity(rows.len());
    for (user_id, campaign_id, status) in rows {
        conn.execute(
            "UPDATE executions SET status = 'running', updated_at = ?3
             WHERE user_id = ?1 AND campaign_id = ?2",
            params![user_id, campaign_id, now_s],
        )?;
        claimed.push(ClaimedExecution {
            prior_status: parse_status(&status)?,
            user_id,
            campaign_id,
        });
    }
    Ok(claimed)
}

pub fn delete_for_campaign(conn: &Connection, campaign_id: &str) -> SegflowResult<usize> {
    let rows = conn.execute(
        "DELETE FROM executions WHERE campaign_id = ?1",
        params![campaign_id],
    )?;
    Ok(rows)
}

// ─── History ────────────────────────────────────────────────────────────────

pub fn append_history(
    conn: &Connection,
    user_id: &str,
    campaign_id: &str,
    step_index: i64,
    attributes: &Attributes,
    now: DateTime<Utc>,
) -> SegflowResult<()> {
    conn.execute(
        "INSERT INTO execution_history (user_id, campaign_id, step_index, attributes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            user_id,
            campaign_id,
            step_index,
            attrs_to_json(attributes)?,
            ts(&now)
        ],
    )?;
    Ok(())
}

pub fn history_for(
    conn: &Connection,
    user_id: &str,
    campaign_id: &str,
) -> SegflowResult<Vec<HistoryStep>> {
    let mut stmt = conn.prepare(
        "SELECT step_index, attributes FROM execution_history
         WHERE user_id = ?1 AND campaign_id = ?2 ORDER BY step_index",
    )?;
    let rows = stmt
        .query_map(params![user_id, campaign_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(step_index, attributes)| {
            Ok(HistoryStep {
                step_index,
                attributes: attrs_from_json(&attributes)?,
            })
        })
        .collect()
}

fn parse_status(s: &str) -> SegflowResult<ExecutionStatus> {
    s.parse().map_err(EngineError::Validation)
}
