//! Campaign membership resolution.
//!
//! A user matches a campaign when they are a member of every include
//! segment and of no exclude segment. Static campaigns only ever add;
//! dynamic campaigns also evict, terminating the evicted execution.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use segflow_core::clock::Clock;
use segflow_core::types::{Campaign, CampaignBehavior};
use segflow_core::SegflowResult;
use segflow_store::{campaigns, executions, segments};
use tracing::info;

use crate::engine::{SegmentChanges, SegmentEvaluator};

pub const DYNAMIC_EXIT_REASON: &str = "User no longer matches campaign criteria";

/// Users are reevaluated in chunks of this size after a segment-wide change,
/// to bound the work done per batch.
const REEVALUATION_BATCH: usize = 100;

/// Campaign ids a single user was added to or removed from.
#[derive(Debug, Clone, Default)]
pub struct CampaignChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Clone)]
pub struct MembershipResolver {
    clock: Arc<dyn Clock>,
}

impl MembershipResolver {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn matches(
        &self,
        conn: &Connection,
        user_id: &str,
        campaign: &Campaign,
    ) -> SegflowResult<bool> {
        for segment_id in &campaign.segments {
            if !segments::is_member(conn, user_id, segment_id)? {
                return Ok(false);
            }
        }
        for segment_id in &campaign.exclude_segments {
            if segments::is_member(conn, user_id, segment_id)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Recompute campaign membership for one user across every campaign.
    pub fn reevaluate_for_user(
        &self,
        conn: &Connection,
        user_id: &str,
    ) -> SegflowResult<CampaignChanges> {
        let now = self.clock.now();
        let mut changes = CampaignChanges::default();

        for campaign in campaigns::list(conn)? {
            let matching = self.matches(conn, user_id, &campaign)?;
            let member = campaigns::is_member(conn, user_id, &campaign.id)?;

            match campaign.behavior {
                CampaignBehavior::Static => {
                    if matching && !member {
                        self.enroll(conn, user_id, &campaign.id, now)?;
                        changes.added.push(campaign.id.clone());
                    }
                }
                CampaignBehavior::Dynamic => {
                    if matching && !member {
                        self.enroll(conn, user_id, &campaign.id, now)?;
                        changes.added.push(campaign.id.clone());
                    } else if !matching && member {
                        campaigns::member_remove(conn, user_id, &campaign.id)?;
                        executions::terminate(
                            conn,
                            user_id,
                            &campaign.id,
                            DYNAMIC_EXIT_REASON,
                            now,
                        )?;
                        info!(user_id, campaign_id = %campaign.id, "User evicted from dynamic campaign");
                        changes.removed.push(campaign.id.clone());
                    }
                }
            }
        }
        Ok(changes)
    }

    /// Reevaluate segments for the user, then their campaign memberships.
    /// The path taken by every ingress write and by executor attribute
    /// writeback.
    pub fn refresh_user(
        &self,
        conn: &Connection,
        evaluator: &SegmentEvaluator,
        user_id: &str,
    ) -> SegflowResult<CampaignChanges> {
        evaluator.evaluate_for_user(conn, user_id)?;
        self.reevaluate_for_user(conn, user_id)
    }

    /// Fan a segment-level change out to the campaigns that reference it.
    pub fn reevaluate_for_segment_change(
        &self,
        conn: &Connection,
        segment_id: &str,
        changes: &SegmentChanges,
    ) -> SegflowResult<Vec<(String, CampaignChanges)>> {
        let referencing = campaigns::referencing_segment(conn, segment_id)?;
        if referencing.is_empty() || changes.is_empty() {
            return Ok(Vec::new());
        }

        let affected: Vec<String> = changes.affected_users().into_iter().collect();
        let mut results = Vec::with_capacity(affected.len());
        for batch in affected.chunks(REEVALUATION_BATCH) {
            for user_id in batch {
                let user_changes = self.reevaluate_for_user(conn, user_id)?;
                results.push((user_id.clone(), user_changes));
            }
        }
        Ok(results)
    }

    /// Compute a new campaign's initial membership with one query: users in
    /// all include segments minus users in any exclude segment.
    pub fn enroll_campaign(
        &self,
        conn: &Connection,
        campaign: &Campaign,
    ) -> SegflowResult<usize> {
        let now = self.clock.now();
        let initial = initial_members(conn, campaign)?;
        let count = initial.len();
        for user_id in initial {
            self.enroll(conn, &user_id, &campaign.id, now)?;
        }
        info!(campaign_id = %campaign.id, members = count, "Campaign enrolled");
        Ok(count)
    }

    fn enroll(
        &self,
        conn: &Connection,
        user_id: &str,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> SegflowResult<()> {
        campaigns::member_add(conn, user_id, campaign_id, now)?;
        executions::create(conn, user_id, campaign_id, now)?;
        Ok(())
    }
}

fn initial_members(conn: &Connection, campaign: &Campaign) -> SegflowResult<BTreeSet<String>> {
    let include_marks = placeholders(1, campaign.segments.len());
    let mut sql = format!(
        "SELECT u.id FROM users u
         WHERE (SELECT COUNT(DISTINCT m.segment_id) FROM segment_memberships m
                WHERE m.user_id = u.id AND m.segment_id IN ({include_marks})) = {}",
        campaign.segments.len()
    );
    if !campaign.exclude_segments.is_empty() {
        let exclude_marks = placeholders(
            campaign.segments.len() + 1,
            campaign.exclude_segments.len(),
        );
        sql.push_str(&format!(
            " AND NOT EXISTS (SELECT 1 FROM segment_memberships x
               WHERE x.user_id = u.id AND x.segment_id IN ({exclude_marks}))"
        ));
    }

    let params: Vec<&dyn rusqlite::ToSql> = campaign
        .segments
        .iter()
        .chain(campaign.exclude_segments.iter())
        .map(|s| s as &dyn rusqlite::ToSql)
        .collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params.as_slice(), |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(rows)
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}
