//! Segment evaluation against the live store.
//!
//! The evaluator runs operator SQL as written, reads its `id` column, and
//! reconciles the membership table with the result set. Per-user checks wrap
//! the evaluator in a CTE instead of rerunning it globally.

use std::collections::BTreeSet;

use rusqlite::Connection;
use segflow_core::types::Segment;
use segflow_core::{EngineError, SegflowResult};
use segflow_store::segments;
use tracing::debug;

/// Outcome of a global segment reevaluation.
#[derive(Debug, Clone, Default)]
pub struct SegmentChanges {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub total: usize,
}

impl SegmentChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// All users whose membership flipped.
    pub fn affected_users(&self) -> BTreeSet<String> {
        self.added.union(&self.removed).cloned().collect()
    }
}

/// Segment ids whose membership flipped for one user.
#[derive(Debug, Clone, Default)]
pub struct UserSegmentChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl UserSegmentChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SegmentEvaluator;

impl SegmentEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Run the segment's SQL, diff the result set against current
    /// memberships, and write the difference.
    pub fn evaluate_global(
        &self,
        conn: &Connection,
        segment_id: &str,
    ) -> SegflowResult<SegmentChanges> {
        let segment = segments::require(conn, segment_id)?;
        let matched = run_evaluator(conn, &segment.evaluator)?;
        let current = segments::members(conn, segment_id)?;

        let added: BTreeSet<String> = matched.difference(&current).cloned().collect();
        let removed: BTreeSet<String> = current.difference(&matched).cloned().collect();

        for user_id in &added {
            segments::member_add(conn, user_id, segment_id)?;
        }
        for user_id in &removed {
            segments::member_remove(conn, user_id, segment_id)?;
        }

        debug!(
            segment_id,
            added = added.len(),
            removed = removed.len(),
            total = matched.len(),
            "Segment reevaluated"
        );

        Ok(SegmentChanges {
            added,
            removed,
            total: matched.len(),
        })
    }

    /// Reevaluate every segment for one user, flipping memberships whose
    /// truth changed.
    pub fn evaluate_for_user(
        &self,
        conn: &Connection,
        user_id: &str,
    ) -> SegflowResult<UserSegmentChanges> {
        let mut changes = UserSegmentChanges::default();
        for segment in segments::list(conn)? {
            self.evaluate_segment_for_user(conn, &segment, user_id, &mut changes)?;
        }
        Ok(changes)
    }

    /// Like [`evaluate_for_user`](Self::evaluate_for_user), restricted to
    /// segments triggered by the given event name.
    pub fn evaluate_for_user_on_event(
        &self,
        conn: &Connection,
        user_id: &str,
        event_name: &str,
    ) -> SegflowResult<UserSegmentChanges> {
        let mut changes = UserSegmentChanges::default();
        for segment in segments::triggered_by(conn, event_name)? {
            self.evaluate_segment_for_user(conn, &segment, user_id, &mut changes)?;
        }
        Ok(changes)
    }

    fn evaluate_segment_for_user(
        &self,
        conn: &Connection,
        segment: &Segment,
        user_id: &str,
        changes: &mut UserSegmentChanges,
    ) -> SegflowResult<()> {
        let body = segment.evaluator.trim().trim_end_matches(';');
        let wrapped = format!("WITH m AS ({body}) SELECT id FROM m WHERE id = ?1 LIMIT 1");
        let mut stmt = conn.prepare(&wrapped).map_err(|e| {
            EngineError::Validation(format!("segment {} SQL error: {e}", segment.id))
        })?;
        let matches = stmt.exists(rusqlite::params![user_id])?;

        let member = segments::is_member(conn, user_id, &segment.id)?;
        if matches && !member {
            segments::member_add(conn, user_id, &segment.id)?;
            changes.added.push(segment.id.clone());
        } else if !matches && member {
            segments::member_remove(conn, user_id, &segment.id)?;
            changes.removed.push(segment.id.clone());
        }
        Ok(())
    }
}

fn run_evaluator(conn: &Connection, evaluator: &str) -> SegflowResult<BTreeSet<String>> {
    let body = evaluator.trim().trim_end_matches(';');
    let mut stmt = conn
        .prepare(body)
        .map_err(|e| EngineError::Validation(format!("segment SQL error: {e}")))?;
    let id_column = stmt
        .column_index("id")
        .map_err(|_| EngineError::Validation("segment SQL must return an `id` column".to_string()))?;

    let mut ids = BTreeSet::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        match row.get_ref(id_column)? {
            rusqlite::types::ValueRef::Text(bytes) => {
                ids.insert(String::from_utf8_lossy(bytes).into_owned());
            }
            rusqlite::types::ValueRef::Integer(n) => {
                ids.insert(n.to_string());
            }
            rusqlite::types::ValueRef::Null => {}
            other => {
                return Err(EngineError::Validation(format!(
                    "segment SQL returned a non-text id ({})",
                    other.data_type()
                )))
            }
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use segflow_core::types::{Segment, User};
    use segflow_store::{users, Database};

    fn seed_user(conn: &Connection, id: &str, attrs: serde_json::Value) {
        let now = Utc::now();
        users::insert(
            conn,
            &User {
                id: id.to_string(),
                attributes: attrs.as_object().unwrap().clone(),
                created_at: now,
                updated_at: now,
            },
        )
        .unwrap();
    }

    fn seed_segment(conn: &Connection, id: &str, evaluator: &str) {
        let now = Utc::now();
        segments::insert(
            conn,
            &Segment {
                id: id.to_string(),
                evaluator: evaluator.to_string(),
                created_at: now,
                updated_at: now,
            },
        )
        .unwrap();
    }

    #[test]
    fn global_evaluation_diffs_memberships() {
        let db = Database::open_memory().unwrap();
        let evaluator = SegmentEvaluator::new();
        db.with_tx(|conn| {
            seed_user(conn, "u1", serde_json::json!({"email": "a@x", "active": true}));
            seed_user(conn, "u2", serde_json::json!({"email": "b@x", "active": false}));
            seed_segment(
                conn,
                "active",
                "SELECT id FROM users WHERE JSON_EXTRACT(attributes, '$.active') = true",
            );

            let changes = evaluator.evaluate_global(conn, "active")?;
            assert!(changes.added.contains("u1"));
            assert!(!changes.added.contains("u2"));
            assert_eq!(changes.total, 1);

            // Second run is a no-op.
            let changes = evaluator.evaluate_global(conn, "active")?;
            assert!(changes.is_empty());

            // Flip the attribute and reevaluate: membership is removed.
            users::update_attributes(
                conn,
                "u1",
                serde_json::json!({"email": "a@x", "active": false})
                    .as_object()
                    .unwrap(),
                Utc::now(),
            )?;
            let changes = evaluator.evaluate_global(conn, "active")?;
            assert!(changes.removed.contains("u1"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn per_user_evaluation_flips_membership() {
        let db = Database::open_memory().unwrap();
        let evaluator = SegmentEvaluator::new();
        db.with_tx(|conn| {
            seed_user(conn, "u1", serde_json::json!({"email": "a@x"}));
            seed_segment(conn, "all", "SELECT id FROM users");

            let changes = evaluator.evaluate_for_user(conn, "u1")?;
            assert_eq!(changes.added, vec!["all".to_string()]);
            assert!(segments::is_member(conn, "u1", "all")?);

            let changes = evaluator.evaluate_for_user(conn, "u1")?;
            assert!(changes.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn event_scoped_evaluation_only_touches_triggered_segments() {
        let db = Database::open_memory().unwrap();
        let evaluator = SegmentEvaluator::new();
        db.with_tx(|conn| {
            seed_user(conn, "u1", serde_json::json!({"email": "a@x"}));
            seed_segment(
                conn,
                "buyers",
                "SELECT DISTINCT events.user_id AS id FROM events WHERE events.name = 'purchase'",
            );
            segments::set_triggers(
                conn,
                "buyers",
                &crate::extract_event_triggers(
                    "SELECT DISTINCT events.user_id AS id FROM events WHERE events.name = 'purchase'",
                ),
            )?;
            seed_segment(conn, "all", "SELECT id FROM users");
            segments::set_triggers(conn, "all", &Default::default())?;

            let changes = evaluator.evaluate_for_user_on_event(conn, "u1", "purchase")?;
            // No purchase events yet, and `all` has no trigger for purchase.
            assert!(changes.is_empty());
            assert!(!segments::is_member(conn, "u1", "all")?);

            segflow_store::events::insert(
                conn,
                "u1",
                "purchase",
                &serde_json::Map::new(),
                Utc::now(),
            )?;
            let changes = evaluator.evaluate_for_user_on_event(conn, "u1", "purchase")?;
            assert_eq!(changes.added, vec!["buyers".to_string()]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn malformed_sql_is_a_validation_error() {
        let db = Database::open_memory().unwrap();
        let evaluator = SegmentEvaluator::new();
        db.with_tx(|conn| {
            seed_segment(conn, "broken", "SELECT id FROM nowhere_at_all");
            let err = evaluator.evaluate_global(conn, "broken").unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)));
            Ok(())
        })
        .unwrap();
    }
}
