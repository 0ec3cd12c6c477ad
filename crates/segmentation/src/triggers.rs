//! Static extraction of event names from segment SQL.
//!
//! A segment is "triggered" by an event name when its evaluator compares
//! `events.name` with that literal, either by equality (on either side) or
//! through an `IN` list. Extraction is best-effort: SQL that does not parse
//! yields no triggers, and the segment is then only reevaluated on the
//! non-event paths.

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use sqlparser::ast::{visit_expressions, BinaryOperator, Expr, Value};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

pub fn extract_event_triggers(sql: &str) -> BTreeSet<String> {
    let statements = match Parser::parse_sql(&MySqlDialect {}, sql) {
        Ok(statements) => statements,
        Err(e) => {
            debug!(error = %e, "segment SQL did not parse; no event triggers extracted");
            return BTreeSet::new();
        }
    };

    let mut names = BTreeSet::new();
    let _ = visit_expressions(&statements, |expr: &Expr| {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Eq,
                right,
            } => {
                if is_events_name(left) {
                    if let Some(name) = string_literal(right) {
                        names.insert(name);
                    }
                } else if is_events_name(right) {
                    if let Some(name) = string_literal(left) {
                        names.insert(name);
                    }
                }
            }
            Expr::InList {
                expr,
                list,
                negated: false,
            } if is_events_name(expr) => {
                for item in list {
                    if let Some(name) = string_literal(item) {
                        names.insert(name);
                    }
                }
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    names
}

/// Whether the number of statements could be verified: `None` when the SQL
/// does not parse at all (the store's own prepare step is the backstop).
pub fn is_single_statement(sql: &str) -> Option<bool> {
    Parser::parse_sql(&MySqlDialect {}, sql)
        .ok()
        .map(|statements| statements.len() == 1)
}

fn is_events_name(expr: &Expr) -> bool {
    match expr {
        Expr::CompoundIdentifier(parts) => {
            parts.len() == 2
                && parts[0].value.eq_ignore_ascii_case("events")
                && parts[1].value.eq_ignore_ascii_case("name")
        }
        _ => false,
    }
}

fn string_literal(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Value(Value::SingleQuotedString(s)) | Expr::Value(Value::DoubleQuotedString(s)) => {
            Some(s.clone())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extracts_equality_comparisons() {
        let sql = "SELECT users.id AS id FROM users
                   JOIN events ON events.user_id = users.id
                   WHERE events.name = 'purchase'";
        assert_eq!(extract_event_triggers(sql), set(&["purchase"]));
    }

    #[test]
    fn extracts_reversed_equality() {
        let sql = "SELECT id FROM users WHERE EXISTS
                   (SELECT 1 FROM events WHERE 'signup' = events.name)";
        assert_eq!(extract_event_triggers(sql), set(&["signup"]));
    }

    #[test]
    fn extracts_in_lists() {
        let sql = "SELECT users.id AS id FROM users JOIN events ON events.user_id = users.id
                   WHERE events.name IN ('purchase', 'refund')";
        assert_eq!(extract_event_triggers(sql), set(&["purchase", "refund"]));
    }

    #[test]
    fn normalizes_backtick_identifiers() {
        let sql = "SELECT id FROM users WHERE EXISTS
                   (SELECT 1 FROM events WHERE `events`.`name` = 'click')";
        assert_eq!(extract_event_triggers(sql), set(&["click"]));
    }

    #[test]
    fn unrelated_columns_do_not_trigger() {
        let sql = "SELECT id FROM users WHERE users.name = 'purchase'";
        assert!(extract_event_triggers(sql).is_empty());
    }

    #[test]
    fn unparseable_sql_yields_empty_set() {
        assert!(extract_event_triggers("THIS IS NOT SQL AT ALL $$$").is_empty());
    }

    #[test]
    fn single_statement_check() {
        assert_eq!(is_single_statement("SELECT id FROM users"), Some(true));
        assert_eq!(
            is_single_statement("SELECT id FROM users; DELETE FROM users"),
            Some(false)
        );
        assert_eq!(is_single_statement("NOT SQL $$$"), None);
    }
}
