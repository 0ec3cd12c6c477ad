use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use segflow_core::{EngineError, SegflowResult};
use tracing::info;

/// SQLite store. A single connection behind a mutex; every logical action
/// runs inside one transaction via [`Database::with_tx`]. SQLite's single
/// writer, combined with the status flip `claim_due` performs before its
/// transaction commits, provides the row-claim exclusivity the executor
/// relies on.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database file.
    pub fn open(db_path: &str) -> SegflowResult<Self> {
        if let Some(dir) = Path::new(db_path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        info!(path = db_path, "Store opened");
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SegflowResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> SegflowResult<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute_batch(crate::schema::CREATE_TABLES_SQL)?;
        conn.execute_batch(crate::schema::CREATE_INDEXES_SQL)?;
        Ok(())
    }

    /// Run `f` inside one transaction: commit on `Ok`, roll back on `Err`.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Connection) -> SegflowResult<T>,
    ) -> SegflowResult<T> {
        let mut conn = self.conn.lock().expect("database mutex poisoned");
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback();
                Err(err)
            }
        }
    }
}

/// Timestamps persist as fixed-width RFC 3339 so string comparison matches
/// chronological order.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> SegflowResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Validation(format!("bad timestamp `{s}`: {e}")))
}

pub(crate) fn attrs_to_json(
    attributes: &segflow_core::types::Attributes,
) -> SegflowResult<String> {
    Ok(serde_json::to_string(attributes)?)
}

pub(crate) fn attrs_from_json(json: &str) -> SegflowResult<segflow_core::types::Attributes> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_order_lexicographically() {
        let base = Utc::now();
        let later = base + chrono::Duration::milliseconds(1);
        assert!(ts(&base) < ts(&later));

        // Micros formatting drops sub-microsecond precision only.
        let round = parse_ts(&ts(&base)).unwrap();
        let delta = (base - round).num_microseconds().unwrap_or(i64::MAX);
        assert!(delta.abs() <= 1);
    }

    #[test]
    fn open_memory_initializes_schema() {
        let db = Database::open_memory().unwrap();
        db.with_tx(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
                .map_err(segflow_core::EngineError::from)?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("segflow.db");
        let db = Database::open(path.to_str().unwrap()).unwrap();
        db.with_tx(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM configs", [], |row| row.get(0))
                .map_err(segflow_core::EngineError::from)?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let db = Database::open_memory().unwrap();
        let result: SegflowResult<()> = db.with_tx(|conn| {
            conn.execute(
                "INSERT INTO users (id, attributes, created_at, updated_at) VALUES ('u1', '{}', '', '')",
                [],
            )
            .map_err(segflow_core::EngineError::from)?;
            Err(segflow_core::EngineError::Validation("abort".to_string()))
        });
        assert!(result.is_err());

        db.with_tx(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
                .map_err(segflow_core::EngineError::from)?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();
    }
}
