//! Durable per-branch metadata store.
//!
//! Backed by SQLite so the registry can seed engines from the previous
//! run without re-executing anything. Column
//! names are underscored on disk; the in-memory [`MetadataRow`] uses the
//! same hyphenated field names the rest of the engine uses, translated
//! at the serde boundary.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug)]
pub enum MetadataError {
    Sqlite(rusqlite::Error),
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataError::Sqlite(e) => write!(f, "metadata store error: {e}"),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<rusqlite::Error> for MetadataError {
    fn from(e: rusqlite::Error) -> Self {
        MetadataError::Sqlite(e)
    }
}

/// One branch's last-known action summary, as persisted across
/// restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRow {
    pub project_name: String,
    pub branch_name: String,
    pub action: String,
    pub cancelled: bool,
    pub command: String,
    pub exit_code: Option<i32>,
    pub start_time: i64,
}

/// `rusqlite::Connection` is `Send` but not `Sync` (it holds an interior
/// `RefCell`-backed statement cache), and this store is shared across
/// branch-engine worker threads and the registry behind an `Arc`. The
/// `Mutex` makes it `Sync` and gives each upsert its own transaction.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    pub fn open(path: &Path) -> Result<Self, MetadataError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, MetadataError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), MetadataError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS metadata_store (
                project_name TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                action TEXT NOT NULL,
                cancelled INTEGER NOT NULL,
                command TEXT NOT NULL,
                exit_code INTEGER,
                start_time INTEGER NOT NULL,
                PRIMARY KEY (project_name, branch_name)
            )",
            [],
        )?;
        Ok(())
    }

    /// Upsert the row for one branch's latest transition, under its own
    /// transaction. Called on every state change; must be durable before
    /// the next operation is accepted.
    pub fn upsert(&self, row: &MetadataRow) -> Result<(), MetadataError> {
        let mut conn = self.conn.lock().expect("metadata connection mutex poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO metadata_store
                (project_name, branch_name, action, cancelled, command, exit_code, start_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (project_name, branch_name) DO UPDATE SET
                action = excluded.action,
                cancelled = excluded.cancelled,
                command = excluded.command,
                exit_code = excluded.exit_code,
                start_time = excluded.start_time",
            params![
                row.project_name,
                row.branch_name,
                row.action,
                row.cancelled,
                row.command,
                row.exit_code,
                row.start_time,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Seed a newly-instantiated engine's fields from the last run, if a
    /// row exists for (project, branch).
    pub fn get(&self, project: &str, branch: &str) -> Result<Option<MetadataRow>, MetadataError> {
        let conn = self.conn.lock().expect("metadata connection mutex poisoned");
        let row = conn
            .query_row(
                "SELECT project_name, branch_name, action, cancelled, command, exit_code, start_time
                 FROM metadata_store WHERE project_name = ?1 AND branch_name = ?2",
                params![project, branch],
                |row| {
                    Ok(MetadataRow {
                        project_name: row.get(0)?,
                        branch_name: row.get(1)?,
                        action: row.get(2)?,
                        cancelled: row.get(3)?,
                        command: row.get(4)?,
                        exit_code: row.get(5)?,
                        start_time: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Retained even after `delete-local` drops the registry entry
    ///.
    pub fn all_for_project(&self, project: &str) -> Result<Vec<MetadataRow>, MetadataError> {
        let conn = self.conn.lock().expect("metadata connection mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT project_name, branch_name, action, cancelled, command, exit_code, start_time
             FROM metadata_store WHERE project_name = ?1",
        )?;
        let rows = stmt
            .query_map(params![project], |row| {
                Ok(MetadataRow {
                    project_name: row.get(0)?,
                    branch_name: row.get(1)?,
                    action: row.get(2)?,
                    cancelled: row.get(3)?,
                    command: row.get(4)?,
                    exit_code: row.get(5)?,
                    start_time: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> MetadataRow {
        MetadataRow {
            project_name: "widgets".to_string(),
            branch_name: "main".to_string(),
            action: "update".to_string(),
            cancelled: false,
            command: "make update".to_string(),
            exit_code: Some(0),
            start_time: 1000,
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert(&sample_row()).unwrap();
        let fetched = store.get("widgets", "main").unwrap().unwrap();
        assert_eq!(fetched, sample_row());
    }

    #[test]
    fn missing_row_returns_none() {
        let store = MetadataStore::open_in_memory().unwrap();
        assert!(store.get("widgets", "nonexistent").unwrap().is_none());
    }

    #[test]
    fn upsert_overwrites_prior_row() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert(&sample_row()).unwrap();

        let mut updated = sample_row();
        updated.action = "clean".to_string();
        updated.cancelled = true;
        updated.exit_code = None;
        store.upsert(&updated).unwrap();

        let fetched = store.get("widgets", "main").unwrap().unwrap();
        assert_eq!(fetched.action, "clean");
        assert!(fetched.cancelled);
        assert_eq!(fetched.exit_code, None);
    }

    #[test]
    fn all_for_project_filters_by_project() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert(&sample_row()).unwrap();
        let mut other = sample_row();
        other.project_name = "gadgets".to_string();
        store.upsert(&other).unwrap();

        let rows = store.all_for_project("widgets").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].project_name, "widgets");
    }
}
