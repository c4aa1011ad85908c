// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

use log::{debug, trace, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::status::Status;
use crate::{Error, WorkflowId};

const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS workflows
    (id INTEGER PRIMARY KEY AUTOINCREMENT,
     name TEXT NOT NULL,
     log TEXT,
     jobs BLOB NOT NULL,
     submitted REAL NOT NULL,
     completed REAL,
     priority INTEGER NOT NULL DEFAULT 0,
     status INTEGER NOT NULL)
";

/// One durable workflow record.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowRow {
    pub id: WorkflowId,
    pub name: String,
    pub log: Option<PathBuf>,
    pub jobs: String,
    pub submitted: f64,
    pub completed: Option<f64>,
    pub priority: i64,
    pub status: Status,
}

/// Summary row returned by [`WorkflowStore::fetch`].
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub name: String,
    pub submitted: f64,
    pub completed: Option<f64>,
    pub status: Status,
    pub priority: i64,
}

/// Durable record of every submitted workflow.
///
/// One row per workflow in a single-file SQLite database. Rows are created
/// on first submission, updated on status changes, and never deleted.
///
pub struct WorkflowStore {
    connection: Connection,
}

impl WorkflowStore {
    /// Open the store, creating the schema when needed.
    ///
    /// `start_index` seeds the id sequence so workflow identifiers begin
    /// above a configured floor.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the database cannot be opened or the
    /// schema cannot be created.
    ///
    pub fn open(path: &Path, start_index: Option<i64>) -> Result<Self, Error> {
        debug!("Opening workflow store '{}'.", path.display());

        let connection = Connection::open(path)?;
        connection.execute_batch("PRAGMA journal_mode = WAL;")?;
        connection.execute_batch(CREATE_TABLE)?;

        let store = Self { connection };
        if let Some(start_index) = start_index {
            store.seed(start_index)?;
        }

        Ok(store)
    }

    /// Insert a new workflow row and return the assigned id.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the insert fails.
    ///
    pub fn add_workflow(
        &self,
        name: &str,
        log: Option<&Path>,
        jobs: &str,
        priority: i64,
        status: Status,
    ) -> Result<WorkflowId, Error> {
        self.connection.execute(
            "INSERT INTO workflows(name, log, jobs, submitted, completed, priority, status)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6)",
            params![
                name,
                log.map(|log| log.display().to_string()),
                jobs,
                now(),
                priority,
                status.code()
            ],
        )?;

        let id = self.connection.last_insert_rowid();
        debug!("Added workflow {id} ('{name}') to the store.");
        Ok(id)
    }

    /// Find the most recent workflow with a byte-identical jobs blob.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the query fails.
    ///
    pub fn find_workflow(&self, jobs: &str) -> Result<Option<WorkflowRow>, Error> {
        let row = self
            .connection
            .query_row(
                "SELECT id, name, log, jobs, submitted, completed, priority, status
                 FROM workflows WHERE jobs = ?1 ORDER BY id DESC LIMIT 1",
                params![jobs],
                row_to_workflow,
            )
            .optional()?;

        Ok(row)
    }

    /// Get a workflow row by id.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the query fails.
    ///
    pub fn get_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRow>, Error> {
        let row = self
            .connection
            .query_row(
                "SELECT id, name, log, jobs, submitted, completed, priority, status
                 FROM workflows WHERE id = ?1",
                params![id],
                row_to_workflow,
            )
            .optional()?;

        Ok(row)
    }

    /// Replace a row's submission fields on resubmit.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the update fails. Uniqueness
    /// violations are ignored with a warning.
    ///
    pub fn update_workflow(
        &self,
        id: WorkflowId,
        name: &str,
        log: Option<&Path>,
        jobs: &str,
        priority: i64,
    ) -> Result<(), Error> {
        let result = self.connection.execute(
            "UPDATE workflows SET name = ?1, log = ?2, jobs = ?3, priority = ?4, submitted = ?5
             WHERE id = ?6",
            params![
                name,
                log.map(|log| log.display().to_string()),
                jobs,
                priority,
                now(),
                id
            ],
        );

        ignore_constraint(result)?;
        Ok(())
    }

    /// Persist a workflow's status, stamping the completion time when asked.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the update fails.
    ///
    pub fn update_status(
        &self,
        id: WorkflowId,
        status: Status,
        completed: bool,
    ) -> Result<(), Error> {
        trace!("WORKFLOW {id}: persisting status {status}.");

        let result = if completed {
            self.connection.execute(
                "UPDATE workflows SET status = ?1, completed = ?2 WHERE id = ?3",
                params![status.code(), now(), id],
            )
        } else {
            self.connection.execute(
                "UPDATE workflows SET status = ?1 WHERE id = ?2",
                params![status.code(), id],
            )
        };

        ignore_constraint(result)?;
        Ok(())
    }

    /// Get a workflow's persisted status.
    ///
    /// Unknown ids report `Status::NotFound`.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the query fails.
    ///
    pub fn get_status(&self, id: WorkflowId) -> Result<Status, Error> {
        let code: Option<i64> = self
            .connection
            .query_row(
                "SELECT status FROM workflows WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(code.map_or(Status::NotFound, Status::from_code))
    }

    /// Fetch summary rows for the given ids, or for every workflow.
    ///
    /// Unknown ids are omitted from the result.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the query fails.
    ///
    pub fn fetch(&self, ids: Option<&[WorkflowId]>) -> Result<Vec<WorkflowSummary>, Error> {
        let mut result = Vec::new();

        match ids {
            Some(ids) => {
                let mut statement = self.connection.prepare(
                    "SELECT id, name, submitted, completed, status, priority
                     FROM workflows WHERE id = ?1",
                )?;

                for id in ids {
                    let row = statement
                        .query_row(params![id], row_to_summary)
                        .optional()?;
                    if let Some(row) = row {
                        result.push(row);
                    }
                }
            }
            None => {
                let mut statement = self.connection.prepare(
                    "SELECT id, name, submitted, completed, status, priority
                     FROM workflows ORDER BY id",
                )?;

                let rows = statement.query_map([], row_to_summary)?;
                for row in rows {
                    result.push(row?);
                }
            }
        }

        Ok(result)
    }

    /// Transition every running workflow to stopped.
    ///
    /// Called at startup and shutdown so rows never claim to be running
    /// while no daemon is.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the update fails.
    ///
    pub fn stop_workflows(&self) -> Result<usize, Error> {
        let stopped = self.connection.execute(
            "UPDATE workflows SET status = ?1, completed = ?2 WHERE status = ?3",
            params![Status::Stopped.code(), now(), Status::Running.code()],
        )?;

        if stopped > 0 {
            debug!("Stopped {stopped} workflows left running in the store.");
        }

        Ok(stopped)
    }

    /// Seed the id sequence so new rows start above `start_index`.
    fn seed(&self, start_index: i64) -> Result<(), Error> {
        let updated = self.connection.execute(
            "UPDATE sqlite_sequence SET seq = ?1 WHERE name = 'workflows' AND seq < ?1",
            params![start_index],
        )?;

        if updated == 0 {
            let result = self.connection.execute(
                "INSERT INTO sqlite_sequence(name, seq) VALUES ('workflows', ?1)",
                params![start_index],
            );
            ignore_constraint(result)?;
        }

        Ok(())
    }
}

fn row_to_workflow(row: &Row<'_>) -> Result<WorkflowRow, rusqlite::Error> {
    Ok(WorkflowRow {
        id: row.get(0)?,
        name: row.get(1)?,
        log: row.get::<_, Option<String>>(2)?.map(PathBuf::from),
        jobs: row.get(3)?,
        submitted: row.get(4)?,
        completed: row.get(5)?,
        priority: row.get(6)?,
        status: Status::from_code(row.get(7)?),
    })
}

fn row_to_summary(row: &Row<'_>) -> Result<WorkflowSummary, rusqlite::Error> {
    Ok(WorkflowSummary {
        id: row.get(0)?,
        name: row.get(1)?,
        submitted: row.get(2)?,
        completed: row.get(3)?,
        status: Status::from_code(row.get(4)?),
        priority: row.get(5)?,
    })
}

/// Seconds since the epoch, as the original stored submission times.
fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or_default()
}

/// Ignore uniqueness violations, warning instead of failing the write.
fn ignore_constraint(result: Result<usize, rusqlite::Error>) -> Result<usize, rusqlite::Error> {
    match result {
        Err(rusqlite::Error::SqliteFailure(error, message))
            if error.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            warn!(
                "Ignored a constraint violation: {}",
                message.unwrap_or_default()
            );
            Ok(0)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use assert_fs::TempDir;
    use serial_test::parallel;

    use super::*;

    fn open_store(temp: &TempDir) -> WorkflowStore {
        WorkflowStore::open(&temp.path().join("test.db"), None).unwrap()
    }

    #[test]
    #[parallel]
    fn add_and_get_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        let jobs = r#"[{"cmd":"true"}]"#;
        let id = store
            .add_workflow("w", Some(Path::new("/tmp/w.log")), jobs, 3, Status::Initialized)
            .unwrap();

        let row = store.get_workflow(id).unwrap().unwrap();
        assert_eq!(row.id, id);
        assert_eq!(row.name, "w");
        assert_eq!(row.log, Some(PathBuf::from("/tmp/w.log")));
        assert_eq!(row.jobs, jobs);
        assert_eq!(row.priority, 3);
        assert_eq!(row.status, Status::Initialized);
        assert!(row.submitted > 0.0);
        assert!(row.completed.is_none());
    }

    #[test]
    #[parallel]
    fn find_workflow_by_jobs_blob() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        let jobs = r#"[{"cmd":"blast"}]"#;
        let id = store
            .add_workflow("w", None, jobs, 0, Status::Initialized)
            .unwrap();

        let row = store.find_workflow(jobs).unwrap().unwrap();
        assert_eq!(row.id, id);

        assert!(store.find_workflow("[]").unwrap().is_none());
    }

    #[test]
    #[parallel]
    fn find_workflow_returns_the_newest_match() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        let jobs = r#"[{"cmd":"x"}]"#;
        store
            .add_workflow("old", None, jobs, 0, Status::Initialized)
            .unwrap();
        let newest = store
            .add_workflow("new", None, jobs, 0, Status::Initialized)
            .unwrap();

        let row = store.find_workflow(jobs).unwrap().unwrap();
        assert_eq!(row.id, newest);
    }

    #[test]
    #[parallel]
    fn update_status_stamps_completion() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        let id = store
            .add_workflow("w", None, "[]", 0, Status::Initialized)
            .unwrap();

        store.update_status(id, Status::Running, false).unwrap();
        let row = store.get_workflow(id).unwrap().unwrap();
        assert_eq!(row.status, Status::Running);
        assert!(row.completed.is_none());

        store.update_status(id, Status::Completed, true).unwrap();
        let row = store.get_workflow(id).unwrap().unwrap();
        assert_eq!(row.status, Status::Completed);
        assert!(row.completed.is_some());
    }

    #[test]
    #[parallel]
    fn get_status_reports_not_found() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        assert_eq!(store.get_status(99).unwrap(), Status::NotFound);
    }

    #[test]
    #[parallel]
    fn update_workflow_replaces_submission_fields() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        let id = store
            .add_workflow("before", None, "[1]", 0, Status::Initialized)
            .unwrap();

        store
            .update_workflow(id, "after", Some(Path::new("log")), "[2]", 5)
            .unwrap();

        let row = store.get_workflow(id).unwrap().unwrap();
        assert_eq!(row.name, "after");
        assert_eq!(row.jobs, "[2]");
        assert_eq!(row.priority, 5);
        assert_eq!(row.log, Some(PathBuf::from("log")));
    }

    #[test]
    #[parallel]
    fn fetch_all_and_by_id() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        let first = store
            .add_workflow("a", None, "[1]", 0, Status::Initialized)
            .unwrap();
        let second = store
            .add_workflow("b", None, "[2]", 0, Status::Initialized)
            .unwrap();

        let all = store.fetch(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first);
        assert_eq!(all[1].id, second);

        let some = store.fetch(Some(&[second, 99])).unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].id, second);
        assert_eq!(some[0].name, "b");
    }

    #[test]
    #[parallel]
    fn stop_workflows_only_touches_running_rows() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        let running = store
            .add_workflow("r", None, "[1]", 0, Status::Running)
            .unwrap();
        let completed = store
            .add_workflow("c", None, "[2]", 0, Status::Completed)
            .unwrap();

        let stopped = store.stop_workflows().unwrap();
        assert_eq!(stopped, 1);

        assert_eq!(store.get_status(running).unwrap(), Status::Stopped);
        assert_eq!(store.get_status(completed).unwrap(), Status::Completed);

        let row = store.get_workflow(running).unwrap().unwrap();
        assert!(row.completed.is_some());
    }

    #[test]
    #[parallel]
    fn start_index_seeds_new_ids() {
        let temp = TempDir::new().unwrap();
        let store = WorkflowStore::open(&temp.path().join("seeded.db"), Some(1000)).unwrap();

        let id = store
            .add_workflow("w", None, "[]", 0, Status::Initialized)
            .unwrap();
        assert!(id > 1000);
    }

    #[test]
    #[parallel]
    fn reopening_preserves_rows() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("persist.db");

        let id = {
            let store = WorkflowStore::open(&path, None).unwrap();
            store
                .add_workflow("w", None, "[1]", 0, Status::Running)
                .unwrap()
        };

        let store = WorkflowStore::open(&path, None).unwrap();
        assert_eq!(store.get_status(id).unwrap(), Status::Running);
    }
}
