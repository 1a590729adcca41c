// ABOUTME: Persistent run history (pushes, jobs, targets, results) in a SQLite database.
// ABOUTME: Written only by the Exchange; read helpers serve tests and operator tooling.
use crate::messages::{PushEvent, SelectorKind, StateResult, TargetResult};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS pushes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        received_at TEXT NOT NULL,
        gitref TEXT NOT NULL,
        repo_name TEXT NOT NULL,
        repo_url TEXT NOT NULL,
        commit_id TEXT NOT NULL,
        commit_msg TEXT NOT NULL,
        commit_ts TEXT NOT NULL,
        commit_url TEXT NOT NULL,
        commit_author TEXT NOT NULL,
        pusher TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        selector_kind TEXT NOT NULL,
        target TEXT NOT NULL,
        push_id INTEGER REFERENCES pushes(id)
    );
    CREATE TABLE IF NOT EXISTS job_targets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES jobs(id),
        target TEXT NOT NULL,
        position INTEGER NOT NULL,
        UNIQUE(job_id, target)
    );
    CREATE TABLE IF NOT EXISTS target_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_target_id INTEGER NOT NULL REFERENCES job_targets(id),
        key_state TEXT,
        key_id TEXT,
        key_name TEXT,
        key_func TEXT,
        comment TEXT,
        result INTEGER NOT NULL,
        run_num INTEGER,
        changed INTEGER,
        is_error INTEGER NOT NULL DEFAULT 0,
        output TEXT NOT NULL
    );
";

const DROP_TABLES: &str = "
    DROP TABLE IF EXISTS target_results;
    DROP TABLE IF EXISTS job_targets;
    DROP TABLE IF EXISTS jobs;
    DROP TABLE IF EXISTS pushes;
";

/// Marker stored as `key_id` for error records.
pub const ERROR_RECORD_ID: &str = "Minion Error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPush {
    pub id: i64,
    pub event: PushEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJob {
    pub id: i64,
    pub run_id: String,
    pub created_at: String,
    pub selector_kind: SelectorKind,
    pub target: String,
    pub push_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJobTarget {
    pub id: i64,
    pub job_id: i64,
    pub target: String,
}

#[derive(Clone)]
pub struct HistoryStore {
    db: Arc<Mutex<Connection>>,
}

impl HistoryStore {
    /// Open (creating if needed) the database file and its tables
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        let store = Self::from_connection(conn)?;
        tracing::info!(db = %path.display(), "HistoryStore initialized");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(CREATE_TABLES)
            .context("Failed to create history tables")?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    pub fn create_tables(&self) -> Result<()> {
        tracing::info!("Creating database tables");
        self.conn()?.execute_batch(CREATE_TABLES)?;
        Ok(())
    }

    pub fn drop_tables(&self) -> Result<()> {
        tracing::warn!("Dropping database tables");
        self.conn()?.execute_batch(DROP_TABLES)?;
        Ok(())
    }

    /// Persist a push, returning its id
    pub fn insert_push(&self, event: &PushEvent) -> Result<i64> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO pushes (received_at, gitref, repo_name, repo_url, commit_id, commit_msg,
                                 commit_ts, commit_url, commit_author, pusher)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.received_at.to_rfc3339(),
                &event.gitref,
                &event.repo_name,
                &event.repo_url,
                &event.commit_id,
                &event.commit_msg,
                &event.commit_ts,
                &event.commit_url,
                &event.commit_author,
                &event.pusher,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn get_push(&self, id: i64) -> Result<Option<StoredPush>> {
        let db = self.conn()?;
        let row = db
            .query_row(
                "SELECT id, received_at, gitref, repo_name, repo_url, commit_id, commit_msg,
                        commit_ts, commit_url, commit_author, pusher
                 FROM pushes WHERE id = ?1",
                params![id],
                |row| {
                    let received_at: String = row.get(1)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        received_at,
                        PushEvent {
                            gitref: row.get(2)?,
                            repo_name: row.get(3)?,
                            repo_url: row.get(4)?,
                            commit_id: row.get(5)?,
                            commit_msg: row.get(6)?,
                            commit_ts: row.get(7)?,
                            commit_url: row.get(8)?,
                            commit_author: row.get(9)?,
                            pusher: row.get(10)?,
                            received_at: Utc::now(),
                        },
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, received_at, mut event)) => {
                event.received_at = DateTime::parse_from_rfc3339(&received_at)
                    .with_context(|| format!("Invalid received_at on push {}", id))?
                    .with_timezone(&Utc);
                Ok(Some(StoredPush { id, event }))
            }
            None => Ok(None),
        }
    }

    /// Persist a job and its expected targets in one transaction, returning the job id
    pub fn insert_job(
        &self,
        run_id: &str,
        target: &str,
        selector_kind: SelectorKind,
        push_id: Option<i64>,
        targets: &[String],
    ) -> Result<i64> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO jobs (run_id, created_at, selector_kind, target, push_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                Utc::now().to_rfc3339(),
                selector_kind.as_str(),
                target,
                push_id
            ],
        )?;
        let job_id = tx.last_insert_rowid();
        for (position, name) in targets.iter().enumerate() {
            tx.execute(
                "INSERT INTO job_targets (job_id, target, position) VALUES (?1, ?2, ?3)",
                params![job_id, name, position as i64],
            )?;
        }
        tx.commit()?;
        Ok(job_id)
    }

    pub fn get_job(&self, run_id: &str) -> Result<Option<StoredJob>> {
        let db = self.conn()?;
        let job = db
            .query_row(
                "SELECT id, run_id, created_at, selector_kind, target, push_id
                 FROM jobs WHERE run_id = ?1",
                params![run_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    pub fn jobs_for_push(&self, push_id: i64) -> Result<Vec<StoredJob>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, run_id, created_at, selector_kind, target, push_id
             FROM jobs WHERE push_id = ?1 ORDER BY id",
        )?;
        let jobs = stmt
            .query_map(params![push_id], row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Expected targets of a job, in dispatch order
    pub fn job_targets(&self, job_id: i64) -> Result<Vec<StoredJobTarget>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, job_id, target FROM job_targets WHERE job_id = ?1 ORDER BY position",
        )?;
        let targets = stmt
            .query_map(params![job_id], |row| {
                Ok(StoredJobTarget {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    target: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(targets)
    }

    /// Append a result to the target of a run
    pub fn insert_result(&self, run_id: &str, target: &str, result: &TargetResult) -> Result<i64> {
        let db = self.conn()?;
        let job_target_id: i64 = db
            .query_row(
                "SELECT jt.id FROM job_targets jt JOIN jobs j ON jt.job_id = j.id
                 WHERE j.run_id = ?1 AND jt.target = ?2",
                params![run_id, target],
                |row| row.get(0),
            )
            .optional()?
            .with_context(|| format!("Target {} is not part of run {}", target, run_id))?;

        match result {
            TargetResult::State(state) => {
                db.execute(
                    "INSERT INTO target_results (job_target_id, key_state, key_id, key_name, key_func,
                                                 comment, result, run_num, changed, is_error, output)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)",
                    params![
                        job_target_id,
                        &state.key_state,
                        &state.key_id,
                        &state.key_name,
                        &state.key_func,
                        &state.comment,
                        state.result,
                        state.run_num,
                        state.changed,
                        &state.output,
                    ],
                )?;
            }
            TargetResult::Error { output } => {
                db.execute(
                    "INSERT INTO target_results (job_target_id, key_id, result, is_error, output)
                     VALUES (?1, ?2, 0, 1, ?3)",
                    params![job_target_id, ERROR_RECORD_ID, output],
                )?;
            }
        }
        Ok(db.last_insert_rowid())
    }

    /// Results reported by one job target, in arrival order
    pub fn results_for_target(&self, job_target_id: i64) -> Result<Vec<TargetResult>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT key_state, key_id, key_name, key_func, comment, result, run_num, changed,
                    is_error, output
             FROM target_results WHERE job_target_id = ?1 ORDER BY id",
        )?;
        let results = stmt
            .query_map(params![job_target_id], |row| {
                let is_error = row.get::<_, i32>(8)? != 0;
                let output: String = row.get(9)?;
                if is_error {
                    return Ok(TargetResult::Error { output });
                }
                Ok(TargetResult::State(StateResult {
                    key_state: row.get(0)?,
                    key_id: row.get(1)?,
                    key_name: row.get(2)?,
                    key_func: row.get(3)?,
                    comment: row.get(4)?,
                    result: row.get::<_, i32>(5)? != 0,
                    run_num: row.get(6)?,
                    changed: row.get(7)?,
                    output,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(results)
    }

    pub fn count_pushes(&self) -> Result<i64> {
        let db = self.conn()?;
        Ok(db.query_row("SELECT COUNT(*) FROM pushes", [], |row| row.get(0))?)
    }

    pub fn count_jobs(&self) -> Result<i64> {
        let db = self.conn()?;
        Ok(db.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?)
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredJob> {
    let selector_kind: String = row.get(3)?;
    Ok(StoredJob {
        id: row.get(0)?,
        run_id: row.get(1)?,
        created_at: row.get(2)?,
        selector_kind: selector_kind.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?,
        target: row.get(4)?,
        push_id: row.get(5)?,
    })
}
