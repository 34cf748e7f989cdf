//! XPO SQLite Store
//!
//! Durable backend for [`LineageStore`], [`RequestStore`] and [`AuditSink`].
//!
//! The run table is append-only for content columns and write-once for the
//! terminal flag columns; the audit table is fully append-only. Both rules
//! are enforced by triggers, so a bug above this layer cannot rewrite
//! history. A partial unique index keeps one live batch per step slot.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, Row, Transaction};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use xpo_graph::StageId;
use xpo_store::{
    check_flag_update, AuditSink, FlagUpdate, InvocationId, LineageEnd, LineageStore, NewRequest, Request,
    RequestId, RequestStore, Run, RunDraft, RunId, RunStatus, StepAudit, StepKey, StoreError, TerminalFlags,
};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS requests (
  request_id TEXT PRIMARY KEY,
  subject_id TEXT NOT NULL,
  objective TEXT NOT NULL,
  usecase TEXT NOT NULL,
  sequence INTEGER NOT NULL,
  phase TEXT NOT NULL,
  seed_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(subject_id, sequence)
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  request_id TEXT NOT NULL,
  parent_run_id TEXT,
  parent_key TEXT NOT NULL,
  stage TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('in_progress','completed','failed')),
  input_json TEXT NOT NULL,
  output_json TEXT NOT NULL,
  input_digest TEXT NOT NULL,
  branch_index INTEGER NOT NULL,
  attempt INTEGER NOT NULL,
  lineage_end TEXT,
  approved INTEGER NOT NULL DEFAULT 0 CHECK (approved IN (0,1)),
  deployed_at TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (request_id) REFERENCES requests(request_id),
  FOREIGN KEY (parent_run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS step_audit (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  invocation_id TEXT NOT NULL,
  step_name TEXT NOT NULL,
  step_order INTEGER NOT NULL,
  subject_id TEXT NOT NULL,
  step_input_json TEXT NOT NULL,
  step_output_json TEXT NOT NULL,
  merge_conflicts_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_live_slot
  ON runs(request_id, parent_key, stage, branch_index) WHERE status <> 'failed';
CREATE INDEX IF NOT EXISTS idx_runs_request ON runs(request_id);
CREATE INDEX IF NOT EXISTS idx_runs_parent ON runs(parent_run_id);
CREATE INDEX IF NOT EXISTS idx_step_audit_invocation ON step_audit(invocation_id, step_order);

CREATE TRIGGER IF NOT EXISTS trg_runs_content_no_update
BEFORE UPDATE OF run_id, request_id, parent_run_id, parent_key, stage, status,
  input_json, output_json, input_digest, branch_index, attempt, lineage_end, created_at
ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs content is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_runs_flags_write_once
BEFORE UPDATE OF approved, deployed_at ON runs
WHEN OLD.deployed_at IS NOT NULL OR (OLD.approved = 1 AND NEW.approved = 0)
BEGIN
  SELECT RAISE(FAIL, 'run flags are write-once');
END;
CREATE TRIGGER IF NOT EXISTS trg_runs_no_delete
BEFORE DELETE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_step_audit_no_update
BEFORE UPDATE ON step_audit
BEGIN
  SELECT RAISE(FAIL, 'step_audit is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_step_audit_no_delete
BEFORE DELETE ON step_audit
BEGIN
  SELECT RAISE(FAIL, 'step_audit is append-only');
END;
";

const RUN_COLUMNS: &str = "r.run_id, r.request_id, r.parent_run_id, r.stage, r.status, r.input_json, \
     r.output_json, r.input_digest, r.branch_index, r.attempt, r.lineage_end, r.approved, \
     r.deployed_at, r.created_at";

const REQUEST_COLUMNS: &str =
    "request_id, subject_id, objective, usecase, sequence, phase, seed_json, created_at";

/// Backend-internal failures, folded into [`StoreError`] at the trait boundary
#[derive(Debug, Error)]
enum SqliteError {
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("blocking task failed: {0}")]
    Join(String),
}

impl From<SqliteError> for StoreError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Store(inner) => inner,
            SqliteError::Json(e) => StoreError::Serialization(e.to_string()),
            SqliteError::Corrupt(msg) => StoreError::Serialization(msg),
            SqliteError::Sql(e) => StoreError::Unavailable(e.to_string()),
            SqliteError::Join(msg) => StoreError::Unavailable(msg),
        }
    }
}

type Result<T> = std::result::Result<T, SqliteError>;

/// SQLite-backed implementation of the three store traits
///
/// One connection behind a mutex; calls run on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database file, configure pragmas and migrate
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the file cannot be opened or migrated.
    pub fn open(path: &Path) -> std::result::Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(SqliteError::from)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(SqliteError::from)?;
        Self::from_connection(conn)
    }

    /// Private in-memory database
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the schema cannot be applied.
    pub fn open_in_memory() -> std::result::Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(SqliteError::from)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(SqliteError::from)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> std::result::Result<Self, StoreError> {
        migrate(&conn)?;
        tracing::debug!(version = SCHEMA_VERSION, "sqlite schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> std::result::Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| SqliteError::Join(e.to_string()))?;
        outcome.map_err(StoreError::from)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_V1)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, rfc3339(Utc::now())],
    )?;
    Ok(())
}

#[async_trait]
impl LineageStore for SqliteStore {
    async fn append_children(
        &self,
        key: &StepKey,
        drafts: Vec<RunDraft>,
    ) -> std::result::Result<Vec<Run>, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let created = append_in(&tx, &key, drafts)?;
            tx.commit()?;
            Ok(created)
        })
        .await
    }

    async fn slot(&self, key: &StepKey) -> std::result::Result<Vec<Run>, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            query_runs(
                conn,
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs r
                     WHERE r.request_id = ?1 AND r.parent_key = ?2 AND r.stage = ?3
                     ORDER BY r.rowid"
                ),
                params![key.request_id.to_string(), key.parent_key(), key.stage.as_str()],
            )
        })
        .await
    }

    async fn get_run(&self, id: RunId) -> std::result::Result<Run, StoreError> {
        self.with_conn(move |conn| fetch_run(conn, id)).await
    }

    async fn runs_for(&self, request_id: RequestId) -> std::result::Result<Vec<Run>, StoreError> {
        self.with_conn(move |conn| {
            query_runs(
                conn,
                &format!("SELECT {RUN_COLUMNS} FROM runs r WHERE r.request_id = ?1 ORDER BY r.rowid"),
                params![request_id.to_string()],
            )
        })
        .await
    }

    async fn latest_leaves(&self, request_id: RequestId) -> std::result::Result<Vec<Run>, StoreError> {
        self.with_conn(move |conn| {
            query_runs(
                conn,
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs r
                     WHERE r.request_id = ?1
                       AND NOT EXISTS (SELECT 1 FROM runs c WHERE c.parent_run_id = r.run_id)
                     ORDER BY r.rowid"
                ),
                params![request_id.to_string()],
            )
        })
        .await
    }

    async fn chain(&self, id: RunId) -> std::result::Result<Vec<Run>, StoreError> {
        self.with_conn(move |conn| {
            let path = query_runs(
                conn,
                &format!(
                    "WITH RECURSIVE path(run_id, depth) AS (
                       SELECT run_id, 0 FROM runs WHERE run_id = ?1
                       UNION ALL
                       SELECT r.parent_run_id, p.depth + 1
                       FROM runs r JOIN path p ON r.run_id = p.run_id
                       WHERE r.parent_run_id IS NOT NULL
                     )
                     SELECT {RUN_COLUMNS} FROM runs r JOIN path p ON p.run_id = r.run_id
                     ORDER BY p.depth DESC"
                ),
                params![id.to_string()],
            )?;
            if path.is_empty() {
                return Err(StoreError::run_not_found(id).into());
            }
            Ok(path)
        })
        .await
    }

    async fn set_terminal_flags(&self, id: RunId, update: FlagUpdate) -> std::result::Result<Run, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let run = fetch_run(&tx, id)?;
            let has_children: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM runs WHERE parent_run_id = ?1)",
                params![id.to_string()],
                |row| row.get(0),
            )?;
            check_flag_update(&run, update, has_children)?;

            match update {
                FlagUpdate::Approve => {
                    tx.execute("UPDATE runs SET approved = 1 WHERE run_id = ?1", params![id.to_string()])?;
                }
                FlagUpdate::Deploy(when) => {
                    tx.execute(
                        "UPDATE runs SET deployed_at = ?2 WHERE run_id = ?1",
                        params![id.to_string(), rfc3339(when)],
                    )?;
                }
            }
            let updated = fetch_run(&tx, id)?;
            tx.commit()?;
            Ok(updated)
        })
        .await
    }
}

fn append_in(tx: &Transaction<'_>, key: &StepKey, drafts: Vec<RunDraft>) -> Result<Vec<Run>> {
    let request_known: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM requests WHERE request_id = ?1)",
        params![key.request_id.to_string()],
        |row| row.get(0),
    )?;
    if !request_known {
        return Err(StoreError::request_not_found(key.request_id).into());
    }
    if let Some(parent) = key.parent {
        let parent = fetch_run(tx, parent)?;
        if parent.request_id != key.request_id {
            return Err(StoreError::invalid_update(parent.id, "parent belongs to another request").into());
        }
    }

    let (live, last_attempt): (i64, Option<i64>) = tx.query_row(
        "SELECT COUNT(*) FILTER (WHERE status <> 'failed'), MAX(attempt)
         FROM runs WHERE request_id = ?1 AND parent_key = ?2 AND stage = ?3",
        params![key.request_id.to_string(), key.parent_key(), key.stage.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if live > 0 {
        return Err(StoreError::Conflict {
            parent: key.parent_key(),
            stage: key.stage.to_string(),
        }
        .into());
    }
    let attempt = u32::try_from(last_attempt.unwrap_or(0) + 1)
        .map_err(|_| SqliteError::Corrupt("attempt counter overflow".into()))?;

    let mut created = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let run = Run::from_draft(key, draft, attempt);
        insert_run(tx, key, &run)?;
        created.push(run);
    }
    Ok(created)
}

/// Insert one run; a live-slot collision from another writer is a [`StoreError::Conflict`]
fn insert_run(tx: &Transaction<'_>, key: &StepKey, run: &Run) -> Result<()> {
    let inserted = tx.execute(
        "INSERT INTO runs(
            run_id, request_id, parent_run_id, parent_key, stage, status,
            input_json, output_json, input_digest, branch_index, attempt,
            lineage_end, approved, deployed_at, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, NULL, ?13)",
        params![
            run.id.to_string(),
            run.request_id.to_string(),
            run.parent.map(|p| p.to_string()),
            key.parent_key(),
            run.stage.as_str(),
            run.status.as_str(),
            serde_json::to_string(&run.input)?,
            serde_json::to_string(&run.output)?,
            run.input_digest,
            run.branch_index,
            run.attempt,
            run.lineage_end.map(|e| e.as_str()),
            rfc3339(run.created_at),
        ],
    );
    match inserted {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation
                && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            tracing::debug!(slot = %key, "live slot taken by another writer");
            Err(StoreError::Conflict {
                parent: key.parent_key(),
                stage: key.stage.to_string(),
            }
            .into())
        }
        Err(err) => Err(err.into()),
    }
}

fn fetch_run(conn: &Connection, id: RunId) -> Result<Run> {
    query_runs(
        conn,
        &format!("SELECT {RUN_COLUMNS} FROM runs r WHERE r.run_id = ?1"),
        params![id.to_string()],
    )?
    .pop()
    .ok_or_else(|| StoreError::run_not_found(id).into())
}

fn query_runs(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Run>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(args)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(read_run(row)?);
    }
    Ok(out)
}

fn read_run(row: &Row<'_>) -> Result<Run> {
    let parent: Option<String> = row.get(2)?;
    let lineage_end: Option<String> = row.get(10)?;
    let deployed_at: Option<String> = row.get(12)?;
    let approved: i64 = row.get(11)?;

    Ok(Run {
        id: parse_id(&row.get::<_, String>(0)?)?,
        request_id: parse_id(&row.get::<_, String>(1)?)?,
        parent: parent.as_deref().map(parse_id).transpose()?,
        stage: StageId::new(row.get::<_, String>(3)?),
        status: row
            .get::<_, String>(4)?
            .parse::<RunStatus>()
            .map_err(SqliteError::Corrupt)?,
        input: serde_json::from_str(&row.get::<_, String>(5)?)?,
        output: serde_json::from_str(&row.get::<_, String>(6)?)?,
        input_digest: row.get(7)?,
        branch_index: row.get(8)?,
        attempt: row.get(9)?,
        lineage_end: lineage_end
            .as_deref()
            .map(str::parse::<LineageEnd>)
            .transpose()
            .map_err(SqliteError::Corrupt)?,
        flags: TerminalFlags {
            approved: approved != 0,
            deployed_at: deployed_at.as_deref().map(parse_rfc3339).transpose()?,
        },
        created_at: parse_rfc3339(&row.get::<_, String>(13)?)?,
    })
}

fn read_request(row: &Row<'_>) -> Result<Request> {
    let sequence: i64 = row.get(4)?;
    Ok(Request {
        id: parse_id(&row.get::<_, String>(0)?)?,
        subject_id: row.get(1)?,
        objective: row.get(2)?,
        usecase: row.get(3)?,
        sequence: u64::try_from(sequence).map_err(|_| SqliteError::Corrupt(format!("negative sequence {sequence}")))?,
        phase: row.get(5)?,
        seed: serde_json::from_str(&row.get::<_, String>(6)?)?,
        created_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
    })
}

#[async_trait]
impl RequestStore for SqliteStore {
    async fn create(&self, new: NewRequest, phase: &str) -> std::result::Result<Request, StoreError> {
        let phase = phase.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let last: Option<i64> = tx.query_row(
                "SELECT MAX(sequence) FROM requests WHERE subject_id = ?1",
                params![new.subject_id],
                |row| row.get(0),
            )?;
            let sequence = u64::try_from(last.unwrap_or(0) + 1)
                .map_err(|_| SqliteError::Corrupt("sequence overflow".into()))?;
            let request = Request::from_new(new, sequence, phase);
            tx.execute(
                "INSERT INTO requests(request_id, subject_id, objective, usecase, sequence, phase, seed_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    request.id.to_string(),
                    request.subject_id,
                    request.objective,
                    request.usecase,
                    last.unwrap_or(0) + 1,
                    request.phase,
                    serde_json::to_string(&request.seed)?,
                    rfc3339(request.created_at),
                ],
            )?;
            tx.commit()?;
            Ok(request)
        })
        .await
    }

    async fn get(&self, id: RequestId) -> std::result::Result<Request, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE request_id = ?1"))?;
            let mut rows = stmt.query(params![id.to_string()])?;
            match rows.next()? {
                Some(row) => read_request(row),
                None => Err(StoreError::request_not_found(id).into()),
            }
        })
        .await
    }

    async fn set_phase(&self, id: RequestId, phase: &str) -> std::result::Result<(), StoreError> {
        let phase = phase.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE requests SET phase = ?2 WHERE request_id = ?1",
                params![id.to_string(), phase],
            )?;
            if changed == 0 {
                return Err(StoreError::request_not_found(id).into());
            }
            Ok(())
        })
        .await
    }

    async fn list(&self) -> std::result::Result<Vec<Request>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM requests ORDER BY sequence DESC, created_at DESC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(read_request(row)?);
            }
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl AuditSink for SqliteStore {
    async fn record(&self, entry: StepAudit) -> std::result::Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO step_audit(
                    invocation_id, step_name, step_order, subject_id,
                    step_input_json, step_output_json, merge_conflicts_json, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.invocation_id.to_string(),
                    entry.step_name,
                    entry.step_order,
                    entry.subject_id,
                    serde_json::to_string(&entry.step_input)?,
                    serde_json::to_string(&entry.step_output)?,
                    serde_json::to_string(&entry.merge_conflicts)?,
                    rfc3339(entry.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn by_invocation(&self, invocation: InvocationId) -> std::result::Result<Vec<StepAudit>, StoreError> {
        self.with_conn(move |conn| {
            query_audit(
                conn,
                "WHERE invocation_id = ?1 ORDER BY step_order, id",
                params![invocation.to_string()],
            )
        })
        .await
    }

    async fn step(&self, invocation: InvocationId, step_order: u32) -> std::result::Result<Vec<StepAudit>, StoreError> {
        self.with_conn(move |conn| {
            query_audit(
                conn,
                "WHERE invocation_id = ?1 AND step_order = ?2 ORDER BY id",
                params![invocation.to_string(), step_order],
            )
        })
        .await
    }
}

fn query_audit(conn: &Connection, filter: &str, args: impl rusqlite::Params) -> Result<Vec<StepAudit>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT invocation_id, step_name, step_order, subject_id, step_input_json,
                step_output_json, merge_conflicts_json, created_at
         FROM step_audit {filter}"
    ))?;
    let mut rows = stmt.query(args)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(StepAudit {
            invocation_id: parse_id(&row.get::<_, String>(0)?)?,
            step_name: row.get(1)?,
            step_order: row.get(2)?,
            subject_id: row.get(3)?,
            step_input: serde_json::from_str(&row.get::<_, String>(4)?)?,
            step_output: serde_json::from_str(&row.get::<_, String>(5)?)?,
            merge_conflicts: serde_json::from_str(&row.get::<_, String>(6)?)?,
            created_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
        });
    }
    Ok(out)
}

fn parse_id<T>(value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| SqliteError::Corrupt(format!("bad id {value}: {e}")))
}

fn rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| SqliteError::Corrupt(format!("bad timestamp {value}: {e}")))
}
