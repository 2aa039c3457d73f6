use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use vds_common::{
    Approval, AutonomyLevel, MessageRole, Plan, PolicyDecision, SessionStatus, StepStatus,
};

use super::StoreResult;
use super::models::*;
use crate::errors::OrchestratorError;

/// Sessions titles are the question, cut to this many characters.
const TITLE_MAX_CHARS: usize = 120;
const TENANT: &str = "default";

const SESSION_COLUMNS: &str = "id, title, goal, domain, autonomy, status, plan, current_step_index, \
     context, approval, data_source_ids, final_output, error, created_at, updated_at";

/// Async-safe handle to the session database.
///
/// Wraps `SessionDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`. Also owns the approval signal
/// that wakes checkpoint waiters when an approval is written through this
/// handle.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SessionDb>>,
    approvals: Arc<Notify>,
}

impl DbHandle {
    pub fn new(db: SessionDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
            approvals: Arc::new(Notify::new()),
        }
    }

    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }
        Ok(Self::new(SessionDb::new(path)?))
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(SessionDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&SessionDb) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> anyhow::Result<std::sync::MutexGuard<'_, SessionDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }

    pub(crate) fn approval_notify(&self) -> Arc<Notify> {
        self.approvals.clone()
    }
}

pub struct SessionDb {
    conn: Connection,
}

impl SessionDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        // The CLI approves against the same file a running server polls.
        self.conn
            .busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    goal TEXT NOT NULL,
                    domain TEXT NOT NULL DEFAULT 'generic',
                    autonomy TEXT NOT NULL DEFAULT 'assist',
                    status TEXT NOT NULL DEFAULT 'created',
                    plan TEXT NOT NULL DEFAULT '[]',
                    current_step_index INTEGER NOT NULL DEFAULT 0,
                    context TEXT NOT NULL DEFAULT '{}',
                    approval TEXT,
                    data_source_ids TEXT NOT NULL DEFAULT '[]',
                    final_output TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    agent TEXT,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    artifact_type TEXT NOT NULL,
                    name TEXT NOT NULL,
                    content TEXT NOT NULL,
                    agent TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS audit_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    actor TEXT NOT NULL,
                    action TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    decision TEXT NOT NULL,
                    tenant TEXT NOT NULL DEFAULT 'default',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_runs (
                    id TEXT PRIMARY KEY,
                    workflow_name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    inputs TEXT NOT NULL DEFAULT '{}',
                    steps_log TEXT NOT NULL DEFAULT '[]',
                    error TEXT,
                    started_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
                CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
                CREATE INDEX IF NOT EXISTS idx_artifacts_session ON artifacts(session_id);
                CREATE INDEX IF NOT EXISTS idx_audit_events_session ON audit_events(session_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────

    /// Insert a session in `created` status together with the question as
    /// its first user message.
    pub fn create_session(&self, new: &NewSession) -> StoreResult<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let title: String = new.question.chars().take(TITLE_MAX_CHARS).collect();
        let data_source_ids = serde_json::to_string(&new.data_source_ids)
            .context("Failed to serialize data source ids")?;
        let now = now();

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO sessions (id, title, goal, domain, autonomy, status, data_source_ids, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                title,
                new.question,
                new.domain,
                new.autonomy.as_str(),
                SessionStatus::Created.as_str(),
                data_source_ids,
                now
            ],
        )
        .context("Failed to insert session")?;
        insert_message(&tx, &id, &NewMessage::user(new.question.clone()))?;
        tx.commit().context("Failed to commit session creation")?;

        require(&self.conn, &id)
    }

    pub fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        load_session(&self.conn, id)
    }

    pub fn list_sessions(&self, status: Option<SessionStatus>) -> StoreResult<Vec<Session>> {
        let sql = match status {
            Some(_) => format!(
                "SELECT {} FROM sessions WHERE status = ?1 ORDER BY created_at, id",
                SESSION_COLUMNS
            ),
            None => format!(
                "SELECT {} FROM sessions ORDER BY created_at, id",
                SESSION_COLUMNS
            ),
        };
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_sessions")?;
        let rows = match status {
            Some(s) => stmt.query_map(params![s.as_str()], read_session_row),
            None => stmt.query_map([], read_session_row),
        }
        .context("Failed to query sessions")?;

        let mut sessions = Vec::new();
        for row in rows {
            let r = row.context("Failed to read session row")?;
            sessions.push(r.into_session()?);
        }
        Ok(sessions)
    }

    /// Sessions that have not reached `done` or `failed`.
    pub fn list_unfinished_sessions(&self) -> StoreResult<Vec<Session>> {
        Ok(self
            .list_sessions(None)?
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .collect())
    }

    /// Apply a lifecycle update after re-reading the current row. Refuses to
    /// touch terminal sessions or to make a transition the state machine
    /// does not allow.
    pub fn update_progress(&self, id: &str, update: &ProgressUpdate) -> StoreResult<Session> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut session = require(&tx, id)?;
        ensure_not_terminal(&session)?;

        if let Some(next) = update.status {
            ensure_transition(&session, next)?;
            session.status = next;
        }
        if let Some(plan) = &update.plan {
            session.plan = plan.clone();
        }
        if let Some((index, status)) = update.step_status {
            if !session.plan.set_status(index, status) {
                return Err(anyhow::anyhow!(
                    "Step index {} out of range for session {} ({} steps)",
                    index,
                    id,
                    session.plan.len()
                )
                .into());
            }
        }
        if let Some(index) = update.current_step_index {
            session.current_step_index = session.current_step_index.max(index);
        }

        write_progress(&tx, &session)?;
        tx.commit().context("Failed to commit progress update")?;
        require(&self.conn, id)
    }

    /// Write an approval onto a session that sits at a checkpoint with no
    /// approval pending. The status check and the write are one statement.
    pub fn record_approval(&self, id: &str, approval: &Approval) -> StoreResult<Session> {
        let json = serde_json::to_string(approval).context("Failed to serialize approval")?;
        let changed = self
            .conn
            .execute(
                "UPDATE sessions SET approval = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'checkpoint' AND approval IS NULL",
                params![json, now(), id],
            )
            .context("Failed to record approval")?;

        let session = require(&self.conn, id)?;
        if changed == 0 {
            if session.status != SessionStatus::Checkpoint {
                return Err(OrchestratorError::NotAwaitingApproval {
                    id: id.to_string(),
                    status: session.status,
                });
            }
            return Err(OrchestratorError::ApprovalAlreadyRecorded { id: id.to_string() });
        }
        Ok(session)
    }

    /// Read and clear the transient approval field in one transaction.
    pub fn take_approval(&self, id: &str) -> StoreResult<Option<Approval>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let raw: Option<Option<String>> = tx
            .query_row(
                "SELECT approval FROM sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read approval")?;
        let raw = match raw {
            Some(raw) => raw,
            None => return Err(OrchestratorError::SessionNotFound { id: id.to_string() }),
        };
        let Some(raw) = raw else {
            return Ok(None);
        };

        let approval: Approval =
            serde_json::from_str(&raw).context("Failed to parse approval JSON")?;
        tx.execute(
            "UPDATE sessions SET approval = NULL, updated_at = ?1 WHERE id = ?2",
            params![now(), id],
        )
        .context("Failed to clear approval")?;
        tx.commit().context("Failed to commit approval read")?;
        Ok(Some(approval))
    }

    /// Persist a completed step: context entry, artifacts, success message,
    /// audit event, step `done` and index advance, all or nothing.
    pub fn commit_step(&self, id: &str, commit: &StepCommit) -> StoreResult<Session> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut session = require(&tx, id)?;
        ensure_not_terminal(&session)?;

        if session.context.contains_key(&commit.step_id) {
            return Err(OrchestratorError::ContextEntryExists {
                id: id.to_string(),
                step_id: commit.step_id.clone(),
            });
        }
        session
            .context
            .insert(commit.step_id.clone(), Value::Object(commit.result.clone()));
        if !session.plan.set_status(commit.index, StepStatus::Done) {
            return Err(anyhow::anyhow!(
                "Step index {} out of range for session {}",
                commit.index,
                id
            )
            .into());
        }
        session.current_step_index = session.current_step_index.max(commit.index + 1);
        write_progress(&tx, &session)?;

        for artifact in &commit.artifacts {
            insert_artifact(&tx, id, artifact)?;
        }
        insert_message(&tx, id, &commit.message)?;
        insert_audit_event(&tx, id, &commit.audit)?;

        tx.commit().context("Failed to commit step")?;
        require(&self.conn, id)
    }

    /// Move a session to `failed`, marking the failing step and recording the
    /// failure message and audit event.
    pub fn fail_session(&self, id: &str, failure: &FailureRecord) -> StoreResult<Session> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut session = require(&tx, id)?;
        ensure_not_terminal(&session)?;

        if let Some(index) = failure.step_index {
            session.plan.set_status(index, StepStatus::Failed);
        }
        session.status = SessionStatus::Failed;
        session.error = Some(failure.reason.clone());
        write_progress(&tx, &session)?;
        // An approval that landed after the gate's last check no longer applies.
        if session.approval.is_some() {
            tracing::warn!(session_id = id, "discarding approval recorded after the checkpoint closed");
            tx.execute("UPDATE sessions SET approval = NULL WHERE id = ?1", params![id])
                .context("Failed to clear approval")?;
        }
        insert_message(&tx, id, &failure.message)?;
        insert_audit_event(&tx, id, &failure.audit)?;

        tx.commit().context("Failed to commit session failure")?;
        require(&self.conn, id)
    }

    /// Store the final output and move a finalizing session to `done`.
    pub fn complete_session(&self, id: &str, completion: &Completion) -> StoreResult<Session> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut session = require(&tx, id)?;
        ensure_not_terminal(&session)?;
        ensure_transition(&session, SessionStatus::Done)?;

        session.status = SessionStatus::Done;
        session.final_output = Some(completion.final_output.clone());
        write_progress(&tx, &session)?;
        insert_message(&tx, id, &completion.message)?;
        insert_audit_event(&tx, id, &completion.audit)?;

        tx.commit().context("Failed to commit session completion")?;
        require(&self.conn, id)
    }

    // ── Messages, artifacts, audit ────────────────────────────────────

    pub fn append_message(&self, id: &str, message: &NewMessage) -> StoreResult<Message> {
        require(&self.conn, id)?;
        insert_message(&self.conn, id, message)
    }

    pub fn append_artifact(&self, id: &str, artifact: &NewArtifact) -> StoreResult<Artifact> {
        require(&self.conn, id)?;
        insert_artifact(&self.conn, id, artifact)
    }

    pub fn append_audit_event(&self, id: &str, event: &NewAuditEvent) -> StoreResult<AuditEvent> {
        require(&self.conn, id)?;
        insert_audit_event(&self.conn, id, event)
    }

    /// Messages in creation order.
    pub fn list_messages(&self, id: &str) -> StoreResult<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, session_id, role, agent, content, created_at
                 FROM messages WHERE session_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_messages")?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(MessageRow {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    role: row.get(2)?,
                    agent: row.get(3)?,
                    content: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .context("Failed to query messages")?;

        let mut messages = Vec::new();
        for row in rows {
            let r = row.context("Failed to read message row")?;
            messages.push(r.into_message()?);
        }
        Ok(messages)
    }

    pub fn list_artifacts(&self, id: &str) -> StoreResult<Vec<Artifact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, session_id, artifact_type, name, content, agent, created_at
                 FROM artifacts WHERE session_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_artifacts")?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query artifacts")?;

        let mut artifacts = Vec::new();
        for row in rows {
            let (id, session_id, artifact_type, name, content, agent, created_at) =
                row.context("Failed to read artifact row")?;
            artifacts.push(Artifact {
                id,
                session_id,
                artifact_type,
                name,
                content: serde_json::from_str(&content)
                    .context("Failed to parse artifact content JSON")?,
                agent,
                created_at,
            });
        }
        Ok(artifacts)
    }

    pub fn list_audit_events(&self, id: &str) -> StoreResult<Vec<AuditEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, session_id, actor, action, payload, decision, tenant, created_at
                 FROM audit_events WHERE session_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_audit_events")?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(AuditRow {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    actor: row.get(2)?,
                    action: row.get(3)?,
                    payload: row.get(4)?,
                    decision: row.get(5)?,
                    tenant: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .context("Failed to query audit events")?;

        let mut events = Vec::new();
        for row in rows {
            let r = row.context("Failed to read audit row")?;
            events.push(r.into_audit_event()?);
        }
        Ok(events)
    }

    // ── Workflow runs ─────────────────────────────────────────────────

    pub fn create_workflow_run(&self, workflow_name: &str, inputs: &Value) -> StoreResult<WorkflowRun> {
        let id = uuid::Uuid::new_v4().to_string();
        let inputs = serde_json::to_string(inputs).context("Failed to serialize workflow inputs")?;
        self.conn
            .execute(
                "INSERT INTO workflow_runs (id, workflow_name, status, inputs, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, workflow_name, WorkflowRunStatus::Running.as_str(), inputs, now()],
            )
            .context("Failed to insert workflow run")?;
        self.get_workflow_run(&id)?
            .context("Workflow run not found after insert")
            .map_err(Into::into)
    }

    pub fn update_workflow_run(
        &self,
        id: &str,
        status: WorkflowRunStatus,
        steps_log: &[Value],
        error: Option<&str>,
    ) -> StoreResult<WorkflowRun> {
        let steps_log = serde_json::to_string(steps_log).context("Failed to serialize steps log")?;
        let completed_at = match status {
            WorkflowRunStatus::Running => None,
            _ => Some(now()),
        };
        self.conn
            .execute(
                "UPDATE workflow_runs SET status = ?1, steps_log = ?2, error = ?3, completed_at = ?4
                 WHERE id = ?5",
                params![status.as_str(), steps_log, error, completed_at, id],
            )
            .context("Failed to update workflow run")?;
        self.get_workflow_run(id)?
            .context("Workflow run not found after update")
            .map_err(Into::into)
    }

    pub fn get_workflow_run(&self, id: &str) -> StoreResult<Option<WorkflowRun>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, workflow_name, status, inputs, steps_log, error, started_at, completed_at
                 FROM workflow_runs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(WorkflowRunRow {
                        id: row.get(0)?,
                        workflow_name: row.get(1)?,
                        status: row.get(2)?,
                        inputs: row.get(3)?,
                        steps_log: row.get(4)?,
                        error: row.get(5)?,
                        started_at: row.get(6)?,
                        completed_at: row.get(7)?,
                    })
                },
            )
            .optional()
            .context("Failed to query workflow run")?;
        match row {
            Some(r) => Ok(Some(r.into_workflow_run()?)),
            None => Ok(None),
        }
    }
}

// ── Internal helpers ──────────────────────────────────────────────────

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn load_session(conn: &Connection, id: &str) -> StoreResult<Option<Session>> {
    let sql = format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS);
    let row = conn
        .query_row(&sql, params![id], read_session_row)
        .optional()
        .context("Failed to query session")?;
    match row {
        Some(r) => Ok(Some(r.into_session()?)),
        None => Ok(None),
    }
}

fn require(conn: &Connection, id: &str) -> StoreResult<Session> {
    load_session(conn, id)?.ok_or_else(|| OrchestratorError::SessionNotFound { id: id.to_string() })
}

fn ensure_not_terminal(session: &Session) -> StoreResult<()> {
    if session.status.is_terminal() {
        return Err(OrchestratorError::SessionTerminal {
            id: session.id.clone(),
            status: session.status,
        });
    }
    Ok(())
}

fn ensure_transition(session: &Session, next: SessionStatus) -> StoreResult<()> {
    if !session.status.can_transition_to(next) {
        return Err(OrchestratorError::InvalidTransition {
            id: session.id.clone(),
            from: session.status,
            to: next,
        });
    }
    Ok(())
}

fn write_progress(conn: &Connection, session: &Session) -> StoreResult<()> {
    let plan = serde_json::to_string(&session.plan).context("Failed to serialize plan")?;
    let context = serde_json::to_string(&session.context).context("Failed to serialize context")?;
    let final_output = session
        .final_output
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to serialize final output")?;
    conn.execute(
        "UPDATE sessions SET status = ?1, plan = ?2, current_step_index = ?3, context = ?4,
             final_output = ?5, error = ?6, updated_at = ?7
         WHERE id = ?8",
        params![
            session.status.as_str(),
            plan,
            session.current_step_index as i64,
            context,
            final_output,
            session.error,
            now(),
            session.id
        ],
    )
    .context("Failed to update session")?;
    Ok(())
}

fn insert_message(conn: &Connection, session_id: &str, message: &NewMessage) -> StoreResult<Message> {
    let created_at = now();
    conn.execute(
        "INSERT INTO messages (session_id, role, agent, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            session_id,
            message.role.as_str(),
            message.agent,
            message.content,
            created_at
        ],
    )
    .context("Failed to insert message")?;
    Ok(Message {
        id: conn.last_insert_rowid(),
        session_id: session_id.to_string(),
        role: message.role,
        agent: message.agent.clone(),
        content: message.content.clone(),
        created_at,
    })
}

fn insert_artifact(
    conn: &Connection,
    session_id: &str,
    artifact: &NewArtifact,
) -> StoreResult<Artifact> {
    let created_at = now();
    let content =
        serde_json::to_string(&artifact.content).context("Failed to serialize artifact")?;
    conn.execute(
        "INSERT INTO artifacts (session_id, artifact_type, name, content, agent, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            session_id,
            artifact.artifact_type,
            artifact.name,
            content,
            artifact.agent,
            created_at
        ],
    )
    .context("Failed to insert artifact")?;
    Ok(Artifact {
        id: conn.last_insert_rowid(),
        session_id: session_id.to_string(),
        artifact_type: artifact.artifact_type.clone(),
        name: artifact.name.clone(),
        content: artifact.content.clone(),
        agent: artifact.agent.clone(),
        created_at,
    })
}

fn insert_audit_event(
    conn: &Connection,
    session_id: &str,
    event: &NewAuditEvent,
) -> StoreResult<AuditEvent> {
    let created_at = now();
    let payload =
        serde_json::to_string(&event.payload).context("Failed to serialize audit payload")?;
    conn.execute(
        "INSERT INTO audit_events (session_id, actor, action, payload, decision, tenant, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            session_id,
            event.actor,
            event.action,
            payload,
            event.decision.as_str(),
            TENANT,
            created_at
        ],
    )
    .context("Failed to insert audit event")?;
    Ok(AuditEvent {
        id: conn.last_insert_rowid(),
        session_id: session_id.to_string(),
        actor: event.actor.clone(),
        action: event.action.clone(),
        payload: event.payload.clone(),
        decision: event.decision,
        tenant: TENANT.to_string(),
        created_at,
    })
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for reading sessions before parsing the status
/// strings and JSON columns into typed values.
struct SessionRow {
    id: String,
    title: String,
    goal: String,
    domain: String,
    autonomy: String,
    status: String,
    plan: String,
    current_step_index: i64,
    context: String,
    approval: Option<String>,
    data_source_ids: String,
    final_output: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_session_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        title: row.get(1)?,
        goal: row.get(2)?,
        domain: row.get(3)?,
        autonomy: row.get(4)?,
        status: row.get(5)?,
        plan: row.get(6)?,
        current_step_index: row.get(7)?,
        context: row.get(8)?,
        approval: row.get(9)?,
        data_source_ids: row.get(10)?,
        final_output: row.get(11)?,
        error: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

impl SessionRow {
    fn into_session(self) -> anyhow::Result<Session> {
        let autonomy = AutonomyLevel::from_str(&self.autonomy)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse session autonomy")?;
        let status = SessionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse session status")?;
        let plan: Plan = serde_json::from_str(&self.plan).context("Failed to parse plan JSON")?;
        let context: Map<String, Value> =
            serde_json::from_str(&self.context).context("Failed to parse context JSON")?;
        let approval = self
            .approval
            .as_deref()
            .map(serde_json::from_str::<Approval>)
            .transpose()
            .context("Failed to parse approval JSON")?;
        let data_source_ids: Vec<String> = serde_json::from_str(&self.data_source_ids)
            .context("Failed to parse data source ids JSON")?;
        let final_output = self
            .final_output
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()
            .context("Failed to parse final output JSON")?;

        Ok(Session {
            id: self.id,
            title: self.title,
            goal: self.goal,
            domain: self.domain,
            autonomy,
            status,
            plan,
            current_step_index: usize::try_from(self.current_step_index).unwrap_or(0),
            context,
            approval,
            data_source_ids,
            final_output,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct MessageRow {
    id: i64,
    session_id: String,
    role: String,
    agent: Option<String>,
    content: String,
    created_at: String,
}

impl MessageRow {
    fn into_message(self) -> anyhow::Result<Message> {
        let role = MessageRole::from_str(&self.role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse message role")?;
        Ok(Message {
            id: self.id,
            session_id: self.session_id,
            role,
            agent: self.agent,
            content: self.content,
            created_at: self.created_at,
        })
    }
}

struct AuditRow {
    id: i64,
    session_id: String,
    actor: String,
    action: String,
    payload: String,
    decision: String,
    tenant: String,
    created_at: String,
}

impl AuditRow {
    fn into_audit_event(self) -> anyhow::Result<AuditEvent> {
        let decision = PolicyDecision::from_str(&self.decision)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse audit decision")?;
        let payload: Value =
            serde_json::from_str(&self.payload).context("Failed to parse audit payload JSON")?;
        Ok(AuditEvent {
            id: self.id,
            session_id: self.session_id,
            actor: self.actor,
            action: self.action,
            payload,
            decision,
            tenant: self.tenant,
            created_at: self.created_at,
        })
    }
}

struct WorkflowRunRow {
    id: String,
    workflow_name: String,
    status: String,
    inputs: String,
    steps_log: String,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl WorkflowRunRow {
    fn into_workflow_run(self) -> anyhow::Result<WorkflowRun> {
        let status = WorkflowRunStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse workflow run status")?;
        Ok(WorkflowRun {
            id: self.id,
            workflow_name: self.workflow_name,
            status,
            inputs: serde_json::from_str(&self.inputs)
                .context("Failed to parse workflow inputs JSON")?,
            steps_log: serde_json::from_str(&self.steps_log)
                .context("Failed to parse steps log JSON")?,
            error: self.error,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
