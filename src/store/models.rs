use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use vds_common::{
    Approval, AutonomyLevel, MessageRole, Plan, PolicyDecision, SessionStatus, StepStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub title: String,
    /// The question the session answers. Passed to every capability.
    pub goal: String,
    pub domain: String,
    pub autonomy: AutonomyLevel,
    pub status: SessionStatus,
    pub plan: Plan,
    pub current_step_index: usize,
    /// Step id → that step's result. Entries are never overwritten.
    pub context: Map<String, Value>,
    /// Transient approval written by an external actor at a checkpoint.
    pub approval: Option<Approval>,
    pub data_source_ids: Vec<String>,
    pub final_output: Option<Value>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Session {
    pub fn step_name(&self, index: usize) -> Option<&str> {
        self.plan.get(index).map(|s| s.name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSession {
    pub question: String,
    pub domain: String,
    pub autonomy: AutonomyLevel,
    #[serde(default)]
    pub data_source_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub role: MessageRole,
    /// Step id (or `supervisor`) that produced the message, if any.
    pub agent: Option<String>,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub agent: Option<String>,
    pub content: String,
}

impl NewMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            agent: Some("supervisor".to_string()),
            content: content.into(),
        }
    }

    pub fn assistant(agent: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            agent: Some(agent.into()),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            agent: None,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: i64,
    pub session_id: String,
    pub artifact_type: String,
    pub name: String,
    pub content: Value,
    pub agent: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewArtifact {
    pub artifact_type: String,
    pub name: String,
    pub content: Value,
    pub agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: i64,
    pub session_id: String,
    pub actor: String,
    pub action: String,
    pub payload: Value,
    pub decision: PolicyDecision,
    pub tenant: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEvent {
    pub actor: String,
    pub action: String,
    pub payload: Value,
    pub decision: PolicyDecision,
}

/// Partial update of a session's lifecycle fields, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub status: Option<SessionStatus>,
    /// Lowered values are ignored; the stored index only moves forward.
    pub current_step_index: Option<usize>,
    pub step_status: Option<(usize, StepStatus)>,
    pub plan: Option<Plan>,
}

impl ProgressUpdate {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn step(mut self, index: usize, status: StepStatus) -> Self {
        self.step_status = Some((index, status));
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.current_step_index = Some(index);
        self
    }
}

/// Everything a successful step writes, committed in one transaction.
#[derive(Debug, Clone)]
pub struct StepCommit {
    pub index: usize,
    pub step_id: String,
    pub result: Map<String, Value>,
    pub artifacts: Vec<NewArtifact>,
    pub message: NewMessage,
    pub audit: NewAuditEvent,
}

/// Terminal failure: one message, the failed step (if any) and an audit event.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub step_index: Option<usize>,
    pub reason: String,
    pub message: NewMessage,
    pub audit: NewAuditEvent,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub final_output: Value,
    pub message: NewMessage,
    pub audit: NewAuditEvent,
}

// ── Workflow runs ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Running,
    Succeeded,
    Failed,
}

impl WorkflowRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for WorkflowRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid workflow run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_name: String,
    pub status: WorkflowRunStatus,
    pub inputs: Value,
    pub steps_log: Vec<Value>,
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}
