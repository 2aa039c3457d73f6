//! Typed error hierarchy for the session orchestrator.
//!
//! Two enums cover the two execution paths:
//! - `OrchestratorError`: session lifecycle, checkpoint and store failures
//! - `WorkflowError`: linear workflow definition and run failures
//!
//! Store internals work in `anyhow::Result` and surface here through the
//! `Store` variant, so callers can match on the lifecycle variants without
//! caring how persistence failed.

use std::time::Duration;

use thiserror::Error;
use vds_common::SessionStatus;

/// Errors from the session orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Raised while resolving a plan against the capability registry,
    /// before any step runs.
    #[error("No capability registered for step '{step_id}'")]
    UnknownCapability { step_id: String },

    #[error("Step '{step_id}' failed: {message}")]
    StepExecutionFailure { step_id: String, message: String },

    #[error("Checkpoint before '{step_id}' was rejected{}", .note.as_deref().map(|n| format!(": {}", n)).unwrap_or_default())]
    ApprovalRejected {
        step_id: String,
        note: Option<String>,
    },

    #[error("No approval for '{step_id}' after waiting {}s", .waited.as_secs_f64())]
    ApprovalTimeout { step_id: String, waited: Duration },

    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Session {id} is not awaiting approval (status: {status})")]
    NotAwaitingApproval { id: String, status: SessionStatus },

    #[error("Session {id} already has an approval pending")]
    ApprovalAlreadyRecorded { id: String },

    #[error("Session {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Session {id} already holds a result for step '{step_id}'")]
    ContextEntryExists { id: String, step_id: String },

    #[error("Session {id} is {status} and can no longer change")]
    SessionTerminal { id: String, status: SessionStatus },

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Store(err)
    }
}

impl OrchestratorError {
    /// Short machine-readable reason, used in audit payloads and events.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnknownCapability { .. } => "unknown_capability",
            Self::StepExecutionFailure { .. } => "step_execution_failure",
            Self::ApprovalRejected { .. } => "approval_rejected",
            Self::ApprovalTimeout { .. } => "approval_timeout",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::NotAwaitingApproval { .. } => "not_awaiting_approval",
            Self::ApprovalAlreadyRecorded { .. } => "approval_already_recorded",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ContextEntryExists { .. } => "context_entry_exists",
            Self::SessionTerminal { .. } => "session_terminal",
            Self::Store(_) => "store",
        }
    }
}

/// Errors from the linear workflow extension.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Failed to parse workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Workflow '{workflow}' has duplicate node id '{node_id}'")]
    DuplicateNode { workflow: String, node_id: String },

    #[error("Node '{node_id}' failed: {message}")]
    NodeFailed { node_id: String, message: String },

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_capability_carries_step_id() {
        let err = OrchestratorError::UnknownCapability {
            step_id: "model".into(),
        };
        match &err {
            OrchestratorError::UnknownCapability { step_id } => assert_eq!(step_id, "model"),
            _ => panic!("Expected UnknownCapability"),
        }
        assert!(err.to_string().contains("model"));
    }

    #[test]
    fn approval_rejected_renders_optional_note() {
        let with_note = OrchestratorError::ApprovalRejected {
            step_id: "act".into(),
            note: Some("numbers look off".into()),
        };
        assert_eq!(
            with_note.to_string(),
            "Checkpoint before 'act' was rejected: numbers look off"
        );

        let without = OrchestratorError::ApprovalRejected {
            step_id: "act".into(),
            note: None,
        };
        assert_eq!(without.to_string(), "Checkpoint before 'act' was rejected");
    }

    #[test]
    fn approval_timeout_reports_wait() {
        let err = OrchestratorError::ApprovalTimeout {
            step_id: "model".into(),
            waited: Duration::from_secs(600),
        };
        assert!(err.to_string().contains("600s"));
        assert_eq!(err.reason(), "approval_timeout");
    }

    #[test]
    fn anyhow_errors_become_store_errors() {
        let err: OrchestratorError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, OrchestratorError::Store(_)));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn not_awaiting_approval_names_status() {
        let err = OrchestratorError::NotAwaitingApproval {
            id: "s1".into(),
            status: SessionStatus::Executing,
        };
        assert!(err.to_string().contains("executing"));
    }

    #[test]
    fn workflow_error_converts_from_orchestrator_error() {
        let inner = OrchestratorError::UnknownCapability {
            step_id: "score".into(),
        };
        let wf: WorkflowError = inner.into();
        assert!(matches!(
            wf,
            WorkflowError::Orchestrator(OrchestratorError::UnknownCapability { .. })
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&OrchestratorError::SessionNotFound { id: "x".into() });
        assert_std_error(&WorkflowError::InvalidDefinition("x".into()));
    }
}
