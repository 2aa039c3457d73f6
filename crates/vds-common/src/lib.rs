//! Shared domain types for the VDS session orchestrator.
//!
//! Everything here is plain data: status enums with their string forms, the
//! persisted plan shape, and the approval payload. Storage, execution and the
//! HTTP surface live in the `vds-orchestrator` crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Session status ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Planned,
    Executing,
    Checkpoint,
    Finalizing,
    Done,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Planned => "planned",
            Self::Executing => "executing",
            Self::Checkpoint => "checkpoint",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// `done` and `failed` admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether the lifecycle state machine allows moving from `self` to `next`.
    ///
    /// Re-entering the current non-terminal state is allowed so that a resumed
    /// session can re-persist its status without special casing.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }
        match (self, next) {
            (_, Failed) => true,
            (Created, Planned) => true,
            (Planned, Executing) => true,
            (Executing, Checkpoint) => true,
            (Checkpoint, Executing) => true,
            (Executing, Finalizing) => true,
            // A plan with no steps goes straight to finalization.
            (Planned, Finalizing) => true,
            (Finalizing, Done) => true,
            _ => false,
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "planned" => Ok(Self::Planned),
            "executing" => Ok(Self::Executing),
            "checkpoint" => Ok(Self::Checkpoint),
            "finalizing" => Ok(Self::Finalizing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Step status ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Executing,
    Checkpoint,
    Done,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Checkpoint => "checkpoint",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "executing" => Ok(Self::Executing),
            "checkpoint" => Ok(Self::Checkpoint),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Autonomy ──────────────────────────────────────────────────────────

/// How many checkpoints a session inserts, from most to least supervised.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    /// Checkpoint before every step except the first.
    #[default]
    Assist,
    /// Checkpoint only before designated high-impact steps.
    SemiAuto,
    /// Never checkpoint.
    Autonomous,
}

impl AutonomyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assist => "assist",
            Self::SemiAuto => "semi_auto",
            Self::Autonomous => "autonomous",
        }
    }
}

impl FromStr for AutonomyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assist" => Ok(Self::Assist),
            "semi_auto" | "semi-auto" => Ok(Self::SemiAuto),
            "autonomous" => Ok(Self::Autonomous),
            _ => Err(format!("Invalid autonomy level: {}", s)),
        }
    }
}

impl fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Messages and audit ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

/// Policy decision tag carried by every audit event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyDecision {
    Pass,
    Fail,
}

impl PolicyDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

impl FromStr for PolicyDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(Self::Pass),
            "FAIL" => Ok(Self::Fail),
            _ => Err(format!("Invalid policy decision: {}", s)),
        }
    }
}

// ── Plan ──────────────────────────────────────────────────────────────

/// One entry of a persisted plan: `{index, id, name, status}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanStep {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub status: StepStatus,
}

/// Ordered step list built once per session. Steps are never reordered,
/// only their status changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PlanStep> {
        self.steps.get(index)
    }

    /// Set the status of the step at `index`. Returns false if out of range.
    pub fn set_status(&mut self, index: usize, status: StepStatus) -> bool {
        match self.steps.get_mut(index) {
            Some(step) => {
                step.status = status;
                true
            }
            None => false,
        }
    }

    /// Index of the first step that has not completed, if any.
    pub fn first_incomplete(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status != StepStatus::Done)
    }

    pub fn count_with_status(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

// ── Approval ──────────────────────────────────────────────────────────

/// Payload written by an external actor while a session sits at a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Approval {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Approval {
    pub fn approve() -> Self {
        Self {
            approved: true,
            note: None,
        }
    }

    pub fn reject(note: impl Into<String>) -> Self {
        Self {
            approved: false,
            note: Some(note.into()),
        }
    }
}
