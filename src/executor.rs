//! Drives a single plan step: progress, optional checkpoint, capability call,
//! and the all-or-nothing commit of its outputs.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};
use vds_common::{AutonomyLevel, SessionStatus, StepStatus};

use crate::audit::Recorder;
use crate::errors::OrchestratorError;
use crate::gate::{CheckpointGate, GatePolicy};
use crate::plan::ResolvedStep;
use crate::store::{FailureRecord, NewMessage, ProgressUpdate, SessionStore, StepCommit};
use crate::ws::{WsMessage, broadcast_message};

#[derive(Clone)]
pub struct StepExecutor {
    store: Arc<dyn SessionStore>,
    gate: CheckpointGate,
    policy: GatePolicy,
    recorder: Recorder,
    events: broadcast::Sender<String>,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn SessionStore>,
        gate: CheckpointGate,
        policy: GatePolicy,
        recorder: Recorder,
        events: broadcast::Sender<String>,
    ) -> Self {
        Self {
            store,
            gate,
            policy,
            recorder,
            events,
        }
    }

    /// Run one step. Any error aborts the session: the failure is recorded
    /// (session and step `failed`, one message, one audit event) before the
    /// error is returned.
    #[instrument(skip(self, step), fields(step = %step.id, index = step.index))]
    pub async fn execute(
        &self,
        session_id: &str,
        autonomy: AutonomyLevel,
        step: &ResolvedStep,
    ) -> Result<(), OrchestratorError> {
        match self.try_execute(session_id, autonomy, step).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.record_failure(session_id, Some((step.index, &step.id, &step.name)), &err)
                    .await;
                Err(err)
            }
        }
    }

    async fn try_execute(
        &self,
        session_id: &str,
        autonomy: AutonomyLevel,
        step: &ResolvedStep,
    ) -> Result<(), OrchestratorError> {
        self.store
            .update_progress(
                session_id,
                ProgressUpdate::status(SessionStatus::Executing)
                    .step(step.index, StepStatus::Executing)
                    .index(step.index),
            )
            .await?;
        let message = self
            .store
            .append_message(
                session_id,
                NewMessage::system(format!("▶ Starting: **{}**", step.name)),
            )
            .await?;
        broadcast_message(&self.events, &WsMessage::MessagePosted { message });
        broadcast_message(
            &self.events,
            &WsMessage::StepStarted {
                session_id: session_id.to_string(),
                index: step.index,
                step_id: step.id.clone(),
            },
        );

        if self
            .policy
            .requires_checkpoint(autonomy, step.index, &step.id)
        {
            self.gate
                .wait(session_id, step.index, &step.id, &step.name)
                .await?;
        }

        // Fresh read: context includes every step committed so far.
        let session = self.store.require_session(session_id).await?;
        info!("invoking capability");
        let result = step
            .capability
            .run(
                &session.goal,
                &session.domain,
                &session.context,
                &session.data_source_ids,
            )
            .await
            .map_err(|e| OrchestratorError::StepExecutionFailure {
                step_id: step.id.clone(),
                message: format!("{:#}", e),
            })?;

        let artifacts = self.recorder.artifacts_for(&step.id, &step.name, &result);
        let artifact_count = artifacts.len();
        let audit = self.recorder.step_completed(&step.id, &result);
        self.store
            .commit_step(
                session_id,
                StepCommit {
                    index: step.index,
                    step_id: step.id.clone(),
                    result,
                    artifacts,
                    message: NewMessage::assistant(
                        step.id.clone(),
                        format!("✅ {} complete.", step.name),
                    ),
                    audit,
                },
            )
            .await?;

        info!(artifacts = artifact_count, "step complete");
        broadcast_message(
            &self.events,
            &WsMessage::StepCompleted {
                session_id: session_id.to_string(),
                index: step.index,
                step_id: step.id.clone(),
                artifacts: artifact_count,
            },
        );
        Ok(())
    }

    /// Move the session to `failed` with a single explanatory message. A
    /// session that is already terminal is left untouched.
    pub async fn record_failure(
        &self,
        session_id: &str,
        step: Option<(usize, &str, &str)>,
        err: &OrchestratorError,
    ) {
        let detail = match err {
            OrchestratorError::StepExecutionFailure { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let content = match step {
            Some((_, _, name)) => format!("❌ {} failed: {}", name, detail),
            None => format!("❌ Session failed: {}", detail),
        };
        let step_id = step.map(|(_, id, _)| id);
        warn!(session_id, step = ?step_id, reason = err.reason(), error = %err, "session aborted");

        let failure = FailureRecord {
            step_index: step.map(|(index, _, _)| index),
            reason: err.to_string(),
            message: NewMessage::system(content),
            audit: self.recorder.session_failed(step_id, err.reason(), &detail),
        };
        match self.store.fail_session(session_id, failure).await {
            Ok(_) => {
                broadcast_message(
                    &self.events,
                    &WsMessage::SessionFailed {
                        session_id: session_id.to_string(),
                        step_id: step_id.map(str::to_string),
                        reason: err.reason().to_string(),
                        error: err.to_string(),
                    },
                );
            }
            Err(OrchestratorError::SessionTerminal { status, .. }) => {
                warn!(session_id, %status, "session already terminal; failure not recorded");
            }
            Err(e) => {
                error!(session_id, error = %e, "failed to record session failure");
            }
        }
    }
}
