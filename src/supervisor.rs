//! Session lifecycle driver.
//!
//! `Supervisor::run` takes a session from whatever state it was persisted in
//! to a terminal state: it builds the plan for new sessions, runs the
//! remaining steps in order through the `StepExecutor`, and finalizes.
//! Because every decision is made from a fresh store read, the same entry
//! point serves fresh sessions and sessions resumed after a restart.
//!
//! `Orchestrator` is the cloneable handle the server and CLI use: it creates
//! sessions, spawns one supervisor task per session, records approvals, and
//! exposes the live event channel.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};
use vds_common::{Approval, AutonomyLevel, SessionStatus};

use crate::audit::{AuditExporter, AuditTrail, Recorder};
use crate::capability::CapabilityRegistry;
use crate::config::{AuditConfig, CheckpointConfig, VdsConfig};
use crate::errors::OrchestratorError;
use crate::executor::StepExecutor;
use crate::gate::{CheckpointGate, GatePolicy};
use crate::plan::{ExecutablePlan, StepDef, build_plan, closing_message, default_registry, project_final_output};
use crate::store::{Completion, NewMessage, NewSession, ProgressUpdate, Session, SessionStore};
use crate::ws::{WsMessage, broadcast_message};

/// Capacity of the live event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the supervisor needs from configuration.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub steps: Vec<StepDef>,
    pub checkpoint: CheckpointConfig,
    pub policy: GatePolicy,
    pub audit: AuditConfig,
    pub default_autonomy: AutonomyLevel,
}

impl SupervisorSettings {
    pub fn from_config(config: &VdsConfig) -> Self {
        Self {
            steps: default_registry(),
            checkpoint: config.checkpoint.clone(),
            policy: GatePolicy::from_config(&config.autonomy),
            audit: config.audit.clone(),
            default_autonomy: config.autonomy.default_level,
        }
    }

    pub fn with_steps(mut self, steps: Vec<StepDef>) -> Self {
        self.steps = steps;
        self
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&VdsConfig::default())
    }
}

pub struct Supervisor {
    store: Arc<dyn SessionStore>,
    registry: CapabilityRegistry,
    steps: Vec<StepDef>,
    executor: StepExecutor,
    recorder: Recorder,
    exporter: Option<AuditExporter>,
    events: broadcast::Sender<String>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: CapabilityRegistry,
        settings: SupervisorSettings,
        events: broadcast::Sender<String>,
    ) -> Self {
        let recorder = Recorder::from_config(&settings.audit);
        let gate = CheckpointGate::new(store.clone(), &settings.checkpoint, events.clone());
        let executor = StepExecutor::new(
            store.clone(),
            gate,
            settings.policy,
            recorder.clone(),
            events.clone(),
        );
        Self {
            store,
            registry,
            steps: settings.steps,
            executor,
            recorder,
            exporter: settings.audit.export_dir.as_deref().map(AuditExporter::new),
            events,
        }
    }

    /// Fails with `UnknownCapability` if any registry step has no capability.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        ExecutablePlan::resolve(&build_plan(&self.steps), &self.registry).map(|_| ())
    }

    /// Drive the session to a terminal state.
    ///
    /// Returns the final session when it completes (or was already
    /// terminal). When a step aborts the session, the failure has been
    /// recorded and the aborting error is returned.
    pub async fn run(&self, session_id: &str) -> Result<Session, OrchestratorError> {
        let session = self.store.require_session(session_id).await?;
        if session.status.is_terminal() {
            info!(session_id, status = %session.status, "session already terminal");
            return Ok(session);
        }

        let outcome = self.drive(session).await;
        if let Err(err) = &outcome {
            if !matches!(err, OrchestratorError::Store(_) | OrchestratorError::SessionNotFound { .. }) {
                self.export_trail(session_id).await;
            }
        }
        outcome
    }

    async fn drive(&self, mut session: Session) -> Result<Session, OrchestratorError> {
        let id = session.id.clone();

        if session.status == SessionStatus::Created {
            let plan = build_plan(&self.steps);
            info!(session_id = %id, steps = plan.len(), "plan built");
            session = self
                .store
                .update_progress(
                    &id,
                    ProgressUpdate {
                        status: Some(SessionStatus::Planned),
                        plan: Some(plan),
                        ..Default::default()
                    },
                )
                .await?;
            self.status_changed(&id, SessionStatus::Planned);
        }

        let executable = match ExecutablePlan::resolve(&session.plan, &self.registry) {
            Ok(plan) => plan,
            Err(err) => {
                self.executor.record_failure(&id, None, &err).await;
                return Err(err);
            }
        };

        if session.status != SessionStatus::Finalizing {
            let start = session
                .plan
                .first_incomplete()
                .unwrap_or(executable.len());
            if start > 0 {
                info!(session_id = %id, start, "continuing from first incomplete step");
            }
            for step in &executable.steps()[start..] {
                self.executor.execute(&id, session.autonomy, step).await?;
            }
            self.store
                .update_progress(&id, ProgressUpdate::status(SessionStatus::Finalizing))
                .await?;
            self.status_changed(&id, SessionStatus::Finalizing);
        }

        match self.finalize(&id).await {
            Ok(done) => {
                self.export_trail(&id).await;
                Ok(done)
            }
            Err(err) => {
                self.executor.record_failure(&id, None, &err).await;
                Err(err)
            }
        }
    }

    async fn finalize(&self, id: &str) -> Result<Session, OrchestratorError> {
        let session = self.store.require_session(id).await?;
        let final_output = project_final_output(&session.plan, &session.context);
        let completion = Completion {
            message: NewMessage::assistant("narrate", closing_message(&final_output)),
            audit: self.recorder.session_completed(&final_output),
            final_output: final_output.clone(),
        };
        let done = self.store.complete_session(id, completion).await?;
        info!(session_id = id, "session complete");
        broadcast_message(
            &self.events,
            &WsMessage::SessionCompleted {
                session_id: id.to_string(),
                final_output,
            },
        );
        Ok(done)
    }

    fn status_changed(&self, id: &str, status: SessionStatus) {
        broadcast_message(
            &self.events,
            &WsMessage::SessionStatusChanged {
                session_id: id.to_string(),
                status,
            },
        );
    }

    async fn export_trail(&self, id: &str) {
        let Some(exporter) = &self.exporter else {
            return;
        };
        match self.build_trail(id).await {
            Ok(trail) => match exporter.write(&trail) {
                Ok(path) => info!(session_id = id, path = %path.display(), "audit trail exported"),
                Err(e) => warn!(session_id = id, error = %e, "failed to write audit trail"),
            },
            Err(e) => warn!(session_id = id, error = %e, "failed to assemble audit trail"),
        }
    }

    async fn build_trail(&self, id: &str) -> Result<AuditTrail, OrchestratorError> {
        let session = self.store.require_session(id).await?;
        let artifacts = self.store.list_artifacts(id).await?;
        let events = self.store.list_audit_events(id).await?;
        Ok(AuditTrail::new(&session, &artifacts, events))
    }
}

/// Request to open a new session. Unset fields take configured defaults.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub question: String,
    pub domain: Option<String>,
    pub autonomy: Option<AutonomyLevel>,
    pub data_source_ids: Vec<String>,
}

/// Cloneable entry point shared by the HTTP server and the CLI.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    supervisor: Arc<Supervisor>,
    default_autonomy: AutonomyLevel,
    events: broadcast::Sender<String>,
}

impl Orchestrator {
    /// Build the orchestrator, failing with `UnknownCapability` when the
    /// registry does not cover every step.
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: CapabilityRegistry,
        settings: SupervisorSettings,
    ) -> Result<Self, OrchestratorError> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let default_autonomy = settings.default_autonomy;
        let supervisor = Supervisor::new(store.clone(), registry, settings, events.clone());
        supervisor.validate()?;
        Ok(Self {
            store,
            supervisor: Arc::new(supervisor),
            default_autonomy,
            events,
        })
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &broadcast::Sender<String> {
        &self.events
    }

    /// Persist a new session in `created` without running it.
    pub async fn create_session(&self, request: SessionRequest) -> Result<Session, OrchestratorError> {
        let session = self
            .store
            .create_session(NewSession {
                question: request.question,
                domain: request.domain.unwrap_or_else(|| "generic".to_string()),
                autonomy: request.autonomy.unwrap_or(self.default_autonomy),
                data_source_ids: request.data_source_ids,
            })
            .await?;
        info!(session_id = %session.id, autonomy = %session.autonomy, "session created");
        broadcast_message(
            &self.events,
            &WsMessage::SessionCreated {
                session_id: session.id.clone(),
                title: session.title.clone(),
                autonomy: session.autonomy,
            },
        );
        Ok(session)
    }

    /// Create a session and start driving it in the background.
    pub async fn submit(&self, request: SessionRequest) -> Result<Session, OrchestratorError> {
        let session = self.create_session(request).await?;
        self.spawn(&session.id);
        Ok(session)
    }

    /// Start a supervisor task for `session_id`.
    pub fn spawn(&self, session_id: &str) -> JoinHandle<Result<Session, OrchestratorError>> {
        let supervisor = self.supervisor.clone();
        let id = session_id.to_string();
        let span = info_span!("session", session_id = %id);
        tokio::spawn(
            async move {
                let result = supervisor.run(&id).await;
                if let Err(e) = &result {
                    match e {
                        OrchestratorError::Store(_) => error!(error = %e, "supervisor stopped"),
                        _ => info!(reason = e.reason(), "session ended in failure"),
                    }
                }
                result
            }
            .instrument(span),
        )
    }

    /// Drive a session on the current task; used by the foreground CLI.
    pub async fn run_to_completion(&self, session_id: &str) -> Result<Session, OrchestratorError> {
        self.supervisor
            .run(session_id)
            .instrument(info_span!("session", session_id))
            .await
    }

    /// Record a human decision for a session waiting at a checkpoint.
    pub async fn approve(&self, session_id: &str, approval: Approval) -> Result<Session, OrchestratorError> {
        let approved = approval.approved;
        let session = self.store.record_approval(session_id, approval).await?;
        info!(session_id, approved, "approval recorded");
        Ok(session)
    }

    /// Spawn supervisors for every non-terminal session. Returns their ids.
    pub async fn resume_unfinished(&self) -> Result<Vec<String>, OrchestratorError> {
        let unfinished: Vec<String> = self
            .store
            .list_sessions(None)
            .await?
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.id)
            .collect();
        for id in &unfinished {
            info!(session_id = %id, "resuming session");
            self.spawn(id);
        }
        Ok(unfinished)
    }
}
