//! Checkpoint gating.
//!
//! Whether a step is gated is a pure function of the session's autonomy level
//! and the step's position. Waiting at a gate re-reads the session record on
//! every check; an approval written through the same store also wakes the
//! waiter early, while approvals from another process are picked up on the
//! next poll.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use vds_common::{AutonomyLevel, SessionStatus, StepStatus};

use crate::config::{AutonomyConfig, CheckpointConfig, checkpoint_timeout};
use crate::errors::OrchestratorError;
use crate::store::{NewMessage, ProgressUpdate, SessionStore};
use crate::ws::{WsMessage, broadcast_message};

/// Decide whether the step at `index` must pause for approval.
///
/// - `assist`: every step except the first
/// - `semi_auto`: only steps whose id is in `gated_steps`
/// - `autonomous`: never
pub fn requires_checkpoint(
    autonomy: AutonomyLevel,
    index: usize,
    step_id: &str,
    gated_steps: &HashSet<String>,
) -> bool {
    match autonomy {
        AutonomyLevel::Assist => index > 0,
        AutonomyLevel::SemiAuto => gated_steps.contains(step_id),
        AutonomyLevel::Autonomous => false,
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatePolicy {
    gated_steps: HashSet<String>,
}

impl GatePolicy {
    pub fn new<I, S>(gated_steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            gated_steps: gated_steps.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &AutonomyConfig) -> Self {
        Self {
            gated_steps: config.gated_set(),
        }
    }

    pub fn requires_checkpoint(&self, autonomy: AutonomyLevel, index: usize, step_id: &str) -> bool {
        requires_checkpoint(autonomy, index, step_id, &self.gated_steps)
    }
}

/// Suspends a step until an approval arrives, is rejected, or time runs out.
#[derive(Clone)]
pub struct CheckpointGate {
    store: Arc<dyn SessionStore>,
    poll_interval: Duration,
    max_checks: u32,
    events: broadcast::Sender<String>,
}

impl CheckpointGate {
    pub fn new(
        store: Arc<dyn SessionStore>,
        config: &CheckpointConfig,
        events: broadcast::Sender<String>,
    ) -> Self {
        Self {
            store,
            poll_interval: config.poll_interval(),
            max_checks: config.max_checks,
            events,
        }
    }

    pub fn timeout(&self) -> Duration {
        checkpoint_timeout(self.poll_interval, self.max_checks)
    }

    /// Put the session at a checkpoint before step `index` and block until
    /// it is resolved. Returns `Ok` only on approval, after the session has
    /// been moved back to `executing`.
    #[instrument(skip(self, step_name))]
    pub async fn wait(
        &self,
        session_id: &str,
        index: usize,
        step_id: &str,
        step_name: &str,
    ) -> Result<(), OrchestratorError> {
        self.store
            .update_progress(
                session_id,
                ProgressUpdate::status(SessionStatus::Checkpoint).step(index, StepStatus::Checkpoint),
            )
            .await?;
        let message = self
            .store
            .append_message(
                session_id,
                NewMessage::system(format!(
                    "⏸ Checkpoint before **{}**. Please review the plan above and approve to continue.",
                    step_name
                )),
            )
            .await?;
        broadcast_message(&self.events, &WsMessage::MessagePosted { message });
        broadcast_message(
            &self.events,
            &WsMessage::CheckpointReached {
                session_id: session_id.to_string(),
                index,
                step_id: step_id.to_string(),
            },
        );
        info!(step = step_id, index, "waiting for approval");

        let signal = self.store.approval_signal();
        let waited = self.timeout();
        // `None` when the bound lies past what the clock can represent.
        let deadline = Instant::now().checked_add(waited);

        loop {
            // Register interest before checking so a write that lands between
            // the check and the select still wakes us.
            let notified = signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(approval) = self.store.take_approval(session_id).await? {
                if !approval.approved {
                    warn!(step = step_id, note = ?approval.note, "checkpoint rejected");
                    return Err(OrchestratorError::ApprovalRejected {
                        step_id: step_id.to_string(),
                        note: approval.note,
                    });
                }
                self.store
                    .update_progress(
                        session_id,
                        ProgressUpdate::status(SessionStatus::Executing)
                            .step(index, StepStatus::Executing),
                    )
                    .await?;
                info!(step = step_id, "checkpoint approved");
                return Ok(());
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                warn!(step = step_id, waited_ms = waited.as_millis() as u64, "checkpoint timed out");
                return Err(OrchestratorError::ApprovalTimeout {
                    step_id: step_id.to_string(),
                    waited,
                });
            }

            let next_check = [now.checked_add(self.poll_interval), deadline]
                .into_iter()
                .flatten()
                .min();
            let tick = async {
                match next_check {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = tick => {}
                _ = &mut notified => {}
            }
        }
    }
}
