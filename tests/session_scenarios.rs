//! End-to-end session scenarios against an in-memory store with scripted
//! capabilities.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use vds::capability::{Capability, CapabilityRegistry};
use vds::config::CheckpointConfig;
use vds::errors::OrchestratorError;
use vds::gate::GatePolicy;
use vds::plan::{build_plan, default_registry, default_step_ids};
use vds::store::{DbHandle, NewMessage, ProgressUpdate, SessionStore, StepCommit};
use vds::supervisor::{Orchestrator, SessionRequest, SupervisorSettings};
use vds_common::{Approval, AutonomyLevel, PolicyDecision, SessionStatus, StepStatus};

/// Returns a fixed result and counts invocations.
struct Scripted {
    calls: AtomicUsize,
    result: Value,
    fail_with: Option<&'static str>,
}

impl Scripted {
    fn ok(result: Value) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            result,
            fail_with: None,
        })
    }

    fn failing(message: &'static str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            result: Value::Null,
            fail_with: Some(message),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for Scripted {
    async fn run(
        &self,
        _question: &str,
        _domain: &str,
        _context: &Map<String, Value>,
        _data_source_ids: &[String],
    ) -> Result<Map<String, Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail_with {
            anyhow::bail!(message);
        }
        Ok(self.result.as_object().cloned().unwrap_or_default())
    }
}

struct Harness {
    store: DbHandle,
    orchestrator: Orchestrator,
    caps: Vec<Arc<Scripted>>,
}

impl Harness {
    fn new(max_checks: u32) -> Self {
        Self::with_caps(max_checks, |_, id| Scripted::ok(json!({ id: {"ok": true} })))
    }

    fn with_caps(max_checks: u32, make: impl Fn(usize, &str) -> Arc<Scripted>) -> Self {
        let store = DbHandle::in_memory().unwrap();
        let caps: Vec<Arc<Scripted>> = default_step_ids()
            .iter()
            .enumerate()
            .map(|(i, id)| make(i, id))
            .collect();
        let mut registry = CapabilityRegistry::new();
        for (id, cap) in default_step_ids().into_iter().zip(&caps) {
            registry.register(id, cap.clone());
        }
        let settings = SupervisorSettings {
            checkpoint: CheckpointConfig {
                poll_interval_ms: 10,
                max_checks,
            },
            policy: GatePolicy::new(["model"]),
            ..SupervisorSettings::default()
        };
        let orchestrator = Orchestrator::new(Arc::new(store.clone()), registry, settings).unwrap();
        Self {
            store,
            orchestrator,
            caps,
        }
    }

    async fn session(&self, autonomy: AutonomyLevel) -> String {
        self.orchestrator
            .create_session(SessionRequest {
                question: "Why did churn rise last quarter?".into(),
                domain: Some("telecom".into()),
                autonomy: Some(autonomy),
                data_source_ids: vec!["warehouse".into()],
            })
            .await
            .unwrap()
            .id
    }

    /// Poll until the session waits at a checkpoint before `index`.
    async fn wait_for_checkpoint(&self, id: &str, index: usize) {
        for _ in 0..1000 {
            let s = self.store.require_session(id).await.unwrap();
            if s.status == SessionStatus::Checkpoint
                && s.plan.steps[index].status == StepStatus::Checkpoint
            {
                return;
            }
            assert!(!s.status.is_terminal(), "session ended early: {:?}", s.error);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never reached checkpoint before step {}", index);
    }

    async fn step_statuses(&self, id: &str) -> Vec<StepStatus> {
        self.store
            .require_session(id)
            .await
            .unwrap()
            .plan
            .steps
            .iter()
            .map(|s| s.status)
            .collect()
    }

    async fn messages_starting_with(&self, id: &str, prefix: &str) -> usize {
        self.store
            .list_messages(id)
            .await
            .unwrap()
            .iter()
            .filter(|m| m.content.starts_with(prefix))
            .count()
    }
}

#[tokio::test]
async fn autonomous_session_never_checkpoints() {
    let h = Harness::new(3);
    let id = h.session(AutonomyLevel::Autonomous).await;

    let mut events = h.orchestrator.subscribe();
    let done = h.orchestrator.run_to_completion(&id).await.unwrap();

    assert_eq!(done.status, SessionStatus::Done);
    assert_eq!(h.messages_starting_with(&id, "⏸").await, 0);
    while let Ok(raw) = events.try_recv() {
        assert!(!raw.contains("CheckpointReached"), "unexpected event: {}", raw);
        assert!(!raw.contains("\"status\":\"checkpoint\""), "unexpected event: {}", raw);
    }
    assert!(h.caps.iter().all(|c| c.calls() == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn assist_gates_every_step_after_the_first() {
    let h = Harness::new(2000);
    let id = h.session(AutonomyLevel::Assist).await;
    let handle = h.orchestrator.spawn(&id);

    for index in 1..8 {
        h.wait_for_checkpoint(&id, index).await;
        assert_eq!(h.caps[index - 1].calls(), 1);
        assert_eq!(h.caps[index].calls(), 0, "step {} ran before approval", index);
        h.orchestrator
            .approve(&id, Approval::approve())
            .await
            .unwrap();
    }

    let done = handle.await.unwrap().unwrap();
    assert_eq!(done.status, SessionStatus::Done);
    assert_eq!(h.messages_starting_with(&id, "⏸").await, 7);
    assert!(h.caps.iter().all(|c| c.calls() == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn semi_auto_single_approval_reaches_done() {
    let h = Harness::new(2000);
    let id = h.session(AutonomyLevel::SemiAuto).await;
    let handle = h.orchestrator.spawn(&id);

    h.wait_for_checkpoint(&id, 4).await;
    assert_eq!(h.caps[4].calls(), 0);
    h.orchestrator
        .approve(&id, Approval::approve())
        .await
        .unwrap();

    let done = handle.await.unwrap().unwrap();
    assert_eq!(done.status, SessionStatus::Done);
    assert!(h.step_statuses(&id).await.iter().all(|s| *s == StepStatus::Done));
    assert_eq!(h.messages_starting_with(&id, "⏸").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn semi_auto_rejection_fails_without_running_the_gated_step() {
    let h = Harness::new(2000);
    let id = h.session(AutonomyLevel::SemiAuto).await;
    let handle = h.orchestrator.spawn(&id);

    h.wait_for_checkpoint(&id, 4).await;
    h.orchestrator
        .approve(&id, Approval::reject("model scope is wrong"))
        .await
        .unwrap();

    match handle.await.unwrap() {
        Err(OrchestratorError::ApprovalRejected { step_id, note }) => {
            assert_eq!(step_id, "model");
            assert_eq!(note.as_deref(), Some("model scope is wrong"));
        }
        other => panic!("Expected ApprovalRejected, got {:?}", other),
    }

    assert_eq!(h.caps[4].calls(), 0);
    let session = h.store.require_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    use StepStatus::*;
    assert_eq!(
        h.step_statuses(&id).await,
        vec![Done, Done, Done, Done, Failed, Pending, Pending, Pending]
    );
    assert_eq!(h.messages_starting_with(&id, "❌").await, 1);
}

#[tokio::test]
async fn unanswered_checkpoint_times_out() {
    let h = Harness::new(3);
    let id = h.session(AutonomyLevel::SemiAuto).await;

    let err = h.orchestrator.run_to_completion(&id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ApprovalTimeout { .. }));
    assert_eq!(err.reason(), "approval_timeout");

    let session = h.store.require_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.plan.steps[4].status, StepStatus::Failed);
    assert_eq!(h.caps[4].calls(), 0);

    let events = h.store.list_audit_events(&id).await.unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.action, "session.failed");
    assert_eq!(last.decision, PolicyDecision::Fail);
    assert_eq!(last.payload["reason"], "approval_timeout");
    assert_eq!(last.payload["step"], "model");
    assert_eq!(h.messages_starting_with(&id, "❌").await, 1);
}

#[tokio::test]
async fn capability_failure_at_step_two_aborts_pipeline() {
    let h = Harness::with_caps(3, |i, id| {
        if i == 2 {
            Scripted::failing("profiling job crashed")
        } else {
            Scripted::ok(json!({ id: {"ok": true} }))
        }
    });
    let id = h.session(AutonomyLevel::Autonomous).await;

    let err = h.orchestrator.run_to_completion(&id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StepExecutionFailure { .. }));

    let session = h.store.require_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(!session.context.contains_key("quality"));
    assert!(session.context.contains_key("map"));
    use StepStatus::*;
    assert_eq!(
        h.step_statuses(&id).await,
        vec![Done, Done, Failed, Pending, Pending, Pending, Pending, Pending]
    );
    let artifacts = h.store.list_artifacts(&id).await.unwrap();
    assert!(artifacts.iter().all(|a| a.agent != "quality"));
    assert!(h.caps[3..].iter().all(|c| c.calls() == 0));

    let failures: Vec<_> = h
        .store
        .list_messages(&id)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.content.starts_with('❌'))
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].content,
        "❌ Data Quality failed: profiling job crashed"
    );
}

#[tokio::test]
async fn artifacts_match_non_empty_structured_results() {
    let h = Harness::with_caps(3, |_, id| match id {
        "eda" => Scripted::ok(json!({
            "hypotheses": {"h1": "price"},
            "correlations": {"tenure": -0.4},
            "segments": {"north": 0.12},
            "empty": {},
            "notes": "scalar values are not artifacts",
        })),
        "narrate" => Scripted::ok(json!({
            "executive_summary": "Churn rose in the north after the price change.",
            "findings": ["north region +4pts"],
            "recommendations": ["retention offer"],
        })),
        "govern" => Scripted::ok(json!({"status": "PASS", "checks": {"pii": "clean"}})),
        other => Scripted::ok(json!({ other: {"ok": true} })),
    });
    let id = h.session(AutonomyLevel::Autonomous).await;
    let done = h.orchestrator.run_to_completion(&id).await.unwrap();

    let artifacts = h.store.list_artifacts(&id).await.unwrap();
    let eda: Vec<_> = artifacts.iter().filter(|a| a.agent == "eda").collect();
    assert_eq!(eda.len(), 3);
    assert!(artifacts.iter().all(|a| a.agent != "narrate"));

    let output = done.final_output.unwrap();
    assert_eq!(
        output["executive_summary"],
        "Churn rose in the north after the price change."
    );
    assert_eq!(output["recommendations"], json!(["retention offer"]));
    assert_eq!(output["governance_status"], "PASS");
    let last = h.store.list_messages(&id).await.unwrap().pop().unwrap();
    assert_eq!(last.content, "Churn rose in the north after the price change.");
}

#[tokio::test]
async fn final_output_is_stable_across_reads() {
    let h = Harness::new(3);
    let id = h.session(AutonomyLevel::Autonomous).await;
    h.orchestrator.run_to_completion(&id).await.unwrap();

    let first = h.store.require_session(&id).await.unwrap().final_output;
    let second = h.store.require_session(&id).await.unwrap().final_output;
    assert!(first.is_some());
    assert_eq!(first, second);

    // Driving a finished session again changes nothing.
    let again = h.orchestrator.run_to_completion(&id).await.unwrap();
    assert_eq!(again.final_output, first);
    assert!(h.caps.iter().all(|c| c.calls() == 1));
}

#[tokio::test]
async fn resumed_session_skips_committed_steps() {
    let h = Harness::new(3);
    let id = h.session(AutonomyLevel::Autonomous).await;

    // State left behind by a process that stopped after step 1 committed and
    // while step 2 was running.
    h.store
        .update_progress(
            &id,
            ProgressUpdate {
                status: Some(SessionStatus::Planned),
                plan: Some(build_plan(&default_registry())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    for (index, step_id) in ["frame", "map"].into_iter().enumerate() {
        h.store
            .commit_step(
                &id,
                StepCommit {
                    index,
                    step_id: step_id.to_string(),
                    result: Map::new(),
                    artifacts: vec![],
                    message: NewMessage::assistant(step_id, "done earlier"),
                    audit: vds::audit::Recorder::default().step_completed(step_id, &Map::new()),
                },
            )
            .await
            .unwrap();
    }
    h.store
        .update_progress(
            &id,
            ProgressUpdate::status(SessionStatus::Executing).step(2, StepStatus::Executing),
        )
        .await
        .unwrap();

    let resumed = h.orchestrator.resume_unfinished().await.unwrap();
    assert_eq!(resumed, vec![id.clone()]);

    let mut done = None;
    for _ in 0..1000 {
        let s = h.store.require_session(&id).await.unwrap();
        if s.status.is_terminal() {
            done = Some(s);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let done = done.expect("resumed session should finish");
    assert_eq!(done.status, SessionStatus::Done);
    assert_eq!(h.caps[0].calls(), 0);
    assert_eq!(h.caps[1].calls(), 0);
    assert!(h.caps[2..].iter().all(|c| c.calls() == 1));
}
