//! Foreground session driver (`vds run`).

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use vds::config::VdsConfig;
use vds::errors::OrchestratorError;
use vds::plan::default_registry;
use vds::store::Session;
use vds::supervisor::{Orchestrator, SessionRequest};
use vds::ws::WsMessage;
use vds_common::{Approval, AutonomyLevel};

use super::super::Cli;
use super::{build_orchestrator, open_store};

#[allow(clippy::too_many_arguments)]
pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    config: &VdsConfig,
    question: &str,
    domain: Option<String>,
    autonomy: Option<&str>,
    data_source_ids: Vec<String>,
) -> Result<()> {
    let autonomy = autonomy
        .map(AutonomyLevel::from_str)
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;

    let store = open_store(project_dir, config)?;
    let orchestrator = build_orchestrator(project_dir, store, config)?;

    let session = orchestrator
        .create_session(SessionRequest {
            question: question.to_string(),
            domain,
            autonomy,
            data_source_ids,
        })
        .await?;

    println!();
    println!("{} {}", style("Session").bold(), style(&session.id).dim());
    println!("  {}", session.title);
    println!("  autonomy: {}  domain: {}", session.autonomy, session.domain);
    println!();

    let events = orchestrator.subscribe();
    let handle = orchestrator.spawn(&session.id);
    match follow_session(&orchestrator, &session.id, cli.yes, events, handle).await? {
        Ok(done) => {
            print_summary(&done);
            Ok(())
        }
        Err(e) => {
            println!("{} {}", style("✗").red().bold(), e);
            anyhow::bail!("Session {} failed ({})", session.id, e.reason())
        }
    }
}

/// Render session events until the session task finishes, answering
/// checkpoints along the way. The outer error covers the task dying and
/// checkpoints that cannot be answered here.
async fn follow_session(
    orchestrator: &Orchestrator,
    session_id: &str,
    auto_approve: bool,
    mut events: broadcast::Receiver<String>,
    mut handle: JoinHandle<Result<Session, OrchestratorError>>,
) -> Result<Result<Session, OrchestratorError>> {
    let names: HashMap<String, String> = default_registry()
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();
    let total = names.len();
    let spinner = spinner();

    let joined = loop {
        tokio::select! {
            // Drain pending events before reporting the outcome.
            biased;

            received = events.recv() => {
                let raw = match received {
                    Ok(raw) => raw,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break (&mut handle).await,
                };
                let Ok(msg) = serde_json::from_str::<WsMessage>(&raw) else {
                    continue;
                };
                match msg {
                    WsMessage::StepStarted {
                        session_id: sid,
                        index,
                        step_id,
                    } if sid == session_id => {
                        spinner.set_message(format!(
                            "[{}/{}] {}",
                            index + 1,
                            total,
                            display_name(&names, &step_id)
                        ));
                    }
                    WsMessage::StepCompleted {
                        session_id: sid,
                        step_id,
                        artifacts,
                        ..
                    } if sid == session_id => {
                        spinner.println(format!(
                            "  {} {} ({} artifact{})",
                            style("✓").green(),
                            display_name(&names, &step_id),
                            artifacts,
                            if artifacts == 1 { "" } else { "s" }
                        ));
                    }
                    WsMessage::CheckpointReached {
                        session_id: sid,
                        step_id,
                        ..
                    } if sid == session_id => {
                        let name = display_name(&names, &step_id).to_string();
                        let approval = if auto_approve {
                            spinner.println(format!(
                                "  {} checkpoint before {}, auto-approving (--yes flag)",
                                style("⏸").yellow(),
                                name
                            ));
                            Approval::approve()
                        } else {
                            let answer = tokio::task::block_in_place(|| {
                                spinner.suspend(|| prompt_approval(&name))
                            });
                            match answer {
                                Ok(approval) => approval,
                                Err(e) => {
                                    spinner.finish_and_clear();
                                    return Err(e.context(format!(
                                        "Session {} is waiting at the checkpoint before {}. \
                                         Approve it with `vds approve {}` or rerun with --yes",
                                        session_id, name, session_id
                                    )));
                                }
                            }
                        };
                        submit_approval(orchestrator, session_id, approval).await;
                    }
                    _ => {}
                }
            }

            joined = &mut handle => break joined,
        }
    };
    spinner.finish_and_clear();

    joined.context("Session task panicked")
}

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message("planning");
    spinner
}

fn display_name<'a>(names: &'a HashMap<String, String>, step_id: &'a str) -> &'a str {
    names.get(step_id).map(String::as_str).unwrap_or(step_id)
}

fn prompt_approval(step_name: &str) -> Result<Approval> {
    use dialoguer::{Confirm, Input};

    let approved = Confirm::new()
        .with_prompt(format!("Checkpoint before {}. Approve and continue?", step_name))
        .default(true)
        .interact()
        .context("Cannot prompt for approval without a terminal")?;
    if approved {
        return Ok(Approval::approve());
    }
    let note: String = Input::new()
        .with_prompt("Reason for rejecting (optional)")
        .allow_empty(true)
        .interact_text()
        .context("Cannot prompt for a rejection note without a terminal")?;
    Ok(Approval {
        approved: false,
        note: (!note.trim().is_empty()).then_some(note),
    })
}

async fn submit_approval(orchestrator: &Orchestrator, session_id: &str, approval: Approval) {
    if let Err(e) = orchestrator.approve(session_id, approval).await {
        eprintln!("  {} could not record approval: {}", style("⚠").yellow(), e);
    }
}

fn print_summary(session: &Session) {
    println!("{} Session complete", style("✓").green().bold());
    let Some(output) = &session.final_output else {
        return;
    };
    if let Some(summary) = output.get("executive_summary").and_then(Value::as_str) {
        if !summary.is_empty() {
            println!();
            println!("{}", summary);
        }
    }
    print_list("Findings", output.get("findings"));
    print_list("Recommendations", output.get("recommendations"));
    if let Some(status) = output.get("governance_status") {
        println!();
        println!("Governance: {}", render(status));
    }
}

fn print_list(title: &str, value: Option<&Value>) {
    let Some(items) = value.and_then(Value::as_array) else {
        return;
    };
    if items.is_empty() {
        return;
    }
    println!();
    println!("{}", style(title).bold());
    for item in items {
        println!("  • {}", render(item));
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::Arc;
    use vds::capability::{Capability, CapabilityRegistry};
    use vds::plan::default_step_ids;
    use vds::store::DbHandle;
    use vds::supervisor::SupervisorSettings;

    struct Exploding;

    #[async_trait]
    impl Capability for Exploding {
        async fn run(
            &self,
            _question: &str,
            _domain: &str,
            _context: &Map<String, Value>,
            _data_source_ids: &[String],
        ) -> Result<Map<String, Value>> {
            panic!("capability exploded");
        }
    }

    #[tokio::test]
    async fn test_follow_returns_when_session_task_dies_silently() {
        let mut registry = CapabilityRegistry::new();
        for id in default_step_ids() {
            registry.register(id, Arc::new(Exploding));
        }
        let store = DbHandle::in_memory().unwrap();
        let orchestrator =
            Orchestrator::new(Arc::new(store), registry, SupervisorSettings::default()).unwrap();
        let session = orchestrator
            .create_session(SessionRequest {
                question: "q".into(),
                autonomy: Some(AutonomyLevel::Autonomous),
                ..Default::default()
            })
            .await
            .unwrap();

        // The panic ends the task without a SessionFailed event.
        let events = orchestrator.subscribe();
        let handle = orchestrator.spawn(&session.id);
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            follow_session(&orchestrator, &session.id, true, events, handle),
        )
        .await
        .expect("follow_session kept waiting after the session task ended");

        let err = outcome.unwrap_err();
        assert!(err.to_string().contains("Session task panicked"), "got: {:#}", err);
    }
}
