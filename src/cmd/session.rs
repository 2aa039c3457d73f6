//! Session inspection and approval (`vds approve|status|messages|audit`).
//!
//! These work directly against the session database, so they can be used
//! alongside a running server: an approval written here is picked up by the
//! server's checkpoint on its next poll.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use console::style;
use vds::audit::AuditTrail;
use vds::config::VdsConfig;
use vds::store::SessionStore;
use vds_common::{Approval, MessageRole, PolicyDecision, SessionStatus, StepStatus};

use super::open_store;

pub async fn cmd_approve(
    project_dir: &Path,
    config: &VdsConfig,
    id: &str,
    reject: bool,
    note: Option<String>,
) -> Result<()> {
    let store = open_store(project_dir, config)?;
    let approval = Approval {
        approved: !reject,
        note,
    };
    let session = store.record_approval(id, approval).await?;
    let step = session
        .plan
        .steps
        .iter()
        .find(|s| s.status == StepStatus::Checkpoint)
        .map(|s| s.name.as_str())
        .unwrap_or("the next step");
    if reject {
        println!("{} Rejected checkpoint before {}", style("✗").red(), step);
    } else {
        println!("{} Approved checkpoint before {}", style("✓").green(), step);
    }
    Ok(())
}

pub async fn cmd_status(
    project_dir: &Path,
    config: &VdsConfig,
    id: Option<&str>,
    status: Option<&str>,
) -> Result<()> {
    let store = open_store(project_dir, config)?;

    let Some(id) = id else {
        let filter = status
            .map(SessionStatus::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))?;
        let sessions = store.list_sessions(filter).await?;
        if sessions.is_empty() {
            println!("No sessions.");
            return Ok(());
        }
        for s in sessions {
            println!(
                "{}  {:<11} {:<10} {}",
                style(&s.id).dim(),
                status_label(s.status),
                s.autonomy,
                s.title
            );
        }
        return Ok(());
    };

    let session = store.require_session(id).await?;
    println!();
    println!("{} {}", style("Session").bold(), session.id);
    println!("  title:    {}", session.title);
    println!("  domain:   {}", session.domain);
    println!("  autonomy: {}", session.autonomy);
    println!("  status:   {}", status_label(session.status));
    println!("  created:  {}", session.created_at);
    println!("  updated:  {}", session.updated_at);
    if let Some(error) = &session.error {
        println!("  error:    {}", style(error).red());
    }
    println!();
    for step in &session.plan.steps {
        let marker = match step.status {
            StepStatus::Done => style("✓").green(),
            StepStatus::Executing => style("▶").cyan(),
            StepStatus::Checkpoint => style("⏸").yellow(),
            StepStatus::Failed => style("✗").red(),
            StepStatus::Pending => style("·").dim(),
        };
        println!("  {} {:>2}. {:<20} {}", marker, step.index + 1, step.name, step.status);
    }
    if let Some(output) = &session.final_output {
        println!();
        println!("{}", serde_json::to_string_pretty(output)?);
    }
    Ok(())
}

fn status_label(status: SessionStatus) -> console::StyledObject<&'static str> {
    let label = status.as_str();
    match status {
        SessionStatus::Done => style(label).green(),
        SessionStatus::Failed => style(label).red(),
        SessionStatus::Checkpoint => style(label).yellow(),
        _ => style(label).cyan(),
    }
}

pub async fn cmd_messages(project_dir: &Path, config: &VdsConfig, id: &str) -> Result<()> {
    let store = open_store(project_dir, config)?;
    store.require_session(id).await?;
    for message in store.list_messages(id).await? {
        let who = match (message.role, &message.agent) {
            (MessageRole::User, _) => style("user".to_string()).bold(),
            (_, Some(agent)) => style(agent.clone()).cyan(),
            (role, None) => style(role.as_str().to_string()).dim(),
        };
        println!("{} {:<12} {}", style(&message.created_at).dim(), who, message.content);
    }
    Ok(())
}

pub async fn cmd_audit(
    project_dir: &Path,
    config: &VdsConfig,
    id: &str,
    export: Option<&Path>,
) -> Result<()> {
    let store = open_store(project_dir, config)?;
    let session = store.require_session(id).await?;
    let events = store.list_audit_events(id).await?;

    if let Some(path) = export {
        let artifacts = store.list_artifacts(id).await?;
        let trail = AuditTrail::new(&session, &artifacts, events);
        let json = serde_json::to_string_pretty(&trail)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write audit trail to {}", path.display()))?;
        println!("Exported audit trail to {}", path.display());
        return Ok(());
    }

    if events.is_empty() {
        println!("No audit events for session {}.", id);
        return Ok(());
    }
    for event in events {
        let decision = match event.decision {
            PolicyDecision::Pass => style("PASS").green(),
            PolicyDecision::Fail => style("FAIL").red(),
        };
        println!(
            "{} {} {:<28} {}",
            style(&event.created_at).dim(),
            decision,
            event.action,
            event.payload
        );
    }
    Ok(())
}
