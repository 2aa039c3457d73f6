//! `vds workflow run <file>`.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use serde_json::{Map, Value};
use vds::capability::CapabilityRegistry;
use vds::config::VdsConfig;
use vds::store::WorkflowRunStatus;
use vds::workflow::{Workflow, WorkflowDef};

use super::open_store;

pub async fn cmd_workflow_run(
    project_dir: &Path,
    config: &VdsConfig,
    file: &Path,
    inputs: Option<&str>,
) -> Result<()> {
    let inputs: Map<String, Value> = match inputs {
        Some(raw) => serde_json::from_str(raw).context("--inputs must be a JSON object")?,
        None => Map::new(),
    };

    let def = WorkflowDef::load(file)?;
    let registry = CapabilityRegistry::from_config(&config.capabilities)?;
    let workflow = Workflow::new(def, &registry)?;
    let store = open_store(project_dir, config)?;

    println!("Running workflow {}", style(workflow.name()).bold());
    let run = workflow.execute(&store, inputs).await?;

    for entry in &run.steps_log {
        let ok = entry.get("status").and_then(Value::as_str) == Some("success");
        let marker = if ok { style("✓").green() } else { style("✗").red() };
        println!(
            "  {} {} ({})",
            marker,
            entry.get("id").and_then(Value::as_str).unwrap_or("?"),
            entry.get("type").and_then(Value::as_str).unwrap_or("?")
        );
    }

    match run.status {
        WorkflowRunStatus::Succeeded => {
            println!("{} run {} succeeded", style("✓").green().bold(), run.id);
            Ok(())
        }
        _ => anyhow::bail!(
            "Workflow run {} failed: {}",
            run.id,
            run.error.as_deref().unwrap_or("unknown error")
        ),
    }
}
