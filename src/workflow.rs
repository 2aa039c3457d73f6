//! Linear typed-node workflows.
//!
//! A workflow is a named list of nodes run strictly in order against a shared
//! context seeded from the run inputs. Each node writes its output under its
//! own id. Runs are recorded in the `workflow_runs` table.
//!
//! ```yaml
//! name: churn-triage
//! nodes:
//!   - id: frame
//!     type: capability
//!     capability: frame
//!   - id: high_risk
//!     type: conditional
//!     variable: churn_rate
//!     threshold: 0.05
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};

use crate::capability::{Capability, CapabilityRegistry};
use crate::errors::{OrchestratorError, WorkflowError};
use crate::store::{DbHandle, WorkflowRun, WorkflowRunStatus};

const DEFAULT_QUESTION: &str = "Execute workflow step";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<NodeDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeDef {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Invoke a registered capability with the workflow context.
    Capability { capability: String },
    /// `context[variable] > threshold`; a missing or non-numeric value
    /// yields `true`.
    Conditional { variable: String, threshold: f64 },
}

impl NodeKind {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Capability { .. } => "capability",
            Self::Conditional { .. } => "conditional",
        }
    }
}

impl WorkflowDef {
    /// Parse a definition from YAML (JSON is accepted as a YAML subset).
    pub fn parse(content: &str) -> Result<Self, WorkflowError> {
        serde_yaml::from_str(content).map_err(|e| WorkflowError::InvalidDefinition(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WorkflowError::InvalidDefinition(format!("{}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }
}

enum ResolvedNode {
    Capability(Arc<dyn Capability>),
    Conditional { variable: String, threshold: f64 },
}

/// A definition whose capability nodes have all been bound to the registry.
pub struct Workflow {
    def: WorkflowDef,
    nodes: Vec<ResolvedNode>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow").field("def", &self.def).finish()
    }
}

impl Workflow {
    pub fn new(def: WorkflowDef, registry: &CapabilityRegistry) -> Result<Self, WorkflowError> {
        if def.name.trim().is_empty() {
            return Err(WorkflowError::InvalidDefinition("workflow name is empty".into()));
        }
        if def.nodes.is_empty() {
            return Err(WorkflowError::InvalidDefinition(format!(
                "workflow '{}' has no nodes",
                def.name
            )));
        }

        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(def.nodes.len());
        for node in &def.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(WorkflowError::DuplicateNode {
                    workflow: def.name.clone(),
                    node_id: node.id.clone(),
                });
            }
            nodes.push(match &node.kind {
                NodeKind::Capability { capability } => ResolvedNode::Capability(
                    registry
                        .get(capability)
                        .ok_or_else(|| OrchestratorError::UnknownCapability {
                            step_id: capability.clone(),
                        })?,
                ),
                NodeKind::Conditional {
                    variable,
                    threshold,
                } => ResolvedNode::Conditional {
                    variable: variable.clone(),
                    threshold: *threshold,
                },
            });
        }
        Ok(Self { def, nodes })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Run every node in order. A failing node stops the run and marks it
    /// `failed`; the returned record carries the outcome either way.
    #[instrument(skip(self, db, inputs), fields(workflow = %self.def.name))]
    pub async fn execute(
        &self,
        db: &DbHandle,
        inputs: Map<String, Value>,
    ) -> Result<WorkflowRun, WorkflowError> {
        let name = self.def.name.clone();
        let seed = Value::Object(inputs.clone());
        let run = db
            .call(move |db| db.create_workflow_run(&name, &seed))
            .await?;
        info!(run_id = %run.id, nodes = self.nodes.len(), "workflow run started");

        let mut context = inputs;
        let mut steps_log: Vec<Value> = Vec::new();

        for (def, node) in self.def.nodes.iter().zip(&self.nodes) {
            match self.run_node(node, &context).await {
                Ok(output) => {
                    steps_log.push(json!({
                        "id": def.id,
                        "type": def.kind.type_name(),
                        "status": "success",
                        "output": output,
                    }));
                    context.insert(def.id.clone(), output);
                    self.persist(db, &run.id, WorkflowRunStatus::Running, &steps_log, None)
                        .await?;
                }
                Err(message) => {
                    let err = WorkflowError::NodeFailed {
                        node_id: def.id.clone(),
                        message,
                    };
                    warn!(run_id = %run.id, node = %def.id, error = %err, "workflow run failed");
                    steps_log.push(json!({
                        "id": def.id,
                        "type": def.kind.type_name(),
                        "status": "failed",
                    }));
                    return self
                        .persist(
                            db,
                            &run.id,
                            WorkflowRunStatus::Failed,
                            &steps_log,
                            Some(err.to_string()),
                        )
                        .await;
                }
            }
        }

        info!(run_id = %run.id, "workflow run succeeded");
        self.persist(db, &run.id, WorkflowRunStatus::Succeeded, &steps_log, None)
            .await
    }

    async fn run_node(&self, node: &ResolvedNode, context: &Map<String, Value>) -> Result<Value, String> {
        match node {
            ResolvedNode::Capability(capability) => {
                let question = context
                    .get("question")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_QUESTION);
                let domain = context
                    .get("domain")
                    .and_then(Value::as_str)
                    .unwrap_or("generic");
                let data_source_ids: Vec<String> = context
                    .get("data_source_ids")
                    .and_then(Value::as_array)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                capability
                    .run(question, domain, context, &data_source_ids)
                    .await
                    .map(Value::Object)
                    .map_err(|e| format!("{:#}", e))
            }
            ResolvedNode::Conditional {
                variable,
                threshold,
            } => Ok(Value::Bool(evaluate_condition(context, variable, *threshold))),
        }
    }

    async fn persist(
        &self,
        db: &DbHandle,
        run_id: &str,
        status: WorkflowRunStatus,
        steps_log: &[Value],
        error: Option<String>,
    ) -> Result<WorkflowRun, WorkflowError> {
        let run_id = run_id.to_string();
        let steps_log = steps_log.to_vec();
        Ok(db
            .call(move |db| db.update_workflow_run(&run_id, status, &steps_log, error.as_deref()))
            .await?)
    }
}

pub fn evaluate_condition(context: &Map<String, Value>, variable: &str, threshold: f64) -> bool {
    match context.get(variable).and_then(Value::as_f64) {
        Some(value) => value > threshold,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Score(f64);

    #[async_trait]
    impl Capability for Score {
        async fn run(
            &self,
            question: &str,
            _d: &str,
            context: &Map<String, Value>,
            _ids: &[String],
        ) -> anyhow::Result<Map<String, Value>> {
            let mut out = Map::new();
            out.insert("score".into(), json!(self.0));
            out.insert("question".into(), json!(question));
            out.insert("keys".into(), json!(context.len()));
            Ok(out)
        }
    }

    struct Fails;

    #[async_trait]
    impl Capability for Fails {
        async fn run(
            &self,
            _q: &str,
            _d: &str,
            _c: &Map<String, Value>,
            _ids: &[String],
        ) -> anyhow::Result<Map<String, Value>> {
            anyhow::bail!("model did not converge")
        }
    }

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new()
            .with("model", Arc::new(Score(0.8)))
            .with("broken", Arc::new(Fails))
    }

    const YAML: &str = r#"
name: churn-triage
nodes:
  - id: scored
    type: capability
    capability: model
  - id: high_churn
    type: conditional
    variable: churn_rate
    threshold: 0.05
"#;

    #[test]
    fn parses_yaml_and_json() {
        let def = WorkflowDef::parse(YAML).unwrap();
        assert_eq!(def.name, "churn-triage");
        assert_eq!(
            def.nodes[1].kind,
            NodeKind::Conditional {
                variable: "churn_rate".into(),
                threshold: 0.05
            }
        );

        let json = r#"{"name": "j", "nodes": [{"id": "a", "type": "capability", "capability": "model"}]}"#;
        let def = WorkflowDef::parse(json).unwrap();
        assert_eq!(
            def.nodes[0].kind,
            NodeKind::Capability {
                capability: "model".into()
            }
        );
    }

    #[test]
    fn unknown_node_type_is_invalid() {
        let yaml = "name: x\nnodes:\n  - id: a\n    type: teleport\n";
        assert!(matches!(
            WorkflowDef::parse(yaml),
            Err(WorkflowError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn unknown_capability_fails_at_construction() {
        let yaml = "name: x\nnodes:\n  - id: a\n    type: capability\n    capability: ghost\n";
        let def = WorkflowDef::parse(yaml).unwrap();
        match Workflow::new(def, &registry()) {
            Err(WorkflowError::Orchestrator(OrchestratorError::UnknownCapability { step_id })) => {
                assert_eq!(step_id, "ghost")
            }
            other => panic!("Expected UnknownCapability, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_node_ids_are_rejected() {
        let yaml = "name: x\nnodes:\n  - id: a\n    type: capability\n    capability: model\n  - id: a\n    type: conditional\n    variable: v\n    threshold: 1\n";
        let def = WorkflowDef::parse(yaml).unwrap();
        assert!(matches!(
            Workflow::new(def, &registry()),
            Err(WorkflowError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn conditional_compares_and_defaults_to_true() {
        let mut ctx = Map::new();
        ctx.insert("rate".into(), json!(0.1));
        ctx.insert("label".into(), json!("high"));
        assert!(evaluate_condition(&ctx, "rate", 0.05));
        assert!(!evaluate_condition(&ctx, "rate", 0.5));
        assert!(evaluate_condition(&ctx, "missing", 100.0));
        assert!(evaluate_condition(&ctx, "label", 100.0));
    }

    #[tokio::test]
    async fn successful_run_is_recorded() {
        let db = DbHandle::in_memory().unwrap();
        let workflow = Workflow::new(WorkflowDef::parse(YAML).unwrap(), &registry()).unwrap();
        let mut inputs = Map::new();
        inputs.insert("question".into(), json!("Who will churn?"));
        inputs.insert("churn_rate".into(), json!(0.02));

        let run = workflow.execute(&db, inputs).await.unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Succeeded);
        assert_eq!(run.workflow_name, "churn-triage");
        assert!(run.completed_at.is_some());
        assert_eq!(run.steps_log.len(), 2);
        assert_eq!(run.steps_log[0]["output"]["question"], "Who will churn?");
        assert_eq!(run.steps_log[0]["output"]["keys"], 2);
        assert_eq!(run.steps_log[1]["output"], false);
        assert_eq!(run.inputs["churn_rate"], 0.02);
    }

    #[tokio::test]
    async fn failing_node_stops_the_run() {
        let db = DbHandle::in_memory().unwrap();
        let yaml = "name: x\nnodes:\n  - id: a\n    type: capability\n    capability: broken\n  - id: b\n    type: capability\n    capability: model\n";
        let workflow = Workflow::new(WorkflowDef::parse(yaml).unwrap(), &registry()).unwrap();

        let run = workflow.execute(&db, Map::new()).await.unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Failed);
        assert_eq!(run.steps_log.len(), 1);
        assert_eq!(run.steps_log[0]["status"], "failed");
        assert!(run.error.unwrap().contains("model did not converge"));

        let stored = db
            .call(move |db| db.get_workflow_run(&run.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, WorkflowRunStatus::Failed);
    }
}
