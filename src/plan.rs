//! Step registry, plan construction and the final-output projection.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use vds_common::{Plan, PlanStep, StepStatus};

use crate::capability::{Capability, CapabilityRegistry};
use crate::errors::OrchestratorError;

/// One entry of the step registry: a stable id and a display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDef {
    pub id: String,
    pub name: String,
}

impl StepDef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// The default analysis pipeline, in execution order.
pub const DEFAULT_STEPS: &[(&str, &str)] = &[
    ("frame", "Problem Framer"),
    ("map", "Semantic Mapper"),
    ("quality", "Data Quality"),
    ("eda", "EDA & Hypothesis"),
    ("model", "Modeling"),
    ("narrate", "Insight Narrator"),
    ("act", "Action"),
    ("govern", "Governance"),
];

pub fn default_registry() -> Vec<StepDef> {
    DEFAULT_STEPS
        .iter()
        .map(|(id, name)| StepDef::new(*id, *name))
        .collect()
}

pub fn default_step_ids() -> Vec<&'static str> {
    DEFAULT_STEPS.iter().map(|(id, _)| *id).collect()
}

/// Build a fresh plan with every step `pending`.
pub fn build_plan(registry: &[StepDef]) -> Plan {
    Plan::new(
        registry
            .iter()
            .enumerate()
            .map(|(index, def)| PlanStep {
                index,
                id: def.id.clone(),
                name: def.name.clone(),
                status: StepStatus::Pending,
            })
            .collect(),
    )
}

/// A plan step bound to the capability that implements it.
#[derive(Clone)]
pub struct ResolvedStep {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub capability: Arc<dyn Capability>,
}

/// A plan whose every step has been resolved against the registry. Building
/// one is the only place `UnknownCapability` can arise.
#[derive(Clone)]
pub struct ExecutablePlan {
    steps: Vec<ResolvedStep>,
}

impl ExecutablePlan {
    pub fn resolve(plan: &Plan, registry: &CapabilityRegistry) -> Result<Self, OrchestratorError> {
        let steps = plan
            .steps
            .iter()
            .map(|step| {
                let capability =
                    registry
                        .get(&step.id)
                        .ok_or_else(|| OrchestratorError::UnknownCapability {
                            step_id: step.id.clone(),
                        })?;
                Ok(ResolvedStep {
                    index: step.index,
                    id: step.id.clone(),
                    name: step.name.clone(),
                    capability,
                })
            })
            .collect::<Result<Vec<_>, OrchestratorError>>()?;
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[ResolvedStep] {
        &self.steps
    }

    pub fn get(&self, index: usize) -> Option<&ResolvedStep> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Compose the final output from the late-stage step results: the narrated
/// summary, findings and recommendations, the governance decision, and the
/// ids of every step that produced a result, in plan order.
pub fn project_final_output(plan: &Plan, context: &Map<String, Value>) -> Value {
    let narrate = context.get("narrate");
    let field = |key: &str, default: Value| {
        narrate
            .and_then(|n| n.get(key))
            .cloned()
            .unwrap_or(default)
    };
    let governance_status = context
        .get("govern")
        .and_then(|g| g.get("status"))
        .cloned()
        .unwrap_or_else(|| Value::String("PASS".to_string()));
    let artifacts: Vec<&str> = plan
        .steps
        .iter()
        .filter(|s| context.contains_key(&s.id))
        .map(|s| s.id.as_str())
        .collect();

    json!({
        "executive_summary": field("executive_summary", Value::String(String::new())),
        "findings": field("findings", json!([])),
        "recommendations": field("recommendations", json!([])),
        "governance_status": governance_status,
        "artifacts": artifacts,
    })
}

/// Closing message text: the narrated summary, or a generic line.
pub fn closing_message(final_output: &Value) -> String {
    match final_output.get("executive_summary").and_then(Value::as_str) {
        Some(summary) if !summary.trim().is_empty() => summary.to_string(),
        _ => "Analysis complete.".to_string(),
    }
}
