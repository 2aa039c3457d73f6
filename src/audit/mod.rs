//! Artifact and audit-event construction.
//!
//! `Recorder` turns a step result into the artifacts and audit event that the
//! step commit persists, and builds the terminal audit events. It holds no
//! state beyond its redaction settings; persistence happens in the store.

pub mod export;

use serde_json::{Map, Value, json};
use vds_common::PolicyDecision;

use crate::config::AuditConfig;
use crate::store::{NewArtifact, NewAuditEvent};

pub use export::{AuditExporter, AuditTrail};

pub const SUPERVISOR_ACTOR: &str = "agent:supervisor";

#[derive(Debug, Clone)]
pub struct Recorder {
    payload_max_chars: usize,
    redacted_keys: Vec<String>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::from_config(&AuditConfig::default())
    }
}

impl Recorder {
    pub fn from_config(config: &AuditConfig) -> Self {
        Self {
            payload_max_chars: config.payload_max_chars,
            redacted_keys: config.redacted_keys.clone(),
        }
    }

    /// One artifact per non-empty object value in the result, in key order.
    pub fn artifacts_for(
        &self,
        step_id: &str,
        step_name: &str,
        result: &Map<String, Value>,
    ) -> Vec<NewArtifact> {
        result
            .iter()
            .filter_map(|(key, value)| match value {
                Value::Object(map) if !map.is_empty() => Some(NewArtifact {
                    artifact_type: key.clone(),
                    name: format!("{}: {}", step_name, key),
                    content: value.clone(),
                    agent: step_id.to_string(),
                }),
                _ => None,
            })
            .collect()
    }

    /// `agent.<step>.complete` with every non-redacted key rendered to text
    /// and truncated.
    pub fn step_completed(&self, step_id: &str, result: &Map<String, Value>) -> NewAuditEvent {
        let payload: Map<String, Value> = result
            .iter()
            .filter(|(key, _)| !self.redacted_keys.iter().any(|r| r == *key))
            .map(|(key, value)| {
                (
                    key.clone(),
                    Value::String(truncate_chars(&render(value), self.payload_max_chars)),
                )
            })
            .collect();

        NewAuditEvent {
            actor: SUPERVISOR_ACTOR.to_string(),
            action: format!("agent.{}.complete", step_id),
            payload: Value::Object(payload),
            decision: PolicyDecision::Pass,
        }
    }

    pub fn session_completed(&self, final_output: &Value) -> NewAuditEvent {
        let governance = final_output
            .get("governance_status")
            .cloned()
            .unwrap_or(Value::Null);
        NewAuditEvent {
            actor: SUPERVISOR_ACTOR.to_string(),
            action: "session.complete".to_string(),
            payload: json!({ "governance_status": governance }),
            decision: PolicyDecision::Pass,
        }
    }

    pub fn session_failed(&self, step_id: Option<&str>, reason: &str, error: &str) -> NewAuditEvent {
        NewAuditEvent {
            actor: SUPERVISOR_ACTOR.to_string(),
            action: "session.failed".to_string(),
            payload: json!({
                "step": step_id,
                "reason": reason,
                "error": truncate_chars(error, self.payload_max_chars),
            }),
            decision: PolicyDecision::Fail,
        }
    }
}

/// Strings are taken verbatim, everything else as compact JSON.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Cut `s` to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn one_artifact_per_non_empty_object() {
        let r = result(json!({
            "findings": {"top": "north"},
            "segments": {"a": 1, "b": 2},
            "empty": {},
            "summary": "text is not an artifact",
            "list": [1, 2],
        }));
        let artifacts = Recorder::default().artifacts_for("eda", "EDA & Hypothesis", &r);

        assert_eq!(artifacts.len(), 2);
        assert!(artifacts.iter().all(|a| a.agent == "eda"));
        let names: Vec<_> = artifacts.iter().map(|a| a.name.as_str()).collect();
        assert!(names.contains(&"EDA & Hypothesis: findings"));
        assert!(names.contains(&"EDA & Hypothesis: segments"));
        let seg = artifacts.iter().find(|a| a.artifact_type == "segments").unwrap();
        assert_eq!(seg.content, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn step_event_redacts_and_truncates() {
        let recorder = Recorder::from_config(&AuditConfig {
            payload_max_chars: 5,
            ..AuditConfig::default()
        });
        let r = result(json!({
            "raw_data": "secret rows",
            "summary": "abcdefghij",
            "score": 0.93,
        }));
        let event = recorder.step_completed("model", &r);

        assert_eq!(event.actor, "agent:supervisor");
        assert_eq!(event.action, "agent.model.complete");
        assert_eq!(event.decision, PolicyDecision::Pass);
        assert!(event.payload.get("raw_data").is_none());
        assert_eq!(event.payload["summary"], "abcde");
        assert_eq!(event.payload["score"], "0.93");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("✅✅✅", 2), "✅✅");
        assert_eq!(truncate_chars("short", 500), "short");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn failure_event_is_fail_decision() {
        let event = Recorder::default().session_failed(Some("act"), "approval_timeout", "no reply");
        assert_eq!(event.decision, PolicyDecision::Fail);
        assert_eq!(event.action, "session.failed");
        assert_eq!(event.payload["step"], "act");
        assert_eq!(event.payload["reason"], "approval_timeout");
    }

    #[test]
    fn completion_event_carries_governance_status() {
        let event = Recorder::default().session_completed(&json!({"governance_status": "PASS"}));
        assert_eq!(event.action, "session.complete");
        assert_eq!(event.payload["governance_status"], "PASS");
    }
}
