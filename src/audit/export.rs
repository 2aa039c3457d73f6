use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vds_common::{AutonomyLevel, Plan, SessionStatus};

use crate::store::{Artifact, AuditEvent, Session};

/// Self-contained compliance record of one session, written once the session
/// reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditTrail {
    pub session_id: String,
    pub title: String,
    pub domain: String,
    pub autonomy: AutonomyLevel,
    pub status: SessionStatus,
    pub plan: Plan,
    pub error: Option<String>,
    pub final_output: Option<serde_json::Value>,
    pub artifacts: Vec<ArtifactSummary>,
    pub events: Vec<AuditEvent>,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactSummary {
    pub artifact_type: String,
    pub name: String,
    pub agent: String,
    pub created_at: String,
}

impl AuditTrail {
    pub fn new(session: &Session, artifacts: &[Artifact], events: Vec<AuditEvent>) -> Self {
        Self {
            session_id: session.id.clone(),
            title: session.title.clone(),
            domain: session.domain.clone(),
            autonomy: session.autonomy,
            status: session.status,
            plan: session.plan.clone(),
            error: session.error.clone(),
            final_output: session.final_output.clone(),
            artifacts: artifacts
                .iter()
                .map(|a| ArtifactSummary {
                    artifact_type: a.artifact_type.clone(),
                    name: a.name.clone(),
                    agent: a.agent.clone(),
                    created_at: a.created_at.clone(),
                })
                .collect(),
            events,
            exported_at: Utc::now(),
        }
    }
}

/// Writes audit trails as pretty JSON under `<dir>/sessions/`.
pub struct AuditExporter {
    audit_dir: PathBuf,
}

impl AuditExporter {
    pub fn new(audit_dir: &Path) -> Self {
        Self {
            audit_dir: audit_dir.to_path_buf(),
        }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.audit_dir.join("sessions")
    }

    pub fn write(&self, trail: &AuditTrail) -> Result<PathBuf> {
        let dir = self.sessions_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create audit directory {}", dir.display()))?;

        let short_id: String = trail.session_id.chars().take(8).collect();
        let filename = format!(
            "{}_{}.json",
            trail.exported_at.format("%Y-%m-%dT%H-%M-%S"),
            short_id
        );
        let path = dir.join(filename);
        let json = serde_json::to_string_pretty(trail).context("Failed to serialize audit trail")?;
        fs::write(&path, json).context("Failed to write audit trail file")?;
        Ok(path)
    }

    /// Exported trail files, most recent first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let dir = self.sessions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut trails: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        trails.sort();
        trails.reverse();
        Ok(trails)
    }

    pub fn load(&self, path: &Path) -> Result<AuditTrail> {
        let content = fs::read_to_string(path).context("Failed to read audit trail file")?;
        serde_json::from_str(&content).context("Failed to parse audit trail file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use vds_common::PolicyDecision;

    fn session() -> Session {
        Session {
            id: "0123456789abcdef".into(),
            title: "Why did churn rise?".into(),
            goal: "Why did churn rise?".into(),
            domain: "telecom".into(),
            autonomy: AutonomyLevel::SemiAuto,
            status: SessionStatus::Done,
            plan: Plan::default(),
            current_step_index: 0,
            context: Default::default(),
            approval: None,
            data_source_ids: vec![],
            final_output: Some(json!({"governance_status": "PASS"})),
            error: None,
            created_at: "2026-01-01T00:00:00.000Z".into(),
            updated_at: "2026-01-01T00:00:00.000Z".into(),
        }
    }

    fn event(action: &str) -> AuditEvent {
        AuditEvent {
            id: 1,
            session_id: "0123456789abcdef".into(),
            actor: "agent:supervisor".into(),
            action: action.into(),
            payload: json!({}),
            decision: PolicyDecision::Pass,
            tenant: "default".into(),
            created_at: "2026-01-01T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn write_then_load_round_trip() {
        let dir = tempdir().unwrap();
        let exporter = AuditExporter::new(dir.path());
        let trail = AuditTrail::new(&session(), &[], vec![event("session.complete")]);

        let path = exporter.write(&trail).unwrap();
        assert!(path.starts_with(dir.path().join("sessions")));
        assert!(path.file_name().unwrap().to_string_lossy().ends_with("_01234567.json"));

        let loaded = exporter.load(&path).unwrap();
        assert_eq!(loaded, trail);
        assert_eq!(exporter.list().unwrap(), vec![path]);
    }

    #[test]
    fn list_is_empty_without_directory() {
        let dir = tempdir().unwrap();
        let exporter = AuditExporter::new(&dir.path().join("missing"));
        assert!(exporter.list().unwrap().is_empty());
    }
}
