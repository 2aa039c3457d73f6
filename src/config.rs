//! Layered configuration for the orchestrator.
//!
//! Reads `.vds/vds.toml`, then applies `VDS_*` environment overrides, then any
//! CLI flags the command passes in. Every field has a default, so an empty or
//! missing file is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [checkpoint]
//! poll_interval_ms = 5000
//! max_checks = 120
//!
//! [autonomy]
//! default_level = "assist"
//! semi_auto_gated_steps = ["model", "act"]
//!
//! [audit]
//! payload_max_chars = 500
//! redacted_keys = ["raw_data"]
//! export_dir = ".vds/audit"
//!
//! [server]
//! port = 3150
//! db_path = ".vds/vds.db"
//! resume_on_startup = true
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! file = false
//!
//! [capabilities.frame]
//! kind = "command"
//! program = "python3"
//! args = ["agents/frame.py"]
//!
//! [capabilities.model]
//! kind = "http"
//! url = "http://localhost:8000/agents/model"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use vds_common::AutonomyLevel;

/// Name of the directory holding config, database and logs.
pub const VDS_DIR: &str = ".vds";
pub const CONFIG_FILE: &str = "vds.toml";

pub fn get_vds_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(VDS_DIR)
}

// ── [checkpoint] ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointConfig {
    /// Time between approval checks, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Number of checks before the checkpoint times out.
    #[serde(default = "default_max_checks")]
    pub max_checks: u32,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_max_checks() -> u32 {
    120
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_checks: default_max_checks(),
        }
    }
}

impl CheckpointConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Overall bound on one checkpoint wait. Saturates at `Duration::MAX`.
    pub fn timeout(&self) -> Duration {
        checkpoint_timeout(self.poll_interval(), self.max_checks)
    }
}

pub(crate) fn checkpoint_timeout(poll_interval: Duration, max_checks: u32) -> Duration {
    poll_interval.checked_mul(max_checks).unwrap_or(Duration::MAX)
}

// ── [autonomy] ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutonomyConfig {
    #[serde(default)]
    pub default_level: AutonomyLevel,
    /// Step ids that pause for approval under `semi_auto`.
    #[serde(default = "default_semi_auto_gated_steps")]
    pub semi_auto_gated_steps: Vec<String>,
}

fn default_semi_auto_gated_steps() -> Vec<String> {
    vec!["model".to_string(), "act".to_string()]
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            default_level: AutonomyLevel::default(),
            semi_auto_gated_steps: default_semi_auto_gated_steps(),
        }
    }
}

impl AutonomyConfig {
    pub fn gated_set(&self) -> HashSet<String> {
        self.semi_auto_gated_steps.iter().cloned().collect()
    }
}

// ── [audit] ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditConfig {
    /// Per-value character limit for audit payloads.
    #[serde(default = "default_payload_max_chars")]
    pub payload_max_chars: usize,
    /// Result keys never copied into audit payloads.
    #[serde(default = "default_redacted_keys")]
    pub redacted_keys: Vec<String>,
    /// When set, a JSON trail is written here once a session ends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_dir: Option<PathBuf>,
}

fn default_payload_max_chars() -> usize {
    500
}

fn default_redacted_keys() -> Vec<String> {
    vec!["raw_data".to_string()]
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            payload_max_chars: default_payload_max_chars(),
            redacted_keys: default_redacted_keys(),
            export_dir: None,
        }
    }
}

// ── [server] ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Resume non-terminal sessions when the server starts.
    #[serde(default = "default_resume_on_startup")]
    pub resume_on_startup: bool,
    /// Permissive CORS for a separately served frontend.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    3150
}

fn default_db_path() -> PathBuf {
    PathBuf::from(VDS_DIR).join("vds.db")
}

fn default_resume_on_startup() -> bool {
    true
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            resume_on_startup: default_resume_on_startup(),
            dev_mode: false,
        }
    }
}

// ── [logging] ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write a daily rolling log under `.vds/logs`.
    #[serde(default)]
    pub file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: false,
        }
    }
}

// ── [capabilities.<id>] ───────────────────────────────────────────────

/// How the capability behind one step id is provided.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CapabilitySpec {
    /// A subprocess that reads the request as JSON on stdin and prints the
    /// result object on stdout.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// An HTTP endpoint that accepts the request as a JSON POST body.
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

// ── Top level ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VdsConfig {
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub autonomy: AutonomyConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilitySpec>,
}

impl VdsConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse vds.toml")
    }

    /// Load `<vds_dir>/vds.toml`, or defaults when the file doesn't exist.
    pub fn load_or_default(vds_dir: &Path) -> Result<Self> {
        let config_path = vds_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize vds.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Load from the given file (or the project default) and apply env overrides.
    pub fn resolve(project_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(&get_vds_dir(project_dir))?,
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `VDS_*` overrides. `lookup` is injected so tests don't touch the
    /// process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("VDS_POLL_INTERVAL_MS") {
            self.checkpoint.poll_interval_ms = v
                .parse()
                .with_context(|| format!("Invalid VDS_POLL_INTERVAL_MS: {}", v))?;
        }
        if let Some(v) = lookup("VDS_MAX_CHECKS") {
            self.checkpoint.max_checks = v
                .parse()
                .with_context(|| format!("Invalid VDS_MAX_CHECKS: {}", v))?;
        }
        if let Some(v) = lookup("VDS_AUTONOMY") {
            self.autonomy.default_level = v
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid VDS_AUTONOMY")?;
        }
        if let Some(v) = lookup("VDS_PORT") {
            self.server.port = v
                .parse()
                .with_context(|| format!("Invalid VDS_PORT: {}", v))?;
        }
        if let Some(v) = lookup("VDS_DB_PATH") {
            self.server.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("VDS_AUDIT_EXPORT_DIR") {
            self.audit.export_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("VDS_LOG_FORMAT") {
            self.logging.format = match v.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => anyhow::bail!("Invalid VDS_LOG_FORMAT '{}'. Valid values: pretty, json", other),
            };
        }
        Ok(())
    }

    /// Collect human-readable warnings about suspicious settings. An empty
    /// list means the configuration looks sane.
    pub fn validate(&self, known_steps: &[&str]) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.checkpoint.poll_interval_ms == 0 {
            warnings.push("checkpoint.poll_interval_ms is 0; approval checks will spin".to_string());
        }
        if self.checkpoint.max_checks == 0 {
            warnings.push(
                "checkpoint.max_checks is 0; every checkpoint times out immediately".to_string(),
            );
        }
        if self
            .checkpoint
            .poll_interval()
            .checked_mul(self.checkpoint.max_checks)
            .is_none()
        {
            warnings.push(
                "checkpoint.poll_interval_ms × max_checks overflows; checkpoints will never time out"
                    .to_string(),
            );
        }
        for step in &self.autonomy.semi_auto_gated_steps {
            if !known_steps.contains(&step.as_str()) {
                warnings.push(format!(
                    "autonomy.semi_auto_gated_steps names unknown step '{}'",
                    step
                ));
            }
        }
        for step in known_steps {
            if !self.capabilities.contains_key(*step) {
                warnings.push(format!("No capability configured for step '{}'", step));
            }
        }
        for id in self.capabilities.keys() {
            if !known_steps.contains(&id.as_str()) {
                warnings.push(format!(
                    "capabilities.{} does not match any step in the registry",
                    id
                ));
            }
        }
        if self.audit.payload_max_chars == 0 {
            warnings.push("audit.payload_max_chars is 0; audit payloads will be empty".to_string());
        }

        warnings
    }
}
