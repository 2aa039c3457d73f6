//! Subprocess-backed capability.

use std::collections::BTreeMap;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Capability, CapabilityRequest, parse_result};

/// Longest stderr excerpt carried into a failure message.
const STDERR_EXCERPT_CHARS: usize = 2000;

/// Runs a program per invocation. The request is written to stdin as JSON
/// and stdout must hold a single JSON object.
#[derive(Debug, Clone)]
pub struct CommandCapability {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandCapability {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

#[async_trait]
impl Capability for CommandCapability {
    async fn run(
        &self,
        question: &str,
        domain: &str,
        context: &Map<String, Value>,
        data_source_ids: &[String],
    ) -> Result<Map<String, Value>> {
        let request = serde_json::to_vec(&CapabilityRequest {
            question,
            domain,
            context,
            data_source_ids,
        })
        .context("Failed to serialize capability request")?;

        debug!(program = %self.program, bytes = request.len(), "spawning capability process");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn capability process '{}'", self.program))?;

        // Feed stdin while stdout drains; a program that echoes as it reads
        // would otherwise block on a full pipe.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&request).await {
                // A program that ignores its input may exit before reading it.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };
        let (written, output) = tokio::join!(feed, child.wait_with_output());

        let output = output.context("Failed to wait for capability process")?;
        written.context("Failed to write capability request")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT_CHARS).collect();
            anyhow::bail!(
                "'{}' exited with {}{}",
                self.program,
                output.status,
                if excerpt.is_empty() {
                    String::new()
                } else {
                    format!(": {}", excerpt)
                }
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_result(&stdout)
    }
}
