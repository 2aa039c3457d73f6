//! Capabilities: the external analytical units a step invokes.
//!
//! A capability is opaque to the orchestrator. It receives the session
//! question, domain tag, the results of earlier steps and the data source
//! ids, and returns a JSON object. The registry maps step ids to
//! capabilities and is populated by explicit registration only.

pub mod command;
pub mod http;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::CapabilitySpec;
pub use command::CommandCapability;
pub use http::HttpCapability;

/// Abstraction over one analytical step, allowing tests to substitute
/// scripted implementations.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn run(
        &self,
        question: &str,
        domain: &str,
        context: &Map<String, Value>,
        data_source_ids: &[String],
    ) -> Result<Map<String, Value>>;
}

/// Wire form of a capability invocation, shared by the command and HTTP
/// adapters.
#[derive(Debug, Serialize)]
pub struct CapabilityRequest<'a> {
    pub question: &'a str,
    pub domain: &'a str,
    pub context: &'a Map<String, Value>,
    pub data_source_ids: &'a [String],
}

/// Parse a capability response body, which must be a JSON object.
pub(crate) fn parse_result(body: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(body.trim())
        .map_err(|e| anyhow::anyhow!("Capability returned invalid JSON: {}", e))?;
    into_object(value)
}

pub(crate) fn into_object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!(
            "Capability must return a JSON object, got {}",
            json_kind(&other)
        ),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    entries: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `capability` under `step_id`, replacing any previous entry.
    pub fn register(&mut self, step_id: impl Into<String>, capability: Arc<dyn Capability>) {
        self.entries.insert(step_id.into(), capability);
    }

    pub fn with(mut self, step_id: impl Into<String>, capability: Arc<dyn Capability>) -> Self {
        self.register(step_id, capability);
        self
    }

    pub fn get(&self, step_id: &str) -> Option<Arc<dyn Capability>> {
        self.entries.get(step_id).cloned()
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.entries.contains_key(step_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build a registry from the `[capabilities.<id>]` config tables.
    pub fn from_config(specs: &BTreeMap<String, CapabilitySpec>) -> Result<Self> {
        let mut registry = Self::new();
        for (id, spec) in specs {
            let capability: Arc<dyn Capability> = match spec {
                CapabilitySpec::Command { program, args, env } => Arc::new(
                    CommandCapability::new(program.clone(), args.clone())
                        .with_env(env.clone()),
                ),
                CapabilitySpec::Http { url, headers } => {
                    Arc::new(HttpCapability::new(url.clone(), headers.clone())?)
                }
            };
            registry.register(id.clone(), capability);
        }
        Ok(registry)
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("ids", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Capability for Echo {
        async fn run(
            &self,
            question: &str,
            _domain: &str,
            _context: &Map<String, Value>,
            _data_source_ids: &[String],
        ) -> Result<Map<String, Value>> {
            let mut out = Map::new();
            out.insert("question".into(), Value::String(question.into()));
            Ok(out)
        }
    }

    #[tokio::test]
    async fn registered_capability_is_invocable() {
        let registry = CapabilityRegistry::new().with("frame", Arc::new(Echo));
        assert!(registry.contains("frame"));
        assert!(!registry.contains("model"));

        let cap = registry.get("frame").unwrap();
        let out = cap.run("why?", "retail", &Map::new(), &[]).await.unwrap();
        assert_eq!(out["question"], "why?");
    }

    #[test]
    fn from_config_builds_each_kind() {
        let mut specs = BTreeMap::new();
        specs.insert(
            "frame".to_string(),
            CapabilitySpec::Command {
                program: "cat".into(),
                args: vec![],
                env: BTreeMap::new(),
            },
        );
        specs.insert(
            "model".to_string(),
            CapabilitySpec::Http {
                url: "http://localhost:9/model".into(),
                headers: BTreeMap::new(),
            },
        );
        let registry = CapabilityRegistry::from_config(&specs).unwrap();
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["frame", "model"]);
    }

    #[test]
    fn parse_result_requires_object() {
        assert!(parse_result(r#"{"a": 1}"#).is_ok());
        let err = parse_result("[1, 2]").unwrap_err();
        assert!(err.to_string().contains("an array"));
        assert!(parse_result("not json").is_err());
    }
}
