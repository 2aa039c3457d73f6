//! HTTP-backed capability.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use tracing::debug;

use super::{Capability, CapabilityRequest, parse_result};

/// Analytical steps can run long; this only guards against a dead peer.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// POSTs the request as JSON and expects a 2xx response whose body is a JSON
/// object.
#[derive(Debug, Clone)]
pub struct HttpCapability {
    client: reqwest::Client,
    url: String,
}

impl HttpCapability {
    pub fn new(url: String, headers: BTreeMap<String, String>) -> Result<Self> {
        let mut header_map = HeaderMap::new();
        for (name, value) in &headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid header name '{}'", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid value for header '{}'", name))?;
            header_map.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Capability for HttpCapability {
    async fn run(
        &self,
        question: &str,
        domain: &str,
        context: &Map<String, Value>,
        data_source_ids: &[String],
    ) -> Result<Map<String, Value>> {
        debug!(url = %self.url, "calling capability endpoint");
        let response = self
            .client
            .post(&self.url)
            .json(&CapabilityRequest {
                question,
                domain,
                context,
                data_source_ids,
            })
            .send()
            .await
            .with_context(|| format!("Request to {} failed", self.url))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read capability response")?;
        if !status.is_success() {
            let excerpt: String = body.chars().take(500).collect();
            anyhow::bail!("{} returned {}: {}", self.url, status, excerpt);
        }
        parse_result(&body)
    }
}
