//! HTTP collaborators of the inference ledger.
//!
//! Two external processes sit behind this crate: the hosted model's
//! serving endpoint (prediction requests) and the deployment service that
//! hosts and updates model versions. Both are reached over plain
//! JSON-over-HTTP with bounded timeouts; neither call is ever retried
//! here.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use inference_ledger_core::BackendConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

/// Client for the serving endpoint of the hosted model.
#[derive(Debug, Clone)]
pub struct EndpointClient {
    target: String,
    timeout: Duration,
}

impl EndpointClient {
    #[must_use]
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(&config.target, Duration::from_millis(config.timeout_ms))
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Sends one prediction request, wrapping the payload in the serving
    /// envelope `{"inputs": payload}`.
    ///
    /// # Errors
    /// Returns an error on transport failure, a non-2xx status, or an
    /// undecodable response body. The timeout bounds the whole call.
    pub fn invoke(&self, payload: &Value) -> Result<Value> {
        info!(endpoint = %self.target, "running prediction");

        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
        let response = agent
            .post(&self.target)
            .set("content-type", "application/json")
            .send_json(&json!({ "inputs": payload }))
            .map_err(|err| anyhow!("prediction request to {} failed: {err}", self.target))?;

        response
            .into_json()
            .context("failed to decode prediction response")
    }
}

/// One deployment as the deployment service reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub name: String,
    pub model_uri: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// The configuration sent when creating or updating a deployment. The
/// model version travels as a tag so later calls can detect whether the
/// requested version is already running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentSpec {
    pub name: String,
    pub model_uri: String,
    pub tags: BTreeMap<String, String>,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_capture_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_role: Option<String>,
}

impl DeploymentSpec {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        model_uri: impl Into<String>,
        model_version: &str,
        region: impl Into<String>,
    ) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("version".to_string(), model_version.to_string());
        Self {
            name: name.into(),
            model_uri: model_uri.into(),
            tags,
            region: region.into(),
            data_capture_uri: None,
            execution_role: None,
        }
    }

    #[must_use]
    pub fn with_data_capture_uri(mut self, uri: Option<String>) -> Self {
        self.data_capture_uri = uri;
        self
    }

    #[must_use]
    pub fn with_execution_role(mut self, role: Option<String>) -> Self {
        self.execution_role = role;
        self
    }
}

/// The action `ensure_deployed` ended up taking.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeployOutcome {
    AlreadyCurrent,
    Updated,
    Created,
}

/// Client for the deployment service's management API.
#[derive(Debug, Clone)]
pub struct DeploymentClient {
    api: String,
    timeout: Duration,
}

impl DeploymentClient {
    #[must_use]
    pub fn new(api: impl Into<String>, timeout: Duration) -> Self {
        let api = api.into();
        Self {
            api: api.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn agent(&self) -> ureq::Agent {
        ureq::AgentBuilder::new().timeout(self.timeout).build()
    }

    fn deployment_url(&self, name: &str) -> String {
        format!("{}/deployments/{name}", self.api)
    }

    /// Fetches the deployment with the given name, or `None` when the
    /// service does not know it.
    ///
    /// # Errors
    /// Returns an error on transport failure or an unexpected status.
    pub fn get_deployment(&self, name: &str) -> Result<Option<DeploymentRecord>> {
        let url = self.deployment_url(name);
        match self.agent().get(&url).call() {
            Ok(response) => {
                let record: DeploymentRecord = response
                    .into_json()
                    .context("failed to decode deployment record")?;
                Ok(Some(record))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(err) => Err(anyhow!("failed to fetch deployment {name}: {err}")),
        }
    }

    /// # Errors
    /// Returns an error when the service rejects the create request.
    pub fn create_deployment(&self, spec: &DeploymentSpec) -> Result<()> {
        info!(name = %spec.name, "creating deployment");
        let url = format!("{}/deployments", self.api);
        self.agent()
            .post(&url)
            .set("content-type", "application/json")
            .send_json(spec)
            .map_err(|err| anyhow!("failed to create deployment {}: {err}", spec.name))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the service rejects the update request.
    pub fn update_deployment(&self, spec: &DeploymentSpec) -> Result<()> {
        info!(name = %spec.name, "updating deployment");
        let url = self.deployment_url(&spec.name);
        self.agent()
            .put(&url)
            .set("content-type", "application/json")
            .send_json(spec)
            .map_err(|err| anyhow!("failed to update deployment {}: {err}", spec.name))?;
        Ok(())
    }

    /// Idempotent create-or-update: skips when the deployment already runs
    /// the requested model version (detected via its `version` tag),
    /// updates it in place otherwise, and creates it fresh when absent.
    ///
    /// # Errors
    /// Returns an error when any call to the deployment service fails.
    pub fn ensure_deployed(&self, spec: &DeploymentSpec) -> Result<DeployOutcome> {
        let requested_version = spec.tags.get("version").map(String::as_str);

        match self.get_deployment(&spec.name)? {
            Some(existing) => {
                let running_version = existing.tags.get("version").map(String::as_str);
                if requested_version.is_some() && running_version == requested_version {
                    info!(
                        name = %spec.name,
                        version = requested_version.unwrap_or(""),
                        "deployment already runs the requested model version"
                    );
                    return Ok(DeployOutcome::AlreadyCurrent);
                }
                self.update_deployment(spec)?;
                Ok(DeployOutcome::Updated)
            }
            None => {
                self.create_deployment(spec)?;
                Ok(DeployOutcome::Created)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_spec_carries_the_version_tag() {
        let spec = DeploymentSpec::new("penguins", "models:/penguins/7", "7", "us-east-1")
            .with_data_capture_uri(Some("root/data-capture".to_string()))
            .with_execution_role(None);

        assert_eq!(spec.tags.get("version").map(String::as_str), Some("7"));
        assert_eq!(spec.data_capture_uri.as_deref(), Some("root/data-capture"));
        assert!(spec.execution_role.is_none());

        let body = match serde_json::to_value(&spec) {
            Ok(value) => value,
            Err(err) => panic!("spec must serialize: {err}"),
        };
        assert_eq!(body["tags"]["version"], "7");
        // Skipped optionals must not appear in the wire body at all.
        assert!(body.get("execution_role").is_none());
    }

    #[test]
    fn deployment_client_normalizes_trailing_slashes() {
        let client = DeploymentClient::new("http://127.0.0.1:9/api/", Duration::from_millis(50));
        assert_eq!(
            client.deployment_url("penguins"),
            "http://127.0.0.1:9/api/deployments/penguins"
        );
    }

    #[test]
    fn invoke_surfaces_transport_failures() {
        // Port 9 (discard) is not listening; the call must fail fast
        // rather than hang.
        let client = EndpointClient::new("http://127.0.0.1:9/invocations", Duration::from_millis(200));
        assert!(client.invoke(&serde_json::json!([{"island": "Biscoe"}])).is_err());
    }
}
