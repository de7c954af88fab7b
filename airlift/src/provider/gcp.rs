//! VM-based backend on GCE.
//!
//! The classic create-and-wait shape: insert an instance, poll the zone
//! operation until it is DONE, and read live state back with get/list.
//! Credentials ride as instance metadata attributes; the worker state
//! lives in GCS.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::payload::{PayloadSpec, SecretChannel, render_startup_script};
use crate::provider::{
    AGENT_ID_TAG, AgentState, AgentSummary, DeploymentResult, LaunchRequest, Provider,
    ProviderKind, StatusReport, UNIT_TAG,
};
use crate::store::{
    GcloudTokenSource, GcsStore, StateStore, TokenSource, read_agent_state, reconcile,
};

const COMPUTE_API: &str = "https://compute.googleapis.com/compute/v1";
const UBUNTU_IMAGE: &str = "projects/ubuntu-os-cloud/global/images/family/ubuntu-2204-lts";
const BOOT_DISK_GB: u32 = 50;

/// Live view of one GCE instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    pub status: String,
    pub external_ip: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Minimal Compute Engine surface the adapter needs.
pub trait ComputeApi {
    /// Insert an instance; returns the zone operation name.
    fn insert(&self, instance: &Value) -> Result<String>;

    /// Block until the named zone operation is DONE.
    fn wait_operation(&self, operation: &str) -> Result<()>;

    fn get(&self, name: &str) -> Result<Option<Instance>>;

    /// Delete an instance; `None` when it does not exist.
    fn delete(&self, name: &str) -> Result<Option<String>>;

    fn list(&self, filter: &str) -> Result<Vec<Instance>>;
}

/// REST implementation over the Compute Engine v1 API.
pub struct RestComputeApi {
    project: String,
    zone: String,
    http: Client,
    tokens: Box<dyn TokenSource>,
}

impl RestComputeApi {
    pub fn new(project: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            http: Client::builder()
                .timeout(Duration::from_secs(60))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("build HTTP client"),
            tokens: Box::new(GcloudTokenSource),
        }
    }

    fn zone_url(&self, suffix: &str) -> String {
        format!(
            "{COMPUTE_API}/projects/{}/zones/{}/{suffix}",
            self.project, self.zone
        )
    }
}

impl ComputeApi for RestComputeApi {
    #[instrument(skip_all)]
    fn insert(&self, instance: &Value) -> Result<String> {
        let response = self
            .http
            .post(self.zone_url("instances"))
            .bearer_auth(self.tokens.access_token()?)
            .json(instance)
            .send()
            .context("instance insert")?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "instance insert failed: {}: {}",
                response.status(),
                response.text().unwrap_or_default()
            ));
        }
        let body: Value = response.json().context("parse insert response")?;
        body["name"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("insert response missing operation name"))
    }

    #[instrument(skip(self))]
    fn wait_operation(&self, operation: &str) -> Result<()> {
        // The wait endpoint blocks server-side for up to two minutes;
        // a handful of rounds covers slow creates.
        for _ in 0..5 {
            let response = self
                .http
                .post(self.zone_url(&format!("operations/{operation}/wait")))
                .bearer_auth(self.tokens.access_token()?)
                .send()
                .context("operation wait")?;
            if !response.status().is_success() {
                return Err(anyhow!("operation wait failed: {}", response.status()));
            }
            let body: Value = response.json().context("parse operation")?;
            if body["status"].as_str() == Some("DONE") {
                if let Some(error) = body["error"]["errors"][0]["message"].as_str() {
                    return Err(anyhow!("operation failed: {error}"));
                }
                return Ok(());
            }
            debug!(operation, "operation still running");
        }
        Err(anyhow!("operation {operation} did not finish in time"))
    }

    fn get(&self, name: &str) -> Result<Option<Instance>> {
        let response = self
            .http
            .get(self.zone_url(&format!("instances/{name}")))
            .bearer_auth(self.tokens.access_token()?)
            .send()
            .context("instance get")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow!("instance get failed: {}", response.status()));
        }
        let body: Value = response.json().context("parse instance")?;
        Ok(parse_instance(&body))
    }

    fn delete(&self, name: &str) -> Result<Option<String>> {
        let response = self
            .http
            .delete(self.zone_url(&format!("instances/{name}")))
            .bearer_auth(self.tokens.access_token()?)
            .send()
            .context("instance delete")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow!("instance delete failed: {}", response.status()));
        }
        let body: Value = response.json().context("parse delete response")?;
        Ok(body["name"].as_str().map(str::to_string))
    }

    fn list(&self, filter: &str) -> Result<Vec<Instance>> {
        let response = self
            .http
            .get(self.zone_url("instances"))
            .query(&[("filter", filter)])
            .bearer_auth(self.tokens.access_token()?)
            .send()
            .context("instance list")?;
        if !response.status().is_success() {
            return Err(anyhow!("instance list failed: {}", response.status()));
        }
        let body: Value = response.json().context("parse instance list")?;
        let items = body["items"].as_array().cloned().unwrap_or_default();
        Ok(items.iter().filter_map(parse_instance).collect())
    }
}

/// Pull the fields the adapter uses out of an instance resource. Entries
/// without a name are malformed and dropped.
fn parse_instance(body: &Value) -> Option<Instance> {
    let name = body["name"].as_str()?.to_string();
    let status = body["status"].as_str().unwrap_or("UNKNOWN").to_string();
    let external_ip = body["networkInterfaces"][0]["accessConfigs"][0]["natIP"]
        .as_str()
        .map(str::to_string);
    let labels = body["labels"]
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Some(Instance {
        name,
        status,
        external_ip,
        labels,
    })
}

/// Native GCE instance status -> shared vocabulary. Total by fallback.
pub fn map_instance_status(status: &str) -> AgentState {
    match status {
        "PROVISIONING" | "STAGING" => AgentState::Starting,
        "RUNNING" => AgentState::Running,
        "STOPPING" | "SUSPENDING" | "SUSPENDED" | "STOPPED" | "TERMINATED" => AgentState::Stopped,
        _ => AgentState::Unknown,
    }
}

/// GCE-backed provider.
pub struct GcpProvider {
    zone: String,
    region: String,
    machine_type: String,
    bucket: String,
    harness_url: String,
    api: Box<dyn ComputeApi>,
    store: Box<dyn StateStore>,
}

impl GcpProvider {
    pub fn new(config: &Config) -> Result<Self> {
        let project = config
            .gcp_project
            .clone()
            .ok_or_else(|| anyhow!("GCP project not configured: set AIRLIFT_PROJECT"))?;
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| anyhow!("state bucket not configured: set AIRLIFT_BUCKET"))?;
        let api = RestComputeApi::new(project.clone(), config.gcp_zone.clone());
        let store = GcsStore::new(bucket.clone(), project);
        Ok(Self::with_parts(config, bucket, Box::new(api), Box::new(store)))
    }

    /// Assemble a provider over explicit transports (tests, alternative
    /// token sources).
    pub fn with_parts(
        config: &Config,
        bucket: String,
        api: Box<dyn ComputeApi>,
        store: Box<dyn StateStore>,
    ) -> Self {
        Self {
            zone: config.gcp_zone.clone(),
            region: config.gcp_region(),
            machine_type: config.machine_type.clone(),
            bucket,
            harness_url: config.harness_url.clone(),
            api,
            store,
        }
    }

    fn try_launch(&self, request: &LaunchRequest) -> Result<DeploymentResult> {
        self.store.ensure_bucket(&self.region)?;

        let payload = PayloadSpec {
            agent_id: request.agent_id.clone(),
            task_spec: request.task_spec.clone(),
            store_uri: format!("gs://{}", self.bucket),
            repo: request.options.repo.clone(),
            branch: request.options.branch.clone(),
            max_iterations: request.options.max_iterations,
            keep_alive: request.options.keep_alive,
            harness_url: self.harness_url.clone(),
            secret_channel: SecretChannel::GcpMetadata,
        };
        let startup_script = render_startup_script(&payload)?;

        let mut metadata = vec![("startup-script".to_string(), startup_script)];
        metadata.extend(request.credentials.side_channel_items());

        let body = instance_body(
            &request.agent_id,
            &self.zone,
            &self.machine_type,
            &metadata,
            request.options.spot,
        );

        info!(agent_id = %request.agent_id, zone = %self.zone, "creating instance");
        let operation = self.api.insert(&body)?;
        self.api.wait_operation(&operation)?;

        Ok(DeploymentResult::launching(
            request.agent_id.clone(),
            ProviderKind::Gcp,
        ))
    }
}

/// Build the instance resource for one agent unit.
fn instance_body(
    name: &str,
    zone: &str,
    machine_type: &str,
    metadata: &[(String, String)],
    spot: bool,
) -> Value {
    let items: Vec<Value> = metadata
        .iter()
        .map(|(key, value)| json!({ "key": key, "value": value }))
        .collect();

    let mut body = json!({
        "name": name,
        "machineType": format!("zones/{zone}/machineTypes/{machine_type}"),
        "disks": [{
            "boot": true,
            "autoDelete": true,
            "initializeParams": {
                "sourceImage": UBUNTU_IMAGE,
                "diskSizeGb": BOOT_DISK_GB,
            },
        }],
        "networkInterfaces": [{
            "network": "global/networks/default",
            "accessConfigs": [{ "type": "ONE_TO_ONE_NAT", "name": "External NAT" }],
        }],
        "metadata": { "items": items },
        "labels": { UNIT_TAG: "true", AGENT_ID_TAG: name },
        "serviceAccounts": [{
            "email": "default",
            "scopes": ["https://www.googleapis.com/auth/cloud-platform"],
        }],
    });
    if spot {
        body["scheduling"] = json!({
            "provisioningModel": "SPOT",
            "instanceTerminationAction": "DELETE",
        });
    }
    body
}

impl Provider for GcpProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gcp
    }

    fn launch(&self, request: &LaunchRequest) -> DeploymentResult {
        match self.try_launch(request) {
            Ok(result) => result,
            Err(err) => {
                warn!(agent_id = %request.agent_id, err = %err, "launch failed");
                DeploymentResult::failed(
                    request.agent_id.clone(),
                    ProviderKind::Gcp,
                    format!("{err:#}"),
                )
            }
        }
    }

    fn status(&self, agent_id: &str) -> StatusReport {
        let store_state = read_agent_state(self.store.as_ref(), agent_id);

        let (unit, error) = match self.api.get(agent_id) {
            Ok(unit) => (unit, None),
            Err(err) => (None, Some(format!("{err:#}"))),
        };
        let unit_mapped = unit.as_ref().map(|i| map_instance_status(&i.status));

        StatusReport {
            agent_id: agent_id.to_string(),
            state: if error.is_some() {
                AgentState::Unknown
            } else {
                reconcile(store_state.status, unit_mapped)
            },
            store_status: store_state.status,
            unit_state: unit.as_ref().map(|i| i.status.clone()),
            address: unit.as_ref().and_then(|i| i.external_ip.clone()),
            progress: store_state.progress,
            error,
        }
    }

    fn logs(&self, agent_id: &str) -> Option<String> {
        self.store
            .download(&airlift_harness::state::agent_log_key(agent_id))
            .ok()
            .flatten()
    }

    fn stop(&self, agent_id: &str) -> bool {
        match self.api.delete(agent_id) {
            // Absence is success: the unit is gone either way.
            Ok(None) => true,
            Ok(Some(operation)) => match self.api.wait_operation(&operation) {
                Ok(()) => true,
                Err(err) => {
                    warn!(agent_id, err = %err, "delete operation failed");
                    false
                }
            },
            Err(err) => {
                warn!(agent_id, err = %err, "instance delete failed");
                false
            }
        }
    }

    fn list_agents(&self) -> Vec<AgentSummary> {
        let filter = format!("labels.{UNIT_TAG}=true");
        let instances = match self.api.list(&filter) {
            Ok(instances) => instances,
            Err(err) => {
                warn!(err = %err, "instance list failed");
                return Vec::new();
            }
        };
        instances
            .into_iter()
            .filter_map(|instance| {
                // Foreign or malformed units carry no agent-id tag; skip.
                let name = instance.labels.get(AGENT_ID_TAG)?.clone();
                Some(AgentSummary {
                    name,
                    state: map_instance_status(&instance.status),
                    address: instance.external_ip,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_total_over_known_states() {
        let table = [
            ("PROVISIONING", AgentState::Starting),
            ("STAGING", AgentState::Starting),
            ("RUNNING", AgentState::Running),
            ("STOPPING", AgentState::Stopped),
            ("SUSPENDING", AgentState::Stopped),
            ("SUSPENDED", AgentState::Stopped),
            ("STOPPED", AgentState::Stopped),
            ("TERMINATED", AgentState::Stopped),
            ("REPAIRING", AgentState::Unknown),
            ("SOMETHING_NEW", AgentState::Unknown),
        ];
        for (native, expected) in table {
            assert_eq!(map_instance_status(native), expected, "{native}");
        }
    }

    #[test]
    fn instance_body_carries_metadata_labels_and_spot() {
        let metadata = vec![
            ("startup-script".to_string(), "#!/bin/bash".to_string()),
            ("auth-type".to_string(), "api_key".to_string()),
        ];
        let body = instance_body("agent-x", "us-central1-a", "e2-medium", &metadata, true);

        assert_eq!(body["name"], "agent-x");
        assert_eq!(
            body["machineType"],
            "zones/us-central1-a/machineTypes/e2-medium"
        );
        assert_eq!(body["metadata"]["items"][0]["key"], "startup-script");
        assert_eq!(body["metadata"]["items"][1]["key"], "auth-type");
        assert_eq!(body["labels"][UNIT_TAG], "true");
        assert_eq!(body["labels"][AGENT_ID_TAG], "agent-x");
        assert_eq!(body["scheduling"]["provisioningModel"], "SPOT");

        let on_demand = instance_body("agent-x", "us-central1-a", "e2-medium", &metadata, false);
        assert!(on_demand.get("scheduling").is_none());
    }

    #[test]
    fn parse_instance_drops_nameless_entries() {
        let valid = serde_json::json!({
            "name": "agent-x",
            "status": "RUNNING",
            "labels": { "airlift": "true", "airlift-agent-id": "agent-x" },
            "networkInterfaces": [{ "accessConfigs": [{ "natIP": "34.1.2.3" }] }],
        });
        let parsed = parse_instance(&valid).expect("parse");
        assert_eq!(parsed.external_ip.as_deref(), Some("34.1.2.3"));
        assert_eq!(parsed.labels.get(AGENT_ID_TAG).map(String::as_str), Some("agent-x"));

        assert!(parse_instance(&serde_json::json!({ "status": "RUNNING" })).is_none());
    }
}
