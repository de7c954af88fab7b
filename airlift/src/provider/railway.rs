//! Managed-service backend on Railway.
//!
//! Everything goes through GraphQL mutations and queries against the
//! public API. Units are services created from a prebuilt worker image;
//! boot configuration and credentials travel as service variables. The
//! dedicated Railway project scopes which services belong to this system.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::payload::{PayloadSpec, SecretChannel, boot_env};
use crate::provider::{
    AgentState, AgentSummary, DeploymentResult, LaunchRequest, Provider, ProviderKind,
    StatusReport,
};

const API_URL: &str = "https://backboard.railway.com/graphql/v2";

const SERVICE_CREATE: &str = r"
mutation serviceCreate($input: ServiceCreateInput!) {
    serviceCreate(input: $input) { id name }
}";

const SERVICE_DELETE: &str = r"
mutation serviceDelete($id: String!) {
    serviceDelete(id: $id)
}";

const PROJECT_CREATE: &str = r"
mutation projectCreate($input: ProjectCreateInput!) {
    projectCreate(input: $input) { id }
}";

const PROJECT_SERVICES: &str = r"
query getProject($id: String!) {
    project(id: $id) {
        services {
            edges {
                node {
                    id
                    name
                    deployments(first: 1) {
                        edges { node { status staticUrl } }
                    }
                }
            }
        }
    }
}";

const SERVICE_DEPLOYMENTS: &str = r"
query deployments($serviceId: String!) {
    deployments(first: 1, input: { serviceId: $serviceId }) {
        edges { node { id status staticUrl } }
    }
}";

const DEPLOYMENT_LOGS: &str = r"
query deploymentLogs($deploymentId: String!) {
    deploymentLogs(deploymentId: $deploymentId) {
        logs { message timestamp }
    }
}";

/// GraphQL transport to Railway.
pub trait RailwayApi {
    /// Execute one query/mutation; returns the whole response document
    /// (`data` plus any `errors`).
    fn execute(&self, query: &str, variables: Value) -> Result<Value>;
}

/// HTTP implementation with bearer-token auth.
pub struct RestRailwayApi {
    token: String,
    http: Client,
}

impl RestRailwayApi {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            http: Client::builder()
                .timeout(Duration::from_secs(30))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("build HTTP client"),
        }
    }
}

impl RailwayApi for RestRailwayApi {
    #[instrument(skip_all)]
    fn execute(&self, query: &str, variables: Value) -> Result<Value> {
        let response = self
            .http
            .post(API_URL)
            .bearer_auth(&self.token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .context("railway graphql request")?;
        if !response.status().is_success() {
            return Err(anyhow!("railway API error: {}", response.status()));
        }
        response.json().context("parse railway response")
    }
}

/// Native deployment status -> shared vocabulary. Total by fallback.
pub fn map_deployment_status(status: &str) -> AgentState {
    match status {
        "QUEUED" | "INITIALIZING" | "BUILDING" | "DEPLOYING" | "WAITING" => AgentState::Starting,
        "SUCCESS" => AgentState::Running,
        "CRASHED" | "FAILED" => AgentState::Failed,
        "REMOVED" | "REMOVING" | "SLEEPING" | "SKIPPED" => AgentState::Stopped,
        _ => AgentState::Unknown,
    }
}

/// Railway-backed provider.
pub struct RailwayProvider {
    project_id: RefCell<Option<String>>,
    image: String,
    harness_url: String,
    /// agent id -> service id, filled by launches and listings.
    service_map: RefCell<HashMap<String, String>>,
    api: Box<dyn RailwayApi>,
}

impl RailwayProvider {
    pub fn new(config: &Config) -> Result<Self> {
        let token = config
            .railway_token
            .clone()
            .ok_or_else(|| anyhow!("Railway token not configured: set RAILWAY_TOKEN"))?;
        Ok(Self::with_api(config, Box::new(RestRailwayApi::new(token))))
    }

    pub fn with_api(config: &Config, api: Box<dyn RailwayApi>) -> Self {
        Self {
            project_id: RefCell::new(config.railway_project_id.clone()),
            image: config.docker_image.clone(),
            harness_url: config.harness_url.clone(),
            service_map: RefCell::new(HashMap::new()),
            api,
        }
    }

    /// Response-level GraphQL errors become plain error strings.
    fn first_error(body: &Value) -> Option<String> {
        body["errors"][0]["message"].as_str().map(str::to_string)
    }

    fn ensure_project(&self) -> Result<String> {
        if let Some(id) = self.project_id.borrow().clone() {
            return Ok(id);
        }
        info!("creating railway project for agents");
        let body = self
            .api
            .execute(PROJECT_CREATE, json!({ "input": { "name": "airlift-agents" } }))?;
        if let Some(message) = Self::first_error(&body) {
            return Err(anyhow!("project create failed: {message}"));
        }
        let id = body["data"]["projectCreate"]["id"]
            .as_str()
            .ok_or_else(|| anyhow!("project create returned no id"))?
            .to_string();
        *self.project_id.borrow_mut() = Some(id.clone());
        Ok(id)
    }

    /// Service id for an agent: cache first, then a project-wide lookup.
    fn service_id(&self, agent_id: &str) -> Option<String> {
        if let Some(id) = self.service_map.borrow().get(agent_id) {
            return Some(id.clone());
        }
        let project_id = self.project_id.borrow().clone()?;
        let body = self
            .api
            .execute(PROJECT_SERVICES, json!({ "id": project_id }))
            .ok()?;
        let edges = body["data"]["project"]["services"]["edges"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        for edge in &edges {
            let node = &edge["node"];
            if let (Some(name), Some(id)) = (node["name"].as_str(), node["id"].as_str()) {
                self.service_map
                    .borrow_mut()
                    .insert(name.to_string(), id.to_string());
            }
        }
        self.service_map.borrow().get(agent_id).cloned()
    }

    fn latest_deployment(&self, service_id: &str) -> Result<Option<Value>> {
        let body = self
            .api
            .execute(SERVICE_DEPLOYMENTS, json!({ "serviceId": service_id }))?;
        if let Some(message) = Self::first_error(&body) {
            return Err(anyhow!("deployments query failed: {message}"));
        }
        Ok(body["data"]["deployments"]["edges"][0]["node"].as_object().map(|node| Value::Object(node.clone())))
    }

    fn try_launch(&self, request: &LaunchRequest) -> Result<DeploymentResult> {
        let project_id = self.ensure_project()?;

        let payload = PayloadSpec {
            agent_id: request.agent_id.clone(),
            task_spec: request.task_spec.clone(),
            // Managed workers keep their state inside the service; status
            // comes from deployment state, logs from the deployment log
            // query.
            store_uri: "/workspace/store".to_string(),
            repo: request.options.repo.clone(),
            branch: request.options.branch.clone(),
            max_iterations: request.options.max_iterations,
            keep_alive: request.options.keep_alive,
            harness_url: self.harness_url.clone(),
            secret_channel: SecretChannel::UnitEnv,
        };
        let variables: serde_json::Map<String, Value> = boot_env(&payload, &request.credentials)
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();

        let input = json!({
            "name": request.agent_id,
            "projectId": project_id,
            "source": { "image": self.image },
            "variables": variables,
        });

        info!(agent_id = %request.agent_id, "creating railway service");
        let body = self.api.execute(SERVICE_CREATE, json!({ "input": input }))?;
        if let Some(message) = Self::first_error(&body) {
            return Ok(DeploymentResult::failed(
                request.agent_id.clone(),
                ProviderKind::Railway,
                message,
            ));
        }
        if let Some(service_id) = body["data"]["serviceCreate"]["id"].as_str() {
            self.service_map
                .borrow_mut()
                .insert(request.agent_id.clone(), service_id.to_string());
        }

        Ok(DeploymentResult::launching(
            request.agent_id.clone(),
            ProviderKind::Railway,
        ))
    }
}

impl Provider for RailwayProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Railway
    }

    fn launch(&self, request: &LaunchRequest) -> DeploymentResult {
        match self.try_launch(request) {
            Ok(result) => result,
            Err(err) => {
                warn!(agent_id = %request.agent_id, err = %err, "launch failed");
                DeploymentResult::failed(
                    request.agent_id.clone(),
                    ProviderKind::Railway,
                    format!("{err:#}"),
                )
            }
        }
    }

    fn status(&self, agent_id: &str) -> StatusReport {
        let Some(service_id) = self.service_id(agent_id) else {
            return StatusReport::not_found(agent_id);
        };

        match self.latest_deployment(&service_id) {
            Ok(Some(deployment)) => {
                let native = deployment["status"].as_str().unwrap_or("UNKNOWN").to_string();
                debug!(agent_id, native = %native, "deployment status");
                StatusReport {
                    agent_id: agent_id.to_string(),
                    state: map_deployment_status(&native),
                    store_status: None,
                    unit_state: Some(native),
                    address: deployment["staticUrl"].as_str().map(str::to_string),
                    progress: None,
                    error: None,
                }
            }
            Ok(None) => StatusReport {
                agent_id: agent_id.to_string(),
                state: AgentState::Starting,
                store_status: None,
                unit_state: Some("NO_DEPLOYMENT".to_string()),
                address: None,
                progress: None,
                error: None,
            },
            Err(err) => StatusReport {
                agent_id: agent_id.to_string(),
                state: AgentState::Unknown,
                store_status: None,
                unit_state: None,
                address: None,
                progress: None,
                error: Some(format!("{err:#}")),
            },
        }
    }

    fn logs(&self, agent_id: &str) -> Option<String> {
        let service_id = self.service_id(agent_id)?;
        let deployment = self.latest_deployment(&service_id).ok().flatten()?;
        let deployment_id = deployment["id"].as_str()?;

        let body = self
            .api
            .execute(DEPLOYMENT_LOGS, json!({ "deploymentId": deployment_id }))
            .ok()?;
        let logs = body["data"]["deploymentLogs"]["logs"].as_array()?;
        if logs.is_empty() {
            return None;
        }
        Some(
            logs.iter()
                .filter_map(|entry| entry["message"].as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    fn stop(&self, agent_id: &str) -> bool {
        let Some(service_id) = self.service_id(agent_id) else {
            // No such service: the unit is already gone.
            return true;
        };
        match self.api.execute(SERVICE_DELETE, json!({ "id": service_id })) {
            Ok(body) => {
                if let Some(message) = Self::first_error(&body) {
                    warn!(agent_id, message = %message, "service delete failed");
                    return false;
                }
                self.service_map.borrow_mut().remove(agent_id);
                true
            }
            Err(err) => {
                warn!(agent_id, err = %err, "service delete failed");
                false
            }
        }
    }

    fn list_agents(&self) -> Vec<AgentSummary> {
        let Some(project_id) = self.project_id.borrow().clone() else {
            return Vec::new();
        };
        let body = match self.api.execute(PROJECT_SERVICES, json!({ "id": project_id })) {
            Ok(body) => body,
            Err(err) => {
                warn!(err = %err, "service list failed");
                return Vec::new();
            }
        };

        let edges = body["data"]["project"]["services"]["edges"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        edges
            .iter()
            .filter_map(|edge| {
                let node = &edge["node"];
                // Entries without id/name are malformed; skip them.
                let name = node["name"].as_str()?.to_string();
                let service_id = node["id"].as_str()?.to_string();
                self.service_map
                    .borrow_mut()
                    .insert(name.clone(), service_id);

                let deployment = &node["deployments"]["edges"][0]["node"];
                let state = deployment["status"]
                    .as_str()
                    .map(map_deployment_status)
                    .unwrap_or(AgentState::Unknown);
                Some(AgentSummary {
                    name,
                    state,
                    address: deployment["staticUrl"].as_str().map(str::to_string),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_status_mapping_is_total() {
        let table = [
            ("QUEUED", AgentState::Starting),
            ("INITIALIZING", AgentState::Starting),
            ("BUILDING", AgentState::Starting),
            ("DEPLOYING", AgentState::Starting),
            ("WAITING", AgentState::Starting),
            ("SUCCESS", AgentState::Running),
            ("CRASHED", AgentState::Failed),
            ("FAILED", AgentState::Failed),
            ("REMOVED", AgentState::Stopped),
            ("REMOVING", AgentState::Stopped),
            ("SLEEPING", AgentState::Stopped),
            ("SKIPPED", AgentState::Stopped),
            ("NEW_HOTNESS", AgentState::Unknown),
        ];
        for (native, expected) in table {
            assert_eq!(map_deployment_status(native), expected, "{native}");
        }
    }
}
