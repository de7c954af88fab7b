//! Container-based backend on the local Docker daemon.
//!
//! No cloud account required: units are containers from a prebuilt worker
//! image, boot configuration travels as container environment, and the
//! state store is a directory tree volume-mounted into every unit.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::payload::{PayloadSpec, SecretChannel, boot_env};
use crate::provider::cli::{CliRunner, SystemCli};
use crate::provider::{
    AGENT_ID_TAG, AgentState, AgentSummary, DeploymentResult, LaunchRequest, Provider,
    ProviderKind, StatusReport, UNIT_TAG,
};
use crate::store::{LocalStore, StateStore, read_agent_state, reconcile};

/// Mount point of the state directory inside a unit.
const CONTAINER_STORE: &str = "/workspace/store";

/// Native container status -> shared vocabulary. Exited containers need
/// the exit code to tell completion from failure. Total by fallback.
pub fn map_container_status(status: &str, exit_code: i64) -> AgentState {
    match status {
        "created" | "restarting" => AgentState::Starting,
        "running" => AgentState::Running,
        "paused" | "removing" => AgentState::Stopped,
        "exited" => {
            if exit_code == 0 {
                AgentState::Completed
            } else {
                AgentState::Failed
            }
        }
        "dead" => AgentState::Failed,
        _ => AgentState::Unknown,
    }
}

/// Docker-backed provider.
pub struct DockerProvider {
    image: String,
    data_dir: PathBuf,
    harness_url: String,
    cli: Box<dyn CliRunner>,
    store: Box<dyn StateStore>,
}

impl DockerProvider {
    pub fn new(config: &Config) -> Self {
        let store = LocalStore::new(config.docker_data_dir.join("store"));
        Self::with_parts(config, Box::new(SystemCli::new("docker")), Box::new(store))
    }

    pub fn with_parts(
        config: &Config,
        cli: Box<dyn CliRunner>,
        store: Box<dyn StateStore>,
    ) -> Self {
        Self {
            image: config.docker_image.clone(),
            data_dir: config.docker_data_dir.clone(),
            harness_url: config.harness_url.clone(),
            cli,
            store,
        }
    }

    fn ensure_image(&self) -> Result<()> {
        let inspect = self.cli.invoke(&["image", "inspect", &self.image])?;
        if inspect.success {
            return Ok(());
        }
        info!(image = %self.image, "pulling worker image");
        let pull = self.cli.invoke(&["pull", &self.image])?;
        if !pull.success {
            return Err(anyhow!(
                "worker image '{}' not available: {}",
                self.image,
                pull.stderr.trim()
            ));
        }
        Ok(())
    }

    fn inspect(&self, agent_id: &str) -> Result<Option<(String, i64)>> {
        let output = self.cli.invoke(&["container", "inspect", agent_id])?;
        if !output.success {
            if output.stderr.contains("No such container") {
                return Ok(None);
            }
            return Err(anyhow!("container inspect failed: {}", output.stderr.trim()));
        }
        let parsed: Value = serde_json::from_str(&output.stdout)?;
        let state = &parsed[0]["State"];
        let status = state["Status"].as_str().unwrap_or("unknown").to_string();
        let exit_code = state["ExitCode"].as_i64().unwrap_or(0);
        Ok(Some((status, exit_code)))
    }

    fn try_launch(&self, request: &LaunchRequest) -> Result<DeploymentResult> {
        self.ensure_image()?;
        self.store.ensure_bucket("local")?;

        // Duplicate names are an explicit error, not a silent replace.
        if self.inspect(&request.agent_id)?.is_some() {
            return Err(anyhow!(
                "container '{}' already exists (stop it first)",
                request.agent_id
            ));
        }

        let payload = PayloadSpec {
            agent_id: request.agent_id.clone(),
            task_spec: request.task_spec.clone(),
            store_uri: CONTAINER_STORE.to_string(),
            repo: request.options.repo.clone(),
            branch: request.options.branch.clone(),
            max_iterations: request.options.max_iterations,
            keep_alive: request.options.keep_alive,
            harness_url: self.harness_url.clone(),
            secret_channel: SecretChannel::UnitEnv,
        };
        let env = boot_env(&payload, &request.credentials);

        let volume = format!("{}:/workspace", self.data_dir.display());
        let unit_label = format!("{UNIT_TAG}=true");
        let id_label = format!("{AGENT_ID_TAG}={}", request.agent_id);
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            request.agent_id.clone(),
            "--restart".into(),
            "unless-stopped".into(),
            "--label".into(),
            unit_label,
            "--label".into(),
            id_label,
            "-v".into(),
            volume,
        ];
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(self.image.clone());

        info!(agent_id = %request.agent_id, image = %self.image, "starting container");
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let run = self.cli.invoke(&arg_refs)?;
        if !run.success {
            return Err(anyhow!("docker run failed: {}", run.stderr.trim()));
        }

        Ok(DeploymentResult::launching(
            request.agent_id.clone(),
            ProviderKind::Docker,
        ))
    }
}

impl Provider for DockerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Docker
    }

    fn launch(&self, request: &LaunchRequest) -> DeploymentResult {
        match self.try_launch(request) {
            Ok(result) => result,
            Err(err) => {
                warn!(agent_id = %request.agent_id, err = %err, "launch failed");
                DeploymentResult::failed(
                    request.agent_id.clone(),
                    ProviderKind::Docker,
                    format!("{err:#}"),
                )
            }
        }
    }

    fn status(&self, agent_id: &str) -> StatusReport {
        let store_state = read_agent_state(self.store.as_ref(), agent_id);

        let (unit, error) = match self.inspect(agent_id) {
            Ok(unit) => (unit, None),
            Err(err) => (None, Some(format!("{err:#}"))),
        };
        let unit_mapped = unit
            .as_ref()
            .map(|(status, exit_code)| map_container_status(status, *exit_code));

        StatusReport {
            agent_id: agent_id.to_string(),
            state: if error.is_some() {
                AgentState::Unknown
            } else {
                reconcile(store_state.status, unit_mapped)
            },
            store_status: store_state.status,
            unit_state: unit.map(|(status, _)| status),
            address: None,
            progress: store_state.progress,
            error,
        }
    }

    fn logs(&self, agent_id: &str) -> Option<String> {
        match self.cli.invoke(&["logs", "--tail", "500", agent_id]) {
            Ok(output) if output.success => {
                let mut text = output.stdout;
                text.push_str(&output.stderr);
                Some(text)
            }
            // Container gone: fall back to the synced log in the store.
            _ => self
                .store
                .download(&airlift_harness::state::agent_log_key(agent_id))
                .ok()
                .flatten(),
        }
    }

    fn stop(&self, agent_id: &str) -> bool {
        match self.cli.invoke(&["rm", "-f", agent_id]) {
            Ok(output) if output.success => true,
            // Already removed: still a success.
            Ok(output) if output.stderr.contains("No such container") => true,
            Ok(output) => {
                warn!(agent_id, stderr = %output.stderr.trim(), "container remove failed");
                false
            }
            Err(err) => {
                warn!(agent_id, err = %err, "container remove failed");
                false
            }
        }
    }

    fn list_agents(&self) -> Vec<AgentSummary> {
        let filter = format!("label={UNIT_TAG}=true");
        let output = match self.cli.invoke(&[
            "ps",
            "-a",
            "--filter",
            &filter,
            "--format",
            "{{json .}}",
        ]) {
            Ok(output) if output.success => output,
            Ok(output) => {
                warn!(stderr = %output.stderr.trim(), "container list failed");
                return Vec::new();
            }
            Err(err) => {
                warn!(err = %err, "container list failed");
                return Vec::new();
            }
        };

        output
            .stdout
            .lines()
            .filter_map(|line| {
                // One JSON document per line; anything unparseable is
                // skipped rather than failing the whole listing.
                let row: Value = serde_json::from_str(line).ok()?;
                let labels = row["Labels"].as_str().unwrap_or_default();
                let name = parse_label(labels, AGENT_ID_TAG)?;
                let state = row["State"].as_str().unwrap_or("unknown");
                Some(AgentSummary {
                    name,
                    state: map_container_status(state, 0),
                    address: None,
                })
            })
            .collect()
    }
}

/// Pull one value out of docker's `k=v,k=v` label string.
fn parse_label(labels: &str, key: &str) -> Option<String> {
    labels.split(',').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_distinguishes_exit_codes() {
        let table = [
            (("created", 0), AgentState::Starting),
            (("restarting", 0), AgentState::Starting),
            (("running", 0), AgentState::Running),
            (("paused", 0), AgentState::Stopped),
            (("removing", 0), AgentState::Stopped),
            (("exited", 0), AgentState::Completed),
            (("exited", 137), AgentState::Failed),
            (("dead", 0), AgentState::Failed),
            (("weird", 0), AgentState::Unknown),
        ];
        for ((status, code), expected) in table {
            assert_eq!(map_container_status(status, code), expected, "{status}/{code}");
        }
    }

    #[test]
    fn label_string_parsing() {
        let labels = "airlift=true,airlift-agent-id=agent-7,other=x";
        assert_eq!(parse_label(labels, AGENT_ID_TAG).as_deref(), Some("agent-7"));
        assert_eq!(parse_label(labels, "missing"), None);
        assert_eq!(parse_label("", AGENT_ID_TAG), None);
    }
}
