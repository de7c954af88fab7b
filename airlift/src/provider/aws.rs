//! Ephemeral-instance backend on EC2.
//!
//! Driven through the `aws` CLI with JSON output. Credentials never enter
//! the user-data payload: the launcher writes them to an SSM SecureString
//! parameter and the booting instance reads them back through its
//! instance role. Worker state lives in S3.

use std::fs;
use std::rc::Rc;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::payload::{PayloadSpec, SecretChannel, render_startup_script, ssm_parameter_name};
use crate::provider::cli::{CliRunner, SystemCli};
use crate::provider::{
    AGENT_ID_TAG, AgentState, AgentSummary, DeploymentResult, LaunchRequest, Provider,
    ProviderKind, StatusReport, UNIT_TAG,
};
use crate::store::{StateStore, read_agent_state, reconcile};

/// Ubuntu 22.04 LTS AMIs by region (HVM, SSD, x86_64; official Canonical
/// images).
const UBUNTU_AMIS: &[(&str, &str)] = &[
    ("us-east-1", "ami-0c7217cdde317cfec"),
    ("us-east-2", "ami-05fb0b8c1424f266b"),
    ("us-west-1", "ami-0ce2cb35386fc22e9"),
    ("us-west-2", "ami-008fe2fc65df48dac"),
    ("eu-west-1", "ami-0905a3c97561e0b69"),
    ("eu-west-2", "ami-0e5f882be1900e43b"),
    ("eu-central-1", "ami-0faab6bdbac9486fb"),
    ("ap-northeast-1", "ami-07c589821f2b353aa"),
    ("ap-southeast-1", "ami-078c1149d8ad719a7"),
    ("ap-southeast-2", "ami-04f5097681773b989"),
];

/// Instance states worth surfacing; terminated instances are invisible.
const LIVE_STATES: &str = "Name=instance-state-name,Values=pending,running,stopping,stopped";

pub fn ami_for_region(region: &str) -> Option<&'static str> {
    UBUNTU_AMIS
        .iter()
        .find(|(r, _)| *r == region)
        .map(|(_, ami)| *ami)
}

/// Native EC2 instance state -> shared vocabulary. Total by fallback.
pub fn map_instance_state(state: &str) -> AgentState {
    match state {
        "pending" => AgentState::Starting,
        "running" => AgentState::Running,
        "stopping" | "stopped" | "shutting-down" | "terminated" => AgentState::Stopped,
        _ => AgentState::Unknown,
    }
}

/// S3 store over the same CLI transport the adapter uses.
pub struct S3CliStore {
    bucket: String,
    region: String,
    cli: Rc<dyn CliRunner>,
}

impl S3CliStore {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>, cli: Rc<dyn CliRunner>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            cli,
        }
    }
}

impl StateStore for S3CliStore {
    fn download(&self, key: &str) -> Result<Option<String>> {
        let uri = format!("s3://{}/{key}", self.bucket);
        let output = self
            .cli
            .invoke(&["--region", &self.region, "s3", "cp", &uri, "-"])?;
        if output.success {
            return Ok(Some(output.stdout));
        }
        if output.stderr.contains("404") || output.stderr.contains("does not exist") {
            return Ok(None);
        }
        Err(anyhow!("s3 download failed: {}", output.stderr.trim()))
    }

    fn upload(&self, key: &str, contents: &str) -> Result<()> {
        let scratch = std::env::temp_dir().join(format!(
            "airlift-{}-{}",
            std::process::id(),
            key.replace('/', "-")
        ));
        fs::write(&scratch, contents)
            .with_context(|| format!("write scratch {}", scratch.display()))?;
        let uri = format!("s3://{}/{key}", self.bucket);
        let scratch_str = scratch.display().to_string();
        let result = self
            .cli
            .invoke(&["--region", &self.region, "s3", "cp", &scratch_str, &uri, "--quiet"]);
        let _ = fs::remove_file(&scratch);
        let output = result?;
        if !output.success {
            return Err(anyhow!("s3 upload failed: {}", output.stderr.trim()));
        }
        Ok(())
    }

    fn ensure_bucket(&self, location: &str) -> Result<()> {
        let head = self
            .cli
            .invoke(&["--region", &self.region, "s3api", "head-bucket", "--bucket", &self.bucket])?;
        if head.success {
            return Ok(());
        }
        let mut args = vec![
            "--region",
            &self.region,
            "s3api",
            "create-bucket",
            "--bucket",
            &self.bucket,
        ];
        let constraint = format!("LocationConstraint={location}");
        // us-east-1 rejects an explicit location constraint.
        if location != "us-east-1" {
            args.push("--create-bucket-configuration");
            args.push(&constraint);
        }
        let created = self.cli.invoke(&args)?;
        if !created.success {
            return Err(anyhow!("bucket create failed: {}", created.stderr.trim()));
        }
        Ok(())
    }
}

/// EC2-backed provider.
pub struct AwsProvider {
    region: String,
    instance_type: String,
    instance_profile: Option<String>,
    bucket: String,
    harness_url: String,
    cli: Rc<dyn CliRunner>,
    store: Box<dyn StateStore>,
}

impl AwsProvider {
    pub fn new(config: &Config) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| anyhow!("state bucket not configured: set AIRLIFT_BUCKET"))?;
        let cli: Rc<dyn CliRunner> = Rc::new(SystemCli::new("aws"));
        let store = S3CliStore::new(bucket.clone(), config.aws_region.clone(), cli.clone());
        Ok(Self::with_parts(config, bucket, cli, Box::new(store)))
    }

    pub fn with_parts(
        config: &Config,
        bucket: String,
        cli: Rc<dyn CliRunner>,
        store: Box<dyn StateStore>,
    ) -> Self {
        Self {
            region: config.aws_region.clone(),
            instance_type: config.aws_instance_type.clone(),
            instance_profile: config.aws_instance_profile.clone(),
            bucket,
            harness_url: config.harness_url.clone(),
            cli,
            store,
        }
    }

    fn ec2(&self, args: &[&str]) -> Result<Value> {
        let mut full = vec!["--region", self.region.as_str(), "--output", "json"];
        full.extend_from_slice(args);
        let output = self.cli.invoke(&full)?;
        if !output.success {
            return Err(anyhow!("aws {} failed: {}", args[0], output.stderr.trim()));
        }
        if output.stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&output.stdout).context("parse aws CLI output")
    }

    fn find_instance(&self, agent_id: &str) -> Result<Option<Value>> {
        let tag_filter = format!("Name=tag:{AGENT_ID_TAG},Values={agent_id}");
        let body = self.ec2(&[
            "ec2",
            "describe-instances",
            "--filters",
            &tag_filter,
            LIVE_STATES,
        ])?;
        let instance = body["Reservations"]
            .as_array()
            .and_then(|reservations| reservations.first())
            .and_then(|r| r["Instances"].as_array())
            .and_then(|instances| instances.first())
            .cloned();
        Ok(instance)
    }

    fn try_launch(&self, request: &LaunchRequest) -> Result<DeploymentResult> {
        self.store.ensure_bucket(&self.region)?;
        let ami = ami_for_region(&self.region).ok_or_else(|| {
            let supported: Vec<&str> = UBUNTU_AMIS.iter().map(|(r, _)| *r).collect();
            anyhow!(
                "region '{}' has no pre-configured Ubuntu AMI (supported: {})",
                self.region,
                supported.join(", ")
            )
        })?;

        // Credentials go to the SSM side channel, never into user-data.
        let parameter = ssm_parameter_name(&request.agent_id);
        let secret_json = request.credentials.side_channel_json();
        let put = self.cli.invoke(&[
            "--region",
            &self.region,
            "ssm",
            "put-parameter",
            "--name",
            &parameter,
            "--type",
            "SecureString",
            "--value",
            &secret_json,
            "--overwrite",
        ])?;
        if !put.success {
            return Err(anyhow!("ssm put-parameter failed: {}", put.stderr.trim()));
        }

        let payload = PayloadSpec {
            agent_id: request.agent_id.clone(),
            task_spec: request.task_spec.clone(),
            store_uri: format!("s3://{}", self.bucket),
            repo: request.options.repo.clone(),
            branch: request.options.branch.clone(),
            max_iterations: request.options.max_iterations,
            keep_alive: request.options.keep_alive,
            harness_url: self.harness_url.clone(),
            secret_channel: SecretChannel::AwsSsm { parameter },
        };
        let user_data = render_startup_script(&payload)?;

        let tag_spec = run_instance_tags(&request.agent_id);
        let mut args = vec![
            "ec2".to_string(),
            "run-instances".to_string(),
            "--image-id".to_string(),
            ami.to_string(),
            "--instance-type".to_string(),
            self.instance_type.clone(),
            "--user-data".to_string(),
            user_data,
            "--tag-specifications".to_string(),
            tag_spec,
        ];
        if let Some(profile) = &self.instance_profile {
            args.push("--iam-instance-profile".to_string());
            args.push(format!("Name={profile}"));
        }
        if request.options.spot {
            args.push("--instance-market-options".to_string());
            args.push("MarketType=spot,SpotOptions={SpotInstanceType=one-time}".to_string());
        }

        info!(agent_id = %request.agent_id, region = %self.region, "launching instance");
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.ec2(&arg_refs)?;

        Ok(DeploymentResult::launching(
            request.agent_id.clone(),
            ProviderKind::Aws,
        ))
    }
}

/// Tag specification marking the instance as ours.
fn run_instance_tags(agent_id: &str) -> String {
    format!(
        "ResourceType=instance,Tags=[{{Key=Name,Value={agent_id}}},{{Key={UNIT_TAG},Value=true}},{{Key={AGENT_ID_TAG},Value={agent_id}}}]"
    )
}

/// Agent id from an instance's tag set, `None` for foreign instances.
fn agent_id_tag(instance: &Value) -> Option<String> {
    instance["Tags"].as_array()?.iter().find_map(|tag| {
        (tag["Key"].as_str() == Some(AGENT_ID_TAG))
            .then(|| tag["Value"].as_str().map(str::to_string))
            .flatten()
    })
}

impl Provider for AwsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    fn launch(&self, request: &LaunchRequest) -> DeploymentResult {
        match self.try_launch(request) {
            Ok(result) => result,
            Err(err) => {
                warn!(agent_id = %request.agent_id, err = %err, "launch failed");
                DeploymentResult::failed(
                    request.agent_id.clone(),
                    ProviderKind::Aws,
                    format!("{err:#}"),
                )
            }
        }
    }

    fn status(&self, agent_id: &str) -> StatusReport {
        let store_state = read_agent_state(self.store.as_ref(), agent_id);

        let (instance, error) = match self.find_instance(agent_id) {
            Ok(instance) => (instance, None),
            Err(err) => (None, Some(format!("{err:#}"))),
        };
        let native = instance
            .as_ref()
            .and_then(|i| i["State"]["Name"].as_str())
            .map(str::to_string);
        let unit_mapped = native.as_deref().map(map_instance_state);

        StatusReport {
            agent_id: agent_id.to_string(),
            state: if error.is_some() {
                AgentState::Unknown
            } else {
                reconcile(store_state.status, unit_mapped)
            },
            store_status: store_state.status,
            unit_state: native,
            address: instance
                .as_ref()
                .and_then(|i| i["PublicIpAddress"].as_str())
                .map(str::to_string),
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
        let instance = match self.find_instance(agent_id) {
            Ok(instance) => instance,
            Err(err) => {
                warn!(agent_id, err = %err, "describe before terminate failed");
                return false;
            }
        };
        let Some(instance) = instance else {
            // Absence is success.
            return true;
        };
        let Some(instance_id) = instance["InstanceId"].as_str() else {
            warn!(agent_id, "instance record has no id");
            return false;
        };

        match self.ec2(&["ec2", "terminate-instances", "--instance-ids", instance_id]) {
            Ok(_) => {
                // Best effort: retire the credential parameter with the unit.
                let parameter = ssm_parameter_name(agent_id);
                let _ = self.cli.invoke(&[
                    "--region",
                    &self.region,
                    "ssm",
                    "delete-parameter",
                    "--name",
                    &parameter,
                ]);
                true
            }
            Err(err) => {
                warn!(agent_id, err = %err, "terminate failed");
                false
            }
        }
    }

    fn list_agents(&self) -> Vec<AgentSummary> {
        let tag_filter = format!("Name=tag:{UNIT_TAG},Values=true");
        let body = match self.ec2(&[
            "ec2",
            "describe-instances",
            "--filters",
            &tag_filter,
            LIVE_STATES,
        ]) {
            Ok(body) => body,
            Err(err) => {
                warn!(err = %err, "instance list failed");
                return Vec::new();
            }
        };

        let mut agents = Vec::new();
        let reservations = body["Reservations"].as_array().cloned().unwrap_or_default();
        for reservation in &reservations {
            let Some(instances) = reservation["Instances"].as_array() else {
                continue;
            };
            for instance in instances {
                // Foreign or malformed entries have no agent-id tag; skip.
                let Some(name) = agent_id_tag(instance) else {
                    continue;
                };
                let state = instance["State"]["Name"].as_str().unwrap_or("unknown");
                agents.push(AgentSummary {
                    name,
                    state: map_instance_state(state),
                    address: instance["PublicIpAddress"].as_str().map(str::to_string),
                });
            }
        }
        agents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ami_table_covers_default_region() {
        assert_eq!(ami_for_region("us-east-1"), Some("ami-0c7217cdde317cfec"));
        assert_eq!(ami_for_region("mars-north-1"), None);
    }

    #[test]
    fn state_mapping_is_total() {
        let table = [
            ("pending", AgentState::Starting),
            ("running", AgentState::Running),
            ("stopping", AgentState::Stopped),
            ("stopped", AgentState::Stopped),
            ("shutting-down", AgentState::Stopped),
            ("terminated", AgentState::Stopped),
            ("brand-new-state", AgentState::Unknown),
        ];
        for (native, expected) in table {
            assert_eq!(map_instance_state(native), expected, "{native}");
        }
    }

    #[test]
    fn tag_specification_carries_both_tags() {
        let spec = run_instance_tags("agent-9");
        assert!(spec.contains("Key=Name,Value=agent-9"));
        assert!(spec.contains("Key=airlift,Value=true"));
        assert!(spec.contains("Key=airlift-agent-id,Value=agent-9"));
    }

    #[test]
    fn agent_id_tag_skips_foreign_instances() {
        let ours = serde_json::json!({
            "Tags": [
                { "Key": "airlift", "Value": "true" },
                { "Key": "airlift-agent-id", "Value": "agent-9" },
            ],
        });
        assert_eq!(agent_id_tag(&ours).as_deref(), Some("agent-9"));

        let foreign = serde_json::json!({
            "Tags": [{ "Key": "Name", "Value": "web-server" }],
        });
        assert_eq!(agent_id_tag(&foreign), None);

        let untagged = serde_json::json!({});
        assert_eq!(agent_id_tag(&untagged), None);
    }
}
