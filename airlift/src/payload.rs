//! Bootstrap payload generation.
//!
//! The payload is the program a fresh unit runs on boot: install the
//! worker runtime, fetch credentials from the side channel, materialize
//! the task spec, and exec the harness. Generation is a pure function of
//! [`PayloadSpec`] — it has no credential input, so a secret in the
//! rendered text is impossible by construction, and backend log history
//! that captures payload text captures nothing sensitive.
//!
//! The task spec rides base64-encoded: substitution stays total for task
//! text containing quotes, backticks, `$(...)`, or delimiter lines that
//! would truncate a heredoc. Every scalar field is validated against a
//! conservative character set and rejected otherwise.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use minijinja::{Environment, context};
use regex::Regex;

use crate::auth::Credentials;

const STARTUP_TEMPLATE: &str = include_str!("payload/startup.sh.j2");

static AGENT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]{0,61}$").unwrap());
static STORE_URI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(gs|s3)://[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());
static REPO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9@:/._+-]+$").unwrap());
static BRANCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._/-]+$").unwrap());
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https://[A-Za-z0-9./_-]+$").unwrap());

/// Where the booted unit fetches its credentials from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretChannel {
    /// GCE instance metadata attributes.
    GcpMetadata,
    /// An SSM SecureString parameter readable through the instance role.
    AwsSsm { parameter: String },
    /// The unit's own environment (container/managed backends); these
    /// units boot from a prebuilt image, not a startup script.
    UnitEnv,
}

/// Everything the startup script embeds. Deliberately credential-free.
#[derive(Debug, Clone)]
pub struct PayloadSpec {
    pub agent_id: String,
    pub task_spec: String,
    /// `gs://bucket` or `s3://bucket`.
    pub store_uri: String,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub max_iterations: u32,
    pub keep_alive: bool,
    pub harness_url: String,
    pub secret_channel: SecretChannel,
}

impl PayloadSpec {
    fn validate(&self) -> Result<()> {
        check_field("agent id", &self.agent_id, &AGENT_ID_RE)?;
        check_field("store uri", &self.store_uri, &STORE_URI_RE)?;
        check_field("harness url", &self.harness_url, &URL_RE)?;
        if let Some(repo) = &self.repo {
            check_field("repo", repo, &REPO_RE)?;
        }
        if let Some(branch) = &self.branch {
            check_field("branch", branch, &BRANCH_RE)?;
        }
        Ok(())
    }
}

fn check_field(label: &str, value: &str, pattern: &Regex) -> Result<()> {
    if value.is_empty() || !pattern.is_match(value) {
        return Err(anyhow!("invalid {label} '{value}'"));
    }
    Ok(())
}

/// Render the startup script for a VM-style unit.
///
/// Substitution is structural (minijinja), so no placeholder can survive
/// rendering, and the base64-transported task spec round-trips any byte
/// sequence.
pub fn render_startup_script(spec: &PayloadSpec) -> Result<String> {
    spec.validate()?;

    let store_kind = if spec.store_uri.starts_with("gs://") {
        "gcs"
    } else {
        "s3"
    };
    let (channel, ssm_parameter) = match &spec.secret_channel {
        SecretChannel::GcpMetadata => ("gcp-metadata", String::new()),
        SecretChannel::AwsSsm { parameter } => ("aws-ssm", parameter.clone()),
        SecretChannel::UnitEnv => {
            return Err(anyhow!(
                "unit-env credential channel has no startup script; use boot_env"
            ));
        }
    };

    let mut env = Environment::new();
    env.add_template("startup", STARTUP_TEMPLATE)
        .expect("startup template should be valid");
    let template = env.get_template("startup")?;
    template
        .render(context! {
            agent_id => spec.agent_id,
            store_uri => spec.store_uri,
            spec_b64 => BASE64.encode(spec.task_spec.as_bytes()),
            repo => spec.repo.as_deref().unwrap_or(""),
            branch => spec.branch.as_deref().unwrap_or(""),
            max_iterations => spec.max_iterations,
            keep_alive => spec.keep_alive,
            harness_url => spec.harness_url,
            store_kind => store_kind,
            secret_channel => channel,
            ssm_parameter => ssm_parameter,
        })
        .context("render startup script")
}

/// The SSM parameter name the AWS side channel uses for an agent.
pub fn ssm_parameter_name(agent_id: &str) -> String {
    format!("/airlift/agents/{agent_id}/credentials")
}

/// Boot configuration for container/managed-service units, where the
/// unit's environment is the side channel. This is the only place
/// credentials join the boot configuration, and it is not payload text.
pub fn boot_env(spec: &PayloadSpec, credentials: &Credentials) -> Vec<(String, String)> {
    let mut env = vec![
        ("AGENT_ID".to_string(), spec.agent_id.clone()),
        ("AGENT_PROMPT".to_string(), spec.task_spec.clone()),
        ("STORE_URI".to_string(), spec.store_uri.clone()),
        (
            "MAX_ITERATIONS".to_string(),
            spec.max_iterations.to_string(),
        ),
        (
            "KEEP_ALIVE".to_string(),
            if spec.keep_alive { "true" } else { "false" }.to_string(),
        ),
    ];
    if let Some(repo) = &spec.repo {
        env.push(("REPO_URL".to_string(), repo.clone()));
    }
    if let Some(branch) = &spec.branch {
        env.push(("REPO_BRANCH".to_string(), branch.clone()));
    }
    env.extend(credentials.env_vars());
    env
}
