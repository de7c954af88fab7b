//! Lifecycle orchestration: credentials + adapter + payload, bound into
//! launch/status/logs/stop/list.
//!
//! Synchronous per invocation: each operation is one round trip to one
//! backend. Configuration problems surface before any remote call with
//! the setting to fix; everything after that is the adapter's result
//! vocabulary.

use anyhow::Result;
use chrono::Local;
use tracing::{debug, info};

use crate::auth::{Credentials, SecretStore, resolve_credentials};
use crate::config::Config;
use crate::provider::{
    AgentState, AgentSummary, DeploymentResult, LaunchOptions, LaunchRequest, Provider,
    ProviderKind, StatusReport,
};

/// Operator-facing launch parameters.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub prompt: String,
    /// Explicit agent name; generated when absent.
    pub name: Option<String>,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub spot: bool,
    pub max_iterations: u32,
    pub keep_alive: bool,
}

/// Binds one configured backend to the operator operations.
pub struct Launcher {
    config: Config,
    provider: Box<dyn Provider>,
    secrets: Option<Box<dyn SecretStore>>,
    env: Box<dyn Fn(&str) -> Option<String>>,
}

fn real_env() -> Box<dyn Fn(&str) -> Option<String>> {
    Box::new(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
}

impl Launcher {
    /// Build the adapter the configuration selects.
    pub fn new(config: Config) -> Result<Self> {
        let provider = make_provider(&config)?;
        Ok(Self {
            config,
            provider,
            secrets: None,
            env: real_env(),
        })
    }

    /// Same, with a secret store for the credential fallback.
    pub fn with_secret_store(config: Config, secrets: Box<dyn SecretStore>) -> Result<Self> {
        let provider = make_provider(&config)?;
        Ok(Self {
            config,
            provider,
            secrets: Some(secrets),
            env: real_env(),
        })
    }

    /// Assemble over an explicit provider and environment (tests).
    pub fn with_provider(
        config: Config,
        provider: Box<dyn Provider>,
        env: Box<dyn Fn(&str) -> Option<String>>,
    ) -> Self {
        Self {
            config,
            provider,
            secrets: None,
            env,
        }
    }

    fn resolve(&self) -> Result<Option<Credentials>> {
        resolve_credentials(
            self.config.auth_type,
            self.env.as_ref(),
            self.secrets.as_deref(),
            &self.config.api_key_secret,
            &self.config.oauth_secret,
        )
    }

    /// Launch a new agent.
    ///
    /// Fails into the result (never a panic or `Err`): missing credentials
    /// are reported before any remote call, and an explicitly supplied
    /// name that already exists on the backend is refused rather than
    /// reproducing per-backend duplicate semantics.
    pub fn launch(&self, spec: &LaunchSpec) -> DeploymentResult {
        let agent_id = spec
            .name
            .clone()
            .unwrap_or_else(|| generate_agent_id(&mut rand::thread_rng()));
        let kind = self.provider.kind();

        let credentials = match self.resolve() {
            Ok(Some(credentials)) => credentials,
            Ok(None) => {
                return DeploymentResult::failed(
                    agent_id,
                    kind,
                    missing_credentials_message(&self.config),
                );
            }
            Err(err) => return DeploymentResult::failed(agent_id, kind, format!("{err:#}")),
        };

        // Only operator-chosen names get the duplicate check; generated
        // ids carry a timestamp and random suffix.
        if spec.name.is_some() {
            let existing = self.provider.status(&agent_id);
            if existing.state != AgentState::NotFound {
                return DeploymentResult::failed(
                    agent_id.clone(),
                    kind,
                    format!(
                        "agent '{agent_id}' already exists on {kind} (state: {})",
                        existing.state
                    ),
                );
            }
        }

        info!(agent_id = %agent_id, provider = %kind, "launching agent");
        let request = LaunchRequest {
            agent_id,
            task_spec: spec.prompt.clone(),
            credentials,
            options: LaunchOptions {
                repo: spec.repo.clone(),
                branch: spec.branch.clone(),
                spot: spec.spot,
                max_iterations: spec.max_iterations,
                keep_alive: spec.keep_alive,
            },
        };
        self.provider.launch(&request)
    }

    pub fn status(&self, agent_id: &str) -> StatusReport {
        debug!(agent_id, "status query");
        self.provider.status(agent_id)
    }

    pub fn logs(&self, agent_id: &str) -> Option<String> {
        self.provider.logs(agent_id)
    }

    pub fn stop(&self, agent_id: &str) -> bool {
        info!(agent_id, "stopping agent");
        self.provider.stop(agent_id)
    }

    pub fn list_agents(&self) -> Vec<AgentSummary> {
        self.provider.list_agents()
    }
}

fn make_provider(config: &Config) -> Result<Box<dyn Provider>> {
    Ok(match config.provider {
        ProviderKind::Gcp => Box::new(crate::provider::gcp::GcpProvider::new(config)?),
        ProviderKind::Aws => Box::new(crate::provider::aws::AwsProvider::new(config)?),
        ProviderKind::Docker => Box::new(crate::provider::docker::DockerProvider::new(config)),
        ProviderKind::Railway => Box::new(crate::provider::railway::RailwayProvider::new(config)?),
    })
}

fn missing_credentials_message(config: &Config) -> String {
    match config.auth_type {
        crate::auth::AuthType::ApiKey => format!(
            "API key not found: set ANTHROPIC_API_KEY, or store it in the secret store as '{}'",
            config.api_key_secret
        ),
        crate::auth::AuthType::Oauth => format!(
            "OAuth credentials not found: set CLAUDE_CODE_OAUTH_TOKEN, or store them in the secret store as '{}'",
            config.oauth_secret
        ),
    }
}

/// `agent-YYYYMMDD-HHMMSS-xxxxxxxx`, unique enough to skip duplicate
/// checks.
pub fn generate_agent_id(rng: &mut impl rand::Rng) -> String {
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");
    let suffix: u32 = rng.r#gen();
    format!("agent-{timestamp}-{suffix:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedProvider, docker_config};

    #[test]
    fn generated_ids_have_the_expected_shape() {
        let mut rng = rand::thread_rng();
        let id = generate_agent_id(&mut rng);
        assert!(id.starts_with("agent-"));
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 8);
        // Valid as a unit name everywhere we deploy.
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn launch_without_credentials_fails_before_any_backend_call() {
        let provider = ScriptedProvider::default();
        let launches = provider.launches.clone();
        let launcher =
            Launcher::with_provider(docker_config(), Box::new(provider), Box::new(|_| None));

        let result = launcher.launch(&LaunchSpec {
            prompt: "build".to_string(),
            ..LaunchSpec::default()
        });
        assert_eq!(result.state, AgentState::Failed);
        let error = result.error.expect("error");
        assert!(error.contains("ANTHROPIC_API_KEY"));
        // No unit was created.
        assert_eq!(*launches.borrow(), 0);
    }

    #[test]
    fn explicit_duplicate_names_are_refused() {
        let provider = ScriptedProvider::default();
        provider.set_status("busy-bee", AgentState::Running);
        let launches = provider.launches.clone();
        let launcher = Launcher::with_provider(
            docker_config(),
            Box::new(provider),
            Box::new(|name| {
                (name == "ANTHROPIC_API_KEY").then(|| "sk-ant-api03-test".to_string())
            }),
        );

        let result = launcher.launch(&LaunchSpec {
            prompt: "build".to_string(),
            name: Some("busy-bee".to_string()),
            ..LaunchSpec::default()
        });
        assert_eq!(result.state, AgentState::Failed);
        assert!(result.error.expect("error").contains("already exists"));
        assert_eq!(*launches.borrow(), 0);
    }
}
