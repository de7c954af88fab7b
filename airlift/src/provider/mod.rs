//! The five-verb capability contract every backend implements.
//!
//! The surface is deliberately infallible: transient backend failures are
//! data (`DeploymentResult::error`, `StatusReport::error`, `None`, `false`,
//! an empty list), never escaping native error types. Each adapter owns a
//! *total* translation from its native status vocabulary into
//! [`AgentState`]; unmapped states become [`AgentState::Unknown`], never an
//! error. Configuration problems are the one exception — they surface at
//! adapter construction, before any remote call.

pub mod aws;
pub mod cli;
pub mod docker;
pub mod gcp;
pub mod railway;

use std::fmt;
use std::str::FromStr;

use airlift_harness::state::{FeatureProgress, StatusToken};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::auth::Credentials;

/// Supported deployment backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gcp,
    Railway,
    Aws,
    Docker,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Gcp => "gcp",
            ProviderKind::Railway => "railway",
            ProviderKind::Aws => "aws",
            ProviderKind::Docker => "docker",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gcp" => Ok(ProviderKind::Gcp),
            "railway" => Ok(ProviderKind::Railway),
            "aws" => Ok(ProviderKind::Aws),
            "docker" => Ok(ProviderKind::Docker),
            other => Err(anyhow!(
                "invalid provider '{other}' (expected gcp, railway, aws, or docker)"
            )),
        }
    }
}

/// Shared agent lifecycle vocabulary across all backends.
///
/// Workers only ever persist the first four (see
/// [`StatusToken`]); the rest are inferred
/// from live backend state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Starting,
    Running,
    Completed,
    Failed,
    Stopped,
    NotFound,
    Unknown,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Completed => "completed",
            AgentState::Failed => "failed",
            AgentState::Stopped => "stopped",
            AgentState::NotFound => "not_found",
            AgentState::Unknown => "unknown",
        }
    }

    pub fn from_status_token(token: StatusToken) -> Self {
        match token {
            StatusToken::Starting => AgentState::Starting,
            StatusToken::Running => AgentState::Running,
            StatusToken::Completed => AgentState::Completed,
            StatusToken::Failed => AgentState::Failed,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag marking units created by this system. Foreign units without it are
/// invisible to `list_agents`.
pub const UNIT_TAG: &str = "airlift";
/// Tag carrying the agent id on a unit.
pub const AGENT_ID_TAG: &str = "airlift-agent-id";

/// Options fixed at launch time.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub repo: Option<String>,
    pub branch: Option<String>,
    /// Use a spot/preemptible unit where the backend supports it.
    pub spot: bool,
    /// Iteration budget for the worker loop (0 = unbounded).
    pub max_iterations: u32,
    /// Keep the unit alive after the loop ends.
    pub keep_alive: bool,
}

/// One launch attempt, fully resolved.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub agent_id: String,
    pub task_spec: String,
    pub credentials: Credentials,
    pub options: LaunchOptions,
}

/// Immutable outcome of one launch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentResult {
    pub agent_id: String,
    pub provider: ProviderKind,
    pub state: AgentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentResult {
    /// Launch accepted; the unit is materializing.
    pub fn launching(agent_id: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            agent_id: agent_id.into(),
            provider,
            state: AgentState::Starting,
            address: None,
            error: None,
        }
    }

    /// Launch failed; the error text is the whole story.
    pub fn failed(
        agent_id: impl Into<String>,
        provider: ProviderKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            provider,
            state: AgentState::Failed,
            address: None,
            error: Some(error.into()),
        }
    }
}

/// Merged view of live unit state and the worker's persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub agent_id: String,
    pub state: AgentState,
    /// Raw token the worker last wrote, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_status: Option<StatusToken>,
    /// Backend-native unit state, untranslated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<FeatureProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusReport {
    pub fn not_found(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            state: AgentState::NotFound,
            store_status: None,
            unit_state: None,
            address: None,
            progress: None,
            error: None,
        }
    }
}

/// One row of `list_agents`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub state: AgentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// The capability contract. One implementation per backend.
pub trait Provider {
    fn kind(&self) -> ProviderKind;

    /// Materialize one unit running the bootstrap payload. Not idempotent;
    /// transient backend errors land in the result, never in a panic or
    /// an `Err`.
    fn launch(&self, request: &LaunchRequest) -> DeploymentResult;

    /// Merge live unit state with whatever the worker last wrote. Never
    /// blocks on worker readiness: a unit that exists but has not reported
    /// reads as `starting`.
    fn status(&self, agent_id: &str) -> StatusReport;

    /// Worker log tail. Absent is not an error.
    fn logs(&self, agent_id: &str) -> Option<String>;

    /// Idempotent deletion: absence of the unit is success.
    fn stop(&self, agent_id: &str) -> bool;

    /// Units tagged by this system on this backend. Malformed or foreign
    /// entries are skipped, never fatal.
    fn list_agents(&self) -> Vec<AgentSummary>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_parses_known_names() {
        assert_eq!("gcp".parse::<ProviderKind>().expect("gcp"), ProviderKind::Gcp);
        assert_eq!(
            "RAILWAY".parse::<ProviderKind>().expect("railway"),
            ProviderKind::Railway
        );
        assert!("fly".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn deployment_result_constructors_fill_state() {
        let ok = DeploymentResult::launching("a-1", ProviderKind::Docker);
        assert_eq!(ok.state, AgentState::Starting);
        assert!(ok.error.is_none());

        let failed = DeploymentResult::failed("a-1", ProviderKind::Docker, "no daemon");
        assert_eq!(failed.state, AgentState::Failed);
        assert_eq!(failed.error.as_deref(), Some("no daemon"));
    }

    #[test]
    fn agent_state_serializes_snake_case() {
        assert_eq!(AgentState::NotFound.as_str(), "not_found");
        assert_eq!(
            serde_json::to_string(&AgentState::NotFound).expect("json"),
            "\"not_found\""
        );
    }
}
