//! Scripted transports and fixtures shared by unit and conformance tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use anyhow::Result;
use serde_json::Value;

use crate::config::Config;
use crate::provider::cli::{CliOutput, CliRunner};
use crate::provider::gcp::{ComputeApi, Instance};
use crate::provider::railway::RailwayApi;
use crate::provider::{
    AgentState, AgentSummary, DeploymentResult, LaunchRequest, Provider, ProviderKind,
    StatusReport,
};
use crate::store::StateStore;

/// In-memory state store.
#[derive(Default)]
pub struct MapStore {
    objects: RefCell<HashMap<String, String>>,
}

impl StateStore for MapStore {
    fn download(&self, key: &str) -> Result<Option<String>> {
        Ok(self.objects.borrow().get(key).cloned())
    }

    fn upload(&self, key: &str, contents: &str) -> Result<()> {
        self.objects
            .borrow_mut()
            .insert(key.to_string(), contents.to_string());
        Ok(())
    }

    fn ensure_bucket(&self, _location: &str) -> Result<()> {
        Ok(())
    }
}

/// CLI runner replaying queued responses; clones share the same queue and
/// call log.
#[derive(Clone, Default)]
pub struct ScriptedCli {
    pub responses: Rc<RefCell<VecDeque<Result<CliOutput>>>>,
    pub calls: Rc<RefCell<Vec<Vec<String>>>>,
}

impl ScriptedCli {
    pub fn new(responses: Vec<Result<CliOutput>>) -> Self {
        Self {
            responses: Rc::new(RefCell::new(responses.into())),
            calls: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl CliRunner for ScriptedCli {
    fn invoke(&self, args: &[&str]) -> Result<CliOutput> {
        self.calls
            .borrow_mut()
            .push(args.iter().map(|s| s.to_string()).collect());
        self.responses
            .borrow_mut()
            .pop_front()
            .expect("scripted CLI responses exhausted")
    }
}

/// Compute API with a fixed world: at most one gettable instance, a
/// listing, and an optional insert failure.
#[derive(Clone, Default)]
pub struct ScriptedComputeApi {
    pub fail_insert: Option<String>,
    pub instance: Option<Instance>,
    pub instances: Vec<Instance>,
    pub deleted: Rc<RefCell<Vec<String>>>,
    pub inserted: Rc<RefCell<Vec<Value>>>,
}

impl ComputeApi for ScriptedComputeApi {
    fn insert(&self, instance: &Value) -> Result<String> {
        match &self.fail_insert {
            Some(message) => Err(anyhow::anyhow!("{message}")),
            None => {
                self.inserted.borrow_mut().push(instance.clone());
                Ok("operation-1".to_string())
            }
        }
    }

    fn wait_operation(&self, _operation: &str) -> Result<()> {
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Instance>> {
        Ok(self.instance.clone().filter(|i| i.name == name))
    }

    fn delete(&self, name: &str) -> Result<Option<String>> {
        if self.instance.as_ref().is_some_and(|i| i.name == name) {
            self.deleted.borrow_mut().push(name.to_string());
            return Ok(Some("operation-delete".to_string()));
        }
        Ok(None)
    }

    fn list(&self, _filter: &str) -> Result<Vec<Instance>> {
        Ok(self.instances.clone())
    }
}

/// Railway API replaying queued response documents.
#[derive(Default)]
pub struct ScriptedRailwayApi {
    pub responses: RefCell<VecDeque<Result<Value>>>,
    pub queries: RefCell<Vec<String>>,
}

impl ScriptedRailwayApi {
    pub fn new(responses: Vec<Result<Value>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            queries: RefCell::new(Vec::new()),
        }
    }
}

impl RailwayApi for ScriptedRailwayApi {
    fn execute(&self, query: &str, _variables: Value) -> Result<Value> {
        self.queries.borrow_mut().push(query.to_string());
        self.responses
            .borrow_mut()
            .pop_front()
            .expect("scripted railway responses exhausted")
    }
}

/// Provider double for launcher-level tests.
#[derive(Default)]
pub struct ScriptedProvider {
    pub launches: Rc<RefCell<usize>>,
    statuses: RefCell<HashMap<String, AgentState>>,
}

impl ScriptedProvider {
    pub fn set_status(&self, agent_id: &str, state: AgentState) {
        self.statuses
            .borrow_mut()
            .insert(agent_id.to_string(), state);
    }
}

impl Provider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Docker
    }

    fn launch(&self, request: &LaunchRequest) -> DeploymentResult {
        *self.launches.borrow_mut() += 1;
        DeploymentResult::launching(request.agent_id.clone(), self.kind())
    }

    fn status(&self, agent_id: &str) -> StatusReport {
        match self.statuses.borrow().get(agent_id) {
            Some(state) => StatusReport {
                state: *state,
                ..StatusReport::not_found(agent_id)
            },
            None => StatusReport::not_found(agent_id),
        }
    }

    fn logs(&self, _agent_id: &str) -> Option<String> {
        None
    }

    fn stop(&self, _agent_id: &str) -> bool {
        true
    }

    fn list_agents(&self) -> Vec<AgentSummary> {
        Vec::new()
    }
}

fn config_from(pairs: &[(&str, &str)], provider: &str) -> Config {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Config::from_env_with(&move |name| map.get(name).cloned(), Some(provider), None)
        .expect("test config")
}

pub fn docker_config() -> Config {
    config_from(&[("HOME", "/tmp")], "docker")
}

pub fn gcp_config() -> Config {
    config_from(&[("AIRLIFT_PROJECT", "test-project")], "gcp")
}

pub fn aws_config() -> Config {
    config_from(&[("AIRLIFT_BUCKET", "test-bucket")], "aws")
}

pub fn railway_config() -> Config {
    config_from(
        &[("RAILWAY_TOKEN", "test-token"), ("RAILWAY_PROJECT_ID", "proj-1")],
        "railway",
    )
}
