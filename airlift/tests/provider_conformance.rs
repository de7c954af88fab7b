//! One conformance suite, four adapters.
//!
//! Every backend implements the same five-verb contract; these tests pin
//! the contract properties across all of them over scripted transports:
//! stopping a nonexistent agent succeeds, listings skip foreign and
//! malformed units, transport failures land in the launch result, and a
//! unit that exists but has not reported reads as starting.

use std::collections::HashMap;
use std::rc::Rc;

use airlift::auth::Credentials;
use airlift::provider::aws::AwsProvider;
use airlift::provider::cli::CliOutput;
use airlift::provider::docker::DockerProvider;
use airlift::provider::gcp::{GcpProvider, Instance};
use airlift::provider::railway::RailwayProvider;
use airlift::provider::{AgentState, LaunchOptions, LaunchRequest, Provider};
use airlift::test_support::{
    MapStore, ScriptedCli, ScriptedComputeApi, ScriptedRailwayApi, aws_config, docker_config,
    gcp_config, railway_config,
};
use anyhow::anyhow;
use serde_json::json;

fn launch_request(agent_id: &str) -> LaunchRequest {
    LaunchRequest {
        agent_id: agent_id.to_string(),
        task_spec: "Build a small web service".to_string(),
        credentials: Credentials::from_api_key("sk-ant-api03-conformance"),
        options: LaunchOptions::default(),
    }
}

fn gce_instance(name: &str, status: &str, tagged: bool) -> Instance {
    let mut labels = HashMap::new();
    if tagged {
        labels.insert("airlift".to_string(), "true".to_string());
        labels.insert("airlift-agent-id".to_string(), name.to_string());
    }
    Instance {
        name: name.to_string(),
        status: status.to_string(),
        external_ip: None,
        labels,
    }
}

fn gcp_with(api: ScriptedComputeApi) -> GcpProvider {
    GcpProvider::with_parts(
        &gcp_config(),
        "airlift-test-project".to_string(),
        Box::new(api),
        Box::new(MapStore::default()),
    )
}

fn docker_with(cli: ScriptedCli) -> DockerProvider {
    DockerProvider::with_parts(&docker_config(), Box::new(cli), Box::new(MapStore::default()))
}

fn aws_with(cli: ScriptedCli) -> AwsProvider {
    AwsProvider::with_parts(
        &aws_config(),
        "test-bucket".to_string(),
        Rc::new(cli),
        Box::new(MapStore::default()),
    )
}

fn railway_with(api: ScriptedRailwayApi) -> RailwayProvider {
    RailwayProvider::with_api(&railway_config(), Box::new(api))
}

fn empty_reservations() -> String {
    json!({ "Reservations": [] }).to_string()
}

fn one_reservation(instances: Vec<serde_json::Value>) -> String {
    json!({ "Reservations": [{ "Instances": instances }] }).to_string()
}

fn ec2_instance(agent_id: Option<&str>, state: &str) -> serde_json::Value {
    let mut tags = vec![json!({ "Key": "Name", "Value": "something" })];
    if let Some(id) = agent_id {
        tags.push(json!({ "Key": "airlift", "Value": "true" }));
        tags.push(json!({ "Key": "airlift-agent-id", "Value": id }));
    }
    json!({
        "InstanceId": "i-0123456789abcdef0",
        "State": { "Name": state },
        "PublicIpAddress": "203.0.113.7",
        "Tags": tags,
    })
}

fn railway_services(edges: Vec<serde_json::Value>) -> serde_json::Value {
    json!({ "data": { "project": { "services": { "edges": edges } } } })
}

#[test]
fn stop_on_a_nonexistent_agent_is_success() {
    // GCP: delete reports the instance was already gone.
    let gcp = gcp_with(ScriptedComputeApi::default());
    assert!(gcp.stop("ghost"));

    // Docker: remove fails with "No such container".
    let docker = docker_with(ScriptedCli::new(vec![Ok(CliOutput::err(
        "Error response from daemon: No such container: ghost",
    ))]));
    assert!(docker.stop("ghost"));

    // AWS: describe finds nothing to terminate.
    let aws = aws_with(ScriptedCli::new(vec![Ok(CliOutput::ok(
        empty_reservations(),
    ))]));
    assert!(aws.stop("ghost"));

    // Railway: no service by that name in the project.
    let railway = railway_with(ScriptedRailwayApi::new(vec![Ok(railway_services(
        Vec::new(),
    ))]));
    assert!(railway.stop("ghost"));
}

#[test]
fn listings_skip_foreign_and_malformed_units() {
    let gcp = gcp_with(ScriptedComputeApi {
        instances: vec![
            gce_instance("agent-1", "RUNNING", true),
            gce_instance("web-frontend", "RUNNING", false),
        ],
        ..ScriptedComputeApi::default()
    });
    let agents = gcp.list_agents();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].name, "agent-1");

    let rows = concat!(
        "{\"Names\":\"agent-1\",\"Labels\":\"airlift=true,airlift-agent-id=agent-1\",\"State\":\"running\"}\n",
        "{\"Names\":\"grafana\",\"Labels\":\"maintainer=ops\",\"State\":\"running\"}\n",
        "definitely not json\n",
    );
    let docker = docker_with(ScriptedCli::new(vec![Ok(CliOutput::ok(rows))]));
    let agents = docker.list_agents();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].name, "agent-1");
    assert_eq!(agents[0].state, AgentState::Running);

    let aws = aws_with(ScriptedCli::new(vec![Ok(CliOutput::ok(one_reservation(
        vec![
            ec2_instance(Some("agent-1"), "running"),
            ec2_instance(None, "running"),
        ],
    )))]));
    let agents = aws.list_agents();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].name, "agent-1");

    let railway = railway_with(ScriptedRailwayApi::new(vec![Ok(railway_services(vec![
        json!({ "node": {
            "id": "svc-1",
            "name": "agent-1",
            "deployments": { "edges": [{ "node": { "status": "SUCCESS" } }] },
        }}),
        json!({ "node": { "id": "svc-2" } }),
    ]))]));
    let agents = railway.list_agents();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].name, "agent-1");
    assert_eq!(agents[0].state, AgentState::Running);
}

#[test]
fn transport_failures_land_in_the_launch_result() {
    let gcp = gcp_with(ScriptedComputeApi {
        fail_insert: Some("compute backend unavailable".to_string()),
        ..ScriptedComputeApi::default()
    });
    let result = gcp.launch(&launch_request("agent-x"));
    assert_eq!(result.state, AgentState::Failed);
    assert!(result.error.expect("error").contains("compute backend unavailable"));

    let docker = docker_with(ScriptedCli::new(vec![Err(anyhow!(
        "is the docker CLI installed?"
    ))]));
    let result = docker.launch(&launch_request("agent-x"));
    assert_eq!(result.state, AgentState::Failed);
    assert!(result.error.expect("error").contains("docker CLI"));

    let aws = aws_with(ScriptedCli::new(vec![Err(anyhow!("network unreachable"))]));
    let result = aws.launch(&launch_request("agent-x"));
    assert_eq!(result.state, AgentState::Failed);
    assert!(result.error.expect("error").contains("network unreachable"));

    let railway = railway_with(ScriptedRailwayApi::new(vec![Err(anyhow!(
        "tls handshake failed"
    ))]));
    let result = railway.launch(&launch_request("agent-x"));
    assert_eq!(result.state, AgentState::Failed);
    assert!(result.error.expect("error").contains("tls handshake failed"));
}

#[test]
fn fresh_units_read_as_starting_until_the_worker_reports() {
    // The unit exists and is live, but nothing was written to the store
    // yet: status must say launching, never running.
    let gcp = gcp_with(ScriptedComputeApi {
        instance: Some(gce_instance("agent-1", "RUNNING", true)),
        ..ScriptedComputeApi::default()
    });
    assert_eq!(gcp.status("agent-1").state, AgentState::Starting);

    let docker = docker_with(ScriptedCli::new(vec![Ok(CliOutput::ok(
        json!([{ "State": { "Status": "running", "ExitCode": 0 } }]).to_string(),
    ))]));
    assert_eq!(docker.status("agent-1").state, AgentState::Starting);

    let aws = aws_with(ScriptedCli::new(vec![Ok(CliOutput::ok(one_reservation(
        vec![ec2_instance(Some("agent-1"), "running")],
    )))]));
    assert_eq!(aws.status("agent-1").state, AgentState::Starting);

    // Railway has no store channel; a building deployment is starting.
    let railway = railway_with(ScriptedRailwayApi::new(vec![
        Ok(railway_services(vec![json!({ "node": {
            "id": "svc-1",
            "name": "agent-1",
            "deployments": { "edges": [] },
        }})])),
        Ok(json!({ "data": { "deployments": { "edges": [
            { "node": { "id": "dep-1", "status": "BUILDING" } }
        ]}}})),
    ]));
    assert_eq!(railway.status("agent-1").state, AgentState::Starting);
}

#[test]
fn absent_agents_read_as_not_found() {
    let gcp = gcp_with(ScriptedComputeApi::default());
    assert_eq!(gcp.status("ghost").state, AgentState::NotFound);

    let docker = docker_with(ScriptedCli::new(vec![Ok(CliOutput::err(
        "Error: No such container: ghost",
    ))]));
    assert_eq!(docker.status("ghost").state, AgentState::NotFound);

    let aws = aws_with(ScriptedCli::new(vec![Ok(CliOutput::ok(
        empty_reservations(),
    ))]));
    assert_eq!(aws.status("ghost").state, AgentState::NotFound);

    let railway = railway_with(ScriptedRailwayApi::new(vec![Ok(railway_services(
        Vec::new(),
    ))]));
    assert_eq!(railway.status("ghost").state, AgentState::NotFound);
}

#[test]
fn gcp_launch_keeps_credentials_out_of_the_payload() {
    let api = ScriptedComputeApi::default();
    let inserted = api.inserted.clone();
    let gcp = gcp_with(api);

    let result = gcp.launch(&launch_request("agent-1"));
    assert_eq!(result.state, AgentState::Starting);

    let bodies = inserted.borrow();
    let body = bodies.first().expect("one insert");
    let items = body["metadata"]["items"].as_array().expect("items");

    let startup = items
        .iter()
        .find(|item| item["key"] == "startup-script")
        .expect("startup script item");
    let script = startup["value"].as_str().expect("script text");
    // The capability token travels as its own metadata attribute, never
    // inside the script.
    assert!(!script.contains("sk-ant-api03-conformance"));
    assert!(
        items
            .iter()
            .any(|item| item["key"] == "anthropic-api-key"
                && item["value"] == "sk-ant-api03-conformance")
    );
}
