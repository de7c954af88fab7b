//! Orchestrator-side reads of the durable state store.
//!
//! The store is the sole source of truth for what a worker has done; the
//! orchestrator combines it with a live backend query and reconciles the
//! two views. Reconciliation never destructively merges — both raw inputs
//! ride along in the status report.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use airlift_harness::process::run_command_with_timeout;
use airlift_harness::state::{
    FeatureList, FeatureProgress, StatusToken, feature_list_key, progress_key, status_key,
};
use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::{debug, instrument, warn};

use crate::provider::AgentState;

/// Object storage holding `agents/{agent_id}/...` keys.
pub trait StateStore {
    /// Fetch an object as text. Absent objects are `None`, not an error.
    fn download(&self, key: &str) -> Result<Option<String>>;

    /// Create or overwrite an object.
    fn upload(&self, key: &str, contents: &str) -> Result<()>;

    /// Make sure the backing bucket/directory exists.
    fn ensure_bucket(&self, location: &str) -> Result<()>;
}

/// What the worker last persisted for one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreAgentState {
    pub status: Option<StatusToken>,
    pub progress: Option<FeatureProgress>,
    pub has_progress_notes: bool,
}

/// Read status token, feature progress, and progress-note presence.
///
/// Store errors degrade to "nothing reported yet" — a status query must
/// not fail because one key was briefly unreadable.
pub fn read_agent_state(store: &dyn StateStore, agent_id: &str) -> StoreAgentState {
    let mut state = StoreAgentState::default();

    match store.download(&status_key(agent_id)) {
        Ok(Some(raw)) => match raw.trim().parse::<StatusToken>() {
            Ok(token) => state.status = Some(token),
            Err(err) => warn!(agent_id, err = %err, "unrecognized status token in store"),
        },
        Ok(None) => {}
        Err(err) => warn!(agent_id, err = %err, "status download failed"),
    }

    match store.download(&feature_list_key(agent_id)) {
        Ok(Some(raw)) => match serde_json::from_str::<FeatureList>(&raw) {
            Ok(list) => state.progress = Some(FeatureProgress::of(&list)),
            Err(err) => warn!(agent_id, err = %err, "feature list in store does not parse"),
        },
        Ok(None) => {}
        Err(err) => warn!(agent_id, err = %err, "feature list download failed"),
    }

    if let Ok(Some(_)) = store.download(&progress_key(agent_id)) {
        state.has_progress_notes = true;
    }

    state
}

/// Reconcile the worker-persisted status with the live unit state.
///
/// The worker's terminal tokens always win; otherwise the unit decides
/// whether the worker can still be making progress. A unit that exists
/// while the store is silent is launching, and absence of both means the
/// agent was never started.
pub fn reconcile(store_status: Option<StatusToken>, unit: Option<AgentState>) -> AgentState {
    match store_status {
        Some(StatusToken::Completed) => AgentState::Completed,
        Some(StatusToken::Failed) => AgentState::Failed,
        Some(StatusToken::Running) => match unit {
            Some(AgentState::Running | AgentState::Starting | AgentState::Unknown) => {
                AgentState::Running
            }
            Some(AgentState::Completed) => AgentState::Completed,
            Some(AgentState::Failed) => AgentState::Failed,
            Some(AgentState::Stopped | AgentState::NotFound) | None => AgentState::Stopped,
        },
        Some(StatusToken::Starting) => match unit {
            Some(AgentState::Failed) => AgentState::Failed,
            Some(AgentState::Completed) => AgentState::Completed,
            Some(AgentState::Stopped | AgentState::NotFound) | None => AgentState::Stopped,
            Some(_) => AgentState::Starting,
        },
        None => match unit {
            None | Some(AgentState::NotFound) => AgentState::NotFound,
            // Unit exists but the worker has not reported: launching.
            Some(AgentState::Starting | AgentState::Running | AgentState::Unknown) => {
                AgentState::Starting
            }
            Some(state) => state,
        },
    }
}

/// Filesystem-backed store for the container backend.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StateStore for LocalStore {
    fn download(&self, key: &str) -> Result<Option<String>> {
        let path = self.root.join(key);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .with_context(|| format!("read {}", path.display()))
    }

    fn upload(&self, key: &str, contents: &str) -> Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    fn ensure_bucket(&self, _location: &str) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create {}", self.root.display()))
    }
}

/// Source of short-lived backend access tokens.
pub trait TokenSource {
    fn access_token(&self) -> Result<String>;
}

/// Token source shelling out to `gcloud auth print-access-token`.
pub struct GcloudTokenSource;

impl TokenSource for GcloudTokenSource {
    fn access_token(&self) -> Result<String> {
        let mut cmd = Command::new("gcloud");
        cmd.arg("auth").arg("print-access-token");
        let output = run_command_with_timeout(cmd, None, Duration::from_secs(30), 16 * 1024)
            .context("run gcloud auth print-access-token")?;
        if !output.status.success() {
            return Err(anyhow!(
                "gcloud auth print-access-token failed: {}",
                output.stderr_text().trim()
            ));
        }
        let token = output.stdout_text().trim().to_string();
        if token.is_empty() {
            return Err(anyhow!("gcloud returned an empty access token"));
        }
        Ok(token)
    }
}

const GCS_API: &str = "https://storage.googleapis.com/storage/v1";
const GCS_UPLOAD_API: &str = "https://storage.googleapis.com/upload/storage/v1";

/// GCS store over the JSON API with a blocking HTTP client.
pub struct GcsStore {
    bucket: String,
    project: String,
    http: Client,
    tokens: Box<dyn TokenSource>,
}

impl GcsStore {
    pub fn new(bucket: impl Into<String>, project: impl Into<String>) -> Self {
        Self::with_token_source(bucket, project, Box::new(GcloudTokenSource))
    }

    pub fn with_token_source(
        bucket: impl Into<String>,
        project: impl Into<String>,
        tokens: Box<dyn TokenSource>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            project: project.into(),
            http: Client::builder()
                .timeout(Duration::from_secs(30))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("build HTTP client"),
            tokens,
        }
    }
}

impl StateStore for GcsStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    fn download(&self, key: &str) -> Result<Option<String>> {
        let url = format!(
            "{GCS_API}/b/{}/o/{}?alt=media",
            self.bucket,
            encode_object_name(key)
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(self.tokens.access_token()?)
            .send()
            .context("GCS object get")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow!("GCS object get failed: {}", response.status()));
        }
        let body = response.text().context("read GCS object body")?;
        debug!(key, bytes = body.len(), "downloaded store object");
        Ok(Some(body))
    }

    #[instrument(skip(self, contents), fields(bucket = %self.bucket))]
    fn upload(&self, key: &str, contents: &str) -> Result<()> {
        let url = format!(
            "{GCS_UPLOAD_API}/b/{}/o?uploadType=media&name={}",
            self.bucket,
            encode_object_name(key)
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.tokens.access_token()?)
            .header("content-type", "text/plain")
            .body(contents.to_string())
            .send()
            .context("GCS object upload")?;
        if !response.status().is_success() {
            return Err(anyhow!("GCS object upload failed: {}", response.status()));
        }
        Ok(())
    }

    fn ensure_bucket(&self, location: &str) -> Result<()> {
        let get_url = format!("{GCS_API}/b/{}", self.bucket);
        let token = self.tokens.access_token()?;
        let response = self
            .http
            .get(&get_url)
            .bearer_auth(&token)
            .send()
            .context("GCS bucket get")?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(anyhow!("GCS bucket get failed: {}", response.status()));
        }

        let create_url = format!("{GCS_API}/b?project={}", self.project);
        let response = self
            .http
            .post(&create_url)
            .bearer_auth(&token)
            .json(&serde_json::json!({
                "name": self.bucket,
                "location": location,
            }))
            .send()
            .context("GCS bucket create")?;
        if !response.status().is_success() {
            return Err(anyhow!("GCS bucket create failed: {}", response.status()));
        }
        Ok(())
    }
}

/// Percent-encode an object name for the JSON API path (slashes included).
fn encode_object_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MapStore;

    #[test]
    fn object_names_are_path_encoded() {
        assert_eq!(
            encode_object_name("agents/a-1/feature_list.json"),
            "agents%2Fa-1%2Ffeature_list.json"
        );
        assert_eq!(encode_object_name("plain-name_1.txt~"), "plain-name_1.txt~");
    }

    #[test]
    fn local_store_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::new(temp.path().join("data"));
        store.ensure_bucket("local").expect("ensure");
        assert_eq!(store.download("agents/a/status").expect("get"), None);
        store.upload("agents/a/status", "running\n").expect("put");
        assert_eq!(
            store.download("agents/a/status").expect("get"),
            Some("running\n".to_string())
        );
    }

    #[test]
    fn read_agent_state_assembles_progress() {
        let store = MapStore::default();
        store.upload("agents/a-1/status", "running\n").expect("put");
        store
            .upload(
                "agents/a-1/feature_list.json",
                r#"{"features":[
                    {"id":1,"description":"one","status":"completed"},
                    {"id":2,"description":"two","status":"pending"}
                ]}"#,
            )
            .expect("put");

        let state = read_agent_state(&store, "a-1");
        assert_eq!(state.status, Some(StatusToken::Running));
        let progress = state.progress.expect("progress");
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.total, 2);
        assert!(!state.has_progress_notes);
    }

    #[test]
    fn read_agent_state_tolerates_garbage() {
        let store = MapStore::default();
        store.upload("agents/a-1/status", "exploded\n").expect("put");
        store
            .upload("agents/a-1/feature_list.json", "{broken")
            .expect("put");

        let state = read_agent_state(&store, "a-1");
        assert_eq!(state.status, None);
        assert_eq!(state.progress, None);
    }

    #[test]
    fn reconcile_prefers_worker_terminal_tokens() {
        assert_eq!(
            reconcile(Some(StatusToken::Completed), Some(AgentState::Running)),
            AgentState::Completed
        );
        assert_eq!(
            reconcile(Some(StatusToken::Failed), None),
            AgentState::Failed
        );
    }

    #[test]
    fn reconcile_launching_before_worker_reports() {
        assert_eq!(
            reconcile(None, Some(AgentState::Running)),
            AgentState::Starting
        );
        assert_eq!(
            reconcile(None, Some(AgentState::Starting)),
            AgentState::Starting
        );
    }

    #[test]
    fn reconcile_detects_externally_stopped_units() {
        assert_eq!(
            reconcile(Some(StatusToken::Running), None),
            AgentState::Stopped
        );
        assert_eq!(
            reconcile(Some(StatusToken::Running), Some(AgentState::Stopped)),
            AgentState::Stopped
        );
    }

    #[test]
    fn reconcile_absence_everywhere_is_not_found() {
        assert_eq!(reconcile(None, None), AgentState::NotFound);
        assert_eq!(
            reconcile(None, Some(AgentState::NotFound)),
            AgentState::NotFound
        );
    }

    #[test]
    fn reconcile_trusts_unit_terminal_states() {
        assert_eq!(
            reconcile(Some(StatusToken::Running), Some(AgentState::Completed)),
            AgentState::Completed
        );
        assert_eq!(
            reconcile(Some(StatusToken::Starting), Some(AgentState::Failed)),
            AgentState::Failed
        );
        assert_eq!(reconcile(None, Some(AgentState::Stopped)), AgentState::Stopped);
    }
}
