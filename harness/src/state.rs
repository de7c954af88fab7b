//! Shared state model for airlift agents.
//!
//! These types define the contract between the worker loop and the
//! orchestrator: the one-word status token a worker persists, the feature
//! list it owns, and the store key layout both sides read. They must stay
//! deterministic and free of I/O.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle marker written by the worker at defined transitions.
///
/// The orchestrator-side vocabulary is wider (stopped, not_found, unknown);
/// a worker only ever writes one of these four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusToken {
    Starting,
    Running,
    Completed,
    Failed,
}

impl StatusToken {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusToken::Starting => "starting",
            StatusToken::Running => "running",
            StatusToken::Completed => "completed",
            StatusToken::Failed => "failed",
        }
    }
}

impl fmt::Display for StatusToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusToken {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "starting" => Ok(StatusToken::Starting),
            "running" => Ok(StatusToken::Running),
            "completed" => Ok(StatusToken::Completed),
            "failed" => Ok(StatusToken::Failed),
            other => Err(format!("unknown status token '{other}'")),
        }
    }
}

/// Status of a single feature within the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureStatus {
    Pending,
    Completed,
}

/// One decomposed work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: u32,
    pub description: String,
    pub status: FeatureStatus,
}

/// Ordered work items for one agent (`feature_list.json`).
///
/// Owned and mutated exclusively by the worker loop; everything else treats
/// it as read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureList {
    pub features: Vec<Feature>,
}

impl FeatureList {
    /// Features still waiting to be implemented, in list order.
    pub fn pending(&self) -> impl Iterator<Item = &Feature> {
        self.features
            .iter()
            .filter(|f| f.status == FeatureStatus::Pending)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    pub fn completed_count(&self) -> usize {
        self.features
            .iter()
            .filter(|f| f.status == FeatureStatus::Completed)
            .count()
    }

    /// True only when the list is non-empty and every entry is completed.
    ///
    /// An empty list means decomposition has not produced work yet, which
    /// is not the same as being done.
    pub fn all_completed(&self) -> bool {
        !self.features.is_empty()
            && self
                .features
                .iter()
                .all(|f| f.status == FeatureStatus::Completed)
    }
}

/// Completed/total counts surfaced in status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureProgress {
    pub completed: usize,
    pub total: usize,
}

impl FeatureProgress {
    pub fn of(list: &FeatureList) -> Self {
        Self {
            completed: list.completed_count(),
            total: list.features.len(),
        }
    }
}

impl fmt::Display for FeatureProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} features completed", self.completed, self.total)
    }
}

/// Store key for the one-line status token.
pub fn status_key(agent_id: &str) -> String {
    format!("agents/{agent_id}/status")
}

/// Store key for the feature list.
pub fn feature_list_key(agent_id: &str) -> String {
    format!("agents/{agent_id}/feature_list.json")
}

/// Store key for the append-only progress notes.
pub fn progress_key(agent_id: &str) -> String {
    format!("agents/{agent_id}/claude-progress.txt")
}

/// Store key for the worker stdout/stderr tail.
pub fn agent_log_key(agent_id: &str) -> String {
    format!("agents/{agent_id}/logs/agent.log")
}

/// Worker-local file name of the feature list.
pub const FEATURE_LIST_FILE: &str = "feature_list.json";
/// Worker-local file name of the progress notes.
pub const PROGRESS_FILE: &str = "claude-progress.txt";
/// Worker-local file name of the task specification.
pub const APP_SPEC_FILE: &str = "app_spec.txt";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{completed, pending};

    #[test]
    fn status_token_round_trips() {
        for token in [
            StatusToken::Starting,
            StatusToken::Running,
            StatusToken::Completed,
            StatusToken::Failed,
        ] {
            let parsed: StatusToken = token.as_str().parse().expect("parse");
            assert_eq!(parsed, token);
        }
        assert!("terminated".parse::<StatusToken>().is_err());
    }

    #[test]
    fn empty_list_is_never_all_completed() {
        assert!(!FeatureList::default().all_completed());
    }

    #[test]
    fn all_completed_requires_every_entry() {
        let list = FeatureList {
            features: vec![completed(1), pending(2), pending(3)],
        };
        assert!(!list.all_completed());
        assert_eq!(list.pending_count(), 2);
        assert_eq!(list.completed_count(), 1);

        let done = FeatureList {
            features: vec![completed(1), completed(2)],
        };
        assert!(done.all_completed());
    }

    #[test]
    fn progress_formats_counts() {
        let list = FeatureList {
            features: vec![completed(1), completed(2), pending(3)],
        };
        assert_eq!(
            FeatureProgress::of(&list).to_string(),
            "2/3 features completed"
        );
    }

    #[test]
    fn keys_are_stable() {
        assert_eq!(status_key("a-1"), "agents/a-1/status");
        assert_eq!(feature_list_key("a-1"), "agents/a-1/feature_list.json");
        assert_eq!(progress_key("a-1"), "agents/a-1/claude-progress.txt");
        assert_eq!(agent_log_key("a-1"), "agents/a-1/logs/agent.log");
    }
}
