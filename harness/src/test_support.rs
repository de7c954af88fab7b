//! Shared fixtures and scripted doubles for harness tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::features::write_feature_list;
use crate::looping::Pacer;
use crate::session::{SessionRequest, SessionRunner};
use crate::state::{Feature, FeatureList, FeatureStatus};

/// A pending feature with a placeholder description.
pub fn pending(id: u32) -> Feature {
    Feature {
        id,
        description: format!("feature {id}"),
        status: FeatureStatus::Pending,
    }
}

/// A completed feature with a placeholder description.
pub fn completed(id: u32) -> Feature {
    Feature {
        id,
        description: format!("feature {id}"),
        status: FeatureStatus::Completed,
    }
}

/// One scripted session: an outcome plus an optional feature list the
/// "agent" writes into the working directory before returning.
pub struct ScriptedSession {
    pub outcome: Result<(), String>,
    pub feature_list: Option<FeatureList>,
}

/// Session runner that replays a script instead of spawning processes.
pub struct ScriptedSessions {
    script: RefCell<VecDeque<ScriptedSession>>,
    calls: RefCell<usize>,
}

impl ScriptedSessions {
    /// Script from bare outcomes (no file writes).
    pub fn new(outcomes: Vec<Result<(), String>>) -> Self {
        Self::with_script(
            outcomes
                .into_iter()
                .map(|outcome| ScriptedSession {
                    outcome,
                    feature_list: None,
                })
                .collect(),
        )
    }

    pub fn with_script(script: Vec<ScriptedSession>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            calls: RefCell::new(0),
        }
    }

    /// Number of sessions that actually ran.
    pub fn calls(&self) -> usize {
        *self.calls.borrow()
    }
}

impl SessionRunner for ScriptedSessions {
    fn run(&self, request: &SessionRequest) -> Result<()> {
        *self.calls.borrow_mut() += 1;
        let step = self
            .script
            .borrow_mut()
            .pop_front()
            .expect("scripted sessions exhausted");
        if let Some(list) = &step.feature_list {
            write_feature_list(&request.workdir, list).expect("scripted feature list write");
        }
        step.outcome.map_err(|msg| anyhow!(msg))
    }
}

/// Pacer that records requested pauses instead of sleeping.
#[derive(Default)]
pub struct RecordingPacer {
    pauses: RefCell<Vec<Duration>>,
}

impl RecordingPacer {
    pub fn pauses(&self) -> Vec<Duration> {
        self.pauses.borrow().clone()
    }
}

impl Pacer for RecordingPacer {
    fn pause(&self, duration: Duration) {
        self.pauses.borrow_mut().push(duration);
    }
}
