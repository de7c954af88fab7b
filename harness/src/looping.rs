//! The continuous execution loop.
//!
//! One iteration is one agent session. The first-ever session decomposes
//! the task spec into a feature list; every later session implements the
//! first pending feature. The loop only ends on an exhausted iteration
//! budget or a fully completed list — session errors feed a backoff ladder
//! and the loop keeps going.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::features::{
    feature_list_exists, load_feature_list, validate_feature_list_file,
};
use crate::progress::load_progress;
use crate::prompts::PromptEngine;
use crate::session::{SessionRequest, SessionRunner};
use crate::state::FEATURE_LIST_FILE;
use crate::sync::{SyncContext, sync_once};

/// Recovery parameters for consecutive session failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failure count at which exponential backoff kicks in.
    pub threshold: u32,
    /// Delay applied below the threshold.
    pub short_delay: Duration,
    /// Base of the exponential ladder at/above the threshold.
    pub backoff_base: Duration,
    /// Ceiling for the exponential delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            short_delay: Duration::from_secs(10),
            backoff_base: Duration::from_secs(30),
            max_delay: Duration::from_secs(900),
        }
    }
}

/// Delay before the next session after `consecutive_failures` (>= 1).
pub fn retry_delay(policy: &RetryPolicy, consecutive_failures: u32) -> Duration {
    if consecutive_failures < policy.threshold {
        return policy.short_delay;
    }
    // base * 2^(failures - 1), saturating well before Duration overflow.
    let exponent = (consecutive_failures - 1).min(20);
    let delay = policy.backoff_base * 2u32.pow(exponent);
    delay.min(policy.max_delay)
}

/// Loop configuration fixed at worker boot.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Maximum sessions to run (0 = unbounded).
    pub max_iterations: u32,
    /// Wall-clock budget per session.
    pub session_timeout: Duration,
    /// Capture limit for session output.
    pub output_limit_bytes: usize,
    /// Pause after a successful session before the next one.
    pub pause_between_sessions: Duration,
    pub retry: RetryPolicy,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            session_timeout: Duration::from_secs(60 * 60),
            output_limit_bytes: 200_000,
            pause_between_sessions: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// What a given iteration was doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// First-ever session: produce the feature list.
    Decomposing,
    /// Implement the first pending feature.
    Implementing,
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every feature is completed.
    Complete,
    /// The configured iteration budget was reached.
    BudgetExhausted { iterations: u32, max_iterations: u32 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub iterations_run: u32,
    pub stop: LoopStop,
}

/// Per-iteration report passed to the observer callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationReport {
    pub iteration: u32,
    pub phase: SessionPhase,
    pub succeeded: bool,
    /// Pending entries before the session, when a list existed.
    pub pending_before: Option<usize>,
}

/// Injection point for delays, so tests observe the backoff ladder without
/// sleeping through it.
pub trait Pacer {
    fn pause(&self, duration: Duration);
}

/// Pacer that actually sleeps.
pub struct SleepPacer;

impl Pacer for SleepPacer {
    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Run sessions until the budget is exhausted or the feature list is
/// complete.
///
/// Termination is checked per iteration, in order: budget first, then
/// completion (which never applies to the decomposition session). Every
/// iteration ends with a state sync regardless of outcome, so a
/// replacement worker can resume from the last synced state.
pub fn run_loop<S: SessionRunner, P: Pacer, F: FnMut(&IterationReport)>(
    ctx: &SyncContext,
    app_spec: &str,
    runner: &S,
    pacer: &P,
    config: &LoopConfig,
    mut on_iteration: F,
) -> Result<LoopOutcome> {
    let engine = PromptEngine::new();
    let mut iterations_run = 0u32;
    let mut consecutive_failures = 0u32;

    loop {
        let next_iter = iterations_run + 1;
        if config.max_iterations > 0 && next_iter > config.max_iterations {
            info!(max_iterations = config.max_iterations, "iteration budget reached");
            return Ok(LoopOutcome {
                iterations_run,
                stop: LoopStop::BudgetExhausted {
                    iterations: iterations_run,
                    max_iterations: config.max_iterations,
                },
            });
        }

        let first_session = !feature_list_exists(&ctx.project_dir);
        let mut pending_before = None;
        if !first_session {
            let list = load_feature_list(&ctx.project_dir).unwrap_or_default();
            if list.all_completed() {
                info!(features = list.features.len(), "all features completed");
                return Ok(LoopOutcome {
                    iterations_run,
                    stop: LoopStop::Complete,
                });
            }
            pending_before = Some(list.pending_count());
        }

        let phase = if first_session {
            SessionPhase::Decomposing
        } else {
            SessionPhase::Implementing
        };
        info!(iteration = next_iter, ?phase, pending = ?pending_before, "starting session");

        let prompt = match phase {
            SessionPhase::Decomposing => engine.initializer(app_spec)?,
            SessionPhase::Implementing => {
                engine.coding(app_spec, &load_progress(&ctx.project_dir))?
            }
        };
        let request = SessionRequest {
            workdir: ctx.project_dir.clone(),
            prompt,
            timeout: config.session_timeout,
            output_limit_bytes: config.output_limit_bytes,
            log_path: ctx.log_path.clone(),
        };

        let mut session_result = runner.run(&request);
        if phase == SessionPhase::Decomposing && session_result.is_ok() {
            session_result = check_decomposition(ctx);
        }
        iterations_run = next_iter;

        let succeeded = session_result.is_ok();
        on_iteration(&IterationReport {
            iteration: iterations_run,
            phase,
            succeeded,
            pending_before,
        });

        // Re-sync whatever the session flushed, success or not.
        sync_once(ctx).context("post-iteration sync")?;

        match session_result {
            Ok(()) => {
                consecutive_failures = 0;
                pacer.pause(config.pause_between_sessions);
            }
            Err(err) => {
                consecutive_failures += 1;
                let delay = retry_delay(&config.retry, consecutive_failures);
                warn!(
                    iteration = iterations_run,
                    consecutive_failures,
                    delay_secs = delay.as_secs(),
                    err = %err,
                    "session failed, backing off"
                );
                pacer.pause(delay);
            }
        }
    }
}

/// The initializer's output is data, not free-form progress: the feature
/// list it wrote must exist and conform to the schema, or the session
/// counts as failed.
fn check_decomposition(ctx: &SyncContext) -> Result<()> {
    if !feature_list_exists(&ctx.project_dir) {
        return Err(anyhow!("decomposition session wrote no feature list"));
    }
    match validate_feature_list_file(&ctx.project_dir) {
        Ok(_) => Ok(()),
        Err(err) => {
            // The list did not exist before this session, so dropping the
            // rejected write is safe and lets the retry decompose again.
            let path = ctx.project_dir.join(FEATURE_LIST_FILE);
            let _ = std::fs::remove_file(&path);
            Err(err.context("decomposition output rejected"))
        }
    }
}
