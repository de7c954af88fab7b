//! Worker entry point.
//!
//! The bootstrap payload launches this binary as the unprivileged agent
//! user once the unit has its runtime, credentials, and workspace in
//! place. It owns the whole worker lifecycle: report `running`, drive the
//! session loop with the periodic sync thread alongside it, and on exit do
//! a final sync, persist a terminal status, and shut the unit down (or
//! idle, per the keep-alive flag).

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use airlift_harness::looping::{LoopConfig, LoopOutcome, SleepPacer, run_loop};
use airlift_harness::session::ClaudeSession;
use airlift_harness::state::{APP_SPEC_FILE, StatusToken};
use airlift_harness::store::SyncTarget;
use airlift_harness::sync::{PeriodicSync, SyncContext, sync_once, write_status};
use airlift_harness::{logging, looping};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "airlift-harness",
    version,
    about = "Continuous coding-agent loop that runs inside an airlift unit"
)]
struct Cli {
    /// Workspace directory holding app_spec.txt.
    #[arg(long)]
    workspace: PathBuf,

    /// Project directory the agent works in (usually workspace/project).
    #[arg(long)]
    project_dir: PathBuf,

    /// Agent identifier; determines the store key prefix.
    #[arg(long)]
    agent_id: String,

    /// State store: gs://bucket, s3://bucket, or a local directory.
    #[arg(long)]
    store: String,

    /// Maximum sessions to run (0 = unbounded).
    #[arg(long, default_value_t = 0)]
    max_iterations: u32,

    /// Keep the unit alive after the loop ends instead of shutting down.
    #[arg(long)]
    keep_alive: bool,

    /// Command run to terminate the unit when the loop ends.
    #[arg(long)]
    shutdown_command: Option<String>,

    /// Seconds between background state syncs.
    #[arg(long, default_value_t = 60)]
    sync_interval_secs: u64,

    /// Wall-clock budget per session, in seconds.
    #[arg(long, default_value_t = 3600)]
    session_timeout_secs: u64,

    /// File collecting worker output; synced to the store as the agent log.
    #[arg(long, default_value = "/var/log/agent.log")]
    log_file: PathBuf,
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        error!("{:#}", err);
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let target: SyncTarget = cli
        .store
        .parse()
        .with_context(|| format!("parse store uri '{}'", cli.store))?;
    let ctx = SyncContext {
        agent_id: cli.agent_id.clone(),
        project_dir: cli.project_dir.clone(),
        log_path: cli.log_file.clone(),
        target,
    };

    let app_spec_path = cli.workspace.join(APP_SPEC_FILE);
    let app_spec = fs::read_to_string(&app_spec_path)
        .with_context(|| format!("read task spec {}", app_spec_path.display()))?;
    fs::create_dir_all(&cli.project_dir)
        .with_context(|| format!("create project dir {}", cli.project_dir.display()))?;

    info!(
        agent_id = %cli.agent_id,
        store = %cli.store,
        max_iterations = cli.max_iterations,
        "worker starting"
    );
    write_status(&ctx, StatusToken::Running)?;

    let periodic = PeriodicSync::start(ctx.clone(), Duration::from_secs(cli.sync_interval_secs));
    let config = LoopConfig {
        max_iterations: cli.max_iterations,
        session_timeout: Duration::from_secs(cli.session_timeout_secs),
        ..LoopConfig::default()
    };

    let result = run_loop(&ctx, &app_spec, &ClaudeSession, &SleepPacer, &config, |report| {
        info!(
            iteration = report.iteration,
            phase = ?report.phase,
            succeeded = report.succeeded,
            pending = ?report.pending_before,
            "iteration finished"
        );
    });

    periodic.stop();
    if let Err(err) = sync_once(&ctx) {
        warn!(err = %err, "final sync failed");
    }

    let terminal = match &result {
        // Budget exhaustion is a terminal outcome, not a failure.
        Ok(_) => StatusToken::Completed,
        Err(_) => StatusToken::Failed,
    };
    if let Err(err) = write_status(&ctx, terminal) {
        warn!(err = %err, "terminal status write failed");
    }

    match &result {
        Ok(LoopOutcome {
            stop: looping::LoopStop::Complete,
            iterations_run,
        }) => info!(iterations_run, "all features completed"),
        Ok(LoopOutcome {
            stop: looping::LoopStop::BudgetExhausted { max_iterations, .. },
            ..
        }) => info!(max_iterations, "iteration budget exhausted"),
        Err(_) => {}
    }

    finish_unit(&cli);
    result.map(|_| ())
}

/// Shut the unit down or idle, per the keep-alive flag.
fn finish_unit(cli: &Cli) {
    if cli.keep_alive {
        info!("keep-alive set; unit stays up for inspection");
        return;
    }
    let Some(shutdown) = &cli.shutdown_command else {
        info!("no shutdown command configured; worker exits, unit stays up");
        return;
    };
    info!(command = %shutdown, "terminating unit");
    let status = Command::new("sh").arg("-c").arg(shutdown).status();
    if let Err(err) = status {
        warn!(err = %err, "shutdown command failed to start");
    }
}
