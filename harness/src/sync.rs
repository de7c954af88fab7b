//! State synchronization to the store.
//!
//! Two writers exist by construction: the loop thread (per-iteration and
//! final syncs) and the periodic timer thread. They never run a sync at
//! the same moment the other mutates the same file — the timer performs
//! snapshot reads of whatever has been flushed, so partial session output
//! is externally visible without locking.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, warn};

use crate::state::{
    self, FEATURE_LIST_FILE, PROGRESS_FILE, StatusToken, agent_log_key, status_key,
};
use crate::store::SyncTarget;

/// Everything a sync pass needs to know about one agent.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub agent_id: String,
    pub project_dir: PathBuf,
    pub log_path: PathBuf,
    pub target: SyncTarget,
}

/// Copy the current state files to the store. Absent files are skipped —
/// the store invariant is append/overwrite only, so there is nothing to
/// delete.
pub fn sync_once(ctx: &SyncContext) -> Result<()> {
    debug!(agent_id = %ctx.agent_id, "syncing state to store");

    let uploads = [
        (
            ctx.project_dir.join(FEATURE_LIST_FILE),
            state::feature_list_key(&ctx.agent_id),
        ),
        (
            ctx.project_dir.join(PROGRESS_FILE),
            state::progress_key(&ctx.agent_id),
        ),
        (ctx.log_path.clone(), agent_log_key(&ctx.agent_id)),
    ];

    for (local, key) in uploads {
        if !local.exists() {
            continue;
        }
        if let Err(err) = ctx.target.upload_file(&local, &key) {
            // A failed upload must not take the worker down; the next pass
            // retries with fresher state anyway.
            warn!(key = %key, err = %err, "state upload failed");
        }
    }
    Ok(())
}

/// Persist a status token for this agent.
pub fn write_status(ctx: &SyncContext, token: StatusToken) -> Result<()> {
    let key = status_key(&ctx.agent_id);
    debug!(agent_id = %ctx.agent_id, status = %token, "writing status");
    ctx.target.upload_text(&key, &format!("{token}\n"))
}

/// Handle for the background sync thread.
pub struct PeriodicSync {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl PeriodicSync {
    /// Spawn a thread that syncs every `interval`, independent of session
    /// boundaries.
    pub fn start(ctx: SyncContext, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::spawn(move || {
            let mut next_sync = Instant::now() + interval;
            loop {
                if stop_flag.load(Ordering::Relaxed) {
                    return;
                }
                if Instant::now() >= next_sync {
                    if let Err(err) = sync_once(&ctx) {
                        warn!(err = %err, "periodic sync failed");
                    }
                    next_sync = Instant::now() + interval;
                }
                thread::sleep(Duration::from_millis(250));
            }
        });
        Self { stop, handle }
    }

    /// Stop the timer and wait for it to exit. Does not run a final sync;
    /// the caller owns the terminal sync so it can order it before the
    /// terminal status write.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn local_ctx(temp: &std::path::Path) -> SyncContext {
        SyncContext {
            agent_id: "a-1".to_string(),
            project_dir: temp.join("project"),
            log_path: temp.join("agent.log"),
            target: SyncTarget::Local {
                root: temp.join("store"),
            },
        }
    }

    #[test]
    fn sync_uploads_present_files_and_skips_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = local_ctx(temp.path());
        fs::create_dir_all(&ctx.project_dir).expect("mkdir");
        fs::write(ctx.project_dir.join(FEATURE_LIST_FILE), "{\"features\":[]}").expect("write");
        // No progress file, no log yet.

        sync_once(&ctx).expect("sync");

        let store = temp.path().join("store");
        assert!(store.join("agents/a-1/feature_list.json").is_file());
        assert!(!store.join("agents/a-1/claude-progress.txt").exists());
        assert!(!store.join("agents/a-1/logs/agent.log").exists());
    }

    #[test]
    fn write_status_places_one_line_token() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = local_ctx(temp.path());
        write_status(&ctx, StatusToken::Running).expect("write");
        let token = fs::read_to_string(temp.path().join("store/agents/a-1/status"))
            .expect("read status");
        assert_eq!(token, "running\n");
    }

    #[test]
    fn periodic_sync_stops_cleanly() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = local_ctx(temp.path());
        fs::create_dir_all(&ctx.project_dir).expect("mkdir");
        let sync = PeriodicSync::start(ctx, Duration::from_secs(3600));
        sync.stop();
    }
}
