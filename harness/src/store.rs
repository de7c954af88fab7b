//! Worker-side uploads to the durable state store.
//!
//! The worker never talks to the orchestrator; it copies its state files to
//! object storage (or a local directory for container backends) and the
//! orchestrator reads the same keys. Cloud uploads go through the storage
//! CLIs the bootstrap script installs (`gsutil`, `aws`).

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::process::run_command_with_timeout;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const UPLOAD_OUTPUT_LIMIT: usize = 16 * 1024;

/// Where state files are synced to, parsed from a store URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
    /// `gs://bucket` — uploaded with `gsutil`.
    Gcs { bucket: String },
    /// `s3://bucket` — uploaded with the `aws` CLI.
    S3 { bucket: String },
    /// Plain path — copied into a local directory tree.
    Local { root: PathBuf },
}

impl FromStr for SyncTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(bucket) = s.strip_prefix("gs://") {
            let bucket = bucket.trim_end_matches('/');
            if bucket.is_empty() || bucket.contains('/') {
                return Err(anyhow!("invalid GCS store uri '{s}' (expected gs://bucket)"));
            }
            return Ok(SyncTarget::Gcs {
                bucket: bucket.to_string(),
            });
        }
        if let Some(bucket) = s.strip_prefix("s3://") {
            let bucket = bucket.trim_end_matches('/');
            if bucket.is_empty() || bucket.contains('/') {
                return Err(anyhow!("invalid S3 store uri '{s}' (expected s3://bucket)"));
            }
            return Ok(SyncTarget::S3 {
                bucket: bucket.to_string(),
            });
        }
        if s.is_empty() {
            return Err(anyhow!("store uri must not be empty"));
        }
        Ok(SyncTarget::Local {
            root: PathBuf::from(s),
        })
    }
}

impl SyncTarget {
    /// Upload a local file to `key` in the store.
    #[instrument(skip_all)]
    pub fn upload_file(&self, local: &Path, key: &str) -> Result<()> {
        debug!(local = %local.display(), key, "uploading state file");
        match self {
            SyncTarget::Gcs { bucket } => {
                let mut cmd = Command::new("gsutil");
                cmd.arg("-q")
                    .arg("cp")
                    .arg(local)
                    .arg(format!("gs://{bucket}/{key}"));
                run_upload(cmd, "gsutil cp")
            }
            SyncTarget::S3 { bucket } => {
                let mut cmd = Command::new("aws");
                cmd.arg("s3")
                    .arg("cp")
                    .arg(local)
                    .arg(format!("s3://{bucket}/{key}"))
                    .arg("--quiet");
                run_upload(cmd, "aws s3 cp")
            }
            SyncTarget::Local { root } => {
                let dest = root.join(key);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create {}", parent.display()))?;
                }
                fs::copy(local, &dest)
                    .with_context(|| format!("copy {} to {}", local.display(), dest.display()))?;
                Ok(())
            }
        }
    }

    /// Upload literal text to `key` in the store.
    pub fn upload_text(&self, key: &str, contents: &str) -> Result<()> {
        if let SyncTarget::Local { root } = self {
            let dest = root.join(key);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            return fs::write(&dest, contents)
                .with_context(|| format!("write {}", dest.display()));
        }

        let scratch = std::env::temp_dir().join(format!(
            "airlift-{}-{}",
            std::process::id(),
            key.replace('/', "-")
        ));
        fs::write(&scratch, contents)
            .with_context(|| format!("write scratch {}", scratch.display()))?;
        let result = self.upload_file(&scratch, key);
        let _ = fs::remove_file(&scratch);
        result
    }
}

fn run_upload(cmd: Command, label: &str) -> Result<()> {
    let output = run_command_with_timeout(cmd, None, UPLOAD_TIMEOUT, UPLOAD_OUTPUT_LIMIT)
        .with_context(|| format!("run {label}"))?;
    if output.timed_out {
        return Err(anyhow!("{label} timed out"));
    }
    if !output.status.success() {
        return Err(anyhow!(
            "{label} failed with status {:?}: {}",
            output.status.code(),
            output.stderr_text().trim()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_store_uris() {
        assert_eq!(
            "gs://my-bucket".parse::<SyncTarget>().expect("gcs"),
            SyncTarget::Gcs {
                bucket: "my-bucket".to_string()
            }
        );
        assert_eq!(
            "s3://my-bucket/".parse::<SyncTarget>().expect("s3"),
            SyncTarget::S3 {
                bucket: "my-bucket".to_string()
            }
        );
        assert_eq!(
            "/var/lib/agents".parse::<SyncTarget>().expect("local"),
            SyncTarget::Local {
                root: PathBuf::from("/var/lib/agents")
            }
        );
        assert!("gs://".parse::<SyncTarget>().is_err());
        assert!("gs://bucket/with/path".parse::<SyncTarget>().is_err());
        assert!("".parse::<SyncTarget>().is_err());
    }

    #[test]
    fn local_target_copies_into_key_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store_root = temp.path().join("store");
        let source = temp.path().join("feature_list.json");
        fs::write(&source, "{\"features\":[]}\n").expect("write source");

        let target = SyncTarget::Local {
            root: store_root.clone(),
        };
        target
            .upload_file(&source, "agents/a-1/feature_list.json")
            .expect("upload");
        target
            .upload_text("agents/a-1/status", "running\n")
            .expect("upload text");

        let copied = fs::read_to_string(store_root.join("agents/a-1/feature_list.json"))
            .expect("read copied");
        assert_eq!(copied, "{\"features\":[]}\n");
        let status =
            fs::read_to_string(store_root.join("agents/a-1/status")).expect("read status");
        assert_eq!(status, "running\n");
    }
}
