//! Feature list storage and validation.
//!
//! The feature list is the worker's source of truth for what remains to be
//! done. A missing file means decomposition has not happened yet; a file
//! that fails to parse is treated as having no usable entries rather than
//! aborting the loop.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, warn};

use crate::state::FeatureList;

const V1_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/feature_list/v1.schema.json"
));

/// Whether decomposition has produced a feature list yet.
///
/// Existence-based on purpose: a corrupt list keeps the worker in the
/// implementing phase instead of re-decomposing over earlier work.
pub fn feature_list_exists(project_dir: &Path) -> bool {
    project_dir.join(crate::state::FEATURE_LIST_FILE).exists()
}

/// Load the feature list from `project_dir`.
///
/// Returns `None` when the file is missing. A file that exists but does not
/// parse is logged and surfaced as an empty list, matching the loop's
/// "no usable entries" handling.
pub fn load_feature_list(project_dir: &Path) -> Option<FeatureList> {
    let path = project_dir.join(crate::state::FEATURE_LIST_FILE);
    if !path.exists() {
        return None;
    }
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "failed to read feature list");
            return Some(FeatureList::default());
        }
    };
    match serde_json::from_str(&contents) {
        Ok(list) => Some(list),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "feature list does not parse");
            Some(FeatureList::default())
        }
    }
}

/// Validate a feature list document against the v1 schema.
///
/// Used after a decomposition session: the initializer's output is data,
/// not free-form progress, so a list that does not conform fails the
/// session.
pub fn validate_feature_list(raw: &str) -> Result<FeatureList> {
    let instance: Value = serde_json::from_str(raw).context("parse feature list json")?;
    let schema: Value = serde_json::from_str(V1_SCHEMA).context("parse feature list schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile feature list schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!(
            "feature list schema violations:\n- {}",
            messages.join("\n- ")
        );
    }
    let list: FeatureList = serde_json::from_str(raw).context("parse feature list as v1 struct")?;
    Ok(list)
}

/// Validate the on-disk feature list in `project_dir`.
pub fn validate_feature_list_file(project_dir: &Path) -> Result<FeatureList> {
    let path = project_dir.join(crate::state::FEATURE_LIST_FILE);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    validate_feature_list(&contents)
}

/// Atomically write a feature list (temp file + rename).
pub fn write_feature_list(project_dir: &Path, list: &FeatureList) -> Result<()> {
    let path = project_dir.join(crate::state::FEATURE_LIST_FILE);
    debug!(path = %path.display(), entries = list.features.len(), "writing feature list");
    let mut buf = serde_json::to_string_pretty(list).context("serialize feature list")?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp feature list {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &path)
        .with_context(|| format!("replace feature list {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Feature, FeatureStatus};

    #[test]
    fn missing_file_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(load_feature_list(temp.path()).is_none());
        assert!(!feature_list_exists(temp.path()));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let list = FeatureList {
            features: vec![Feature {
                id: 1,
                description: "parse config".to_string(),
                status: FeatureStatus::Pending,
            }],
        };
        write_feature_list(temp.path(), &list).expect("write");
        let loaded = load_feature_list(temp.path()).expect("load");
        assert_eq!(loaded, list);
    }

    #[test]
    fn unparseable_file_degrades_to_empty_list() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("feature_list.json"), "{not json").expect("write");
        let loaded = load_feature_list(temp.path()).expect("present");
        assert!(loaded.features.is_empty());
        assert!(feature_list_exists(temp.path()));
    }

    #[test]
    fn schema_accepts_wellformed_lists() {
        let raw = r#"{"features":[{"id":1,"description":"add CLI","status":"pending"}]}"#;
        let list = validate_feature_list(raw).expect("valid");
        assert_eq!(list.features.len(), 1);
    }

    #[test]
    fn schema_rejects_bad_status_and_missing_fields() {
        let bad_status = r#"{"features":[{"id":1,"description":"x","status":"done"}]}"#;
        let err = validate_feature_list(bad_status).unwrap_err();
        assert!(err.to_string().contains("schema violations"));

        let missing = r#"{"features":[{"id":1,"status":"pending"}]}"#;
        assert!(validate_feature_list(missing).is_err());

        let extra_top_level = r#"{"features":[],"notes":"hi"}"#;
        assert!(validate_feature_list(extra_top_level).is_err());
    }
}
