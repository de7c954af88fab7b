//! Append-only progress notes (`claude-progress.txt`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::state::PROGRESS_FILE;

/// Notes shown to a session when no previous progress exists.
pub const NO_PROGRESS: &str = "No previous progress.";

/// Load progress notes from previous sessions.
pub fn load_progress(project_dir: &Path) -> String {
    let path = project_dir.join(PROGRESS_FILE);
    match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(_) => NO_PROGRESS.to_string(),
    }
}

/// Append a note to the progress file, creating it if missing.
pub fn append_progress(project_dir: &Path, note: &str) -> Result<()> {
    let path = project_dir.join(PROGRESS_FILE);
    let mut contents = if path.exists() {
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?
    } else {
        String::new()
    };
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(note);
    contents.push('\n');
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_default_notes() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(load_progress(temp.path()), NO_PROGRESS);
    }

    #[test]
    fn append_accumulates_notes_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        append_progress(temp.path(), "implemented feature 1").expect("append");
        append_progress(temp.path(), "implemented feature 2").expect("append");
        let notes = load_progress(temp.path());
        assert_eq!(notes, "implemented feature 1\nimplemented feature 2\n");
    }
}
