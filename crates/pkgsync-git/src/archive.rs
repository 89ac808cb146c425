//! Zip artifacts of a working tree.
//!
//! The archive reflects the tracked files as they are on disk, uncommitted
//! edits included. `git stash create` records that state as a dangling commit
//! (no refs or stash entries are touched) which `git archive` then packs. The
//! snapshot commit reuses HEAD's dates and a fixed identity, so the same tree
//! always yields the same archive bytes.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::{git, git_with_env};

const SNAPSHOT_NAME: &str = "pkgsync";
const SNAPSHOT_EMAIL: &str = "pkgsync@localhost";

/// Commit id capturing the current working tree of `repo`.
///
/// Returns HEAD itself when there are no local modifications.
pub fn snapshot(repo: &Path) -> Result<String> {
    let head_date = git(repo, &["show", "-s", "--format=%cI", "HEAD"])?;

    let env = [
        ("GIT_AUTHOR_NAME", SNAPSHOT_NAME),
        ("GIT_AUTHOR_EMAIL", SNAPSHOT_EMAIL),
        ("GIT_AUTHOR_DATE", head_date.as_str()),
        ("GIT_COMMITTER_NAME", SNAPSHOT_NAME),
        ("GIT_COMMITTER_EMAIL", SNAPSHOT_EMAIL),
        ("GIT_COMMITTER_DATE", head_date.as_str()),
    ];
    let stash = git_with_env(repo, &["stash", "create"], &env)?;

    if stash.is_empty() {
        git(repo, &["rev-parse", "HEAD"])
    } else {
        Ok(stash)
    }
}

/// Write a zip of the working tree of `repo` to `destination`.
///
/// VCS metadata is never part of the archive and `export-ignore` attributes
/// are honoured. The file appears atomically.
pub fn create_artifact(repo: &Path, destination: &Path) -> Result<()> {
    let destination = std::path::absolute(destination)
        .with_context(|| format!("failed to resolve artifact path {}", destination.display()))?;

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create artifact dir {}", parent.display()))?;
    }

    let tree = snapshot(repo)?;
    let tmp_path = destination.with_extension("zip.tmp");
    let tmp_arg = tmp_path.to_string_lossy();

    let archived = git(
        repo,
        &["archive", "--format=zip", "-o", tmp_arg.as_ref(), tree.as_str()],
    );
    if let Err(e) = archived {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.context(format!("failed to archive {}", repo.display())));
    }

    fs::rename(&tmp_path, &destination).with_context(|| {
        format!("failed to move artifact into place at {}", destination.display())
    })?;

    tracing::debug!(artifact = %destination.display(), tree = %tree, "created artifact");
    Ok(())
}
