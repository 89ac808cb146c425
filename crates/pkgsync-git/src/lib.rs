//! Git operations for pkgsync.
//!
//! This crate owns the on-disk working copies: cloning or fetching a tracked
//! remote, resolving a pushed ref to a commit, checking it out, packing the
//! tree into a zip artifact and resetting the tree afterwards. Everything
//! shells out to the `git` binary.
//!
//! # Example
//!
//! ```no_run
//! use pkgsync_git::WorkingCopy;
//! use pkgsync_version::RefName;
//! use std::path::Path;
//!
//! let copy = WorkingCopy::sync("git@github.com:acme/pkg.git", Path::new("/srv/repos/github.com_acme_pkg"))
//!     .expect("sync");
//! let resolved = copy.resolve(&RefName::parse("refs/heads/main")).expect("resolve");
//!
//! let checkout = copy.checkout(&resolved).expect("checkout");
//! println!("checked out {}", checkout.commit());
//! // the tree is reset to the commit when `checkout` goes out of scope
//! ```

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use pkgsync_version::{RefKind, RefName};
use serde::{Deserialize, Serialize};

pub mod archive;
pub mod url;

pub use archive::create_artifact;
pub use url::{RemoteId, git_url_to_directory};

/// Name of the remote every working copy tracks
pub const REMOTE: &str = "origin";

/// Run git in `dir` and return trimmed stdout
pub(crate) fn git(dir: &Path, args: &[&str]) -> Result<String> {
    git_with_env(dir, args, &[])
}

pub(crate) fn git_with_env(dir: &Path, args: &[&str], env: &[(&str, &str)]) -> Result<String> {
    tracing::debug!(dir = %dir.display(), "git {}", args.join(" "));

    let output = Command::new("git")
        .args(args)
        .envs(env.iter().map(|(k, v)| (OsStr::new(k), OsStr::new(v))))
        .env("GIT_TERMINAL_PROMPT", "0")
        .current_dir(dir)
        .output()
        .with_context(|| format!("failed to run git {}", args.first().unwrap_or(&"")))?;

    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Check if the git working tree is clean (no uncommitted or untracked changes)
pub fn is_clean(path: &Path) -> Result<bool> {
    Ok(git(path, &["status", "--porcelain"])?.is_empty())
}

/// A ref resolved to a concrete commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRef {
    pub name: RefName,
    pub commit: String,
}

impl ResolvedRef {
    pub fn kind(&self) -> RefKind {
        self.name.kind()
    }

    pub fn short_name(&self) -> &str {
        self.name.short_name()
    }

    /// First seven characters of the commit
    pub fn short_commit(&self) -> &str {
        self.commit.get(..7).unwrap_or(&self.commit)
    }
}

/// A local clone of a tracked remote.
#[derive(Debug, Clone)]
pub struct WorkingCopy {
    path: PathBuf,
    url: String,
}

impl WorkingCopy {
    /// Clone `url` into `path` on first use, fetch on every later use.
    ///
    /// Fetching never prunes: branches deleted upstream keep resolving to
    /// their last-known commit.
    pub fn sync(url: &str, path: &Path) -> Result<Self> {
        let copy = Self {
            path: path.to_path_buf(),
            url: url.to_string(),
        };

        if path.join(".git").exists() {
            git(path, &["remote", "set-url", REMOTE, url])?;
            copy.fetch()?;
        } else {
            copy.clone_fresh()?;
        }

        Ok(copy)
    }

    fn clone_fresh(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .context("working copy path has no parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create repository dir {}", parent.display()))?;

        tracing::info!(url = %self.url, path = %self.path.display(), "cloning repository");
        let target = std::path::absolute(&self.path)
            .with_context(|| format!("failed to resolve {}", self.path.display()))?;
        let target = target.to_string_lossy();
        git(
            parent,
            &["clone", "--origin", REMOTE, self.url.as_str(), target.as_ref()],
        )
        .with_context(|| format!("failed to clone {}", self.url))?;
        Ok(())
    }

    fn fetch(&self) -> Result<()> {
        tracing::info!(url = %self.url, "fetching repository");
        git(
            &self.path,
            &[
                "fetch",
                "--force",
                "--no-prune",
                REMOTE,
                "+refs/heads/*:refs/remotes/origin/*",
                "+refs/tags/*:refs/tags/*",
            ],
        )
        .with_context(|| format!("failed to fetch {}", self.url))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Resolve a pushed ref to the commit it points at.
    ///
    /// Branches resolve through the remote-tracking ref, tags are peeled to
    /// their commit.
    pub fn resolve(&self, name: &RefName) -> Result<ResolvedRef> {
        let local = match name.kind() {
            RefKind::Branch => format!("refs/remotes/{REMOTE}/{}", name.short_name()),
            RefKind::Tag => format!("refs/tags/{}", name.short_name()),
        };

        let commit = git(
            &self.path,
            &["rev-parse", "--verify", "--quiet", &format!("{local}^{{commit}}")],
        )
        .with_context(|| format!("ref {name} not found in {}", self.url))?;

        Ok(ResolvedRef {
            name: name.clone(),
            commit,
        })
    }

    /// Check out a resolved ref.
    ///
    /// Branches move the local branch to the remote tip, tags detach HEAD at
    /// the tag commit. The tree is reset and cleaned both now and when the
    /// returned guard is dropped.
    pub fn checkout(&self, resolved: &ResolvedRef) -> Result<Checkout<'_>> {
        let commit = resolved.commit.as_str();
        match resolved.kind() {
            RefKind::Branch => git(
                &self.path,
                &["checkout", "--force", "-B", resolved.short_name(), commit],
            ),
            RefKind::Tag => git(&self.path, &["checkout", "--force", "--detach", commit]),
        }
        .with_context(|| format!("failed to check out {}", resolved.name))?;

        let checkout = Checkout {
            copy: self,
            commit: resolved.commit.clone(),
        };
        checkout.reset()?;
        Ok(checkout)
    }

    /// Discard every local change so the tree matches `commit`
    pub fn reset_hard(&self, commit: &str) -> Result<()> {
        git(&self.path, &["reset", "--hard", "--quiet", commit])?;
        git(&self.path, &["clean", "-fd", "--quiet"])?;
        Ok(())
    }
}

/// A checked-out commit; resets the working tree on drop.
#[derive(Debug)]
pub struct Checkout<'a> {
    copy: &'a WorkingCopy,
    commit: String,
}

impl Checkout<'_> {
    pub fn commit(&self) -> &str {
        &self.commit
    }

    pub fn path(&self) -> &Path {
        self.copy.path()
    }

    /// Reset the tree to the checked-out commit
    pub fn reset(&self) -> Result<()> {
        self.copy
            .reset_hard(&self.commit)
            .with_context(|| format!("failed to reset {}", self.copy.path().display()))
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        match self.reset() {
            Ok(()) => tracing::debug!(commit = %self.commit, "working copy reset"),
            Err(e) => tracing::warn!(
                path = %self.copy.path().display(),
                "failed to reset working copy: {:#}",
                e
            ),
        }
    }
}
