//! Per-repository locking for working copies.
//!
//! A working copy is shared by every delivery for its repository, so runs
//! against the same checkout must not interleave. [`RepoLocks`] serializes
//! threads of this process per repository path (different repositories never
//! wait on each other) and additionally holds a [`LockFile`] next to the
//! working copy so a second pkgsync process on the same host backs off.
//!
//! The lock file is held with an OS advisory lock, so it is released by the
//! kernel when its holder exits, crashed or not. While held it contains JSON
//! metadata about the holder (PID, hostname, timestamp, repository URL); the
//! metadata is cleared on release.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Extension appended to a working-copy path to form its lock file
pub const LOCK_EXTENSION: &str = "lock";

/// Default time to wait for another process holding a working copy
pub const DEFAULT_WAIT: Duration = Duration::from_secs(600);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Get the lock file path for a working copy (`<path>.lock`)
pub fn lock_path(repo_path: &Path) -> PathBuf {
    let mut name = repo_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(LOCK_EXTENSION);
    repo_path.with_file_name(name)
}

/// Information stored in the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID of the lock holder
    pub pid: u32,
    /// Hostname where the lock was acquired
    pub hostname: String,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
    /// Remote URL of the repository being processed
    pub repository: Option<String>,
}

/// Lock file handle that automatically releases on Drop
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: Option<File>,
}

impl LockFile {
    /// Take the lock file at `path`, failing at once if a live process
    /// holds it.
    ///
    /// Metadata left behind by a holder that died is taken over.
    pub fn acquire(path: &Path, repository: Option<&str>) -> Result<Self> {
        Self::try_acquire(path, repository)?.ok_or_else(|| held_error(path))
    }

    /// Take the lock file, polling for up to `wait` while another process
    /// holds it.
    pub fn acquire_waiting(path: &Path, wait: Duration, repository: Option<&str>) -> Result<Self> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lock) = Self::try_acquire(path, repository)? {
                return Ok(lock);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(held_error(path));
            }
            tracing::debug!(lock = %path.display(), "lock file held by another process, waiting");
            thread::sleep(POLL_INTERVAL.min(remaining));
        }
    }

    fn try_acquire(path: &Path, repository: Option<&str>) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock dir {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Error(e)) => {
                return Err(e).with_context(|| format!("failed to lock {}", path.display()));
            }
        }

        // metadata is cleared on release; anything left belongs to a dead holder
        let mut previous = String::new();
        file.read_to_string(&mut previous)
            .with_context(|| format!("failed to read lock file {}", path.display()))?;
        if !previous.trim().is_empty() {
            match serde_json::from_str::<LockInfo>(&previous) {
                Ok(info) => tracing::warn!(
                    lock = %path.display(),
                    pid = info.pid,
                    hostname = %info.hostname,
                    "taking over lock file left by an exited process"
                ),
                Err(_) => tracing::warn!(lock = %path.display(), "overwriting corrupt lock file"),
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            repository: repository.map(str::to_string),
        };
        let json = serde_json::to_string_pretty(&info).context("failed to serialize lock info")?;

        file.set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(json.as_bytes()))
            .and_then(|()| file.sync_all())
            .with_context(|| format!("failed to write lock file {}", path.display()))?;

        Ok(Some(Self {
            path: path.to_path_buf(),
            file: Some(file),
        }))
    }

    /// Clear the metadata and release the OS lock
    pub fn release(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            // the lock goes with the handle even if clearing fails
            file.set_len(0)
                .with_context(|| format!("failed to clear lock file {}", self.path.display()))?;
            file.unlock()
                .with_context(|| format!("failed to unlock {}", self.path.display()))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("failed to release lock: {:#}", e);
        }
    }
}

fn held_error(path: &Path) -> anyhow::Error {
    match read_lock_info(path) {
        Ok(holder) => anyhow!(
            "lock already held by pid {} on {} since {} (repository: {:?})",
            holder.pid,
            holder.hostname,
            holder.acquired_at,
            holder.repository
        ),
        Err(_) => anyhow!("lock already held: {}", path.display()),
    }
}

/// Read lock info from a specific path
pub fn read_lock_info(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    let info: LockInfo = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock JSON from {}", path.display()))?;
    Ok(info)
}

/// Exclusive access to working copies, keyed by path.
#[derive(Debug)]
pub struct RepoLocks {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
    wait: Duration,
}

impl Default for RepoLocks {
    fn default() -> Self {
        Self::new(DEFAULT_WAIT)
    }
}

impl RepoLocks {
    /// `wait` bounds how long to wait for another process; threads of this
    /// process always queue.
    pub fn new(wait: Duration) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            wait,
        }
    }

    /// Block until no other thread holds `repo_path`, then take it.
    ///
    /// Fails when another process keeps the lock file for longer than the
    /// configured wait.
    pub fn lock(&self, repo_path: &Path, repository: &str) -> Result<RepoGuard<'_>> {
        {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            while held.contains(repo_path) {
                tracing::debug!(path = %repo_path.display(), "waiting for repository lock");
                held = self
                    .released
                    .wait(held)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            held.insert(repo_path.to_path_buf());
        }

        // released again if the lock file cannot be taken
        let slot = Slot {
            locks: self,
            path: repo_path.to_path_buf(),
        };
        let file = LockFile::acquire_waiting(&lock_path(repo_path), self.wait, Some(repository))?;

        Ok(RepoGuard { file, _slot: slot })
    }

    #[cfg(test)]
    fn is_held(&self, repo_path: &Path) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(repo_path)
    }
}

#[derive(Debug)]
struct Slot<'a> {
    locks: &'a RepoLocks,
    path: PathBuf,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let mut held = self
            .locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.path);
        self.locks.released.notify_all();
    }
}

/// Held repository lock; releases the lock file, then the in-process slot.
#[derive(Debug)]
pub struct RepoGuard<'a> {
    file: LockFile,
    _slot: Slot<'a>,
}

impl RepoGuard<'_> {
    pub fn lock_file(&self) -> &Path {
        self.file.path()
    }
}
