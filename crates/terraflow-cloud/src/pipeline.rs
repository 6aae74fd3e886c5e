//! Operation lock and result mailbox
//!
//! Two files inside a workspace directory let a stateless, repeatedly
//! polled caller observe a long-running background operation:
//!
//! - `.terraflow.lock` exists while an operation owns the workspace. It is
//!   created atomically before the tool starts and removed only by the
//!   guard that created it. A lock left behind by a crashed process stays
//!   until an operator removes it.
//! - `.terraflow.store` holds `<exit code>\n<captured output>` once the
//!   background runner has finished. Reading it deletes it, so a result is
//!   handed out at most once. It is written through `.terraflow.store.tmp`
//!   while the lock is still held, so a temporary file without a lock was
//!   left by a writer that died and is discarded.

use crate::error::{CloudError, Result};
use crate::operation::OperationKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub const LOCK_FILE: &str = ".terraflow.lock";
pub const STORE_FILE: &str = ".terraflow.store";
pub const STORE_TMP_FILE: &str = ".terraflow.store.tmp";

/// Why a pipeline has no result to hand out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Nothing was started (or its result was already consumed)
    NotStarted,
    /// An operation holds the workspace lock
    Locked,
    /// The operation finished but its result is not flushed yet
    NoStoreYet,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::NotStarted => write!(f, "not started"),
            PipelineState::Locked => write!(f, "locked"),
            PipelineState::NoStoreYet => write!(f, "has no stored result yet"),
        }
    }
}

/// Result of a finished background operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineResult {
    pub exit_code: i32,
    pub output: String,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder: String,
    pub pid: u32,
    pub operation: OperationKind,
    pub acquired_at: DateTime<Utc>,
}

/// Holder name written into lock files created by this host
pub fn local_holder() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".to_string())
}

pub fn lock_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE)
}

pub fn store_path(dir: &Path) -> PathBuf {
    dir.join(STORE_FILE)
}

fn store_tmp_path(dir: &Path) -> PathBuf {
    dir.join(STORE_TMP_FILE)
}

pub fn is_locked(dir: &Path) -> bool {
    lock_path(dir).exists()
}

/// Read the lock file, if any
///
/// A lock file that is not valid JSON still locks the workspace; reading
/// it reports a JSON error.
pub fn read_lock(dir: &Path) -> Result<Option<LockInfo>> {
    match fs::read_to_string(lock_path(dir)) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove a lock regardless of its owner
///
/// Operator action for locks left behind by crashed processes. A partial
/// result the dead owner was writing goes with it. Returns whether a lock
/// was removed.
pub fn force_unlock(dir: &Path) -> Result<bool> {
    let removed = match fs::remove_file(lock_path(dir)) {
        Ok(()) => {
            warn!(dir = %dir.display(), "Operation lock removed by operator");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };
    discard_partial_result(dir)?;
    Ok(removed)
}

/// Remove a temporary result file; returns whether one existed
fn discard_partial_result(dir: &Path) -> Result<bool> {
    match fs::remove_file(store_tmp_path(dir)) {
        Ok(()) => {
            warn!(dir = %dir.display(), "Discarded partially written pipeline result");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// RAII guard for the workspace operation lock
#[derive(Debug)]
pub struct OperationLock {
    lock_path: PathBuf,
    released: bool,
}

impl OperationLock {
    /// Create the lock file, failing with `Locked` if it already exists
    pub async fn acquire(dir: &Path, operation: OperationKind) -> Result<Self> {
        let lock_path = lock_path(dir);
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(dir = %dir.display(), "Workspace is locked by another operation");
                return Err(CloudError::Pipeline(PipelineState::Locked));
            }
            Err(e) => return Err(e.into()),
        };

        // Guard first, so a failed write still removes the file
        let guard = Self {
            lock_path,
            released: false,
        };

        let info = LockInfo {
            holder: local_holder(),
            pid: std::process::id(),
            operation,
            acquired_at: Utc::now(),
        };
        file.write_all(serde_json::to_string_pretty(&info)?.as_bytes())
            .await?;
        file.flush().await?;

        debug!(dir = %dir.display(), operation = %operation, "Acquired operation lock");
        Ok(guard)
    }

    /// Release the lock
    pub fn release(mut self) -> Result<()> {
        self.remove()
    }

    fn remove(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            match fs::remove_file(&self.lock_path) {
                Ok(()) => debug!("Released operation lock"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(path = %self.lock_path.display(), error = %e, "Failed to release operation lock");
        }
    }
}

/// Store the result of a finished operation
///
/// Written to a temporary file first and renamed into place, so a reader
/// never sees a half-written result.
pub async fn write_pipeline_result(dir: &Path, exit_code: i32, output: &str) -> Result<()> {
    let tmp = store_tmp_path(dir);
    tokio::fs::write(&tmp, format!("{}\n{}", exit_code, output)).await?;
    tokio::fs::rename(&tmp, store_path(dir)).await?;
    debug!(dir = %dir.display(), exit_code, "Stored pipeline result");
    Ok(())
}

/// Non-consuming look at the pipeline
///
/// `None` means a result is waiting to be consumed. `NoStoreYet` without a
/// lock is a partial result of a writer that died; the next consuming read
/// discards it.
pub fn inspect_pipeline(dir: &Path) -> Result<Option<PipelineState>> {
    if is_locked(dir) {
        return Ok(Some(PipelineState::Locked));
    }
    if store_path(dir).exists() {
        return Ok(None);
    }
    if store_tmp_path(dir).exists() {
        return Ok(Some(PipelineState::NoStoreYet));
    }
    Ok(Some(PipelineState::NotStarted))
}

/// Consume the result of a finished background operation
///
/// A temporary result file with no lock next to it is discarded and the
/// pipeline reads as `NotStarted`.
pub fn parse_pipeline_result(dir: &Path) -> Result<PipelineResult> {
    match inspect_pipeline(dir)? {
        None => {}
        Some(PipelineState::NoStoreYet) => {
            discard_partial_result(dir)?;
            return Err(CloudError::Pipeline(PipelineState::NotStarted));
        }
        Some(state) => return Err(CloudError::Pipeline(state)),
    }

    let path = store_path(dir);
    let content = match fs::read(&path) {
        Ok(content) => content,
        // Consumed by a concurrent poller between the check and the read
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(CloudError::Pipeline(PipelineState::NotStarted));
        }
        Err(e) => return Err(e.into()),
    };
    fs::remove_file(&path)?;

    let content = String::from_utf8_lossy(&content);
    let (code, output) = content
        .split_once('\n')
        .ok_or_else(|| CloudError::InvalidStoreFile("missing exit code line".to_string()))?;
    let exit_code = code
        .trim()
        .parse::<i32>()
        .map_err(|e| CloudError::InvalidStoreFile(format!("bad exit code {:?}: {}", code, e)))?;

    Ok(PipelineResult {
        exit_code,
        output: output.to_string(),
    })
}
