//! Last-operation tracking for a workspace
//!
//! Answers "is something still running here" without blocking, and keeps
//! the terminal error of the last finished operation until it is reported.

use crate::error::{CloudError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Kind of external-tool operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Init,
    Refresh,
    Apply,
    Destroy,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Init => write!(f, "init"),
            OperationKind::Refresh => write!(f, "refresh"),
            OperationKind::Apply => write!(f, "apply"),
            OperationKind::Destroy => write!(f, "destroy"),
        }
    }
}

/// Point-in-time copy of the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub started_at: DateTime<Utc>,
    /// `None` while the operation is running
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl OperationRecord {
    pub fn is_running(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Tracker for the most recent operation of one workspace
#[derive(Debug, Default)]
pub struct LastOperation {
    record: Mutex<Option<OperationRecord>>,
}

impl LastOperation {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<OperationRecord>> {
        match self.record.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record the start of `kind`
    ///
    /// Refuses while any operation is running.
    pub fn mark_start(&self, kind: OperationKind) -> Result<()> {
        let mut record = self.lock();
        if let Some(running) = record.as_ref().filter(|r| r.is_running()) {
            return Err(CloudError::OperationInProgress {
                kind: running.kind,
                started_at: running.started_at,
            });
        }
        *record = Some(OperationRecord {
            kind,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        });
        Ok(())
    }

    /// Record the end of the running operation
    pub fn mark_end(&self, error: Option<String>) {
        if let Some(record) = self.lock().as_mut() {
            record.ended_at = Some(Utc::now());
            record.error = error;
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(OperationRecord::is_running)
    }

    /// The running operation, if any
    pub fn running(&self) -> Option<OperationRecord> {
        self.lock().clone().filter(OperationRecord::is_running)
    }

    pub fn snapshot(&self) -> Option<OperationRecord> {
        self.lock().clone()
    }

    /// Take a finished record, leaving the tracker empty
    ///
    /// Running operations are left in place.
    pub fn take_finished(&self) -> Option<OperationRecord> {
        let mut record = self.lock();
        if record.as_ref().is_some_and(|r| !r.is_running()) {
            return record.take();
        }
        None
    }

    /// Forget the last operation
    pub fn flush(&self) {
        *self.lock() = None;
    }
}

/// Outcome handed to completion callbacks
#[derive(Debug)]
pub struct OperationOutcome {
    pub kind: OperationKind,
    /// Exit code of the external process, if it got that far
    pub exit_code: Option<i32>,
    pub error: Option<CloudError>,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
