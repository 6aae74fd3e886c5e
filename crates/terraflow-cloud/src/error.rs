//! Core error types

use crate::operation::OperationKind;
use crate::pipeline::PipelineState;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by workspaces, the store and the process layer
#[derive(Error, Debug)]
pub enum CloudError {
    /// Pipeline has no result to hand out yet
    #[error("Pipeline {0}")]
    Pipeline(PipelineState),

    #[error("{kind} operation that started at {started_at} is still running")]
    OperationInProgress {
        kind: OperationKind,
        started_at: DateTime<Utc>,
    },

    #[error("{operation} failed with exit code {exit_code}: {output}")]
    ToolFailed {
        operation: String,
        exit_code: i32,
        output: String,
    },

    /// Failure of a background operation, reported on a later call
    #[error("{kind} operation failed: {message}")]
    OperationFailed {
        kind: OperationKind,
        message: String,
    },

    #[error("No change_summary record found in plan output")]
    NoPlanSummaryFound,

    #[error("State file not found: {0}")]
    MissingState(PathBuf),

    #[error("Invalid result store file: {0}")]
    InvalidStoreFile(String),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Lost track of process {0}")]
    ProcessLost(String),

    #[error(transparent)]
    SharedProvider(#[from] SharedProviderError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] terraflow_config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// "Try again later" signals that are not real failures
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CloudError::Pipeline(_) | CloudError::OperationInProgress { .. }
        )
    }

    /// Pipeline state carried by a transient pipeline error
    pub fn pipeline_state(&self) -> Option<PipelineState> {
        match self {
            CloudError::Pipeline(state) => Some(*state),
            _ => None,
        }
    }
}

/// Shared provider start failures
///
/// Cloneable so that callers queued behind a failed start all observe the
/// same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SharedProviderError {
    #[error("Failed to start provider plugin: {0}")]
    Spawn(String),

    #[error("Provider plugin exited (code {code:?}) before printing its reattach address: {output}")]
    Exited { code: Option<i32>, output: String },

    #[error("Timed out after {0:?} waiting for the provider plugin reattach address")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CloudError::Pipeline(PipelineState::Locked).is_transient());
        assert!(
            CloudError::OperationInProgress {
                kind: OperationKind::Apply,
                started_at: Utc::now(),
            }
            .is_transient()
        );
        assert!(!CloudError::NoPlanSummaryFound.is_transient());
        assert!(
            !CloudError::ToolFailed {
                operation: "apply".to_string(),
                exit_code: 1,
                output: "boom".to_string(),
            }
            .is_transient()
        );
    }

    #[test]
    fn test_tool_failure_keeps_diagnostic_verbatim() {
        let err = CloudError::ToolFailed {
            operation: "destroy".to_string(),
            exit_code: 1,
            output: "Error: DependencyViolation".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "destroy failed with exit code 1: Error: DependencyViolation"
        );
    }
}
