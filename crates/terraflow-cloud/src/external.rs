//! Reconciler-facing client
//!
//! The reconciler calls observe/create/update/delete on every reconcile and
//! expects each call to return quickly. Mutations start background
//! operations; observe reports them as in progress until their result has
//! been picked up.

use crate::error::{CloudError, Result};
use crate::operation::{OperationKind, OperationOutcome};
use crate::pipeline::PipelineState;
use crate::workspace::{Handle, Workspace};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Lifecycle operations a reconciler drives
#[async_trait]
pub trait ExternalClient: Send + Sync {
    /// Current view of the external resource
    async fn observe(&self) -> Result<Observation>;

    /// Start creating the resource
    async fn create(&self) -> Result<()>;

    /// Start bringing the resource in line with its configuration
    async fn update(&self) -> Result<()>;

    /// Start deleting the resource
    async fn delete(&self) -> Result<()>;
}

/// What `observe` found
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub resource_exists: bool,
    pub resource_up_to_date: bool,
    /// A background operation is still running; check again later
    pub async_in_progress: bool,
    pub external_id: Option<String>,
    pub attributes: Map<String, Value>,
}

impl Observation {
    fn in_progress() -> Self {
        Self {
            resource_exists: true,
            resource_up_to_date: true,
            async_in_progress: true,
            ..Default::default()
        }
    }
}

/// Receives the outcome of background operations
pub trait CompletionHandler: Send + Sync {
    fn on_complete(&self, handle: &Handle, outcome: OperationOutcome);
}

/// Handler that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCompletionHandler;

impl CompletionHandler for LoggingCompletionHandler {
    fn on_complete(&self, handle: &Handle, outcome: OperationOutcome) {
        match &outcome.error {
            None => info!(handle = %handle, operation = %outcome.kind, "Operation completed"),
            Some(e) => error!(
                handle = %handle,
                operation = %outcome.kind,
                exit_code = ?outcome.exit_code,
                error = %e,
                "Operation failed"
            ),
        }
    }
}

/// [`ExternalClient`] backed by one workspace
pub struct WorkspaceExternal {
    workspace: Arc<Workspace>,
    handler: Arc<dyn CompletionHandler>,
}

impl WorkspaceExternal {
    pub fn new(workspace: Arc<Workspace>, handler: Arc<dyn CompletionHandler>) -> Self {
        Self { workspace, handler }
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    /// Pick up the stored result of a finished background operation
    ///
    /// `Ok(true)` means an operation is still pending.
    fn take_pipeline_result(&self) -> Result<bool> {
        let kind = self.workspace.last_operation().map(|r| r.kind);
        match self.workspace.poll_result() {
            Ok(result) if result.success() => Ok(false),
            Ok(result) => Err(CloudError::ToolFailed {
                operation: kind.map_or_else(|| "background operation".to_string(), |k| k.to_string()),
                exit_code: result.exit_code,
                output: result.output.trim().to_string(),
            }),
            Err(CloudError::Pipeline(PipelineState::NotStarted)) => Ok(false),
            Err(e) if e.is_transient() => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn launch(&self, kind: OperationKind) -> Result<()> {
        self.workspace.init().await?;

        let handler = Arc::clone(&self.handler);
        let handle = self.workspace.handle().clone();
        let on_complete = move |outcome: OperationOutcome| handler.on_complete(&handle, outcome);
        match kind {
            OperationKind::Destroy => self.workspace.destroy_async(on_complete).await,
            _ => self.workspace.apply_async(on_complete).await,
        }
    }

    async fn start(&self, kind: OperationKind) -> Result<()> {
        match self.launch(kind).await {
            Err(e) if e.is_transient() => {
                debug!(handle = %self.workspace.handle(), operation = %kind, reason = %e, "Operation not started, retry later");
                Ok(())
            }
            other => other,
        }
    }
}

#[async_trait]
impl ExternalClient for WorkspaceExternal {
    async fn observe(&self) -> Result<Observation> {
        if self.take_pipeline_result()? {
            return Ok(Observation::in_progress());
        }

        match self.workspace.init().await {
            Err(e) if e.is_transient() => return Ok(Observation::in_progress()),
            other => other?,
        }
        // nothing applied yet
        if self.workspace.state().is_none() && !self.workspace.is_busy() {
            return Ok(Observation::default());
        }

        let refresh = match self.workspace.refresh().await {
            Err(e) if e.is_transient() => return Ok(Observation::in_progress()),
            other => other?,
        };
        if refresh.async_in_progress {
            return Ok(Observation::in_progress());
        }
        let Some(state) = refresh.state.filter(|s| s.exists()) else {
            return Ok(Observation::default());
        };

        let plan = match self.workspace.plan().await {
            Err(e) if e.is_transient() => return Ok(Observation::in_progress()),
            other => other?,
        };

        Ok(Observation {
            resource_exists: true,
            resource_up_to_date: plan.up_to_date,
            async_in_progress: false,
            external_id: state.resource_id().map(str::to_string),
            attributes: state.attributes(),
        })
    }

    async fn create(&self) -> Result<()> {
        self.start(OperationKind::Apply).await
    }

    async fn update(&self) -> Result<()> {
        self.start(OperationKind::Apply).await
    }

    async fn delete(&self) -> Result<()> {
        self.start(OperationKind::Destroy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, OperationKind, bool)>>,
    }

    impl CompletionHandler for Recorder {
        fn on_complete(&self, handle: &Handle, outcome: OperationOutcome) {
            self.seen.lock().unwrap().push((
                handle.to_string(),
                outcome.kind,
                outcome.is_success(),
            ));
        }
    }

    #[test]
    fn test_in_progress_observation_needs_no_action() {
        let observation = Observation::in_progress();
        assert!(observation.resource_exists);
        assert!(observation.resource_up_to_date);
        assert!(observation.async_in_progress);
    }

    #[test]
    fn test_completion_handler_receives_outcome() {
        let recorder = Recorder::default();
        let handle = Handle::new("default/bucket");
        recorder.on_complete(
            &handle,
            OperationOutcome {
                kind: OperationKind::Destroy,
                exit_code: Some(0),
                error: None,
            },
        );
        LoggingCompletionHandler.on_complete(
            &handle,
            OperationOutcome {
                kind: OperationKind::Apply,
                exit_code: Some(1),
                error: Some(CloudError::NoPlanSummaryFound),
            },
        );

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[(handle.to_string(), OperationKind::Destroy, true)]
        );
    }
}
