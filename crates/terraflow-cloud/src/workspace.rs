//! Per-resource workspace
//!
//! A workspace is a directory holding the rendered configuration and the
//! tool state of exactly one managed resource, plus the machinery to run
//! the tool against it. Synchronous operations block the caller until the
//! tool exits; `apply_async`/`destroy_async` return as soon as the tool is
//! started and report through a callback and the pipeline mailbox.

use crate::error::{CloudError, Result};
use crate::operation::{LastOperation, OperationKind, OperationOutcome, OperationRecord};
use crate::pipeline::{self, OperationLock, PipelineResult, PipelineState};
use crate::plan::{PlanResult, parse_change_summary};
use crate::provider_runner::ProviderRunner;
use crate::render::with_prevent_destroy;
use crate::runner::{ProcessExit, ProcessHandle, ProcessSpec};
use crate::state::StateFile;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

pub const MAIN_CONFIG_FILE: &str = "main.tf.json";
pub const STATE_FILE: &str = "terraform.tfstate";
/// Written by the tool once `init` has succeeded
pub const INIT_LOCK_FILE: &str = ".terraform.lock.hcl";

const INIT_ARGS: &[&str] = &["init", "-input=false"];
const PLAN_ARGS: &[&str] = &[
    "plan",
    "-refresh=false",
    "-input=false",
    "-no-color",
    "-detailed-exitcode",
    "-json",
];
const APPLY_ARGS: &[&str] = &["apply", "-auto-approve", "-input=false"];
const DESTROY_ARGS: &[&str] = &["destroy", "-auto-approve", "-input=false"];
const REFRESH_ARGS: &[&str] = &["apply", "-refresh-only", "-auto-approve", "-input=false"];

/// Plan exit code meaning "succeeded, changes pending"
const PLAN_CHANGES_PENDING: i32 = 2;

/// Callback invoked once an async operation has finished
pub type CompletionCallback = Box<dyn FnOnce(OperationOutcome) + Send + 'static>;

/// Filesystem-safe identifier derived from a stable resource identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(String);

impl Handle {
    /// Lowercase hex SHA-256 of the resource identifier
    pub fn new(resource_id: &str) -> Self {
        Self(format!("{:x}", Sha256::digest(resource_id.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the external tool is invoked
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub executable: PathBuf,
    /// Placed before the subcommand
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ToolSettings {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Result of [`Workspace::refresh`]
#[derive(Debug, Clone, Default)]
pub struct RefreshResult {
    pub exists: bool,
    /// An operation is running; nothing was refreshed
    pub async_in_progress: bool,
    pub is_applying: bool,
    pub is_destroying: bool,
    pub state: Option<StateFile>,
}

/// Result of [`Workspace::import`]
#[derive(Debug, Clone)]
pub struct ImportResult {
    pub exists: bool,
    pub state: StateFile,
}

/// Workspace of one managed resource
pub struct Workspace {
    handle: Handle,
    dir: PathBuf,
    tool: ToolSettings,
    address: String,
    provider_runner: Arc<dyn ProviderRunner>,
    last_operation: LastOperation,
    config: RwLock<Vec<u8>>,
    state: RwLock<Option<StateFile>>,
    process: Mutex<Option<Arc<ProcessHandle>>>,
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("handle", &self.handle)
            .field("dir", &self.dir)
            .field("address", &self.address)
            .field("last_operation", &self.last_operation.snapshot())
            .finish()
    }
}

impl Workspace {
    /// Open (or create) the workspace directory
    ///
    /// Configuration and state already on disk are loaded, so a workspace
    /// survives a restart of the owning process.
    pub async fn open(
        handle: Handle,
        dir: impl Into<PathBuf>,
        tool: ToolSettings,
        address: impl Into<String>,
        provider_runner: Arc<dyn ProviderRunner>,
    ) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let config = match tokio::fs::read(dir.join(MAIN_CONFIG_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let state = StateFile::load(&dir.join(STATE_FILE)).await?;

        debug!(handle = %handle, dir = %dir.display(), "Opened workspace");
        Ok(Self {
            handle,
            dir,
            tool,
            address: address.into(),
            provider_runner,
            last_operation: LastOperation::new(),
            config: RwLock::new(config),
            state: RwLock::new(state),
            process: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<type>.<name>` address of the managed resource
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn last_operation(&self) -> Option<OperationRecord> {
        self.last_operation.snapshot()
    }

    /// Whether an operation of this workspace is running
    pub fn is_busy(&self) -> bool {
        self.last_operation.is_running()
    }

    // ========== Configuration and state files ==========

    pub async fn write_config(&self, bytes: Vec<u8>) -> Result<()> {
        tokio::fs::write(self.dir.join(MAIN_CONFIG_FILE), &bytes).await?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = bytes;
        Ok(())
    }

    pub fn rendered_config(&self) -> Vec<u8> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cached tool state
    pub fn state(&self) -> Option<StateFile> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: Option<StateFile>) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Replace the state on disk and in memory
    pub async fn write_state(&self, state: StateFile) -> Result<()> {
        state.persist(&self.state_path()).await?;
        self.set_state(Some(state));
        Ok(())
    }

    /// Write the cached state back to disk unchanged
    pub async fn persist_state(&self) -> Result<()> {
        if let Some(state) = self.state() {
            state.persist(&self.state_path()).await?;
        }
        Ok(())
    }

    /// Reload the state file into memory
    pub async fn load_state(&self) -> Result<Option<StateFile>> {
        let state = StateFile::load(&self.state_path()).await?;
        self.set_state(state.clone());
        Ok(state)
    }

    async fn require_state(&self) -> Result<StateFile> {
        self.load_state()
            .await?
            .ok_or_else(|| CloudError::MissingState(self.state_path()))
    }

    // ========== Synchronous operations ==========

    /// Run `init` unless it already succeeded in this directory
    pub async fn init(&self) -> Result<()> {
        if self.dir.join(INIT_LOCK_FILE).exists() {
            debug!(handle = %self.handle, "Workspace already initialised");
            return Ok(());
        }

        let lock = self.begin(OperationKind::Init).await?;
        let result: Result<()> = async {
            let exit = self.run_to_completion(INIT_ARGS).await?;
            ensure_success("init", &exit)
        }
        .await;
        self.finish_sync(lock);
        result
    }

    /// Dry run deciding whether the resource exists and is up to date
    pub async fn plan(&self) -> Result<PlanResult> {
        self.check_idle()?;

        let exit = self.run_to_completion(PLAN_ARGS).await?;
        match exit.code {
            Some(0) | Some(PLAN_CHANGES_PENDING) => {}
            _ => return Err(tool_failed("plan", &exit)),
        }

        let summary = parse_change_summary(&exit.stdout)?;
        debug!(handle = %self.handle, summary = %summary, "Plan finished");
        Ok(summary.into())
    }

    /// Bring the cached state in line with the real resource
    ///
    /// Returns immediately while another operation is running. A failure of
    /// the previous async operation is reported here, once.
    pub async fn refresh(&self) -> Result<RefreshResult> {
        if let Some(running) = self.last_operation.running() {
            debug!(handle = %self.handle, operation = %running.kind, "Refresh skipped, operation in progress");
            let is_applying = running.kind == OperationKind::Apply;
            let is_destroying = running.kind == OperationKind::Destroy;
            let state = self.state();
            return Ok(RefreshResult {
                exists: is_applying
                    || is_destroying
                    || state.as_ref().is_some_and(StateFile::exists),
                async_in_progress: true,
                is_applying,
                is_destroying,
                state,
            });
        }

        if let Some(finished) = self.last_operation.take_finished() {
            if let Some(message) = finished.error {
                return Err(CloudError::OperationFailed {
                    kind: finished.kind,
                    message,
                });
            }
        }

        let lock = self.begin(OperationKind::Refresh).await?;
        let result = self.run_refresh().await;
        self.finish_sync(lock);
        result
    }

    async fn run_refresh(&self) -> Result<RefreshResult> {
        let exit = self.run_to_completion(REFRESH_ARGS).await?;
        ensure_success("refresh", &exit)?;
        let state = self.require_state().await?;
        Ok(RefreshResult {
            exists: state.exists(),
            state: Some(state),
            ..Default::default()
        })
    }

    /// Adopt an existing resource by its external id
    pub async fn import(&self, id: &str) -> Result<ImportResult> {
        let lock = self.begin(OperationKind::Refresh).await?;
        let result = self.run_import(id).await;
        self.finish_sync(lock);
        result
    }

    async fn run_import(&self, id: &str) -> Result<ImportResult> {
        let args = ["import", "-input=false", self.address.as_str(), id];
        let exit = self.run_to_completion(&args).await?;
        ensure_success("import", &exit)?;
        let state = self.require_state().await?;
        Ok(ImportResult {
            exists: state.exists(),
            state,
        })
    }

    /// Apply and wait for the tool to exit
    pub async fn apply(&self) -> Result<StateFile> {
        let lock = self.begin(OperationKind::Apply).await?;
        let result: Result<StateFile> = async {
            let exit = self.run_to_completion(APPLY_ARGS).await?;
            ensure_success("apply", &exit)?;
            self.require_state().await
        }
        .await;
        self.finish_sync(lock);
        result
    }

    /// Destroy and wait for the tool to exit
    pub async fn destroy(&self) -> Result<Option<StateFile>> {
        let lock = self.begin(OperationKind::Destroy).await?;
        let result: Result<Option<StateFile>> = async {
            self.release_protection().await?;
            let exit = self.run_to_completion(DESTROY_ARGS).await?;
            ensure_success("destroy", &exit)?;
            self.load_state().await
        }
        .await;
        self.finish_sync(lock);
        result
    }

    // ========== Asynchronous operations ==========

    /// Start an apply in the background
    ///
    /// Returns `OperationInProgress` or `Pipeline(Locked)` without starting
    /// anything while another operation owns the workspace. `on_complete`
    /// runs exactly once, on a background task, after the result has been
    /// stored. A tool that cannot be started is reported here instead and
    /// `on_complete` is not called.
    pub async fn apply_async<F>(self: &Arc<Self>, on_complete: F) -> Result<()>
    where
        F: FnOnce(OperationOutcome) + Send + 'static,
    {
        self.start_async(OperationKind::Apply, APPLY_ARGS, Box::new(on_complete))
            .await
    }

    /// Start a destroy in the background; see [`Workspace::apply_async`]
    pub async fn destroy_async<F>(self: &Arc<Self>, on_complete: F) -> Result<()>
    where
        F: FnOnce(OperationOutcome) + Send + 'static,
    {
        self.start_async(OperationKind::Destroy, DESTROY_ARGS, Box::new(on_complete))
            .await
    }

    async fn start_async(
        self: &Arc<Self>,
        kind: OperationKind,
        args: &'static [&'static str],
        on_complete: CompletionCallback,
    ) -> Result<()> {
        let lock = self.begin(kind).await?;

        let spawned: Result<Arc<ProcessHandle>> = async {
            if kind == OperationKind::Destroy {
                self.release_protection().await?;
            }
            self.spawn_tool(args).await
        }
        .await;
        let process = match spawned {
            Ok(process) => process,
            Err(e) => {
                self.last_operation.mark_end(None);
                return Err(e);
            }
        };
        self.set_process(Some(process.clone()));
        info!(handle = %self.handle, operation = %kind, pid = ?process.pid(), "Started background operation");

        let workspace = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = workspace.complete_async(kind, &process).await;
            if let Err(e) = lock.release() {
                warn!(handle = %workspace.handle, error = %e, "Failed to release operation lock");
            }
            workspace.set_process(None);
            on_complete(outcome);
        });
        Ok(())
    }

    async fn complete_async(&self, kind: OperationKind, process: &ProcessHandle) -> OperationOutcome {
        let exit = match process.wait().await {
            Ok(exit) => exit,
            Err(e) => {
                self.last_operation.mark_end(Some(e.to_string()));
                return OperationOutcome {
                    kind,
                    exit_code: None,
                    error: Some(e),
                };
            }
        };

        if let Err(e) =
            pipeline::write_pipeline_result(&self.dir, exit.code_or_signal(), &exit.output).await
        {
            warn!(handle = %self.handle, error = %e, "Failed to store pipeline result");
        }

        let error = if !exit.success() {
            Some(tool_failed(&kind.to_string(), &exit))
        } else if kind == OperationKind::Apply {
            self.require_state().await.err()
        } else {
            self.load_state().await.err()
        };

        self.last_operation
            .mark_end(error.as_ref().map(ToString::to_string));
        match &error {
            Some(e) => warn!(handle = %self.handle, operation = %kind, error = %e, "Background operation failed"),
            None => info!(handle = %self.handle, operation = %kind, "Background operation finished"),
        }

        OperationOutcome {
            kind,
            exit_code: exit.code,
            error,
        }
    }

    /// Consume the result of the last background operation
    ///
    /// Never blocks beyond a few filesystem calls. A result is handed out at
    /// most once.
    pub fn poll_result(&self) -> Result<PipelineResult> {
        match pipeline::parse_pipeline_result(&self.dir) {
            Ok(result) => {
                // delivered through the mailbox; do not report it again
                self.last_operation.take_finished();
                Ok(result)
            }
            Err(CloudError::Pipeline(PipelineState::NotStarted)) if self.is_busy() => {
                Err(CloudError::Pipeline(PipelineState::NoStoreYet))
            }
            Err(e) => Err(e),
        }
    }

    /// Non-consuming view of the pipeline; `None` means a result is waiting
    pub fn pipeline_state(&self) -> Result<Option<PipelineState>> {
        pipeline::inspect_pipeline(&self.dir)
    }

    /// Kill any running process and delete the workspace directory
    pub async fn teardown(&self) -> Result<()> {
        let process = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(process) = process {
            process.kill();
            let _ = process.wait().await;
        }

        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(handle = %self.handle, "Workspace removed");
        Ok(())
    }

    // ========== Internals ==========

    fn check_idle(&self) -> Result<()> {
        if let Some(running) = self.last_operation.running() {
            return Err(CloudError::OperationInProgress {
                kind: running.kind,
                started_at: running.started_at,
            });
        }
        if pipeline::is_locked(&self.dir) {
            return Err(CloudError::Pipeline(PipelineState::Locked));
        }
        Ok(())
    }

    /// Drop `prevent_destroy` from the rendered configuration
    ///
    /// The tool refuses to destroy a protected resource. Called with the
    /// operation lock held.
    async fn release_protection(&self) -> Result<()> {
        let config = self.rendered_config();
        if config.is_empty() {
            return Ok(());
        }
        if let Some(released) = with_prevent_destroy(&config, false)? {
            debug!(handle = %self.handle, "Releasing prevent_destroy before destroy");
            self.write_config(released).await?;
        }
        Ok(())
    }

    /// Claim the workspace for `kind`
    async fn begin(&self, kind: OperationKind) -> Result<OperationLock> {
        self.check_idle()?;
        let lock = OperationLock::acquire(&self.dir, kind).await?;
        self.last_operation.mark_start(kind)?;
        Ok(lock)
    }

    /// End a synchronous operation; its error went straight to the caller
    fn finish_sync(&self, lock: OperationLock) {
        self.last_operation.mark_end(None);
        if let Err(e) = lock.release() {
            warn!(handle = %self.handle, error = %e, "Failed to release operation lock");
        }
    }

    fn set_process(&self, process: Option<Arc<ProcessHandle>>) {
        *self.process.lock().unwrap_or_else(PoisonError::into_inner) = process;
    }

    async fn command(&self, args: &[&str]) -> Result<ProcessSpec> {
        let mut spec = ProcessSpec::new(&self.tool.executable)
            .args(self.tool.args.iter().cloned())
            .args(args.iter().copied())
            .current_dir(&self.dir)
            .envs(self.tool.env.iter().cloned());
        if let Some(reattach) = self.provider_runner.start().await? {
            let (key, value) = reattach.env();
            spec = spec.env(key, value);
        }
        Ok(spec)
    }

    async fn spawn_tool(&self, args: &[&str]) -> Result<Arc<ProcessHandle>> {
        let spec = self.command(args).await?;
        Ok(Arc::new(spec.spawn()?))
    }

    async fn run_to_completion(&self, args: &[&str]) -> Result<ProcessExit> {
        let process = self.spawn_tool(args).await?;
        self.set_process(Some(process.clone()));
        let exit = process.wait().await;
        self.set_process(None);
        exit
    }
}

fn tool_failed(operation: &str, exit: &ProcessExit) -> CloudError {
    CloudError::ToolFailed {
        operation: operation.to_string(),
        exit_code: exit.code_or_signal(),
        output: exit.diagnostic(),
    }
}

fn ensure_success(operation: &str, exit: &ProcessExit) -> Result<()> {
    if exit.success() {
        Ok(())
    } else {
        Err(tool_failed(operation, exit))
    }
}
