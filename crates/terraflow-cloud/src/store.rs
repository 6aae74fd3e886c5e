//! Workspace store
//!
//! Registry of live workspaces keyed by resource handle. Creation is
//! idempotent: concurrent requests for the same resource observe the same
//! [`Workspace`] instance. Removal tears the directory down and only
//! happens once nothing is pending.

use crate::error::{CloudError, Result};
use crate::external::{CompletionHandler, WorkspaceExternal};
use crate::pipeline::{self, PipelineState};
use crate::provider_runner::{
    NoOpProviderRunner, ProviderRunner, SharedProvider, SharedProviderConfig,
};
use crate::render::{ProviderSetup, ResourceBlock, render_main_config};
use crate::state::{SeedState, StateFile};
use crate::workspace::{Handle, ToolSettings, Workspace};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use terraflow_config::TerraflowConfig;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Settings shared by every workspace of a store
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Directory holding one sub-directory per workspace
    pub root: PathBuf,
    pub tool: ToolSettings,
    pub provider: ProviderSetup,
}

/// A resource as the reconciler describes it
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    /// Stable identifier, e.g. `<namespace>/<name>`
    pub id: String,
    pub resource: ResourceBlock,
    /// External id of a resource that already exists
    pub external_id: Option<String>,
    /// Attributes seeded next to `external_id`
    pub attributes: Map<String, Value>,
    /// The resource is being deleted; its configuration drops
    /// `prevent_destroy`
    pub deleting: bool,
}

impl ResourceRequest {
    pub fn new(id: impl Into<String>, resource: ResourceBlock) -> Self {
        Self {
            id: id.into(),
            resource,
            external_id: None,
            attributes: Map::new(),
            deleting: false,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_deleting(mut self, deleting: bool) -> Self {
        self.deleting = deleting;
        self
    }
}

/// Registry of workspaces
pub struct WorkspaceStore {
    settings: StoreSettings,
    provider_runner: Arc<dyn ProviderRunner>,
    workspaces: Mutex<HashMap<Handle, Arc<Workspace>>>,
}

impl WorkspaceStore {
    pub fn new(settings: StoreSettings, provider_runner: Arc<dyn ProviderRunner>) -> Self {
        Self {
            settings,
            provider_runner,
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    /// Build a store from the loaded configuration
    ///
    /// A configured native plugin becomes one [`SharedProvider`] used by
    /// every workspace of the store.
    pub fn from_config(config: &TerraflowConfig) -> Result<Self> {
        let tool = ToolSettings {
            executable: config.tool.executable.clone(),
            args: config.tool.args.clone(),
            env: config
                .tool
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let provider = ProviderSetup {
            source: config.provider.source.clone(),
            version: config.provider.version.clone(),
            configuration: config.provider.configuration.clone(),
        };

        let provider_runner: Arc<dyn ProviderRunner> = match &config.provider.native_plugin {
            Some(plugin) => {
                let shared = SharedProviderConfig::new(&plugin.path, &config.provider.source)
                    .with_args(plugin.args.clone())
                    .with_reattach_timeout(plugin.reattach_timeout())
                    .with_protocol_version(plugin.protocol_version);
                Arc::new(SharedProvider::new(shared)?)
            }
            None => Arc::new(NoOpProviderRunner),
        };

        let settings = StoreSettings {
            root: config.workspace_root()?,
            tool,
            provider,
        };
        Ok(Self::new(settings, provider_runner))
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn provider_runner(&self) -> Arc<dyn ProviderRunner> {
        Arc::clone(&self.provider_runner)
    }

    /// Directory of the workspace for `handle`
    pub fn workspace_dir(&self, handle: &Handle) -> PathBuf {
        workspace_dir(&self.settings.root, handle)
    }

    /// Get or create the workspace of a resource
    ///
    /// The configuration is re-rendered on every call and rewritten when it
    /// changed, unless an operation currently owns the workspace.
    pub async fn workspace(&self, request: &ResourceRequest) -> Result<Arc<Workspace>> {
        let handle = Handle::new(&request.id);
        let config = render_main_config(
            &self.settings.provider,
            &request.resource,
            request.deleting,
        )?;

        let mut workspaces = self.workspaces.lock().await;
        if let Some(workspace) = workspaces.get(&handle) {
            let workspace = Arc::clone(workspace);
            drop(workspaces);
            refresh_config(&workspace, config).await?;
            return Ok(workspace);
        }

        let workspace = Workspace::open(
            handle.clone(),
            self.workspace_dir(&handle),
            self.settings.tool.clone(),
            request.resource.address(),
            Arc::clone(&self.provider_runner),
        )
        .await?;
        refresh_config(&workspace, config).await?;
        self.seed_state(&workspace, request).await?;

        let workspace = Arc::new(workspace);
        workspaces.insert(handle.clone(), Arc::clone(&workspace));
        info!(resource = %request.id, handle = %handle, "Workspace created");
        Ok(workspace)
    }

    async fn seed_state(&self, workspace: &Workspace, request: &ResourceRequest) -> Result<()> {
        let Some(external_id) = &request.external_id else {
            return Ok(());
        };
        if workspace.state().is_some() {
            return Ok(());
        }

        let state = StateFile::seed(&SeedState {
            resource_type: request.resource.resource_type.clone(),
            name: request.resource.name.clone(),
            provider_source: self.settings.provider.source.clone(),
            id: external_id.clone(),
            attributes: request.attributes.clone(),
            lineage: workspace.handle().to_string(),
            terraform_version: String::new(),
        })?;
        workspace.write_state(state).await?;
        debug!(handle = %workspace.handle(), external_id = %external_id, "Seeded state with external id");
        Ok(())
    }

    pub async fn get(&self, resource_id: &str) -> Option<Arc<Workspace>> {
        self.workspaces
            .lock()
            .await
            .get(&Handle::new(resource_id))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.workspaces.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workspaces.lock().await.is_empty()
    }

    /// Tear down and forget the workspace of a finalized resource
    ///
    /// Refuses while an operation is pending. A directory left on disk by a
    /// previous process is removed as well.
    pub async fn remove(&self, resource_id: &str) -> Result<()> {
        let handle = Handle::new(resource_id);
        let mut workspaces = self.workspaces.lock().await;

        let Some(workspace) = workspaces.get(&handle).cloned() else {
            drop(workspaces);
            return self.remove_orphan(&handle).await;
        };

        if let Some(running) = workspace.last_operation().filter(|r| r.is_running()) {
            return Err(CloudError::OperationInProgress {
                kind: running.kind,
                started_at: running.started_at,
            });
        }
        if pipeline::is_locked(workspace.dir()) {
            return Err(CloudError::Pipeline(PipelineState::Locked));
        }

        workspace.teardown().await?;
        workspaces.remove(&handle);
        info!(resource = %resource_id, handle = %handle, "Workspace forgotten");
        Ok(())
    }

    async fn remove_orphan(&self, handle: &Handle) -> Result<()> {
        let dir = self.workspace_dir(handle);
        if pipeline::is_locked(&dir) {
            return Err(CloudError::Pipeline(PipelineState::Locked));
        }
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(handle = %handle, "Removed workspace directory left by a previous process");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Workspace-backed client for one resource
    pub async fn connect(
        &self,
        request: &ResourceRequest,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<WorkspaceExternal> {
        let workspace = self.workspace(request).await?;
        Ok(WorkspaceExternal::new(workspace, handler))
    }
}

pub fn workspace_dir(root: &Path, handle: &Handle) -> PathBuf {
    root.join(handle.as_str())
}

async fn refresh_config(workspace: &Workspace, config: Vec<u8>) -> Result<()> {
    if workspace.is_busy() || pipeline::is_locked(workspace.dir()) {
        return Ok(());
    }
    if workspace.rendered_config() != config {
        workspace.write_config(config).await?;
    }
    Ok(())
}
