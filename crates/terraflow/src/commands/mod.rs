pub mod provider;
pub mod status;
pub mod unlock;

use std::path::PathBuf;
use terraflow_cloud::Handle;
use terraflow_cloud::store::workspace_dir;

/// Workspace directory of a resource, from `--root` or the config file
pub fn resolve_workspace_dir(resource_id: &str, root: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let root = match root {
        Some(root) => root,
        None => terraflow_config::load()?.workspace_root()?,
    };
    Ok(workspace_dir(&root, &Handle::new(resource_id)))
}
