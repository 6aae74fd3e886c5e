//! terraflow configuration
//!
//! Locates and loads the YAML file that tells the workspace store which
//! infrastructure tool to run, where workspaces live on disk, and which
//! provider (and optional native provider plugin) every workspace uses.

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable pointing directly at a config file
pub const CONFIG_PATH_ENV: &str = "TERRAFLOW_CONFIG_PATH";

/// Environment variable overriding `workspace_root`
pub const WORKSPACE_ROOT_ENV: &str = "TERRAFLOW_WORKSPACE_ROOT";

const CANDIDATES: [&str; 2] = ["terraflow.yaml", ".terraflow.yaml"];
const DEFAULT_REATTACH_TIMEOUT_SECS: u64 = 60;
const DEFAULT_PROTOCOL_VERSION: u8 = 5;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerraflowConfig {
    /// External tool invocation settings
    pub tool: ToolConfig,

    /// Directory holding one sub-directory per workspace
    pub workspace_root: Option<PathBuf>,

    /// Provider rendered into every workspace
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Path or name of the infrastructure tool executable
    pub executable: PathBuf,

    /// Global options placed before every subcommand
    pub args: Vec<String>,

    /// Extra environment passed to every invocation
    pub env: BTreeMap<String, String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("terraform"),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Registry source, e.g. `hashicorp/aws`
    pub source: String,

    /// Version constraint written into `required_providers`
    pub version: String,

    /// Body of the provider block
    pub configuration: serde_json::Value,

    /// Long-lived provider plugin shared by all workspaces
    pub native_plugin: Option<NativePluginConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            version: String::new(),
            configuration: serde_json::Value::Object(serde_json::Map::new()),
            native_plugin: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativePluginConfig {
    /// Provider plugin executable
    pub path: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_reattach_timeout_secs")]
    pub reattach_timeout_secs: u64,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,
}

impl NativePluginConfig {
    pub fn reattach_timeout(&self) -> Duration {
        Duration::from_secs(self.reattach_timeout_secs)
    }
}

fn default_reattach_timeout_secs() -> u64 {
    DEFAULT_REATTACH_TIMEOUT_SECS
}

fn default_protocol_version() -> u8 {
    DEFAULT_PROTOCOL_VERSION
}

impl TerraflowConfig {
    /// Parse a config file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::ConfigFileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Effective workspace root
    ///
    /// `TERRAFLOW_WORKSPACE_ROOT` wins over the file; without either the
    /// user cache directory is used.
    pub fn workspace_root(&self) -> Result<PathBuf> {
        if let Ok(root) = std::env::var(WORKSPACE_ROOT_ENV) {
            if !root.is_empty() {
                return Ok(PathBuf::from(root));
            }
        }
        if let Some(root) = &self.workspace_root {
            return Ok(root.clone());
        }
        let cache_dir = dirs::cache_dir().ok_or(ConfigError::ConfigDirNotFound)?;
        Ok(cache_dir.join("terraflow").join("workspaces"))
    }
}

/// Per-user terraflow config directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("terraflow");
    Ok(config_dir)
}

/// Find the config file
///
/// Search order:
/// 1. `TERRAFLOW_CONFIG_PATH` (direct path; must exist)
/// 2. current directory: terraflow.yaml, .terraflow.yaml
/// 3. ~/.config/terraflow/config.yaml
pub fn find_config_file() -> Result<Option<PathBuf>> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(Some(path));
        }
        return Err(ConfigError::ConfigFileNotFound(path));
    }

    let current_dir = std::env::current_dir()?;
    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(Some(path));
        }
    }

    if let Ok(config_dir) = get_config_dir() {
        let global_config = config_dir.join("config.yaml");
        if global_config.exists() {
            return Ok(Some(global_config));
        }
    }

    Ok(None)
}

/// Load the discovered config file, or defaults when there is none
pub fn load() -> Result<TerraflowConfig> {
    match find_config_file()? {
        Some(path) => TerraflowConfig::from_path(path),
        None => Ok(TerraflowConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    const SAMPLE: &str = r#"
tool:
  executable: /opt/bin/terraform
  env:
    TF_IN_AUTOMATION: "1"
workspace_root: /var/lib/terraflow
provider:
  source: hashicorp/aws
  version: "5.31.0"
  configuration:
    region: us-east-1
  native_plugin:
    path: /opt/bin/terraform-provider-aws
"#;

    #[test]
    fn test_parse_full_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("terraflow.yaml");
        fs::write(&path, SAMPLE).unwrap();

        let config = TerraflowConfig::from_path(&path).unwrap();
        assert_eq!(config.tool.executable, PathBuf::from("/opt/bin/terraform"));
        assert_eq!(config.tool.env.get("TF_IN_AUTOMATION").unwrap(), "1");
        assert_eq!(config.provider.source, "hashicorp/aws");
        assert_eq!(config.provider.configuration["region"], "us-east-1");

        let plugin = config.provider.native_plugin.unwrap();
        assert_eq!(plugin.reattach_timeout(), Duration::from_secs(60));
        assert_eq!(plugin.protocol_version, 5);
        assert!(plugin.args.is_empty());
    }

    #[test]
    fn test_defaults() {
        let config: TerraflowConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.tool.executable, PathBuf::from("terraform"));
        assert!(config.provider.native_plugin.is_none());
        assert!(config.provider.configuration.is_object());
    }

    #[test]
    fn test_parse_error_names_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("broken.yaml");
        fs::write(&path, "tool: [unclosed").unwrap();

        match TerraflowConfig::from_path(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected Parse error, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        fs::write(temp_dir.path().join(".terraflow.yaml"), "{}").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_config_file().unwrap().unwrap();
        assert!(result.ends_with(".terraflow.yaml"));

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_find_config_file_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, SAMPLE).unwrap();

        unsafe {
            std::env::set_var(CONFIG_PATH_ENV, config_path.to_str().unwrap());
        }

        let result = find_config_file().unwrap();
        assert_eq!(result, Some(config_path));
        let config = load().unwrap();
        assert_eq!(config.provider.version, "5.31.0");

        unsafe {
            std::env::remove_var(CONFIG_PATH_ENV);
        }
    }

    #[test]
    #[serial]
    fn test_env_var_pointing_nowhere_is_an_error() {
        unsafe {
            std::env::set_var(CONFIG_PATH_ENV, "/nonexistent/terraflow.yaml");
        }

        let result = find_config_file();
        assert!(matches!(result, Err(ConfigError::ConfigFileNotFound(_))));

        unsafe {
            std::env::remove_var(CONFIG_PATH_ENV);
        }
    }

    #[test]
    #[serial]
    fn test_workspace_root_priority() {
        let config = TerraflowConfig {
            workspace_root: Some(PathBuf::from("/from/file")),
            ..Default::default()
        };
        assert_eq!(config.workspace_root().unwrap(), PathBuf::from("/from/file"));

        unsafe {
            std::env::set_var(WORKSPACE_ROOT_ENV, "/from/env");
        }
        assert_eq!(config.workspace_root().unwrap(), PathBuf::from("/from/env"));
        unsafe {
            std::env::remove_var(WORKSPACE_ROOT_ENV);
        }
    }
}
