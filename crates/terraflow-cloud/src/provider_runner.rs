//! Shared provider plugin process
//!
//! Starting a provider plugin per tool invocation is expensive (auth
//! handshakes, SDK initialisation). A [`SharedProvider`] starts the plugin
//! once, captures the reattach address it prints on startup, and hands the
//! resulting [`ReattachConfig`] to every workspace so their tool
//! invocations connect to the running plugin instead of spawning their own.

use crate::error::{Result, SharedProviderError};
use crate::runner::{OutputStream, ProcessHandle, ProcessSpec};
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Environment variable the tool reads reattach information from
pub const REATTACH_ENV: &str = "TF_REATTACH_PROVIDERS";

/// Handshake cookie a provider binary requires before serving as a plugin
pub const MAGIC_COOKIE_KEY: &str = "PLUGIN_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str =
    "d602bf8f470bc67ca7faa0386276bbdd4330efaf76d1a219cb4d6991ca9872b2";

const REGISTRY_HOST: &str = "registry.terraform.io";
const REATTACH_PATTERN: &str = r"unix\|([^|]+)\|grpc";

pub const DEFAULT_REATTACH_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PROTOCOL_VERSION: u8 = 5;

/// Source of reattach information for tool invocations
#[async_trait]
pub trait ProviderRunner: Send + Sync {
    /// Make sure a provider is reachable
    ///
    /// `None` means tool invocations start their own provider.
    async fn start(&self) -> Result<Option<ReattachConfig>>;
}

/// Runner used when no native plugin is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpProviderRunner;

#[async_trait]
impl ProviderRunner for NoOpProviderRunner {
    async fn start(&self) -> Result<Option<ReattachConfig>> {
        Ok(None)
    }
}

/// How to reach a running provider plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReattachConfig {
    /// Registry source, e.g. `hashicorp/aws`
    pub provider_source: String,
    pub protocol: String,
    pub protocol_version: u8,
    pub pid: u32,
    pub network: String,
    pub address: String,
}

impl ReattachConfig {
    /// JSON value of `TF_REATTACH_PROVIDERS`
    pub fn env_value(&self) -> String {
        let key = format!("{}/{}", REGISTRY_HOST, self.provider_source);
        json!({
            key: {
                "Protocol": self.protocol,
                "ProtocolVersion": self.protocol_version,
                "Pid": self.pid,
                "Test": true,
                "Addr": {
                    "Network": self.network,
                    "String": self.address,
                }
            }
        })
        .to_string()
    }

    /// `(name, value)` pair for a tool invocation's environment
    pub fn env(&self) -> (String, String) {
        (REATTACH_ENV.to_string(), self.env_value())
    }
}

/// Settings for a [`SharedProvider`]
#[derive(Debug, Clone)]
pub struct SharedProviderConfig {
    pub plugin_path: PathBuf,
    pub args: Vec<String>,
    pub provider_source: String,
    pub protocol_version: u8,
    pub reattach_timeout: Duration,
}

impl SharedProviderConfig {
    pub fn new(plugin_path: impl Into<PathBuf>, provider_source: impl Into<String>) -> Self {
        Self {
            plugin_path: plugin_path.into(),
            args: Vec::new(),
            provider_source: provider_source.into(),
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            reattach_timeout: DEFAULT_REATTACH_TIMEOUT,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_reattach_timeout(mut self, timeout: Duration) -> Self {
        self.reattach_timeout = timeout;
        self
    }

    pub fn with_protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }
}

#[derive(Debug, Default)]
struct SharedState {
    reattach: Option<ReattachConfig>,
    process: Option<ProcessHandle>,
    /// Completed-attempt number and error of the last failed start
    last_failure: Option<(u64, SharedProviderError)>,
}

impl SharedState {
    /// Cached config, dropped if its process has exited
    fn live_config(&mut self) -> Option<ReattachConfig> {
        let alive = self.process.as_ref().is_some_and(|p| !p.is_done());
        if !alive {
            if self.reattach.take().is_some() {
                warn!("Shared provider process exited; reattach config invalidated");
            }
            self.process = None;
        }
        self.reattach.clone()
    }
}

/// One provider plugin process shared by many workspaces
///
/// The whole start-or-fetch sequence runs under one mutex. Callers that
/// queued on the mutex while an attempt was failing get that attempt's
/// error rather than each launching a retry of their own; callers that
/// arrive after it finished start afresh.
#[derive(Debug)]
pub struct SharedProvider {
    config: SharedProviderConfig,
    marker: Regex,
    /// Start attempts that have finished, successfully or not
    completed: AtomicU64,
    state: Mutex<SharedState>,
}

impl SharedProvider {
    pub fn new(config: SharedProviderConfig) -> Result<Self> {
        let marker = Regex::new(REATTACH_PATTERN)
            .map_err(|e| crate::CloudError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            config,
            marker,
            completed: AtomicU64::new(0),
            state: Mutex::new(SharedState::default()),
        })
    }

    pub fn config(&self) -> &SharedProviderConfig {
        &self.config
    }

    /// Return the cached reattach config, starting the plugin if needed
    pub async fn start_shared(&self) -> Result<ReattachConfig> {
        // attempts finished before this caller queued
        let observed = self.completed.load(Ordering::Acquire);
        let mut state = self.state.lock().await;

        if let Some(config) = state.live_config() {
            return Ok(config);
        }
        if let Some((attempt, error)) = &state.last_failure {
            if *attempt > observed {
                debug!(attempt, "Reusing failure of the start attempt this caller waited on");
                return Err(error.clone().into());
            }
        }

        let launched = self.launch().await;
        let attempt = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        match launched {
            Ok((config, process)) => {
                info!(
                    plugin = %self.config.plugin_path.display(),
                    pid = config.pid,
                    address = %config.address,
                    "Shared provider started"
                );
                state.reattach = Some(config.clone());
                state.process = Some(process);
                state.last_failure = None;
                Ok(config)
            }
            Err(error) => {
                warn!(plugin = %self.config.plugin_path.display(), error = %error, "Shared provider failed to start");
                state.reattach = None;
                state.process = None;
                state.last_failure = Some((attempt, error.clone()));
                Err(error.into())
            }
        }
    }

    /// Stop the plugin process and forget the cached config
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(process) = state.process.take() {
            process.kill();
        }
        state.reattach = None;
    }

    async fn launch(
        &self,
    ) -> std::result::Result<(ReattachConfig, ProcessHandle), SharedProviderError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let marker = self.marker.clone();

        let spec = ProcessSpec::new(&self.config.plugin_path)
            .args(self.config.args.iter().cloned())
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .on_line(Arc::new(move |stream, line| {
                if stream != OutputStream::Stdout {
                    return;
                }
                if let Some(address) = marker.captures(line).and_then(|c| c.get(1)) {
                    let _ = tx.send(address.as_str().to_string());
                }
            }));

        let process = spec
            .spawn()
            .map_err(|e| SharedProviderError::Spawn(e.to_string()))?;

        let handshake = async {
            tokio::select! {
                address = rx.recv() => match address {
                    Some(address) => Ok(address),
                    // readers finished without the marker: the process is gone
                    None => Err(exited(&process).await),
                },
                _ = process.wait() => {
                    // the marker may have been the last line before exit
                    match rx.try_recv() {
                        Ok(address) => Ok(address),
                        Err(_) => Err(exited(&process).await),
                    }
                }
            }
        };

        let address = match tokio::time::timeout(self.config.reattach_timeout, handshake).await {
            Ok(Ok(address)) => address,
            Ok(Err(error)) => {
                process.kill();
                return Err(error);
            }
            Err(_) => {
                process.kill();
                return Err(SharedProviderError::Timeout(self.config.reattach_timeout));
            }
        };

        if process.is_done() {
            return Err(exited(&process).await);
        }

        let config = ReattachConfig {
            provider_source: self.config.provider_source.clone(),
            protocol: "grpc".to_string(),
            protocol_version: self.config.protocol_version,
            pid: process.pid().unwrap_or_default(),
            network: "unix".to_string(),
            address,
        };
        Ok((config, process))
    }
}

async fn exited(process: &ProcessHandle) -> SharedProviderError {
    match process.wait().await {
        Ok(exit) => SharedProviderError::Exited {
            code: exit.code,
            output: exit.diagnostic(),
        },
        Err(e) => SharedProviderError::Exited {
            code: None,
            output: e.to_string(),
        },
    }
}

#[async_trait]
impl ProviderRunner for SharedProvider {
    async fn start(&self) -> Result<Option<ReattachConfig>> {
        self.start_shared().await.map(Some)
    }
}

impl Drop for SharedProvider {
    fn drop(&mut self) {
        if let Some(process) = self.state.get_mut().process.take() {
            process.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_value_format() {
        let config = ReattachConfig {
            provider_source: "hashicorp/aws".to_string(),
            protocol: "grpc".to_string(),
            protocol_version: 5,
            pid: 4242,
            network: "unix".to_string(),
            address: "/tmp/plugin123".to_string(),
        };

        let (name, value) = config.env();
        assert_eq!(name, "TF_REATTACH_PROVIDERS");

        let parsed: serde_json::Value = serde_json::from_str(&value).unwrap();
        let entry = &parsed["registry.terraform.io/hashicorp/aws"];
        assert_eq!(entry["Protocol"], "grpc");
        assert_eq!(entry["ProtocolVersion"], 5);
        assert_eq!(entry["Pid"], 4242);
        assert_eq!(entry["Test"], true);
        assert_eq!(entry["Addr"]["Network"], "unix");
        assert_eq!(entry["Addr"]["String"], "/tmp/plugin123");
    }

    #[test]
    fn test_marker_pattern() {
        let marker = Regex::new(REATTACH_PATTERN).unwrap();
        let caps = marker
            .captures("1|5|unix|/tmp/plugin2946113582|grpc|")
            .unwrap();
        assert_eq!(&caps[1], "/tmp/plugin2946113582");
        assert!(marker.captures("provider starting up").is_none());
    }

    #[tokio::test]
    async fn test_noop_runner() {
        assert!(NoOpProviderRunner.start().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_plugin_binary() {
        let provider = SharedProvider::new(SharedProviderConfig::new(
            "/nonexistent/terraform-provider-null",
            "hashicorp/null",
        ))
        .unwrap();

        let err = provider.start_shared().await.unwrap_err();
        assert!(matches!(
            err,
            crate::CloudError::SharedProvider(SharedProviderError::Spawn(_))
        ));
    }
}
