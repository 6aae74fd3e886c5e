use serde_json::{Map, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use terraflow_cloud::render::render_main_config;
use terraflow_cloud::{
    CompletionHandler, Handle, NoOpProviderRunner, OperationOutcome, ProviderRunner,
    ProviderSetup, ResourceBlock, ResourceRequest, StoreSettings, ToolSettings, Workspace,
};
use tokio::sync::mpsc;

/// Stand-in for the infrastructure tool
///
/// Runs through `/bin/sh`, appends every invocation to `.invocations` in
/// the workspace directory and behaves according to `FAKE_*` variables.
/// Like the real tool it refuses to destroy a resource whose rendered
/// configuration sets `prevent_destroy`.
const FAKE_TOOL: &str = r#"
echo "$*" >> .invocations
if [ -n "$TF_REATTACH_PROVIDERS" ]; then
  printf '%s' "$TF_REATTACH_PROVIDERS" > .reattach
fi

write_state() {
  cat > terraform.tfstate <<STATE
{"version":4,"terraform_version":"1.5.7","serial":1,"lineage":"fake","outputs":{},"resources":[{"mode":"managed","type":"null_resource","name":"example","provider":"provider[\"registry.terraform.io/hashicorp/null\"]","instances":[{"schema_version":0,"attributes":{"id":"$1","triggers":{"rev":"1"}}}]}]}
STATE
}

case "$1" in
  init)
    echo "Initializing provider plugins..."
    touch .terraform.lock.hcl
    ;;
  plan)
    echo '{"@level":"info","@message":"Terraform 1.5.7","type":"version"}'
    echo 'unrelated diagnostic line'
    if [ -z "$FAKE_PLAN_NO_SUMMARY" ]; then
      echo "{\"@level\":\"info\",\"type\":\"change_summary\",\"changes\":{\"add\":${FAKE_PLAN_ADD:-0},\"change\":${FAKE_PLAN_CHANGE:-0},\"remove\":0}}"
    fi
    exit "${FAKE_PLAN_EXIT:-0}"
    ;;
  apply)
    if [ "$2" = "-refresh-only" ]; then
      exit 0
    fi
    if [ -n "$FAKE_APPLY_SLEEP" ]; then
      sleep "$FAKE_APPLY_SLEEP"
    fi
    if [ -n "$FAKE_APPLY_FAIL" ]; then
      echo "Error: $FAKE_APPLY_FAIL" >&2
      exit 1
    fi
    write_state "${FAKE_RESOURCE_ID:-res-123}"
    echo "Apply complete! Resources: 1 added, 0 changed, 0 destroyed."
    ;;
  destroy)
    if grep -q '"prevent_destroy": true' main.tf.json 2>/dev/null; then
      echo "Error: Instance cannot be destroyed: lifecycle.prevent_destroy is set" >&2
      exit 1
    fi
    if [ -n "$FAKE_DESTROY_SLEEP" ]; then
      sleep "$FAKE_DESTROY_SLEEP"
    fi
    echo '{"version":4,"serial":2,"lineage":"fake","outputs":{},"resources":[]}' > terraform.tfstate
    echo "Destroy complete! Resources: 1 destroyed."
    ;;
  import)
    write_state "$4"
    echo "Import successful!"
    ;;
  *)
    echo "unknown command $1" >&2
    exit 64
    ;;
esac
"#;

/// Stand-in for a provider plugin binary
///
/// Arguments: `<counter file> <mode>`. Every start appends a line to the
/// counter file.
const FAKE_PROVIDER: &str = r#"
echo "$$" >> "$1"
if [ "$PLUGIN_MAGIC_COOKIE" != "d602bf8f470bc67ca7faa0386276bbdd4330efaf76d1a219cb4d6991ca9872b2" ]; then
  echo "This binary is a plugin. These are not meant to be executed directly." >&2
  exit 1
fi
case "$2" in
  silent)
    exec sleep 30
    ;;
  exit)
    echo "fatal: no valid credential sources found" >&2
    exit 3
    ;;
  slow-exit)
    sleep 1
    echo "fatal: no valid credential sources found" >&2
    exit 3
    ;;
  *)
    sleep 0.2
    echo "provider starting"
    echo "1|5|unix|/tmp/plugin-fake.sock|grpc|"
    exec sleep 30
    ;;
esac
"#;

pub struct TestEnv {
    pub root: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("fake-terraform.sh"), FAKE_TOOL).unwrap();
        fs::write(root.path().join("fake-provider.sh"), FAKE_PROVIDER).unwrap();
        Self { root }
    }

    #[allow(dead_code)]
    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    pub fn workspaces_root(&self) -> PathBuf {
        self.root.path().join("workspaces")
    }

    /// Fake tool settings; `env` pairs select its behaviour
    pub fn tool(&self, env: &[(&str, &str)]) -> ToolSettings {
        let mut tool = ToolSettings::new("/bin/sh").with_args(vec![
            self.root
                .path()
                .join("fake-terraform.sh")
                .display()
                .to_string(),
        ]);
        for (key, value) in env {
            tool = tool.with_env(*key, *value);
        }
        tool
    }

    #[allow(dead_code)]
    pub fn provider_args(&self, mode: &str) -> Vec<String> {
        vec![
            self.root
                .path()
                .join("fake-provider.sh")
                .display()
                .to_string(),
            self.counter_file().display().to_string(),
            mode.to_string(),
        ]
    }

    #[allow(dead_code)]
    pub fn counter_file(&self) -> PathBuf {
        self.root.path().join("provider-starts")
    }

    #[allow(dead_code)]
    pub fn provider_starts(&self) -> usize {
        fs::read_to_string(self.counter_file())
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[allow(dead_code)]
    pub fn store_settings(&self, tool: ToolSettings) -> StoreSettings {
        StoreSettings {
            root: self.workspaces_root(),
            tool,
            provider: provider_setup(),
        }
    }

    #[allow(dead_code)]
    pub async fn workspace(&self, resource_id: &str, tool: ToolSettings) -> Arc<Workspace> {
        self.workspace_with_runner(resource_id, tool, Arc::new(NoOpProviderRunner))
            .await
    }

    #[allow(dead_code)]
    pub async fn workspace_with_runner(
        &self,
        resource_id: &str,
        tool: ToolSettings,
        runner: Arc<dyn ProviderRunner>,
    ) -> Arc<Workspace> {
        let handle = Handle::new(resource_id);
        let dir = self.workspaces_root().join(handle.as_str());
        let workspace = Workspace::open(handle, dir, tool, "null_resource.example", runner)
            .await
            .unwrap();
        Arc::new(workspace)
    }
}

pub fn provider_setup() -> ProviderSetup {
    ProviderSetup {
        source: "hashicorp/null".to_string(),
        version: "3.2.1".to_string(),
        configuration: json!({}),
    }
}

#[allow(dead_code)]
pub fn resource_block(rev: &str) -> ResourceBlock {
    let mut body = Map::new();
    body.insert("triggers".to_string(), json!({ "rev": rev }));
    ResourceBlock {
        resource_type: "null_resource".to_string(),
        name: "example".to_string(),
        body,
    }
}

/// Rendered configuration of a resource that is not being deleted
#[allow(dead_code)]
pub fn protected_config() -> Vec<u8> {
    render_main_config(&provider_setup(), &resource_block("1"), false).unwrap()
}

/// `lifecycle.prevent_destroy` of the configuration on disk
#[allow(dead_code)]
pub fn prevent_destroy_on_disk(dir: &Path) -> serde_json::Value {
    let config: serde_json::Value =
        serde_json::from_slice(&fs::read(dir.join("main.tf.json")).unwrap()).unwrap();
    config["resource"]["null_resource"]["example"]["lifecycle"]["prevent_destroy"].clone()
}

#[allow(dead_code)]
pub fn request(id: &str) -> ResourceRequest {
    ResourceRequest::new(id, resource_block("1"))
}

/// Tool invocations recorded in a workspace directory
#[allow(dead_code)]
pub fn invocations(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join(".invocations"))
        .map(|s| s.lines().map(|l| l.trim().to_string()).collect())
        .unwrap_or_default()
}

/// Completion handler forwarding outcomes to a channel
#[allow(dead_code)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<(Handle, OperationOutcome)>,
}

#[allow(dead_code)]
impl ChannelHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(Handle, OperationOutcome)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl CompletionHandler for ChannelHandler {
    fn on_complete(&self, handle: &Handle, outcome: OperationOutcome) {
        let _ = self.tx.send((handle.clone(), outcome));
    }
}

/// Wait for a completion, failing the test instead of hanging
#[allow(dead_code)]
pub async fn recv_outcome<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("operation did not complete in time")
        .expect("completion channel closed")
}
