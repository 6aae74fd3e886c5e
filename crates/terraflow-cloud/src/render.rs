//! Rendered workspace configuration
//!
//! Every workspace gets one JSON configuration document with a single
//! provider block and a single resource block.

use crate::error::{CloudError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Provider every workspace is rendered with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSetup {
    /// Registry source, e.g. `hashicorp/aws`
    pub source: String,

    pub version: String,

    /// Provider block body
    pub configuration: Value,
}

impl ProviderSetup {
    /// Local name used in `required_providers`, e.g. `aws`
    pub fn local_name(&self) -> &str {
        self.source.rsplit('/').next().unwrap_or(&self.source)
    }
}

/// The one resource a workspace manages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBlock {
    /// Resource type label, e.g. `aws_vpc`
    pub resource_type: String,

    /// Resource name label
    pub name: String,

    /// Resource arguments
    pub body: Map<String, Value>,
}

impl ResourceBlock {
    /// `<type>.<name>` address used by `import`
    pub fn address(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }
}

/// Render the configuration document
///
/// The resource is protected with `lifecycle.prevent_destroy` unless it is
/// being deleted; the tool refuses to destroy a protected resource.
pub fn render_main_config(
    provider: &ProviderSetup,
    resource: &ResourceBlock,
    deleting: bool,
) -> Result<Vec<u8>> {
    if provider.source.is_empty() {
        return Err(CloudError::InvalidConfig(
            "provider source must not be empty".to_string(),
        ));
    }
    if resource.resource_type.is_empty() || resource.name.is_empty() {
        return Err(CloudError::InvalidConfig(format!(
            "resource type and name must not be empty (got {:?})",
            resource.address()
        )));
    }

    let local_name = provider.local_name();

    let mut body = resource.body.clone();
    // destroy-and-recreate must never happen behind the reconciler's back
    body.insert(
        "lifecycle".to_string(),
        json!({ "prevent_destroy": !deleting }),
    );

    let document = json!({
        "terraform": {
            "required_providers": {
                local_name: {
                    "source": provider.source,
                    "version": provider.version,
                }
            }
        },
        "provider": {
            local_name: provider.configuration,
        },
        "resource": {
            resource.resource_type.as_str(): {
                resource.name.as_str(): body,
            }
        }
    });

    Ok(serde_json::to_vec_pretty(&document)?)
}

/// Rewrite `lifecycle.prevent_destroy` of every resource in a rendered
/// document
///
/// Returns `None` when the document already carries `prevent_destroy`.
pub fn with_prevent_destroy(config: &[u8], prevent_destroy: bool) -> Result<Option<Vec<u8>>> {
    let mut document: Value = serde_json::from_slice(config)?;
    let mut changed = false;

    let resources = document
        .get_mut("resource")
        .and_then(Value::as_object_mut)
        .into_iter()
        .flat_map(|types| types.values_mut())
        .filter_map(Value::as_object_mut)
        .flat_map(|names| names.values_mut())
        .filter_map(Value::as_object_mut);
    for body in resources {
        let lifecycle = body
            .entry("lifecycle")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(lifecycle) = lifecycle.as_object_mut() {
            if lifecycle.get("prevent_destroy") != Some(&Value::Bool(prevent_destroy)) {
                lifecycle.insert("prevent_destroy".to_string(), Value::Bool(prevent_destroy));
                changed = true;
            }
        }
    }

    if !changed {
        return Ok(None);
    }
    Ok(Some(serde_json::to_vec_pretty(&document)?))
}
