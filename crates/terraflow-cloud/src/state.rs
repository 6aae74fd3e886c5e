//! Tool state file handling
//!
//! The tool's JSON state file is kept byte-for-byte; only the managed
//! resource's `id` and attribute map are looked at.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;

/// State format version written by seeded states
pub const SEED_STATE_VERSION: u32 = 4;

/// Parsed view of the tool's state file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TfState {
    pub version: u32,

    #[serde(default)]
    pub terraform_version: String,

    #[serde(default)]
    pub serial: u64,

    #[serde(default)]
    pub lineage: String,

    #[serde(default)]
    pub outputs: Map<String, Value>,

    #[serde(default)]
    pub resources: Vec<StateResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateResource {
    pub mode: String,

    #[serde(rename = "type")]
    pub resource_type: String,

    pub name: String,

    #[serde(default)]
    pub provider: String,

    #[serde(default)]
    pub instances: Vec<StateInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInstance {
    #[serde(default)]
    pub schema_version: u64,

    #[serde(default)]
    pub attributes: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
}

/// State file contents: raw bytes plus their parsed view
#[derive(Debug, Clone, PartialEq)]
pub struct StateFile {
    raw: Vec<u8>,
    parsed: TfState,
}

impl StateFile {
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self> {
        let parsed = serde_json::from_slice(&raw)?;
        Ok(Self { raw, parsed })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn parsed(&self) -> &TfState {
        &self.parsed
    }

    fn managed_instance(&self) -> Option<&StateInstance> {
        self.parsed
            .resources
            .iter()
            .find(|r| r.mode == "managed")
            .and_then(|r| r.instances.first())
    }

    /// `id` attribute of the managed resource
    pub fn resource_id(&self) -> Option<&str> {
        self.managed_instance()?
            .attributes
            .get("id")
            .and_then(Value::as_str)
    }

    /// Whether the state describes an existing resource
    pub fn exists(&self) -> bool {
        self.resource_id().is_some_and(|id| !id.is_empty())
    }

    /// Attribute map of the managed resource (empty when absent)
    pub fn attributes(&self) -> Map<String, Value> {
        self.managed_instance()
            .map(|i| i.attributes.clone())
            .unwrap_or_default()
    }

    /// Minimal state for a resource whose external id is already known
    pub fn seed(seed: &SeedState) -> Result<Self> {
        let mut attributes = seed.attributes.clone();
        attributes.insert("id".to_string(), Value::String(seed.id.clone()));

        let state = TfState {
            version: SEED_STATE_VERSION,
            terraform_version: seed.terraform_version.clone(),
            serial: 1,
            lineage: seed.lineage.clone(),
            outputs: Map::new(),
            resources: vec![StateResource {
                mode: "managed".to_string(),
                resource_type: seed.resource_type.clone(),
                name: seed.name.clone(),
                provider: format!(
                    "provider[\"registry.terraform.io/{}\"]",
                    seed.provider_source
                ),
                instances: vec![StateInstance {
                    schema_version: 0,
                    attributes,
                    private: None,
                }],
            }],
        };
        Self::from_bytes(serde_json::to_vec_pretty(&state)?)
    }

    /// Read a state file; `None` when it does not exist
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read(path).await {
            Ok(raw) => Ok(Some(Self::from_bytes(raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the raw bytes back unchanged
    pub async fn persist(&self, path: &Path) -> Result<()> {
        fs::write(path, &self.raw).await?;
        Ok(())
    }
}

/// Inputs for [`StateFile::seed`]
#[derive(Debug, Clone)]
pub struct SeedState {
    pub resource_type: String,
    pub name: String,
    pub provider_source: String,
    pub id: String,
    pub attributes: Map<String, Value>,
    pub lineage: String,
    pub terraform_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TOOL_STATE: &str = r#"{
  "version": 4,
  "terraform_version": "1.5.7",
  "serial": 3,
  "lineage": "0f3e1c2a",
  "outputs": {},
  "resources": [
    {
      "mode": "data",
      "type": "aws_caller_identity",
      "name": "current",
      "provider": "provider[\"registry.terraform.io/hashicorp/aws\"]",
      "instances": [{"schema_version": 0, "attributes": {"id": "123456789012"}}]
    },
    {
      "mode": "managed",
      "type": "aws_vpc",
      "name": "main",
      "provider": "provider[\"registry.terraform.io/hashicorp/aws\"]",
      "instances": [
        {
          "schema_version": 1,
          "attributes": {"id": "vpc-0abc", "cidr_block": "10.0.0.0/16"},
          "private": "eyJzY2hlbWFfdmVyc2lvbiI6IjEifQ=="
        }
      ]
    }
  ]
}
"#;

    #[test]
    fn test_managed_resource_lookup() {
        let state = StateFile::from_bytes(TOOL_STATE.as_bytes().to_vec()).unwrap();
        assert_eq!(state.resource_id(), Some("vpc-0abc"));
        assert!(state.exists());
        assert_eq!(state.attributes()["cidr_block"], "10.0.0.0/16");
        assert_eq!(state.parsed().serial, 3);
    }

    #[test]
    fn test_empty_state_does_not_exist() {
        let state =
            StateFile::from_bytes(br#"{"version":4,"serial":2,"resources":[]}"#.to_vec()).unwrap();
        assert!(!state.exists());
        assert!(state.attributes().is_empty());
    }

    #[test]
    fn test_malformed_state_is_an_error() {
        assert!(StateFile::from_bytes(b"{not json".to_vec()).is_err());
    }

    #[tokio::test]
    async fn test_persist_and_load_are_byte_exact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("terraform.tfstate");

        let state = StateFile::from_bytes(TOOL_STATE.as_bytes().to_vec()).unwrap();
        state.persist(&path).await.unwrap();

        let loaded = StateFile::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.as_bytes(), TOOL_STATE.as_bytes());
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_load_missing_state() {
        let dir = tempdir().unwrap();
        let loaded = StateFile::load(&dir.path().join("terraform.tfstate"))
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_seed_state() {
        let mut attributes = Map::new();
        attributes.insert("cidr_block".to_string(), Value::from("10.1.0.0/16"));
        let state = StateFile::seed(&SeedState {
            resource_type: "aws_vpc".to_string(),
            name: "imported".to_string(),
            provider_source: "hashicorp/aws".to_string(),
            id: "vpc-0def".to_string(),
            attributes,
            lineage: "lineage-1".to_string(),
            terraform_version: "1.5.7".to_string(),
        })
        .unwrap();

        assert_eq!(state.resource_id(), Some("vpc-0def"));
        assert_eq!(state.parsed().version, SEED_STATE_VERSION);
        let resource = &state.parsed().resources[0];
        assert_eq!(
            resource.provider,
            "provider[\"registry.terraform.io/hashicorp/aws\"]"
        );
        assert_eq!(state.attributes()["cidr_block"], "10.1.0.0/16");
    }
}
