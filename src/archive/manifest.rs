//! `define/define_meta.yaml` manifest.

use crate::error::{FedServeError, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Declared kind of one component.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ComponentDefine {
    /// Module/kind tag, e.g. `HomoLR`.
    pub module_name: String,
}

/// Stored-file name to logical field name, for one component alias.
pub type ProtoIndex = BTreeMap<String, String>;

/// Parsed archive manifest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    /// Components in manifest order.
    #[serde(default, deserialize_with = "ordered_components")]
    pub component_define: Vec<(String, ComponentDefine)>,
    /// component name -> alias -> stored file -> field name
    #[serde(default)]
    pub model_proto: BTreeMap<String, BTreeMap<String, ProtoIndex>>,
}

impl Manifest {
    /// Load and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FedServeError::Manifest(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse manifest YAML.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Declared module name of `component`.
    pub fn module_name(&self, component: &str) -> Option<&str> {
        self.component_define
            .iter()
            .find(|(name, _)| name == component)
            .map(|(_, define)| define.module_name.as_str())
    }

    /// Stored-file index of `component` under `alias`; empty when absent.
    pub fn proto_index(&self, component: &str, alias: &str) -> ProtoIndex {
        self.model_proto
            .get(component)
            .and_then(|aliases| aliases.get(alias))
            .cloned()
            .unwrap_or_default()
    }
}

fn ordered_components<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<(String, ComponentDefine)>, D::Error>
where
    D: Deserializer<'de>,
{
    // `Mapping` keeps insertion order, which is the manifest order.
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::Mapping(mapping) => mapping
            .into_iter()
            .map(|(key, value)| {
                let name = key
                    .as_str()
                    .ok_or_else(|| D::Error::custom("component names must be strings"))?
                    .to_string();
                let define = serde_yaml::from_value(value)
                    .map_err(|e| D::Error::custom(format!("component {}: {}", name, e)))?;
                Ok((name, define))
            })
            .collect(),
        _ => Err(D::Error::custom("component_define must be a mapping")),
    }
}
