//! Model archive reading.
//!
//! An archive is the directory exported by the federated-training platform:
//!
//! ```text
//! <root>/
//!   define/
//!     proto/
//!     define_meta.yaml
//!   variables/
//!     index/
//!     data/<component>/<alias>/<stored_file>
//! ```
//!
//! The manifest names every component and, per component alias, maps each
//! stored payload file to the protobuf message it contains.

pub mod manifest;
pub mod proto;
pub mod record;

pub use manifest::{ComponentDefine, Manifest};
pub use proto::ComponentField;
pub use record::ComponentRecord;

use crate::error::{FedServeError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Alias under which trained payloads are stored.
pub const DEFAULT_MODEL_ALIAS: &str = "model";

/// Name and declared type of a manifest component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
    pub name: String,
    pub module_name: String,
}

/// An archive directory with its parsed manifest.
#[derive(Debug, Clone)]
pub struct ModelArchive {
    root: PathBuf,
    manifest: Manifest,
}

impl ModelArchive {
    /// Opens the archive rooted at `root` and parses its manifest.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let manifest = Manifest::load(&Self::define_meta_path_of(&root))?;
        debug!(root = %root.display(), components = manifest.component_define.len(), "Opened model archive");
        Ok(Self { root, manifest })
    }

    fn define_meta_path_of(root: &Path) -> PathBuf {
        root.join("define").join("define_meta.yaml")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn define_meta_path(&self) -> PathBuf {
        Self::define_meta_path_of(&self.root)
    }

    pub fn variables_data_dir(&self) -> PathBuf {
        self.root.join("variables").join("data")
    }

    /// All declared components in manifest order.
    pub fn components(&self) -> Vec<ComponentInfo> {
        self.manifest
            .component_define
            .iter()
            .map(|(name, define)| ComponentInfo {
                name: name.clone(),
                module_name: define.module_name.clone(),
            })
            .collect()
    }

    /// Reads and decodes every payload of `component` stored under `alias`.
    pub fn read_component(&self, component: &str, alias: &str) -> Result<ComponentRecord> {
        let module_name = self.manifest.module_name(component).ok_or_else(|| {
            FedServeError::Manifest(format!(
                "component {} is not defined in {}",
                component,
                self.define_meta_path().display()
            ))
        })?;

        let storage_dir = self.variables_data_dir().join(component).join(alias);
        let mut record = ComponentRecord::new(module_name);
        for (stored_file, field_name) in self.manifest.proto_index(component, alias) {
            let path = storage_dir.join(&stored_file);
            let buf = std::fs::read(&path).map_err(|e| {
                std::io::Error::new(e.kind(), format!("{}: {}", path.display(), e))
            })?;
            let field = proto::decode_message(&field_name, &buf)?;
            debug!(component, field = %field_name, bytes = buf.len(), "Decoded payload");
            record.insert(field_name, field);
        }
        Ok(record)
    }
}

/// Reads one component of the archive at `archive_root`.
///
/// `alias` defaults to [`DEFAULT_MODEL_ALIAS`].
pub fn read_component(
    archive_root: impl AsRef<Path>,
    component_name: &str,
    alias: Option<&str>,
) -> Result<ComponentRecord> {
    ModelArchive::open(archive_root)?
        .read_component(component_name, alias.unwrap_or(DEFAULT_MODEL_ALIAS))
}
