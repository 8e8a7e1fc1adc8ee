//! Models trained on FATE.

use super::{ModelType, TrainedModel};
use crate::archive::{ComponentInfo, ComponentRecord, ModelArchive, DEFAULT_MODEL_ALIAS};
use crate::convert::pytorch::PYTORCH_CONFIG_TYPE;
use crate::convert::Framework;
use crate::error::{FedServeError, Result};
use crate::fate::{FetchRequest, FetchedArchive, ModelFetcher, DEFAULT_ROLE};
use std::path::{Path, PathBuf};
use tracing::info;

/// Component types that can serve as the main model.
pub const SUPPORTED_MODULES: &[&str] = &["HomoLR", "HomoNN"];

/// Where to find a FATE model. The first available source wins, in field
/// order: `record`, `model_path`, then a fetch of `model_version`.
#[derive(Debug, Clone, Default)]
pub struct FateModelOptions {
    pub record: Option<ComponentRecord>,
    pub model_path: Option<PathBuf>,
    pub model_version: Option<String>,
    /// Defaults to `guest`.
    pub role: Option<String>,
    pub party_id: Option<String>,
    pub model_id: Option<String>,
}

/// A FATE model with its main component parsed.
#[derive(Debug)]
pub struct FateModel {
    record: ComponentRecord,
    framework: Framework,
    component_name: Option<String>,
    archive: Option<FetchedArchive>,
}

impl FateModel {
    /// Resolve the model from `options`, fetching the archive when needed.
    pub async fn load(options: FateModelOptions, fetcher: &dyn ModelFetcher) -> Result<Self> {
        if let Some(record) = options.record {
            return Self::from_record(record);
        }

        let archive = match (options.model_path, options.model_version) {
            (Some(path), _) => FetchedArchive::at(path),
            (None, Some(model_version)) => {
                let request = FetchRequest {
                    model_version,
                    role: options.role.unwrap_or_else(|| DEFAULT_ROLE.to_string()),
                    party_id: options.party_id,
                    model_id: options.model_id,
                };
                fetcher.fetch(&request).await?
            }
            (None, None) => {
                return Err(FedServeError::InvalidArgument(
                    "missing record, model path and model version to locate FATE model"
                        .to_string(),
                ))
            }
        };

        let mut model = Self::from_path(archive.path())?;
        model.archive = Some(archive);
        Ok(model)
    }

    /// Parse the main component of the archive at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let archive = ModelArchive::open(path.as_ref())?;
        let main = select_main_component(&archive.components(), archive.root())?;
        let record = archive.read_component(&main.name, DEFAULT_MODEL_ALIAS)?;
        let framework = infer_framework(&record)?;
        info!(
            component = %main.name,
            component_type = record.component_type(),
            %framework,
            "FATE model initialized"
        );
        Ok(Self {
            record,
            framework,
            component_name: Some(main.name),
            archive: Some(FetchedArchive::at(path.as_ref())),
        })
    }

    /// Wrap an already parsed record.
    pub fn from_record(record: ComponentRecord) -> Result<Self> {
        let framework = infer_framework(&record)?;
        info!(
            component_type = record.component_type(),
            %framework,
            "FATE model initialized"
        );
        Ok(Self {
            record,
            framework,
            component_name: None,
            archive: None,
        })
    }

    /// Name of the main component, when read from an archive.
    pub fn component_name(&self) -> Option<&str> {
        self.component_name.as_deref()
    }

    /// Local archive the model was read from, if any.
    pub fn archive_path(&self) -> Option<&Path> {
        self.archive.as_ref().map(FetchedArchive::path)
    }
}

impl TrainedModel for FateModel {
    fn model_type(&self) -> ModelType {
        ModelType::Fate
    }

    fn preferred_framework(&self) -> Framework {
        self.framework
    }

    fn component(&self) -> &ComponentRecord {
        &self.record
    }
}

/// The unique supported component of an archive.
pub fn select_main_component(components: &[ComponentInfo], root: &Path) -> Result<ComponentInfo> {
    let mut candidates = components
        .iter()
        .filter(|c| SUPPORTED_MODULES.contains(&c.module_name.as_str()));

    match (candidates.next(), candidates.next()) {
        (Some(main), None) => Ok(main.clone()),
        (None, _) => Err(FedServeError::ComponentNotFound(root.display().to_string())),
        (Some(_), Some(_)) => Err(FedServeError::AmbiguousComponent(
            components
                .iter()
                .filter(|c| SUPPORTED_MODULES.contains(&c.module_name.as_str()))
                .map(|c| c.name.clone())
                .collect(),
        )),
    }
}

/// Target framework for a parsed component.
pub fn infer_framework(record: &ComponentRecord) -> Result<Framework> {
    match record.component_type() {
        "HomoLR" => Ok(Framework::Sklearn),
        "HomoNN" => {
            if record.nn_model_meta()?.config_type() == PYTORCH_CONFIG_TYPE {
                Ok(Framework::PyTorch)
            } else {
                Ok(Framework::TfKeras)
            }
        }
        other => Err(FedServeError::UnsupportedComponent(other.to_string())),
    }
}
