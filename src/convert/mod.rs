//! Model conversion.
//!
//! A [`Converter`] turns a [`TrainedModel`] into a [`ConvertedModel`]: a
//! native model object for one of the supported serving frameworks.
//!
//! The component converter is picked from a static registry keyed by
//! canonical framework and component type. Each framework's entries are
//! compiled in by its cargo feature (`sklearn`, `pytorch`), so a build only
//! dispatches to the frameworks it was configured for.
//!
//! # Example
//!
//! ```no_run
//! use fedserve::config::EngineConfig;
//! use fedserve::convert::{get_converter, ConverterOptions};
//! use fedserve::model::{FateModel, TrainedModel};
//! use std::sync::Arc;
//!
//! # async fn example() -> fedserve::Result<()> {
//! let model: Arc<dyn TrainedModel> = Arc::new(FateModel::from_path("/data/fate-model")?);
//! let mut converter = get_converter(model, ConverterOptions::default(), &EngineConfig::default()).await?;
//! let converted = converter.convert()?;
//! println!("converted to {}", converted.framework());
//! converter.save_model("/tmp/model.onnx".as_ref()).await?;
//! # Ok(())
//! # }
//! ```

pub mod onnx;
pub mod pickle;
pub mod pytorch;
pub mod sklearn;

pub use pytorch::{CheckpointFormat, CheckpointLoad, TorchModule};
pub use sklearn::LogisticRegression;

use crate::archive::ComponentRecord;
use crate::config::{EngineConfig, StorageKind};
use crate::error::{FedServeError, Result};
use crate::model::{ModelType, TrainedModel};
use crate::storage::{self, ModelStorage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Canonical serving framework identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Framework {
    #[serde(rename = "sklearn")]
    Sklearn,
    #[serde(rename = "pytorch")]
    PyTorch,
    #[serde(rename = "tf_keras")]
    TfKeras,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Sklearn => "sklearn",
            Framework::PyTorch => "pytorch",
            Framework::TfKeras => "tf_keras",
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = FedServeError;

    /// Collapses the accepted aliases onto one canonical value.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sklearn" | "scikit-learn" => Ok(Framework::Sklearn),
            "pytorch" | "torch" => Ok(Framework::PyTorch),
            "tf_keras" | "tensorflow" | "tf" => Ok(Framework::TfKeras),
            _ => Err(FedServeError::UnknownFramework(s.to_string())),
        }
    }
}

/// A framework-native model object.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeModel {
    Sklearn(LogisticRegression),
    PyTorch(TorchModule),
}

impl NativeModel {
    /// Framework the object belongs to.
    pub fn framework(&self) -> Framework {
        match self {
            NativeModel::Sklearn(_) => Framework::Sklearn,
            NativeModel::PyTorch(_) => Framework::PyTorch,
        }
    }
}

/// Immutable (framework, native model) pair.
#[derive(Debug, Clone)]
pub struct ConvertedModel {
    framework: Framework,
    model: Arc<NativeModel>,
}

impl ConvertedModel {
    pub fn new(framework: Framework, model: NativeModel) -> Self {
        Self {
            framework,
            model: Arc::new(model),
        }
    }

    pub fn framework(&self) -> Framework {
        self.framework
    }

    pub fn model(&self) -> &NativeModel {
        &self.model
    }
}

/// Converts one component type into a native model of one framework.
pub trait ComponentConverter: Send + Sync {
    /// Component types this converter handles.
    fn target_modules(&self) -> &'static [&'static str];

    /// Build the native model. Must not mutate or retain the record.
    fn convert(&self, record: &ComponentRecord) -> Result<NativeModel>;
}

/// Static registry entry for a component converter.
pub struct ConverterRegistration {
    pub name: &'static str,
    pub framework: Framework,
    pub target_modules: &'static [&'static str],
    pub build: fn() -> Box<dyn ComponentConverter>,
}

impl fmt::Debug for ConverterRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistration")
            .field("name", &self.name)
            .field("framework", &self.framework)
            .field("target_modules", &self.target_modules)
            .finish()
    }
}

static REGISTRY: &[ConverterRegistration] = &[
    #[cfg(feature = "sklearn")]
    ConverterRegistration {
        name: "sklearn::LrComponentConverter",
        framework: Framework::Sklearn,
        target_modules: sklearn::TARGET_MODULES,
        build: sklearn::build,
    },
    #[cfg(feature = "pytorch")]
    ConverterRegistration {
        name: "pytorch::NnComponentConverter",
        framework: Framework::PyTorch,
        target_modules: pytorch::TARGET_MODULES,
        build: pytorch::build,
    },
];

/// Every converter compiled into this build.
pub fn registrations() -> &'static [ConverterRegistration] {
    REGISTRY
}

/// Find the registration handling `component_type` for `framework`.
pub fn find_registration(
    framework: Framework,
    component_type: &str,
) -> Result<&'static ConverterRegistration> {
    REGISTRY
        .iter()
        .filter(|r| r.framework == framework)
        .find(|r| r.target_modules.contains(&component_type))
        .ok_or_else(|| FedServeError::ConverterNotFound {
            component_type: component_type.to_string(),
            framework: framework.to_string(),
        })
}

/// Pick the component converter for a trained model.
pub fn select_converter(model: &dyn TrainedModel) -> Result<Box<dyn ComponentConverter>> {
    let framework = model.preferred_framework();
    let component_type = model.component().component_type();
    let registration = find_registration(framework, component_type)?;
    debug!(
        converter = registration.name,
        %framework,
        component_type,
        "Selected component converter"
    );
    Ok((registration.build)())
}

/// Converts a trained model and persists the result.
#[async_trait]
pub trait Converter: Send + Sync {
    fn trained_model(&self) -> &Arc<dyn TrainedModel>;

    /// Convert the trained model and remember the result.
    fn convert(&mut self) -> Result<ConvertedModel>;

    /// Result of the last [`Converter::convert`] call.
    fn converted_model(&self) -> Option<&ConvertedModel>;

    /// Serialize the converted model to `dest`.
    ///
    /// Fails with [`FedServeError::NotConverted`] before `convert`.
    async fn save_model(&self, dest: &Path) -> Result<PathBuf>;
}

/// Converter for federated (FATE) models.
pub struct FateConverter {
    trained_model: Arc<dyn TrainedModel>,
    component_converter: Box<dyn ComponentConverter>,
    storage: Box<dyn ModelStorage>,
    converted: Option<ConvertedModel>,
}

impl fmt::Debug for FateConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FateConverter")
            .field("framework", &self.trained_model.preferred_framework())
            .field("storage", &self.storage)
            .field("converted", &self.converted.is_some())
            .finish()
    }
}

impl FateConverter {
    pub fn new(trained_model: Arc<dyn TrainedModel>, storage: Box<dyn ModelStorage>) -> Result<Self> {
        let component_converter = select_converter(trained_model.as_ref())?;
        Ok(Self {
            trained_model,
            component_converter,
            storage,
            converted: None,
        })
    }

    pub fn storage(&self) -> &dyn ModelStorage {
        self.storage.as_ref()
    }
}

#[async_trait]
impl Converter for FateConverter {
    fn trained_model(&self) -> &Arc<dyn TrainedModel> {
        &self.trained_model
    }

    fn convert(&mut self) -> Result<ConvertedModel> {
        let framework = self.trained_model.preferred_framework();
        let native = self
            .component_converter
            .convert(self.trained_model.component())?;
        let converted = ConvertedModel::new(framework, native);
        info!(
            component_type = self.trained_model.component().component_type(),
            %framework,
            "Converted model"
        );
        self.converted = Some(converted.clone());
        Ok(converted)
    }

    fn converted_model(&self) -> Option<&ConvertedModel> {
        self.converted.as_ref()
    }

    async fn save_model(&self, dest: &Path) -> Result<PathBuf> {
        let converted = self.converted.as_ref().ok_or(FedServeError::NotConverted)?;
        self.storage.save(converted.model(), dest).await
    }
}

/// Options for [`get_converter`].
#[derive(Debug, Clone, Default)]
pub struct ConverterOptions {
    /// Storage backend; defaults to the configured kind, then local files.
    pub storage: Option<StorageKind>,
    /// Object prefix for S3 storage; defaults to a timestamped name.
    pub sub_path: Option<String>,
}

/// Sub-path used when a converter creates S3 storage without one.
pub fn default_sub_path() -> String {
    chrono::Local::now()
        .format("converted-model-%Y%m%d-%H%M%S")
        .to_string()
}

/// Build the converter matching the trained model's type.
pub async fn get_converter(
    trained_model: Arc<dyn TrainedModel>,
    options: ConverterOptions,
    config: &EngineConfig,
) -> Result<Box<dyn Converter>> {
    match trained_model.model_type() {
        ModelType::Fate => {
            let storage =
                converter_storage(&options, trained_model.preferred_framework(), config).await?;
            Ok(Box::new(FateConverter::new(trained_model, storage)?))
        }
    }
}

/// Storage a converter saves through: the requested backend, else the
/// configured one, else local files.
pub async fn converter_storage(
    options: &ConverterOptions,
    framework: Framework,
    config: &EngineConfig,
) -> Result<Box<dyn ModelStorage>> {
    let kind = config.storage.resolve_kind(options.storage, StorageKind::LocalFile);
    let sub_path = match (kind, &options.sub_path) {
        (_, Some(sub_path)) => sub_path.clone(),
        (StorageKind::S3, None) => default_sub_path(),
        (StorageKind::LocalFile, None) => String::new(),
    };
    info!(storage = ?kind, %sub_path, %framework, "Initializing model storage");
    storage::get_model_storage(kind, &sub_path, framework, &config.storage).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::proto::{ComponentField, LrModelParam, NnModelMeta, NnParam};
    use crate::model::FateModel;
    use std::collections::{HashMap, HashSet};

    fn lr_record() -> ComponentRecord {
        ComponentRecord::new("HomoLR").with(ComponentField::LrModelParam(LrModelParam {
            weight: HashMap::from([
                ("f0".to_string(), 0.1),
                ("f1".to_string(), -0.2),
                ("f2".to_string(), 0.3),
            ]),
            intercept: 0.5,
            header: vec!["f0".into(), "f1".into(), "f2".into()],
            ..Default::default()
        }))
    }

    fn nn_record(config_type: &str) -> ComponentRecord {
        ComponentRecord::new("HomoNN").with(ComponentField::NnModelMeta(NnModelMeta {
            params: Some(NnParam {
                config_type: config_type.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }))
    }

    #[test]
    fn test_framework_aliases() {
        assert_eq!("scikit-learn".parse::<Framework>().unwrap(), Framework::Sklearn);
        assert_eq!("torch".parse::<Framework>().unwrap(), Framework::PyTorch);
        assert_eq!("PyTorch".parse::<Framework>().unwrap(), Framework::PyTorch);
        for alias in ["tf", "tensorflow", "tf_keras"] {
            assert_eq!(alias.parse::<Framework>().unwrap(), Framework::TfKeras);
        }
        assert!(matches!(
            "xgboost".parse::<Framework>(),
            Err(FedServeError::UnknownFramework(name)) if name == "xgboost"
        ));
        assert_eq!(Framework::TfKeras.to_string(), "tf_keras");
    }

    #[test]
    fn test_registry_has_no_clashes() {
        let mut claimed = HashSet::new();
        for registration in registrations() {
            for module in registration.target_modules {
                assert!(
                    claimed.insert((registration.framework, *module)),
                    "{} claimed twice for {}",
                    module,
                    registration.framework
                );
            }
        }
    }

    #[test]
    fn test_every_registration_is_selectable() {
        for registration in registrations() {
            for module in registration.target_modules {
                let found = find_registration(registration.framework, module).unwrap();
                assert!(found.target_modules.contains(module));
                let converter = (found.build)();
                assert!(converter.target_modules().contains(module));
            }
        }
    }

    #[test]
    fn test_unregistered_pair_names_both() {
        let err = find_registration(Framework::TfKeras, "HomoNN").unwrap_err();
        assert!(matches!(
            &err,
            FedServeError::ConverterNotFound { component_type, framework }
                if component_type == "HomoNN" && framework == "tf_keras"
        ));
        assert!(find_registration(Framework::Sklearn, "HomoNN").is_err());
    }

    #[cfg(feature = "sklearn")]
    #[test]
    fn test_select_converter_for_lr() {
        let model = FateModel::from_record(lr_record()).unwrap();
        let converter = select_converter(&model).unwrap();
        assert_eq!(converter.target_modules(), &["HomoLR"]);
    }

    #[test]
    fn test_select_converter_for_keras_nn_fails() {
        let model = FateModel::from_record(nn_record("keras")).unwrap();
        assert_eq!(model.preferred_framework(), Framework::TfKeras);
        let err = select_converter(&model).err().unwrap();
        assert_eq!(
            err.to_string(),
            "cannot find component converter for module: HomoNN in tf_keras"
        );
    }

    #[cfg(feature = "sklearn")]
    #[tokio::test]
    async fn test_fate_converter_convert_and_save() {
        let dir = tempfile::TempDir::new().unwrap();
        let model: Arc<dyn TrainedModel> = Arc::new(FateModel::from_record(lr_record()).unwrap());
        let mut converter =
            get_converter(model, ConverterOptions::default(), &EngineConfig::development())
                .await
                .unwrap();

        let dest = dir.path().join("model.json");
        assert!(matches!(
            converter.save_model(&dest).await,
            Err(FedServeError::NotConverted)
        ));

        let converted = converter.convert().unwrap();
        assert_eq!(converted.framework(), Framework::Sklearn);
        assert_eq!(converted.model().framework(), Framework::Sklearn);
        assert!(converter.converted_model().is_some());

        let saved = converter.save_model(&dest).await.unwrap();
        assert_eq!(saved, dest);
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_converter_storage_follows_config() {
        let mut config = EngineConfig::default();
        let storage = converter_storage(&ConverterOptions::default(), Framework::Sklearn, &config)
            .await
            .unwrap();
        assert_eq!(storage.kind(), StorageKind::LocalFile);

        config.storage.kind = Some(StorageKind::S3);
        let storage = converter_storage(&ConverterOptions::default(), Framework::Sklearn, &config)
            .await
            .unwrap();
        assert_eq!(storage.kind(), StorageKind::S3);

        let options = ConverterOptions {
            storage: Some(StorageKind::LocalFile),
            ..Default::default()
        };
        let storage = converter_storage(&options, Framework::Sklearn, &config).await.unwrap();
        assert_eq!(storage.kind(), StorageKind::LocalFile);
    }

    #[test]
    fn test_default_sub_path_format() {
        let sub_path = default_sub_path();
        assert!(sub_path.starts_with("converted-model-"));
        assert_eq!(sub_path.len(), "converted-model-20240101-120000".len());
    }
}
