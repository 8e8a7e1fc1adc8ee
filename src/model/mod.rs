//! Trained models.
//!
//! A [`TrainedModel`] is the input of a conversion: one parsed component plus
//! the framework it should be converted to. The framework is decided once,
//! when the model is built, and never changes afterwards.

pub mod fate;

pub use crate::archive::ComponentRecord;
pub use fate::{FateModel, FateModelOptions, SUPPORTED_MODULES};

use crate::config::EngineConfig;
use crate::convert::Framework;
use crate::error::{FedServeError, Result};
use crate::fate::FlowClient;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of federated-learning platform a model was trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Fate,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelType::Fate => write!(f, "fate"),
        }
    }
}

impl FromStr for ModelType {
    type Err = FedServeError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("fate") {
            Ok(ModelType::Fate)
        } else {
            Err(FedServeError::UnknownModelType(s.to_string()))
        }
    }
}

/// A trained model ready for conversion.
pub trait TrainedModel: fmt::Debug + Send + Sync {
    fn model_type(&self) -> ModelType;

    /// Target framework derived from the component.
    fn preferred_framework(&self) -> Framework;

    /// The parsed main component.
    fn component(&self) -> &ComponentRecord;
}

/// Build a trained model of the named type.
///
/// A FATE Flow client from `config` is used only when the options name
/// neither a record nor a local path.
pub async fn get_trained_model(
    model_type: &str,
    options: FateModelOptions,
    config: &EngineConfig,
) -> Result<Box<dyn TrainedModel>> {
    match model_type.parse::<ModelType>()? {
        ModelType::Fate => {
            let client = FlowClient::new(&config.fate_flow)?;
            Ok(Box::new(FateModel::load(options, &client).await?))
        }
    }
}
