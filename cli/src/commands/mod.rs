//! CLI subcommands

pub mod convert;
pub mod deploy;
pub mod inspect;
pub mod service;

use anyhow::{Context, Result};
use clap::Args;
use fedserve::config::EngineConfig;
use fedserve::model::{self, FateModelOptions};
use fedserve::TrainedModel;
use std::path::PathBuf;
use std::sync::Arc;

/// Where to load the trained model from.
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Model type
    #[arg(long, default_value = "fate")]
    pub model_type: String,

    /// Local archive directory
    #[arg(short = 'p', long, conflicts_with = "model_version")]
    pub model_path: Option<PathBuf>,

    /// Model version to export from FATE Flow
    #[arg(long = "model-version")]
    pub model_version: Option<String>,

    /// Party role used when exporting
    #[arg(long, requires = "model_version")]
    pub role: Option<String>,

    /// Party ID; queried from FATE Flow when omitted
    #[arg(long, requires = "model_version")]
    pub party_id: Option<String>,

    /// Model ID; queried from FATE Flow when omitted
    #[arg(long, requires = "model_version")]
    pub model_id: Option<String>,
}

impl ModelArgs {
    pub fn options(&self) -> FateModelOptions {
        FateModelOptions {
            record: None,
            model_path: self.model_path.clone(),
            model_version: self.model_version.clone(),
            role: self.role.clone(),
            party_id: self.party_id.clone(),
            model_id: self.model_id.clone(),
        }
    }

    pub async fn load(&self, config: &EngineConfig) -> Result<Arc<dyn TrainedModel>> {
        let trained = model::get_trained_model(&self.model_type, self.options(), config)
            .await
            .context("Failed to load trained model")?;
        Ok(Arc::from(trained))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        model: ModelArgs,
    }

    #[test]
    fn test_model_args_to_options() {
        let harness = Harness::parse_from([
            "test",
            "--model-version",
            "202401011200",
            "--party-id",
            "9999",
        ]);
        let options = harness.model.options();
        assert_eq!(options.model_version.as_deref(), Some("202401011200"));
        assert_eq!(options.party_id.as_deref(), Some("9999"));
        assert!(options.model_path.is_none());
        assert_eq!(harness.model.model_type, "fate");
    }

    #[test]
    fn test_path_conflicts_with_version() {
        let result = Harness::try_parse_from(["test", "-p", "/tmp/m", "--model-version", "1"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_party_id_requires_version() {
        let result = Harness::try_parse_from(["test", "--party-id", "9999"]);
        assert!(result.is_err());
    }
}
