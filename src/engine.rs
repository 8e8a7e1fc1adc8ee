//! End-to-end orchestration: trained model, converter, deployer.

use crate::config::EngineConfig;
use crate::convert::{self, ConvertedModel, Converter, ConverterOptions};
use crate::deploy::{self, Deployer, DeployerOptions, InferenceService};
use crate::error::{FedServeError, Result};
use crate::model::TrainedModel;
use std::sync::Arc;
use tracing::info;

/// Service version used when none is given.
pub const DEFAULT_SERVICE_VERSION: &str = "1.0";

/// Converts a trained model and deploys it as a named service.
///
/// The converter and deployer are inferred on first use unless they were
/// set explicitly.
pub struct Engine {
    service_name: String,
    version: String,
    trained_model: Arc<dyn TrainedModel>,
    converter_options: ConverterOptions,
    deployer_options: DeployerOptions,
    config: EngineConfig,
    converter: Option<Box<dyn Converter>>,
    deployer: Option<Box<dyn Deployer>>,
    converted_model: Option<ConvertedModel>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("service_name", &self.service_name)
            .field("version", &self.version)
            .field("trained_model", &self.trained_model)
            .field("converted", &self.converted_model.is_some())
            .field("has_deployer", &self.deployer.is_some())
            .finish()
    }
}

impl Engine {
    pub fn new(
        service_name: impl Into<String>,
        version: Option<String>,
        trained_model: Arc<dyn TrainedModel>,
        converter_options: ConverterOptions,
        deployer_options: DeployerOptions,
        config: EngineConfig,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            version: version.unwrap_or_else(|| DEFAULT_SERVICE_VERSION.to_string()),
            trained_model,
            converter_options,
            deployer_options,
            config,
            converter: None,
            deployer: None,
            converted_model: None,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn trained_model(&self) -> &Arc<dyn TrainedModel> {
        &self.trained_model
    }

    pub fn converted_model(&self) -> Option<&ConvertedModel> {
        self.converted_model.as_ref()
    }

    /// The deployer, once inferred or set.
    pub fn deployer(&self) -> Option<&dyn Deployer> {
        self.deployer.as_deref()
    }

    /// Use this converter instead of inferring one.
    pub fn with_converter(mut self, converter: Box<dyn Converter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Use this deployer instead of inferring one.
    pub fn with_deployer(mut self, deployer: Box<dyn Deployer>) -> Self {
        self.deployer = Some(deployer);
        self
    }

    /// Build the converter for the trained model.
    pub async fn infer_converter(&mut self) -> Result<&mut Box<dyn Converter>> {
        let converter = convert::get_converter(
            self.trained_model.clone(),
            self.converter_options.clone(),
            &self.config,
        )
        .await?;
        Ok(self.converter.insert(converter))
    }

    /// Build the deployer, converting the model first if needed.
    pub async fn infer_deployer(&mut self) -> Result<&mut Box<dyn Deployer>> {
        let converted = self.ensure_converted().await?;
        let deployer = deploy::get_deployer(
            &self.service_name,
            &self.version,
            converted,
            self.deployer_options.clone(),
            &self.config,
        )
        .await?;
        Ok(self.deployer.insert(deployer))
    }

    async fn ensure_converted(&mut self) -> Result<ConvertedModel> {
        if let Some(converted) = &self.converted_model {
            return Ok(converted.clone());
        }
        self.convert().await
    }

    /// Convert the trained model, inferring the converter if needed.
    pub async fn convert(&mut self) -> Result<ConvertedModel> {
        if self.converter.is_none() {
            self.infer_converter().await?;
        }
        let converter = self
            .converter
            .as_mut()
            .ok_or_else(|| FedServeError::Internal("converter not initialized".to_string()))?;
        let converted = converter.convert()?;
        self.converted_model = Some(converted.clone());
        Ok(converted)
    }

    /// Convert, then deploy. Returns the submitted InferenceService.
    pub async fn run(&mut self) -> Result<InferenceService> {
        self.convert().await?;
        if self.deployer.is_none() {
            self.infer_deployer().await?;
        }
        let deployer = self
            .deployer
            .as_mut()
            .ok_or_else(|| FedServeError::Internal("deployer not initialized".to_string()))?;
        let deployed = deployer.deploy().await?;
        info!(service = %self.service_name, version = %self.version, "Engine run completed");
        Ok(deployed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::proto::{ComponentField, LrModelParam};
    use crate::archive::ComponentRecord;
    use crate::deploy::{InferenceServiceSpec, ServiceStatus};
    use crate::model::FateModel;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDeployer {
        deployed: Mutex<usize>,
    }

    #[async_trait]
    impl Deployer for RecordingDeployer {
        fn service_name(&self) -> &str {
            "svc"
        }

        fn version(&self) -> &str {
            "1.0"
        }

        async fn deploy(&mut self) -> Result<InferenceService> {
            *self.deployed.lock().unwrap() += 1;
            Ok(InferenceService::new("svc", InferenceServiceSpec::default()))
        }

        async fn status(&self) -> Result<ServiceStatus> {
            Ok(ServiceStatus::Absent)
        }

        async fn destroy(&self) -> Result<()> {
            Ok(())
        }

        async fn wait(&self, _timeout: Duration) -> Result<InferenceService> {
            Err(FedServeError::Timeout(0, "svc".to_string()))
        }
    }

    fn lr_model() -> Arc<dyn TrainedModel> {
        let record = ComponentRecord::new("HomoLR").with(ComponentField::LrModelParam(LrModelParam {
            weight: HashMap::from([("x".to_string(), 1.5)]),
            intercept: 0.25,
            header: vec!["x".to_string()],
            ..Default::default()
        }));
        Arc::new(FateModel::from_record(record).unwrap())
    }

    fn engine() -> Engine {
        Engine::new(
            "svc",
            None,
            lr_model(),
            ConverterOptions::default(),
            DeployerOptions::default(),
            EngineConfig::development(),
        )
    }

    #[test]
    fn test_default_version() {
        assert_eq!(engine().version(), "1.0");
    }

    #[cfg(feature = "sklearn")]
    #[tokio::test]
    async fn test_run_converts_then_deploys() {
        let mut engine = engine().with_deployer(Box::new(RecordingDeployer::default()));
        let deployed = engine.run().await.unwrap();
        assert_eq!(deployed.metadata.name.as_deref(), Some("svc"));

        let converted = engine.converted_model().unwrap();
        assert_eq!(converted.framework(), crate::convert::Framework::Sklearn);
        assert_eq!(engine.deployer().unwrap().service_name(), "svc");
    }

    #[cfg(feature = "sklearn")]
    #[tokio::test]
    async fn test_convert_infers_converter_once() {
        let mut engine = engine();
        engine.convert().await.unwrap();
        assert!(engine.converter.is_some());
        let again = engine.ensure_converted().await.unwrap();
        assert_eq!(again.framework(), crate::convert::Framework::Sklearn);
    }
}
