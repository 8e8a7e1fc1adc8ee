//! Serving deployment.
//!
//! A [`Deployer`] stands a converted model up as an inference service. The
//! only deployer type targets KServe (formerly KFServing) InferenceServices.

pub mod crd;
pub mod kserve;
pub mod torchserve;

pub use crd::{InferenceService, InferenceServiceSpec};
pub use kserve::{
    destroy_service, wait_ready, InferenceServiceApi, KServeDeployer, KServeSettings,
    KubeInferenceServiceApi, PredictorKind,
};
pub use torchserve::TorchServeOptions;

use crate::config::{EngineConfig, StorageKind};
use crate::convert::{ConvertedModel, Framework};
use crate::error::{FedServeError, Result};
use crate::storage::{self, ModelStorage};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Deployer type used when none is named.
pub const DEFAULT_DEPLOYER_TYPE: &str = "kfserving";

/// Outcome of a service lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceStatus {
    Found(Box<InferenceService>),
    Absent,
}

impl ServiceStatus {
    pub fn is_found(&self) -> bool {
        matches!(self, ServiceStatus::Found(_))
    }

    pub fn into_service(self) -> Option<InferenceService> {
        match self {
            ServiceStatus::Found(isvc) => Some(*isvc),
            ServiceStatus::Absent => None,
        }
    }
}

/// Manages one serving service.
#[async_trait]
pub trait Deployer: Send + Sync {
    fn service_name(&self) -> &str;

    fn version(&self) -> &str;

    /// Create the service, or replace it when allowed.
    async fn deploy(&mut self) -> Result<InferenceService>;

    /// Current service state; a missing service is [`ServiceStatus::Absent`].
    async fn status(&self) -> Result<ServiceStatus>;

    /// Delete the service if it exists.
    async fn destroy(&self) -> Result<()>;

    /// Poll until the service reports ready.
    async fn wait(&self, timeout: Duration) -> Result<InferenceService>;
}

/// Options for [`get_deployer`]. Unset fields fall back to the serving
/// section of the engine configuration.
#[derive(Debug, Clone, Default)]
pub struct DeployerOptions {
    /// `kfserving` (default) or `kserve`.
    pub deployer_type: Option<String>,
    pub namespace: Option<String>,
    /// Defaults to the configured kind, then S3.
    pub storage: Option<StorageKind>,
    pub storage_uri: Option<String>,
    pub protocol_version: Option<String>,
    pub replace: Option<bool>,
    pub share_storage_creds: Option<bool>,
    pub service_account: Option<String>,
    pub torchserve: TorchServeOptions,
    pub image_transformer: Option<String>,
}

fn is_kserve(deployer_type: &str) -> bool {
    matches!(
        deployer_type.to_ascii_lowercase().as_str(),
        "kfserving" | "kserve"
    )
}

/// Fold options over the configured serving defaults.
pub fn kserve_settings(options: &DeployerOptions, config: &EngineConfig, default_namespace: &str) -> KServeSettings {
    let serving = &config.serving;
    KServeSettings {
        namespace: options
            .namespace
            .clone()
            .or_else(|| serving.namespace.clone())
            .unwrap_or_else(|| default_namespace.to_string()),
        storage_uri: options.storage_uri.clone(),
        protocol_version: options
            .protocol_version
            .clone()
            .unwrap_or_else(|| serving.protocol_version.clone()),
        replace: options.replace.unwrap_or(serving.replace),
        share_storage_creds: options
            .share_storage_creds
            .unwrap_or(serving.share_storage_creds),
        service_account: options
            .service_account
            .clone()
            .or_else(|| serving.service_account.clone()),
        torchserve: options.torchserve.clone(),
        image_transformer: options.image_transformer.clone(),
    }
}

/// Kubernetes-backed service API in `namespace`, falling back to the
/// configured namespace and then the client's default.
pub async fn service_api(
    namespace: Option<String>,
    config: &EngineConfig,
) -> Result<KubeInferenceServiceApi> {
    let client = kube::Client::try_default().await?;
    let namespace = namespace
        .or_else(|| config.serving.namespace.clone())
        .unwrap_or_else(|| client.default_namespace().to_string());
    Ok(KubeInferenceServiceApi::new(client, namespace))
}

/// Storage a deployer uploads to: the requested backend, else the
/// configured one, else S3. Objects live under `<service_name>/<version>`.
pub async fn deployer_storage(
    service_name: &str,
    version: &str,
    framework: Framework,
    options: &DeployerOptions,
    config: &EngineConfig,
) -> Result<Box<dyn ModelStorage>> {
    let kind = config.storage.resolve_kind(options.storage, StorageKind::S3);
    storage::get_model_storage(
        kind,
        &format!("{}/{}", service_name, version),
        framework,
        &config.storage,
    )
    .await
}

/// Build a deployer for `converted`.
///
/// Model files are stored under `<service_name>/<version>`.
pub async fn get_deployer(
    service_name: &str,
    version: &str,
    converted: ConvertedModel,
    options: DeployerOptions,
    config: &EngineConfig,
) -> Result<Box<dyn Deployer>> {
    let deployer_type = options
        .deployer_type
        .clone()
        .unwrap_or_else(|| DEFAULT_DEPLOYER_TYPE.to_string());
    if !is_kserve(&deployer_type) {
        return Err(FedServeError::UnknownDeployerType(deployer_type));
    }

    let client = kube::Client::try_default().await?;
    let settings = kserve_settings(&options, config, client.default_namespace());

    let storage =
        deployer_storage(service_name, version, converted.framework(), &options, config).await?;

    let api = KubeInferenceServiceApi::new(client, settings.namespace.clone());
    info!(
        service = service_name,
        version,
        framework = %converted.framework(),
        namespace = %settings.namespace,
        "Initialized KServe deployer"
    );
    Ok(Box::new(KServeDeployer::new(
        service_name,
        version,
        converted,
        settings,
        storage,
        Box::new(api),
    )))
}
