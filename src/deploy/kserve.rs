//! KServe / KFServing deployer.

use super::crd::{
    Container, EnvVar, InferenceService, InferenceServiceSpec, ModelServerSpec, PredictorSpec,
    TransformerSpec,
};
use super::torchserve::{self, TorchServeOptions};
use super::{Deployer, ServiceStatus};
use crate::config::S3StorageConfig;
use crate::convert::{ConvertedModel, Framework, NativeModel};
use crate::error::{FedServeError, Result};
use crate::storage::{ModelStorage, StorageObject};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Secret, ServiceAccount};
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Annotation stamped with a fresh UUID on every deploy to force a rollout.
pub const ANNOTATION_UUID: &str = "fedserve.dev/uuid";

/// Secret holding the S3 credentials used by the storage initializer.
pub const S3_SECRET_NAME: &str = "fedserve-s3-secret";

pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

const FIELD_MANAGER: &str = "fedserve";

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// File name the ONNX model servers load.
pub const ONNX_MODEL_FILE: &str = "model.onnx";

/// Model server used for a converted model.
///
/// Linear models are served from their ONNX export: by ONNX Runtime over the
/// v1 protocol, or by Triton over the v2 protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictorKind {
    OnnxV1,
    OnnxV2,
    TorchServe,
    TfServing,
}

impl PredictorKind {
    pub fn for_framework(framework: Framework, protocol_version: &str) -> Self {
        match framework {
            Framework::Sklearn if protocol_version == "v2" => PredictorKind::OnnxV2,
            Framework::Sklearn => PredictorKind::OnnxV1,
            Framework::PyTorch => PredictorKind::TorchServe,
            Framework::TfKeras => PredictorKind::TfServing,
        }
    }

    /// Predictor spec pointing at `storage_uri`.
    pub fn predictor(&self, storage_uri: &str) -> PredictorSpec {
        let server = ModelServerSpec::with_storage_uri(storage_uri);
        match self {
            PredictorKind::OnnxV1 => PredictorSpec {
                onnx: Some(server),
                ..Default::default()
            },
            PredictorKind::OnnxV2 => PredictorSpec {
                onnx: Some(ModelServerSpec {
                    protocol_version: Some("v2".to_string()),
                    ..server
                }),
                ..Default::default()
            },
            PredictorKind::TorchServe => PredictorSpec {
                pytorch: Some(server),
                ..Default::default()
            },
            PredictorKind::TfServing => PredictorSpec {
                tensorflow: Some(server),
                ..Default::default()
            },
        }
    }

    /// Where a single-file model goes under the storage URI. Triton reads a
    /// model repository, `<model>/<version>/model.onnx`.
    pub fn model_file(&self, service_name: &str) -> String {
        match self {
            PredictorKind::OnnxV1 => ONNX_MODEL_FILE.to_string(),
            PredictorKind::OnnxV2 => format!("{}/1/{}", service_name, ONNX_MODEL_FILE),
            PredictorKind::TorchServe | PredictorKind::TfServing => "model".to_string(),
        }
    }
}

/// Settings for [`KServeDeployer`].
#[derive(Debug, Clone)]
pub struct KServeSettings {
    pub namespace: String,
    /// Use this URI instead of uploading the model.
    pub storage_uri: Option<String>,
    pub protocol_version: String,
    pub replace: bool,
    pub share_storage_creds: bool,
    pub service_account: Option<String>,
    pub torchserve: TorchServeOptions,
    /// Image of a transformer placed in front of TorchServe predictors.
    pub image_transformer: Option<String>,
}

impl Default for KServeSettings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            storage_uri: None,
            protocol_version: "v1".to_string(),
            replace: false,
            share_storage_creds: true,
            service_account: None,
            torchserve: TorchServeOptions::default(),
            image_transformer: None,
        }
    }
}

/// Deploys a converted model as an InferenceService.
pub struct KServeDeployer {
    service_name: String,
    version: String,
    converted: ConvertedModel,
    predictor: PredictorKind,
    settings: KServeSettings,
    storage: Box<dyn ModelStorage>,
    api: Box<dyn InferenceServiceApi>,
    storage_uri: Option<String>,
    isvc: Option<InferenceService>,
}

impl std::fmt::Debug for KServeDeployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KServeDeployer")
            .field("service_name", &self.service_name)
            .field("version", &self.version)
            .field("predictor", &self.predictor)
            .field("namespace", &self.settings.namespace)
            .field("storage", &self.storage)
            .field("storage_uri", &self.storage_uri)
            .finish()
    }
}

impl KServeDeployer {
    pub fn new(
        service_name: impl Into<String>,
        version: impl Into<String>,
        converted: ConvertedModel,
        settings: KServeSettings,
        storage: Box<dyn ModelStorage>,
        api: Box<dyn InferenceServiceApi>,
    ) -> Self {
        let predictor = PredictorKind::for_framework(converted.framework(), &settings.protocol_version);
        let storage_uri = settings.storage_uri.clone();
        Self {
            service_name: service_name.into(),
            version: version.into(),
            converted,
            predictor,
            settings,
            storage,
            api,
            storage_uri,
            isvc: None,
        }
    }

    pub fn predictor_kind(&self) -> PredictorKind {
        self.predictor
    }

    pub fn storage_uri(&self) -> Option<&str> {
        self.storage_uri.as_deref()
    }

    /// Upload the model files unless a storage URI is already known.
    pub async fn prepare_model(&mut self) -> Result<String> {
        if let Some(uri) = &self.storage_uri {
            return Ok(uri.clone());
        }

        let workdir = tempfile::Builder::new().prefix("fedserve-deploy-").tempdir()?;
        let objects = self.model_objects(workdir.path()).await?;
        let uri = self.storage.upload_objects(&objects).await?;
        info!(service = %self.service_name, %uri, "Prepared model");
        self.storage_uri = Some(uri.clone());
        Ok(uri)
    }

    async fn model_objects(&self, workdir: &std::path::Path) -> Result<Vec<StorageObject>> {
        match (self.predictor, self.converted.model()) {
            (PredictorKind::TorchServe, NativeModel::PyTorch(module)) => {
                let files = torchserve::generate_files(
                    workdir,
                    &self.service_name,
                    &self.version,
                    module,
                    &self.settings.torchserve,
                )
                .await?;
                Ok(files.storage_objects())
            }
            (PredictorKind::TorchServe, model) => Err(FedServeError::InvalidArgument(format!(
                "TorchServe cannot serve a {} model",
                model.framework()
            ))),
            (_, model) => {
                let file_name = match self.predictor {
                    PredictorKind::OnnxV1 | PredictorKind::OnnxV2 => ONNX_MODEL_FILE,
                    _ => "model",
                };
                let saved = self.storage.save(model, &workdir.join(file_name)).await?;
                let dest = self.predictor.model_file(&self.service_name);
                Ok(vec![StorageObject::new(dest, saved)])
            }
        }
    }

    /// Build the InferenceService spec for the prepared storage URI.
    pub fn prepare_isvc(&mut self) -> Result<&InferenceService> {
        let storage_uri = self.storage_uri.clone().ok_or_else(|| {
            FedServeError::Internal("model storage must be prepared before the service".to_string())
        })?;

        let mut predictor = self.predictor.predictor(&storage_uri);
        predictor.service_account_name = self.settings.service_account.clone();

        let transformer = match (&self.settings.image_transformer, self.predictor) {
            (Some(image), PredictorKind::TorchServe) => Some(TransformerSpec {
                containers: vec![Container {
                    name: "kserve-container".to_string(),
                    image: image.clone(),
                    env: vec![EnvVar {
                        name: "STORAGE_URI".to_string(),
                        value: storage_uri.clone(),
                    }],
                }],
            }),
            _ => None,
        };

        let mut isvc = InferenceService::new(
            &self.service_name,
            InferenceServiceSpec {
                predictor,
                transformer,
            },
        );
        isvc.metadata.namespace = Some(self.settings.namespace.clone());
        debug!(isvc = ?isvc, "InferenceService spec ready");
        Ok(self.isvc.insert(isvc))
    }

    fn service_account(&self) -> &str {
        self.settings
            .service_account
            .as_deref()
            .unwrap_or(DEFAULT_SERVICE_ACCOUNT)
    }
}

#[async_trait]
impl Deployer for KServeDeployer {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn deploy(&mut self) -> Result<InferenceService> {
        if self.api.get(&self.service_name).await?.is_found() && !self.settings.replace {
            return Err(FedServeError::AlreadyExists(self.service_name.clone()));
        }

        if self.isvc.is_none() {
            info!(service = %self.service_name, "Preparing model storage and InferenceService spec");
            self.prepare_model().await?;
            self.prepare_isvc()?;
        }
        let mut isvc = match self.isvc.clone() {
            Some(isvc) => isvc,
            None => return Err(FedServeError::Internal("InferenceService spec missing".to_string())),
        };
        isvc.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_UUID.to_string(), uuid::Uuid::new_v4().to_string());

        if self.settings.share_storage_creds {
            if let Some(s3) = self.storage.s3_config() {
                self.api.share_s3_credentials(s3, self.service_account()).await?;
            }
        }

        let deployed = if self.api.get(&self.service_name).await?.is_found() {
            info!(service = %self.service_name, "Replacing InferenceService");
            isvc.metadata.resource_version = None;
            self.api.replace(&self.service_name, &isvc).await?
        } else {
            info!(service = %self.service_name, "Creating InferenceService");
            self.api.create(&isvc).await?
        };
        self.isvc = Some(isvc);
        info!(
            service = %self.service_name,
            namespace = %self.settings.namespace,
            "InferenceService submitted; use status() or wait() to check readiness"
        );
        Ok(deployed)
    }

    async fn status(&self) -> Result<ServiceStatus> {
        self.api.get(&self.service_name).await
    }

    async fn destroy(&self) -> Result<()> {
        destroy_service(self.api.as_ref(), &self.service_name).await.map(|_| ())
    }

    async fn wait(&self, timeout: Duration) -> Result<InferenceService> {
        wait_ready(self.api.as_ref(), &self.service_name, timeout).await
    }
}

/// Delete the named service if present. Returns whether it existed.
pub async fn destroy_service(api: &dyn InferenceServiceApi, name: &str) -> Result<bool> {
    if !api.get(name).await?.is_found() {
        debug!(service = name, "InferenceService absent, nothing to delete");
        return Ok(false);
    }
    api.delete(name).await?;
    info!(service = name, "InferenceService deleted");
    Ok(true)
}

/// Poll until the named service reports ready.
pub async fn wait_ready(
    api: &dyn InferenceServiceApi,
    name: &str,
    timeout: Duration,
) -> Result<InferenceService> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let ServiceStatus::Found(isvc) = api.get(name).await? {
            if isvc.is_ready() {
                return Ok(*isvc);
            }
        }
        if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
            return Err(FedServeError::Timeout(
                timeout.as_secs(),
                format!("InferenceService {} to become ready", name),
            ));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
