//! Deployment integration tests
//!
//! Runs the KServe deployer against an in-memory cluster and local model
//! storage.

#[allow(dead_code)]
mod common;

use async_trait::async_trait;
use common::*;
use fedserve::config::{EngineConfig, S3StorageConfig};
use fedserve::convert::onnx::ModelProto;
use fedserve::convert::{self, ConverterOptions};
use fedserve::deploy::kserve::ANNOTATION_UUID;
use fedserve::deploy::{
    DeployerOptions, InferenceServiceApi, KServeDeployer, KServeSettings, PredictorKind,
};
use fedserve::storage::LocalModelStorage;
use fedserve::{
    ConvertedModel, Deployer, Engine, FateModel, FedServeError, Framework, InferenceService,
    Result, ServiceStatus, TrainedModel,
};
use prost::Message;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// In-memory InferenceService store keyed by name.
#[derive(Clone, Default)]
struct MemoryCluster {
    services: Arc<Mutex<BTreeMap<String, InferenceService>>>,
}

impl MemoryCluster {
    fn service(&self, name: &str) -> Option<InferenceService> {
        self.services.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl InferenceServiceApi for MemoryCluster {
    async fn get(&self, name: &str) -> Result<ServiceStatus> {
        Ok(match self.service(name) {
            Some(isvc) => ServiceStatus::Found(Box::new(isvc)),
            None => ServiceStatus::Absent,
        })
    }

    async fn create(&self, isvc: &InferenceService) -> Result<InferenceService> {
        let name = isvc.metadata.name.clone().unwrap_or_default();
        self.services.lock().unwrap().insert(name, isvc.clone());
        Ok(isvc.clone())
    }

    async fn replace(&self, name: &str, isvc: &InferenceService) -> Result<InferenceService> {
        self.services
            .lock()
            .unwrap()
            .insert(name.to_string(), isvc.clone());
        Ok(isvc.clone())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.services.lock().unwrap().remove(name);
        Ok(())
    }

    async fn share_s3_credentials(&self, _s3: &S3StorageConfig, _service_account: &str) -> Result<()> {
        Ok(())
    }
}

async fn converted_lr(archive: &TempDir) -> ConvertedModel {
    let trained: Arc<dyn TrainedModel> = Arc::new(FateModel::from_path(archive.path()).unwrap());
    let mut converter = convert::get_converter(trained, ConverterOptions::default(), &EngineConfig::development())
        .await
        .unwrap();
    converter.convert().unwrap()
}

fn kserve_deployer(
    converted: ConvertedModel,
    storage_root: &TempDir,
    cluster: &MemoryCluster,
    settings: KServeSettings,
) -> KServeDeployer {
    let storage = LocalModelStorage::new(converted.framework(), storage_root.path().join("svc/1.0"));
    KServeDeployer::new(
        "svc",
        "1.0",
        converted,
        settings,
        Box::new(storage),
        Box::new(cluster.clone()),
    )
}

#[tokio::test]
async fn test_deploy_uploads_model_and_creates_service() {
    let archive = lr_archive();
    let storage_root = TempDir::new().unwrap();
    let cluster = MemoryCluster::default();

    let converted = converted_lr(&archive).await;
    let mut deployer = kserve_deployer(converted, &storage_root, &cluster, KServeSettings::default());
    assert_eq!(deployer.predictor_kind(), PredictorKind::OnnxV1);

    deployer.deploy().await.unwrap();

    let model_dir = storage_root.path().join("svc/1.0");
    assert_eq!(deployer.storage_uri(), Some(model_dir.to_string_lossy().as_ref()));

    // ONNX Runtime loads model.onnx from the root of the storage URI.
    let model = ModelProto::decode(std::fs::read(model_dir.join("model.onnx")).unwrap().as_slice()).unwrap();
    let node = &model.graph.as_ref().unwrap().node[0];
    assert_eq!((node.domain.as_str(), node.op_type.as_str()), ("ai.onnx.ml", "LinearClassifier"));
    assert_eq!(
        model.attribute("coefficients").unwrap().floats,
        vec![-0.1, 0.2, -0.3, 0.1, -0.2, 0.3]
    );
    assert_eq!(model.attribute("intercepts").unwrap().floats, vec![-0.5, 0.5]);

    let isvc = cluster.service("svc").unwrap();
    let onnx = isvc.spec.predictor.onnx.as_ref().unwrap();
    assert_eq!(onnx.storage_uri.as_deref(), deployer.storage_uri());
    assert!(onnx.protocol_version.is_none());
    assert_eq!(isvc.metadata.namespace.as_deref(), Some("default"));
    assert!(isvc
        .metadata
        .annotations
        .as_ref()
        .unwrap()
        .contains_key(ANNOTATION_UUID));
}

#[tokio::test]
async fn test_existing_service_requires_replace() {
    let archive = lr_archive();
    let storage_root = TempDir::new().unwrap();
    let cluster = MemoryCluster::default();
    let converted = converted_lr(&archive).await;

    let mut first = kserve_deployer(converted.clone(), &storage_root, &cluster, KServeSettings::default());
    first.deploy().await.unwrap();
    let first_uuid = cluster.service("svc").unwrap().metadata.annotations.unwrap()[ANNOTATION_UUID].clone();

    let mut second = kserve_deployer(converted.clone(), &storage_root, &cluster, KServeSettings::default());
    let err = second.deploy().await.unwrap_err();
    assert!(matches!(err, FedServeError::AlreadyExists(name) if name == "svc"));

    let settings = KServeSettings {
        replace: true,
        protocol_version: "v2".to_string(),
        ..Default::default()
    };
    let mut replacing = kserve_deployer(converted, &storage_root, &cluster, settings);
    replacing.deploy().await.unwrap();

    let isvc = cluster.service("svc").unwrap();
    let onnx = isvc.spec.predictor.onnx.as_ref().unwrap();
    assert_eq!(onnx.protocol_version.as_deref(), Some("v2"));
    assert_ne!(isvc.metadata.annotations.unwrap()[ANNOTATION_UUID], first_uuid);

    // Triton reads a model repository.
    let repository_model = storage_root.path().join("svc/1.0/svc/1/model.onnx");
    assert!(ModelProto::decode(std::fs::read(repository_model).unwrap().as_slice()).is_ok());
}

#[tokio::test]
async fn test_status_and_destroy_lifecycle() {
    let archive = lr_archive();
    let storage_root = TempDir::new().unwrap();
    let cluster = MemoryCluster::default();
    let converted = converted_lr(&archive).await;
    let mut deployer = kserve_deployer(converted, &storage_root, &cluster, KServeSettings::default());

    assert_eq!(deployer.status().await.unwrap(), ServiceStatus::Absent);
    deployer.destroy().await.unwrap();

    deployer.deploy().await.unwrap();
    assert!(deployer.status().await.unwrap().is_found());

    deployer.destroy().await.unwrap();
    assert_eq!(deployer.status().await.unwrap(), ServiceStatus::Absent);
}

#[tokio::test]
async fn test_engine_runs_with_explicit_deployer() {
    let archive = lr_archive();
    let storage_root = TempDir::new().unwrap();
    let cluster = MemoryCluster::default();
    let converted = converted_lr(&archive).await;

    let trained: Arc<dyn TrainedModel> = Arc::new(FateModel::from_path(archive.path()).unwrap());
    let mut engine = Engine::new(
        "svc",
        None,
        trained,
        ConverterOptions::default(),
        DeployerOptions::default(),
        EngineConfig::development(),
    )
    .with_deployer(Box::new(kserve_deployer(
        converted,
        &storage_root,
        &cluster,
        KServeSettings::default(),
    )));

    let deployed = engine.run().await.unwrap();
    assert_eq!(deployed.metadata.name.as_deref(), Some("svc"));
    assert_eq!(engine.converted_model().unwrap().framework(), Framework::Sklearn);
    assert!(cluster.service("svc").is_some());
}
