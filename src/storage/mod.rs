//! Model storage.
//!
//! Storage does two jobs: it serializes a converted model to a local file in
//! the native format of its framework, and it uploads prepared model files
//! to the place a serving runtime reads them from.

use crate::config::{S3StorageConfig, StorageConfig, StorageKind};
use crate::convert::{onnx, Framework, NativeModel};
use crate::error::{FedServeError, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A local file to upload and its destination relative to the storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageObject {
    pub dest: String,
    pub path: PathBuf,
}

impl StorageObject {
    pub fn new(dest: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            dest: dest.into(),
            path: path.into(),
        }
    }
}

/// Persists converted models.
#[async_trait]
pub trait ModelStorage: fmt::Debug + Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Framework of the models this storage serializes.
    fn framework(&self) -> Framework;

    /// Serialize `model` to the local file `dest` and return its path.
    async fn save(&self, model: &NativeModel, dest: &Path) -> Result<PathBuf> {
        save_native(self.framework(), model, dest).await
    }

    /// Upload `objects` under this storage's prefix and return its URI.
    async fn upload_objects(&self, objects: &[StorageObject]) -> Result<String>;

    /// S3 settings to share with the serving runtime, if this is S3 storage.
    fn s3_config(&self) -> Option<&S3StorageConfig> {
        None
    }
}

/// Serialize a native model in its framework's format.
///
/// sklearn models are written as ONNX, or as JSON when `dest` ends in
/// `.json`. PyTorch models are written as the module checkpoint.
pub async fn save_native(framework: Framework, model: &NativeModel, dest: &Path) -> Result<PathBuf> {
    match (framework, model) {
        (Framework::Sklearn, NativeModel::Sklearn(lr)) => {
            let bytes = if dest.extension().is_some_and(|ext| ext == "json") {
                serde_json::to_vec_pretty(lr)?
            } else {
                onnx::encode(lr)
            };
            tokio::fs::write(dest, bytes).await?;
        }
        (Framework::PyTorch, NativeModel::PyTorch(module)) => {
            module.write_to(dest)?;
        }
        (Framework::TfKeras, _) => {
            return Err(FedServeError::NotImplemented(format!(
                "save method for framework: {} is not implemented",
                framework
            )))
        }
        (framework, model) => {
            return Err(FedServeError::InvalidArgument(format!(
                "cannot save a {} model with {} storage",
                model.framework(),
                framework
            )))
        }
    }
    info!(%framework, dest = %dest.display(), "Saved model");
    Ok(dest.to_path_buf())
}

/// Storage on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalModelStorage {
    framework: Framework,
    root: PathBuf,
}

impl LocalModelStorage {
    pub fn new(framework: Framework, root: impl Into<PathBuf>) -> Self {
        Self {
            framework,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ModelStorage for LocalModelStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::LocalFile
    }

    fn framework(&self) -> Framework {
        self.framework
    }

    async fn upload_objects(&self, objects: &[StorageObject]) -> Result<String> {
        for object in objects {
            let target = self.root.join(&object.dest);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&object.path, &target).await?;
            debug!(src = %object.path.display(), dest = %target.display(), "Copied object");
        }
        Ok(self.root.display().to_string())
    }
}

/// S3-compatible object storage such as MinIO.
#[derive(Debug, Clone)]
pub struct S3ModelStorage {
    framework: Framework,
    config: S3StorageConfig,
    sub_path: String,
    client: aws_sdk_s3::Client,
}

impl S3ModelStorage {
    pub async fn new(framework: Framework, config: S3StorageConfig, sub_path: &str) -> Result<Self> {
        let credentials = aws_sdk_s3::config::Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "fedserve",
        );
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(config.endpoint_url())
            .region(aws_config::Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Ok(Self {
            framework,
            config,
            sub_path: sub_path.trim_matches('/').to_string(),
            client: aws_sdk_s3::Client::from_conf(s3_config),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub fn sub_path(&self) -> &str {
        &self.sub_path
    }

    /// URI of the storage prefix.
    pub fn uri(&self) -> String {
        storage_uri(&self.config.bucket, &self.sub_path)
    }

    async fn ensure_bucket(&self) -> Result<()> {
        if self.client.head_bucket().bucket(self.bucket()).send().await.is_ok() {
            return Ok(());
        }
        info!(bucket = self.bucket(), "Creating bucket");
        self.client
            .create_bucket()
            .bucket(self.bucket())
            .send()
            .await
            .map_err(|e| FedServeError::Storage(format!("create bucket {}: {}", self.bucket(), e)))?;
        Ok(())
    }
}

#[async_trait]
impl ModelStorage for S3ModelStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::S3
    }

    fn framework(&self) -> Framework {
        self.framework
    }

    async fn upload_objects(&self, objects: &[StorageObject]) -> Result<String> {
        self.ensure_bucket().await?;
        for object in objects {
            let key = object_key(&self.sub_path, &object.dest);
            let body = ByteStream::from_path(&object.path)
                .await
                .map_err(|e| FedServeError::Storage(format!("{}: {}", object.path.display(), e)))?;
            self.client
                .put_object()
                .bucket(self.bucket())
                .key(&key)
                .body(body)
                .send()
                .await
                .map_err(|e| FedServeError::Storage(format!("put {}: {}", key, e)))?;
            debug!(bucket = self.bucket(), %key, "Uploaded object");
        }
        let uri = self.uri();
        info!(%uri, objects = objects.len(), "Uploaded model objects");
        Ok(uri)
    }

    fn s3_config(&self) -> Option<&S3StorageConfig> {
        Some(&self.config)
    }
}

/// Object key for `dest` under `sub_path`.
pub fn object_key(sub_path: &str, dest: &str) -> String {
    let dest = dest.trim_start_matches('/');
    if sub_path.is_empty() {
        dest.to_string()
    } else {
        format!("{}/{}", sub_path.trim_end_matches('/'), dest)
    }
}

/// `s3://` URI of a bucket prefix.
pub fn storage_uri(bucket: &str, sub_path: &str) -> String {
    if sub_path.is_empty() {
        format!("s3://{}", bucket)
    } else {
        format!("s3://{}/{}", bucket, sub_path)
    }
}

/// Build the storage backend of the given kind.
///
/// For local storage `sub_path` is joined onto the configured root.
pub async fn get_model_storage(
    kind: StorageKind,
    sub_path: &str,
    framework: Framework,
    config: &StorageConfig,
) -> Result<Box<dyn ModelStorage>> {
    match kind {
        StorageKind::LocalFile => Ok(Box::new(LocalModelStorage::new(
            framework,
            config.local_root.join(sub_path),
        ))),
        StorageKind::S3 => Ok(Box::new(
            S3ModelStorage::new(framework, config.s3.clone(), sub_path).await?,
        )),
    }
}
