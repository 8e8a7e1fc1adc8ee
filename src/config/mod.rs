//! Configuration module for fedserve.

use crate::error::{FedServeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for a conversion and serving run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// FATE Flow server used to fetch archives by version.
    #[serde(default)]
    pub fate_flow: FateFlowConfig,
    /// Where converted models are persisted.
    #[serde(default)]
    pub storage: StorageConfig,
    /// InferenceService deployment settings.
    #[serde(default)]
    pub serving: ServingConfig,
    /// Logging configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML or JSON file, then apply environment
    /// overrides and validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| FedServeError::InvalidConfig {
            field: path.display().to_string(),
            reason: format!("failed to read config file: {}", e),
        })?;

        let is_yaml = path
            .extension()
            .map_or(false, |e| e == "yaml" || e == "yml");
        let mut config: Self = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| FedServeError::InvalidConfig {
                field: path.display().to_string(),
                reason: format!("failed to parse config: {}", e),
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| FedServeError::InvalidConfig {
                field: path.display().to_string(),
                reason: format!("failed to parse config: {}", e),
            })?
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("FATE_FLOW_HOST") {
            let (host, port) = split_host_port(&host);
            self.fate_flow.host = host;
            if let Some(port) = port {
                self.fate_flow.port = port;
            }
        }
        if let Some(port) = std::env::var("FATE_FLOW_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.fate_flow.port = port;
        }

        let s3 = &mut self.storage.s3;
        if let Ok(endpoint) = std::env::var("MINIO_ENDPOINT") {
            s3.endpoint = endpoint;
        }
        if let Ok(key) = std::env::var("MINIO_ACCESS_KEY") {
            s3.access_key = key;
        }
        if let Ok(key) = std::env::var("MINIO_SECRET_KEY") {
            s3.secret_key = key;
        }
        if let Ok(region) = std::env::var("MINIO_REGION") {
            s3.region = region;
        }
        if let Ok(secure) = std::env::var("MINIO_SECURE") {
            s3.secure = matches!(secure.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Ok(ns) = std::env::var("FEDSERVE_NAMESPACE") {
            self.serving.namespace = Some(ns);
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.fate_flow.port == 0 {
            return Err(FedServeError::InvalidConfig {
                field: "fate_flow.port".to_string(),
                reason: "port must be non-zero".to_string(),
            });
        }

        // Deployers fall back to S3, so only an explicit local backend skips the check.
        if self.storage.kind != Some(StorageKind::LocalFile) && self.storage.s3.bucket.is_empty() {
            return Err(FedServeError::InvalidConfig {
                field: "storage.s3.bucket".to_string(),
                reason: "bucket name is required for S3 storage".to_string(),
            });
        }

        if !matches!(self.serving.protocol_version.as_str(), "v1" | "v2") {
            return Err(FedServeError::InvalidConfig {
                field: "serving.protocol_version".to_string(),
                reason: format!("unsupported protocol version: {}", self.serving.protocol_version),
            });
        }

        Ok(())
    }

    /// Local-only configuration for development and tests.
    pub fn development() -> Self {
        Self {
            storage: StorageConfig {
                kind: Some(StorageKind::LocalFile),
                local_root: PathBuf::from("/tmp/fedserve/models"),
                s3: S3StorageConfig::default(),
            },
            ..Default::default()
        }
    }
}

/// Split `host[:port]` as accepted by `FATE_FLOW_HOST`.
pub fn split_host_port(value: &str) -> (String, Option<u16>) {
    let mut parts = value.splitn(2, ':');
    let host = parts.next().unwrap_or_default().to_string();
    let port = parts.next().and_then(|p| p.parse().ok());
    (host, port)
}

/// FATE Flow connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FateFlowConfig {
    /// Server host name.
    #[serde(default = "default_fate_flow_host")]
    pub host: String,
    /// Server port.
    #[serde(default = "default_fate_flow_port")]
    pub port: u16,
    /// REST API version prefix.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Request timeout.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub timeout: Duration,
}

fn default_fate_flow_host() -> String {
    "fateflow".to_string()
}

fn default_fate_flow_port() -> u16 {
    9380
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for FateFlowConfig {
    fn default() -> Self {
        Self {
            host: default_fate_flow_host(),
            port: default_fate_flow_port(),
            api_version: default_api_version(),
            timeout: default_request_timeout(),
        }
    }
}

impl FateFlowConfig {
    /// Base URL of the REST API, including the version prefix.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/{}", self.host, self.port, self.api_version)
    }
}

/// Storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Plain files on the local filesystem.
    #[serde(rename = "local")]
    LocalFile,
    /// S3-compatible object storage such as MinIO.
    #[serde(alias = "minio")]
    S3,
}

impl FromStr for StorageKind {
    type Err = FedServeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "local_file" | "file" => Ok(StorageKind::LocalFile),
            "s3" | "minio" => Ok(StorageKind::S3),
            other => Err(FedServeError::UnknownStorageType(other.to_string())),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend used by converters and deployers. When unset, converters
    /// write locally and deployers upload to S3.
    #[serde(default)]
    pub kind: Option<StorageKind>,
    /// Root directory for local uploads.
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
    /// S3-compatible storage settings.
    #[serde(default)]
    pub s3: S3StorageConfig,
}

fn default_local_root() -> PathBuf {
    PathBuf::from("/var/lib/fedserve/models")
}

impl StorageConfig {
    /// Backend to use: an explicit request wins over the configured kind,
    /// which wins over the caller's `fallback`.
    pub fn resolve_kind(&self, requested: Option<StorageKind>, fallback: StorageKind) -> StorageKind {
        requested.or(self.kind).unwrap_or(fallback)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: None,
            local_root: default_local_root(),
            s3: S3StorageConfig::default(),
        }
    }
}

/// S3-compatible storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StorageConfig {
    /// Endpoint host (and port), without scheme.
    #[serde(default = "default_s3_endpoint")]
    pub endpoint: String,
    /// Access key ID.
    #[serde(default)]
    pub access_key: String,
    /// Secret access key.
    #[serde(default)]
    pub secret_key: String,
    /// Region name.
    #[serde(default = "default_region")]
    pub region: String,
    /// Bucket receiving converted models.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Use HTTPS.
    #[serde(default)]
    pub secure: bool,
}

fn default_s3_endpoint() -> String {
    "minio-service.kubeflow:9000".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_bucket() -> String {
    "models".to_string()
}

impl Default for S3StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_s3_endpoint(),
            access_key: String::new(),
            secret_key: String::new(),
            region: default_region(),
            bucket: default_bucket(),
            secure: false,
        }
    }
}

impl S3StorageConfig {
    /// Endpoint URL with scheme.
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}", scheme, self.endpoint)
    }
}

/// InferenceService deployment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingConfig {
    /// Target namespace; falls back to the client's default namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Inference protocol for SKLearn predictors (`v1` or `v2`).
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Replace a running service with the same name.
    #[serde(default)]
    pub replace: bool,
    /// Share S3 credentials with the storage initializer.
    #[serde(default = "default_true")]
    pub share_storage_creds: bool,
    /// Service account used by the predictor.
    #[serde(default)]
    pub service_account: Option<String>,
    /// How long `wait` polls for readiness.
    #[serde(with = "humantime_serde", default = "default_wait_timeout")]
    pub wait_timeout: Duration,
}

fn default_protocol_version() -> String {
    "v1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            protocol_version: default_protocol_version(),
            replace: false,
            share_storage_creds: true,
            service_account: None,
            wait_timeout: default_wait_timeout(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level or filter directive.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Enable JSON logging.
    #[serde(default)]
    pub json_logs: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
