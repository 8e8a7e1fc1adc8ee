//! FATE Flow client.
//!
//! Fetches a model archive by version through the FATE Flow REST API and
//! unpacks it into a temporary directory.

use crate::config::FateFlowConfig;
use crate::error::{FedServeError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Role used when the caller does not name one.
pub const DEFAULT_ROLE: &str = "guest";

/// Coordinates of a model held by FATE Flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub model_version: String,
    pub role: String,
    pub party_id: Option<String>,
    pub model_id: Option<String>,
}

impl FetchRequest {
    pub fn new(model_version: impl Into<String>) -> Self {
        Self {
            model_version: model_version.into(),
            role: DEFAULT_ROLE.to_string(),
            party_id: None,
            model_id: None,
        }
    }
}

/// A locally available archive.
///
/// When the archive was extracted into a temporary directory, the directory
/// lives as long as this value.
#[derive(Debug)]
pub struct FetchedArchive {
    path: PathBuf,
    _workdir: Option<TempDir>,
}

impl FetchedArchive {
    /// Archive owning the temporary directory it was extracted into.
    pub fn temporary(workdir: TempDir) -> Self {
        Self {
            path: workdir.path().to_path_buf(),
            _workdir: Some(workdir),
        }
    }

    /// Archive at a caller-managed path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _workdir: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Source of archives that are not yet on local disk.
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedArchive>;
}

/// Envelope of every FATE Flow JSON response.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowResponse {
    pub retcode: i64,
    #[serde(default)]
    pub retmsg: String,
    #[serde(default)]
    pub data: Value,
}

impl FlowResponse {
    fn into_result(self) -> Result<Value> {
        if self.retcode != 0 {
            return Err(FedServeError::remote("FATE Flow", self.retmsg));
        }
        Ok(self.data)
    }
}

/// REST client for FATE Flow.
#[derive(Debug, Clone)]
pub struct FlowClient {
    http: reqwest::Client,
    base_url: String,
}

impl FlowClient {
    pub fn new(config: &FateFlowConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve `(party_id, model_id)` for a version and role.
    pub async fn query_model(&self, model_version: &str, role: &str) -> Result<(String, String)> {
        let url = format!("{}/model/query", self.base_url);
        let body = serde_json::json!({ "model_version": model_version, "role": role });
        debug!(%url, model_version, role, "Querying model info");

        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        model_coordinates(envelope_data(status, &bytes)?)
    }

    /// Download the exported archive as raw zip bytes.
    pub async fn export_model(
        &self,
        model_version: &str,
        role: &str,
        party_id: &str,
        model_id: &str,
    ) -> Result<bytes::Bytes> {
        let url = format!("{}/model/export", self.base_url);
        let body = serde_json::json!({
            "role": role,
            "party_id": party_id,
            "model_id": model_id,
            "model_version": model_version,
        });
        debug!(%url, model_version, role, party_id, model_id, "Exporting model");

        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        export_payload(status, bytes)
    }
}

#[async_trait]
impl ModelFetcher for FlowClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedArchive> {
        let (party_id, model_id) = match (&request.party_id, &request.model_id) {
            (Some(party_id), Some(model_id)) => (party_id.clone(), model_id.clone()),
            _ => {
                let (party_id, model_id) =
                    self.query_model(&request.model_version, &request.role).await?;
                (
                    request.party_id.clone().unwrap_or(party_id),
                    request.model_id.clone().unwrap_or(model_id),
                )
            }
        };

        let bytes = self
            .export_model(&request.model_version, &request.role, &party_id, &model_id)
            .await?;
        let archive = extract_archive(&bytes)?;
        info!(
            model_version = %request.model_version,
            %party_id,
            %model_id,
            path = %archive.path().display(),
            "Fetched model archive"
        );
        Ok(archive)
    }
}

/// Data of a JSON reply. An error envelope wins over the HTTP status so the
/// remote message is kept.
fn envelope_data(status: StatusCode, body: &[u8]) -> Result<Value> {
    match serde_json::from_slice::<FlowResponse>(body) {
        Ok(response) => {
            let data = response.into_result()?;
            check_status(status)?;
            Ok(data)
        }
        Err(e) => {
            check_status(status)?;
            Err(FedServeError::Decode(format!("FATE Flow response: {}", e)))
        }
    }
}

/// Body of an export reply: a zip stream, or a JSON envelope on failure.
fn export_payload(status: StatusCode, body: bytes::Bytes) -> Result<bytes::Bytes> {
    if let Ok(response) = serde_json::from_slice::<FlowResponse>(&body) {
        response.into_result()?;
    }
    check_status(status)?;
    Ok(body)
}

fn check_status(status: StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(FedServeError::remote(
            "FATE Flow",
            format!("request failed with HTTP {}", status),
        ))
    }
}

/// Pull `f_party_id` and `f_model_id` out of the first query result.
fn model_coordinates(data: Value) -> Result<(String, String)> {
    let first = data
        .as_array()
        .and_then(|rows| rows.first())
        .ok_or_else(|| FedServeError::remote("FATE Flow", "model query returned no results"))?;

    let field = |name: &str| -> Result<String> {
        match first.get(name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(FedServeError::remote(
                "FATE Flow",
                format!("model query result is missing {}", name),
            )),
        }
    };
    Ok((field("f_party_id")?, field("f_model_id")?))
}

/// Unpack a zip archive into a fresh temporary directory.
pub fn extract_archive(bytes: &[u8]) -> Result<FetchedArchive> {
    let workdir = tempfile::Builder::new().prefix("fedserve-model-").tempdir()?;
    let mut zip = zip::ZipArchive::new(Cursor::new(bytes))?;
    zip.extract(workdir.path())?;
    Ok(FetchedArchive::temporary(workdir))
}
