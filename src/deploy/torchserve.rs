//! TorchServe model packaging.
//!
//! Produces the two files a TorchServe predictor loads from its storage URI:
//! `model-store/<name>.mar` and `config/config.properties`.

use crate::convert::TorchModule;
use crate::error::{FedServeError, Result};
use crate::storage::StorageObject;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

pub const CONFIG_FILE_DIR: &str = "config";
pub const CONFIG_FILE_NAME: &str = "config.properties";
pub const MODEL_STORE_DIR: &str = "model-store";

const DEFAULT_HANDLER_FILE: &str = "fedserve_handler.py";

// Falls back to `torch.load` so pickled modules serve without scripting.
const DEFAULT_HANDLER: &str = r#"import torch
from ts.torch_handler.base_handler import BaseHandler


class FedServeHandler(BaseHandler):
    def _load_torchscript_model(self, model_pt_path):
        try:
            return torch.jit.load(model_pt_path, map_location=self.device)
        except RuntimeError:
            return torch.load(model_pt_path, map_location=self.device, weights_only=False)
"#;

/// TorchServe worker and batching settings.
///
/// Defaults follow the KServe TorchServe sample configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorchServeOptions {
    /// Handler file or built-in handler name; a pass-through handler is
    /// generated when unset.
    pub handler: Option<String>,
    /// Python file defining the module class. Required for state-dict
    /// checkpoints unwrapped from the federated trainer.
    pub model_file: Option<PathBuf>,
    pub min_workers: u32,
    pub max_workers: u32,
    pub batch_size: u32,
    /// Milliseconds.
    pub max_batch_delay: u64,
    /// Seconds.
    pub response_timeout: u64,
    /// Archiver executable.
    pub archiver: String,
}

impl Default for TorchServeOptions {
    fn default() -> Self {
        Self {
            handler: None,
            model_file: None,
            min_workers: 1,
            max_workers: 5,
            batch_size: 1,
            max_batch_delay: 5000,
            response_timeout: 120,
            archiver: "torch-model-archiver".to_string(),
        }
    }
}

/// Render `config.properties` for a single-model TorchServe instance.
pub fn render_config(
    model_name: &str,
    version: &str,
    mar_name: &str,
    options: &TorchServeOptions,
) -> Result<String> {
    let snapshot = serde_json::json!({
        "name": "startup.cfg",
        "modelCount": 1,
        "models": {
            model_name: {
                version: {
                    "defaultVersion": true,
                    "marName": mar_name,
                    "minWorkers": options.min_workers,
                    "maxWorkers": options.max_workers,
                    "batchSize": options.batch_size,
                    "maxBatchDelay": options.max_batch_delay,
                    "responseTimeout": options.response_timeout,
                }
            }
        }
    });

    Ok(format!(
        "inference_address=http://0.0.0.0:8085\n\
         management_address=http://0.0.0.0:8081\n\
         metrics_address=http://0.0.0.0:8082\n\
         enable_metrics_api=true\n\
         metrics_format=prometheus\n\
         number_of_netty_threads=4\n\
         job_queue_size=10\n\
         service_envelope=kfserving\n\
         model_store=/mnt/models/{}\n\
         model_snapshot={}",
        MODEL_STORE_DIR,
        serde_json::to_string(&snapshot)?
    ))
}

/// Arguments passed to the archiver.
pub fn archiver_args(
    serialized_file: &Path,
    model_name: &str,
    version: &str,
    export_path: &Path,
    handler: &str,
    model_file: Option<&Path>,
) -> Vec<String> {
    let mut args = vec![
        "--serialized-file".to_string(),
        serialized_file.display().to_string(),
        "--model-name".to_string(),
        model_name.to_string(),
        "--export-path".to_string(),
        export_path.display().to_string(),
        "--handler".to_string(),
        handler.to_string(),
        "-v".to_string(),
        version.to_string(),
        "-f".to_string(),
    ];
    if let Some(model_file) = model_file {
        args.push("--model-file".to_string());
        args.push(model_file.display().to_string());
    }
    args
}

/// Files produced by [`generate_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorchServeFiles {
    pub mar_file: PathBuf,
    pub config_file: PathBuf,
}

impl TorchServeFiles {
    /// Upload layout expected by the TorchServe predictor.
    pub fn storage_objects(&self) -> Vec<StorageObject> {
        let mar_name = self
            .mar_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        vec![
            StorageObject::new(
                format!("{}/{}", CONFIG_FILE_DIR, CONFIG_FILE_NAME),
                &self.config_file,
            ),
            StorageObject::new(format!("{}/{}", MODEL_STORE_DIR, mar_name), &self.mar_file),
        ]
    }
}

/// Write the checkpoint, build the `.mar` archive and the config file in
/// `working_dir`.
pub async fn generate_files(
    working_dir: &Path,
    model_name: &str,
    version: &str,
    module: &TorchModule,
    options: &TorchServeOptions,
) -> Result<TorchServeFiles> {
    if module.is_state_dict() && options.model_file.is_none() {
        return Err(FedServeError::InvalidArgument(
            "checkpoint holds a state dict; a model file defining the module class is required".to_string(),
        ));
    }

    let serialized_file = working_dir.join(format!("{}.pt", model_name));
    module.write_to(&serialized_file)?;

    let handler = match &options.handler {
        Some(handler) => handler.clone(),
        None => {
            let path = working_dir.join(DEFAULT_HANDLER_FILE);
            tokio::fs::write(&path, DEFAULT_HANDLER).await?;
            path.display().to_string()
        }
    };

    let args = archiver_args(
        &serialized_file,
        model_name,
        version,
        working_dir,
        &handler,
        options.model_file.as_deref(),
    );
    debug!(archiver = %options.archiver, ?args, "Running model archiver");
    let output = Command::new(&options.archiver)
        .args(&args)
        .output()
        .await
        .map_err(|e| FedServeError::remote(options.archiver.as_str(), e.to_string()))?;
    if !output.status.success() {
        return Err(FedServeError::remote(
            options.archiver.as_str(),
            format!(
                "{} {} exited with {}, command output: {}{}",
                options.archiver,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            ),
        ));
    }

    let mar_name = format!("{}.mar", model_name);
    let mar_file = working_dir.join(&mar_name);
    let config_file = working_dir.join(CONFIG_FILE_NAME);
    tokio::fs::write(&config_file, render_config(model_name, version, &mar_name, options)?).await?;

    info!(mar = %mar_file.display(), config = %config_file.display(), "Generated TorchServe files");
    Ok(TorchServeFiles {
        mar_file,
        config_file,
    })
}
