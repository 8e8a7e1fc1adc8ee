//! Convert and deploy a trained model

use anyhow::{Context, Result};
use clap::Args;
use fedserve::config::{EngineConfig, StorageKind};
use fedserve::convert::ConverterOptions;
use fedserve::deploy::{DeployerOptions, TorchServeOptions};
use fedserve::Engine;
use std::path::PathBuf;
use std::time::Duration;

use super::ModelArgs;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct DeployArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// InferenceService name
    #[arg(short = 's', long)]
    service_name: String,

    /// Service version; defaults to 1.0
    #[arg(long)]
    service_version: Option<String>,

    /// Kubernetes namespace
    #[arg(short, long, env = "FEDSERVE_NAMESPACE")]
    namespace: Option<String>,

    /// Deployer type (kfserving, kserve)
    #[arg(long)]
    deployer_type: Option<String>,

    /// Storage for model files (local, s3)
    #[arg(long)]
    storage: Option<StorageKind>,

    /// Use model files already at this URI instead of uploading
    #[arg(long)]
    storage_uri: Option<String>,

    /// SKLearn inference protocol (v1, v2)
    #[arg(long)]
    protocol_version: Option<String>,

    /// Replace a running service with the same name
    #[arg(long)]
    replace: bool,

    /// Service account for the predictor
    #[arg(long)]
    service_account: Option<String>,

    /// Transformer image placed in front of the predictor
    #[arg(long)]
    image_transformer: Option<String>,

    /// Python file defining the module class of a trainer checkpoint
    #[arg(long)]
    model_file: Option<PathBuf>,

    /// Wait for the service to become ready
    #[arg(short, long)]
    wait: bool,

    /// Readiness timeout in seconds; defaults to the configured wait timeout
    #[arg(long)]
    timeout: Option<u64>,
}

impl DeployArgs {
    fn deployer_options(&self) -> DeployerOptions {
        DeployerOptions {
            deployer_type: self.deployer_type.clone(),
            namespace: self.namespace.clone(),
            storage: self.storage,
            storage_uri: self.storage_uri.clone(),
            protocol_version: self.protocol_version.clone(),
            replace: self.replace.then_some(true),
            service_account: self.service_account.clone(),
            image_transformer: self.image_transformer.clone(),
            torchserve: TorchServeOptions {
                model_file: self.model_file.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

pub async fn execute(args: DeployArgs, config: &EngineConfig, format: OutputFormat) -> Result<()> {
    let model = args.model.load(config).await?;
    let mut engine = Engine::new(
        args.service_name.clone(),
        args.service_version.clone(),
        model,
        ConverterOptions::default(),
        args.deployer_options(),
        config.clone(),
    );

    let mut isvc = engine.run().await.context("Deployment failed")?;
    output::success(format!(
        "InferenceService {} (version {}) submitted",
        engine.service_name(),
        engine.version()
    ));

    if args.wait {
        let timeout = args
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(config.serving.wait_timeout);
        let deployer = engine
            .deployer()
            .context("Deployer was not initialized")?;
        let spinner = output::create_spinner(format!("Waiting for {} to become ready", engine.service_name()));
        let ready = deployer.wait(timeout).await;
        spinner.finish_and_clear();
        isvc = ready?;
        output::success(format!(
            "Service ready at {}",
            isvc.url().unwrap_or("<no url reported>")
        ));
    }

    if format != OutputFormat::Text {
        output::print_single(&isvc, format)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        deploy: DeployArgs,
    }

    #[test]
    fn test_replace_flag_maps_to_option() {
        let harness = Harness::parse_from(["test", "-p", "/m", "-s", "svc", "--storage", "s3"]);
        let options = harness.deploy.deployer_options();
        assert_eq!(options.replace, None);
        assert_eq!(options.storage, Some(StorageKind::S3));

        let harness = Harness::parse_from(["test", "-p", "/m", "-s", "svc", "--replace"]);
        assert_eq!(harness.deploy.deployer_options().replace, Some(true));
    }
}
