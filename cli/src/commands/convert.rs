//! Convert a trained model and save it locally

use anyhow::{Context, Result};
use clap::Args;
use fedserve::config::{EngineConfig, StorageKind};
use fedserve::convert::{self, ConverterOptions};
use serde::Serialize;
use std::path::PathBuf;

use super::ModelArgs;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct ConvertArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// File to write the converted model to
    #[arg(short, long)]
    dest: PathBuf,
}

#[derive(Debug, Serialize)]
struct ConvertReport {
    framework: String,
    component_type: String,
    path: PathBuf,
}

pub async fn execute(args: ConvertArgs, config: &EngineConfig, format: OutputFormat) -> Result<()> {
    let model = args.model.load(config).await?;
    let options = ConverterOptions {
        storage: Some(StorageKind::LocalFile),
        sub_path: None,
    };
    let mut converter = convert::get_converter(model.clone(), options, config).await?;
    let converted = converter.convert().context("Conversion failed")?;

    if let Some(parent) = args.dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let path = converter.save_model(&args.dest).await?;

    let report = ConvertReport {
        framework: converted.framework().to_string(),
        component_type: model.component().component_type().to_string(),
        path,
    };
    match format {
        OutputFormat::Text => {
            output::success(format!(
                "Converted {} to {} model at {}",
                report.component_type,
                report.framework,
                report.path.display()
            ));
            Ok(())
        }
        _ => output::print_single(&report, format),
    }
}
