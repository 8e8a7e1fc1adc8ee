//! Inspect a trained model

use anyhow::Result;
use clap::Args;
use fedserve::config::EngineConfig;
use fedserve::convert;
use fedserve::TrainedModel;
use serde::Serialize;
use tabled::Tabled;

use super::ModelArgs;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct InspectArgs {
    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Debug, Serialize, Tabled)]
struct ModelRow {
    #[tabled(rename = "Model Type")]
    model_type: String,
    #[tabled(rename = "Component")]
    component_type: String,
    #[tabled(rename = "Framework")]
    framework: String,
    #[tabled(rename = "Converter")]
    converter: String,
    #[tabled(rename = "Fields")]
    fields: String,
}

impl ModelRow {
    fn describe(model: &dyn TrainedModel) -> Self {
        let framework = model.preferred_framework();
        let component = model.component();
        let converter = convert::find_registration(framework, component.component_type())
            .map(|r| r.name.to_string())
            .unwrap_or_else(|_| "-".to_string());
        let mut fields: Vec<&str> = component.field_names().collect();
        fields.sort_unstable();
        Self {
            model_type: model.model_type().to_string(),
            component_type: component.component_type().to_string(),
            framework: framework.to_string(),
            converter,
            fields: fields.join(", "),
        }
    }
}

pub async fn execute(args: InspectArgs, config: &EngineConfig, format: OutputFormat) -> Result<()> {
    let model = args.model.load(config).await?;
    let row = ModelRow::describe(model.as_ref());
    match format {
        OutputFormat::Text => {
            output::print_kv("Model type", &row.model_type);
            output::print_kv("Component", &row.component_type);
            output::print_kv("Framework", &row.framework);
            output::print_kv("Converter", &row.converter);
            output::print_kv("Fields", &row.fields);
            Ok(())
        }
        _ => output::print_table(&[row], format),
    }
}
