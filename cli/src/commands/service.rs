//! Status and removal of deployed services

use anyhow::Result;
use clap::Args;
use fedserve::config::EngineConfig;
use fedserve::deploy::{self, InferenceServiceApi};
use fedserve::{InferenceService, ServiceStatus};
use serde::Serialize;
use std::time::Duration;
use tabled::Tabled;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct StatusArgs {
    /// InferenceService name
    #[arg(short = 's', long)]
    service_name: String,

    /// Kubernetes namespace
    #[arg(short, long, env = "FEDSERVE_NAMESPACE")]
    namespace: Option<String>,

    /// Wait up to this many seconds for the service to become ready
    #[arg(short, long)]
    wait: Option<u64>,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// InferenceService name
    #[arg(short = 's', long)]
    service_name: String,

    /// Kubernetes namespace
    #[arg(short, long, env = "FEDSERVE_NAMESPACE")]
    namespace: Option<String>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct StatusRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Ready")]
    ready: String,
    #[tabled(rename = "URL")]
    url: String,
    #[tabled(rename = "UUID")]
    uuid: String,
}

impl StatusRow {
    fn from_status(name: &str, status: &ServiceStatus) -> Self {
        match status {
            ServiceStatus::Found(isvc) => Self::from_service(name, isvc),
            ServiceStatus::Absent => Self {
                name: name.to_string(),
                ready: "Absent".to_string(),
                url: "-".to_string(),
                uuid: "-".to_string(),
            },
        }
    }

    fn from_service(name: &str, isvc: &InferenceService) -> Self {
        Self {
            name: name.to_string(),
            ready: if isvc.is_ready() { "Ready" } else { "Pending" }.to_string(),
            url: isvc.url().unwrap_or("-").to_string(),
            uuid: isvc
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(deploy::kserve::ANNOTATION_UUID))
                .cloned()
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

pub async fn status(args: StatusArgs, config: &EngineConfig, format: OutputFormat) -> Result<()> {
    let api = deploy::service_api(args.namespace, config).await?;
    let status = match args.wait {
        Some(secs) => {
            let spinner = output::create_spinner(format!("Waiting for {} to become ready", args.service_name));
            let ready = deploy::wait_ready(&api, &args.service_name, Duration::from_secs(secs)).await;
            spinner.finish_and_clear();
            ServiceStatus::Found(Box::new(ready?))
        }
        None => api.get(&args.service_name).await?,
    };

    let row = StatusRow::from_status(&args.service_name, &status);
    match format {
        OutputFormat::Text => {
            output::print_kv("Name", &row.name);
            output::print_kv("Ready", output::status_indicator(&row.ready));
            output::print_kv("URL", &row.url);
            output::print_kv("UUID", &row.uuid);
            Ok(())
        }
        _ => output::print_table(&[row], format),
    }
}

pub async fn destroy(args: DestroyArgs, config: &EngineConfig) -> Result<()> {
    if !args.yes && !output::confirm(&format!("Delete InferenceService {}?", args.service_name)) {
        output::info("Aborted");
        return Ok(());
    }

    let api = deploy::service_api(args.namespace, config).await?;
    if deploy::destroy_service(&api, &args.service_name).await? {
        output::success(format!("InferenceService {} deleted", args.service_name));
    } else {
        output::warning(format!("InferenceService {} not found", args.service_name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedserve::deploy::crd::{Condition, InferenceServiceStatus};
    use fedserve::deploy::InferenceServiceSpec;
    use std::collections::BTreeMap;

    #[test]
    fn test_absent_row() {
        let row = StatusRow::from_status("svc", &ServiceStatus::Absent);
        assert_eq!(row.ready, "Absent");
        assert_eq!(row.url, "-");
    }

    #[test]
    fn test_ready_row() {
        let mut isvc = InferenceService::new("svc", InferenceServiceSpec::default());
        isvc.metadata.annotations = Some(BTreeMap::from([(
            deploy::kserve::ANNOTATION_UUID.to_string(),
            "abc".to_string(),
        )]));
        isvc.status = Some(InferenceServiceStatus {
            url: Some("http://svc.example.com".to_string()),
            conditions: vec![Condition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }],
        });

        let row = StatusRow::from_status("svc", &ServiceStatus::Found(Box::new(isvc)));
        assert_eq!(row.ready, "Ready");
        assert_eq!(row.url, "http://svc.example.com");
        assert_eq!(row.uuid, "abc");
    }
}
