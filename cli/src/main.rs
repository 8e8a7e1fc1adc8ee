//! fedserve CLI - convert federated models and serve them on KServe

use anyhow::Result;
use clap::{Parser, Subcommand};
use fedserve::FedServeError;
use std::path::PathBuf;

mod commands;
mod config;
mod output;

use commands::{convert, deploy, inspect, service};

/// fedserve - Federated model conversion and serving
#[derive(Parser)]
#[command(name = "fedserve")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path (YAML or JSON)
    #[arg(short, long, global = true, env = "FEDSERVE_CONFIG")]
    config: Option<PathBuf>,

    /// Output format (text, json, yaml)
    #[arg(short, long, global = true, default_value = "text")]
    output: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the main component of a trained model
    #[command(alias = "i")]
    Inspect(inspect::InspectArgs),

    /// Convert a trained model and save it locally
    #[command(alias = "c")]
    Convert(convert::ConvertArgs),

    /// Convert a trained model and deploy it as an InferenceService
    #[command(alias = "d")]
    Deploy(deploy::DeployArgs),

    /// Show the state of a deployed service
    Status(service::StatusArgs),

    /// Delete a deployed service
    #[command(alias = "rm")]
    Destroy(service::DestroyArgs),

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        console::set_colors_enabled(false);
    }

    if let Commands::Completion { shell } = cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        clap_complete::generate(shell, &mut cmd, "fedserve", &mut std::io::stdout());
        return Ok(());
    }

    let mut cfg = match config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => exit_with(e, cli.verbose),
    };
    if cli.verbose {
        cfg.observability.log_level = "debug".to_string();
    }
    fedserve::observability::init(&cfg.observability)?;
    tracing::debug!(config = ?cli.config, storage = ?cfg.storage.kind, "Configuration loaded");

    let result = match cli.command {
        Commands::Inspect(args) => inspect::execute(args, &cfg, cli.output).await,
        Commands::Convert(args) => convert::execute(args, &cfg, cli.output).await,
        Commands::Deploy(args) => deploy::execute(args, &cfg, cli.output).await,
        Commands::Status(args) => service::status(args, &cfg, cli.output).await,
        Commands::Destroy(args) => service::destroy(args, &cfg).await,
        Commands::Completion { .. } => Ok(()),
    };

    if let Err(e) = result {
        exit_with(e, cli.verbose);
    }

    Ok(())
}

fn exit_with(e: anyhow::Error, verbose: bool) -> ! {
    if verbose {
        output::error(format!("{:?}", e));
    } else {
        output::error(&e);
    }
    let configuration = e
        .chain()
        .filter_map(|cause| cause.downcast_ref::<FedServeError>())
        .any(FedServeError::is_configuration);
    if configuration {
        output::info("Check the command arguments and configuration file");
        std::process::exit(2);
    }
    std::process::exit(1);
}
